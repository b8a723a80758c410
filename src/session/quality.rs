//! QualityMonitor - Verbindungsqualität und Gesprächsdauer
//!
//! Die Einstufung ist eine geordnete Regelkette (erste passende Regel gewinnt).
//! Der Monitor tastet nur ab; woher die Eingaben kommen, entscheidet der Aufrufer.

use crate::config::QualityConfig;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval, interval_at, Instant, MissedTickBehavior};

const DURATION_TICK: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionQuality {
    Excellent,
    Good,
    Poor,
    Bad,
    Disconnected,
}

/// Momentaufnahme für die Einstufung
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QualityInputs {
    pub has_session: bool,
    pub has_local_stream: bool,
    pub has_remote_stream: bool,
    pub local_playing: bool,
    pub remote_playing: bool,
    /// Ein Sink hat nach dem Retry weiter nicht abgespielt
    pub degraded: bool,
}

pub fn classify(inputs: &QualityInputs) -> ConnectionQuality {
    if !inputs.has_session {
        return ConnectionQuality::Disconnected;
    }

    match (inputs.has_local_stream, inputs.has_remote_stream) {
        (true, true) if inputs.local_playing && inputs.remote_playing && !inputs.degraded => {
            ConnectionQuality::Excellent
        }
        (true, true) => ConnectionQuality::Good,
        (true, false) | (false, true) => ConnectionQuality::Poor,
        (false, false) => ConnectionQuality::Bad,
    }
}

/// `MM:SS`
pub fn format_duration(secs: u64) -> String {
    format!("{:02}:{:02}", secs / 60, secs % 60)
}

// ============================================================================
// QUALITY MONITOR
// ============================================================================

pub struct QualityMonitor {
    config: QualityConfig,
    sampler: Mutex<Option<JoinHandle<()>>>,
    ticker: Mutex<Option<JoinHandle<()>>>,
    degraded_sinks: Mutex<HashSet<String>>,
}

impl QualityMonitor {
    pub fn new(config: QualityConfig) -> Self {
        Self {
            config,
            sampler: Mutex::new(None),
            ticker: Mutex::new(None),
            degraded_sinks: Mutex::new(HashSet::new()),
        }
    }

    /// Startet die periodische Einstufung; ersetzt einen laufenden Sampler
    pub fn start_sampling<P, F>(&self, inputs: P, on_sample: F)
    where
        P: Fn() -> QualityInputs + Send + 'static,
        F: Fn(ConnectionQuality) + Send + 'static,
    {
        let period = self.config.sample_interval();
        let handle = tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                on_sample(classify(&inputs()));
            }
        });

        if let Some(old) = self.sampler.lock().replace(handle) {
            old.abort();
        }
        tracing::debug!("Quality sampling started ({:?})", period);
    }

    /// Sekundenzähler ab jetzt; `on_tick` bekommt die verstrichenen Sekunden
    pub fn start_duration<F>(&self, on_tick: F)
    where
        F: Fn(u64) + Send + 'static,
    {
        let handle = tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + DURATION_TICK, DURATION_TICK);
            let mut elapsed = 0u64;
            loop {
                ticker.tick().await;
                elapsed += 1;
                on_tick(elapsed);
            }
        });

        if let Some(old) = self.ticker.lock().replace(handle) {
            old.abort();
        }
    }

    pub fn is_running(&self) -> bool {
        self.sampler.lock().is_some() || self.ticker.lock().is_some()
    }

    /// Stoppt Sampler und Dauer-Zähler
    pub fn stop(&self) {
        let sampler = self.sampler.lock().take();
        let ticker = self.ticker.lock().take();
        if sampler.is_some() || ticker.is_some() {
            tracing::debug!("Quality monitor stopped");
        }
        for handle in sampler.into_iter().chain(ticker) {
            handle.abort();
        }
        self.degraded_sinks.lock().clear();
    }

    pub fn note_degraded(&self, sink_id: &str) {
        tracing::warn!("Sink {} degraded", sink_id);
        self.degraded_sinks.lock().insert(sink_id.to_string());
    }

    pub fn clear_degraded(&self, sink_id: &str) {
        self.degraded_sinks.lock().remove(sink_id);
    }

    pub fn is_degraded(&self) -> bool {
        !self.degraded_sinks.lock().is_empty()
    }
}

impl Drop for QualityMonitor {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for QualityMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QualityMonitor")
            .field("config", &self.config)
            .field("running", &self.is_running())
            .finish()
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Arc;

    fn connected() -> QualityInputs {
        QualityInputs {
            has_session: true,
            has_local_stream: true,
            has_remote_stream: true,
            local_playing: true,
            remote_playing: true,
            degraded: false,
        }
    }

    #[test]
    fn test_classification_order() {
        assert_eq!(classify(&QualityInputs::default()), ConnectionQuality::Disconnected);
        assert_eq!(classify(&connected()), ConnectionQuality::Excellent);

        let paused = QualityInputs {
            remote_playing: false,
            ..connected()
        };
        assert_eq!(classify(&paused), ConnectionQuality::Good);

        let degraded = QualityInputs {
            degraded: true,
            ..connected()
        };
        assert_eq!(classify(&degraded), ConnectionQuality::Good);

        let one_sided = QualityInputs {
            has_remote_stream: false,
            remote_playing: false,
            ..connected()
        };
        assert_eq!(classify(&one_sided), ConnectionQuality::Poor);

        let empty = QualityInputs {
            has_session: true,
            ..QualityInputs::default()
        };
        assert_eq!(classify(&empty), ConnectionQuality::Bad);
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(0), "00:00");
        assert_eq!(format_duration(59), "00:59");
        assert_eq!(format_duration(61), "01:01");
        assert_eq!(format_duration(3600), "60:00");
    }

    #[tokio::test(start_paused = true)]
    async fn test_duration_ticks_every_second_until_stopped() {
        let monitor = QualityMonitor::new(QualityConfig::default());
        let seconds = Arc::new(AtomicU64::new(0));
        let seen = Arc::clone(&seconds);
        monitor.start_duration(move |secs| seen.store(secs, Ordering::SeqCst));

        tokio::time::sleep(Duration::from_millis(3500)).await;
        assert_eq!(seconds.load(Ordering::SeqCst), 3);

        monitor.stop();
        assert!(!monitor.is_running());
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(seconds.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sampling_uses_configured_interval() {
        let monitor = QualityMonitor::new(QualityConfig {
            sample_interval_ms: 2000,
        });
        let samples = Arc::new(AtomicU64::new(0));
        let count = Arc::clone(&samples);
        monitor.start_sampling(connected, move |quality| {
            assert_eq!(quality, ConnectionQuality::Excellent);
            count.fetch_add(1, Ordering::SeqCst);
        });

        // Erster Tick sofort, dann alle 2s
        tokio::time::sleep(Duration::from_millis(4500)).await;
        assert_eq!(samples.load(Ordering::SeqCst), 3);
        monitor.stop();
    }

    #[test]
    fn test_degraded_sinks_are_tracked() {
        let monitor = QualityMonitor::new(QualityConfig::default());
        monitor.note_degraded("remote");
        assert!(monitor.is_degraded());
        monitor.clear_degraded("remote");
        assert!(!monitor.is_degraded());
    }
}
