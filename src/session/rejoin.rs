//! RejoinCoordinator - Wiederaufnahme nach einem Abbruch
//!
//! Setzt den Signaling Record zurück und prüft danach in einer begrenzten
//! Schleife, ob beide Sinks ihre aktuellen Streams abspielen. Veraltete
//! Sinks werden mit `force` neu gebunden; spielt ein Sink danach wieder,
//! erfährt das der Aufrufer über `on_recovered`. Nach `max_checks` ist Schluss.

use crate::config::RejoinConfig;
use crate::media::{
    is_sink_healthy, BindOptions, BindOutcome, MediaBinder, MediaStream, RenderSink,
};
use crate::signaling::{SignalingChannel, SignalingError};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::task::JoinHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerificationOutcome {
    /// Beide Sinks spielen ihren aktuellen Stream
    Healthy { checks: u32 },
    /// Budget aufgebraucht, keine weiteren automatischen Versuche
    Exhausted { checks: u32 },
    /// Session existiert nicht mehr
    Cancelled { checks: u32 },
}

/// Ein Sink und der Stream, den er abspielen soll
#[derive(Clone)]
pub struct SinkTarget {
    pub sink: Arc<dyn RenderSink>,
    pub stream: Option<MediaStream>,
}

impl SinkTarget {
    fn is_healthy(&self) -> bool {
        self.stream
            .as_ref()
            .map(|stream| is_sink_healthy(self.sink.as_ref(), stream))
            .unwrap_or(false)
    }
}

#[derive(Clone)]
pub struct SinkTargets {
    pub local: SinkTarget,
    pub remote: SinkTarget,
}

// ============================================================================
// REJOIN COORDINATOR
// ============================================================================

pub struct RejoinCoordinator {
    config: RejoinConfig,
    binder: MediaBinder,
    verification: Mutex<Option<JoinHandle<()>>>,
}

impl RejoinCoordinator {
    pub fn new(config: RejoinConfig, binder: MediaBinder) -> Self {
        Self {
            config,
            binder,
            verification: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &RejoinConfig {
        &self.config
    }

    /// Leert Offer, Answer und Candidates für einen neuen Versuch
    pub async fn reset_signaling(
        &self,
        signaling: &dyn SignalingChannel,
        call_id: &str,
    ) -> Result<(), SignalingError> {
        tracing::info!("Resetting signaling for call {}", call_id);
        signaling.reset_call_record(call_id).await
    }

    /// Führt die Verifikation direkt aus
    pub async fn verify<T, R>(&self, targets: T, on_recovered: R) -> VerificationOutcome
    where
        T: Fn() -> Option<SinkTargets>,
        R: Fn(&str),
    {
        verify_sinks(&self.config, &self.binder, targets, on_recovered).await
    }

    /// Startet die Verifikation im Hintergrund; ersetzt eine laufende
    pub fn spawn_verification<T, R, F>(&self, targets: T, on_recovered: R, on_done: F)
    where
        T: Fn() -> Option<SinkTargets> + Send + 'static,
        R: Fn(&str) + Send + 'static,
        F: FnOnce(VerificationOutcome) + Send + 'static,
    {
        let config = self.config.clone();
        let binder = self.binder.clone();
        let handle = tokio::spawn(async move {
            let outcome = verify_sinks(&config, &binder, targets, on_recovered).await;
            on_done(outcome);
        });

        if let Some(old) = self.verification.lock().replace(handle) {
            old.abort();
        }
    }

    pub fn cancel(&self) {
        if let Some(handle) = self.verification.lock().take() {
            handle.abort();
            tracing::debug!("Sink verification cancelled");
        }
    }
}

impl Drop for RejoinCoordinator {
    fn drop(&mut self) {
        self.cancel();
    }
}

async fn verify_sinks<T, R>(
    config: &RejoinConfig,
    binder: &MediaBinder,
    targets: T,
    on_recovered: R,
) -> VerificationOutcome
where
    T: Fn() -> Option<SinkTargets>,
    R: Fn(&str),
{
    for check in 1..=config.max_checks {
        tokio::time::sleep(config.check_interval()).await;

        let Some(current) = targets() else {
            tracing::debug!("Sink verification stopped, session gone");
            return VerificationOutcome::Cancelled { checks: check - 1 };
        };

        let local_ok = current.local.is_healthy();
        let remote_ok = current.remote.is_healthy();
        if local_ok && remote_ok {
            tracing::info!("Sinks healthy after {} check(s)", check);
            return VerificationOutcome::Healthy { checks: check };
        }

        tracing::debug!(
            "Sink check {}/{}: local healthy={}, remote healthy={}",
            check,
            config.max_checks,
            local_ok,
            remote_ok
        );

        for (target, healthy) in [(&current.local, local_ok), (&current.remote, remote_ok)] {
            if healthy {
                continue;
            }
            let Some(stream) = &target.stream else {
                continue;
            };
            let outcome = binder.bind(&target.sink, stream, BindOptions::forced()).await;
            if outcome == BindOutcome::Playing {
                tracing::info!("Sink {} playing again after forced re-bind", target.sink.id());
                on_recovered(target.sink.id());
            }
        }
    }

    tracing::warn!(
        "Sink verification gave up after {} checks",
        config.max_checks
    );
    VerificationOutcome::Exhausted {
        checks: config.max_checks,
    }
}

// ============================================================================
// TESTS
// ============================================================================
