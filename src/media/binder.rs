//! MediaBinder - Streams an Render Sinks binden
//!
//! Ablauf eines `bind`:
//! 1. Gleicher Stream und kein `force` → nichts tun
//! 2. Debounce: nur die letzte Anfrage pro Sink innerhalb des Fensters gewinnt
//! 3. Pause, Detach, kurz warten, Attach, Play
//! 4. Playback-Fehler: "interrupted" ist harmlos, alles andere genau ein Retry

use super::stream::MediaStream;
use crate::config::BinderConfig;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PlaybackError {
    /// Playback wurde durch eine neuere Lade-Anfrage abgebrochen
    #[error("Playback interrupted by a new load request")]
    Interrupted,

    #[error("Playback failed: {0}")]
    Failed(String),
}

impl PlaybackError {
    pub fn is_benign(&self) -> bool {
        matches!(self, PlaybackError::Interrupted)
    }
}

// ============================================================================
// RENDER SINK
// ============================================================================

/// Abstraktes Ausgabeziel (Video-Element, Audio-Ausgang, ...)
#[async_trait]
pub trait RenderSink: Send + Sync {
    /// Stabile ID, Debounce-Schlüssel
    fn id(&self) -> &str;

    fn attach(&self, stream: MediaStream);

    fn detach(&self);

    fn current_stream(&self) -> Option<MediaStream>;

    fn is_playing(&self) -> bool;

    fn pause(&self);

    /// Startet Playback des aktuell gebundenen Streams
    async fn play(&self) -> Result<(), PlaybackError>;
}

/// Sink spielt genau diesen Stream ab
pub fn is_sink_healthy(sink: &dyn RenderSink, stream: &MediaStream) -> bool {
    sink.is_playing()
        && sink
            .current_stream()
            .map(|current| current.same_as(stream))
            .unwrap_or(false)
}

// ============================================================================
// BIND OPTIONS / OUTCOME
// ============================================================================

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BindOptions {
    pub force: bool,
}

impl BindOptions {
    pub fn forced() -> Self {
        Self { force: true }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BindOutcome {
    /// Sink hatte bereits diesen Stream
    Unchanged,
    Playing,
    /// Von einer neueren Anfrage für denselben Sink ersetzt
    Superseded,
    /// Harmloser Abbruch, kein Retry
    Interrupted,
    /// Retry ebenfalls fehlgeschlagen
    Degraded(PlaybackError),
}

type DegradedHook = Arc<dyn Fn(&str, &PlaybackError) + Send + Sync>;

// ============================================================================
// MEDIA BINDER
// ============================================================================

struct BinderInner {
    config: BinderConfig,
    /// Letzte Anfrage pro Sink
    generations: Mutex<HashMap<String, u64>>,
    on_degraded: Option<DegradedHook>,
}

#[derive(Clone)]
pub struct MediaBinder {
    inner: Arc<BinderInner>,
}

impl MediaBinder {
    pub fn new(config: BinderConfig) -> Self {
        Self {
            inner: Arc::new(BinderInner {
                config,
                generations: Mutex::new(HashMap::new()),
                on_degraded: None,
            }),
        }
    }

    /// Registriert den Empfänger für Degradations-Signale
    pub fn with_degraded_hook<F>(config: BinderConfig, hook: F) -> Self
    where
        F: Fn(&str, &PlaybackError) + Send + Sync + 'static,
    {
        Self {
            inner: Arc::new(BinderInner {
                config,
                generations: Mutex::new(HashMap::new()),
                on_degraded: Some(Arc::new(hook)),
            }),
        }
    }

    /// Bindet `stream` an `sink`
    pub async fn bind(
        &self,
        sink: &Arc<dyn RenderSink>,
        stream: &MediaStream,
        options: BindOptions,
    ) -> BindOutcome {
        if !options.force && Self::carries(sink.as_ref(), stream) {
            tracing::trace!("Sink {} already carries stream {}", sink.id(), stream.id());
            return BindOutcome::Unchanged;
        }

        let generation = self.next_generation(sink.id());

        let debounce = self.inner.config.debounce();
        if !debounce.is_zero() {
            tokio::time::sleep(debounce).await;
        }
        if self.is_superseded(sink.id(), generation) {
            tracing::debug!("Bind request for sink {} superseded", sink.id());
            return BindOutcome::Superseded;
        }

        if sink.is_playing() {
            sink.pause();
        }
        sink.detach();

        let settle = self.inner.config.settle();
        if !settle.is_zero() {
            tokio::time::sleep(settle).await;
        }
        if self.is_superseded(sink.id(), generation) {
            tracing::debug!("Bind request for sink {} superseded while settling", sink.id());
            return BindOutcome::Superseded;
        }

        sink.attach(stream.clone());
        tracing::debug!("Attached stream {} to sink {}", stream.id(), sink.id());

        match sink.play().await {
            Ok(()) => BindOutcome::Playing,
            Err(e) if e.is_benign() => {
                tracing::debug!("Playback on sink {} interrupted, not retrying", sink.id());
                BindOutcome::Interrupted
            }
            Err(e) => {
                tracing::warn!("Playback on sink {} failed: {}, retrying once", sink.id(), e);
                self.retry_play(sink, generation).await
            }
        }
    }

    /// Löst den Stream vom Sink, ohne ihn zu stoppen
    pub fn unbind(&self, sink: &Arc<dyn RenderSink>) {
        // Offene Anfragen für diesen Sink verwerfen
        self.next_generation(sink.id());

        if sink.is_playing() {
            sink.pause();
        }
        sink.detach();
        tracing::debug!("Unbound sink {}", sink.id());
    }

    async fn retry_play(&self, sink: &Arc<dyn RenderSink>, generation: u64) -> BindOutcome {
        tokio::time::sleep(self.inner.config.retry_backoff()).await;

        if self.is_superseded(sink.id(), generation) {
            return BindOutcome::Superseded;
        }

        match sink.play().await {
            Ok(()) => {
                tracing::info!("Playback on sink {} recovered after retry", sink.id());
                BindOutcome::Playing
            }
            Err(e) if e.is_benign() => BindOutcome::Interrupted,
            Err(e) => {
                tracing::error!("Playback on sink {} failed after retry: {}", sink.id(), e);
                if let Some(hook) = &self.inner.on_degraded {
                    hook(sink.id(), &e);
                }
                BindOutcome::Degraded(e)
            }
        }
    }

    fn carries(sink: &dyn RenderSink, stream: &MediaStream) -> bool {
        sink.current_stream()
            .map(|current| current.same_as(stream))
            .unwrap_or(false)
    }

    fn next_generation(&self, sink_id: &str) -> u64 {
        let mut generations = self.inner.generations.lock();
        let entry = generations.entry(sink_id.to_string()).or_insert(0);
        *entry += 1;
        *entry
    }

    fn is_superseded(&self, sink_id: &str, generation: u64) -> bool {
        self.inner
            .generations
            .lock()
            .get(sink_id)
            .map(|current| *current != generation)
            .unwrap_or(false)
    }
}

impl std::fmt::Debug for MediaBinder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MediaBinder")
            .field("config", &self.inner.config)
            .field("sinks", &self.inner.generations.lock().len())
            .finish()
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::{MediaTrack, TrackKind};
    use crate::testing::FakeSink;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn stream() -> MediaStream {
        MediaStream::new(vec![MediaTrack::new(TrackKind::Video, "camera")])
    }

    fn sink(fake: &Arc<FakeSink>) -> Arc<dyn RenderSink> {
        Arc::clone(fake) as Arc<dyn RenderSink>
    }

    #[tokio::test(start_paused = true)]
    async fn test_bind_attaches_and_plays() {
        let binder = MediaBinder::new(BinderConfig::default());
        let fake = FakeSink::new("local");
        let s = stream();

        let outcome = binder.bind(&sink(&fake), &s, BindOptions::default()).await;

        assert_eq!(outcome, BindOutcome::Playing);
        assert!(is_sink_healthy(fake.as_ref(), &s));
        assert_eq!(fake.play_attempts(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_identical_stream_is_noop() {
        let binder = MediaBinder::new(BinderConfig::default());
        let fake = FakeSink::new("local");
        let s = stream();

        binder.bind(&sink(&fake), &s, BindOptions::default()).await;
        let outcome = binder.bind(&sink(&fake), &s, BindOptions::default()).await;

        assert_eq!(outcome, BindOutcome::Unchanged);
        assert_eq!(fake.play_attempts(), 1);
        assert_eq!(fake.detach_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_force_rebinds_identical_stream() {
        let binder = MediaBinder::new(BinderConfig::default());
        let fake = FakeSink::new("remote");
        let s = stream();

        binder.bind(&sink(&fake), &s, BindOptions::default()).await;
        let outcome = binder.bind(&sink(&fake), &s, BindOptions::forced()).await;

        assert_eq!(outcome, BindOutcome::Playing);
        assert_eq!(fake.play_attempts(), 2);
        assert_eq!(fake.pause_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rapid_requests_collapse_to_latest() {
        let binder = MediaBinder::new(BinderConfig::default());
        let fake = FakeSink::new("remote");
        let first = stream();
        let second = stream();
        let last = stream();

        let s = sink(&fake);
        let (a, b, c) = tokio::join!(
            binder.bind(&s, &first, BindOptions::default()),
            binder.bind(&s, &second, BindOptions::default()),
            binder.bind(&s, &last, BindOptions::default()),
        );

        assert_eq!(a, BindOutcome::Superseded);
        assert_eq!(b, BindOutcome::Superseded);
        assert_eq!(c, BindOutcome::Playing);
        assert_eq!(fake.play_attempts(), 1);
        assert!(is_sink_healthy(fake.as_ref(), &last));
    }

    #[tokio::test(start_paused = true)]
    async fn test_interrupted_playback_is_not_retried() {
        let degraded = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&degraded);
        let binder = MediaBinder::with_degraded_hook(BinderConfig::default(), move |_, _| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        let fake = FakeSink::new("remote");
        fake.fail_next_play(PlaybackError::Interrupted);

        let outcome = binder.bind(&sink(&fake), &stream(), BindOptions::default()).await;

        assert_eq!(outcome, BindOutcome::Interrupted);
        assert_eq!(fake.play_attempts(), 1);
        assert_eq!(degraded.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_generic_failure_retries_once_after_backoff() {
        let binder = MediaBinder::new(BinderConfig::default());
        let fake = FakeSink::new("remote");
        fake.fail_next_play(PlaybackError::Failed("decoder busy".to_string()));

        let started = tokio::time::Instant::now();
        let outcome = binder.bind(&sink(&fake), &stream(), BindOptions::default()).await;

        assert_eq!(outcome, BindOutcome::Playing);
        assert_eq!(fake.play_attempts(), 2);
        assert!(started.elapsed() >= BinderConfig::default().retry_backoff());
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_failure_emits_degraded_signal() {
        let degraded = Arc::new(Mutex::new(Vec::new()));
        let seen = Arc::clone(&degraded);
        let binder = MediaBinder::with_degraded_hook(BinderConfig::default(), move |id, _| {
            seen.lock().push(id.to_string());
        });
        let fake = FakeSink::new("remote");
        fake.fail_next_play(PlaybackError::Failed("no decoder".to_string()));
        fake.fail_next_play(PlaybackError::Failed("no decoder".to_string()));

        let outcome = binder.bind(&sink(&fake), &stream(), BindOptions::default()).await;

        assert!(matches!(outcome, BindOutcome::Degraded(_)));
        assert_eq!(fake.play_attempts(), 2);
        assert_eq!(*degraded.lock(), vec!["remote".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unbind_keeps_stream_alive() {
        let binder = MediaBinder::new(BinderConfig::default());
        let fake = FakeSink::new("local");
        let s = stream();

        binder.bind(&sink(&fake), &s, BindOptions::default()).await;
        binder.unbind(&sink(&fake));

        assert!(fake.current_stream().is_none());
        assert!(!fake.is_playing());
        assert!(!s.all_ended());
    }
}
