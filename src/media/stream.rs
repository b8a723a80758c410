//! Media Streams und Tracks
//!
//! `MediaStream` und `MediaTrack` sind billig klonbare Handles. Zwei Handles
//! gelten nur dann als "derselbe Stream", wenn sie auf dieselbe Allokation
//! zeigen (siehe [`MediaStream::same_as`]).

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

// ============================================================================
// CONSTRAINTS
// ============================================================================

/// Auflösung und Framerate für Video Tracks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VideoConstraints {
    pub width: u32,
    pub height: u32,
    pub frame_rate: u32,
}

impl Default for VideoConstraints {
    fn default() -> Self {
        Self {
            width: 1280,
            height: 720,
            frame_rate: 30,
        }
    }
}

impl VideoConstraints {
    /// Profil für schwache Netzwerke (manuell über "optimize for network")
    pub fn low_bandwidth() -> Self {
        Self {
            width: 640,
            height: 360,
            frame_rate: 15,
        }
    }
}

/// Angeforderte Medien für `get_user_media`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MediaConstraints {
    pub audio: bool,
    /// `None` = kein Video
    pub video: Option<VideoConstraints>,
}

impl Default for MediaConstraints {
    fn default() -> Self {
        Self {
            audio: true,
            video: Some(VideoConstraints::default()),
        }
    }
}

// ============================================================================
// TRACK
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    Audio,
    Video,
}

impl TrackKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TrackKind::Audio => "audio",
            TrackKind::Video => "video",
        }
    }
}

/// Lebenszyklus eines Tracks. `Ended` ist endgültig.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackState {
    Live,
    Ended,
}

struct TrackInner {
    id: String,
    kind: TrackKind,
    label: String,
    enabled: AtomicBool,
    ended: AtomicBool,
    constraints: Mutex<Option<VideoConstraints>>,
}

/// Ein einzelner Audio- oder Video-Track
#[derive(Clone)]
pub struct MediaTrack {
    inner: Arc<TrackInner>,
}

impl MediaTrack {
    pub fn new(kind: TrackKind, label: impl Into<String>) -> Self {
        Self::with_id(uuid::Uuid::new_v4().to_string(), kind, label)
    }

    pub fn with_id(id: impl Into<String>, kind: TrackKind, label: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(TrackInner {
                id: id.into(),
                kind,
                label: label.into(),
                enabled: AtomicBool::new(true),
                ended: AtomicBool::new(false),
                constraints: Mutex::new(None),
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn kind(&self) -> TrackKind {
        self.inner.kind
    }

    pub fn label(&self) -> &str {
        &self.inner.label
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.enabled.load(Ordering::SeqCst)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.inner.enabled.store(enabled, Ordering::SeqCst);
    }

    pub fn state(&self) -> TrackState {
        if self.inner.ended.load(Ordering::SeqCst) {
            TrackState::Ended
        } else {
            TrackState::Live
        }
    }

    /// Gibt die Hardware frei. Gibt `true` zurück wenn der Track noch lief.
    pub fn stop(&self) -> bool {
        let was_live = !self.inner.ended.swap(true, Ordering::SeqCst);
        if was_live {
            tracing::debug!("Stopped {} track {}", self.kind().as_str(), self.id());
        }
        was_live
    }

    pub fn constraints(&self) -> Option<VideoConstraints> {
        *self.inner.constraints.lock()
    }

    pub fn apply_constraints(&self, constraints: VideoConstraints) {
        *self.inner.constraints.lock() = Some(constraints);
    }

    pub fn same_as(&self, other: &MediaTrack) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl std::fmt::Debug for MediaTrack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MediaTrack")
            .field("id", &self.inner.id)
            .field("kind", &self.inner.kind)
            .field("enabled", &self.is_enabled())
            .field("state", &self.state())
            .finish()
    }
}

// ============================================================================
// STREAM
// ============================================================================

struct StreamInner {
    id: String,
    tracks: RwLock<Vec<MediaTrack>>,
}

/// Sammlung von Tracks, die gemeinsam an einen Sink gebunden werden
#[derive(Clone)]
pub struct MediaStream {
    inner: Arc<StreamInner>,
}

impl MediaStream {
    pub fn new(tracks: Vec<MediaTrack>) -> Self {
        Self::with_id(uuid::Uuid::new_v4().to_string(), tracks)
    }

    pub fn with_id(id: impl Into<String>, tracks: Vec<MediaTrack>) -> Self {
        Self {
            inner: Arc::new(StreamInner {
                id: id.into(),
                tracks: RwLock::new(tracks),
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn tracks(&self) -> Vec<MediaTrack> {
        self.inner.tracks.read().clone()
    }

    pub fn tracks_of(&self, kind: TrackKind) -> Vec<MediaTrack> {
        self.inner
            .tracks
            .read()
            .iter()
            .filter(|t| t.kind() == kind)
            .cloned()
            .collect()
    }

    /// Fügt einen Track hinzu, sofern die ID noch nicht vorhanden ist
    pub fn add_track(&self, track: MediaTrack) -> bool {
        let mut tracks = self.inner.tracks.write();
        if tracks.iter().any(|t| t.id() == track.id()) {
            return false;
        }
        tracks.push(track);
        true
    }

    /// Stoppt alle Tracks (idempotent)
    pub fn stop_all(&self) -> usize {
        self.inner
            .tracks
            .read()
            .iter()
            .filter(|t| t.stop())
            .count()
    }

    pub fn all_ended(&self) -> bool {
        self.inner
            .tracks
            .read()
            .iter()
            .all(|t| t.state() == TrackState::Ended)
    }

    /// Referenz-Gleichheit, nicht ID-Gleichheit
    pub fn same_as(&self, other: &MediaStream) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl std::fmt::Debug for MediaStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MediaStream")
            .field("id", &self.inner.id)
            .field("tracks", &self.inner.tracks.read().len())
            .finish()
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stop_is_idempotent() {
        let stream = MediaStream::new(vec![
            MediaTrack::new(TrackKind::Audio, "mic"),
            MediaTrack::new(TrackKind::Video, "camera"),
        ]);

        assert_eq!(stream.stop_all(), 2);
        assert_eq!(stream.stop_all(), 0);
        assert!(stream.all_ended());
    }

    #[test]
    fn test_same_as_is_reference_identity() {
        let a = MediaStream::with_id("s1", vec![]);
        let b = MediaStream::with_id("s1", vec![]);

        assert!(a.same_as(&a.clone()));
        assert!(!a.same_as(&b));
    }

    #[test]
    fn test_add_track_ignores_duplicate_ids() {
        let stream = MediaStream::new(vec![]);
        assert!(stream.add_track(MediaTrack::with_id("t1", TrackKind::Audio, "remote")));
        assert!(!stream.add_track(MediaTrack::with_id("t1", TrackKind::Audio, "remote")));
        assert_eq!(stream.tracks_of(TrackKind::Audio).len(), 1);
    }
}
