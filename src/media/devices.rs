//! Media-Geräte und Berechtigungen
//!
//! Die eigentliche Geräte-Freigabe (Kamera/Mikrofon) passiert außerhalb.
//! Der Core sieht nur ein `PermissionGate` und einen fertigen `MediaStream`.

use super::stream::{MediaConstraints, MediaStream, MediaTrack, TrackKind};
use async_trait::async_trait;
use thiserror::Error;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MediaAcquisitionError {
    #[error("Permission to use camera/microphone was denied")]
    PermissionDenied,

    #[error("No {0} device found")]
    DeviceNotFound(String),

    #[error("Media devices require a secure context")]
    InsecureContext,

    #[error("Media device unavailable: {0}")]
    Unavailable(String),
}

impl MediaAcquisitionError {
    /// Meldung für den Benutzer
    pub fn user_message(&self) -> String {
        match self {
            Self::PermissionDenied => {
                "Please allow camera and microphone access, then rejoin the call.".to_string()
            }
            Self::DeviceNotFound(device) => {
                format!("No {} was found. Connect one and rejoin the call.", device)
            }
            Self::InsecureContext => {
                "Calls are only available over a secure connection.".to_string()
            }
            Self::Unavailable(_) => {
                "Your camera or microphone is in use by another application.".to_string()
            }
        }
    }
}

// ============================================================================
// COLLABORATOR TRAITS
// ============================================================================

/// Liefert lokale Medien (Audio + Video)
#[async_trait]
pub trait MediaDevices: Send + Sync {
    async fn get_user_media(
        &self,
        constraints: &MediaConstraints,
    ) -> Result<MediaStream, MediaAcquisitionError>;
}

/// Boolesches Signal "Berechtigungen erteilt"
pub trait PermissionGate: Send + Sync {
    fn has_media_permissions(&self) -> bool;
}

impl PermissionGate for bool {
    fn has_media_permissions(&self) -> bool {
        *self
    }
}

// ============================================================================
// SYNTHETIC DEVICES
// ============================================================================

/// Erzeugt Track-Handles ohne Hardware-Zugriff.
///
/// Für Headless-Betrieb, bei dem Frames von außen in die Tracks
/// geschrieben werden, und als Basis für hardware-gestützte Geräte.
#[derive(Debug, Clone, Default)]
pub struct SyntheticDevices;

impl SyntheticDevices {
    pub fn build_stream(constraints: &MediaConstraints) -> MediaStream {
        let mut tracks = Vec::new();
        if constraints.audio {
            tracks.push(MediaTrack::new(TrackKind::Audio, "microphone"));
        }
        if let Some(video) = constraints.video {
            let track = MediaTrack::new(TrackKind::Video, "camera");
            track.apply_constraints(video);
            tracks.push(track);
        }
        MediaStream::new(tracks)
    }
}

#[async_trait]
impl MediaDevices for SyntheticDevices {
    async fn get_user_media(
        &self,
        constraints: &MediaConstraints,
    ) -> Result<MediaStream, MediaAcquisitionError> {
        if !constraints.audio && constraints.video.is_none() {
            return Err(MediaAcquisitionError::Unavailable(
                "no audio or video requested".to_string(),
            ));
        }
        Ok(Self::build_stream(constraints))
    }
}
