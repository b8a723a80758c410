//! Media Module - Streams, Geräte und Render Sinks
//!
//! Dieses Modul verwaltet:
//! - MediaStream / MediaTrack Handles
//! - Zugriff auf lokale Geräte (über Collaborator-Traits)
//! - Binden von Streams an Render Sinks (MediaBinder)
//!

mod binder;
#[cfg(feature = "audio-devices")]
mod cpal_devices;
mod devices;
mod stream;

pub use binder::{
    is_sink_healthy, BindOptions, BindOutcome, MediaBinder, PlaybackError, RenderSink,
};
#[cfg(feature = "audio-devices")]
pub use cpal_devices::{CpalDevices, SAMPLE_RATE};
pub use devices::{MediaAcquisitionError, MediaDevices, PermissionGate, SyntheticDevices};
pub use stream::{
    MediaConstraints, MediaStream, MediaTrack, TrackKind, TrackState, VideoConstraints,
};
