//! Config Module - Laufzeit-Einstellungen für Call Sessions
//!
//! Dieses Modul verwaltet:
//! - ICE Server (STUN/TURN Endpunkte)
//! - Media Constraints (Audio/Video)
//! - Timings für MediaBinder, Rejoin und Quality Monitor
//! - Pfad zur Signaling-Datenbank
//!

mod settings;

pub use settings::{
    default_ice_servers, BinderConfig, CallConfig, ConfigError, IceServerConfig, QualityConfig,
    RejoinConfig,
};
