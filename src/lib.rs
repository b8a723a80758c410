//! Call Session - P2P Audio/Video Calls über einen Signaling Store
//!
//! Eine Call-Session-Bibliothek mit:
//! - Offer/Answer/ICE Austausch über einen beobachtbaren Signaling Record
//! - WebRTC Peer Connections (über das `webrtc` Crate)
//! - Binden von Streams an Render Sinks mit Retry und Degradations-Signal
//! - Qualitäts-Monitor, Call-Dauer und Rejoin mit Sink-Verifikation
//! - SQLite oder In-Memory als Signaling-Backend

pub mod config;
pub mod media;
pub mod peer;
pub mod session;
pub mod signaling;

#[cfg(test)]
mod testing;

pub use config::{CallConfig, ConfigError};
pub use session::{
    resolve_role, CallError, CallEvent, CallSessionManager, CallSnapshot, CallStatus,
    ConnectionQuality, Role, SessionDeps,
};
pub use signaling::{SignalingChannel, SignalingError, SignalingHub, SqliteStore};

use std::sync::Arc;

// ============================================================================
// LOGGING
// ============================================================================

/// Installiert den tracing Subscriber; `RUST_LOG` überschreibt die Defaults
pub fn init_logging() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("call_session_lib=debug,webrtc=warn"));

    // Zweiter Aufruf (z.B. aus mehreren Tests) ist kein Fehler
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

// ============================================================================
// SIGNALING BACKEND
// ============================================================================

/// Öffnet den SQLite Signaling Store aus der Konfiguration
pub fn open_signaling(config: &CallConfig) -> Result<Arc<SignalingHub<SqliteStore>>, SignalingError> {
    let path = config
        .signaling_db_path()
        .map_err(|e| SignalingError::Storage(e.to_string()))?;
    let store = SqliteStore::open(&path)?;
    tracing::info!("Signaling store ready");
    Ok(Arc::new(SignalingHub::new(store)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signaling::{CallRecordStatus, SessionDescription};

    #[tokio::test]
    async fn test_open_signaling_persists_records() {
        let path = std::env::temp_dir()
            .join(format!("call-session-{}", uuid::Uuid::new_v4()))
            .join("signaling.db");
        let config = CallConfig {
            signaling_db: Some(path.clone()),
            ..CallConfig::default()
        };

        {
            let hub = open_signaling(&config).unwrap();
            hub.write_offer("call_42", SessionDescription::offer("v=0"))
                .await
                .unwrap();
        }

        let reopened = open_signaling(&config).unwrap();
        let record = reopened.load_record("call_42").await.unwrap().unwrap();
        assert_eq!(record.offer, Some(SessionDescription::offer("v=0")));
        assert_eq!(record.status, CallRecordStatus::Waiting);

        if let Some(dir) = path.parent() {
            let _ = std::fs::remove_dir_all(dir);
        }
    }

    #[test]
    fn test_init_logging_twice_is_harmless() {
        init_logging();
        init_logging();
    }
}
