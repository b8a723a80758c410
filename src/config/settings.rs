//! Call Konfiguration
//!
//! Reihenfolge der Quellen (niedrigste zuerst):
//! 1. Eingebaute Defaults
//! 2. JSON-Datei aus `CALL_CONFIG`
//! 3. Einzelne Umgebungsvariablen (`CALL_STUN_URLS`, `CALL_TURN_*`, `CALL_SIGNALING_DB`)

use crate::media::MediaConstraints;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use url::Url;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file {path:?}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid config file: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid ICE server url '{url}': {reason}")]
    InvalidIceUrl { url: String, reason: String },

    #[error("Invalid setting {field}: {reason}")]
    InvalidValue { field: &'static str, reason: String },

    #[error("Could not determine app data directory")]
    NoDataDirectory,
}

// ============================================================================
// ICE SERVER CONFIGURATION
// ============================================================================

/// Ein STUN oder TURN Server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServerConfig {
    pub urls: Vec<String>,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub credential: String,
}

/// Standard STUN Server Konfiguration
pub fn default_ice_servers() -> Vec<IceServerConfig> {
    vec![IceServerConfig {
        urls: vec![
            "stun:stun.l.google.com:19302".to_string(),
            "stun:stun1.l.google.com:19302".to_string(),
            "stun:stun2.l.google.com:19302".to_string(),
        ],
        username: String::new(),
        credential: String::new(),
    }]
}

// ============================================================================
// SECTIONS
// ============================================================================

/// Timings für das Binden von Streams an Render Sinks
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BinderConfig {
    /// Fenster in dem schnelle Wiederholungen für denselben Sink zusammengefasst werden
    pub debounce_ms: u64,
    /// Pause zwischen Detach und Attach
    pub settle_ms: u64,
    /// Wartezeit vor dem einzigen Playback-Retry
    pub retry_backoff_ms: u64,
}

impl Default for BinderConfig {
    fn default() -> Self {
        Self {
            debounce_ms: 100,
            settle_ms: 100,
            retry_backoff_ms: 1000,
        }
    }
}

impl BinderConfig {
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn settle(&self) -> Duration {
        Duration::from_millis(self.settle_ms)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }
}

/// Verifikations-Schleife nach einem Rejoin
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RejoinConfig {
    pub max_checks: u32,
    pub check_interval_ms: u64,
    /// Rejoin automatisch starten wenn ein verbundener Call unerwartet endet
    pub auto_rejoin: bool,
}

impl Default for RejoinConfig {
    fn default() -> Self {
        Self {
            max_checks: 6,
            check_interval_ms: 1000,
            auto_rejoin: true,
        }
    }
}

impl RejoinConfig {
    pub fn check_interval(&self) -> Duration {
        Duration::from_millis(self.check_interval_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QualityConfig {
    pub sample_interval_ms: u64,
}

impl Default for QualityConfig {
    fn default() -> Self {
        Self {
            sample_interval_ms: 2000,
        }
    }
}

impl QualityConfig {
    pub fn sample_interval(&self) -> Duration {
        Duration::from_millis(self.sample_interval_ms)
    }
}

// ============================================================================
// CALL CONFIG
// ============================================================================

/// Gesamte Konfiguration einer Call Session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CallConfig {
    pub ice_servers: Vec<IceServerConfig>,
    pub media: MediaConstraints,
    pub binder: BinderConfig,
    pub rejoin: RejoinConfig,
    pub quality: QualityConfig,
    /// SQLite-Datei für den Signaling Store (None = App-Datenverzeichnis)
    pub signaling_db: Option<PathBuf>,
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            ice_servers: default_ice_servers(),
            media: MediaConstraints::default(),
            binder: BinderConfig::default(),
            rejoin: RejoinConfig::default(),
            quality: QualityConfig::default(),
            signaling_db: None,
        }
    }
}

impl CallConfig {
    /// Lädt die Konfiguration aus Defaults, Datei und Umgebung
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = match std::env::var("CALL_CONFIG") {
            Ok(path) if !path.trim().is_empty() => Self::from_file(Path::new(path.trim()))?,
            _ => Self::default(),
        };

        config.apply_overrides(|key| std::env::var(key).ok());
        config.validate()?;

        tracing::debug!("Loaded call config: {:?}", config);
        Ok(config)
    }

    /// Liest eine JSON-Datei; fehlende Sektionen behalten ihre Defaults
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(&raw)
    }

    pub fn from_json(raw: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(raw)?)
    }

    /// Wendet Umgebungsvariablen an. `lookup` ist austauschbar für Tests.
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(stun) = lookup("CALL_STUN_URLS") {
            let urls: Vec<String> = stun
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
            if !urls.is_empty() {
                self.ice_servers.retain(|server| {
                    !server
                        .urls
                        .iter()
                        .all(|u| u.starts_with("stun:") || u.starts_with("stuns:"))
                });
                self.ice_servers.insert(
                    0,
                    IceServerConfig {
                        urls,
                        username: String::new(),
                        credential: String::new(),
                    },
                );
            }
        }

        if let Some(turn_url) = lookup("CALL_TURN_URL").filter(|s| !s.trim().is_empty()) {
            self.add_turn_server(
                turn_url.trim().to_string(),
                lookup("CALL_TURN_USERNAME").unwrap_or_default(),
                lookup("CALL_TURN_CREDENTIAL").unwrap_or_default(),
            );
        }

        if let Some(db) = lookup("CALL_SIGNALING_DB").filter(|s| !s.trim().is_empty()) {
            self.signaling_db = Some(PathBuf::from(db.trim()));
        }
    }

    /// Fügt einen TURN-Server mit Credentials hinzu
    pub fn add_turn_server(&mut self, url: String, username: String, credential: String) {
        self.ice_servers.push(IceServerConfig {
            urls: vec![url],
            username,
            credential,
        });
    }

    /// Prüft URLs und Timings
    pub fn validate(&self) -> Result<(), ConfigError> {
        for server in &self.ice_servers {
            for raw in &server.urls {
                let parsed = Url::parse(raw).map_err(|e| ConfigError::InvalidIceUrl {
                    url: raw.clone(),
                    reason: e.to_string(),
                })?;
                if !matches!(parsed.scheme(), "stun" | "stuns" | "turn" | "turns") {
                    return Err(ConfigError::InvalidIceUrl {
                        url: raw.clone(),
                        reason: format!("unsupported scheme '{}'", parsed.scheme()),
                    });
                }
            }
        }

        if self.rejoin.max_checks == 0 {
            return Err(ConfigError::InvalidValue {
                field: "rejoin.max_checks",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.rejoin.check_interval_ms == 0 {
            return Err(ConfigError::InvalidValue {
                field: "rejoin.check_interval_ms",
                reason: "must be greater than 0".to_string(),
            });
        }
        if self.quality.sample_interval_ms == 0 {
            return Err(ConfigError::InvalidValue {
                field: "quality.sample_interval_ms",
                reason: "must be greater than 0".to_string(),
            });
        }

        Ok(())
    }

    /// Ermittelt den Pfad zur Signaling-Datenbank
    pub fn signaling_db_path(&self) -> Result<PathBuf, ConfigError> {
        if let Some(path) = &self.signaling_db {
            return Ok(path.clone());
        }

        let proj_dirs = directories::ProjectDirs::from("com", "callsession", "call-session")
            .ok_or(ConfigError::NoDataDirectory)?;

        let mut path = proj_dirs.data_dir().to_path_buf();
        path.push("signaling.db");
        Ok(path)
    }
}

// ============================================================================
// TESTS
// ============================================================================
