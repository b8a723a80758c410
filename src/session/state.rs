use super::error::CallError;
use super::quality::{format_duration, ConnectionQuality};
use super::rejoin::VerificationOutcome;
use crate::media::{MediaStream, PlaybackError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ============================================================================
// ROLE
// ============================================================================

/// Rolle im Anruf, fest für die Lebensdauer einer Session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Schreibt das Offer
    Initiator,
    /// Wartet auf das Offer und schreibt die Answer
    Responder,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Initiator => "initiator",
            Role::Responder => "responder",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "initiator" => Some(Role::Initiator),
            "responder" => Some(Role::Responder),
            _ => None,
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// CALL STATE
// ============================================================================

/// Aktueller Status eines Anrufs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CallStatus {
    /// Kein Anruf
    Idle,
    /// Kamera/Mikrofon werden angefordert
    AcquiringMedia,
    /// Offer/Answer/ICE laufen
    Negotiating,
    /// Remote Media ist da
    Connected,
    /// Rejoin nach einem Abbruch
    Reconnecting,
    /// Anruf beendet
    Ended,
}

impl CallStatus {
    /// Ein Versuch läuft (neue `initialize_call` werden abgelehnt)
    pub fn is_busy(&self) -> bool {
        !matches!(self, CallStatus::Idle | CallStatus::Ended)
    }
}

/// Beobachtbarer Zustand einer Session
#[derive(Debug, Clone)]
pub struct CallSnapshot {
    pub call_id: Option<String>,
    pub role: Option<Role>,
    pub status: CallStatus,
    /// Gehört der Session
    pub local_stream: Option<MediaStream>,
    /// Gehört dem Transport; nur beobachtet
    pub remote_stream: Option<MediaStream>,
    pub error: Option<CallError>,
    pub duration_secs: u64,
    pub quality: ConnectionQuality,
    pub started_at: Option<DateTime<Utc>>,
}

impl CallSnapshot {
    pub fn idle() -> Self {
        Self {
            call_id: None,
            role: None,
            status: CallStatus::Idle,
            local_stream: None,
            remote_stream: None,
            error: None,
            duration_secs: 0,
            quality: ConnectionQuality::Disconnected,
            started_at: None,
        }
    }

    /// Dauer als `MM:SS`
    pub fn duration_label(&self) -> String {
        format_duration(self.duration_secs)
    }
}

impl Default for CallSnapshot {
    fn default() -> Self {
        Self::idle()
    }
}

/// Events die vom CallSessionManager ausgelöst werden
#[derive(Debug, Clone)]
pub enum CallEvent {
    StateChanged(CallStatus),
    QualityChanged(ConnectionQuality),
    /// Playback auf einem Sink auch nach dem Retry fehlgeschlagen
    PlaybackDegraded { sink_id: String, error: PlaybackError },
    RejoinVerification(VerificationOutcome),
    Error(CallError),
}
