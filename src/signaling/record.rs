//! Record Types für den Signaling Store
//!
//! Diese Strukturen spiegeln das externe Persistenzformat wider
//! (ein Dokument pro `callId` plus Kind-Liste `iceCandidates`).

use crate::session::Role;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ============================================================================
// SDP
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Answer,
}

/// `{ type, sdp }`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub sdp_type: SdpType,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Answer,
            sdp: sdp.into(),
        }
    }
}

// ============================================================================
// ICE CANDIDATES
// ============================================================================

/// Ein ICE Candidate wie ihn die Peer Connection erzeugt/erwartet
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(rename = "sdpMLineIndex", default)]
    pub sdp_m_line_index: Option<u16>,
    #[serde(rename = "sdpMid", default)]
    pub sdp_mid: Option<String>,
}

/// Eintrag in der `iceCandidates`-Liste
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredIceCandidate {
    #[serde(flatten)]
    pub candidate: IceCandidate,
    /// Welche Partei den Candidate angehängt hat (ältere Einträge: fehlt)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<Role>,
    pub created_at: DateTime<Utc>,
}

impl StoredIceCandidate {
    pub fn new(candidate: IceCandidate, role: Role) -> Self {
        Self {
            candidate,
            role: Some(role),
            created_at: Utc::now(),
        }
    }

    /// Candidate stammt nicht von `own_role`
    pub fn is_remote_for(&self, own_role: Role) -> bool {
        self.role != Some(own_role)
    }
}

/// Aktueller Versuch und dessen Candidates in Einfüge-Reihenfolge
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CandidateLog {
    pub attempt: u64,
    pub entries: Vec<StoredIceCandidate>,
}

// ============================================================================
// CALL RECORD
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallRecordStatus {
    Waiting,
    Ended,
}

impl CallRecordStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CallRecordStatus::Waiting => "waiting",
            CallRecordStatus::Ended => "ended",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "waiting" => Some(CallRecordStatus::Waiting),
            "ended" => Some(CallRecordStatus::Ended),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallParticipants {
    pub initiator_id: String,
    pub responder_id: String,
}

/// Geteilter Zustand pro `callId`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignalingRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub offer: Option<SessionDescription>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub answer: Option<SessionDescription>,
    pub status: CallRecordStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub participants: Option<CallParticipants>,
    /// Wird bei jedem Reset erhöht
    #[serde(default)]
    pub attempt: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SignalingRecord {
    pub fn new() -> Self {
        let now = Utc::now();
        Self {
            offer: None,
            answer: None,
            status: CallRecordStatus::Waiting,
            participants: None,
            attempt: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// Offer/Answer leeren für einen neuen Versuch
    pub fn reset(&mut self) {
        self.offer = None;
        self.answer = None;
        self.status = CallRecordStatus::Waiting;
        self.attempt += 1;
        self.touch();
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

impl Default for SignalingRecord {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_wire_shape() {
        let mut record = SignalingRecord::new();
        record.offer = Some(SessionDescription::offer("v=0"));

        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["offer"]["type"], "offer");
        assert_eq!(json["offer"]["sdp"], "v=0");
        assert_eq!(json["status"], "waiting");
        assert!(json.get("answer").is_none());
        assert!(json.get("createdAt").is_some());
        assert!(json.get("updatedAt").is_some());
    }

    #[test]
    fn test_candidate_wire_shape() {
        let stored = StoredIceCandidate::new(
            IceCandidate {
                candidate: "candidate:1 1 udp 2122260223 192.0.2.1 54400 typ host".to_string(),
                sdp_m_line_index: Some(0),
                sdp_mid: Some("0".to_string()),
            },
            Role::Initiator,
        );

        let json = serde_json::to_value(&stored).unwrap();
        assert_eq!(json["sdpMLineIndex"], 0);
        assert_eq!(json["sdpMid"], "0");
        assert_eq!(json["role"], "initiator");
        assert!(json.get("createdAt").is_some());
    }

    #[test]
    fn test_candidate_without_role_is_remote_for_both() {
        let raw = r#"{
            "candidate": "candidate:2 1 udp 1 198.51.100.7 3478 typ srflx",
            "sdpMLineIndex": 1,
            "sdpMid": "1",
            "createdAt": "2024-05-01T10:00:00Z"
        }"#;
        let stored: StoredIceCandidate = serde_json::from_str(raw).unwrap();

        assert_eq!(stored.role, None);
        assert!(stored.is_remote_for(Role::Initiator));
        assert!(stored.is_remote_for(Role::Responder));
    }

    #[test]
    fn test_reset_bumps_attempt() {
        let mut record = SignalingRecord::new();
        record.offer = Some(SessionDescription::offer("v=0"));
        record.answer = Some(SessionDescription::answer("v=0"));
        record.status = CallRecordStatus::Ended;

        record.reset();

        assert!(record.offer.is_none());
        assert!(record.answer.is_none());
        assert_eq!(record.status, CallRecordStatus::Waiting);
        assert_eq!(record.attempt, 1);
    }
}
