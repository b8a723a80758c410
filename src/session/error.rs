use crate::media::MediaAcquisitionError;
use crate::peer::PeerError;
use crate::signaling::SignalingError;
use thiserror::Error;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CallError {
    #[error("Media acquisition failed: {0}")]
    MediaAcquisition(#[from] MediaAcquisitionError),

    /// Offer/Answer konnte nicht geschrieben werden
    #[error("Signaling write failed: {0}")]
    SignalingWrite(SignalingError),

    /// SDP konnte nicht erzeugt oder gesetzt werden
    #[error("Negotiation failed: {0}")]
    Negotiation(PeerError),

    #[error("Peer connection error: {0}")]
    Peer(PeerError),

    #[error("Invalid call id")]
    InvalidCallId,

    #[error("Already in a call ({0})")]
    AlreadyInCall(String),

    #[error("No active call")]
    NoActiveCall,

    #[error("User {user_id} is not a participant of call {call_id}")]
    NotAParticipant { call_id: String, user_id: String },

    #[error("Participant lookup failed: {0}")]
    ParticipantLookup(SignalingError),

    #[error("No negotiation step to retry")]
    RetryUnavailable,

    /// Versuch wurde durch `end_call` oder einen neueren Versuch ersetzt
    #[error("Call attempt was cancelled")]
    Cancelled,
}

impl CallError {
    /// Fehler, nach denen keine nutzbare Session mehr existiert
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            CallError::MediaAcquisition(_) | CallError::SignalingWrite(_) | CallError::Peer(_)
        )
    }

    /// Eine Meldung, mit der Nutzer etwas anfangen können
    pub fn user_message(&self) -> String {
        match self {
            CallError::MediaAcquisition(e) => e.user_message(),
            CallError::SignalingWrite(_) => {
                "The call could not be set up. Please try to rejoin.".to_string()
            }
            CallError::Negotiation(_) => {
                "Connecting is taking longer than expected. Please retry.".to_string()
            }
            CallError::Peer(_) => {
                "The connection could not be established. Please try to rejoin.".to_string()
            }
            CallError::InvalidCallId => "This call link is not valid.".to_string(),
            CallError::AlreadyInCall(_) => "You are already in a call.".to_string(),
            CallError::NoActiveCall => "There is no active call.".to_string(),
            CallError::NotAParticipant { .. } => "You are not part of this call.".to_string(),
            CallError::ParticipantLookup(_) => {
                "The appointment for this call could not be found.".to_string()
            }
            CallError::RetryUnavailable => "Please rejoin the call.".to_string(),
            CallError::Cancelled => "The call was ended.".to_string(),
        }
    }
}
