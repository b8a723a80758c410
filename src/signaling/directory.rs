//! Teilnehmer- und Identitäts-Schnittstellen
//!
//! Termin-Lookup und Login liegen außerhalb dieser Crate; hier nur die
//! Schnittstellen, die der Session Manager benötigt.

use super::channel::SignalingError;
use super::record::CallParticipants;
use async_trait::async_trait;
use std::collections::HashMap;

/// Termin-Lookup: wer ist Initiator, wer Responder
#[async_trait]
pub trait ParticipantDirectory: Send + Sync {
    async fn get_call_participants(&self, call_id: &str)
        -> Result<CallParticipants, SignalingError>;
}

pub trait IdentityProvider: Send + Sync {
    fn current_user_id(&self) -> String;
}

impl IdentityProvider for String {
    fn current_user_id(&self) -> String {
        self.clone()
    }
}

/// Feste Zuordnung callId → Teilnehmer
#[derive(Debug, Clone, Default)]
pub struct StaticDirectory {
    calls: HashMap<String, CallParticipants>,
}

impl StaticDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_call(
        mut self,
        call_id: impl Into<String>,
        initiator_id: impl Into<String>,
        responder_id: impl Into<String>,
    ) -> Self {
        self.calls.insert(
            call_id.into(),
            CallParticipants {
                initiator_id: initiator_id.into(),
                responder_id: responder_id.into(),
            },
        );
        self
    }
}

#[async_trait]
impl ParticipantDirectory for StaticDirectory {
    async fn get_call_participants(
        &self,
        call_id: &str,
    ) -> Result<CallParticipants, SignalingError> {
        self.calls
            .get(call_id)
            .cloned()
            .ok_or_else(|| SignalingError::ParticipantsNotFound(call_id.to_string()))
    }
}
