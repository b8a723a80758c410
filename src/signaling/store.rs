//! Signaling Store Backends
//!
//! `SignalingStore` ist die synchrone Speicherschicht unter dem
//! `SignalingHub`. Regeln wie "Answer nur nach Offer" prüft der Store
//! zusammen mit dem Schreiben in einem Schritt.

use super::channel::SignalingError;
use super::record::{
    CallParticipants, CallRecordStatus, CandidateLog, SessionDescription, SignalingRecord,
    StoredIceCandidate,
};
use parking_lot::RwLock;
use std::collections::HashMap;

pub trait SignalingStore: Send + Sync {
    /// Legt den Record an (Status `waiting`) oder setzt die Teilnehmer
    fn upsert_record(
        &self,
        call_id: &str,
        participants: &CallParticipants,
    ) -> Result<(), SignalingError>;

    fn load_record(&self, call_id: &str) -> Result<Option<SignalingRecord>, SignalingError>;

    /// Schreibt das Offer nur wenn noch keines existiert.
    /// Legt den Record bei Bedarf an.
    fn store_offer(&self, call_id: &str, offer: &SessionDescription) -> Result<(), SignalingError>;

    /// Schreibt die Answer nur wenn ein Offer und noch keine Answer existiert
    fn store_answer(
        &self,
        call_id: &str,
        answer: &SessionDescription,
    ) -> Result<(), SignalingError>;

    /// Gibt `false` zurück wenn kein Record existiert
    fn set_status(&self, call_id: &str, status: CallRecordStatus) -> Result<bool, SignalingError>;

    /// Leert Offer/Answer/Candidates und erhöht den Versuchszähler
    fn reset(&self, call_id: &str) -> Result<(), SignalingError>;

    /// Wie `reset`, aber nur für Records mit Status `ended`
    fn reopen_if_ended(&self, call_id: &str) -> Result<bool, SignalingError>;

    fn append_candidate(
        &self,
        call_id: &str,
        candidate: &StoredIceCandidate,
    ) -> Result<(), SignalingError>;

    fn load_candidates(&self, call_id: &str) -> Result<CandidateLog, SignalingError>;
}

// ============================================================================
// MEMORY STORE
// ============================================================================

#[derive(Debug, Default)]
struct CallEntry {
    record: SignalingRecord,
    candidates: Vec<StoredIceCandidate>,
}

/// In-Memory Store für einen Prozess (beide Parteien im selben Prozess, Tests)
#[derive(Debug, Default)]
pub struct MemoryStore {
    calls: RwLock<HashMap<String, CallEntry>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SignalingStore for MemoryStore {
    fn upsert_record(
        &self,
        call_id: &str,
        participants: &CallParticipants,
    ) -> Result<(), SignalingError> {
        let mut calls = self.calls.write();
        let entry = calls.entry(call_id.to_string()).or_default();
        entry.record.participants = Some(participants.clone());
        entry.record.status = CallRecordStatus::Waiting;
        entry.record.touch();
        Ok(())
    }

    fn load_record(&self, call_id: &str) -> Result<Option<SignalingRecord>, SignalingError> {
        Ok(self.calls.read().get(call_id).map(|e| e.record.clone()))
    }

    fn store_offer(&self, call_id: &str, offer: &SessionDescription) -> Result<(), SignalingError> {
        let mut calls = self.calls.write();
        let entry = calls.entry(call_id.to_string()).or_default();
        if entry.record.offer.is_some() {
            return Err(SignalingError::already_written(call_id, "offer"));
        }
        entry.record.offer = Some(offer.clone());
        entry.record.touch();
        Ok(())
    }

    fn store_answer(
        &self,
        call_id: &str,
        answer: &SessionDescription,
    ) -> Result<(), SignalingError> {
        let mut calls = self.calls.write();
        let entry = calls
            .get_mut(call_id)
            .filter(|e| e.record.offer.is_some())
            .ok_or_else(|| SignalingError::NoOffer(call_id.to_string()))?;
        if entry.record.answer.is_some() {
            return Err(SignalingError::already_written(call_id, "answer"));
        }
        entry.record.answer = Some(answer.clone());
        entry.record.touch();
        Ok(())
    }

    fn set_status(&self, call_id: &str, status: CallRecordStatus) -> Result<bool, SignalingError> {
        let mut calls = self.calls.write();
        match calls.get_mut(call_id) {
            Some(entry) => {
                entry.record.status = status;
                entry.record.touch();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn reset(&self, call_id: &str) -> Result<(), SignalingError> {
        let mut calls = self.calls.write();
        let entry = calls.entry(call_id.to_string()).or_default();
        entry.record.reset();
        entry.candidates.clear();
        Ok(())
    }

    fn reopen_if_ended(&self, call_id: &str) -> Result<bool, SignalingError> {
        let mut calls = self.calls.write();
        match calls.get_mut(call_id) {
            Some(entry) if entry.record.status == CallRecordStatus::Ended => {
                entry.record.reset();
                entry.candidates.clear();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn append_candidate(
        &self,
        call_id: &str,
        candidate: &StoredIceCandidate,
    ) -> Result<(), SignalingError> {
        let mut calls = self.calls.write();
        let entry = calls.entry(call_id.to_string()).or_default();
        entry.candidates.push(candidate.clone());
        Ok(())
    }

    fn load_candidates(&self, call_id: &str) -> Result<CandidateLog, SignalingError> {
        Ok(self
            .calls
            .read()
            .get(call_id)
            .map(|e| CandidateLog {
                attempt: e.record.attempt,
                entries: e.candidates.clone(),
            })
            .unwrap_or_default())
    }
}

// ============================================================================
// TESTS
// ============================================================================
