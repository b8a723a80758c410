//! SignalingChannel - Schnittstelle zum geteilten Signaling Store
//!
//! Beide Parteien schreiben nur ihre eigenen Felder (Offer: Initiator,
//! Answer: Responder, Candidates: beide). Leser müssen jederzeit mit
//! fehlenden Feldern rechnen.

use super::record::{
    CallParticipants, SessionDescription, SignalingRecord, StoredIceCandidate,
};
use async_trait::async_trait;
use futures::stream::BoxStream;
use parking_lot::Mutex;
use std::sync::Arc;
use thiserror::Error;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SignalingError {
    #[error("Signaling storage error: {0}")]
    Storage(String),

    #[error("Invalid signaling data: {0}")]
    InvalidData(String),

    #[error("Call {0} has no offer yet")]
    NoOffer(String),

    #[error("Call {call_id} already has an {field}")]
    AlreadyWritten { call_id: String, field: &'static str },

    #[error("Participants for call {0} not found")]
    ParticipantsNotFound(String),
}

impl SignalingError {
    pub(crate) fn already_written(call_id: &str, field: &'static str) -> Self {
        SignalingError::AlreadyWritten {
            call_id: call_id.to_string(),
            field,
        }
    }
}

impl From<rusqlite::Error> for SignalingError {
    fn from(e: rusqlite::Error) -> Self {
        SignalingError::Storage(e.to_string())
    }
}

impl From<serde_json::Error> for SignalingError {
    fn from(e: serde_json::Error) -> Self {
        SignalingError::InvalidData(e.to_string())
    }
}

/// Stream eines Beobachters; Lesefehler kommen als `Err` und sind nicht fatal
pub type SignalingStream<T> = BoxStream<'static, Result<T, SignalingError>>;

// ============================================================================
// ICE CURSOR
// ============================================================================

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
struct CursorPosition {
    attempt: u64,
    delivered: usize,
}

/// Anzahl bereits ausgelieferter Candidates pro Versuch.
///
/// Gehört dem Beobachter; wer mit demselben Cursor neu abonniert,
/// bekommt keine bereits gelieferten Candidates erneut.
#[derive(Debug, Clone, Default)]
pub struct IceCursor {
    position: Arc<Mutex<CursorPosition>>,
}

impl IceCursor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn delivered(&self) -> usize {
        self.position.lock().delivered
    }

    /// Startindex für `attempt`; ein neuer Versuch beginnt bei 0
    pub(crate) fn start_for(&self, attempt: u64) -> usize {
        let mut pos = self.position.lock();
        if pos.attempt != attempt {
            tracing::debug!(
                "Candidate list reset (attempt {} -> {}), cursor restarts",
                pos.attempt,
                attempt
            );
            *pos = CursorPosition {
                attempt,
                delivered: 0,
            };
        }
        pos.delivered
    }

    /// Markiert Index `index` als geliefert, sofern noch derselbe Versuch
    pub(crate) fn mark_delivered(&self, attempt: u64, index: usize) -> bool {
        let mut pos = self.position.lock();
        if pos.attempt != attempt || index < pos.delivered {
            return false;
        }
        pos.delivered = index + 1;
        true
    }
}

// ============================================================================
// SIGNALING CHANNEL
// ============================================================================

#[async_trait]
pub trait SignalingChannel: Send + Sync {
    /// Legt den Record an oder aktualisiert Teilnehmer (Offer/Answer bleiben)
    async fn create_call_record(
        &self,
        call_id: &str,
        participants: &CallParticipants,
    ) -> Result<(), SignalingError>;

    async fn write_offer(
        &self,
        call_id: &str,
        offer: SessionDescription,
    ) -> Result<(), SignalingError>;

    /// Nur gültig wenn bereits ein Offer existiert
    async fn write_answer(
        &self,
        call_id: &str,
        answer: SessionDescription,
    ) -> Result<(), SignalingError>;

    fn observe_offer(&self, call_id: &str) -> SignalingStream<SessionDescription>;

    fn observe_answer(&self, call_id: &str) -> SignalingStream<SessionDescription>;

    /// Liefert den Record bei jeder Änderung (auch nach einem Reset)
    fn observe_record(&self, call_id: &str) -> SignalingStream<SignalingRecord>;

    async fn append_ice_candidate(
        &self,
        call_id: &str,
        candidate: StoredIceCandidate,
    ) -> Result<(), SignalingError>;

    /// Liefert jeden Candidate genau einmal pro `cursor`
    fn observe_new_ice_candidates(
        &self,
        call_id: &str,
        cursor: IceCursor,
    ) -> SignalingStream<StoredIceCandidate>;

    async fn end_call_record(&self, call_id: &str) -> Result<(), SignalingError>;

    /// Leert Offer, Answer und Candidates für einen neuen Versuch
    async fn reset_call_record(&self, call_id: &str) -> Result<(), SignalingError>;

    /// Setzt einen beendeten Record für einen neuen Call zurück.
    /// `false` wenn der Record fehlt oder nicht beendet ist.
    async fn reopen_call_record(&self, call_id: &str) -> Result<bool, SignalingError>;

    async fn load_record(&self, call_id: &str) -> Result<Option<SignalingRecord>, SignalingError>;
}

