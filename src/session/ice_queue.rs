//! Warteschlange für Remote ICE Candidates
//!
//! Candidates dürfen erst nach der Remote Description angewendet werden.
//! Alles, was vorher eintrifft, wird gehalten und danach in
//! Eingangs-Reihenfolge ausgeliefert.

use crate::signaling::IceCandidate;
use std::collections::VecDeque;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IcePush {
    /// Remote Description ist gesetzt, sofort anwenden
    ApplyNow(IceCandidate),
    Queued,
}

#[derive(Debug, Default)]
pub struct IceCandidateQueue {
    remote_ready: bool,
    pending: VecDeque<IceCandidate>,
}

impl IceCandidateQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, candidate: IceCandidate) -> IcePush {
        if self.remote_ready {
            IcePush::ApplyNow(candidate)
        } else {
            self.pending.push_back(candidate);
            IcePush::Queued
        }
    }

    /// Remote Description gesetzt; liefert die gehaltenen Candidates
    pub fn mark_remote_ready(&mut self) -> Vec<IceCandidate> {
        self.remote_ready = true;
        self.pending.drain(..).collect()
    }

    pub fn is_remote_ready(&self) -> bool {
        self.remote_ready
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Für einen neuen Verhandlungsversuch
    pub fn reset(&mut self) {
        self.remote_ready = false;
        self.pending.clear();
    }
}
