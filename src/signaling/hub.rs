//! SignalingHub - SignalingChannel über einem SignalingStore
//!
//! Schreibzugriffe gehen an den Store und erzeugen eine Änderungs-
//! Benachrichtigung. Beobachter lesen nach jeder Benachrichtigung den
//! aktuellen Stand neu und liefern nur, was sie noch nicht geliefert haben.

use super::channel::{IceCursor, SignalingChannel, SignalingError, SignalingStream};
use super::record::{
    CallParticipants, CallRecordStatus, SessionDescription, SignalingRecord, StoredIceCandidate,
};
use super::store::SignalingStore;
use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;

// ============================================================================
// CHANGE NOTIFICATIONS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChangeKind {
    Record,
    Candidates,
}

#[derive(Debug, Clone)]
struct SignalingChange {
    call_id: String,
    kind: ChangeKind,
}

/// Wartet auf die nächste relevante Änderung. `false` = Hub geschlossen.
async fn next_change(
    rx: &mut broadcast::Receiver<SignalingChange>,
    call_id: &str,
    kind: ChangeKind,
) -> bool {
    loop {
        match rx.recv().await {
            Ok(change) if change.call_id == call_id && change.kind == kind => return true,
            Ok(_) => continue,
            Err(RecvError::Lagged(skipped)) => {
                // Verpasste Benachrichtigungen: einfach neu lesen
                tracing::debug!("Signaling observer lagged by {} changes", skipped);
                return true;
            }
            Err(RecvError::Closed) => return false,
        }
    }
}

// ============================================================================
// OBSERVER STATE
// ============================================================================

type Pick<T> = fn(&SignalingRecord) -> Option<T>;

struct RecordWatch<S, T> {
    store: Arc<S>,
    rx: broadcast::Receiver<SignalingChange>,
    call_id: String,
    pick: Pick<T>,
    last: Option<T>,
    primed: bool,
}

struct CandidateWatch<S> {
    store: Arc<S>,
    rx: broadcast::Receiver<SignalingChange>,
    call_id: String,
    cursor: IceCursor,
    pending: VecDeque<(u64, usize, StoredIceCandidate)>,
    primed: bool,
}

// ============================================================================
// SIGNALING HUB
// ============================================================================

pub struct SignalingHub<S: SignalingStore> {
    store: Arc<S>,
    changes: broadcast::Sender<SignalingChange>,
}

impl<S: SignalingStore + 'static> SignalingHub<S> {
    pub fn new(store: S) -> Self {
        let (changes, _) = broadcast::channel(256);
        Self {
            store: Arc::new(store),
            changes,
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    fn notify(&self, call_id: &str, kind: ChangeKind) {
        // Kein Empfänger ist kein Fehler
        let _ = self.changes.send(SignalingChange {
            call_id: call_id.to_string(),
            kind,
        });
    }

    fn watch_record<T>(&self, call_id: &str, pick: Pick<T>) -> SignalingStream<T>
    where
        T: Clone + PartialEq + Send + 'static,
    {
        // Abonnieren vor dem ersten Lesen, damit keine Änderung verloren geht
        let state = RecordWatch {
            store: Arc::clone(&self.store),
            rx: self.changes.subscribe(),
            call_id: call_id.to_string(),
            pick,
            last: None,
            primed: false,
        };

        stream::unfold(state, |mut st| async move {
            loop {
                if st.primed && !next_change(&mut st.rx, &st.call_id, ChangeKind::Record).await {
                    return None;
                }
                st.primed = true;

                match st.store.load_record(&st.call_id) {
                    Ok(record) => {
                        let current = record.as_ref().and_then(|r| (st.pick)(r));
                        if current != st.last {
                            st.last = current.clone();
                            if let Some(value) = current {
                                return Some((Ok(value), st));
                            }
                        }
                    }
                    Err(e) => return Some((Err(e), st)),
                }
            }
        })
        .boxed()
    }
}

#[async_trait]
impl<S: SignalingStore + 'static> SignalingChannel for SignalingHub<S> {
    async fn create_call_record(
        &self,
        call_id: &str,
        participants: &CallParticipants,
    ) -> Result<(), SignalingError> {
        self.store.upsert_record(call_id, participants)?;
        tracing::debug!("Call record {} ready", call_id);
        self.notify(call_id, ChangeKind::Record);
        Ok(())
    }

    async fn write_offer(
        &self,
        call_id: &str,
        offer: SessionDescription,
    ) -> Result<(), SignalingError> {
        self.store.store_offer(call_id, &offer)?;
        tracing::info!("Offer written for call {}", call_id);
        self.notify(call_id, ChangeKind::Record);
        Ok(())
    }

    async fn write_answer(
        &self,
        call_id: &str,
        answer: SessionDescription,
    ) -> Result<(), SignalingError> {
        self.store.store_answer(call_id, &answer)?;
        tracing::info!("Answer written for call {}", call_id);
        self.notify(call_id, ChangeKind::Record);
        Ok(())
    }

    fn observe_offer(&self, call_id: &str) -> SignalingStream<SessionDescription> {
        self.watch_record(call_id, |r| r.offer.clone())
    }

    fn observe_answer(&self, call_id: &str) -> SignalingStream<SessionDescription> {
        self.watch_record(call_id, |r| r.answer.clone())
    }

    fn observe_record(&self, call_id: &str) -> SignalingStream<SignalingRecord> {
        self.watch_record(call_id, |r| Some(r.clone()))
    }

    async fn append_ice_candidate(
        &self,
        call_id: &str,
        candidate: StoredIceCandidate,
    ) -> Result<(), SignalingError> {
        self.store.append_candidate(call_id, &candidate)?;
        self.notify(call_id, ChangeKind::Candidates);
        Ok(())
    }

    fn observe_new_ice_candidates(
        &self,
        call_id: &str,
        cursor: IceCursor,
    ) -> SignalingStream<StoredIceCandidate> {
        let state = CandidateWatch {
            store: Arc::clone(&self.store),
            rx: self.changes.subscribe(),
            call_id: call_id.to_string(),
            cursor,
            pending: VecDeque::new(),
            primed: false,
        };

        stream::unfold(state, |mut st| async move {
            loop {
                while let Some((attempt, index, candidate)) = st.pending.pop_front() {
                    if st.cursor.mark_delivered(attempt, index) {
                        return Some((Ok(candidate), st));
                    }
                }

                if st.primed
                    && !next_change(&mut st.rx, &st.call_id, ChangeKind::Candidates).await
                {
                    return None;
                }
                st.primed = true;

                match st.store.load_candidates(&st.call_id) {
                    Ok(log) => {
                        let start = st.cursor.start_for(log.attempt);
                        let attempt = log.attempt;
                        st.pending.extend(
                            log.entries
                                .into_iter()
                                .enumerate()
                                .skip(start)
                                .map(|(index, c)| (attempt, index, c)),
                        );
                    }
                    Err(e) => return Some((Err(e), st)),
                }
            }
        })
        .boxed()
    }

    async fn end_call_record(&self, call_id: &str) -> Result<(), SignalingError> {
        if self.store.set_status(call_id, CallRecordStatus::Ended)? {
            tracing::info!("Call record {} marked ended", call_id);
            self.notify(call_id, ChangeKind::Record);
        } else {
            tracing::debug!("No call record {} to end", call_id);
        }
        Ok(())
    }

    async fn reset_call_record(&self, call_id: &str) -> Result<(), SignalingError> {
        self.store.reset(call_id)?;
        tracing::info!("Call record {} reset for a new attempt", call_id);
        self.notify(call_id, ChangeKind::Record);
        self.notify(call_id, ChangeKind::Candidates);
        Ok(())
    }

    async fn reopen_call_record(&self, call_id: &str) -> Result<bool, SignalingError> {
        let reopened = self.store.reopen_if_ended(call_id)?;
        if reopened {
            tracing::info!("Ended call record {} reopened for a new call", call_id);
            self.notify(call_id, ChangeKind::Record);
            self.notify(call_id, ChangeKind::Candidates);
        }
        Ok(reopened)
    }

    async fn load_record(&self, call_id: &str) -> Result<Option<SignalingRecord>, SignalingError> {
        self.store.load_record(call_id)
    }
}

// ============================================================================
// TESTS
// ============================================================================
