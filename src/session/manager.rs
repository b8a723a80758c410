//! CallSessionManager - Orchestrierung einer Call Session
//!
//! Besitzt den Lebenszyklus der Peer Connection und die Verhandlung:
//! - Initiator: Offer erzeugen → Local Description → Offer schreiben → Answer abwarten
//! - Responder: Offer abwarten → Remote Description → Answer erzeugen → Answer schreiben
//! - Beide: lokale Candidates veröffentlichen, Remote Candidates erst nach der
//!   Remote Description anwenden
//!
//! Jeder Versuch hat eine Nummer. `end_call` und neue Versuche erhöhen sie;
//! Hintergrund-Tasks eines alten Versuchs ändern danach nichts mehr.

use super::error::CallError;
use super::ice_queue::{IceCandidateQueue, IcePush};
use super::quality::{ConnectionQuality, QualityInputs, QualityMonitor};
use super::rejoin::{RejoinCoordinator, SinkTarget, SinkTargets};
use super::resources::SessionResources;
use super::state::{CallEvent, CallSnapshot, CallStatus, Role};
use crate::config::CallConfig;
use crate::media::{
    is_sink_healthy, BindOptions, BindOutcome, MediaAcquisitionError, MediaBinder,
    MediaDevices, MediaStream, PermissionGate, PlaybackError, RenderSink, TrackKind,
    VideoConstraints,
};
use crate::peer::{PeerConnection, PeerConnectionFactory, PeerError, PeerEvent, PeerState};
use crate::signaling::{
    IceCandidate, IceCursor, ParticipantDirectory, SessionDescription, SignalingChannel,
    SignalingRecord, StoredIceCandidate,
};
use chrono::Utc;
use futures::StreamExt;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::{broadcast, mpsc, watch, Mutex as AsyncMutex};
use tokio::task::JoinHandle;

// ============================================================================
// DEPENDENCIES
// ============================================================================

/// Kollaborateure einer Session
pub struct SessionDeps {
    pub signaling: Arc<dyn SignalingChannel>,
    pub devices: Arc<dyn MediaDevices>,
    pub permissions: Arc<dyn PermissionGate>,
    pub peers: Arc<dyn PeerConnectionFactory>,
    /// Optional: legt beim Initiator den Call Record mit Teilnehmern an
    pub directory: Option<Arc<dyn ParticipantDirectory>>,
    pub local_sink: Arc<dyn RenderSink>,
    pub remote_sink: Arc<dyn RenderSink>,
}

// ============================================================================
// ACTIVE CALL
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NegotiationStep {
    SendOffer,
    ApplyAnswer,
    AnswerOffer,
}

type SharedIceQueue = Arc<AsyncMutex<IceCandidateQueue>>;

/// Wann `begin` einen neuen Versuch starten darf
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Claim {
    /// Nur ohne laufenden Call
    Idle,
    /// Ersetzt jeden laufenden Versuch (Rejoin)
    Replace,
    /// Ersetzt nur diesen Versuch, sofern er noch aktuell ist
    Successor(u64),
}

struct ActiveCall {
    call_id: String,
    attempt: u64,
    resources: SessionResources,
    ice_queue: SharedIceQueue,
    /// Gescheiterter SDP-Schritt, einmal manuell wiederholbar
    pending_retry: Option<NegotiationStep>,
    retry_used: bool,
}

struct SessionInner {
    config: CallConfig,
    deps: SessionDeps,
    binder: MediaBinder,
    quality: QualityMonitor,
    rejoin: RejoinCoordinator,
    active: Mutex<Option<ActiveCall>>,
    attempt: AtomicU64,
    state_tx: watch::Sender<CallSnapshot>,
    event_tx: broadcast::Sender<CallEvent>,
    weak: Weak<SessionInner>,
}

// ============================================================================
// CALL SESSION MANAGER
// ============================================================================

/// Eine Instanz pro Call; nach `end_call` verwerfen
pub struct CallSessionManager {
    inner: Arc<SessionInner>,
}

impl CallSessionManager {
    pub fn new(config: CallConfig, deps: SessionDeps) -> Self {
        let inner = Arc::new_cyclic(|weak: &Weak<SessionInner>| {
            let hook_target = weak.clone();
            let binder = MediaBinder::with_degraded_hook(config.binder.clone(), move |sink_id, error| {
                if let Some(inner) = hook_target.upgrade() {
                    inner.on_playback_degraded(sink_id, error);
                }
            });
            let (state_tx, _) = watch::channel(CallSnapshot::idle());
            let (event_tx, _) = broadcast::channel(100);

            SessionInner {
                quality: QualityMonitor::new(config.quality.clone()),
                rejoin: RejoinCoordinator::new(config.rejoin.clone(), binder.clone()),
                binder,
                config,
                deps,
                active: Mutex::new(None),
                attempt: AtomicU64::new(0),
                state_tx,
                event_tx,
                weak: weak.clone(),
            }
        });

        Self { inner }
    }

    /// Startet einen Call: Media holen, Peer aufbauen, verhandeln
    pub async fn initialize_call(&self, call_id: &str, role: Role) -> Result<(), CallError> {
        let call_id = validate_call_id(call_id)?;
        let attempt = self.inner.begin(&call_id, role, CallStatus::AcquiringMedia, Claim::Idle)?;
        tracing::info!("Initializing call {} as {}", call_id, role);

        // Gleiche callId wie ein bereits beendeter Call: Record frisch starten
        if let Err(e) = self.inner.deps.signaling.reopen_call_record(&call_id).await {
            let error = CallError::SignalingWrite(e);
            self.inner.fail_attempt(attempt, error.clone()).await;
            return Err(error);
        }
        self.inner.ensure_current(attempt)?;

        self.inner.run_attempt(&call_id, role, attempt).await
    }

    /// Wie `initialize_call`, aber setzt vorher den Signaling Record zurück
    pub async fn rejoin_call(&self, call_id: &str, role: Role) -> Result<(), CallError> {
        self.inner.rejoin_call(call_id, role).await
    }

    /// Beendet den Call; zweiter Aufruf ist ein No-op
    pub async fn end_call(&self) {
        self.inner.end_call().await
    }

    /// Liefert den neuen Zustand, `None` ohne lokalen Video Track
    pub fn toggle_video(&self) -> Option<bool> {
        self.inner.toggle(TrackKind::Video)
    }

    pub fn toggle_audio(&self) -> Option<bool> {
        self.inner.toggle(TrackKind::Audio)
    }

    /// Reduziert lokale Video-Constraints auf das Low-Bandwidth-Profil
    pub fn optimize_for_network(&self) -> Option<VideoConstraints> {
        let stream = self.inner.state_tx.borrow().local_stream.clone()?;
        let video = stream.tracks_of(TrackKind::Video);
        if video.is_empty() {
            return None;
        }

        let constraints = VideoConstraints::low_bandwidth();
        for track in &video {
            track.apply_constraints(constraints);
        }
        tracing::info!(
            "Optimized video for network: {}x{}@{}",
            constraints.width,
            constraints.height,
            constraints.frame_rate
        );
        Some(constraints)
    }

    /// Wiederholt den zuletzt gescheiterten SDP-Schritt (einmal pro Versuch)
    pub async fn retry_negotiation(&self) -> Result<(), CallError> {
        self.inner.retry_negotiation().await
    }

    /// Beobachtbarer Call-Zustand
    pub fn state(&self) -> watch::Receiver<CallSnapshot> {
        self.inner.state_tx.subscribe()
    }

    pub fn snapshot(&self) -> CallSnapshot {
        self.inner.state_tx.borrow().clone()
    }

    /// Gibt einen Event-Receiver zurück
    pub fn subscribe(&self) -> broadcast::Receiver<CallEvent> {
        self.inner.event_tx.subscribe()
    }

    pub fn config(&self) -> &CallConfig {
        &self.inner.config
    }
}

impl std::fmt::Debug for CallSessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let snapshot = self.inner.state_tx.borrow();
        f.debug_struct("CallSessionManager")
            .field("call_id", &snapshot.call_id)
            .field("status", &snapshot.status)
            .field("attempt", &self.inner.attempt.load(Ordering::SeqCst))
            .finish()
    }
}

fn validate_call_id(call_id: &str) -> Result<String, CallError> {
    let call_id = call_id.trim();
    if call_id.is_empty() {
        return Err(CallError::InvalidCallId);
    }
    Ok(call_id.to_string())
}

// ============================================================================
// STATE HANDLING
// ============================================================================

impl SessionInner {
    fn is_current(&self, attempt: u64) -> bool {
        self.attempt.load(Ordering::SeqCst) == attempt
    }

    fn ensure_current(&self, attempt: u64) -> Result<(), CallError> {
        if self.is_current(attempt) {
            Ok(())
        } else {
            tracing::debug!("Attempt {} superseded", attempt);
            Err(CallError::Cancelled)
        }
    }

    fn emit(&self, event: CallEvent) {
        // Kein Empfänger ist kein Fehler
        let _ = self.event_tx.send(event);
    }

    /// Startet einen neuen Versuch und liefert dessen Nummer
    fn begin(
        &self,
        call_id: &str,
        role: Role,
        status: CallStatus,
        claim: Claim,
    ) -> Result<u64, CallError> {
        let mut attempt = 0;
        let mut refused = None;

        let claimed = self.state_tx.send_if_modified(|snap| {
            match claim {
                Claim::Idle if snap.status.is_busy() => {
                    refused = Some(CallError::AlreadyInCall(
                        snap.call_id.clone().unwrap_or_default(),
                    ));
                    return false;
                }
                Claim::Successor(previous) if !self.is_current(previous) => {
                    refused = Some(CallError::Cancelled);
                    return false;
                }
                _ => {}
            }
            attempt = self.attempt.fetch_add(1, Ordering::SeqCst) + 1;
            *snap = CallSnapshot {
                call_id: Some(call_id.to_string()),
                role: Some(role),
                status,
                ..CallSnapshot::idle()
            };
            true
        });

        if !claimed {
            return Err(refused.unwrap_or(CallError::Cancelled));
        }

        tracing::info!("Call state: {:?} (attempt {})", status, attempt);
        self.emit(CallEvent::StateChanged(status));
        Ok(attempt)
    }

    /// Ändert den Snapshot, sofern `attempt` noch aktuell ist
    fn update<F>(&self, attempt: u64, f: F) -> bool
    where
        F: FnOnce(&mut CallSnapshot),
    {
        let mut changed = None;
        let applied = self.state_tx.send_if_modified(|snap| {
            if !self.is_current(attempt) {
                return false;
            }
            let before = snap.status;
            f(snap);
            if snap.status != before {
                changed = Some(snap.status);
            }
            true
        });

        if let Some(status) = changed {
            tracing::info!("Call state: {:?}", status);
            self.emit(CallEvent::StateChanged(status));
        }
        applied
    }

    /// Versuch ungültig machen und nach `Ended` wechseln
    fn conclude(&self, only_attempt: Option<u64>, error: Option<CallError>) -> bool {
        let mut entered_ended = false;
        let applied = self.state_tx.send_if_modified(|snap| {
            if let Some(attempt) = only_attempt {
                if !self.is_current(attempt) {
                    return false;
                }
            }
            self.attempt.fetch_add(1, Ordering::SeqCst);

            entered_ended = snap.status != CallStatus::Ended;
            snap.status = CallStatus::Ended;
            snap.local_stream = None;
            snap.remote_stream = None;
            snap.quality = ConnectionQuality::Disconnected;
            snap.error = error;
            true
        });

        if entered_ended {
            tracing::info!("Call state: {:?}", CallStatus::Ended);
            self.emit(CallEvent::StateChanged(CallStatus::Ended));
        }
        applied
    }

    fn take_active(&self, attempt: u64) -> Option<ActiveCall> {
        let mut active = self.active.lock();
        if active.as_ref().map(|a| a.attempt == attempt).unwrap_or(false) {
            active.take()
        } else {
            None
        }
    }

    /// Task gehört zum Versuch und wird mit ihm abgebrochen
    fn track_task(&self, attempt: u64, task: JoinHandle<()>) {
        let mut active = self.active.lock();
        match active.as_mut().filter(|a| a.attempt == attempt) {
            Some(call) => call.resources.track(task),
            None => task.abort(),
        }
    }

    fn negotiation_handles(
        &self,
        attempt: u64,
    ) -> Result<(Arc<dyn PeerConnection>, SharedIceQueue), CallError> {
        let active = self.active.lock();
        let call = active
            .as_ref()
            .filter(|a| a.attempt == attempt)
            .ok_or(CallError::Cancelled)?;
        let peer = call.resources.peer().ok_or(CallError::Cancelled)?;
        Ok((peer, Arc::clone(&call.ice_queue)))
    }

    async fn release_active(&self, active: ActiveCall) {
        tracing::debug!(
            "Releasing call {} (attempt {})",
            active.call_id,
            active.attempt
        );
        self.quality.stop();
        self.binder.unbind(&self.deps.local_sink);
        self.binder.unbind(&self.deps.remote_sink);
        active.resources.release().await;
    }
}

// ============================================================================
// LIFECYCLE
// ============================================================================

impl SessionInner {
    async fn run_attempt(&self, call_id: &str, role: Role, attempt: u64) -> Result<(), CallError> {
        let result = self.establish(call_id, role, attempt).await;
        if let Err(error) = &result {
            if error.is_fatal() {
                self.fail_attempt(attempt, error.clone()).await;
            }
        }
        result
    }

    async fn establish(&self, call_id: &str, role: Role, attempt: u64) -> Result<(), CallError> {
        self.update(attempt, |s| s.status = CallStatus::AcquiringMedia);

        if !self.deps.permissions.has_media_permissions() {
            return Err(MediaAcquisitionError::PermissionDenied.into());
        }
        let local_stream = self.deps.devices.get_user_media(&self.config.media).await?;

        // Ab hier gibt der Guard Stream und Peer auf jedem Fehlerpfad frei
        let mut resources = SessionResources::new(local_stream.clone());
        self.ensure_current(attempt)?;
        tracing::debug!(
            "Local media acquired ({} track(s))",
            local_stream.tracks().len()
        );

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let peer = self
            .deps
            .peers
            .create(&self.config.ice_servers, events_tx)
            .await
            .map_err(CallError::Peer)?;
        resources.set_peer(Arc::clone(&peer));

        for track in local_stream.tracks() {
            peer.add_local_track(&track, local_stream.id())
                .await
                .map_err(CallError::Peer)?;
        }
        self.ensure_current(attempt)?;

        let ice_queue: SharedIceQueue = Arc::new(AsyncMutex::new(IceCandidateQueue::new()));
        resources.track(tokio::spawn(peer_event_loop(
            self.weak.clone(),
            attempt,
            call_id.to_string(),
            role,
            events_rx,
        )));
        resources.track(tokio::spawn(remote_candidate_loop(
            self.weak.clone(),
            call_id.to_string(),
            role,
            Arc::clone(&peer),
            Arc::clone(&ice_queue),
        )));

        {
            let mut active = self.active.lock();
            if !self.is_current(attempt) {
                return Err(CallError::Cancelled);
            }
            *active = Some(ActiveCall {
                call_id: call_id.to_string(),
                attempt,
                resources,
                ice_queue,
                pending_retry: None,
                retry_used: false,
            });
        }

        self.update(attempt, |s| {
            s.status = CallStatus::Negotiating;
            s.local_stream = Some(local_stream.clone());
        });
        self.spawn_bind(attempt, Arc::clone(&self.deps.local_sink), local_stream);

        match role {
            Role::Initiator => {
                self.register_participants(call_id).await;
                self.track_task(
                    attempt,
                    tokio::spawn(answer_watch_loop(
                        self.weak.clone(),
                        attempt,
                        call_id.to_string(),
                    )),
                );
                self.send_offer(attempt, call_id, &peer).await
            }
            Role::Responder => {
                tracing::info!("Waiting for offer on call {}", call_id);
                self.track_task(
                    attempt,
                    tokio::spawn(offer_watch_loop(
                        self.weak.clone(),
                        attempt,
                        call_id.to_string(),
                    )),
                );
                Ok(())
            }
        }
    }

    async fn rejoin_call(&self, call_id: &str, role: Role) -> Result<(), CallError> {
        let call_id = validate_call_id(call_id)?;
        self.rejoin.cancel();

        // Laufenden Versuch verwerfen, ohne den Record als beendet zu markieren
        let previous = self.active.lock().take();
        let attempt = self.begin(&call_id, role, CallStatus::Reconnecting, Claim::Replace)?;
        if let Some(previous) = previous {
            self.release_active(previous).await;
        }
        tracing::info!("Rejoining call {} as {}", call_id, role);

        if let Err(e) = self
            .rejoin
            .reset_signaling(self.deps.signaling.as_ref(), &call_id)
            .await
        {
            let error = CallError::SignalingWrite(e);
            self.fail_attempt(attempt, error.clone()).await;
            return Err(error);
        }
        self.ensure_current(attempt)?;

        self.run_attempt(&call_id, role, attempt).await?;
        self.spawn_verification(attempt);
        Ok(())
    }

    /// Die Gegenseite hat den Record zurückgesetzt: neuer Versuch mit neuem
    /// Peer, der Record selbst bleibt unangetastet
    async fn renegotiate(&self, previous: u64, call_id: &str, role: Role) -> Result<(), CallError> {
        let attempt = self.begin(call_id, role, CallStatus::Reconnecting, Claim::Successor(previous))?;
        if let Some(active) = self.take_active(previous) {
            self.release_active(active).await;
        }
        tracing::info!("Renegotiating call {} as {} after remote reset", call_id, role);

        self.run_attempt(call_id, role, attempt).await?;
        self.spawn_verification(attempt);
        Ok(())
    }

    fn spawn_renegotiation(&self, previous: u64, call_id: String, role: Role) {
        // Eigener Task: die Freigabe bricht den auslösenden Task ab
        let weak = self.weak.clone();
        tokio::spawn(async move {
            let Some(inner) = weak.upgrade() else {
                return;
            };
            match inner.renegotiate(previous, &call_id, role).await {
                Ok(()) | Err(CallError::Cancelled) => {}
                Err(e) => tracing::warn!("Renegotiation for call {} failed: {}", call_id, e),
            }
        });
    }

    async fn end_call(&self) {
        self.rejoin.cancel();

        let active = self.active.lock().take();
        let (status, known_call_id) = {
            let snapshot = self.state_tx.borrow();
            (snapshot.status, snapshot.call_id.clone())
        };
        if active.is_none() && status == CallStatus::Ended {
            tracing::debug!("end_call: call already ended");
            return;
        }

        let call_id = active
            .as_ref()
            .map(|a| a.call_id.clone())
            .or(known_call_id);

        self.conclude(None, None);
        match active {
            Some(active) => self.release_active(active).await,
            None => {
                self.quality.stop();
                self.binder.unbind(&self.deps.local_sink);
                self.binder.unbind(&self.deps.remote_sink);
            }
        }

        if let Some(call_id) = call_id {
            if let Err(e) = self.deps.signaling.end_call_record(&call_id).await {
                tracing::warn!("Failed to mark call {} ended: {}", call_id, e);
            }
            tracing::info!("Call {} ended", call_id);
        }
    }

    /// Fataler Fehler: Ressourcen freigeben, `Ended` mit Fehler
    async fn fail_attempt(&self, attempt: u64, error: CallError) {
        let active = self.take_active(attempt);
        let concluded = self.conclude(Some(attempt), Some(error.clone()));

        if let Some(active) = active {
            self.release_active(active).await;
        }
        if concluded {
            tracing::error!("Call attempt failed: {}", error);
            self.emit(CallEvent::Error(error));
        }
    }

    /// Verbundener Call ist ohne `end_call` abgebrochen
    async fn handle_unexpected_end(&self, attempt: u64, call_id: String, role: Role, state: PeerState) {
        let Some(active) = self.take_active(attempt) else {
            return;
        };

        let error = CallError::Peer(PeerError::WebRTC(format!("peer connection {:?}", state)));
        let concluded = self.conclude(Some(attempt), Some(error.clone()));
        self.release_active(active).await;
        if !concluded {
            return;
        }
        self.emit(CallEvent::Error(error));

        if !self.config.rejoin.auto_rejoin {
            tracing::info!("Auto-rejoin disabled, call {} stays ended", call_id);
            return;
        }

        tracing::info!("Auto-rejoining call {}", call_id);
        if let Err(e) = self.rejoin_call(&call_id, role).await {
            tracing::warn!("Auto-rejoin for call {} failed: {}", call_id, e);
        }
    }

    fn toggle(&self, kind: TrackKind) -> Option<bool> {
        let stream = self.state_tx.borrow().local_stream.clone()?;
        let tracks = stream.tracks_of(kind);
        let enabled = !tracks.first()?.is_enabled();

        for track in &tracks {
            track.set_enabled(enabled);
        }
        tracing::info!(
            "Local {} {}",
            kind.as_str(),
            if enabled { "enabled" } else { "disabled" }
        );
        Some(enabled)
    }

    async fn register_participants(&self, call_id: &str) {
        let Some(directory) = &self.deps.directory else {
            return;
        };

        match directory.get_call_participants(call_id).await {
            Ok(participants) => {
                if let Err(e) = self
                    .deps
                    .signaling
                    .create_call_record(call_id, &participants)
                    .await
                {
                    tracing::warn!("Failed to create call record {}: {}", call_id, e);
                }
            }
            Err(e) => tracing::warn!("Participant lookup for call {} failed: {}", call_id, e),
        }
    }
}

// ============================================================================
// NEGOTIATION
// ============================================================================

impl SessionInner {
    async fn send_offer(
        &self,
        attempt: u64,
        call_id: &str,
        peer: &Arc<dyn PeerConnection>,
    ) -> Result<(), CallError> {
        let step = NegotiationStep::SendOffer;
        let offer = peer
            .create_offer()
            .await
            .map_err(|e| self.negotiation_failed(attempt, step, e))?;
        peer.set_local_description(offer.clone())
            .await
            .map_err(|e| self.negotiation_failed(attempt, step, e))?;
        self.ensure_current(attempt)?;

        self.deps
            .signaling
            .write_offer(call_id, offer.clone())
            .await
            .map_err(CallError::SignalingWrite)?;
        tracing::info!("Offer sent for call {}", call_id);
        self.guard_description(attempt, call_id, Role::Initiator, offer);
        Ok(())
    }

    async fn apply_answer(
        &self,
        attempt: u64,
        call_id: &str,
        answer: SessionDescription,
    ) -> Result<(), CallError> {
        let (peer, queue) = self.negotiation_handles(attempt)?;
        apply_remote_description(&peer, &queue, answer)
            .await
            .map_err(|e| self.negotiation_failed(attempt, NegotiationStep::ApplyAnswer, e))?;
        tracing::info!("Answer applied for call {}", call_id);
        Ok(())
    }

    async fn answer_offer(
        &self,
        attempt: u64,
        call_id: &str,
        offer: SessionDescription,
    ) -> Result<(), CallError> {
        let step = NegotiationStep::AnswerOffer;
        let (peer, queue) = self.negotiation_handles(attempt)?;

        apply_remote_description(&peer, &queue, offer)
            .await
            .map_err(|e| self.negotiation_failed(attempt, step, e))?;
        let answer = peer
            .create_answer()
            .await
            .map_err(|e| self.negotiation_failed(attempt, step, e))?;
        peer.set_local_description(answer.clone())
            .await
            .map_err(|e| self.negotiation_failed(attempt, step, e))?;
        self.ensure_current(attempt)?;

        self.deps
            .signaling
            .write_answer(call_id, answer.clone())
            .await
            .map_err(CallError::SignalingWrite)?;
        tracing::info!("Answer sent for call {}", call_id);
        self.guard_description(attempt, call_id, Role::Responder, answer);
        Ok(())
    }

    fn guard_description(
        &self,
        attempt: u64,
        call_id: &str,
        role: Role,
        written: SessionDescription,
    ) {
        self.track_task(
            attempt,
            tokio::spawn(description_guard_loop(
                self.weak.clone(),
                attempt,
                call_id.to_string(),
                role,
                written,
            )),
        );
    }

    /// SDP-Fehler: melden, Status bleibt `Negotiating`
    fn negotiation_failed(&self, attempt: u64, step: NegotiationStep, e: PeerError) -> CallError {
        let error = CallError::Negotiation(e);
        tracing::warn!("Negotiation step {:?} failed: {}", step, error);

        if let Some(call) = self.active.lock().as_mut().filter(|a| a.attempt == attempt) {
            call.pending_retry = Some(step);
        }
        if self.update(attempt, |s| s.error = Some(error.clone())) {
            self.emit(CallEvent::Error(error.clone()));
        }
        error
    }

    async fn retry_negotiation(&self) -> Result<(), CallError> {
        let (attempt, call_id, step) = {
            let mut active = self.active.lock();
            let call = active.as_mut().ok_or(CallError::NoActiveCall)?;
            let step = match call.pending_retry.take() {
                Some(step) if !call.retry_used => step,
                _ => return Err(CallError::RetryUnavailable),
            };
            call.retry_used = true;
            (call.attempt, call.call_id.clone(), step)
        };

        tracing::info!("Retrying negotiation step {:?} for call {}", step, call_id);
        self.update(attempt, |s| s.error = None);

        let result = match step {
            NegotiationStep::SendOffer => {
                let (peer, _) = self.negotiation_handles(attempt)?;
                self.send_offer(attempt, &call_id, &peer).await
            }
            NegotiationStep::ApplyAnswer => {
                let answer = self.stored_description(&call_id, |r| r.answer).await?;
                self.apply_answer(attempt, &call_id, answer).await
            }
            NegotiationStep::AnswerOffer => {
                let offer = self.stored_description(&call_id, |r| r.offer).await?;
                self.answer_offer(attempt, &call_id, offer).await
            }
        };

        if let Err(error) = &result {
            if error.is_fatal() {
                self.fail_attempt(attempt, error.clone()).await;
            }
        }
        result
    }

    async fn stored_description<F>(
        &self,
        call_id: &str,
        pick: F,
    ) -> Result<SessionDescription, CallError>
    where
        F: FnOnce(SignalingRecord) -> Option<SessionDescription>,
    {
        match self.deps.signaling.load_record(call_id).await {
            Ok(record) => record.and_then(pick).ok_or(CallError::RetryUnavailable),
            Err(e) => {
                tracing::warn!("Failed to read call record {}: {}", call_id, e);
                Err(CallError::RetryUnavailable)
            }
        }
    }

    /// Fatale Fehler aus Hintergrund-Tasks; die Freigabe läuft als eigener
    /// Task, da sie den aufrufenden Task abbricht
    fn handle_task_result(&self, attempt: u64, result: Result<(), CallError>) {
        match result {
            Err(error) if error.is_fatal() => {
                let weak = self.weak.clone();
                tokio::spawn(async move {
                    if let Some(inner) = weak.upgrade() {
                        inner.fail_attempt(attempt, error).await;
                    }
                });
            }
            Err(CallError::Cancelled) | Ok(()) => {}
            Err(error) => tracing::debug!("Negotiation left pending: {}", error),
        }
    }
}

async fn apply_remote_description(
    peer: &Arc<dyn PeerConnection>,
    queue: &SharedIceQueue,
    description: SessionDescription,
) -> Result<(), PeerError> {
    // Queue bleibt gesperrt, bis alle gehaltenen Candidates angewendet sind
    let mut queue = queue.lock().await;
    peer.set_remote_description(description).await?;

    let pending = queue.mark_remote_ready();
    if !pending.is_empty() {
        tracing::debug!("Applying {} queued ICE candidate(s)", pending.len());
    }
    for candidate in pending {
        if let Err(e) = peer.add_ice_candidate(candidate).await {
            tracing::warn!("Failed to apply queued ICE candidate: {}", e);
        }
    }
    Ok(())
}

async fn apply_remote_candidate(
    peer: &Arc<dyn PeerConnection>,
    queue: &SharedIceQueue,
    candidate: IceCandidate,
) {
    let mut queue = queue.lock().await;
    match queue.push(candidate) {
        IcePush::ApplyNow(candidate) => {
            if let Err(e) = peer.add_ice_candidate(candidate).await {
                tracing::warn!("Failed to apply remote ICE candidate: {}", e);
            }
        }
        IcePush::Queued => tracing::debug!(
            "Remote description not set, queued ICE candidate ({} pending)",
            queue.len()
        ),
    }
}

// ============================================================================
// MEDIA / QUALITY
// ============================================================================

impl SessionInner {
    fn spawn_bind(&self, attempt: u64, sink: Arc<dyn RenderSink>, stream: MediaStream) {
        let binder = self.binder.clone();
        let weak = self.weak.clone();
        let task = tokio::spawn(async move {
            match binder.bind(&sink, &stream, BindOptions::default()).await {
                BindOutcome::Playing => {
                    if let Some(inner) = weak.upgrade() {
                        inner.quality.clear_degraded(sink.id());
                    }
                }
                outcome => tracing::debug!("Bind on sink {} finished: {:?}", sink.id(), outcome),
            }
        });
        self.track_task(attempt, task);
    }

    fn on_remote_stream(&self, attempt: u64, stream: MediaStream) {
        let known = self
            .state_tx
            .borrow()
            .remote_stream
            .as_ref()
            .map(|current| current.same_as(&stream))
            .unwrap_or(false);
        if known {
            return;
        }

        tracing::info!("Remote stream {} received", stream.id());
        let mut entered_connected = false;
        let mut has_local = false;
        let applied = self.update(attempt, |s| {
            s.remote_stream = Some(stream.clone());
            has_local = s.local_stream.is_some();
            if s.status != CallStatus::Connected {
                entered_connected = true;
                s.status = CallStatus::Connected;
                s.started_at = Some(Utc::now());
                s.duration_secs = 0;
                s.error = None;
            }
        });
        if !applied {
            return;
        }

        self.spawn_bind(attempt, Arc::clone(&self.deps.remote_sink), stream);
        if entered_connected && has_local {
            self.start_monitoring(attempt);
        }
    }

    fn start_monitoring(&self, attempt: u64) {
        let tick_target = self.weak.clone();
        self.quality.start_duration(move |secs| {
            if let Some(inner) = tick_target.upgrade() {
                inner.update(attempt, |s| s.duration_secs = secs);
            }
        });

        let inputs_target = self.weak.clone();
        let sample_target = self.weak.clone();
        self.quality.start_sampling(
            move || {
                inputs_target
                    .upgrade()
                    .map(|inner| inner.quality_inputs())
                    .unwrap_or_default()
            },
            move |quality| {
                if let Some(inner) = sample_target.upgrade() {
                    inner.on_quality(attempt, quality);
                }
            },
        );
    }

    fn quality_inputs(&self) -> QualityInputs {
        let has_session = self.active.lock().is_some();
        let snapshot = self.state_tx.borrow();
        let playing = |sink: &Arc<dyn RenderSink>, stream: &Option<MediaStream>| {
            stream
                .as_ref()
                .map(|s| is_sink_healthy(sink.as_ref(), s))
                .unwrap_or(false)
        };

        QualityInputs {
            has_session,
            has_local_stream: snapshot.local_stream.is_some(),
            has_remote_stream: snapshot.remote_stream.is_some(),
            local_playing: playing(&self.deps.local_sink, &snapshot.local_stream),
            remote_playing: playing(&self.deps.remote_sink, &snapshot.remote_stream),
            degraded: self.quality.is_degraded(),
        }
    }

    fn on_quality(&self, attempt: u64, quality: ConnectionQuality) {
        let mut changed = false;
        self.update(attempt, |s| {
            if s.quality != quality {
                s.quality = quality;
                changed = true;
            }
        });
        if changed {
            tracing::debug!("Connection quality: {:?}", quality);
            self.emit(CallEvent::QualityChanged(quality));
        }
    }

    fn on_playback_degraded(&self, sink_id: &str, error: &PlaybackError) {
        self.quality.note_degraded(sink_id);
        self.emit(CallEvent::PlaybackDegraded {
            sink_id: sink_id.to_string(),
            error: error.clone(),
        });
    }

    fn on_peer_state(&self, attempt: u64, call_id: &str, role: Role, state: PeerState) {
        tracing::debug!("Peer connection state: {:?}", state);
        if !state.is_terminal() {
            return;
        }

        let status = self.state_tx.borrow().status;
        if status != CallStatus::Connected {
            tracing::warn!("Peer connection {:?} before media was established", state);
            return;
        }

        tracing::warn!("Call {} dropped unexpectedly ({:?})", call_id, state);
        let weak = self.weak.clone();
        let call_id = call_id.to_string();
        tokio::spawn(async move {
            if let Some(inner) = weak.upgrade() {
                inner.handle_unexpected_end(attempt, call_id, role, state).await;
            }
        });
    }

    fn spawn_verification(&self, attempt: u64) {
        let targets_source = self.weak.clone();
        let recovered_target = self.weak.clone();
        let done_target = self.weak.clone();
        let local_sink = Arc::clone(&self.deps.local_sink);
        let remote_sink = Arc::clone(&self.deps.remote_sink);

        self.rejoin.spawn_verification(
            move || {
                let inner = targets_source.upgrade()?;
                if !inner.is_current(attempt) {
                    return None;
                }
                let snapshot = inner.state_tx.borrow();
                Some(SinkTargets {
                    local: SinkTarget {
                        sink: Arc::clone(&local_sink),
                        stream: snapshot.local_stream.clone(),
                    },
                    remote: SinkTarget {
                        sink: Arc::clone(&remote_sink),
                        stream: snapshot.remote_stream.clone(),
                    },
                })
            },
            move |sink_id| {
                if let Some(inner) = recovered_target.upgrade() {
                    inner.quality.clear_degraded(sink_id);
                }
            },
            move |outcome| {
                if let Some(inner) = done_target.upgrade() {
                    inner.emit(CallEvent::RejoinVerification(outcome));
                }
            },
        );
    }
}

// ============================================================================
// BACKGROUND TASKS
// ============================================================================

async fn peer_event_loop(
    weak: Weak<SessionInner>,
    attempt: u64,
    call_id: String,
    role: Role,
    mut events: mpsc::UnboundedReceiver<PeerEvent>,
) {
    while let Some(event) = events.recv().await {
        let Some(inner) = weak.upgrade() else {
            return;
        };
        if !inner.is_current(attempt) {
            return;
        }

        match event {
            PeerEvent::LocalCandidate(candidate) => {
                let stored = StoredIceCandidate::new(candidate, role);
                if let Err(e) = inner.deps.signaling.append_ice_candidate(&call_id, stored).await {
                    tracing::warn!("Failed to publish local ICE candidate: {}", e);
                }
            }
            PeerEvent::RemoteTrack(stream) => inner.on_remote_stream(attempt, stream),
            PeerEvent::StateChanged(state) => inner.on_peer_state(attempt, &call_id, role, state),
        }
    }
}

async fn remote_candidate_loop(
    weak: Weak<SessionInner>,
    call_id: String,
    role: Role,
    peer: Arc<dyn PeerConnection>,
    queue: SharedIceQueue,
) {
    let Some(mut candidates) = weak.upgrade().map(|inner| {
        inner
            .deps
            .signaling
            .observe_new_ice_candidates(&call_id, IceCursor::new())
    }) else {
        return;
    };

    while let Some(item) = candidates.next().await {
        match item {
            Ok(stored) if !stored.is_remote_for(role) => continue,
            Ok(stored) => apply_remote_candidate(&peer, &queue, stored.candidate).await,
            Err(e) => tracing::warn!("Failed to read ICE candidates for call {}: {}", call_id, e),
        }
    }
}

async fn answer_watch_loop(weak: Weak<SessionInner>, attempt: u64, call_id: String) {
    let Some(mut answers) = weak
        .upgrade()
        .map(|inner| inner.deps.signaling.observe_answer(&call_id))
    else {
        return;
    };

    while let Some(item) = answers.next().await {
        let Some(inner) = weak.upgrade() else {
            return;
        };
        match item {
            Ok(answer) => {
                let result = inner.apply_answer(attempt, &call_id, answer).await;
                inner.handle_task_result(attempt, result);
                return;
            }
            Err(e) => tracing::warn!("Failed to read answer for call {}: {}", call_id, e),
        }
    }
}

/// Verschwindet die eigene Description aus dem Record (Reset durch die
/// Gegenseite), wartet niemand mehr auf sie: neu verhandeln.
async fn description_guard_loop(
    weak: Weak<SessionInner>,
    attempt: u64,
    call_id: String,
    role: Role,
    written: SessionDescription,
) {
    let Some(mut records) = weak
        .upgrade()
        .map(|inner| inner.deps.signaling.observe_record(&call_id))
    else {
        return;
    };

    while let Some(item) = records.next().await {
        let record = match item {
            Ok(record) => record,
            Err(e) => {
                tracing::warn!("Failed to read call record {}: {}", call_id, e);
                continue;
            }
        };
        let own = match role {
            Role::Initiator => record.offer.as_ref(),
            Role::Responder => record.answer.as_ref(),
        };
        if own == Some(&written) {
            continue;
        }

        let Some(inner) = weak.upgrade() else {
            return;
        };
        tracing::info!(
            "Call record {} was reset by the other party (record attempt {})",
            call_id,
            record.attempt
        );
        inner.spawn_renegotiation(attempt, call_id, role);
        return;
    }
}

async fn offer_watch_loop(weak: Weak<SessionInner>, attempt: u64, call_id: String) {
    let Some(mut offers) = weak
        .upgrade()
        .map(|inner| inner.deps.signaling.observe_offer(&call_id))
    else {
        return;
    };

    while let Some(item) = offers.next().await {
        let Some(inner) = weak.upgrade() else {
            return;
        };
        match item {
            Ok(offer) => {
                tracing::info!("Offer received for call {}", call_id);
                let result = inner.answer_offer(attempt, &call_id, offer).await;
                inner.handle_task_result(attempt, result);
                return;
            }
            Err(e) => tracing::warn!("Failed to read offer for call {}: {}", call_id, e),
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================
