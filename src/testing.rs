//! Geskriptete Test-Doubles für Sinks, Geräte, Peers und Signaling

use crate::config::IceServerConfig;
use crate::media::{
    MediaAcquisitionError, MediaConstraints, MediaDevices, MediaStream, MediaTrack,
    PermissionGate, PlaybackError, RenderSink, SyntheticDevices, TrackKind,
};
use crate::peer::{
    PeerConnection, PeerConnectionFactory, PeerError, PeerEvent, PeerEventSender, PeerState,
};
use crate::signaling::{
    CallParticipants, IceCandidate, IceCursor, SessionDescription, SignalingChannel,
    SignalingError, SignalingRecord, SignalingStream, StoredIceCandidate,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

// ============================================================================
// RENDER SINK
// ============================================================================

pub struct FakeSink {
    id: String,
    stream: Mutex<Option<MediaStream>>,
    playing: AtomicBool,
    play_attempts: AtomicUsize,
    detaches: AtomicUsize,
    pauses: AtomicUsize,
    scripted_failures: Mutex<VecDeque<PlaybackError>>,
    permanent_failure: Mutex<Option<PlaybackError>>,
}

impl FakeSink {
    pub fn new(id: &str) -> Arc<Self> {
        Arc::new(Self {
            id: id.to_string(),
            stream: Mutex::new(None),
            playing: AtomicBool::new(false),
            play_attempts: AtomicUsize::new(0),
            detaches: AtomicUsize::new(0),
            pauses: AtomicUsize::new(0),
            scripted_failures: Mutex::new(VecDeque::new()),
            permanent_failure: Mutex::new(None),
        })
    }

    pub fn set_playing(&self, playing: bool) {
        self.playing.store(playing, Ordering::SeqCst);
    }

    /// Nächster `play()` schlägt mit `error` fehl (mehrfach aufrufbar)
    pub fn fail_next_play(&self, error: PlaybackError) {
        self.scripted_failures.lock().push_back(error);
    }

    pub fn fail_all_plays(&self, error: PlaybackError) {
        *self.permanent_failure.lock() = Some(error);
    }

    pub fn play_attempts(&self) -> usize {
        self.play_attempts.load(Ordering::SeqCst)
    }

    pub fn detach_count(&self) -> usize {
        self.detaches.load(Ordering::SeqCst)
    }

    pub fn pause_count(&self) -> usize {
        self.pauses.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RenderSink for FakeSink {
    fn id(&self) -> &str {
        &self.id
    }

    fn attach(&self, stream: MediaStream) {
        *self.stream.lock() = Some(stream);
        self.playing.store(false, Ordering::SeqCst);
    }

    fn detach(&self) {
        *self.stream.lock() = None;
        self.playing.store(false, Ordering::SeqCst);
        self.detaches.fetch_add(1, Ordering::SeqCst);
    }

    fn current_stream(&self) -> Option<MediaStream> {
        self.stream.lock().clone()
    }

    fn is_playing(&self) -> bool {
        self.playing.load(Ordering::SeqCst)
    }

    fn pause(&self) {
        self.playing.store(false, Ordering::SeqCst);
        self.pauses.fetch_add(1, Ordering::SeqCst);
    }

    async fn play(&self) -> Result<(), PlaybackError> {
        self.play_attempts.fetch_add(1, Ordering::SeqCst);

        if let Some(error) = self.scripted_failures.lock().pop_front() {
            return Err(error);
        }
        if let Some(error) = self.permanent_failure.lock().clone() {
            return Err(error);
        }
        if self.stream.lock().is_none() {
            return Err(PlaybackError::Failed("no stream attached".to_string()));
        }

        self.playing.store(true, Ordering::SeqCst);
        Ok(())
    }
}

// ============================================================================
// DEVICES / PERMISSIONS
// ============================================================================

#[derive(Default)]
pub struct FakeDevices {
    failure: Mutex<Option<MediaAcquisitionError>>,
    streams: Mutex<Vec<MediaStream>>,
}

impl FakeDevices {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn failing(error: MediaAcquisitionError) -> Arc<Self> {
        let devices = Self::default();
        *devices.failure.lock() = Some(error);
        Arc::new(devices)
    }

    pub fn calls(&self) -> usize {
        self.streams.lock().len()
    }

    pub fn last_stream(&self) -> Option<MediaStream> {
        self.streams.lock().last().cloned()
    }
}

#[async_trait]
impl MediaDevices for FakeDevices {
    async fn get_user_media(
        &self,
        constraints: &MediaConstraints,
    ) -> Result<MediaStream, MediaAcquisitionError> {
        if let Some(error) = self.failure.lock().clone() {
            return Err(error);
        }
        let stream = SyntheticDevices::build_stream(constraints);
        self.streams.lock().push(stream.clone());
        Ok(stream)
    }
}

pub struct FakePermissions(AtomicBool);

impl FakePermissions {
    pub fn granted() -> Arc<Self> {
        Arc::new(Self(AtomicBool::new(true)))
    }

    pub fn denied() -> Arc<Self> {
        Arc::new(Self(AtomicBool::new(false)))
    }
}

impl PermissionGate for FakePermissions {
    fn has_media_permissions(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

// ============================================================================
// PEER CONNECTION
// ============================================================================

/// Loopback-Peer: sobald Local und Remote Description gesetzt sind,
/// meldet er `Connected` und einen Remote Stream.
pub struct FakePeer {
    id: String,
    events: PeerEventSender,
    state: Mutex<PeerState>,
    local: Mutex<Option<SessionDescription>>,
    remote: Mutex<Option<SessionDescription>>,
    local_tracks: Mutex<Vec<String>>,
    applied: Mutex<Vec<IceCandidate>>,
    rejected: AtomicUsize,
    fail_next_set_remote: AtomicBool,
    remote_sent: AtomicBool,
    closed: AtomicBool,
    remote_stream: MediaStream,
}

impl FakePeer {
    fn new(id: String, events: PeerEventSender) -> Self {
        let remote_stream = MediaStream::with_id(
            format!("{}-remote", id),
            vec![
                MediaTrack::new(TrackKind::Audio, "remote-audio"),
                MediaTrack::new(TrackKind::Video, "remote-video"),
            ],
        );
        Self {
            id,
            events,
            state: Mutex::new(PeerState::New),
            local: Mutex::new(None),
            remote: Mutex::new(None),
            local_tracks: Mutex::new(Vec::new()),
            applied: Mutex::new(Vec::new()),
            rejected: AtomicUsize::new(0),
            fail_next_set_remote: AtomicBool::new(false),
            remote_sent: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            remote_stream,
        }
    }

    pub fn fail_next_set_remote(&self) {
        self.fail_next_set_remote.store(true, Ordering::SeqCst);
    }

    /// Simuliert einen Verbindungsabbruch
    pub fn fail_connection(&self) {
        *self.state.lock() = PeerState::Failed;
        let _ = self.events.send(PeerEvent::StateChanged(PeerState::Failed));
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn applied_candidates(&self) -> Vec<IceCandidate> {
        self.applied.lock().clone()
    }

    /// Candidates, die vor der Remote Description ankamen
    pub fn rejected_candidates(&self) -> usize {
        self.rejected.load(Ordering::SeqCst)
    }

    pub fn local_description(&self) -> Option<SessionDescription> {
        self.local.lock().clone()
    }

    pub fn remote_description(&self) -> Option<SessionDescription> {
        self.remote.lock().clone()
    }

    pub fn local_tracks(&self) -> Vec<String> {
        self.local_tracks.lock().clone()
    }

    fn emit_local_candidates(&self) {
        for n in 1..=2u16 {
            let candidate = IceCandidate {
                candidate: format!(
                    "candidate:{}-{} 1 udp 2122260223 192.0.2.{} 5000 typ host",
                    self.id, n, n
                ),
                sdp_m_line_index: Some(0),
                sdp_mid: Some("0".to_string()),
            };
            let _ = self.events.send(PeerEvent::LocalCandidate(candidate));
        }
    }

    fn maybe_connect(&self) {
        let ready = self.local.lock().is_some() && self.remote.lock().is_some();
        if ready && !self.remote_sent.swap(true, Ordering::SeqCst) {
            *self.state.lock() = PeerState::Connected;
            let _ = self.events.send(PeerEvent::StateChanged(PeerState::Connected));
            let _ = self
                .events
                .send(PeerEvent::RemoteTrack(self.remote_stream.clone()));
        }
    }

    fn ensure_open(&self) -> Result<(), PeerError> {
        if self.is_closed() {
            Err(PeerError::Closed)
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl PeerConnection for FakePeer {
    async fn add_local_track(&self, track: &MediaTrack, _stream_id: &str) -> Result<(), PeerError> {
        self.ensure_open()?;
        self.local_tracks.lock().push(track.id().to_string());
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription, PeerError> {
        self.ensure_open()?;
        Ok(SessionDescription::offer(format!("v=0\r\no={} offer\r\n", self.id)))
    }

    async fn create_answer(&self) -> Result<SessionDescription, PeerError> {
        self.ensure_open()?;
        if self.remote.lock().is_none() {
            return Err(PeerError::NoRemoteDescription);
        }
        Ok(SessionDescription::answer(format!("v=0\r\no={} answer\r\n", self.id)))
    }

    async fn set_local_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), PeerError> {
        self.ensure_open()?;
        *self.local.lock() = Some(description);
        self.emit_local_candidates();
        self.maybe_connect();
        Ok(())
    }

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), PeerError> {
        self.ensure_open()?;
        if self.fail_next_set_remote.swap(false, Ordering::SeqCst) {
            return Err(PeerError::InvalidSdp("scripted failure".to_string()));
        }
        *self.remote.lock() = Some(description);
        self.maybe_connect();
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), PeerError> {
        self.ensure_open()?;
        if self.remote.lock().is_none() {
            self.rejected.fetch_add(1, Ordering::SeqCst);
            return Err(PeerError::NoRemoteDescription);
        }
        self.applied.lock().push(candidate);
        Ok(())
    }

    fn state(&self) -> PeerState {
        *self.state.lock()
    }

    async fn close(&self) -> Result<(), PeerError> {
        self.closed.store(true, Ordering::SeqCst);
        *self.state.lock() = PeerState::Closed;
        Ok(())
    }
}

#[derive(Default)]
pub struct FakePeerFactory {
    peers: Mutex<Vec<Arc<FakePeer>>>,
}

impl FakePeerFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn created(&self) -> usize {
        self.peers.lock().len()
    }

    pub fn last(&self) -> Option<Arc<FakePeer>> {
        self.peers.lock().last().cloned()
    }
}

#[async_trait]
impl PeerConnectionFactory for FakePeerFactory {
    async fn create(
        &self,
        _ice_servers: &[IceServerConfig],
        events: PeerEventSender,
    ) -> Result<Arc<dyn PeerConnection>, PeerError> {
        let mut peers = self.peers.lock();
        let peer = Arc::new(FakePeer::new(format!("peer{}", peers.len() + 1), events));
        peers.push(Arc::clone(&peer));
        Ok(peer)
    }
}

// ============================================================================
// SIGNALING
// ============================================================================

/// Zählt Offer/Answer-Writes und kann Writes scheitern lassen
pub struct RecordingSignaling {
    inner: Arc<dyn SignalingChannel>,
    offers: AtomicUsize,
    answers: AtomicUsize,
    fail_writes: AtomicBool,
}

impl RecordingSignaling {
    pub fn new(inner: Arc<dyn SignalingChannel>) -> Arc<Self> {
        Arc::new(Self {
            inner,
            offers: AtomicUsize::new(0),
            answers: AtomicUsize::new(0),
            fail_writes: AtomicBool::new(false),
        })
    }

    pub fn offer_writes(&self) -> usize {
        self.offers.load(Ordering::SeqCst)
    }

    pub fn answer_writes(&self) -> usize {
        self.answers.load(Ordering::SeqCst)
    }

    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    fn scripted_failure(&self) -> Result<(), SignalingError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            Err(SignalingError::Storage("scripted write failure".to_string()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl SignalingChannel for RecordingSignaling {
    async fn create_call_record(
        &self,
        call_id: &str,
        participants: &CallParticipants,
    ) -> Result<(), SignalingError> {
        self.inner.create_call_record(call_id, participants).await
    }

    async fn write_offer(
        &self,
        call_id: &str,
        offer: SessionDescription,
    ) -> Result<(), SignalingError> {
        self.offers.fetch_add(1, Ordering::SeqCst);
        self.scripted_failure()?;
        self.inner.write_offer(call_id, offer).await
    }

    async fn write_answer(
        &self,
        call_id: &str,
        answer: SessionDescription,
    ) -> Result<(), SignalingError> {
        self.answers.fetch_add(1, Ordering::SeqCst);
        self.scripted_failure()?;
        self.inner.write_answer(call_id, answer).await
    }

    fn observe_offer(&self, call_id: &str) -> SignalingStream<SessionDescription> {
        self.inner.observe_offer(call_id)
    }

    fn observe_answer(&self, call_id: &str) -> SignalingStream<SessionDescription> {
        self.inner.observe_answer(call_id)
    }

    fn observe_record(&self, call_id: &str) -> SignalingStream<SignalingRecord> {
        self.inner.observe_record(call_id)
    }

    async fn append_ice_candidate(
        &self,
        call_id: &str,
        candidate: StoredIceCandidate,
    ) -> Result<(), SignalingError> {
        self.inner.append_ice_candidate(call_id, candidate).await
    }

    fn observe_new_ice_candidates(
        &self,
        call_id: &str,
        cursor: IceCursor,
    ) -> SignalingStream<StoredIceCandidate> {
        self.inner.observe_new_ice_candidates(call_id, cursor)
    }

    async fn end_call_record(&self, call_id: &str) -> Result<(), SignalingError> {
        self.inner.end_call_record(call_id).await
    }

    async fn reset_call_record(&self, call_id: &str) -> Result<(), SignalingError> {
        self.inner.reset_call_record(call_id).await
    }

    async fn reopen_call_record(&self, call_id: &str) -> Result<bool, SignalingError> {
        self.inner.reopen_call_record(call_id).await
    }

    async fn load_record(&self, call_id: &str) -> Result<Option<SignalingRecord>, SignalingError> {
        self.inner.load_record(call_id).await
    }
}
