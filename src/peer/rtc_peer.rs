//! WebRTC Peer Connection
//!
//! Produktiv-Implementierung von `PeerConnection` über das `webrtc` Crate.
//! Lokale Tracks werden als RTP-Tracks registriert. Encoder außerhalb dieses
//! Crates holen sich über `WebRtcPeerFactory::local_track` einen
//! `LocalRtpTrack` und schreiben dort ihre RTP-Pakete hinein.

use super::{PeerConnection, PeerConnectionFactory, PeerError, PeerEvent, PeerEventSender, PeerState};
use crate::config::IceServerConfig;
use crate::media::{MediaStream, MediaTrack, TrackKind, TrackState, VideoConstraints};
use crate::signaling::{IceCandidate, SdpType, SessionDescription};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;
use webrtc::track::track_local::{TrackLocal, TrackLocalWriter};

fn rtc_err(e: webrtc::Error) -> PeerError {
    PeerError::WebRTC(e.to_string())
}

// ============================================================================
// CONVERSIONS
// ============================================================================

fn to_rtc_ice_servers(servers: &[IceServerConfig]) -> Vec<RTCIceServer> {
    servers
        .iter()
        .map(|s| RTCIceServer {
            urls: s.urls.clone(),
            username: s.username.clone(),
            credential: s.credential.clone(),
            ..Default::default()
        })
        .collect()
}

fn to_rtc_description(description: SessionDescription) -> Result<RTCSessionDescription, PeerError> {
    let result = match description.sdp_type {
        SdpType::Offer => RTCSessionDescription::offer(description.sdp),
        SdpType::Answer => RTCSessionDescription::answer(description.sdp),
    };
    result.map_err(|e| PeerError::InvalidSdp(e.to_string()))
}

fn from_rtc_description(description: RTCSessionDescription) -> Result<SessionDescription, PeerError> {
    match description.sdp_type {
        RTCSdpType::Offer => Ok(SessionDescription::offer(description.sdp)),
        RTCSdpType::Answer => Ok(SessionDescription::answer(description.sdp)),
        other => Err(PeerError::InvalidSdp(format!("unexpected sdp type {}", other))),
    }
}

fn map_state(state: RTCPeerConnectionState) -> PeerState {
    match state {
        RTCPeerConnectionState::Connecting => PeerState::Connecting,
        RTCPeerConnectionState::Connected => PeerState::Connected,
        RTCPeerConnectionState::Disconnected => PeerState::Disconnected,
        RTCPeerConnectionState::Failed => PeerState::Failed,
        RTCPeerConnectionState::Closed => PeerState::Closed,
        _ => PeerState::New,
    }
}

fn codec_for(kind: TrackKind) -> RTCRtpCodecCapability {
    match kind {
        TrackKind::Audio => RTCRtpCodecCapability {
            mime_type: MIME_TYPE_OPUS.to_string(),
            clock_rate: 48000,
            channels: 2,
            ..Default::default()
        },
        TrackKind::Video => RTCRtpCodecCapability {
            mime_type: MIME_TYPE_VP8.to_string(),
            clock_rate: 90000,
            ..Default::default()
        },
    }
}

// ============================================================================
// LOCAL RTP TRACKS
// ============================================================================

/// RTP-Ausgang eines lokalen `MediaTrack`.
///
/// Folgt dem Zustand des Tracks: ist er deaktiviert (`toggle_video`,
/// `toggle_audio`) oder beendet, werden Pakete verworfen. Die Constraints
/// aus `optimize_for_network` muss der Encoder selbst anwenden.
#[derive(Debug, Clone)]
pub struct LocalRtpTrack {
    media: MediaTrack,
    rtp: Arc<TrackLocalStaticRTP>,
}

impl LocalRtpTrack {
    fn new(media: MediaTrack, stream_id: &str) -> Self {
        let rtp = Arc::new(TrackLocalStaticRTP::new(
            codec_for(media.kind()),
            media.id().to_string(),
            stream_id.to_string(),
        ));
        Self { media, rtp }
    }

    pub fn kind(&self) -> TrackKind {
        self.media.kind()
    }

    pub fn constraints(&self) -> Option<VideoConstraints> {
        self.media.constraints()
    }

    pub fn is_sending(&self) -> bool {
        self.media.is_enabled() && self.media.state() == TrackState::Live
    }

    /// Schreibt ein serialisiertes RTP-Paket; `Ok(0)` wenn verworfen
    pub async fn write_rtp(&self, packet: &[u8]) -> Result<usize, PeerError> {
        if !self.is_sending() {
            return Ok(0);
        }
        self.rtp.write(packet).await.map_err(rtc_err)
    }
}

type LocalTrackRegistry = Arc<Mutex<HashMap<String, LocalRtpTrack>>>;

// ============================================================================
// FACTORY
// ============================================================================

/// Erzeugt Peer Connections mit Default-Codecs und Interceptors
#[derive(Debug, Clone, Default)]
pub struct WebRtcPeerFactory {
    local_tracks: LocalTrackRegistry,
}

impl WebRtcPeerFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// RTP-Ausgang zum lokalen Track `track_id` einer offenen Peer Connection
    pub fn local_track(&self, track_id: &str) -> Option<LocalRtpTrack> {
        self.local_tracks.lock().get(track_id).cloned()
    }
}

#[async_trait]
impl PeerConnectionFactory for WebRtcPeerFactory {
    async fn create(
        &self,
        ice_servers: &[IceServerConfig],
        events: PeerEventSender,
    ) -> Result<Arc<dyn PeerConnection>, PeerError> {
        // Media Engine mit Opus/VP8 konfigurieren
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs().map_err(rtc_err)?;

        // Interceptors für RTCP, NACK etc.
        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine).map_err(rtc_err)?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let config = RTCConfiguration {
            ice_servers: to_rtc_ice_servers(ice_servers),
            ..Default::default()
        };

        let pc = Arc::new(api.new_peer_connection(config).await.map_err(rtc_err)?);

        let peer = WebRtcPeer {
            pc,
            registry: Arc::clone(&self.local_tracks),
            own_tracks: Mutex::new(Vec::new()),
        };
        peer.setup_handlers(events);

        Ok(Arc::new(peer))
    }
}

// ============================================================================
// PEER
// ============================================================================

struct WebRtcPeer {
    pc: Arc<RTCPeerConnection>,
    registry: LocalTrackRegistry,
    /// IDs der Tracks dieser Connection in `registry`
    own_tracks: Mutex<Vec<String>>,
}

impl WebRtcPeer {
    /// Registriert Event Handler für die Peer Connection
    fn setup_handlers(&self, events: PeerEventSender) {
        // Connection State Handler
        let tx = events.clone();
        self.pc
            .on_peer_connection_state_change(Box::new(move |s: RTCPeerConnectionState| {
                tracing::info!("Peer connection state: {:?}", s);
                let _ = tx.send(PeerEvent::StateChanged(map_state(s)));
                Box::pin(async {})
            }));

        // ICE Candidate Handler
        let tx = events.clone();
        self.pc.on_ice_candidate(Box::new(move |candidate| {
            if let Some(c) = candidate {
                match c.to_json() {
                    Ok(init) => {
                        let _ = tx.send(PeerEvent::LocalCandidate(IceCandidate {
                            candidate: init.candidate,
                            sdp_m_line_index: init.sdp_mline_index,
                            sdp_mid: init.sdp_mid,
                        }));
                    }
                    Err(e) => tracing::warn!("Failed to serialize local ICE candidate: {}", e),
                }
            }
            Box::pin(async {})
        }));

        // Track Handler: Remote Tracks pro Stream-ID sammeln
        let tx = events;
        let remote_streams: Arc<Mutex<HashMap<String, MediaStream>>> =
            Arc::new(Mutex::new(HashMap::new()));
        self.pc.on_track(Box::new(move |track, _, _| {
            let kind = match track.kind() {
                RTPCodecType::Audio => Some(TrackKind::Audio),
                RTPCodecType::Video => Some(TrackKind::Video),
                _ => None,
            };

            if let Some(kind) = kind {
                let stream_id = track.stream_id();
                let stream = remote_streams
                    .lock()
                    .entry(stream_id.clone())
                    .or_insert_with(|| MediaStream::with_id(stream_id, Vec::new()))
                    .clone();
                stream.add_track(MediaTrack::with_id(track.id(), kind, "remote"));

                tracing::info!("Received remote {} track: {:?}", kind.as_str(), track.codec());
                let _ = tx.send(PeerEvent::RemoteTrack(stream));
            }

            Box::pin(async {})
        }));
    }
}

#[async_trait]
impl PeerConnection for WebRtcPeer {
    async fn add_local_track(&self, track: &MediaTrack, stream_id: &str) -> Result<(), PeerError> {
        let local = LocalRtpTrack::new(track.clone(), stream_id);

        self.pc
            .add_track(Arc::clone(&local.rtp) as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .map_err(rtc_err)?;

        self.registry.lock().insert(track.id().to_string(), local);
        self.own_tracks.lock().push(track.id().to_string());
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription, PeerError> {
        let offer = self.pc.create_offer(None).await.map_err(rtc_err)?;
        from_rtc_description(offer)
    }

    async fn create_answer(&self) -> Result<SessionDescription, PeerError> {
        let answer = self.pc.create_answer(None).await.map_err(rtc_err)?;
        from_rtc_description(answer)
    }

    async fn set_local_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), PeerError> {
        let description = to_rtc_description(description)?;
        self.pc
            .set_local_description(description)
            .await
            .map_err(rtc_err)
    }

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), PeerError> {
        let description = to_rtc_description(description)?;
        self.pc
            .set_remote_description(description)
            .await
            .map_err(rtc_err)
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), PeerError> {
        if self.pc.remote_description().await.is_none() {
            return Err(PeerError::NoRemoteDescription);
        }

        let init = RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_m_line_index,
            username_fragment: None,
        };

        self.pc.add_ice_candidate(init).await.map_err(rtc_err)
    }

    fn state(&self) -> PeerState {
        map_state(self.pc.connection_state())
    }

    async fn close(&self) -> Result<(), PeerError> {
        let own: Vec<String> = self.own_tracks.lock().drain(..).collect();
        {
            let mut registry = self.registry.lock();
            for id in &own {
                registry.remove(id);
            }
        }
        self.pc.close().await.map_err(rtc_err)
    }
}

// ============================================================================
// TESTS
// ============================================================================
