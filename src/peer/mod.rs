//! Peer Module - Peer Connection Abstraktion
//!
//! Dieses Modul verwaltet:
//! - Die `PeerConnection`-Schnittstelle, gegen die der Session Manager verhandelt
//! - Events der Peer Connection (lokale ICE Candidates, Remote Tracks, Status)
//! - Die Produktiv-Implementierung auf Basis des `webrtc` Crates
//!

mod rtc_peer;

pub use rtc_peer::{LocalRtpTrack, WebRtcPeerFactory};

use crate::config::IceServerConfig;
use crate::media::{MediaStream, MediaTrack};
use crate::signaling::{IceCandidate, SessionDescription};
use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PeerError {
    #[error("WebRTC error: {0}")]
    WebRTC(String),

    #[error("Invalid SDP: {0}")]
    InvalidSdp(String),

    #[error("Remote description not set")]
    NoRemoteDescription,

    #[error("Peer connection closed")]
    Closed,
}

// ============================================================================
// PEER STATE / EVENTS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl PeerState {
    /// Zustände, in denen die Verbindung nicht mehr trägt
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            PeerState::Disconnected | PeerState::Failed | PeerState::Closed
        )
    }
}

/// Events die von einer Peer Connection ausgelöst werden
#[derive(Debug, Clone)]
pub enum PeerEvent {
    /// Lokal gesammelter ICE Candidate
    LocalCandidate(IceCandidate),
    /// Remote Track eingetroffen; der Stream gehört dem Transport
    RemoteTrack(MediaStream),
    StateChanged(PeerState),
}

pub type PeerEventSender = mpsc::UnboundedSender<PeerEvent>;

// ============================================================================
// TRAITS
// ============================================================================

#[async_trait]
pub trait PeerConnection: Send + Sync {
    async fn add_local_track(&self, track: &MediaTrack, stream_id: &str) -> Result<(), PeerError>;

    async fn create_offer(&self) -> Result<SessionDescription, PeerError>;

    async fn create_answer(&self) -> Result<SessionDescription, PeerError>;

    async fn set_local_description(&self, description: SessionDescription)
        -> Result<(), PeerError>;

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), PeerError>;

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), PeerError>;

    fn state(&self) -> PeerState;

    async fn close(&self) -> Result<(), PeerError>;
}

#[async_trait]
pub trait PeerConnectionFactory: Send + Sync {
    /// Erstellt eine Peer Connection; Events gehen an `events`
    async fn create(
        &self,
        ice_servers: &[IceServerConfig],
        events: PeerEventSender,
    ) -> Result<Arc<dyn PeerConnection>, PeerError>;
}
