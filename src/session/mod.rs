//! Session Module - Lebenszyklus einer Call Session
//!
//! Dieses Modul verwaltet:
//! - Den CallSessionManager (Verhandlung, Zustand, Ende)
//! - ICE Candidate Queue bis zur Remote Description
//! - Qualitäts- und Dauer-Timer
//! - Rejoin und Verifikation der Render Sinks
//!

mod error;
mod ice_queue;
mod manager;
mod participants;
mod quality;
mod rejoin;
mod resources;
mod state;

pub use error::CallError;
pub use ice_queue::{IceCandidateQueue, IcePush};
pub use manager::{CallSessionManager, SessionDeps};
pub use participants::resolve_role;
pub use quality::{classify, format_duration, ConnectionQuality, QualityInputs, QualityMonitor};
pub use rejoin::{RejoinCoordinator, SinkTarget, SinkTargets, VerificationOutcome};
pub use resources::SessionResources;
pub use state::{CallEvent, CallSnapshot, CallStatus, Role};
