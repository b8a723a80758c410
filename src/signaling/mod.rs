//! Signaling Module - Offer/Answer/ICE über einen geteilten Store
//!
//! Dieses Modul verwaltet:
//! - Das Record-Format pro `callId` (Offer, Answer, Status, ICE-Liste)
//! - Die `SignalingChannel`-Schnittstelle mit beobachtbaren Streams
//! - `SignalingHub` als Implementierung über austauschbaren Stores
//! - Speicher-Backends (In-Memory, SQLite)
//!

mod channel;
mod directory;
mod hub;
mod record;
mod sqlite;
mod store;

pub use channel::{IceCursor, SignalingChannel, SignalingError, SignalingStream};
pub use directory::{IdentityProvider, ParticipantDirectory, StaticDirectory};
pub use hub::SignalingHub;
pub use record::*;
pub use sqlite::SqliteStore;
pub use store::{MemoryStore, SignalingStore};
