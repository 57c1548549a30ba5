//! Roomsync Core - Room identity and the Room Sync Engine
//!
//! This crate provides the core functionality for roomsync:
//! - Client, room and color identity for a participant session
//! - The marker model and the local, authoritative marker set
//! - The transport capability the engine publishes and subscribes through
//! - The Room Sync Engine: optimistic local mutations, an ordered consumption
//!   loop with echo-suppression, and clear-as-compaction

pub mod config;
pub mod engine;
pub mod error;
pub mod identity;
pub mod marker;
pub mod observer;
pub mod session;
pub mod transport;

pub use config::{BackoffConfig, CompactionMode, EngineConfig};
pub use engine::{Applied, RoomSyncEngine, SyncState};
pub use error::{Result, SyncError, TransportError};
pub use identity::{ClientId, RoomId};
pub use marker::{Color, Marker, MarkerSet, Position};
pub use observer::{StateObserver, SyncWarning};
pub use session::ClientSession;
pub use transport::{Capabilities, Connection, Connector, Entry, PublishAck, Subscription};
