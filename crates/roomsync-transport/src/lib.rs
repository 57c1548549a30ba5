//! Roomsync Transport Layer
//!
//! Carries the log protocol over WebSocket:
//! - Server: serves a `MemoryLog` to participants (`roomlogd`)
//! - Client: `WsConnector`, the participant side of the transport adapter

pub mod client;
pub mod handler;
pub mod server;

/// Wire protocol version announced in the welcome frame
pub const PROTOCOL_VERSION: &str = "1";

pub use client::{WsConnection, WsConnector};
pub use handler::ConnectionHandler;
pub use server::LogServer;
