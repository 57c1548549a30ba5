//! Error types for roomsync core

use roomsync_protocol::ProtocolError;
use thiserror::Error;

/// Errors raised by a transport (the log client or the log itself)
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("Log unreachable: {0}")]
    Unreachable(String),

    #[error("Connection lost: {0}")]
    ConnectionLost(String),

    #[error("Publish rejected: {0}")]
    PublishRejected(String),

    #[error("Subscriber lagged behind by {0} entries")]
    Lagged(u64),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Connection closed")]
    Closed,
}

impl TransportError {
    /// Whether the connection that produced this error is no longer usable
    pub fn is_connection_fatal(&self) -> bool {
        matches!(
            self,
            TransportError::Unreachable(_)
                | TransportError::ConnectionLost(_)
                | TransportError::Closed
        )
    }
}

/// Core error types
#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Invalid room ID: {0}")]
    InvalidRoomId(String),

    #[error("Invalid client ID: {0}")]
    InvalidClientId(String),

    #[error("Invalid color: {0}")]
    InvalidColor(String),

    #[error("Invalid position: lat={lat}, lng={lng}")]
    InvalidPosition { lat: f64, lng: f64 },

    #[error("{kind} applied locally but not published: {source}")]
    Unpublished {
        kind: &'static str,
        source: TransportError,
    },

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Codec error: {0}")]
    Codec(#[from] ProtocolError),

    #[error("Engine already started")]
    AlreadyStarted,

    #[error("Engine is closed")]
    Closed,
}

/// Result type alias for roomsync core operations
pub type Result<T> = std::result::Result<T, SyncError>;
