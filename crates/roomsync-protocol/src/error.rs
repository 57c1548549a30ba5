//! Protocol error types

use thiserror::Error;

/// Protocol-specific errors
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Invalid JSON: {0}")]
    InvalidJson(String),

    #[error("Malformed {kind} message: {reason}")]
    Malformed { kind: String, reason: String },

    #[error("Non-finite value in field {0}")]
    NonFinite(&'static str),

    #[error("Frame encode error: {0}")]
    FrameEncode(String),

    #[error("Frame decode error: {0}")]
    FrameDecode(String),

    #[error("Frame too large: {size} > {max}")]
    FrameTooLarge { size: usize, max: usize },
}

/// Result type for protocol operations
pub type ProtocolResult<T> = Result<T, ProtocolError>;
