//! Log wire frames
//!
//! Every WebSocket binary message carries exactly one frame, encoded as
//! MessagePack with named fields. Requests carry a `req` id that the server
//! echoes back; subscriptions are identified by a client-chosen `sid`.

use crate::error::{ProtocolError, ProtocolResult};
use crate::headers::Headers;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Maximum encoded frame size (1MB)
pub const MAX_FRAME_SIZE: usize = 1024 * 1024;

/// Where a new subscription starts replaying from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeliverPolicy {
    /// Oldest retained entry
    All,
    /// First retained entry with a sequence at or above this one
    FromSequence(u64),
}

impl Default for DeliverPolicy {
    fn default() -> Self {
        Self::All
    }
}

/// Failure categories reported by the server
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    /// The log refused the request (e.g. rollup without native support)
    Rejected,
    /// The subscriber fell behind the live buffer
    Lagged,
    /// The log is shutting down or unreachable
    Unavailable,
    /// The frame was not understood
    BadRequest,
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorCode::Rejected => write!(f, "REJECTED"),
            ErrorCode::Lagged => write!(f, "LAGGED"),
            ErrorCode::Unavailable => write!(f, "UNAVAILABLE"),
            ErrorCode::BadRequest => write!(f, "BAD_REQUEST"),
        }
    }
}

/// Participant to log server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ClientFrame {
    Publish {
        req: u64,
        topic: String,
        payload: Bytes,
        headers: Headers,
    },
    Subscribe {
        req: u64,
        sid: u64,
        topic: String,
        policy: DeliverPolicy,
    },
    Unsubscribe {
        sid: u64,
    },
    /// Ask for the newest retained entry carrying `header`
    LastMarked {
        req: u64,
        topic: String,
        header: String,
    },
    Ping {
        req: u64,
    },
}

/// Log server to participant
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ServerFrame {
    /// First frame on every connection
    Welcome {
        version: String,
        native_rollup: bool,
    },
    Published {
        req: u64,
        sequence: u64,
    },
    Subscribed {
        req: u64,
        sid: u64,
    },
    Entry {
        sid: u64,
        sequence: u64,
        payload: Bytes,
        headers: Headers,
    },
    Marked {
        req: u64,
        sequence: Option<u64>,
    },
    Failed {
        req: u64,
        code: ErrorCode,
        message: String,
    },
    /// The subscription will deliver nothing more
    SubscriptionEnded {
        sid: u64,
        code: ErrorCode,
        message: String,
    },
    Pong {
        req: u64,
    },
}

impl ClientFrame {
    pub fn encode(&self) -> ProtocolResult<Vec<u8>> {
        encode_frame(self)
    }

    pub fn decode(data: &[u8]) -> ProtocolResult<Self> {
        decode_frame(data)
    }

    /// Request id, if this frame expects a reply
    pub fn req(&self) -> Option<u64> {
        match self {
            ClientFrame::Publish { req, .. }
            | ClientFrame::Subscribe { req, .. }
            | ClientFrame::LastMarked { req, .. }
            | ClientFrame::Ping { req } => Some(*req),
            ClientFrame::Unsubscribe { .. } => None,
        }
    }
}

impl ServerFrame {
    pub fn encode(&self) -> ProtocolResult<Vec<u8>> {
        encode_frame(self)
    }

    pub fn decode(data: &[u8]) -> ProtocolResult<Self> {
        decode_frame(data)
    }

    pub fn failed(req: u64, code: ErrorCode, message: impl Into<String>) -> Self {
        ServerFrame::Failed {
            req,
            code,
            message: message.into(),
        }
    }
}

fn encode_frame<T: Serialize>(frame: &T) -> ProtocolResult<Vec<u8>> {
    let data = rmp_serde::to_vec_named(frame).map_err(|e| ProtocolError::FrameEncode(e.to_string()))?;
    if data.len() > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge {
            size: data.len(),
            max: MAX_FRAME_SIZE,
        });
    }
    Ok(data)
}

fn decode_frame<T: for<'de> Deserialize<'de>>(data: &[u8]) -> ProtocolResult<T> {
    if data.len() > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge {
            size: data.len(),
            max: MAX_FRAME_SIZE,
        });
    }
    rmp_serde::from_slice(data).map_err(|e| ProtocolError::FrameDecode(e.to_string()))
}
