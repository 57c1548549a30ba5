//! Room mutation messages

use crate::error::{ProtocolError, ProtocolResult};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tracing::trace;

/// Discriminator field shared by every mutation
const TYPE_FIELD: &str = "type";

/// Type tags this version of the protocol understands
const KNOWN_TYPES: &[&str] = &["add-marker", "clear"];

/// A room mutation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Message {
    /// One new marker from client `id`
    AddMarker {
        id: String,
        lat: f64,
        lng: f64,
        color: String,
    },

    /// Everything published to the room before this entry is superseded
    Clear { id: String },
}

impl Message {
    pub fn add_marker(id: impl Into<String>, lat: f64, lng: f64, color: impl Into<String>) -> Self {
        Message::AddMarker {
            id: id.into(),
            lat,
            lng,
            color: color.into(),
        }
    }

    pub fn clear(id: impl Into<String>) -> Self {
        Message::Clear { id: id.into() }
    }

    /// The client that published this mutation
    pub fn origin(&self) -> &str {
        match self {
            Message::AddMarker { id, .. } | Message::Clear { id } => id,
        }
    }

    /// The `type` tag as it appears on the wire
    pub fn kind(&self) -> &'static str {
        match self {
            Message::AddMarker { .. } => "add-marker",
            Message::Clear { .. } => "clear",
        }
    }
}

/// Result of decoding a payload
#[derive(Debug, Clone, PartialEq)]
pub enum Decoded {
    Message(Message),
    /// `type` was absent or not one this version knows; callers skip it
    Unknown { kind: Option<String> },
}

/// Encode a mutation to its JSON payload
pub fn encode(message: &Message) -> ProtocolResult<Bytes> {
    if let Message::AddMarker { lat, lng, .. } = message {
        if !lat.is_finite() {
            return Err(ProtocolError::NonFinite("lat"));
        }
        if !lng.is_finite() {
            return Err(ProtocolError::NonFinite("lng"));
        }
    }

    serde_json::to_vec(message)
        .map(Bytes::from)
        .map_err(|e| ProtocolError::InvalidJson(e.to_string()))
}

/// Decode a payload into a mutation
///
/// Unknown or missing `type` tags are not errors. A known tag with missing or
/// ill-typed fields is.
pub fn decode(payload: &[u8]) -> ProtocolResult<Decoded> {
    let value: serde_json::Value = serde_json::from_slice(payload)
        .map_err(|e| ProtocolError::InvalidJson(e.to_string()))?;

    let object = value.as_object().ok_or_else(|| ProtocolError::Malformed {
        kind: "unknown".into(),
        reason: "payload is not a JSON object".into(),
    })?;

    let kind = match object.get(TYPE_FIELD).and_then(|t| t.as_str()) {
        Some(kind) if KNOWN_TYPES.contains(&kind) => kind.to_string(),
        Some(other) => {
            trace!(kind = other, "Unrecognized message type");
            return Ok(Decoded::Unknown {
                kind: Some(other.to_string()),
            });
        }
        None => return Ok(Decoded::Unknown { kind: None }),
    };

    serde_json::from_value(value)
        .map(Decoded::Message)
        .map_err(|e| ProtocolError::Malformed {
            kind,
            reason: e.to_string(),
        })
}
