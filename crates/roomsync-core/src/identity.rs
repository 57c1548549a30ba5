//! Identity provider: client ids, room ids and share links

use crate::error::{Result, SyncError};
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Maximum room ID length in bytes
pub const MAX_ROOM_ID_LEN: usize = 128;

/// Length of generated room IDs
const GENERATED_ROOM_ID_LEN: usize = 12;

const BASE36: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";

/// Query parameter carrying the room in a share link
pub const ROOM_PARAM: &str = "room";

/// Room identifier - shared out-of-band, the only sharding key
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RoomId(String);

impl RoomId {
    /// Create a room ID, validating the format
    pub fn new(id: impl Into<String>) -> Result<Self> {
        let id = id.into();

        if id.is_empty() {
            return Err(SyncError::InvalidRoomId("Room ID cannot be empty".into()));
        }

        if id.len() > MAX_ROOM_ID_LEN {
            return Err(SyncError::InvalidRoomId(format!(
                "Room ID exceeds {} bytes",
                MAX_ROOM_ID_LEN
            )));
        }

        // Room IDs end up in topic names and URLs: [a-zA-Z0-9_-]+
        if !id.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-') {
            return Err(SyncError::InvalidRoomId(
                "Room ID must match pattern [a-zA-Z0-9_-]+".into(),
            ));
        }

        Ok(Self(id))
    }

    /// Generate a fresh random room ID
    pub fn generate() -> Self {
        let mut rng = rand::thread_rng();
        let id: String = (0..GENERATED_ROOM_ID_LEN)
            .map(|_| BASE36[rng.gen_range(0..BASE36.len())] as char)
            .collect();
        Self(id)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Topic carrying this room's mutation log
    pub fn topic(&self) -> String {
        format!("rooms.{}", self.0)
    }
}

impl std::fmt::Display for RoomId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Client identifier - identifies the publishing process, fresh per start
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ClientId(String);

impl ClientId {
    pub fn new(id: impl Into<String>) -> Result<Self> {
        let id = id.into();
        if id.is_empty() {
            return Err(SyncError::InvalidClientId("Client ID cannot be empty".into()));
        }
        Ok(Self(id))
    }

    /// Generate a fresh random client ID
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().simple().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ClientId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl PartialEq<str> for ClientId {
    fn eq(&self, other: &str) -> bool {
        self.0 == other
    }
}

/// Use the hint when it is a valid room ID, otherwise generate one
pub fn resolve_room_id(hint: Option<&str>) -> RoomId {
    let hint = match hint.map(str::trim) {
        Some(h) if !h.is_empty() => h,
        _ => return RoomId::generate(),
    };

    match RoomId::new(hint) {
        Ok(id) => id,
        Err(e) => {
            warn!(hint = hint, error = %e, "Ignoring invalid room hint, generating a new room");
            RoomId::generate()
        }
    }
}

pub fn new_client_id() -> ClientId {
    ClientId::generate()
}

pub fn new_session_color() -> crate::marker::Color {
    crate::marker::Color::random()
}

/// Extract the `room` query parameter from a share link
///
/// Accepts full URLs (`https://host/map?room=abc`), bare query strings
/// (`?room=abc`) and bare pairs (`room=abc`).
pub fn room_hint_from_link(link: &str) -> Option<String> {
    let without_fragment = link.split('#').next().unwrap_or_default();
    let query = match without_fragment.split_once('?') {
        Some((_, q)) => q,
        None => without_fragment,
    };

    query
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .find(|(key, _)| *key == ROOM_PARAM)
        .map(|(_, value)| value.to_string())
        .filter(|value| !value.is_empty())
}

/// Rewrite `base` so that it carries `room=<room>`, replacing any existing room
pub fn share_link(base: &str, room: &RoomId) -> String {
    let (without_fragment, fragment) = match base.split_once('#') {
        Some((b, f)) => (b, Some(f)),
        None => (base, None),
    };
    let (path, query) = match without_fragment.split_once('?') {
        Some((p, q)) => (p, q),
        None => (without_fragment, ""),
    };

    let mut pairs: Vec<String> = query
        .split('&')
        .filter(|pair| !pair.is_empty())
        .filter(|pair| pair.split('=').next() != Some(ROOM_PARAM))
        .map(str::to_string)
        .collect();
    pairs.push(format!("{}={}", ROOM_PARAM, room));

    let mut link = format!("{}?{}", path, pairs.join("&"));
    if let Some(fragment) = fragment {
        link.push('#');
        link.push_str(fragment);
    }
    link
}
