//! A client's participation in one room

use crate::identity::{ClientId, RoomId};
use crate::marker::Color;

/// Identity of this process within a room
///
/// Client and room IDs are fixed for the session's lifetime; there are no
/// setters.
#[derive(Debug, Clone, PartialEq)]
pub struct ClientSession {
    client_id: ClientId,
    room_id: RoomId,
    color: Color,
}

impl ClientSession {
    /// Join `room_id` with a fresh client ID and session color
    pub fn new(room_id: RoomId) -> Self {
        Self {
            client_id: ClientId::generate(),
            room_id,
            color: Color::random(),
        }
    }

    /// Build a session from explicit parts
    pub fn with_parts(client_id: ClientId, room_id: RoomId, color: Color) -> Self {
        Self {
            client_id,
            room_id,
            color,
        }
    }

    pub fn client_id(&self) -> &ClientId {
        &self.client_id
    }

    pub fn room_id(&self) -> &RoomId {
        &self.room_id
    }

    pub fn color(&self) -> &Color {
        &self.color
    }

    pub fn topic(&self) -> String {
        self.room_id.topic()
    }
}
