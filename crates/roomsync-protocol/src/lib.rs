//! Roomsync wire protocol
//!
//! Two layers live here:
//!
//! - The room mutation protocol: a small tagged union of JSON messages that
//!   participants publish to `rooms.<roomId>`.
//! - The log wire frames spoken between a participant and the log server,
//!   encoded as MessagePack in binary WebSocket frames.
//!
//! ## Mutation Format
//! ```text
//! {"type":"add-marker","id":"<client>","lat":1.0,"lng":2.0,"color":"#AABBCC"}
//! {"type":"clear","id":"<client>"}
//! ```

pub mod message;
pub mod headers;
pub mod frame;
pub mod error;

pub use message::{decode, encode, Decoded, Message};
pub use headers::Headers;
pub use frame::{ClientFrame, DeliverPolicy, ErrorCode, ServerFrame};
pub use error::{ProtocolError, ProtocolResult};
