//! Transport capability the engine publishes and subscribes through
//!
//! The engine never sees sockets or brokers. It needs a way to publish a
//! payload with headers to a topic, and an ordered, replayable subscription
//! starting at a chosen point in the topic's log.

use crate::error::TransportError;
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::BoxStream;
use std::sync::Arc;

pub use roomsync_protocol::{DeliverPolicy, Headers};

/// One retained log entry
#[derive(Debug, Clone, PartialEq)]
pub struct Entry {
    /// Position in the topic log, strictly increasing
    pub sequence: u64,
    pub payload: Bytes,
    pub headers: Headers,
}

/// Acknowledgment of a successful publish
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PublishAck {
    pub sequence: u64,
}

/// What the log supports beyond plain append
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Capabilities {
    /// The log purges prior entries on a rollup header
    pub native_rollup: bool,
}

/// Ordered lazy sequence of entries; never restarts on its own
pub type Subscription = BoxStream<'static, Result<Entry, TransportError>>;

/// An established link to the log
#[async_trait]
pub trait Connection: Send + Sync {
    fn capabilities(&self) -> Capabilities;

    /// Append a payload to a topic
    async fn publish(
        &self,
        topic: &str,
        payload: Bytes,
        headers: Headers,
    ) -> Result<PublishAck, TransportError>;

    /// Replay retained entries per `policy`, then follow live ones
    async fn subscribe(
        &self,
        topic: &str,
        policy: DeliverPolicy,
    ) -> Result<Subscription, TransportError>;

    /// Sequence of the newest retained entry in `topic` carrying `header`
    async fn last_marked(&self, topic: &str, header: &str) -> Result<Option<u64>, TransportError>;
}

/// Produces connections to the log
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self) -> Result<Arc<dyn Connection>, TransportError>;
}
