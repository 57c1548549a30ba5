//! In-memory log backend
//!
//! Volatile and process-local. The daemon serves it over WebSocket; in-process
//! engines can connect to it directly through [`MemoryConnector`].

use crate::topic::TopicLog;
use crate::{LogConfig, LogStats};
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use roomsync_core::transport::{Capabilities, DeliverPolicy, Headers};
use roomsync_core::{Connection, Connector, PublishAck, Subscription, TransportError};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

/// In-memory topic logs
pub struct MemoryLog {
    topics: DashMap<String, Arc<TopicLog>>,
    config: LogConfig,
    reachable: AtomicBool,
}

impl MemoryLog {
    pub fn new() -> Self {
        Self::with_config(LogConfig::default())
    }

    pub fn with_config(config: LogConfig) -> Self {
        Self {
            topics: DashMap::new(),
            config,
            reachable: AtomicBool::new(true),
        }
    }

    pub fn config(&self) -> &LogConfig {
        &self.config
    }

    /// A connector handing out this log as the connection
    pub fn connector(self: &Arc<Self>) -> MemoryConnector {
        MemoryConnector { log: self.clone() }
    }

    /// Simulate an outage: while unreachable, every operation fails
    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
        info!(reachable = reachable, "Log reachability changed");
    }

    pub fn is_reachable(&self) -> bool {
        self.reachable.load(Ordering::SeqCst)
    }

    /// End every live subscription on every topic with `ConnectionLost`
    pub fn sever(&self) -> usize {
        let topics: Vec<Arc<TopicLog>> = self.topics.iter().map(|t| t.value().clone()).collect();
        let severed: usize = topics.iter().map(|topic| topic.sever()).sum();
        info!(subscriptions = severed, "Severed live subscriptions");
        severed
    }

    pub fn stats(&self) -> LogStats {
        let mut stats = LogStats {
            topic_count: self.topics.len(),
            ..Default::default()
        };
        for topic in self.topics.iter() {
            let (entries, bytes) = topic.value().usage();
            stats.entry_count += entries;
            stats.total_payload_bytes += bytes;
        }
        stats
    }

    /// Append to `topic`, honoring the rollup header
    pub fn append(&self, topic: &str, payload: Bytes, headers: Headers) -> Result<u64, TransportError> {
        self.check_reachable()?;
        validate_topic(topic)?;

        let rollup = headers.is_rollup();
        if rollup && !self.config.native_rollup {
            return Err(TransportError::PublishRejected(
                "rollup is not supported by this log".into(),
            ));
        }

        let appended = self
            .topic(topic)
            .append(payload, headers, rollup, self.config.max_entries_per_topic);

        if rollup {
            info!(topic = %topic, sequence = appended.sequence, purged = appended.purged, "Topic rolled up");
        } else {
            debug!(topic = %topic, sequence = appended.sequence, "Appended entry");
        }
        Ok(appended.sequence)
    }

    /// Open a subscription on `topic`
    pub fn open(&self, topic: &str, policy: DeliverPolicy) -> Result<Subscription, TransportError> {
        self.check_reachable()?;
        validate_topic(topic)?;

        debug!(topic = %topic, policy = ?policy, "Opening subscription");
        Ok(self.topic(topic).open(policy))
    }

    /// Sequence of the newest retained entry in `topic` carrying `header`
    pub fn find_last_marked(&self, topic: &str, header: &str) -> Result<Option<u64>, TransportError> {
        self.check_reachable()?;
        validate_topic(topic)?;

        let topic = self.topics.get(topic).map(|t| t.value().clone());
        Ok(topic.and_then(|t| t.last_marked(header)))
    }

    fn topic(&self, name: &str) -> Arc<TopicLog> {
        if let Some(topic) = self.topics.get(name) {
            return topic.value().clone();
        }
        self.topics
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(TopicLog::new(self.config.live_buffer)))
            .value()
            .clone()
    }

    fn check_reachable(&self) -> Result<(), TransportError> {
        if self.is_reachable() {
            Ok(())
        } else {
            Err(TransportError::Unreachable("log is offline".into()))
        }
    }
}

impl Default for MemoryLog {
    fn default() -> Self {
        Self::new()
    }
}

fn validate_topic(topic: &str) -> Result<(), TransportError> {
    if topic.is_empty() || topic.chars().any(char::is_whitespace) {
        return Err(TransportError::PublishRejected(format!("invalid topic {:?}", topic)));
    }
    Ok(())
}

#[async_trait]
impl Connection for MemoryLog {
    fn capabilities(&self) -> Capabilities {
        Capabilities {
            native_rollup: self.config.native_rollup,
        }
    }

    async fn publish(&self, topic: &str, payload: Bytes, headers: Headers) -> Result<PublishAck, TransportError> {
        let sequence = self.append(topic, payload, headers)?;
        Ok(PublishAck { sequence })
    }

    async fn subscribe(&self, topic: &str, policy: DeliverPolicy) -> Result<Subscription, TransportError> {
        self.open(topic, policy)
    }

    async fn last_marked(&self, topic: &str, header: &str) -> Result<Option<u64>, TransportError> {
        self.find_last_marked(topic, header)
    }
}

/// Connects in-process engines straight to a [`MemoryLog`]
#[derive(Clone)]
pub struct MemoryConnector {
    log: Arc<MemoryLog>,
}

impl MemoryConnector {
    pub fn log(&self) -> &Arc<MemoryLog> {
        &self.log
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self) -> Result<Arc<dyn Connection>, TransportError> {
        self.log.check_reachable()?;
        Ok(self.log.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;
    use roomsync_core::Entry;
    use std::time::Duration;

    const TOPIC: &str = "rooms.r1";

    fn payload(text: &'static str) -> Bytes {
        Bytes::from_static(text.as_bytes())
    }

    async fn next(subscription: &mut Subscription) -> Result<Entry, TransportError> {
        tokio::time::timeout(Duration::from_secs(1), subscription.next())
            .await
            .expect("no entry in time")
            .expect("subscription ended")
    }

    async fn sequences(log: &MemoryLog, policy: DeliverPolicy, count: usize) -> Vec<u64> {
        let mut subscription = log.open(TOPIC, policy).unwrap();
        let mut seen = Vec::new();
        for _ in 0..count {
            seen.push(next(&mut subscription).await.unwrap().sequence);
        }
        seen
    }

    #[tokio::test]
    async fn test_sequences_start_at_one() {
        let log = MemoryLog::new();

        assert_eq!(log.append(TOPIC, payload("a"), Headers::new()).unwrap(), 1);
        assert_eq!(log.append(TOPIC, payload("b"), Headers::new()).unwrap(), 2);
        assert_eq!(log.append("rooms.other", payload("c"), Headers::new()).unwrap(), 1);
    }

    #[tokio::test]
    async fn test_rollup_purges_earlier_entries() {
        let log = MemoryLog::new();
        log.append(TOPIC, payload("a"), Headers::new()).unwrap();
        log.append(TOPIC, payload("b"), Headers::new()).unwrap();
        let clear = log.append(TOPIC, payload("clear"), Headers::rollup()).unwrap();
        log.append(TOPIC, payload("c"), Headers::new()).unwrap();

        assert_eq!(clear, 3);
        assert_eq!(sequences(&log, DeliverPolicy::All, 2).await, vec![3, 4]);
        assert_eq!(log.stats().entry_count, 2);
    }

    #[tokio::test]
    async fn test_rollup_rejected_without_native_support() {
        let log = MemoryLog::with_config(LogConfig {
            native_rollup: false,
            ..Default::default()
        });

        let err = log.append(TOPIC, payload("clear"), Headers::rollup()).unwrap_err();
        assert!(matches!(err, TransportError::PublishRejected(_)));
        assert!(!log.capabilities().native_rollup);
    }

    #[tokio::test]
    async fn test_replay_then_live_without_gap() {
        let log = MemoryLog::new();
        log.append(TOPIC, payload("a"), Headers::new()).unwrap();

        let mut subscription = log.open(TOPIC, DeliverPolicy::All).unwrap();
        log.append(TOPIC, payload("b"), Headers::new()).unwrap();

        assert_eq!(next(&mut subscription).await.unwrap().payload, payload("a"));
        assert_eq!(next(&mut subscription).await.unwrap().payload, payload("b"));
    }

    #[tokio::test]
    async fn test_from_sequence() {
        let log = MemoryLog::new();
        for text in ["a", "b", "c"] {
            log.append(TOPIC, payload(text), Headers::new()).unwrap();
        }

        assert_eq!(sequences(&log, DeliverPolicy::FromSequence(2), 2).await, vec![2, 3]);

        // Starting past the end only sees what comes later
        let mut subscription = log.open(TOPIC, DeliverPolicy::FromSequence(5)).unwrap();
        log.append(TOPIC, payload("d"), Headers::new()).unwrap();
        log.append(TOPIC, payload("e"), Headers::new()).unwrap();
        assert_eq!(next(&mut subscription).await.unwrap().sequence, 5);
    }

    #[tokio::test]
    async fn test_last_marked() {
        let log = MemoryLog::new();
        assert_eq!(log.find_last_marked(TOPIC, "Roomsync-Compaction").unwrap(), None);

        log.append(TOPIC, payload("a"), Headers::new()).unwrap();
        log.append(TOPIC, payload("clear"), Headers::compaction_marker()).unwrap();
        log.append(TOPIC, payload("b"), Headers::new()).unwrap();
        log.append(TOPIC, payload("clear"), Headers::compaction_marker()).unwrap();
        log.append(TOPIC, payload("c"), Headers::new()).unwrap();

        assert_eq!(log.find_last_marked(TOPIC, "Roomsync-Compaction").unwrap(), Some(4));
    }

    #[tokio::test]
    async fn test_retention_drops_oldest() {
        let log = MemoryLog::with_config(LogConfig {
            max_entries_per_topic: Some(2),
            ..Default::default()
        });
        for text in ["a", "b", "c"] {
            log.append(TOPIC, payload(text), Headers::new()).unwrap();
        }

        assert_eq!(sequences(&log, DeliverPolicy::All, 2).await, vec![2, 3]);
        assert_eq!(log.stats().total_payload_bytes, 2);
    }

    #[tokio::test]
    async fn test_sever_ends_live_subscriptions() {
        let log = MemoryLog::new();
        let mut subscription = log.open(TOPIC, DeliverPolicy::All).unwrap();

        assert_eq!(log.sever(), 1);

        let err = next(&mut subscription).await.unwrap_err();
        assert!(matches!(err, TransportError::ConnectionLost(_)));
        assert!(subscription.next().await.is_none());
    }

    #[tokio::test]
    async fn test_slow_subscriber_lags() {
        let log = MemoryLog::with_config(LogConfig {
            live_buffer: 2,
            ..Default::default()
        });
        let mut subscription = log.open(TOPIC, DeliverPolicy::All).unwrap();
        for text in ["a", "b", "c", "d", "e"] {
            log.append(TOPIC, payload(text), Headers::new()).unwrap();
        }

        let err = next(&mut subscription).await.unwrap_err();
        assert_eq!(err, TransportError::Lagged(3));
    }

    #[tokio::test]
    async fn test_unreachable_log() {
        let log = Arc::new(MemoryLog::new());
        let connector = log.connector();
        log.set_reachable(false);

        assert!(matches!(connector.connect().await, Err(TransportError::Unreachable(_))));
        assert!(matches!(
            log.append(TOPIC, payload("a"), Headers::new()),
            Err(TransportError::Unreachable(_))
        ));

        log.set_reachable(true);
        assert!(connector.connect().await.is_ok());
    }

    #[tokio::test]
    async fn test_invalid_topic() {
        let log = MemoryLog::new();
        assert!(log.append("", payload("a"), Headers::new()).is_err());
        assert!(log.open("rooms. x", DeliverPolicy::All).is_err());
    }

    #[test]
    fn test_config_defaults_from_partial() {
        let config: LogConfig = serde_json::from_str(r#"{"native_rollup":false}"#).unwrap();
        assert!(!config.native_rollup);
        assert_eq!(config.live_buffer, 1024);
        assert_eq!(config.max_entries_per_topic, None);
    }
}
