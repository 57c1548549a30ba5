//! Room Sync Engine - local marker state kept in step with a room's log
//!
//! Local mutations are applied and shown first, then published. A consumption
//! task replays the room topic from its start (or its latest compaction point)
//! and applies every entry, including this client's own, through one
//! idempotent apply path:
//!
//! ```text
//! add_local_marker ──► MarkerSet ──► observers ──► publish ─┐
//!                                                            ▼
//!                 apply ◄── decode ◄── subscription ◄── rooms.<roomId>
//! ```

use crate::config::{CompactionMode, EngineConfig};
use crate::error::{Result, SyncError, TransportError};
use crate::identity::ClientId;
use crate::marker::{Color, Marker, MarkerSet, Position};
use crate::observer::{StateObserver, SyncWarning};
use crate::session::ClientSession;
use crate::transport::{Connection, Connector, DeliverPolicy, Entry, Headers, PublishAck, Subscription};
use futures_util::StreamExt;
use parking_lot::{Mutex, RwLock};
use roomsync_protocol::headers::COMPACTION_HEADER;
use roomsync_protocol::{decode, encode, Decoded, Message};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

/// Subscription lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    Disconnected,
    Subscribing,
    Streaming,
    Closed,
}

impl std::fmt::Display for SyncState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SyncState::Disconnected => write!(f, "disconnected"),
            SyncState::Subscribing => write!(f, "subscribing"),
            SyncState::Streaming => write!(f, "streaming"),
            SyncState::Closed => write!(f, "closed"),
        }
    }
}

/// What applying one inbound mutation did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Applied {
    Added,
    /// Our own `add-marker` coming back from the log
    EchoSuppressed,
    Cleared,
    /// Unknown type or unusable fields
    Ignored,
    /// Sequence at or below the cursor
    Duplicate,
    /// The session was shut down
    Closed,
}

/// State guarded together so a shutdown is atomic with respect to applies
struct Shared {
    markers: MarkerSet,
    state: SyncState,
    /// Our own markers whose publish may still come back from the log
    pending: Vec<Marker>,
    /// Sequence of the last entry taken from the subscription
    cursor: Option<u64>,
    /// Bumped on every marker-set change
    version: u64,
}

struct Inner {
    session: ClientSession,
    topic: String,
    config: EngineConfig,
    connector: Arc<dyn Connector>,
    connection: RwLock<Option<Arc<dyn Connection>>>,
    shared: Mutex<Shared>,
    observers: RwLock<Vec<Arc<dyn StateObserver>>>,
    /// Marker-set version last handed to observers
    delivered: Mutex<u64>,
    started: AtomicBool,
    shutdown: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

/// Keeps one client's marker set in sync with its room
///
/// Cloning is cheap; clones share the same session.
#[derive(Clone)]
pub struct RoomSyncEngine {
    inner: Arc<Inner>,
}

impl RoomSyncEngine {
    pub fn new(session: ClientSession, connector: Arc<dyn Connector>) -> Self {
        Self::with_config(session, connector, EngineConfig::default())
    }

    pub fn with_config(session: ClientSession, connector: Arc<dyn Connector>, config: EngineConfig) -> Self {
        let (shutdown, _) = watch::channel(false);
        let topic = session.topic();

        Self {
            inner: Arc::new(Inner {
                session,
                topic,
                config,
                connector,
                connection: RwLock::new(None),
                shared: Mutex::new(Shared {
                    markers: MarkerSet::new(),
                    pending: Vec::new(),
                    state: SyncState::Disconnected,
                    cursor: None,
                    version: 0,
                }),
                observers: RwLock::new(Vec::new()),
                delivered: Mutex::new(0),
                started: AtomicBool::new(false),
                shutdown,
                task: Mutex::new(None),
            }),
        }
    }

    pub fn session(&self) -> &ClientSession {
        &self.inner.session
    }

    pub fn topic(&self) -> &str {
        &self.inner.topic
    }

    pub fn state(&self) -> SyncState {
        self.inner.shared.lock().state
    }

    /// Current markers in arrival order
    pub fn markers(&self) -> Vec<Marker> {
        self.inner.shared.lock().markers.to_vec()
    }

    pub fn cursor(&self) -> Option<u64> {
        self.inner.shared.lock().cursor
    }

    /// Register an observer; it immediately receives the current marker set
    pub fn observe(&self, observer: Arc<dyn StateObserver>) {
        // Holding `delivered` orders this snapshot against concurrent notifications
        let _delivered = self.inner.delivered.lock();
        self.inner.observers.write().push(observer.clone());
        let markers = self.markers();
        observer.markers_changed(&markers);
    }

    /// Connect, subscribe and spawn the consumption task
    ///
    /// Call once the front end is ready to render. Fails with the transport's
    /// error when the log cannot be reached; local mutations keep working.
    pub async fn start(&self) -> Result<()> {
        if self.state() == SyncState::Closed {
            return Err(SyncError::Closed);
        }
        if self.inner.started.swap(true, Ordering::SeqCst) {
            return Err(SyncError::AlreadyStarted);
        }

        let subscription = match self.establish().await {
            Ok(subscription) => subscription,
            Err(e) => {
                self.inner.started.store(false, Ordering::SeqCst);
                self.drop_connection();
                self.set_state(SyncState::Disconnected);
                warn!(room = %self.inner.session.room_id(), error = %e, "Failed to start room sync");
                return Err(e.into());
            }
        };

        let engine = self.clone();
        let shutdown = self.inner.shutdown.subscribe();
        let task = tokio::spawn(async move { engine.consume(subscription, shutdown).await });
        *self.inner.task.lock() = Some(task);

        Ok(())
    }

    /// Show a marker locally, then publish it to the room
    ///
    /// The marker stays even if publishing fails; the error carries the
    /// reason and observers get a [`SyncWarning::Unpublished`].
    pub async fn add_local_marker(&self, position: Position) -> Result<Marker> {
        if !position.is_finite() {
            return Err(SyncError::InvalidPosition {
                lat: position.lat,
                lng: position.lng,
            });
        }

        let session = &self.inner.session;
        let marker = Marker::new(session.client_id().clone(), position, session.color().clone());
        {
            let mut shared = self.inner.shared.lock();
            if shared.state == SyncState::Closed {
                return Err(SyncError::Closed);
            }
            shared.markers.push(marker.clone());
            shared.pending.push(marker.clone());
            shared.version += 1;
        }
        self.notify_markers();

        let message = Message::add_marker(
            session.client_id().as_str(),
            position.lat,
            position.lng,
            session.color().as_str(),
        );
        let connection = self.connection();
        if let Err(e) = self.publish(connection, message, Headers::new()).await {
            // Never reaches the log, so no echo will retire it
            let mut shared = self.inner.shared.lock();
            if let Some(index) = shared.pending.iter().rposition(|m| m == &marker) {
                shared.pending.remove(index);
            }
            return Err(e);
        }

        Ok(marker)
    }

    /// Empty the marker set locally, then publish a compacting `clear`
    pub async fn clear_all(&self) -> Result<()> {
        {
            let mut shared = self.inner.shared.lock();
            if shared.state == SyncState::Closed {
                return Err(SyncError::Closed);
            }
            shared.markers.clear();
            shared.version += 1;
        }
        self.notify_markers();

        let connection = self.connection();
        let headers = match connection.as_deref() {
            Some(c) if !self.uses_compaction_markers(c) => Headers::rollup(),
            Some(_) => Headers::compaction_marker(),
            // Not connected: the publish fails anyway, label it the portable way
            None => Headers::compaction_marker(),
        };
        let message = Message::clear(self.inner.session.client_id().as_str());
        self.publish(connection, message, headers).await?;

        Ok(())
    }

    /// Apply one inbound mutation
    ///
    /// Safe for both our own and other clients' mutations. Never fails;
    /// anything unusable is logged and ignored.
    pub fn apply_remote(&self, decoded: Decoded) -> Applied {
        self.apply(decoded, None)
    }

    /// Stop the consumption task; no apply takes effect after this returns
    pub async fn shutdown(&self) {
        {
            let mut shared = self.inner.shared.lock();
            if shared.state == SyncState::Closed {
                return;
            }
            shared.state = SyncState::Closed;
        }
        self.notify_state(SyncState::Closed);
        self.inner.shutdown.send_replace(true);

        let task = self.inner.task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!(room = %self.inner.session.room_id(), error = %e, "Consumption task ended abnormally");
            }
        }
        self.drop_connection();

        info!(
            room = %self.inner.session.room_id(),
            client = %self.inner.session.client_id(),
            "Room session closed"
        );
    }

    fn apply(&self, decoded: Decoded, sequence: Option<u64>) -> Applied {
        let applied = {
            let mut shared = self.inner.shared.lock();
            if shared.state == SyncState::Closed {
                return Applied::Closed;
            }
            if let Some(sequence) = sequence {
                if shared.cursor.map_or(false, |cursor| sequence <= cursor) {
                    return Applied::Duplicate;
                }
                shared.cursor = Some(sequence);
            }

            match decoded {
                Decoded::Message(Message::AddMarker { id, lat, lng, color })
                    if self.inner.session.client_id() == id.as_str() =>
                {
                    let position = Position::new(lat, lng);
                    if let Some(index) = shared
                        .pending
                        .iter()
                        .position(|m| m.position == position && m.color.as_str() == color)
                    {
                        shared.pending.remove(index);
                    }
                    Applied::EchoSuppressed
                }
                Decoded::Message(Message::AddMarker { id, lat, lng, color }) => match remote_marker(id, lat, lng, color) {
                    Ok(marker) => {
                        shared.markers.push(marker);
                        shared.version += 1;
                        Applied::Added
                    }
                    Err(e) => {
                        warn!(room = %self.inner.session.room_id(), error = %e, "Ignoring unusable marker");
                        Applied::Ignored
                    }
                },
                Decoded::Message(Message::Clear { id }) => {
                    let dropped = shared.markers.clear();
                    // Anything still awaiting its echo was published after this clear
                    let kept = shared.pending.clone();
                    for marker in kept {
                        shared.markers.push(marker);
                    }
                    shared.version += 1;
                    debug!(
                        room = %self.inner.session.room_id(),
                        origin = %id,
                        dropped = dropped,
                        kept = shared.pending.len(),
                        "Room cleared"
                    );
                    Applied::Cleared
                }
                Decoded::Unknown { kind } => {
                    debug!(room = %self.inner.session.room_id(), kind = ?kind, "Ignoring unknown message type");
                    Applied::Ignored
                }
            }
        };

        if matches!(applied, Applied::Added | Applied::Cleared) {
            self.notify_markers();
        }
        applied
    }

    fn handle_entry(&self, entry: Entry) {
        match decode(&entry.payload) {
            Ok(decoded) => {
                let applied = self.apply(decoded, Some(entry.sequence));
                trace!(sequence = entry.sequence, applied = ?applied, "Applied entry");
            }
            Err(e) => {
                warn!(
                    room = %self.inner.session.room_id(),
                    sequence = entry.sequence,
                    error = %e,
                    "Skipping malformed entry"
                );
                let mut shared = self.inner.shared.lock();
                if shared.state != SyncState::Closed && shared.cursor.map_or(true, |c| c < entry.sequence) {
                    shared.cursor = Some(entry.sequence);
                }
            }
        }
    }

    async fn consume(self, mut subscription: Subscription, mut shutdown: watch::Receiver<bool>) {
        info!(room = %self.inner.session.room_id(), topic = %self.inner.topic, "Consuming room log");

        loop {
            let error = loop {
                tokio::select! {
                    biased;
                    _ = shutdown.wait_for(|closed| *closed) => return,
                    next = subscription.next() => match next {
                        Some(Ok(entry)) => self.handle_entry(entry),
                        Some(Err(e)) => break e,
                        None => break TransportError::Closed,
                    },
                }
            };

            warn!(room = %self.inner.session.room_id(), error = %error, "Room subscription interrupted");
            if error.is_connection_fatal() {
                self.drop_connection();
            }

            match self.resubscribe(&mut shutdown, error).await {
                Some(next) => subscription = next,
                None => return,
            }
        }
    }

    /// Re-open the subscription from the cursor, backing off between attempts
    async fn resubscribe(
        &self,
        shutdown: &mut watch::Receiver<bool>,
        mut last_error: TransportError,
    ) -> Option<Subscription> {
        if !self.set_state(SyncState::Subscribing) {
            return None;
        }

        let backoff = &self.inner.config.backoff;
        let mut attempts = 0u32;

        loop {
            if backoff.exhausted(attempts) {
                warn!(
                    room = %self.inner.session.room_id(),
                    attempts = attempts,
                    error = %last_error,
                    "Giving up on room subscription, continuing local-only"
                );
                self.drop_connection();
                self.inner.started.store(false, Ordering::SeqCst);
                if self.set_state(SyncState::Disconnected) {
                    self.raise(SyncWarning::ConnectionLost {
                        error: last_error.to_string(),
                        attempts,
                    });
                }
                return None;
            }

            let delay = backoff.delay(attempts);
            attempts += 1;
            tokio::select! {
                biased;
                _ = shutdown.wait_for(|closed| *closed) => return None,
                _ = tokio::time::sleep(delay) => {}
            }

            let result = match self.connection() {
                Some(connection) => self.open_subscription(connection.as_ref()).await,
                None => match self.inner.connector.connect().await {
                    Ok(connection) => {
                        *self.inner.connection.write() = Some(connection.clone());
                        self.open_subscription(connection.as_ref()).await
                    }
                    Err(e) => Err(e),
                },
            };

            match result {
                Ok(subscription) => {
                    if !self.set_state(SyncState::Streaming) {
                        return None;
                    }
                    info!(room = %self.inner.session.room_id(), attempts = attempts, "Room subscription restored");
                    return Some(subscription);
                }
                Err(e) => {
                    debug!(room = %self.inner.session.room_id(), attempt = attempts, error = %e, "Re-subscribe failed");
                    if e.is_connection_fatal() {
                        self.drop_connection();
                    }
                    last_error = e;
                }
            }
        }
    }

    async fn establish(&self) -> std::result::Result<Subscription, TransportError> {
        let connection = self.inner.connector.connect().await?;
        info!(
            room = %self.inner.session.room_id(),
            client = %self.inner.session.client_id(),
            native_rollup = connection.capabilities().native_rollup,
            "Connected to room log"
        );
        *self.inner.connection.write() = Some(connection.clone());
        self.set_state(SyncState::Subscribing);

        let subscription = self.open_subscription(connection.as_ref()).await?;
        self.set_state(SyncState::Streaming);
        Ok(subscription)
    }

    async fn open_subscription(
        &self,
        connection: &dyn Connection,
    ) -> std::result::Result<Subscription, TransportError> {
        let cursor = self.cursor();
        let policy = match cursor {
            Some(sequence) => DeliverPolicy::FromSequence(sequence + 1),
            // Any participant may have cleared with a marker, whatever the log supports
            None => match connection.last_marked(&self.inner.topic, COMPACTION_HEADER).await? {
                Some(sequence) => DeliverPolicy::FromSequence(sequence),
                None => DeliverPolicy::All,
            },
        };

        debug!(room = %self.inner.session.room_id(), policy = ?policy, "Subscribing to room log");
        connection.subscribe(&self.inner.topic, policy).await
    }

    async fn publish(
        &self,
        connection: Option<Arc<dyn Connection>>,
        message: Message,
        headers: Headers,
    ) -> Result<PublishAck> {
        let kind = message.kind();
        let payload = encode(&message)?;

        let result = match connection {
            Some(connection) => connection.publish(&self.inner.topic, payload, headers).await,
            None => Err(TransportError::Unreachable("not connected".into())),
        };

        match result {
            Ok(ack) => {
                debug!(room = %self.inner.session.room_id(), kind = kind, sequence = ack.sequence, "Published mutation");
                Ok(ack)
            }
            Err(e) => {
                warn!(
                    room = %self.inner.session.room_id(),
                    kind = kind,
                    error = %e,
                    "Mutation applied locally but not published"
                );
                self.raise(SyncWarning::Unpublished {
                    kind,
                    error: e.to_string(),
                });
                Err(SyncError::Unpublished { kind, source: e })
            }
        }
    }

    fn uses_compaction_markers(&self, connection: &dyn Connection) -> bool {
        self.inner.config.compaction == CompactionMode::Marker || !connection.capabilities().native_rollup
    }

    fn connection(&self) -> Option<Arc<dyn Connection>> {
        self.inner.connection.read().clone()
    }

    fn drop_connection(&self) {
        self.inner.connection.write().take();
    }

    /// Move to `to` unless closed; returns whether the transition happened
    fn set_state(&self, to: SyncState) -> bool {
        {
            let mut shared = self.inner.shared.lock();
            if shared.state == SyncState::Closed {
                return false;
            }
            if shared.state == to {
                return true;
            }
            shared.state = to;
        }
        debug!(room = %self.inner.session.room_id(), state = %to, "Sync state changed");
        self.notify_state(to);
        true
    }

    fn observers(&self) -> Vec<Arc<dyn StateObserver>> {
        self.inner.observers.read().clone()
    }

    /// Hand the newest marker set to observers, at most once per version
    fn notify_markers(&self) {
        let mut delivered = self.inner.delivered.lock();
        let (version, markers) = {
            let shared = self.inner.shared.lock();
            (shared.version, shared.markers.to_vec())
        };
        if version == *delivered {
            return;
        }
        *delivered = version;

        for observer in self.observers() {
            observer.markers_changed(&markers);
        }
    }

    fn notify_state(&self, state: SyncState) {
        for observer in self.observers() {
            observer.state_changed(state);
        }
    }

    fn raise(&self, warning: SyncWarning) {
        for observer in self.observers() {
            observer.warning(&warning);
        }
    }
}

fn remote_marker(id: String, lat: f64, lng: f64, color: String) -> Result<Marker> {
    Ok(Marker::new(ClientId::new(id)?, Position::new(lat, lng), Color::new(color)?))
}

impl std::fmt::Debug for RoomSyncEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RoomSyncEngine")
            .field("session", &self.inner.session)
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BackoffConfig;
    use crate::identity::RoomId;
    use crate::transport::Capabilities;
    use async_trait::async_trait;
    use bytes::Bytes;
    use std::sync::atomic::AtomicU64;
    use std::time::Duration;
    use tokio::sync::mpsc;

    type Feed = mpsc::UnboundedSender<std::result::Result<Entry, TransportError>>;

    /// Scripted log: records publishes, lets the test drive deliveries
    #[derive(Default)]
    struct FakeLog {
        native_rollup: bool,
        published: Mutex<Vec<Entry>>,
        next_sequence: AtomicU64,
        subscribes: Mutex<Vec<DeliverPolicy>>,
        feeds: Mutex<Vec<Feed>>,
        marked: Mutex<Option<u64>>,
        fail_publish: AtomicBool,
        refuse_connect: AtomicBool,
        events: Mutex<Vec<String>>,
    }

    impl FakeLog {
        fn new(native_rollup: bool) -> Arc<Self> {
            Arc::new(Self {
                native_rollup,
                ..Default::default()
            })
        }

        fn feed(&self, item: std::result::Result<Entry, TransportError>) {
            let feeds = self.feeds.lock();
            feeds.last().expect("no subscription").send(item).unwrap();
        }

        fn feed_message(&self, sequence: u64, message: Message) {
            self.feed(Ok(entry(sequence, encode(&message).unwrap())));
        }
    }

    #[async_trait]
    impl Connection for FakeLog {
        fn capabilities(&self) -> Capabilities {
            Capabilities {
                native_rollup: self.native_rollup,
            }
        }

        async fn publish(
            &self,
            _topic: &str,
            payload: Bytes,
            headers: Headers,
        ) -> std::result::Result<PublishAck, TransportError> {
            if self.fail_publish.load(Ordering::SeqCst) {
                return Err(TransportError::ConnectionLost("socket closed".into()));
            }
            let sequence = self.next_sequence.fetch_add(1, Ordering::SeqCst) + 1;
            self.events.lock().push(format!("publish:{}", sequence));
            self.published.lock().push(Entry { sequence, payload, headers });
            Ok(PublishAck { sequence })
        }

        async fn subscribe(
            &self,
            _topic: &str,
            policy: DeliverPolicy,
        ) -> std::result::Result<Subscription, TransportError> {
            let (tx, rx) = mpsc::unbounded_channel();
            self.subscribes.lock().push(policy);
            self.feeds.lock().push(tx);
            Ok(futures_util::stream::unfold(rx, |mut rx| async move {
                rx.recv().await.map(|item| (item, rx))
            })
            .boxed())
        }

        async fn last_marked(&self, _topic: &str, _header: &str) -> std::result::Result<Option<u64>, TransportError> {
            Ok(*self.marked.lock())
        }
    }

    struct FakeConnector(Arc<FakeLog>);

    #[async_trait]
    impl Connector for FakeConnector {
        async fn connect(&self) -> std::result::Result<Arc<dyn Connection>, TransportError> {
            if self.0.refuse_connect.load(Ordering::SeqCst) {
                return Err(TransportError::Unreachable("connection refused".into()));
            }
            Ok(self.0.clone())
        }
    }

    #[derive(Default)]
    struct Recorder {
        log: Arc<FakeLog>,
        snapshots: Mutex<Vec<Vec<Marker>>>,
        states: Mutex<Vec<SyncState>>,
        warnings: Mutex<Vec<SyncWarning>>,
    }

    impl StateObserver for Recorder {
        fn markers_changed(&self, markers: &[Marker]) {
            self.log.events.lock().push(format!("markers:{}", markers.len()));
            self.snapshots.lock().push(markers.to_vec());
        }

        fn state_changed(&self, state: SyncState) {
            self.states.lock().push(state);
        }

        fn warning(&self, warning: &SyncWarning) {
            self.warnings.lock().push(warning.clone());
        }
    }

    fn entry(sequence: u64, payload: Bytes) -> Entry {
        Entry {
            sequence,
            payload,
            headers: Headers::new(),
        }
    }

    fn session(client: &str) -> ClientSession {
        ClientSession::with_parts(
            ClientId::new(client).unwrap(),
            RoomId::new("r1").unwrap(),
            Color::new("#AABBCC").unwrap(),
        )
    }

    fn fast_config() -> EngineConfig {
        EngineConfig {
            backoff: BackoffConfig {
                initial_delay_ms: 1,
                max_delay_ms: 5,
                multiplier: 2.0,
                max_attempts: Some(3),
            },
            ..Default::default()
        }
    }

    fn engine_with(client: &str, log: &Arc<FakeLog>) -> RoomSyncEngine {
        RoomSyncEngine::with_config(session(client), Arc::new(FakeConnector(log.clone())), fast_config())
    }

    fn add(id: &str, lat: f64, lng: f64) -> Decoded {
        Decoded::Message(Message::add_marker(id, lat, lng, "#112233"))
    }

    fn clear(id: &str) -> Decoded {
        Decoded::Message(Message::clear(id))
    }

    fn ids(engine: &RoomSyncEngine) -> Vec<String> {
        engine.markers().iter().map(|m| m.id.to_string()).collect()
    }

    async fn eventually(mut condition: impl FnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(2), async {
            while !condition() {
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    #[tokio::test]
    async fn test_own_echo_is_suppressed() {
        let log = FakeLog::new(true);
        let engine = engine_with("x1", &log);
        engine.start().await.unwrap();

        let marker = engine.add_local_marker(Position::new(1.0, 2.0)).await.unwrap();
        assert_eq!(engine.markers(), vec![marker]);

        let echo = log.published.lock()[0].clone();
        log.feed(Ok(echo));
        eventually(|| engine.cursor() == Some(1)).await;

        assert_eq!(engine.markers().len(), 1);
        assert_eq!(engine.apply_remote(add("x1", 1.0, 2.0)), Applied::EchoSuppressed);
        assert_eq!(engine.markers().len(), 1);

        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_own_marker_after_own_clear_survives_clear_echo() {
        let log = FakeLog::new(true);
        let x = engine_with("x1", &log);
        x.start().await.unwrap();

        x.clear_all().await.unwrap();
        x.add_local_marker(Position::new(1.0, 2.0)).await.unwrap();

        let published = log.published.lock().clone();
        for entry in published.iter().cloned() {
            log.feed(Ok(entry));
        }
        eventually(|| x.cursor() == Some(2)).await;

        // A replica that only ever saw the log agrees
        let y = engine_with("y1", &log);
        for entry in &published {
            y.apply_remote(decode(&entry.payload).unwrap());
        }
        assert_eq!(x.markers().len(), 1);
        assert_eq!(x.markers(), y.markers());

        x.shutdown().await;
    }

    #[tokio::test]
    async fn test_own_marker_after_remote_clear_survives() {
        let log = FakeLog::new(true);
        let x = engine_with("x1", &log);
        x.start().await.unwrap();

        // Someone else's clear takes sequence 1 before our add is published
        log.next_sequence.store(1, Ordering::SeqCst);
        let marker = x.add_local_marker(Position::new(1.0, 2.0)).await.unwrap();

        log.feed_message(1, Message::clear("other"));
        let echo = log.published.lock()[0].clone();
        assert_eq!(echo.sequence, 2);
        log.feed(Ok(echo));
        eventually(|| x.cursor() == Some(2)).await;

        assert_eq!(x.markers(), vec![marker]);

        // Once echoed it is no longer protected from later clears
        log.feed_message(3, Message::clear("other"));
        eventually(|| x.cursor() == Some(3)).await;
        assert!(x.markers().is_empty());

        x.shutdown().await;
    }

    #[tokio::test]
    async fn test_observer_registered_during_changes_sees_latest() {
        let log = FakeLog::new(true);
        let engine = engine_with("z1", &log);

        let writer = engine.clone();
        let handle = std::thread::spawn(move || {
            for i in 0..500 {
                writer.apply_remote(add("a", i as f64, 0.0));
            }
        });
        let recorder = Arc::new(Recorder::default());
        engine.observe(recorder.clone());
        handle.join().unwrap();

        assert_eq!(recorder.snapshots.lock().last().cloned(), Some(engine.markers()));
    }

    #[tokio::test]
    async fn test_remote_marker_from_other_client() {
        let log = FakeLog::new(true);
        let y = engine_with("y1", &log);

        let applied = y.apply_remote(Decoded::Message(Message::add_marker("x1", 1.0, 2.0, "#AABBCC")));

        assert_eq!(applied, Applied::Added);
        assert_eq!(
            y.markers(),
            vec![Marker::new(
                ClientId::new("x1").unwrap(),
                Position::new(1.0, 2.0),
                Color::new("#AABBCC").unwrap()
            )]
        );
    }

    #[tokio::test]
    async fn test_clear_then_replay_keeps_only_later_markers() {
        let log = FakeLog::new(true);
        let engine = engine_with("z1", &log);

        engine.apply_remote(add("a", 1.0, 1.0));
        engine.apply_remote(add("b", 2.0, 2.0));
        assert_eq!(engine.apply_remote(clear("a")), Applied::Cleared);
        engine.apply_remote(add("c", 3.0, 3.0));

        assert_eq!(ids(&engine), vec!["c"]);
    }

    #[tokio::test]
    async fn test_clear_on_empty_set_is_harmless() {
        let log = FakeLog::new(true);
        let engine = engine_with("z1", &log);

        assert_eq!(engine.apply_remote(clear("z1")), Applied::Cleared);
        assert_eq!(engine.apply_remote(clear("other")), Applied::Cleared);
        assert!(engine.markers().is_empty());
    }

    #[tokio::test]
    async fn test_arrival_order_is_preserved() {
        let log = FakeLog::new(true);
        let engine = engine_with("z1", &log);

        for id in ["c3", "c1", "c5", "c2", "c4"] {
            engine.apply_remote(add(id, 0.0, 0.0));
        }

        assert_eq!(ids(&engine), vec!["c3", "c1", "c5", "c2", "c4"]);
    }

    #[tokio::test]
    async fn test_unusable_entries_do_not_stop_the_loop() {
        let log = FakeLog::new(true);
        let engine = engine_with("z1", &log);
        engine.start().await.unwrap();

        log.feed(Ok(entry(1, Bytes::from_static(br#"{"type":"rotate-map","deg":90}"#))));
        log.feed(Ok(entry(2, Bytes::from_static(b"not json"))));
        log.feed(Ok(entry(3, Bytes::from_static(br#"{"type":"add-marker","id":"q","lat":1,"lng":1,"color":"blue"}"#))));
        log.feed_message(4, Message::add_marker("b", 5.0, 6.0, "#010203"));
        eventually(|| engine.cursor() == Some(4)).await;

        assert_eq!(ids(&engine), vec!["b"]);
        assert_eq!(engine.state(), SyncState::Streaming);

        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_duplicate_sequences_are_skipped() {
        let log = FakeLog::new(true);
        let engine = engine_with("z1", &log);
        engine.start().await.unwrap();

        log.feed_message(1, Message::add_marker("a", 1.0, 1.0, "#010203"));
        log.feed_message(1, Message::add_marker("a", 1.0, 1.0, "#010203"));
        log.feed_message(2, Message::add_marker("b", 1.0, 1.0, "#010203"));
        eventually(|| engine.cursor() == Some(2)).await;

        assert_eq!(ids(&engine), vec!["a", "b"]);

        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_local_marker_is_shown_before_publish() {
        let log = FakeLog::new(true);
        let engine = engine_with("x1", &log);
        let recorder = Arc::new(Recorder {
            log: log.clone(),
            ..Default::default()
        });
        engine.observe(recorder.clone());
        engine.start().await.unwrap();

        engine.add_local_marker(Position::new(1.0, 2.0)).await.unwrap();

        let events = log.events.lock().clone();
        assert_eq!(events, vec!["markers:0", "markers:1", "publish:1"]);

        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_publish_failure_keeps_optimistic_marker() {
        let log = FakeLog::new(true);
        let engine = engine_with("x1", &log);
        let recorder = Arc::new(Recorder::default());
        engine.observe(recorder.clone());
        engine.start().await.unwrap();
        log.fail_publish.store(true, Ordering::SeqCst);

        let err = engine.add_local_marker(Position::new(1.0, 2.0)).await.unwrap_err();

        assert!(matches!(err, SyncError::Unpublished { kind: "add-marker", .. }));
        assert_eq!(engine.markers().len(), 1);
        assert!(matches!(
            recorder.warnings.lock().as_slice(),
            [SyncWarning::Unpublished { kind: "add-marker", .. }]
        ));

        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_local_only_before_start() {
        let log = FakeLog::new(true);
        let engine = engine_with("x1", &log);

        let err = engine.add_local_marker(Position::new(1.0, 2.0)).await.unwrap_err();
        assert!(matches!(
            err,
            SyncError::Unpublished { source: TransportError::Unreachable(_), .. }
        ));
        assert_eq!(engine.markers().len(), 1);

        assert!(engine.clear_all().await.is_err());
        assert!(engine.markers().is_empty());
        assert!(log.published.lock().is_empty());
    }

    #[tokio::test]
    async fn test_rejects_non_finite_position() {
        let log = FakeLog::new(true);
        let engine = engine_with("x1", &log);

        let err = engine.add_local_marker(Position::new(f64::NAN, 0.0)).await.unwrap_err();
        assert!(matches!(err, SyncError::InvalidPosition { .. }));
        assert!(engine.markers().is_empty());
    }

    #[tokio::test]
    async fn test_clear_uses_rollup_on_native_log() {
        let log = FakeLog::new(true);
        let engine = engine_with("x1", &log);
        engine.start().await.unwrap();

        engine.add_local_marker(Position::new(1.0, 2.0)).await.unwrap();
        engine.clear_all().await.unwrap();

        let published = log.published.lock().clone();
        assert!(published[0].headers.is_empty());
        assert!(published[1].headers.is_rollup());
        assert_eq!(
            decode(&published[1].payload).unwrap(),
            Decoded::Message(Message::clear("x1"))
        );
        assert!(engine.markers().is_empty());

        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_clear_uses_marker_without_native_rollup() {
        let log = FakeLog::new(false);
        let engine = engine_with("x1", &log);
        engine.start().await.unwrap();

        engine.clear_all().await.unwrap();

        let published = log.published.lock().clone();
        assert!(!published[0].headers.is_rollup());
        assert!(published[0].headers.contains(COMPACTION_HEADER));

        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_fallback_subscribes_from_last_marker() {
        let log = FakeLog::new(false);
        *log.marked.lock() = Some(5);
        let engine = engine_with("z1", &log);

        engine.start().await.unwrap();

        assert_eq!(log.subscribes.lock().clone(), vec![DeliverPolicy::FromSequence(5)]);
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_native_log_subscribes_from_origin() {
        let log = FakeLog::new(true);
        let engine = engine_with("z1", &log);

        engine.start().await.unwrap();

        assert_eq!(log.subscribes.lock().clone(), vec![DeliverPolicy::All]);
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_native_log_still_honours_compaction_marker() {
        // Another participant cleared with `compaction = "marker"`
        let log = FakeLog::new(true);
        *log.marked.lock() = Some(5);
        let engine = engine_with("z1", &log);

        engine.start().await.unwrap();

        assert_eq!(log.subscribes.lock().clone(), vec![DeliverPolicy::FromSequence(5)]);
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_resumes_from_cursor_after_interruption() {
        let log = FakeLog::new(true);
        let engine = engine_with("z1", &log);
        engine.start().await.unwrap();

        log.feed_message(1, Message::add_marker("a", 1.0, 1.0, "#010203"));
        log.feed_message(2, Message::add_marker("b", 1.0, 1.0, "#010203"));
        log.feed(Err(TransportError::ConnectionLost("reset by peer".into())));

        eventually(|| log.subscribes.lock().len() == 2 && engine.state() == SyncState::Streaming).await;
        assert_eq!(
            log.subscribes.lock().clone(),
            vec![DeliverPolicy::All, DeliverPolicy::FromSequence(3)]
        );

        log.feed_message(3, Message::add_marker("c", 1.0, 1.0, "#010203"));
        eventually(|| engine.cursor() == Some(3)).await;
        assert_eq!(ids(&engine), vec!["a", "b", "c"]);

        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_gives_up_after_max_attempts() {
        let log = FakeLog::new(true);
        let engine = engine_with("z1", &log);
        let recorder = Arc::new(Recorder::default());
        engine.observe(recorder.clone());
        engine.start().await.unwrap();

        log.refuse_connect.store(true, Ordering::SeqCst);
        log.feed(Err(TransportError::ConnectionLost("gone".into())));

        eventually(|| engine.state() == SyncState::Disconnected).await;
        assert!(matches!(
            recorder.warnings.lock().as_slice(),
            [SyncWarning::ConnectionLost { attempts: 3, .. }]
        ));

        // Local-only mode keeps working
        assert!(engine.add_local_marker(Position::new(1.0, 1.0)).await.is_err());
        assert_eq!(engine.markers().len(), 1);

        // And the session can be started again once the log is back
        log.refuse_connect.store(false, Ordering::SeqCst);
        engine.start().await.unwrap();
        assert_eq!(engine.state(), SyncState::Streaming);

        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_start_fails_when_unreachable() {
        let log = FakeLog::new(true);
        log.refuse_connect.store(true, Ordering::SeqCst);
        let engine = engine_with("z1", &log);

        let err = engine.start().await.unwrap_err();
        assert!(matches!(err, SyncError::Transport(TransportError::Unreachable(_))));
        assert_eq!(engine.state(), SyncState::Disconnected);

        log.refuse_connect.store(false, Ordering::SeqCst);
        engine.start().await.unwrap();
        assert!(matches!(engine.start().await, Err(SyncError::AlreadyStarted)));

        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_state_transitions() {
        let log = FakeLog::new(true);
        let engine = engine_with("z1", &log);
        let recorder = Arc::new(Recorder::default());
        engine.observe(recorder.clone());
        assert_eq!(engine.state(), SyncState::Disconnected);

        engine.start().await.unwrap();
        engine.shutdown().await;

        assert_eq!(
            recorder.states.lock().clone(),
            vec![SyncState::Subscribing, SyncState::Streaming, SyncState::Closed]
        );
    }

    #[tokio::test]
    async fn test_nothing_applies_after_shutdown() {
        let log = FakeLog::new(true);
        let engine = engine_with("z1", &log);
        engine.start().await.unwrap();
        engine.apply_remote(add("a", 1.0, 1.0));

        engine.shutdown().await;

        assert_eq!(engine.state(), SyncState::Closed);
        assert_eq!(engine.apply_remote(add("b", 1.0, 1.0)), Applied::Closed);
        assert_eq!(engine.apply_remote(clear("b")), Applied::Closed);
        assert_eq!(ids(&engine), vec!["a"]);
        assert!(matches!(engine.add_local_marker(Position::new(0.0, 0.0)).await, Err(SyncError::Closed)));
        assert!(matches!(engine.start().await, Err(SyncError::Closed)));

        // A late delivery finds no consumer and changes nothing
        let _ = log.feeds.lock().last().unwrap().send(Ok(entry(9, Bytes::new())));
        assert_eq!(engine.cursor(), None);

        engine.shutdown().await;
    }
}
