//! WebSocket client side of the log protocol
//!
//! One socket per connection. Requests are matched to replies by `req` id and
//! live entries are routed to subscriptions by `sid`. If the socket drops,
//! every pending request fails and every subscription ends with
//! `ConnectionLost`.

use crate::handler::transport_error;
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, Stream, StreamExt};
use roomsync_core::transport::{Capabilities, DeliverPolicy, Headers};
use roomsync_core::{Connection, Connector, Entry, PublishAck, Subscription, TransportError};
use roomsync_protocol::{ClientFrame, ServerFrame};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, trace, warn};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;
type EntrySender = mpsc::UnboundedSender<Result<Entry, TransportError>>;

/// Default time to wait for a reply
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Connects to a `roomlogd` server at a `ws://` URL
#[derive(Debug, Clone)]
pub struct WsConnector {
    url: String,
    request_timeout: Duration,
}

impl WsConnector {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self) -> Result<Arc<dyn Connection>, TransportError> {
        let connection = WsConnection::connect(&self.url, self.request_timeout).await?;
        Ok(Arc::new(connection))
    }
}

/// Routing state shared by the connection, its reader and its subscriptions
struct Routes {
    pending: DashMap<u64, oneshot::Sender<ServerFrame>>,
    subscriptions: DashMap<u64, EntrySender>,
    closed: AtomicBool,
}

impl Routes {
    /// Mark closed, fail pending requests and end every subscription
    fn fail_all(&self, reason: &str) {
        self.closed.store(true, Ordering::SeqCst);
        // Dropping the senders wakes waiting requests
        self.pending.clear();

        let sids: Vec<u64> = self.subscriptions.iter().map(|s| *s.key()).collect();
        for sid in sids {
            if let Some((_, sender)) = self.subscriptions.remove(&sid) {
                let _ = sender.send(Err(TransportError::ConnectionLost(reason.to_string())));
            }
        }
    }

    fn route(&self, frame: ServerFrame) {
        match frame {
            ServerFrame::Entry {
                sid,
                sequence,
                payload,
                headers,
            } => {
                if let Some(sender) = self.subscriptions.get(&sid) {
                    let _ = sender.send(Ok(Entry {
                        sequence,
                        payload,
                        headers,
                    }));
                } else {
                    trace!(sid = sid, "Entry for unknown subscription");
                }
            }
            ServerFrame::SubscriptionEnded { sid, code, message } => {
                if let Some((_, sender)) = self.subscriptions.remove(&sid) {
                    let _ = sender.send(Err(transport_error(code, message)));
                }
            }
            ServerFrame::Welcome { .. } => warn!("Unexpected welcome frame"),
            ServerFrame::Published { req, .. }
            | ServerFrame::Subscribed { req, .. }
            | ServerFrame::Marked { req, .. }
            | ServerFrame::Failed { req, .. }
            | ServerFrame::Pong { req } => match self.pending.remove(&req) {
                Some((_, waiter)) => {
                    let _ = waiter.send(frame);
                }
                None => debug!(req = req, "Reply for unknown request"),
            },
        }
    }
}

/// An open connection to the log server
pub struct WsConnection {
    routes: Arc<Routes>,
    outbound: mpsc::UnboundedSender<Message>,
    capabilities: Capabilities,
    server_version: String,
    next_req: AtomicU64,
    next_sid: AtomicU64,
    request_timeout: Duration,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl WsConnection {
    /// Open the socket and wait for the server's welcome
    pub async fn connect(url: &str, request_timeout: Duration) -> Result<Self, TransportError> {
        let (socket, _) = connect_async(url)
            .await
            .map_err(|e| TransportError::Unreachable(format!("{}: {}", url, e)))?;
        let (write, mut read) = socket.split();

        let welcome = tokio::time::timeout(request_timeout, read.next())
            .await
            .map_err(|_| TransportError::Unreachable(format!("{}: no welcome from server", url)))?;
        let (server_version, native_rollup) = match welcome {
            Some(Ok(Message::Binary(data))) => match ServerFrame::decode(&data) {
                Ok(ServerFrame::Welcome { version, native_rollup }) => (version, native_rollup),
                Ok(other) => {
                    return Err(TransportError::Protocol(format!("expected welcome, got {:?}", other)));
                }
                Err(e) => return Err(TransportError::Protocol(e.to_string())),
            },
            Some(Ok(other)) => {
                return Err(TransportError::Protocol(format!("expected binary welcome, got {:?}", other)));
            }
            Some(Err(e)) => return Err(TransportError::ConnectionLost(e.to_string())),
            None => return Err(TransportError::ConnectionLost("closed before welcome".into())),
        };

        info!(url = %url, server_version = %server_version, native_rollup = native_rollup, "Connected to log server");

        let routes = Arc::new(Routes {
            pending: DashMap::new(),
            subscriptions: DashMap::new(),
            closed: AtomicBool::new(false),
        });
        let (outbound, outbound_rx) = mpsc::unbounded_channel();

        let reader = tokio::spawn(read_loop(read, routes.clone(), outbound.clone()));
        let writer = tokio::spawn(write_loop(write, outbound_rx, routes.clone()));

        Ok(Self {
            routes,
            outbound,
            capabilities: Capabilities { native_rollup },
            server_version,
            next_req: AtomicU64::new(1),
            next_sid: AtomicU64::new(1),
            request_timeout,
            reader,
            writer,
        })
    }

    pub fn server_version(&self) -> &str {
        &self.server_version
    }

    pub fn is_closed(&self) -> bool {
        self.routes.closed.load(Ordering::SeqCst)
    }

    /// Round trip to the server
    pub async fn ping(&self) -> Result<Duration, TransportError> {
        let started = Instant::now();
        self.request(|req| ClientFrame::Ping { req }).await?;
        Ok(started.elapsed())
    }

    async fn request(&self, build: impl FnOnce(u64) -> ClientFrame) -> Result<ServerFrame, TransportError> {
        let req = self.next_req.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.routes.pending.insert(req, tx);

        if self.is_closed() {
            self.routes.pending.remove(&req);
            return Err(TransportError::ConnectionLost("connection closed".into()));
        }

        let frame = build(req);
        if let Err(e) = self.send(&frame) {
            self.routes.pending.remove(&req);
            return Err(e);
        }

        match tokio::time::timeout(self.request_timeout, rx).await {
            Ok(Ok(ServerFrame::Failed { code, message, .. })) => Err(transport_error(code, message)),
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(TransportError::ConnectionLost("connection closed before reply".into())),
            Err(_) => {
                self.routes.pending.remove(&req);
                Err(TransportError::ConnectionLost(format!(
                    "no reply within {}ms",
                    self.request_timeout.as_millis()
                )))
            }
        }
    }

    fn send(&self, frame: &ClientFrame) -> Result<(), TransportError> {
        let data = frame.encode().map_err(|e| TransportError::Protocol(e.to_string()))?;
        self.outbound
            .send(Message::Binary(data))
            .map_err(|_| TransportError::ConnectionLost("connection closed".into()))
    }
}

impl Drop for WsConnection {
    fn drop(&mut self) {
        self.routes.fail_all("connection dropped");
        self.reader.abort();
        self.writer.abort();
    }
}

fn unexpected(reply: ServerFrame) -> TransportError {
    TransportError::Protocol(format!("unexpected reply {:?}", reply))
}

#[async_trait]
impl Connection for WsConnection {
    fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    async fn publish(&self, topic: &str, payload: Bytes, headers: Headers) -> Result<PublishAck, TransportError> {
        let reply = self
            .request(|req| ClientFrame::Publish {
                req,
                topic: topic.to_string(),
                payload,
                headers,
            })
            .await?;

        match reply {
            ServerFrame::Published { sequence, .. } => Ok(PublishAck { sequence }),
            other => Err(unexpected(other)),
        }
    }

    async fn subscribe(&self, topic: &str, policy: DeliverPolicy) -> Result<Subscription, TransportError> {
        let sid = self.next_sid.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        // Registered first: entries can arrive right behind the reply
        self.routes.subscriptions.insert(sid, tx);

        let reply = self
            .request(|req| ClientFrame::Subscribe {
                req,
                sid,
                topic: topic.to_string(),
                policy,
            })
            .await;

        match reply {
            Ok(ServerFrame::Subscribed { .. }) => Ok(RemoteSubscription {
                sid,
                entries: rx,
                routes: self.routes.clone(),
                outbound: self.outbound.clone(),
            }
            .boxed()),
            Ok(other) => {
                self.routes.subscriptions.remove(&sid);
                Err(unexpected(other))
            }
            Err(e) => {
                self.routes.subscriptions.remove(&sid);
                Err(e)
            }
        }
    }

    async fn last_marked(&self, topic: &str, header: &str) -> Result<Option<u64>, TransportError> {
        let reply = self
            .request(|req| ClientFrame::LastMarked {
                req,
                topic: topic.to_string(),
                header: header.to_string(),
            })
            .await?;

        match reply {
            ServerFrame::Marked { sequence, .. } => Ok(sequence),
            other => Err(unexpected(other)),
        }
    }
}

/// Entries for one `sid`; unsubscribes when dropped
struct RemoteSubscription {
    sid: u64,
    entries: mpsc::UnboundedReceiver<Result<Entry, TransportError>>,
    routes: Arc<Routes>,
    outbound: mpsc::UnboundedSender<Message>,
}

impl Stream for RemoteSubscription {
    type Item = Result<Entry, TransportError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.entries.poll_recv(cx)
    }
}

impl Drop for RemoteSubscription {
    fn drop(&mut self) {
        if self.routes.subscriptions.remove(&self.sid).is_some() {
            if let Ok(data) = (ClientFrame::Unsubscribe { sid: self.sid }).encode() {
                let _ = self.outbound.send(Message::Binary(data));
            }
        }
    }
}

async fn read_loop(mut read: SplitStream<Socket>, routes: Arc<Routes>, outbound: mpsc::UnboundedSender<Message>) {
    let reason = loop {
        match read.next().await {
            Some(Ok(Message::Binary(data))) => match ServerFrame::decode(&data) {
                Ok(frame) => routes.route(frame),
                Err(e) => warn!(error = %e, "Dropping undecodable frame"),
            },
            Some(Ok(Message::Ping(data))) => {
                let _ = outbound.send(Message::Pong(data));
            }
            Some(Ok(Message::Close(_))) | None => break "server closed the connection".to_string(),
            Some(Ok(_)) => {}
            Some(Err(e)) => break e.to_string(),
        }
    };

    warn!(reason = %reason, "Log connection lost");
    routes.fail_all(&reason);
}

async fn write_loop(
    mut write: SplitSink<Socket, Message>,
    mut outbound: mpsc::UnboundedReceiver<Message>,
    routes: Arc<Routes>,
) {
    while let Some(message) = outbound.recv().await {
        if let Err(e) = write.send(message).await {
            warn!(error = %e, "Log connection write failed");
            routes.fail_all(&e.to_string());
            return;
        }
    }
    let _ = write.close().await;
}
