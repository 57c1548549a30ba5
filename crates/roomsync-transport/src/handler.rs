//! Connection handler - serves frames from one participant against the log

use futures_util::StreamExt;
use roomsync_core::TransportError;
use roomsync_log::MemoryLog;
use roomsync_protocol::{ClientFrame, ErrorCode, ServerFrame};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Handles a single participant connection
///
/// Replies to requests are returned directly; entries for live
/// subscriptions are pushed into the connection's outbound queue by one
/// forwarding task per subscription.
pub struct ConnectionHandler {
    /// Unique connection ID
    pub client_id: String,
    log: Arc<MemoryLog>,
    outbound: mpsc::UnboundedSender<ServerFrame>,
    subscriptions: HashMap<u64, JoinHandle<()>>,
}

impl ConnectionHandler {
    pub fn new(client_id: String, log: Arc<MemoryLog>, outbound: mpsc::UnboundedSender<ServerFrame>) -> Self {
        Self {
            client_id,
            log,
            outbound,
            subscriptions: HashMap::new(),
        }
    }

    /// Process one frame, returning the reply if it expects one
    pub fn handle(&mut self, frame: ClientFrame) -> Option<ServerFrame> {
        debug!(client = %self.client_id, req = ?frame.req(), "Processing frame");

        match frame {
            ClientFrame::Publish {
                req,
                topic,
                payload,
                headers,
            } => Some(match self.log.append(&topic, payload, headers) {
                Ok(sequence) => ServerFrame::Published { req, sequence },
                Err(e) => {
                    warn!(client = %self.client_id, topic = %topic, error = %e, "Publish refused");
                    ServerFrame::failed(req, error_code(&e), e.to_string())
                }
            }),
            ClientFrame::Subscribe {
                req,
                sid,
                topic,
                policy,
            } => Some(match self.log.open(&topic, policy) {
                Ok(subscription) => {
                    self.forward(sid, subscription);
                    info!(client = %self.client_id, sid = sid, topic = %topic, policy = ?policy, "Subscribed");
                    ServerFrame::Subscribed { req, sid }
                }
                Err(e) => ServerFrame::failed(req, error_code(&e), e.to_string()),
            }),
            ClientFrame::Unsubscribe { sid } => {
                if let Some(task) = self.subscriptions.remove(&sid) {
                    task.abort();
                    debug!(client = %self.client_id, sid = sid, "Unsubscribed");
                }
                None
            }
            ClientFrame::LastMarked { req, topic, header } => {
                Some(match self.log.find_last_marked(&topic, &header) {
                    Ok(sequence) => ServerFrame::Marked { req, sequence },
                    Err(e) => ServerFrame::failed(req, error_code(&e), e.to_string()),
                })
            }
            ClientFrame::Ping { req } => Some(ServerFrame::Pong { req }),
        }
    }

    /// Number of live subscriptions on this connection
    pub fn subscription_count(&self) -> usize {
        self.subscriptions.values().filter(|task| !task.is_finished()).count()
    }

    /// Stop every forwarding task
    pub fn cleanup(&mut self) {
        for (_, task) in self.subscriptions.drain() {
            task.abort();
        }
    }

    fn forward(&mut self, sid: u64, mut subscription: roomsync_core::Subscription) {
        let outbound = self.outbound.clone();
        let client_id = self.client_id.clone();

        let task = tokio::spawn(async move {
            while let Some(item) = subscription.next().await {
                let frame = match item {
                    Ok(entry) => ServerFrame::Entry {
                        sid,
                        sequence: entry.sequence,
                        payload: entry.payload,
                        headers: entry.headers,
                    },
                    Err(e) => {
                        warn!(client = %client_id, sid = sid, error = %e, "Subscription ended");
                        let _ = outbound.send(ServerFrame::SubscriptionEnded {
                            sid,
                            code: error_code(&e),
                            message: e.to_string(),
                        });
                        return;
                    }
                };
                if outbound.send(frame).is_err() {
                    return;
                }
            }
        });

        if let Some(previous) = self.subscriptions.insert(sid, task) {
            previous.abort();
        }
    }
}

impl Drop for ConnectionHandler {
    fn drop(&mut self) {
        self.cleanup();
    }
}

/// Wire code for a log error
pub fn error_code(error: &TransportError) -> ErrorCode {
    match error {
        TransportError::PublishRejected(_) => ErrorCode::Rejected,
        TransportError::Lagged(_) => ErrorCode::Lagged,
        TransportError::Protocol(_) => ErrorCode::BadRequest,
        TransportError::Unreachable(_) | TransportError::ConnectionLost(_) | TransportError::Closed => {
            ErrorCode::Unavailable
        }
    }
}

/// Log error for a wire code; lag counts are not carried on the wire
pub fn transport_error(code: ErrorCode, message: String) -> TransportError {
    match code {
        ErrorCode::Rejected => TransportError::PublishRejected(message),
        ErrorCode::Lagged => TransportError::Lagged(0),
        ErrorCode::Unavailable => TransportError::ConnectionLost(message),
        ErrorCode::BadRequest => TransportError::Protocol(message),
    }
}
