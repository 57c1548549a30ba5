//! WebSocket log server

use crate::handler::ConnectionHandler;
use crate::PROTOCOL_VERSION;
use futures_util::{SinkExt, StreamExt};
use roomsync_log::MemoryLog;
use roomsync_protocol::{ClientFrame, ErrorCode, ServerFrame};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::{accept_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

type ServerResult<T> = Result<T, Box<dyn std::error::Error + Send + Sync>>;

/// Serves a [`MemoryLog`] to participants over WebSocket
pub struct LogServer {
    log: Arc<MemoryLog>,
    listener: TcpListener,
    client_counter: AtomicU64,
}

impl LogServer {
    /// Bind the listening socket; port 0 picks a free port
    pub async fn bind(log: Arc<MemoryLog>, addr: SocketAddr) -> std::io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self {
            log,
            listener,
            client_counter: AtomicU64::new(0),
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn log(&self) -> &Arc<MemoryLog> {
        &self.log
    }

    /// Accept connections until the task is dropped
    pub async fn run(&self) -> ServerResult<()> {
        info!(addr = %self.listener.local_addr()?, "Roomsync log server listening");

        loop {
            match self.listener.accept().await {
                Ok((stream, peer_addr)) => {
                    let client_id = format!(
                        "ws:{}:{}",
                        peer_addr,
                        self.client_counter.fetch_add(1, Ordering::Relaxed)
                    );
                    let log = self.log.clone();

                    tokio::spawn(async move {
                        if let Err(e) = Self::handle_connection(stream, client_id.clone(), log).await {
                            error!(client = %client_id, error = %e, "WebSocket connection error");
                        }
                    });
                }
                Err(e) => {
                    error!(error = %e, "Failed to accept connection");
                }
            }
        }
    }

    async fn handle_connection(stream: TcpStream, client_id: String, log: Arc<MemoryLog>) -> ServerResult<()> {
        let ws_stream = accept_async(stream).await?;
        let (mut write, mut read) = ws_stream.split();

        info!(client = %client_id, "Participant connected");

        let welcome = ServerFrame::Welcome {
            version: PROTOCOL_VERSION.to_string(),
            native_rollup: log.config().native_rollup,
        };
        write.send(Message::Binary(welcome.encode()?)).await?;

        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel();
        let mut handler = ConnectionHandler::new(client_id.clone(), log, outbound_tx);

        loop {
            tokio::select! {
                msg = read.next() => {
                    let reply = match msg {
                        Some(Ok(Message::Binary(data))) => match ClientFrame::decode(&data) {
                            Ok(frame) => handler.handle(frame),
                            Err(e) => {
                                warn!(client = %client_id, error = %e, "Undecodable frame");
                                Some(ServerFrame::failed(0, ErrorCode::BadRequest, e.to_string()))
                            }
                        },
                        Some(Ok(Message::Text(_))) => {
                            Some(ServerFrame::failed(0, ErrorCode::BadRequest, "text frames are not supported"))
                        }
                        Some(Ok(Message::Ping(data))) => {
                            write.send(Message::Pong(data)).await?;
                            None
                        }
                        Some(Ok(Message::Close(_))) | None => {
                            info!(client = %client_id, "Participant disconnected");
                            break;
                        }
                        Some(Ok(_)) => None,
                        Some(Err(e)) => {
                            error!(client = %client_id, error = %e, "WebSocket read error");
                            break;
                        }
                    };

                    if let Some(reply) = reply {
                        write.send(Message::Binary(reply.encode()?)).await?;
                    }
                }

                // Entries and subscription endings from forwarding tasks
                frame = outbound_rx.recv() => {
                    // The handler holds a sender, so the channel never closes here
                    let Some(frame) = frame else { break };
                    if let Err(e) = write.send(Message::Binary(frame.encode()?)).await {
                        error!(client = %client_id, error = %e, "WebSocket write error");
                        break;
                    }
                }
            }
        }

        debug!(client = %client_id, subscriptions = handler.subscription_count(), "Cleaning up connection");
        handler.cleanup();
        Ok(())
    }
}
