//! A participant joining after a clear
//!
//! Runs the same history twice, once against a log with native rollup and
//! once against one without, and shows that a late joiner never sees the
//! markers that were cleared. The second run goes through a WebSocket log
//! server, as `roomlogd` would serve it.
//!
//! Run with: cargo run --example late_joiner

use std::sync::Arc;
use std::time::Duration;

use roomsync_core::{ClientSession, Connector, Position, RoomId, RoomSyncEngine};
use roomsync_log::{LogConfig, MemoryLog};
use roomsync_transport::{LogServer, WsConnector};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    println!("Roomsync Late Joiner Example\n");

    println!("=== In-process log with native rollup ===\n");
    let log = Arc::new(MemoryLog::new());
    run(Arc::new(log.connector())).await?;
    println!("Retained entries: {}", log.stats().entry_count);

    println!("\n=== WebSocket log without native rollup ===\n");
    let log = Arc::new(MemoryLog::with_config(LogConfig {
        native_rollup: false,
        ..Default::default()
    }));
    let server = LogServer::bind(log.clone(), "127.0.0.1:0".parse()?).await?;
    let url = format!("ws://{}", server.local_addr()?);
    let handle = tokio::spawn(async move { server.run().await });
    run(Arc::new(WsConnector::new(url))).await?;
    println!("Retained entries: {}", log.stats().entry_count);
    handle.abort();

    Ok(())
}

async fn run(connector: Arc<dyn Connector>) -> Result<(), Box<dyn std::error::Error>> {
    let room = RoomId::new("demo")?;

    let a = RoomSyncEngine::new(ClientSession::new(room.clone()), connector.clone());
    a.start().await?;
    a.add_local_marker(Position::new(1.0, 1.0)).await?;
    a.add_local_marker(Position::new(2.0, 2.0)).await?;
    a.clear_all().await?;
    a.add_local_marker(Position::new(3.0, 3.0)).await?;

    let late = RoomSyncEngine::new(ClientSession::new(room), connector);
    late.start().await?;
    tokio::time::sleep(Duration::from_millis(100)).await;

    for marker in late.markers() {
        println!("Late joiner sees ({}, {}) from {}", marker.position.lat, marker.position.lng, marker.id);
    }

    a.shutdown().await;
    late.shutdown().await;
    Ok(())
}
