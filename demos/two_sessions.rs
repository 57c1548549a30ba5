//! Two participants sharing one room
//!
//! Both sessions run in-process against a `MemoryLog`; one drops a marker and
//! the other sees it arrive in the sender's color.
//!
//! Run with: cargo run --example two_sessions

use std::sync::Arc;
use std::time::Duration;

use roomsync_core::identity::resolve_room_id;
use roomsync_core::{ClientSession, Position, RoomSyncEngine};
use roomsync_log::MemoryLog;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    println!("Roomsync Two Sessions Example\n");

    let log = Arc::new(MemoryLog::new());
    let room = resolve_room_id(None);
    println!("Room: {}\n", room);

    let x = RoomSyncEngine::new(ClientSession::new(room.clone()), Arc::new(log.connector()));
    let y = RoomSyncEngine::new(ClientSession::new(room), Arc::new(log.connector()));
    x.start().await?;
    y.start().await?;

    x.add_local_marker(Position::new(-6.2, 106.8)).await?;
    x.add_local_marker(Position::new(51.5, -0.12)).await?;
    y.add_local_marker(Position::new(40.7, -74.0)).await?;

    tokio::time::sleep(Duration::from_millis(100)).await;

    for (name, engine) in [("x", &x), ("y", &y)] {
        println!("{} ({}) sees:", name, engine.session().color());
        for marker in engine.markers() {
            println!(
                "  - ({:.2}, {:.2}) {} from {}",
                marker.position.lat, marker.position.lng, marker.color, marker.id
            );
        }
    }

    x.clear_all().await?;
    tokio::time::sleep(Duration::from_millis(100)).await;
    println!("\nAfter x clears: x has {}, y has {}", x.markers().len(), y.markers().len());

    x.shutdown().await;
    y.shutdown().await;

    Ok(())
}
