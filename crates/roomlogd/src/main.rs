//! Roomsync log daemon (roomlogd)
//!
//! Keeps one ordered, replayable log per room topic and serves it to
//! participants over WebSocket.
//!
//! # Usage
//!
//! ```bash
//! # Start with defaults (WebSocket on 7422)
//! roomlogd
//!
//! # Custom address
//! roomlogd --bind 127.0.0.1 --port 9000
//!
//! # A log without native rollup (clients fall back to compaction markers)
//! roomlogd --no-rollup --max-entries 10000
//!
//! # With configuration file
//! roomlogd --config /etc/roomsync/roomlogd.toml
//! ```

mod config;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use roomsync_log::MemoryLog;
use roomsync_transport::LogServer;

use crate::config::{DaemonConfig, FileConfig, Overrides};

/// Roomsync log daemon
#[derive(Parser, Debug)]
#[command(name = "roomlogd")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// WebSocket port to listen on [default: 7422]
    #[arg(long, env = "ROOMSYNC_PORT")]
    port: Option<u16>,

    /// Bind address [default: 0.0.0.0]
    #[arg(long, env = "ROOMSYNC_BIND")]
    bind: Option<String>,

    /// Configuration file path
    #[arg(short, long, env = "ROOMSYNC_CONFIG")]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error) [default: info]
    #[arg(long, env = "ROOMSYNC_LOG_LEVEL")]
    log_level: Option<String>,

    /// Reject rollup publishes, as a log without native compaction would
    #[arg(long)]
    no_rollup: bool,

    /// Keep at most this many entries per room
    #[arg(long, env = "ROOMSYNC_MAX_ENTRIES")]
    max_entries: Option<usize>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let file = match &args.config {
        Some(path) => FileConfig::load(path)?,
        None => FileConfig::default(),
    };
    let config = DaemonConfig::resolve(
        file,
        Overrides {
            bind: args.bind,
            port: args.port,
            log_level: args.log_level,
            no_rollup: args.no_rollup,
            max_entries: args.max_entries,
        },
    )?;

    // Initialize logging
    let level = match config.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .init();

    print_banner();

    if let Some(path) = &args.config {
        info!(path = %path.display(), "Loaded configuration file");
    }

    let log = Arc::new(MemoryLog::with_config(config.log.clone()));
    let server = LogServer::bind(log.clone(), config.addr).await?;

    info!(
        addr = %server.local_addr()?,
        native_rollup = config.log.native_rollup,
        max_entries = ?config.log.max_entries_per_topic,
        "Starting roomsync log daemon"
    );

    let handle = tokio::spawn(async move {
        if let Err(e) = server.run().await {
            tracing::error!(error = %e, "WebSocket server error");
        }
    });

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;
    info!("Shutting down...");

    // Participants see their subscriptions end and start reconnecting
    log.sever();
    handle.abort();

    let stats = log.stats();
    info!(
        topics = stats.topic_count,
        entries = stats.entry_count,
        bytes = stats.total_payload_bytes,
        "Log discarded"
    );

    Ok(())
}

fn print_banner() {
    println!(
        r#"
  ╦═╗╔═╗╔═╗╔╦╗╔═╗╦ ╦╔╗╔╔═╗
  ╠╦╝║ ║║ ║║║║╚═╗╚╦╝║║║║
  ╩╚═╚═╝╚═╝╩ ╩╚═╝ ╩ ╝╚╝╚═╝
  Room log daemon
  Version {}
"#,
        env!("CARGO_PKG_VERSION")
    );
}
