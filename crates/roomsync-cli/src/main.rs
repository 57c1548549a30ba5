//! Roomsync participant CLI
//!
//! Joins a room on a `roomlogd` server and shares map markers with everyone
//! else in it.
//!
//! # Usage
//!
//! ```bash
//! # Start a new room on a local server; prints the share link
//! roomsync
//!
//! # Join a room from a share link
//! roomsync --link "http://localhost:5173/?room=k3j9x0aa1b2c"
//!
//! # Remote server, single command
//! roomsync --server ws://maps.example.com:7422 --room team -c "add -6.2 106.8"
//! ```

mod command;
mod render;
mod settings;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use colored::*;
use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

use roomsync_core::identity::{resolve_room_id, room_hint_from_link, share_link};
use roomsync_core::{ClientSession, RoomSyncEngine, SyncError};
use roomsync_transport::WsConnector;

use crate::command::{confirmed, Command};
use crate::render::{marker_line, summary, TerminalView};
use crate::settings::{Settings, DEFAULT_BASE_URL, DEFAULT_SERVER};

/// Roomsync - shared map markers from the terminal
#[derive(Parser, Debug)]
#[command(name = "roomsync")]
#[command(author, version, about = "Roomsync - shared map markers for a room")]
struct Args {
    /// Log server WebSocket URL [default: ws://127.0.0.1:7422]
    #[arg(short, long, env = "ROOMSYNC_SERVER")]
    server: Option<String>,

    /// Share link to join (its `room` parameter picks the room)
    #[arg(short, long, conflicts_with = "room")]
    link: Option<String>,

    /// Room ID to join
    #[arg(short, long, env = "ROOMSYNC_ROOM")]
    room: Option<String>,

    /// Base URL that share links are built from
    #[arg(long, env = "ROOMSYNC_BASE_URL")]
    base_url: Option<String>,

    /// Configuration file path
    #[arg(long, env = "ROOMSYNC_CONFIG")]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "ROOMSYNC_LOG_LEVEL", default_value = "warn")]
    log_level: String,

    /// Execute command and exit
    #[arg(short, long)]
    command: Option<String>,

    /// Quiet mode (no banner, no change notices)
    #[arg(short, long)]
    quiet: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();

    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "error" => Level::ERROR,
        _ => Level::WARN,
    };
    FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let settings = match &args.config {
        Some(path) => Settings::load(path)?,
        None => Settings::default(),
    };
    let server = args
        .server
        .or(settings.server)
        .unwrap_or_else(|| DEFAULT_SERVER.to_string());
    let base_url = args
        .base_url
        .or(settings.base_url)
        .unwrap_or_else(|| DEFAULT_BASE_URL.to_string());

    let hint = match (&args.link, &args.room) {
        (Some(link), _) => room_hint_from_link(link),
        (None, room) => room.clone(),
    };
    let room = resolve_room_id(hint.as_deref());
    let link = share_link(&base_url, &room);

    // The REPL stays on this thread; the engine's task runs on the workers
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to start async runtime")?;

    let session = ClientSession::new(room);
    let engine = RoomSyncEngine::with_config(session, Arc::new(WsConnector::new(server.clone())), settings.engine);
    engine.observe(Arc::new(TerminalView { quiet: args.quiet }));

    if !args.quiet {
        println!(
            "{}",
            format!(
                r#"
  ╦═╗╔═╗╔═╗╔╦╗╔═╗╦ ╦╔╗╔╔═╗
  ╠╦╝║ ║║ ║║║║╚═╗╚╦╝║║║║    Room {} via {}
  ╩╚═╚═╝╚═╝╩ ╩╚═╝ ╩ ╝╚╝╚═╝  Type 'help' for commands, 'quit' to exit
"#,
                engine.session().room_id(),
                server
            )
            .cyan()
        );
        println!("{} {}", "Share link:".bold(), link.underline());
    }

    if let Err(e) = runtime.block_on(engine.start()) {
        eprintln!("{} {}", "Not connected:".red(), e);
        eprintln!("{}", "Working offline: markers you add stay on this screen only.".yellow());
    }

    // Single command mode
    let result = match args.command {
        Some(line) => Command::parse(&line)
            .map_err(anyhow::Error::msg)
            .and_then(|command| runtime.block_on(execute(&engine, &link, command)))
            .map(|_| ()),
        None => repl(&runtime, &engine, &link),
    };

    runtime.block_on(engine.shutdown());
    result
}

fn repl(runtime: &tokio::runtime::Runtime, engine: &RoomSyncEngine, link: &str) -> Result<()> {
    let mut editor = DefaultEditor::new()?;
    let history_path = dirs_next::home_dir()
        .map(|p| p.join(".roomsync_history"))
        .unwrap_or_default();
    let _ = editor.load_history(&history_path);

    let prompt = format!("{}> ", engine.session().room_id().to_string().green());

    loop {
        match editor.readline(&prompt) {
            Ok(line) => {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                let _ = editor.add_history_entry(line);

                let command = match Command::parse(line) {
                    Ok(command) => command,
                    Err(e) => {
                        eprintln!("{} {}", "Error:".red(), e);
                        continue;
                    }
                };

                if command == Command::Clear && !confirm(&mut editor, "Clear all markers for everyone in this room?")? {
                    println!("{}", "Cancelled.".dimmed());
                    continue;
                }

                match runtime.block_on(execute(engine, link, command)) {
                    Ok(true) => {}
                    Ok(false) => break,
                    Err(e) => eprintln!("{} {}", "Error:".red(), e),
                }
            }
            Err(ReadlineError::Interrupted) => {
                println!("^C");
                continue;
            }
            Err(ReadlineError::Eof) => {
                println!("^D");
                break;
            }
            Err(err) => {
                eprintln!("Error: {:?}", err);
                break;
            }
        }
    }

    let _ = editor.save_history(&history_path);
    Ok(())
}

fn confirm(editor: &mut DefaultEditor, question: &str) -> Result<bool> {
    match editor.readline(&format!("{} [y/N] ", question)) {
        Ok(answer) => Ok(confirmed(&answer)),
        Err(ReadlineError::Interrupted) | Err(ReadlineError::Eof) => Ok(false),
        Err(e) => Err(e.into()),
    }
}

/// Run one command; returns whether the session should continue
async fn execute(engine: &RoomSyncEngine, link: &str, command: Command) -> Result<bool> {
    match command {
        Command::Add(position) => match engine.add_local_marker(position).await {
            Ok(marker) => println!("{} {}", "+".green(), marker_line(0, &marker, true).trim_start()),
            // Already reported through the observer; the marker stays on screen
            Err(SyncError::Unpublished { .. }) => {}
            Err(e) => return Err(e.into()),
        },
        Command::Clear => match engine.clear_all().await {
            Ok(()) | Err(SyncError::Unpublished { .. }) => {}
            Err(e) => return Err(e.into()),
        },
        Command::List => {
            let markers = engine.markers();
            println!("{}", summary(&markers).bold());
            let own = engine.session().client_id();
            for (index, marker) in markers.iter().enumerate() {
                println!("{}", marker_line(index, marker, &marker.id == own));
            }
        }
        Command::Status => {
            let session = engine.session();
            println!("{:<8} {}", "room".bold(), session.room_id());
            println!("{:<8} {}", "client".bold(), session.client_id());
            println!("{:<8} {}", "color".bold(), session.color());
            println!("{:<8} {}", "state".bold(), engine.state());
            println!("{:<8} {}", "cursor".bold(), engine.cursor().map_or("-".to_string(), |c| c.to_string()));
            println!("{:<8} {}", "markers".bold(), engine.markers().len());
        }
        Command::Link => println!("{}", link),
        Command::Help => print_help(),
        Command::Quit => return Ok(false),
    }

    Ok(true)
}

fn print_help() {
    println!(
        r#"
{}

{}
  add <lat> <lng>                        Drop a marker in your session color
  clear                                  Remove every marker for everyone (asks first)

{}
  list                                   Show markers in arrival order
  status                                 Session identity and sync state
  link                                   Print the share link for this room

{}
  help                                   Show this help
  quit/exit                              Leave the room
"#,
        "Roomsync Commands".cyan().bold(),
        "Markers".yellow().bold(),
        "Room".yellow().bold(),
        "Local".yellow().bold(),
    );
}

// Minimal dirs_next replacement for home directory
mod dirs_next {
    use std::path::PathBuf;

    pub fn home_dir() -> Option<PathBuf> {
        std::env::var_os("HOME")
            .or_else(|| std::env::var_os("USERPROFILE"))
            .map(PathBuf::from)
    }
}
