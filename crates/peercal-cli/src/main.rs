//! Peercal CLI
//!
//! Thin wrapper around peercal-core functions for command-line usage.
//!
//! ## Usage
//!
//! ```bash
//! # Show node information
//! peercal info
//!
//! # Create a new room and print its invite token
//! peercal room create "Family Rota"
//!
//! # List saved rooms
//! peercal room list
//!
//! # Show room details
//! peercal room show <room_id>
//!
//! # Join a room via invite token
//! peercal room join <token>
//!
//! # Mint a fresh invite for a saved room
//! peercal room invite <room_id>
//!
//! # Set a schedule entry
//! peercal schedule set <room_id> 2026-09-01 '{"cook": "alice"}'
//!
//! # Show a room's schedule
//! peercal schedule show <room_id>
//!
//! # Show a room's operation log
//! peercal log <room_id>
//!
//! # Manage the personal (unshared) calendar
//! peercal personal set 2026-09-01 "dentist"
//! peercal personal show
//!
//! # Stay online and sync saved rooms
//! peercal serve
//! ```

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use clap::{Parser, Subcommand};
use peercal_core::{Operation, RoomEvent, RoomId, RoomManager, RoomOptions, ScheduleMap};

/// Peercal - P2P Shared Calendars
#[derive(Parser)]
#[command(name = "peercal")]
#[command(version = "0.1.0")]
#[command(about = "Peercal - P2P Shared Calendars")]
#[command(
    long_about = "A local-first, peer-to-peer shared calendar. Rooms are append-only logs \
                  replicated over gossip; every member keeps a full copy and can work offline."
)]
struct Cli {
    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Data directory (default: ~/.peercal/data)
    #[arg(short, long, global = true)]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show node information
    Info,

    /// Room management
    Room {
        #[command(subcommand)]
        action: RoomAction,
    },

    /// Schedule management
    Schedule {
        #[command(subcommand)]
        action: ScheduleAction,
    },

    /// Show a room's operation log
    Log {
        /// Room ID
        room_id: String,
    },

    /// Personal (unshared) calendar
    Personal {
        #[command(subcommand)]
        action: PersonalAction,
    },

    /// Stay online as a persistent P2P node, syncing saved rooms
    Serve {
        /// Invite token to join before serving
        #[arg(short, long)]
        join: Option<String>,

        /// Only sync this room (default: all saved rooms)
        #[arg(short, long)]
        room: Option<String>,
    },
}

#[derive(Subcommand)]
enum RoomAction {
    /// Create a new room and print its invite token
    Create {
        /// Name of the room
        name: String,
    },
    /// List saved rooms
    List,
    /// Show room details
    Show {
        /// Room ID
        room_id: String,
    },
    /// Join a room via invite token
    Join {
        /// Invite token (cal-invite:...)
        token: String,
    },
    /// Mint a fresh invite token for a saved room
    Invite {
        /// Room ID
        room_id: String,
    },
}

#[derive(Subcommand)]
enum ScheduleAction {
    /// Set a schedule entry for a date
    Set {
        /// Room ID
        room_id: String,
        /// Date (YYYY-MM-DD)
        date: String,
        /// Entry (JSON value, or plain text)
        entry: String,
    },
    /// Show the room's schedule
    Show {
        /// Room ID
        room_id: String,
    },
    /// Clear the entry for a date
    Clear {
        /// Room ID
        room_id: String,
        /// Date (YYYY-MM-DD)
        date: String,
    },
}

#[derive(Subcommand)]
enum PersonalAction {
    /// Show the personal calendar
    Show,
    /// Set a personal entry for a date
    Set {
        /// Date (YYYY-MM-DD)
        date: String,
        /// Entry (JSON value, or plain text)
        entry: String,
    },
    /// Clear the personal entry for a date
    Clear {
        /// Date (YYYY-MM-DD)
        date: String,
    },
}

fn setup_logging(verbosity: u8) {
    let filter = match verbosity {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .init();
}

/// Get the default data directory (~/.peercal/data)
fn default_data_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".peercal")
        .join("data")
}

/// Validate a YYYY-MM-DD date string
fn parse_date(s: &str) -> Result<&str> {
    chrono::NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .map_err(|e| anyhow::anyhow!("Invalid date '{}' (expected YYYY-MM-DD): {}", s, e))?;
    Ok(s)
}

/// Parse an entry as JSON, falling back to a plain string
fn parse_entry(s: &str) -> serde_json::Value {
    serde_json::from_str(s).unwrap_or_else(|_| serde_json::Value::String(s.to_string()))
}

fn format_entry(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn one_change(date: &str, value: serde_json::Value) -> ScheduleMap {
    let mut changes = ScheduleMap::new();
    changes.insert(date.to_string(), value);
    changes
}

fn format_timestamp(secs: i64) -> String {
    chrono::DateTime::from_timestamp(secs, 0)
        .map(|dt| dt.to_rfc3339())
        .unwrap_or_else(|| secs.to_string())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    setup_logging(cli.verbose);

    let data_dir = cli.data_dir.unwrap_or_else(default_data_dir);
    let manager = RoomManager::new(&data_dir).await?;

    match cli.command {
        Commands::Info => {
            let info = manager.node_info().await;
            let saved = manager.personal().rooms_details()?;

            println!("Peercal v0.1.0");
            println!();
            println!("Node:");
            println!("  ID: {}", info.endpoint_id);
            println!();
            println!("Data directory: {}", info.data_dir.display());
            println!("Saved rooms: {}", saved.len());
        }

        Commands::Room { action } => match action {
            RoomAction::Create { name } => {
                let (room, token) = manager
                    .init_ready_room(RoomOptions::named(&name))
                    .await?;
                println!("Created room: {}", name);
                println!("  ID: {}", room.id());
                if let Some(token) = token {
                    println!();
                    println!("{}", token);
                    println!();
                    println!("Share this token to invite one other member.");
                }
            }

            RoomAction::List => {
                let rooms = manager.personal().rooms_details()?;
                if rooms.is_empty() {
                    println!("No rooms found.");
                } else {
                    println!("Rooms ({}):", rooms.len());
                    println!();
                    for (id, details) in rooms {
                        println!("  {} {}", id, details.name);
                    }
                }
            }

            RoomAction::Show { room_id } => {
                let room = manager.open_saved_room(&RoomId::new(room_id)).await?;
                let info = room.info().await;
                let schedule = room.schedule().await?;

                println!("Room: {}", info.name.as_deref().unwrap_or("(unnamed)"));
                println!("  ID: {}", info.id);
                println!("  Created: {}", format_timestamp(info.created_at));
                println!("  Writers: {}", info.writers);
                println!("  Log entries: {}", info.entries);
                println!("  Scheduled dates: {}", schedule.len());
            }

            RoomAction::Join { token } => {
                println!("Knocking... waiting for the host to admit us.");
                let room = manager.join_room(token).await?;
                let name = room.name().await;
                println!(
                    "Joined room: {}",
                    name.as_deref().unwrap_or("(unnamed)")
                );
                println!("  ID: {}", room.id());
                println!();
                println!("Run `peercal serve` to stay online and sync.");
            }

            RoomAction::Invite { room_id } => {
                let room = manager.open_saved_room(&RoomId::new(room_id)).await?;
                if let Some(token) = room.ready().await? {
                    println!("Invite created:");
                    println!();
                    println!("{}", token);
                    println!();
                    println!("Share this token to invite one other member.");
                } else {
                    println!("This room did not mint an invite.");
                }
            }
        },

        Commands::Schedule { action } => match action {
            ScheduleAction::Set {
                room_id,
                date,
                entry,
            } => {
                parse_date(&date)?;
                let room = manager.open_saved_room(&RoomId::new(room_id)).await?;
                room.adjust_schedule(&one_change(&date, parse_entry(&entry)))
                    .await?;
                println!("Scheduled {}: {}", date, entry);
                println!("Changes sync the next time this node is online.");
            }

            ScheduleAction::Show { room_id } => {
                let room = manager.open_saved_room(&RoomId::new(room_id)).await?;
                let schedule = room.schedule().await?;

                if schedule.is_empty() {
                    println!("No schedule entries in this room.");
                } else {
                    println!("Schedule ({} dates):", schedule.len());
                    println!();
                    for (date, entry) in &schedule {
                        println!("  {}  {}", date, format_entry(entry));
                    }
                }
            }

            ScheduleAction::Clear { room_id, date } => {
                parse_date(&date)?;
                let room = manager.open_saved_room(&RoomId::new(room_id)).await?;
                room.adjust_schedule(&one_change(&date, serde_json::Value::Null))
                    .await?;
                println!("Cleared {}", date);
            }
        },

        Commands::Log { room_id } => {
            let room = manager.open_saved_room(&RoomId::new(room_id)).await?;
            let transcript = room.transcript().await?;

            if transcript.is_empty() {
                println!("The log is empty.");
            } else {
                println!("Log ({} entries):", transcript.len());
                println!();
                for entry in transcript {
                    let op = match &entry.operation {
                        Operation::AddWriter { key } => format!("add-writer {}", key),
                        Operation::UpdateSchedule { key, .. } => format!("update {}", key),
                        Operation::Unknown { kind, .. } => format!("unknown({})", kind),
                    };
                    println!("  {:>4}  {}  {}", entry.seq, entry.author, op);
                }
            }
        }

        Commands::Personal { action } => match action {
            PersonalAction::Show => {
                let schedule = manager.personal().schedule()?;
                if schedule.is_empty() {
                    println!("No personal entries.");
                } else {
                    println!("Personal schedule ({} dates):", schedule.len());
                    println!();
                    for (date, entry) in &schedule {
                        println!("  {}  {}", date, format_entry(entry));
                    }
                }
            }

            PersonalAction::Set { date, entry } => {
                parse_date(&date)?;
                manager
                    .personal()
                    .adjust_schedule(&one_change(&date, parse_entry(&entry)))?;
                println!("Scheduled {}: {}", date, entry);
            }

            PersonalAction::Clear { date } => {
                parse_date(&date)?;
                manager
                    .personal()
                    .adjust_schedule(&one_change(&date, serde_json::Value::Null))?;
                println!("Cleared {}", date);
            }
        },

        Commands::Serve { join, room } => {
            println!("Starting Peercal...");
            println!();

            let info = manager.node_info().await;
            println!("Node:");
            println!("  ID: {}", info.endpoint_id);
            println!();

            if let Some(token) = join {
                println!("Knocking... waiting for the host to admit us.");
                let joined = manager.join_room(token).await?;
                let name = joined.name().await;
                println!(
                    "Joined room: {} ({})",
                    name.as_deref().unwrap_or("(unnamed)"),
                    joined.id()
                );
                println!();
            } else if let Some(room_id_str) = room {
                let opened = manager.open_saved_room(&RoomId::new(room_id_str)).await?;
                let token = opened.ready().await?;
                let name = opened.name().await;
                println!(
                    "Syncing room: {} ({})",
                    name.as_deref().unwrap_or("(unnamed)"),
                    opened.id()
                );
                if let Some(token) = token {
                    println!("  Invite: {}", token);
                }
                println!();
            } else {
                let room_ids = manager.load_saved_rooms().await?;
                for room_id in &room_ids {
                    let Some(opened) = manager.room(room_id).await else {
                        continue;
                    };
                    match opened.ready().await {
                        Ok(_) => {
                            let name = opened.name().await;
                            println!(
                                "Syncing room: {} ({})",
                                name.as_deref().unwrap_or("(unnamed)"),
                                room_id
                            );
                        }
                        Err(e) => {
                            tracing::warn!("Failed to ready room {}: {}", room_id, e);
                        }
                    }
                }
                if room_ids.is_empty() {
                    println!("No saved rooms. Create one with `peercal room create`.");
                }
                println!();
            }

            println!("Data directory: {}", info.data_dir.display());
            println!();
            println!("Node is running. Press Ctrl+C to stop.");
            println!();

            let mut events = manager.subscribe();
            loop {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {
                        println!();
                        println!("Received shutdown signal...");
                        break;
                    }
                    event = events.recv() => {
                        match event {
                            Ok(RoomEvent::WriterAdmitted { room_id, writer }) => {
                                println!("[{}] writer admitted: {}", room_id, writer);
                            }
                            Ok(RoomEvent::ScheduleChanged { room_id, ops_applied }) => {
                                println!("[{}] schedule changed ({} ops)", room_id, ops_applied);
                            }
                            Ok(RoomEvent::PeerConnected { room_id, peer_id }) => {
                                println!("[{}] peer connected: {}", room_id, peer_id);
                            }
                            Ok(RoomEvent::PeerDisconnected { room_id, peer_id }) => {
                                println!("[{}] peer disconnected: {}", room_id, peer_id);
                            }
                            Ok(RoomEvent::Error { room_id, message }) => {
                                println!("[{}] error: {}", room_id, message);
                            }
                            Ok(_) => {}
                            Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                                tracing::warn!("Event stream lagged by {} events", n);
                            }
                            Err(tokio::sync::broadcast::error::RecvError::Closed) => {
                                tokio::time::sleep(Duration::from_secs(1)).await;
                            }
                        }
                    }
                }
            }

            println!("Shutting down...");
        }
    }

    manager.cleanup().await?;

    Ok(())
}
