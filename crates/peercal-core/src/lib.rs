//! Peercal Core Library
//!
//! P2P shared calendar rooms over gossip-merged append-only logs.
//!
//! ## Overview
//!
//! Peercal lets small groups keep a calendar in sync without a server.
//! Users create "rooms" (shared calendars), hand out copy-pasteable
//! invite tokens, and every member's edits replicate directly between
//! peers. Each member writes to its own append-only log; the logs merge
//! causally and fold deterministically into the same schedule on every
//! node.
//!
//! ## Core Principles
//!
//! - **Local-first**: Rooms work fully offline; edits sync when peers meet
//! - **No coordination server**: Pairing and replication run over iroh gossip
//! - **Deterministic views**: Replaying the merged log always yields the
//!   same schedule, regardless of arrival order
//!
//! ## Quick Start
//!
//! ```ignore
//! use peercal_core::{RoomManager, RoomOptions, ScheduleMap};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let manager = RoomManager::new("~/.peercal/data").await?;
//!
//!     // Create a room and get an invite token to share
//!     let (room, invite) = manager
//!         .init_ready_room(RoomOptions::named("Family calendar"))
//!         .await?;
//!     println!("share this: {}", invite.unwrap());
//!
//!     // Put something on the calendar
//!     let mut changes = ScheduleMap::new();
//!     changes.insert("2026-06-01".into(), serde_json::json!({"note": "dentist"}));
//!     room.adjust_schedule(&changes).await?;
//!
//!     // On another node: join via the token
//!     // let room = manager.join_room(token).await?;
//!
//!     manager.cleanup().await?;
//!     Ok(())
//! }
//! ```

pub mod error;
pub mod events;
pub mod identity;
pub mod invite;
pub mod manager;
pub mod oplog;
pub mod pairing;
pub mod personal;
pub mod protocol;
pub mod room;
pub mod storage;
pub mod swarm;
pub mod types;
pub mod view;

// Re-exports
pub use error::{RoomError, RoomResult};
pub use events::RoomEvent;
pub use identity::{AuthorKeypair, WriterKey};
pub use invite::{Invite, NodeAddrBytes};
pub use manager::{NodeInfo, RoomManager, EVENT_CHANNEL_CAPACITY};
pub use oplog::{OpHash, OpLog, Operation, SignedEntry};
pub use pairing::{CandidatePhase, HostPhase, PairingCoordinator};
pub use personal::PersonalStore;
pub use protocol::{RoomMessage, WireMessage};
pub use room::{Room, RoomInfo, RoomLifecycle, RoomOptions, TranscriptEntry};
pub use storage::Storage;
pub use swarm::{GossipMessage, Swarm, TopicEvent, TopicReceiver, TopicSender};
pub use types::*;
pub use view::{ScheduleView, ViewSnapshot};
