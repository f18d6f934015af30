//! Core types shared across the peercal crates

use std::collections::BTreeMap;
use std::fmt;

use iroh_gossip::proto::TopicId;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::{RoomError, RoomResult};
use crate::invite::NodeAddrBytes;

/// Well-known view key for the calendar map, in shared rooms and in the
/// personal store alike
pub const SCHEDULE_KEY: &str = "schedule";

const BASE36_ALPHABET: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";

fn base36(mut n: u64) -> String {
    if n == 0 {
        return "0".to_string();
    }
    let mut buf = [0u8; 13];
    let mut i = buf.len();
    while n > 0 {
        i -= 1;
        buf[i] = BASE36_ALPHABET[(n % 36) as usize];
        n /= 36;
    }
    String::from_utf8_lossy(&buf[i..]).into_owned()
}

/// Identifier for a calendar room
///
/// Generated ids look like `room-<timestamp36>-<rand>` and are safe to use
/// as storage key prefixes (lowercase alphanumeric plus `-`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RoomId(String);

impl RoomId {
    /// Generate a fresh room id from the current time plus a random suffix
    pub fn generate() -> Self {
        let millis = chrono::Utc::now().timestamp_millis().max(0) as u64;
        let mut rng = rand::rng();
        let suffix: String = (0..3)
            .map(|_| BASE36_ALPHABET[rng.random_range(0..36)] as char)
            .collect();
        Self(format!("room-{}-{}", base36(millis), suffix))
    }

    /// Wrap an existing id string
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get the id as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RoomId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// 32-byte gossip topic a room's members swarm on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Topic(pub [u8; 32]);

impl Topic {
    /// Generate a random topic
    pub fn generate() -> Self {
        Self(rand::random())
    }

    /// Create from raw bytes
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Get the raw bytes
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Hex encoding of the full topic (64 chars)
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parse from a 64-char hex string
    pub fn from_hex(s: &str) -> RoomResult<Self> {
        let bytes = hex::decode(s)
            .map_err(|e| RoomError::Serialization(format!("Invalid topic hex: {}", e)))?;
        if bytes.len() != 32 {
            return Err(RoomError::Serialization(format!(
                "Topic must be 32 bytes, got {}",
                bytes.len()
            )));
        }
        let mut arr = [0u8; 32];
        arr.copy_from_slice(&bytes);
        Ok(Self(arr))
    }

    /// The gossip topic id for this topic
    pub fn topic_id(&self) -> TopicId {
        TopicId::from_bytes(self.0)
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "topic_{}", hex::encode(&self.0[..8]))
    }
}

/// Per-room details kept in the personal store so saved rooms can be
/// reopened after a restart
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoomDetails {
    pub name: String,
    pub topic: Topic,
}

/// Room record persisted alongside the room's log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoomRecord {
    pub id: RoomId,
    pub name: Option<String>,
    pub topic: Topic,
    /// Unix timestamp of creation
    pub created_at: i64,
    /// Last known peer addresses, used to bootstrap the gossip topic
    /// when the room is reopened
    #[serde(default)]
    pub peers: Vec<NodeAddrBytes>,
}

impl RoomRecord {
    pub fn new(id: RoomId, name: Option<String>, topic: Topic) -> Self {
        Self {
            id,
            name,
            topic,
            created_at: chrono::Utc::now().timestamp(),
            peers: Vec::new(),
        }
    }
}

/// Calendar schedule as stored in a view: date string to entry
pub type ScheduleMap = BTreeMap<String, serde_json::Value>;
