//! Wire protocol for room replication
//!
//! Message flow between two members of a room topic:
//!
//! ```text
//!   Peer A                                Peer B
//!     │  Announce { heads, addr }           │   on join / local append
//!     │ ───────────────────────────────────►│
//!     │                                     │   B is missing some of A's
//!     │           Request { have }          │   heads
//!     │ ◄───────────────────────────────────│
//!     │  Entries { entries }                │
//!     │ ───────────────────────────────────►│   B integrates, announces
//!     │                                     │   its new heads
//! ```
//!
//! Local appends are additionally pushed as `Entries` directly, so in the
//! common case peers converge without a request roundtrip.

use serde::{Deserialize, Serialize};

use crate::error::{RoomError, RoomResult};
use crate::invite::NodeAddrBytes;
use crate::oplog::{OpHash, SignedEntry};
use crate::types::RoomId;

/// Messages broadcast on a room's gossip topic
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RoomMessage {
    /// Advertise our merge-DAG heads so peers can detect missing entries
    Announce {
        room_id: RoomId,
        heads: Vec<OpHash>,
        /// Sender's address, so receivers can dial it directly
        addr: NodeAddrBytes,
    },
    /// Ask peers for everything outside the ancestor closure of `have`
    Request { room_id: RoomId, have: Vec<OpHash> },
    /// Signed entries for integration
    Entries {
        room_id: RoomId,
        entries: Vec<SignedEntry>,
    },
}

impl RoomMessage {
    /// The room this message belongs to
    pub fn room_id(&self) -> &RoomId {
        match self {
            RoomMessage::Announce { room_id, .. } => room_id,
            RoomMessage::Request { room_id, .. } => room_id,
            RoomMessage::Entries { room_id, .. } => room_id,
        }
    }

    pub fn is_announce(&self) -> bool {
        matches!(self, RoomMessage::Announce { .. })
    }

    pub fn is_request(&self) -> bool {
        matches!(self, RoomMessage::Request { .. })
    }

    pub fn is_entries(&self) -> bool {
        matches!(self, RoomMessage::Entries { .. })
    }
}

/// Versioned envelope around [`RoomMessage`]
///
/// Every message on the wire is wrapped so future protocol revisions can
/// coexist on a topic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum WireMessage {
    V1(RoomMessage),
}

impl WireMessage {
    pub fn new(message: RoomMessage) -> Self {
        WireMessage::V1(message)
    }

    pub fn encode(&self) -> RoomResult<Vec<u8>> {
        postcard::to_allocvec(self)
            .map_err(|e| RoomError::Serialization(format!("Failed to encode message: {}", e)))
    }

    pub fn decode(bytes: &[u8]) -> RoomResult<Self> {
        postcard::from_bytes(bytes)
            .map_err(|e| RoomError::Serialization(format!("Failed to decode message: {}", e)))
    }

    pub fn into_inner(self) -> RoomMessage {
        match self {
            WireMessage::V1(message) => message,
        }
    }

    pub fn version(&self) -> u8 {
        match self {
            WireMessage::V1(_) => 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::AuthorKeypair;
    use crate::oplog::{OpLog, Operation};

    fn test_addr() -> NodeAddrBytes {
        NodeAddrBytes {
            endpoint_id: [3u8; 32],
            relay_url: None,
            direct_addresses: vec!["127.0.0.1:7777".to_string()],
        }
    }

    fn test_entry() -> SignedEntry {
        let author = AuthorKeypair::generate();
        let mut log = OpLog::new(author);
        let key = log.author_key();
        log.add_writer_key(key);
        log.append(&Operation::AddWriter { key }).unwrap()
    }

    #[test]
    fn test_announce_roundtrip() {
        let msg = RoomMessage::Announce {
            room_id: RoomId::new("room-abc-def"),
            heads: vec![OpHash([1u8; 32]), OpHash([2u8; 32])],
            addr: test_addr(),
        };
        let wire = WireMessage::new(msg.clone());
        let decoded = WireMessage::decode(&wire.encode().unwrap()).unwrap();
        assert_eq!(decoded.version(), 1);
        assert_eq!(decoded.into_inner(), msg);
    }

    #[test]
    fn test_request_roundtrip() {
        let msg = RoomMessage::Request {
            room_id: RoomId::new("room-abc-def"),
            have: vec![],
        };
        let decoded = WireMessage::decode(&WireMessage::new(msg.clone()).encode().unwrap()).unwrap();
        assert_eq!(decoded.into_inner(), msg);
    }

    #[test]
    fn test_entries_roundtrip_and_verify() {
        let entry = test_entry();
        let msg = RoomMessage::Entries {
            room_id: RoomId::new("room-abc-def"),
            entries: vec![entry],
        };
        let decoded = WireMessage::decode(&WireMessage::new(msg).encode().unwrap()).unwrap();
        match decoded.into_inner() {
            RoomMessage::Entries { entries, .. } => {
                assert_eq!(entries.len(), 1);
                assert!(entries[0].verify().is_ok());
            }
            other => panic!("Expected entries, got {:?}", other),
        }
    }

    #[test]
    fn test_room_id_accessor_and_predicates() {
        let id = RoomId::new("room-x-y");
        let announce = RoomMessage::Announce {
            room_id: id.clone(),
            heads: vec![],
            addr: test_addr(),
        };
        assert_eq!(announce.room_id(), &id);
        assert!(announce.is_announce());
        assert!(!announce.is_request());
        assert!(!announce.is_entries());
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(WireMessage::decode(&[0xff, 0xfe, 0xfd]).is_err());
    }
}
