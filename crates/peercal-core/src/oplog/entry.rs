//! Signed log entries and the operations they carry

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{RoomError, RoomResult};
use crate::identity::{self, AuthorKeypair, WriterKey};

/// Operation kind tag for admitting a writer
pub const KIND_ADD_WRITER: &str = "addWriter";

/// Operation kind tag for a schedule update
pub const KIND_UPDATE_SCHEDULE: &str = "updateSchedule";

/// Blake3 hash of an entry's canonical bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OpHash(pub [u8; 32]);

impl OpHash {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parse from a 64-char hex string
    pub fn from_hex(s: &str) -> RoomResult<Self> {
        let bytes = hex::decode(s)
            .map_err(|e| RoomError::Serialization(format!("Invalid hash hex: {}", e)))?;
        if bytes.len() != 32 {
            return Err(RoomError::Serialization(format!(
                "Hash must be 32 bytes, got {}",
                bytes.len()
            )));
        }
        let mut arr = [0u8; 32];
        arr.copy_from_slice(&bytes);
        Ok(Self(arr))
    }
}

impl fmt::Display for OpHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(&self.0[..8]))
    }
}

/// Payload of an `updateSchedule` entry
///
/// Schedule values are arbitrary JSON, so this body is JSON-encoded inside
/// the postcard envelope rather than postcard all the way down.
#[derive(Debug, Serialize, Deserialize)]
struct ScheduleBody {
    key: String,
    value: serde_json::Value,
}

/// A single calendar-room operation
///
/// The set of known kinds is closed; anything else is preserved as
/// [`Operation::Unknown`] so newer peers' entries survive replication
/// through older ones.
#[derive(Debug, Clone, PartialEq)]
pub enum Operation {
    /// Admit a writer key into the room's writer set
    AddWriter { key: WriterKey },
    /// Set a key in the derived schedule view
    UpdateSchedule {
        key: String,
        value: serde_json::Value,
    },
    /// Kind this node does not recognize, carried verbatim
    Unknown { kind: String, body: Vec<u8> },
}

impl Operation {
    /// Encode as a (kind, body) pair for embedding in an entry
    pub fn encode(&self) -> RoomResult<(String, Vec<u8>)> {
        match self {
            Operation::AddWriter { key } => Ok((KIND_ADD_WRITER.to_string(), key.0.to_vec())),
            Operation::UpdateSchedule { key, value } => {
                let body = serde_json::to_vec(&ScheduleBody {
                    key: key.clone(),
                    value: value.clone(),
                })
                .map_err(|e| {
                    RoomError::Serialization(format!("Failed to encode schedule update: {}", e))
                })?;
                Ok((KIND_UPDATE_SCHEDULE.to_string(), body))
            }
            Operation::Unknown { kind, body } => Ok((kind.clone(), body.clone())),
        }
    }

    /// Decode from a (kind, body) pair
    ///
    /// Unrecognized kinds decode to [`Operation::Unknown`]. A recognized
    /// kind with a malformed body is a replay-stopping error: the entry was
    /// signed, so corruption here means divergent history, not noise.
    pub fn decode(kind: &str, body: &[u8]) -> RoomResult<Self> {
        match kind {
            KIND_ADD_WRITER => {
                let bytes: [u8; 32] = body.try_into().map_err(|_| {
                    RoomError::Replay(format!(
                        "addWriter payload must be 32 bytes, got {}",
                        body.len()
                    ))
                })?;
                Ok(Operation::AddWriter {
                    key: WriterKey(bytes),
                })
            }
            KIND_UPDATE_SCHEDULE => {
                let ScheduleBody { key, value } = serde_json::from_slice(body).map_err(|e| {
                    RoomError::Replay(format!("Malformed updateSchedule payload: {}", e))
                })?;
                Ok(Operation::UpdateSchedule { key, value })
            }
            other => Ok(Operation::Unknown {
                kind: other.to_string(),
                body: body.to_vec(),
            }),
        }
    }

    /// The kind tag this operation encodes to
    pub fn kind(&self) -> &str {
        match self {
            Operation::AddWriter { .. } => KIND_ADD_WRITER,
            Operation::UpdateSchedule { .. } => KIND_UPDATE_SCHEDULE,
            Operation::Unknown { kind, .. } => kind,
        }
    }
}

/// The signed portion of an entry
///
/// Field order is the wire contract: the signature and the entry hash both
/// cover exactly this postcard encoding.
#[derive(Serialize)]
struct CanonicalEntry<'a> {
    author: &'a WriterKey,
    seq: u64,
    parents: &'a [OpHash],
    kind: &'a str,
    body: &'a [u8],
}

/// One immutable entry in an author's sub-log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignedEntry {
    /// Author the entry belongs to
    pub author: WriterKey,
    /// Position in the author's own append-only sub-log, starting at 0
    pub seq: u64,
    /// Hashes of the merged-log heads observed at append time
    pub parents: Vec<OpHash>,
    /// Operation kind tag
    pub kind: String,
    /// Operation payload bytes
    pub body: Vec<u8>,
    /// Ed25519 signature over the canonical entry bytes
    pub signature: Vec<u8>,
}

impl SignedEntry {
    /// Build and sign a new entry
    pub fn sign(
        author: &AuthorKeypair,
        seq: u64,
        parents: Vec<OpHash>,
        op: &Operation,
    ) -> RoomResult<Self> {
        let (kind, body) = op.encode()?;
        let mut entry = Self {
            author: author.writer_key(),
            seq,
            parents,
            kind,
            body,
            signature: Vec::new(),
        };
        entry.signature = author.sign(&entry.canonical_bytes()?);
        Ok(entry)
    }

    fn canonical_bytes(&self) -> RoomResult<Vec<u8>> {
        postcard::to_stdvec(&CanonicalEntry {
            author: &self.author,
            seq: self.seq,
            parents: &self.parents,
            kind: &self.kind,
            body: &self.body,
        })
        .map_err(|e| RoomError::Serialization(format!("Failed to encode entry: {}", e)))
    }

    /// Content hash identifying this entry in the merge DAG
    pub fn hash(&self) -> RoomResult<OpHash> {
        Ok(OpHash(*blake3::hash(&self.canonical_bytes()?).as_bytes()))
    }

    /// Check the author's signature
    pub fn verify(&self) -> RoomResult<()> {
        identity::verify_signature(&self.author, &self.canonical_bytes()?, &self.signature)
    }

    /// Decode the operation this entry carries
    pub fn operation(&self) -> RoomResult<Operation> {
        Operation::decode(&self.kind, &self.body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keypair() -> AuthorKeypair {
        AuthorKeypair::generate()
    }

    #[test]
    fn test_add_writer_codec() {
        let key = keypair().writer_key();
        let op = Operation::AddWriter { key };
        let (kind, body) = op.encode().unwrap();
        assert_eq!(kind, KIND_ADD_WRITER);
        assert_eq!(body.len(), 32);
        assert_eq!(Operation::decode(&kind, &body).unwrap(), op);
    }

    #[test]
    fn test_update_schedule_codec() {
        let op = Operation::UpdateSchedule {
            key: "schedule".to_string(),
            value: serde_json::json!({"2026-03-01": "dentist"}),
        };
        let (kind, body) = op.encode().unwrap();
        assert_eq!(kind, KIND_UPDATE_SCHEDULE);
        assert_eq!(Operation::decode(&kind, &body).unwrap(), op);
    }

    #[test]
    fn test_unknown_kind_carried_verbatim() {
        let op = Operation::decode("renameRoom", b"whatever").unwrap();
        assert_eq!(
            op,
            Operation::Unknown {
                kind: "renameRoom".to_string(),
                body: b"whatever".to_vec(),
            }
        );
        let (kind, body) = op.encode().unwrap();
        assert_eq!(kind, "renameRoom");
        assert_eq!(body, b"whatever");
    }

    #[test]
    fn test_malformed_add_writer_is_replay_error() {
        let result = Operation::decode(KIND_ADD_WRITER, b"short");
        assert!(matches!(result, Err(RoomError::Replay(_))));
    }

    #[test]
    fn test_malformed_update_schedule_is_replay_error() {
        let result = Operation::decode(KIND_UPDATE_SCHEDULE, b"not json");
        assert!(matches!(result, Err(RoomError::Replay(_))));
    }

    #[test]
    fn test_sign_and_verify_entry() {
        let author = keypair();
        let op = Operation::AddWriter {
            key: author.writer_key(),
        };
        let entry = SignedEntry::sign(&author, 0, vec![], &op).unwrap();
        assert!(entry.verify().is_ok());
        assert_eq!(entry.operation().unwrap(), op);
    }

    #[test]
    fn test_tampered_entry_fails_verification() {
        let author = keypair();
        let op = Operation::UpdateSchedule {
            key: "schedule".to_string(),
            value: serde_json::json!("lunch"),
        };
        let mut entry = SignedEntry::sign(&author, 0, vec![], &op).unwrap();
        entry.seq = 1;
        assert!(entry.verify().is_err());
    }

    #[test]
    fn test_hash_is_stable() {
        let author = keypair();
        let entry = SignedEntry::sign(
            &author,
            0,
            vec![],
            &Operation::AddWriter {
                key: author.writer_key(),
            },
        )
        .unwrap();
        assert_eq!(entry.hash().unwrap(), entry.hash().unwrap());
    }

    #[test]
    fn test_hash_covers_every_field() {
        let author = keypair();
        let op = Operation::UpdateSchedule {
            key: "schedule".to_string(),
            value: serde_json::json!("lunch"),
        };
        let entry = SignedEntry::sign(&author, 0, vec![], &op).unwrap();
        let base = entry.hash().unwrap();

        let mut changed = entry.clone();
        changed.seq = 5;
        assert_ne!(changed.hash().unwrap(), base);

        let mut changed = entry.clone();
        changed.parents = vec![OpHash([9u8; 32])];
        assert_ne!(changed.hash().unwrap(), base);

        let mut changed = entry.clone();
        changed.body = b"other".to_vec();
        assert_ne!(changed.hash().unwrap(), base);
    }

    #[test]
    fn test_signature_not_part_of_hash() {
        let author = keypair();
        let op = Operation::AddWriter {
            key: author.writer_key(),
        };
        let entry = SignedEntry::sign(&author, 0, vec![], &op).unwrap();
        let mut resigned = entry.clone();
        resigned.signature = author.sign(&[1, 2, 3]);
        assert_eq!(resigned.hash().unwrap(), entry.hash().unwrap());
    }

    #[test]
    fn test_entry_postcard_roundtrip() {
        let author = keypair();
        let entry = SignedEntry::sign(
            &author,
            3,
            vec![OpHash([1u8; 32]), OpHash([2u8; 32])],
            &Operation::UpdateSchedule {
                key: "schedule".to_string(),
                value: serde_json::json!({"2026-01-01": "new year"}),
            },
        )
        .unwrap();
        let bytes = postcard::to_stdvec(&entry).unwrap();
        let back: SignedEntry = postcard::from_bytes(&bytes).unwrap();
        assert_eq!(back, entry);
        assert!(back.verify().is_ok());
    }

    #[test]
    fn test_op_hash_hex_roundtrip() {
        let hash = OpHash([0x5a; 32]);
        assert_eq!(OpHash::from_hex(&hash.to_hex()).unwrap(), hash);
        assert!(OpHash::from_hex("zz").is_err());
    }
}
