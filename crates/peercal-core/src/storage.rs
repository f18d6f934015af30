//! Persistent storage using redb
//!
//! Provides durable storage for room records, per-room operation logs,
//! view snapshots, author seeds, the personal (non-shared) store, and the
//! node's endpoint key.
//!
//! Layout within one `peercal.redb` database:
//!
//! ```text
//! rooms                 room_id            -> RoomRecord (JSON)
//! oplog                 room_id/hash_hex   -> SignedEntry (postcard)
//! views                 room_id            -> ViewSnapshot (JSON)
//! authors               room_id            -> 32-byte author seed
//! personal              key                -> JSON value
//! endpoint_secret_key   fixed key          -> 32-byte secret key
//! ```
//!
//! Room ids cannot contain `/`, so the `room_id/hash_hex` prefix scheme is
//! unambiguous.

use std::path::Path;
use std::sync::Arc;

use parking_lot::RwLock;
use redb::{Database, ReadableTable, TableDefinition};
use tracing::debug;

use crate::error::{RoomError, RoomResult};
use crate::identity::AuthorKeypair;
use crate::oplog::{OpHash, SignedEntry};
use crate::types::{RoomId, RoomRecord};
use crate::view::{ScheduleView, ViewSnapshot};

const ROOMS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("rooms");
const OPLOG_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("oplog");
const VIEWS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("views");
const AUTHORS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("authors");
const PERSONAL_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("personal");
const ENDPOINT_KEY_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("endpoint_secret_key");

/// Fixed key for the node's endpoint secret key
const ENDPOINT_SECRET_KEY: &str = "endpoint_secret_key";

/// Node-wide storage handle
///
/// Cheap to clone; all clones share one database.
#[derive(Clone)]
pub struct Storage {
    db: Arc<RwLock<Database>>,
}

impl Storage {
    /// Open or create the database at the given path
    pub fn new(db_path: impl AsRef<Path>) -> RoomResult<Self> {
        let db_path = db_path.as_ref();
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let db = Database::create(db_path)?;

        // Open all tables once so later reads never race table creation.
        let write_txn = db.begin_write()?;
        {
            let _ = write_txn.open_table(ROOMS_TABLE)?;
            let _ = write_txn.open_table(OPLOG_TABLE)?;
            let _ = write_txn.open_table(VIEWS_TABLE)?;
            let _ = write_txn.open_table(AUTHORS_TABLE)?;
            let _ = write_txn.open_table(PERSONAL_TABLE)?;
            let _ = write_txn.open_table(ENDPOINT_KEY_TABLE)?;
        }
        write_txn.commit()?;

        debug!(path = %db_path.display(), "Storage opened");
        Ok(Self {
            db: Arc::new(RwLock::new(db)),
        })
    }

    /// Scoped handle for one room's log, view, and author seed
    pub fn namespace(&self, room_id: RoomId) -> RoomStore {
        RoomStore {
            storage: self.clone(),
            room_id,
        }
    }

    // ═══════════════════════════════════════════════════════════
    // Room records
    // ═══════════════════════════════════════════════════════════

    pub fn save_room(&self, record: &RoomRecord) -> RoomResult<()> {
        let data = serde_json::to_vec(record)
            .map_err(|e| RoomError::Serialization(e.to_string()))?;
        let db = self.db.read();
        let write_txn = db.begin_write()?;
        {
            let mut table = write_txn.open_table(ROOMS_TABLE)?;
            table.insert(record.id.as_str(), data.as_slice())?;
        }
        write_txn.commit()?;
        Ok(())
    }

    pub fn load_room(&self, room_id: &RoomId) -> RoomResult<Option<RoomRecord>> {
        let db = self.db.read();
        let read_txn = db.begin_read()?;
        let table = read_txn.open_table(ROOMS_TABLE)?;
        match table.get(room_id.as_str())? {
            Some(value) => {
                let record = serde_json::from_slice(value.value())
                    .map_err(|e| RoomError::Serialization(e.to_string()))?;
                Ok(Some(record))
            }
            None => Ok(None),
        }
    }

    pub fn list_rooms(&self) -> RoomResult<Vec<RoomRecord>> {
        let db = self.db.read();
        let read_txn = db.begin_read()?;
        let table = read_txn.open_table(ROOMS_TABLE)?;
        let mut records = Vec::new();
        for entry in table.iter()? {
            let (_, value) = entry?;
            let record: RoomRecord = serde_json::from_slice(value.value())
                .map_err(|e| RoomError::Serialization(e.to_string()))?;
            records.push(record);
        }
        Ok(records)
    }

    /// Remove a room's record, log, view, and author seed in one transaction
    pub fn delete_room(&self, room_id: &RoomId) -> RoomResult<()> {
        let prefix = format!("{}/", room_id.as_str());
        let db = self.db.read();
        let write_txn = db.begin_write()?;
        {
            let mut rooms = write_txn.open_table(ROOMS_TABLE)?;
            rooms.remove(room_id.as_str())?;

            let mut views = write_txn.open_table(VIEWS_TABLE)?;
            views.remove(room_id.as_str())?;

            let mut authors = write_txn.open_table(AUTHORS_TABLE)?;
            authors.remove(room_id.as_str())?;

            let mut oplog = write_txn.open_table(OPLOG_TABLE)?;
            let keys: Vec<String> = {
                let mut keys = Vec::new();
                for entry in oplog.iter()? {
                    let (key, _) = entry?;
                    if key.value().starts_with(&prefix) {
                        keys.push(key.value().to_string());
                    }
                }
                keys
            };
            for key in keys {
                oplog.remove(key.as_str())?;
            }
        }
        write_txn.commit()?;
        debug!(%room_id, "Deleted room from storage");
        Ok(())
    }

    // ═══════════════════════════════════════════════════════════
    // Operation log
    // ═══════════════════════════════════════════════════════════

    pub fn append_entry(
        &self,
        room_id: &RoomId,
        hash: &OpHash,
        entry: &SignedEntry,
    ) -> RoomResult<()> {
        let key = format!("{}/{}", room_id.as_str(), hash.to_hex());
        let data = postcard::to_stdvec(entry)
            .map_err(|e| RoomError::Serialization(e.to_string()))?;
        let db = self.db.read();
        let write_txn = db.begin_write()?;
        {
            let mut table = write_txn.open_table(OPLOG_TABLE)?;
            table.insert(key.as_str(), data.as_slice())?;
        }
        write_txn.commit()?;
        Ok(())
    }

    /// All persisted entries for a room, in storage order
    ///
    /// Order here is by hash, not causal; the log re-derives causal order
    /// during integration.
    pub fn load_entries(&self, room_id: &RoomId) -> RoomResult<Vec<SignedEntry>> {
        let prefix = format!("{}/", room_id.as_str());
        let db = self.db.read();
        let read_txn = db.begin_read()?;
        let table = read_txn.open_table(OPLOG_TABLE)?;
        let mut entries = Vec::new();
        for item in table.iter()? {
            let (key, value) = item?;
            if !key.value().starts_with(&prefix) {
                continue;
            }
            let entry: SignedEntry = postcard::from_bytes(value.value())
                .map_err(|e| RoomError::Serialization(e.to_string()))?;
            entries.push(entry);
        }
        Ok(entries)
    }

    // ═══════════════════════════════════════════════════════════
    // View snapshots
    // ═══════════════════════════════════════════════════════════

    pub fn save_view(&self, room_id: &RoomId, snapshot: &ViewSnapshot) -> RoomResult<()> {
        // JSON, not postcard: schedule values are arbitrary serde_json
        // values, which only a self-describing format can decode.
        let data = serde_json::to_vec(snapshot)
            .map_err(|e| RoomError::Serialization(e.to_string()))?;
        let db = self.db.read();
        let write_txn = db.begin_write()?;
        {
            let mut table = write_txn.open_table(VIEWS_TABLE)?;
            table.insert(room_id.as_str(), data.as_slice())?;
        }
        write_txn.commit()?;
        Ok(())
    }

    pub fn load_view(&self, room_id: &RoomId) -> RoomResult<Option<ViewSnapshot>> {
        let db = self.db.read();
        let read_txn = db.begin_read()?;
        let table = read_txn.open_table(VIEWS_TABLE)?;
        match table.get(room_id.as_str())? {
            Some(value) => {
                let snapshot = serde_json::from_slice(value.value())
                    .map_err(|e| RoomError::Serialization(e.to_string()))?;
                Ok(Some(snapshot))
            }
            None => Ok(None),
        }
    }

    // ═══════════════════════════════════════════════════════════
    // Author seeds
    // ═══════════════════════════════════════════════════════════

    pub fn save_author_seed(&self, room_id: &RoomId, seed: &[u8; 32]) -> RoomResult<()> {
        let db = self.db.read();
        let write_txn = db.begin_write()?;
        {
            let mut table = write_txn.open_table(AUTHORS_TABLE)?;
            table.insert(room_id.as_str(), seed.as_slice())?;
        }
        write_txn.commit()?;
        Ok(())
    }

    pub fn load_author_seed(&self, room_id: &RoomId) -> RoomResult<Option<[u8; 32]>> {
        let db = self.db.read();
        let read_txn = db.begin_read()?;
        let table = read_txn.open_table(AUTHORS_TABLE)?;
        match table.get(room_id.as_str())? {
            Some(value) => {
                let bytes = value.value();
                if bytes.len() != 32 {
                    return Err(RoomError::Storage(format!(
                        "Author seed must be 32 bytes, got {}",
                        bytes.len()
                    )));
                }
                let mut seed = [0u8; 32];
                seed.copy_from_slice(bytes);
                Ok(Some(seed))
            }
            None => Ok(None),
        }
    }

    // ═══════════════════════════════════════════════════════════
    // Personal store
    // ═══════════════════════════════════════════════════════════

    pub fn save_personal(&self, key: &str, value: &serde_json::Value) -> RoomResult<()> {
        let data = serde_json::to_vec(value)
            .map_err(|e| RoomError::Serialization(e.to_string()))?;
        let db = self.db.read();
        let write_txn = db.begin_write()?;
        {
            let mut table = write_txn.open_table(PERSONAL_TABLE)?;
            table.insert(key, data.as_slice())?;
        }
        write_txn.commit()?;
        Ok(())
    }

    pub fn load_personal(&self, key: &str) -> RoomResult<Option<serde_json::Value>> {
        let db = self.db.read();
        let read_txn = db.begin_read()?;
        let table = read_txn.open_table(PERSONAL_TABLE)?;
        match table.get(key)? {
            Some(value) => {
                let parsed = serde_json::from_slice(value.value())
                    .map_err(|e| RoomError::Serialization(e.to_string()))?;
                Ok(Some(parsed))
            }
            None => Ok(None),
        }
    }

    // ═══════════════════════════════════════════════════════════
    // Endpoint secret key
    // ═══════════════════════════════════════════════════════════

    pub fn save_endpoint_secret_key(&self, key_bytes: &[u8; 32]) -> RoomResult<()> {
        let db = self.db.read();
        let write_txn = db.begin_write()?;
        {
            let mut table = write_txn.open_table(ENDPOINT_KEY_TABLE)?;
            table.insert(ENDPOINT_SECRET_KEY, key_bytes.as_slice())?;
        }
        write_txn.commit()?;
        Ok(())
    }

    pub fn load_endpoint_secret_key(&self) -> RoomResult<Option<[u8; 32]>> {
        let db = self.db.read();
        let read_txn = db.begin_read()?;
        let table = read_txn.open_table(ENDPOINT_KEY_TABLE)?;
        match table.get(ENDPOINT_SECRET_KEY)? {
            Some(value) => {
                let bytes = value.value();
                if bytes.len() != 32 {
                    return Err(RoomError::Storage(format!(
                        "Endpoint key must be 32 bytes, got {}",
                        bytes.len()
                    )));
                }
                let mut key = [0u8; 32];
                key.copy_from_slice(bytes);
                Ok(Some(key))
            }
            None => Ok(None),
        }
    }
}

/// Storage handle scoped to a single room
///
/// Rooms never touch other rooms' keys; everything they persist goes
/// through this namespaced view.
#[derive(Clone)]
pub struct RoomStore {
    storage: Storage,
    room_id: RoomId,
}

impl RoomStore {
    pub fn room_id(&self) -> &RoomId {
        &self.room_id
    }

    /// Load the room's author keypair, creating and persisting one on
    /// first use
    pub fn local_author(&self) -> RoomResult<AuthorKeypair> {
        if let Some(seed) = self.storage.load_author_seed(&self.room_id)? {
            return Ok(AuthorKeypair::from_seed(&seed));
        }
        let author = AuthorKeypair::generate();
        self.storage
            .save_author_seed(&self.room_id, &author.to_seed())?;
        debug!(room_id = %self.room_id, writer = %author.writer_key(), "Created room author");
        Ok(author)
    }

    pub fn append_entry(&self, entry: &SignedEntry) -> RoomResult<()> {
        let hash = entry.hash()?;
        self.storage.append_entry(&self.room_id, &hash, entry)
    }

    pub fn load_entries(&self) -> RoomResult<Vec<SignedEntry>> {
        self.storage.load_entries(&self.room_id)
    }

    pub fn save_view(&self, view: &ScheduleView) -> RoomResult<()> {
        self.storage.save_view(&self.room_id, &view.snapshot())
    }

    pub fn load_view(&self) -> RoomResult<Option<ViewSnapshot>> {
        self.storage.load_view(&self.room_id)
    }

    pub fn save_record(&self, record: &RoomRecord) -> RoomResult<()> {
        self.storage.save_room(record)
    }

    pub fn load_record(&self) -> RoomResult<Option<RoomRecord>> {
        self.storage.load_room(&self.room_id)
    }
}
