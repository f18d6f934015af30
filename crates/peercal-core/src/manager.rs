//! Top-level handle owning the swarm, storage, and every open room.
//!
//! One manager per data directory. Rooms share the manager's endpoint,
//! gossip instance, and redb database; the manager namespaces storage
//! per room and fans all room events into a single broadcast channel.
//!
//! The endpoint secret key is persisted on first start so the node
//! keeps its identity (and stays dialable from saved invites) across
//! restarts.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use iroh::SecretKey;
use tokio::sync::{broadcast, Mutex, Notify, RwLock};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, warn};

use crate::error::{RoomError, RoomResult};
use crate::events::RoomEvent;
use crate::pairing::PairingCoordinator;
use crate::personal::PersonalStore;
use crate::room::{Room, RoomOptions};
use crate::storage::Storage;
use crate::swarm::Swarm;
use crate::types::{RoomDetails, RoomId};

/// Capacity of the manager-wide event channel
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Database file name inside the data directory
const DB_FILE: &str = "peercal.redb";

/// Identity and scale of a running node
#[derive(Debug, Clone)]
pub struct NodeInfo {
    pub endpoint_id: iroh::EndpointId,
    pub data_dir: PathBuf,
    pub room_count: usize,
}

/// Owns the node's rooms and shared infrastructure
pub struct RoomManager {
    data_dir: PathBuf,
    storage: Storage,
    personal: PersonalStore,
    swarm: Arc<Swarm>,
    pairing: Arc<PairingCoordinator>,
    rooms: Arc<RwLock<HashMap<RoomId, Room>>>,
    event_tx: broadcast::Sender<RoomEvent>,
    drained: Arc<Notify>,
    /// Prunes rooms closed directly via `Room::exit`
    closed_listener: Mutex<Option<JoinHandle<()>>>,
}

impl RoomManager {
    /// Start a node rooted at `data_dir`, binding the network endpoint
    pub async fn new(data_dir: impl Into<PathBuf>) -> RoomResult<Self> {
        let data_dir = data_dir.into();
        let storage = Storage::new(data_dir.join(DB_FILE))?;
        let personal = PersonalStore::new(storage.clone())?;

        let secret_key = match storage.load_endpoint_secret_key()? {
            Some(bytes) => SecretKey::from_bytes(&bytes),
            None => {
                let key = SecretKey::generate(&mut rand::rng());
                storage.save_endpoint_secret_key(&key.to_bytes())?;
                key
            }
        };
        let swarm = Arc::new(Swarm::with_secret_key(Some(secret_key)).await?);
        let pairing = Arc::new(PairingCoordinator::new(swarm.clone()));
        let (event_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let rooms = Arc::new(RwLock::new(HashMap::new()));
        let drained = Arc::new(Notify::new());
        let closed_listener = spawn_closed_listener(rooms.clone(), event_tx.clone(), drained.clone());

        info!(
            endpoint_id = %swarm.endpoint_id(),
            data_dir = %data_dir.display(),
            "Room manager started"
        );

        Ok(Self {
            data_dir,
            storage,
            personal,
            swarm,
            pairing,
            rooms,
            event_tx,
            drained,
            closed_listener: Mutex::new(Some(closed_listener)),
        })
    }

    /// Open a room without bringing it onto the network
    ///
    /// # Errors
    ///
    /// `RoomError::InvalidOperation` when a room with the same id is
    /// already open; invite decoding errors surface here before any
    /// network work happens.
    pub async fn init_room(&self, options: RoomOptions) -> RoomResult<Room> {
        let id = options
            .room_id
            .clone()
            .unwrap_or_else(RoomId::generate);

        let mut rooms = self.rooms.write().await;
        if rooms.contains_key(&id) {
            return Err(RoomError::InvalidOperation(format!(
                "Room {} is already open",
                id
            )));
        }
        let store = self.storage.namespace(id.clone());
        let room = Room::open(
            options,
            self.swarm.clone(),
            self.pairing.clone(),
            store,
            self.event_tx.clone(),
            false,
        )
        .await?;
        rooms.insert(id, room.clone());
        Ok(room)
    }

    /// Open a room and bring it onto the network in one step
    ///
    /// Returns the room and, for hosts, the invite token. The room is
    /// recorded in the personal store so it reopens after a restart.
    pub async fn init_ready_room(
        &self,
        options: RoomOptions,
    ) -> RoomResult<(Room, Option<String>)> {
        let room = self.init_room(options).await?;
        let token = match room.ready().await {
            Ok(token) => token,
            Err(e) => {
                // Do not leave a half-readied room in the map
                self.rooms.write().await.remove(room.id());
                if let Err(exit_err) = room.exit().await {
                    warn!(room_id = %room.id(), error = %exit_err, "Failed to close unready room");
                }
                return Err(e);
            }
        };

        let info = room.info().await;
        if let Some(topic) = info.topic {
            let name = info.name.unwrap_or_else(|| room.id().to_string());
            self.personal
                .add_room_details(room.id(), RoomDetails { name, topic })?;
        }
        Ok((room, token))
    }

    /// Join someone else's room via an invite token
    ///
    /// Blocks until the host admits us.
    pub async fn join_room(&self, token: impl Into<String>) -> RoomResult<Room> {
        let (room, _) = self.init_ready_room(RoomOptions::joining(token)).await?;
        Ok(room)
    }

    /// Reopen a room recorded in the personal store
    ///
    /// # Errors
    ///
    /// `RoomError::RoomNotFound` when nothing is known about the id.
    pub async fn open_saved_room(&self, room_id: &RoomId) -> RoomResult<Room> {
        let details = self.personal.rooms_details()?.remove(room_id);
        let record = self.storage.load_room(room_id)?;
        if details.is_none() && record.is_none() {
            return Err(RoomError::RoomNotFound(room_id.to_string()));
        }

        let mut options = RoomOptions::default().with_room_id(room_id.clone());
        if let Some(details) = details {
            options.name = Some(details.name);
            options.topic = Some(details.topic);
        }
        self.init_room(options).await
    }

    /// Reopen every saved room that is not already open
    ///
    /// Rooms that fail to open are logged and skipped. Returns the ids
    /// that were opened.
    pub async fn load_saved_rooms(&self) -> RoomResult<Vec<RoomId>> {
        let mut opened = Vec::new();
        for (room_id, details) in self.personal.rooms_details()? {
            if self.rooms.read().await.contains_key(&room_id) {
                continue;
            }
            let options = RoomOptions {
                room_id: Some(room_id.clone()),
                name: Some(details.name),
                topic: Some(details.topic),
                invite: None,
            };
            match self.init_room(options).await {
                Ok(_) => opened.push(room_id),
                Err(e) => warn!(%room_id, error = %e, "Failed to reopen saved room"),
            }
        }
        Ok(opened)
    }

    /// Close one room and drop it from the open set
    ///
    /// Fires the drained signal when this was the last open room.
    pub async fn exit_room(&self, room_id: &RoomId) -> RoomResult<()> {
        let room = self
            .rooms
            .write()
            .await
            .remove(room_id)
            .ok_or_else(|| RoomError::RoomNotFound(room_id.to_string()))?;

        let result = room.exit().await;
        if self.rooms.read().await.is_empty() {
            let _ = self.event_tx.send(RoomEvent::Drained);
            self.drained.notify_waiters();
        }
        result
    }

    /// Close every room, then shut the swarm down
    ///
    /// Safe to call with zero rooms open, and again after a previous
    /// cleanup.
    pub async fn cleanup(&self) -> RoomResult<()> {
        let rooms: Vec<Room> = self
            .rooms
            .write()
            .await
            .drain()
            .map(|(_, room)| room)
            .collect();
        let closed = rooms.len();

        let mut exits = JoinSet::new();
        for room in rooms {
            exits.spawn(async move {
                let id = room.id().clone();
                if let Err(e) = room.exit().await {
                    warn!(room_id = %id, error = %e, "Room exit failed during cleanup");
                }
            });
        }
        while let Some(result) = exits.join_next().await {
            if let Err(e) = result {
                warn!(error = %e, "Room close task panicked");
            }
        }

        if closed > 0 {
            let _ = self.event_tx.send(RoomEvent::Drained);
            self.drained.notify_waiters();
        }
        if let Some(task) = self.closed_listener.lock().await.take() {
            task.abort();
        }
        self.swarm.shutdown().await?;
        info!(rooms = closed, "Room manager cleaned up");
        Ok(())
    }

    /// Wait for the next time the last open room closes
    pub async fn drained(&self) {
        self.drained.notified().await;
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    /// Ids of the currently open rooms
    pub async fn rooms(&self) -> Vec<RoomId> {
        self.rooms.read().await.keys().cloned().collect()
    }

    pub async fn room(&self, room_id: &RoomId) -> Option<Room> {
        self.rooms.read().await.get(room_id).cloned()
    }

    /// Subscribe to events from every room plus manager-level signals
    pub fn subscribe(&self) -> broadcast::Receiver<RoomEvent> {
        self.event_tx.subscribe()
    }

    /// The node's private store
    pub fn personal(&self) -> &PersonalStore {
        &self.personal
    }

    pub async fn node_info(&self) -> NodeInfo {
        NodeInfo {
            endpoint_id: self.swarm.endpoint_id(),
            data_dir: self.data_dir.clone(),
            room_count: self.room_count().await,
        }
    }
}

/// Drop rooms from the open set when they close without going through
/// `exit_room`, and fire the drained signal if that empties the set.
///
/// `exit_room` and `cleanup` remove rooms themselves first, so this only
/// acts on rooms exited directly through their own handle.
fn spawn_closed_listener(
    rooms: Arc<RwLock<HashMap<RoomId, Room>>>,
    event_tx: broadcast::Sender<RoomEvent>,
    drained: Arc<Notify>,
) -> JoinHandle<()> {
    let mut events = event_tx.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(RoomEvent::Closed { room_id }) => {
                    let mut map = rooms.write().await;
                    let removed = map.remove(&room_id).is_some();
                    let empty = map.is_empty();
                    drop(map);
                    if removed {
                        debug!(%room_id, "Pruned closed room");
                        if empty {
                            let _ = event_tx.send(RoomEvent::Drained);
                            drained.notify_waiters();
                        }
                    }
                }
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    warn!(missed, "Room event listener lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;

    #[tokio::test]
    async fn test_cleanup_with_zero_rooms() {
        let dir = tempfile::tempdir().unwrap();
        let manager = RoomManager::new(dir.path()).await.unwrap();
        assert_eq!(manager.room_count().await, 0);
        manager.cleanup().await.unwrap();
        // And again
        manager.cleanup().await.unwrap();
    }

    #[tokio::test]
    async fn test_duplicate_room_id_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let manager = RoomManager::new(dir.path()).await.unwrap();
        let id = RoomId::generate();

        manager
            .init_room(RoomOptions::named("One").with_room_id(id.clone()))
            .await
            .unwrap();
        let err = manager
            .init_room(RoomOptions::named("Two").with_room_id(id.clone()))
            .await
            .unwrap_err();
        assert!(matches!(err, RoomError::InvalidOperation(_)));
        manager.cleanup().await.unwrap();
    }

    #[tokio::test]
    async fn test_init_ready_room_records_details() {
        let dir = tempfile::tempdir().unwrap();
        let manager = RoomManager::new(dir.path()).await.unwrap();

        let (room, token) = manager
            .init_ready_room(RoomOptions::named("Oncall"))
            .await
            .unwrap();
        assert!(token.unwrap().starts_with("cal-invite:"));
        assert_eq!(manager.room_count().await, 1);

        let details = manager.personal().rooms_details().unwrap();
        assert_eq!(details.get(room.id()).map(|d| d.name.as_str()), Some("Oncall"));
        manager.cleanup().await.unwrap();
    }

    #[tokio::test]
    async fn test_exit_unknown_room() {
        let dir = tempfile::tempdir().unwrap();
        let manager = RoomManager::new(dir.path()).await.unwrap();
        let err = manager.exit_room(&RoomId::generate()).await.unwrap_err();
        assert!(matches!(err, RoomError::RoomNotFound(_)));
        manager.cleanup().await.unwrap();
    }

    #[tokio::test]
    async fn test_exit_last_room_fires_drained() {
        let dir = tempfile::tempdir().unwrap();
        let manager = Arc::new(RoomManager::new(dir.path()).await.unwrap());

        let (room, _) = manager
            .init_ready_room(RoomOptions::named("Solo"))
            .await
            .unwrap();

        let waiter = {
            let manager = manager.clone();
            tokio::spawn(async move { manager.drained().await })
        };
        // Give the waiter a chance to register
        tokio::task::yield_now().await;

        let mut events = manager.subscribe();
        manager.exit_room(&room.id().clone()).await.unwrap();
        assert_eq!(manager.room_count().await, 0);

        tokio::time::timeout(Duration::from_secs(5), waiter)
            .await
            .expect("drained signal within deadline")
            .unwrap();
        let mut saw_drained = false;
        while let Ok(event) = events.try_recv() {
            if matches!(event, RoomEvent::Drained) {
                saw_drained = true;
            }
        }
        assert!(saw_drained);
        manager.cleanup().await.unwrap();
    }

    #[tokio::test]
    async fn test_direct_room_exit_prunes_open_set() {
        let dir = tempfile::tempdir().unwrap();
        let manager = RoomManager::new(dir.path()).await.unwrap();

        let (room, _) = manager
            .init_ready_room(RoomOptions::named("Detached"))
            .await
            .unwrap();
        let mut events = manager.subscribe();

        // Exit through the room handle, not the manager
        room.exit().await.unwrap();

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        let mut saw_drained = false;
        loop {
            while let Ok(event) = events.try_recv() {
                if matches!(event, RoomEvent::Drained) {
                    saw_drained = true;
                }
            }
            if manager.room_count().await == 0 && saw_drained {
                break;
            }
            assert!(
                std::time::Instant::now() < deadline,
                "closed room should be pruned and drained"
            );
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        manager.cleanup().await.unwrap();
    }

    #[tokio::test]
    async fn test_saved_rooms_survive_restart() {
        let dir = tempfile::tempdir().unwrap();

        let (room_id, endpoint_id) = {
            let manager = RoomManager::new(dir.path()).await.unwrap();
            let (room, _) = manager
                .init_ready_room(RoomOptions::named("Durable"))
                .await
                .unwrap();
            room.put("schedule", json!({"2026-05-01": "late"}))
                .await
                .unwrap();
            let id = room.id().clone();
            let endpoint_id = manager.node_info().await.endpoint_id;
            manager.cleanup().await.unwrap();
            (id, endpoint_id)
        };

        let manager = RoomManager::new(dir.path()).await.unwrap();
        // Endpoint identity is stable across restarts
        assert_eq!(manager.node_info().await.endpoint_id, endpoint_id);

        let opened = manager.load_saved_rooms().await.unwrap();
        assert_eq!(opened, vec![room_id.clone()]);
        let room = manager.room(&room_id).await.unwrap();
        assert!(room.is_writable().await);
        let schedule = room.schedule().await.unwrap();
        assert_eq!(schedule.get("2026-05-01"), Some(&json!("late")));
        manager.cleanup().await.unwrap();
    }

    #[tokio::test]
    async fn test_open_saved_room_unknown_id() {
        let dir = tempfile::tempdir().unwrap();
        let manager = RoomManager::new(dir.path()).await.unwrap();
        let err = manager
            .open_saved_room(&RoomId::generate())
            .await
            .unwrap_err();
        assert!(matches!(err, RoomError::RoomNotFound(_)));
        manager.cleanup().await.unwrap();
    }
}
