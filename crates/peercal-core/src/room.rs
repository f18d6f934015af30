//! Shared calendar room: lifecycle, writer admission, and gossip
//! replication.
//!
//! A room moves through a monotonic lifecycle:
//!
//! ```text
//!   Created ──▶ Readying ──▶ Ready ──▶ Closed
//! ```
//!
//! `ready()` drives Created to Ready. For a host that means minting an
//! invite and listening for pairing requests; for a candidate it means
//! knocking on the invite's pairing topic and waiting to be admitted.
//! Either way the room ends up subscribed to the shared gossip topic
//! with a background task replicating log entries:
//!
//! ```text
//!              ┌────────────────────────────┐
//!   put() ────▶│  OpLog (per-author chains) │◀──── remote Entries
//!              └─────────────┬──────────────┘
//!                            │ replay
//!                            ▼
//!                      ScheduleView ────▶ redb snapshot
//! ```
//!
//! All state sits behind one async mutex. `exit()` cancels the room's
//! token before taking that mutex, so a `ready()` parked inside the
//! pairing handshake gets unblocked rather than deadlocking the close.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{RoomError, RoomResult};
use crate::events::RoomEvent;
use crate::identity::{AuthorKeypair, WriterKey};
use crate::invite::{Invite, NodeAddrBytes};
use crate::oplog::{OpHash, OpLog, Operation, SignedEntry};
use crate::pairing::{Admission, MemberHandle, PairingCoordinator};
use crate::protocol::{RoomMessage, WireMessage};
use crate::storage::RoomStore;
use crate::swarm::{Swarm, TopicEvent, TopicReceiver, TopicSender};
use crate::types::{RoomId, RoomRecord, ScheduleMap, Topic, SCHEDULE_KEY};
use crate::view::{self, ScheduleView, ViewSnapshot};

/// Max entries per gossip message when serving a catch-up request
const ENTRIES_BATCH_SIZE: usize = 128;

/// Max peer addresses remembered per room for reconnecting
const MAX_SAVED_PEERS: usize = 16;

/// Lifecycle of a room; transitions only move rightward
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoomLifecycle {
    /// Opened but not yet on the network
    Created,
    /// `ready()` is in flight
    Readying,
    /// On the gossip topic and replicating
    Ready,
    /// Exited; all operations fail from here on
    Closed,
}

impl fmt::Display for RoomLifecycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RoomLifecycle::Created => "created",
            RoomLifecycle::Readying => "readying",
            RoomLifecycle::Ready => "ready",
            RoomLifecycle::Closed => "closed",
        };
        write!(f, "{}", s)
    }
}

/// How this instance entered the room
#[derive(Debug, Clone)]
enum RoomRole {
    /// Created the room (or reopened a saved one); mints invites
    Host,
    /// Joining via someone else's invite
    Candidate { invite: Invite },
}

/// Options for opening a room
#[derive(Debug, Clone, Default)]
pub struct RoomOptions {
    /// Explicit room id; generated when absent
    pub room_id: Option<RoomId>,
    /// Human-readable room name
    pub name: Option<String>,
    /// Existing gossip topic, for reopening a saved room
    pub topic: Option<Topic>,
    /// Invite token; present when joining someone else's room
    pub invite: Option<String>,
}

impl RoomOptions {
    /// Options for creating a fresh named room
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            ..Self::default()
        }
    }

    /// Options for joining a room via an invite token
    pub fn joining(token: impl Into<String>) -> Self {
        Self {
            invite: Some(token.into()),
            ..Self::default()
        }
    }

    pub fn with_room_id(mut self, room_id: RoomId) -> Self {
        self.room_id = Some(room_id);
        self
    }
}

/// Snapshot of a room's identity and progress
#[derive(Debug, Clone)]
pub struct RoomInfo {
    pub id: RoomId,
    pub name: Option<String>,
    pub lifecycle: RoomLifecycle,
    pub topic: Option<Topic>,
    /// The invite token minted by `ready()`, if this side minted one
    pub invite: Option<String>,
    pub writer_key: WriterKey,
    pub host_key: Option<WriterKey>,
    pub writers: usize,
    pub entries: usize,
    pub created_at: i64,
}

/// One log entry in causal order, for inspection
#[derive(Debug, Clone)]
pub struct TranscriptEntry {
    pub hash: OpHash,
    pub author: WriterKey,
    pub seq: u64,
    pub operation: Operation,
}

struct RoomState {
    lifecycle: RoomLifecycle,
    role: RoomRole,
    name: Option<String>,
    topic: Option<Topic>,
    created_at: i64,
    log: OpLog,
    view: ScheduleView,
    /// Token returned by the first successful `ready()`
    cached_invite: Option<String>,
    sender: Option<TopicSender>,
    known_peers: Vec<NodeAddrBytes>,
    /// Hashes already written to storage
    persisted: HashSet<OpHash>,
}

struct RoomInner {
    id: RoomId,
    author: AuthorKeypair,
    swarm: Arc<Swarm>,
    pairing: Arc<PairingCoordinator>,
    store: RoomStore,
    event_tx: broadcast::Sender<RoomEvent>,
    cancel: CancellationToken,
    /// Whether `exit()` should also shut the swarm down
    owns_swarm: bool,
    state: Mutex<RoomState>,
    repl_task: Mutex<Option<JoinHandle<()>>>,
}

/// A shared calendar room
///
/// Cheap to clone; all clones refer to the same room.
#[derive(Clone)]
pub struct Room {
    inner: Arc<RoomInner>,
}

impl Room {
    /// Open a room from storage and options without touching the network
    ///
    /// Invite tokens are decoded here so malformed or expired ones fail
    /// before any resources are allocated.
    pub(crate) async fn open(
        options: RoomOptions,
        swarm: Arc<Swarm>,
        pairing: Arc<PairingCoordinator>,
        store: RoomStore,
        event_tx: broadcast::Sender<RoomEvent>,
        owns_swarm: bool,
    ) -> RoomResult<Room> {
        let id = store.room_id().clone();
        let author = store.local_author()?;

        let role = match &options.invite {
            Some(token) => {
                let invite = Invite::decode(token)?;
                if invite.is_expired() {
                    return Err(RoomError::InvalidInvite("Invite has expired".to_string()));
                }
                RoomRole::Candidate { invite }
            }
            None => RoomRole::Host,
        };

        let record = store.load_record()?;
        let saved = record.is_some();
        let name = options
            .name
            .or_else(|| record.as_ref().and_then(|r| r.name.clone()));
        let topic = match &role {
            // Candidates learn the topic from the host's confirmation
            RoomRole::Candidate { .. } => None,
            RoomRole::Host => options.topic.or_else(|| record.as_ref().map(|r| r.topic)),
        };
        let created_at = record
            .as_ref()
            .map(|r| r.created_at)
            .unwrap_or_else(|| chrono::Utc::now().timestamp());
        let known_peers = record.map(|r| r.peers).unwrap_or_default();

        let mut log = OpLog::new(author.clone());
        let stored = store.load_entries()?;
        if saved || !stored.is_empty() {
            // The room was Ready when it was last persisted, so our
            // author had been admitted; re-register before replaying.
            log.add_writer_key(author.writer_key());
        }
        let mut view = ScheduleView::new();
        if !stored.is_empty() {
            log.integrate_batch(stored);
            view = view::replay(&mut log)?;
        }
        let persisted: HashSet<OpHash> = log.ordered().into_iter().map(|(hash, _)| hash).collect();

        info!(room_id = %id, entries = log.len(), saved, "Opened room");

        let room = Room {
            inner: Arc::new(RoomInner {
                id: id.clone(),
                author,
                swarm,
                pairing,
                store,
                event_tx,
                cancel: CancellationToken::new(),
                owns_swarm,
                state: Mutex::new(RoomState {
                    lifecycle: RoomLifecycle::Created,
                    role,
                    name,
                    topic,
                    created_at,
                    log,
                    view,
                    cached_invite: None,
                    sender: None,
                    known_peers,
                    persisted,
                }),
                repl_task: Mutex::new(None),
            }),
        };
        let _ = room.inner.event_tx.send(RoomEvent::Opened { room_id: id });
        Ok(room)
    }

    pub fn id(&self) -> &RoomId {
        &self.inner.id
    }

    /// This instance's writer key in the room
    pub fn writer_key(&self) -> WriterKey {
        self.inner.author.writer_key()
    }

    pub async fn lifecycle(&self) -> RoomLifecycle {
        self.inner.state.lock().await.lifecycle
    }

    pub async fn name(&self) -> Option<String> {
        self.inner.state.lock().await.name.clone()
    }

    /// Whether local appends are currently accepted
    pub async fn is_writable(&self) -> bool {
        self.inner.state.lock().await.log.is_writable()
    }

    /// Subscribe to this room's event stream
    pub fn subscribe(&self) -> broadcast::Receiver<RoomEvent> {
        self.inner.event_tx.subscribe()
    }

    /// Bring the room onto the network
    ///
    /// Hosts return the invite token for others to join with;
    /// candidates block until the host admits them and return `None`.
    /// Calling `ready()` on an already ready room returns the cached
    /// token without doing any work.
    pub async fn ready(&self) -> RoomResult<Option<String>> {
        let mut guard = self.inner.state.lock().await;
        match guard.lifecycle {
            RoomLifecycle::Ready => return Ok(guard.cached_invite.clone()),
            RoomLifecycle::Closed => {
                return Err(RoomError::RoomClosed(self.inner.id.to_string()))
            }
            RoomLifecycle::Created | RoomLifecycle::Readying => {}
        }
        self.transition(&mut guard, RoomLifecycle::Readying);

        let role = guard.role.clone();
        let token = match role {
            RoomRole::Host => self.ready_host(&mut guard).await?,
            RoomRole::Candidate { invite } => self.ready_candidate(&mut guard, invite).await?,
        };

        self.transition(&mut guard, RoomLifecycle::Ready);
        guard.cached_invite = token.clone();
        drop(guard);

        let _ = self.inner.event_tx.send(RoomEvent::Ready {
            room_id: self.inner.id.clone(),
        });
        Ok(token)
    }

    async fn ready_host(&self, state: &mut RoomState) -> RoomResult<Option<String>> {
        let inner = &self.inner;
        let topic = match state.topic {
            Some(topic) => topic,
            None => {
                let topic = Topic::generate();
                state.topic = Some(topic);
                topic
            }
        };

        let local = inner.author.writer_key();
        state.log.add_writer_key(local);
        if state.log.is_empty() {
            // Genesis entry: the creator admits itself so the writer
            // set has an explicit root in the log.
            let entry = state.log.append(&Operation::AddWriter { key: local })?;
            inner.store.append_entry(&entry)?;
            state.persisted.insert(entry.hash()?);
        }
        state.view = view::replay(&mut state.log)?;
        inner.store.save_view(&state.view)?;

        let host_addr = NodeAddrBytes::from_endpoint_addr(&inner.swarm.endpoint_addr());
        let mut invite = Invite::new(local, host_addr);
        if let Some(name) = &state.name {
            invite = invite.with_name(name.clone());
        }
        let token = invite.encode()?;

        let member = inner
            .pairing
            .add_member(
                invite,
                inner.author.clone(),
                topic,
                state.name.clone(),
                inner.cancel.child_token(),
            )
            .await?;

        let bootstrap = bootstrap_ids(&inner.swarm, &state.known_peers);
        let (sender, receiver) = inner.swarm.join(topic.topic_id(), bootstrap).await?;
        state.sender = Some(sender);

        persist_record(inner, state);
        self.spawn_replication(receiver, Some(member)).await;
        Ok(Some(token))
    }

    async fn ready_candidate(
        &self,
        state: &mut RoomState,
        invite: Invite,
    ) -> RoomResult<Option<String>> {
        let inner = &self.inner;
        let handle = inner
            .pairing
            .add_candidate(invite.clone(), inner.author.clone(), inner.cancel.child_token())
            .await?;

        info!(room_id = %inner.id, invite = %invite, "Waiting for host admission");
        let admission = handle.admitted().await?;
        info!(room_id = %inner.id, host = %admission.host_key, "Admitted to room");

        state.topic = Some(admission.topic);
        if state.name.is_none() {
            state.name = admission.room_name.clone();
        }

        let local = inner.author.writer_key();
        state.log.add_writer_key(admission.host_key);
        state.log.add_writer_key(local);
        if state.log.is_empty() {
            // Mirror the host into our own log so the writer sets
            // converge from either side of the pairing.
            let entry = state.log.append(&Operation::AddWriter {
                key: admission.host_key,
            })?;
            inner.store.append_entry(&entry)?;
            state.persisted.insert(entry.hash()?);
        }
        state.view = view::replay(&mut state.log)?;
        inner.store.save_view(&state.view)?;

        remember_peer(&mut state.known_peers, &invite.host_addr);
        let bootstrap = bootstrap_ids(&inner.swarm, &state.known_peers);
        let (sender, receiver) = inner.swarm.join(admission.topic.topic_id(), bootstrap).await?;
        state.sender = Some(sender);

        persist_record(inner, state);
        self.spawn_replication(receiver, None).await;

        let _ = inner.event_tx.send(RoomEvent::WriterAdmitted {
            room_id: inner.id.clone(),
            writer: admission.host_key,
        });
        Ok(None)
    }

    async fn spawn_replication(&self, receiver: TopicReceiver, member: Option<MemberHandle>) {
        let task = tokio::spawn(replication_task(self.inner.clone(), receiver, member));
        *self.inner.repl_task.lock().await = Some(task);
    }

    /// Write a value into the shared view
    ///
    /// # Errors
    ///
    /// `RoomError::NotWritable` until this instance has been admitted
    /// to the writer set; `RoomError::RoomClosed` after `exit()`.
    pub async fn put(&self, key: impl Into<String>, value: serde_json::Value) -> RoomResult<()> {
        let key = key.into();
        let mut guard = self.inner.state.lock().await;
        if guard.lifecycle == RoomLifecycle::Closed {
            return Err(RoomError::RoomClosed(self.inner.id.to_string()));
        }
        let state = &mut *guard;

        let op = Operation::UpdateSchedule { key, value };
        let entry = state.log.append(&op)?;
        self.inner.store.append_entry(&entry)?;
        let hash = entry.hash()?;
        state.persisted.insert(hash);

        let batch = [(hash, entry.clone())];
        view::apply(&batch, &mut state.view, &mut state.log)?;
        self.inner.store.save_view(&state.view)?;

        let sender = state.sender.clone();
        drop(guard);

        let _ = self.inner.event_tx.send(RoomEvent::ScheduleChanged {
            room_id: self.inner.id.clone(),
            ops_applied: 1,
        });
        if let Some(sender) = sender {
            broadcast_entries(&sender, &self.inner.id, vec![entry]).await;
        }
        Ok(())
    }

    /// Read a single view key
    pub async fn get(&self, key: &str) -> Option<serde_json::Value> {
        self.inner.state.lock().await.view.get(key).cloned()
    }

    /// The room's shared calendar
    pub async fn schedule(&self) -> RoomResult<ScheduleMap> {
        let guard = self.inner.state.lock().await;
        schedule_from_view(&guard.view)
    }

    /// Merge changes into the shared calendar
    ///
    /// A JSON `null` entry removes that date. Returns the calendar
    /// after the merge.
    pub async fn adjust_schedule(&self, changes: &ScheduleMap) -> RoomResult<ScheduleMap> {
        let mut schedule = self.schedule().await?;
        for (date, entry) in changes {
            if entry.is_null() {
                schedule.remove(date);
            } else {
                schedule.insert(date.clone(), entry.clone());
            }
        }
        let value = serde_json::to_value(&schedule)
            .map_err(|e| RoomError::Serialization(format!("Failed to encode schedule: {}", e)))?;
        self.put(SCHEDULE_KEY, value).await?;
        Ok(schedule)
    }

    /// Snapshot of the derived view
    pub async fn snapshot(&self) -> ViewSnapshot {
        self.inner.state.lock().await.view.snapshot()
    }

    /// The current writer set
    pub async fn writers(&self) -> Vec<WriterKey> {
        self.inner
            .state
            .lock()
            .await
            .log
            .writers()
            .iter()
            .copied()
            .collect()
    }

    /// The merged log in causal order
    pub async fn transcript(&self) -> RoomResult<Vec<TranscriptEntry>> {
        let guard = self.inner.state.lock().await;
        guard
            .log
            .ordered()
            .into_iter()
            .map(|(hash, entry)| {
                Ok(TranscriptEntry {
                    hash,
                    author: entry.author,
                    seq: entry.seq,
                    operation: entry.operation()?,
                })
            })
            .collect()
    }

    pub async fn info(&self) -> RoomInfo {
        let guard = self.inner.state.lock().await;
        let host_key = match &guard.role {
            RoomRole::Host => Some(self.inner.author.writer_key()),
            RoomRole::Candidate { invite } => Some(invite.host_key),
        };
        RoomInfo {
            id: self.inner.id.clone(),
            name: guard.name.clone(),
            lifecycle: guard.lifecycle,
            topic: guard.topic,
            invite: guard.cached_invite.clone(),
            writer_key: self.inner.author.writer_key(),
            host_key,
            writers: guard.log.writers().len(),
            entries: guard.log.len(),
            created_at: guard.created_at,
        }
    }

    /// Leave the room and release its resources
    ///
    /// Flushes the view, stops replication, and leaves the gossip
    /// topic. Only shuts the swarm down when this room owns it.
    /// Idempotent: later calls return `Ok` without doing anything.
    pub async fn exit(&self) -> RoomResult<()> {
        // Cancel before locking so a ready() parked in the pairing
        // handshake releases the state lock.
        self.inner.cancel.cancel();

        let mut guard = self.inner.state.lock().await;
        if guard.lifecycle == RoomLifecycle::Closed {
            return Ok(());
        }
        self.transition(&mut guard, RoomLifecycle::Closed);

        let flush = self.inner.store.save_view(&guard.view);
        if let Err(e) = &flush {
            warn!(room_id = %self.inner.id, error = %e, "Failed to flush view on exit");
        }
        persist_record(&self.inner, &guard);
        let topic = guard.topic;
        guard.sender = None;
        drop(guard);

        if let Some(task) = self.inner.repl_task.lock().await.take() {
            if let Err(e) = task.await {
                warn!(room_id = %self.inner.id, error = %e, "Replication task ended abnormally");
            }
        }
        if let Some(topic) = topic {
            self.inner.swarm.leave(&topic.topic_id());
        }
        if self.inner.owns_swarm {
            if let Err(e) = self.inner.swarm.shutdown().await {
                warn!(room_id = %self.inner.id, error = %e, "Swarm shutdown failed");
            }
        }

        let _ = self.inner.event_tx.send(RoomEvent::Closed {
            room_id: self.inner.id.clone(),
        });
        info!(room_id = %self.inner.id, "Room closed");
        flush
    }

    fn transition(&self, state: &mut RoomState, to: RoomLifecycle) {
        if state.lifecycle == to {
            return;
        }
        info!(room_id = %self.inner.id, from = %state.lifecycle, to = %to, "Room lifecycle");
        state.lifecycle = to;
    }
}

impl fmt::Debug for Room {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Room").field("id", &self.inner.id).finish()
    }
}

/// Register saved peers with discovery and collect their ids for
/// gossip bootstrap
fn bootstrap_ids(swarm: &Swarm, peers: &[NodeAddrBytes]) -> Vec<iroh::EndpointId> {
    let mut ids = Vec::new();
    for peer in peers {
        match peer.to_endpoint_addr() {
            Ok(addr) => {
                ids.push(addr.id);
                swarm.add_peer_addr(addr);
            }
            Err(e) => debug!(error = %e, "Skipping saved peer with bad address"),
        }
    }
    ids
}

/// Record a peer address, replacing a stale one for the same endpoint.
/// Returns true when the list changed.
fn remember_peer(peers: &mut Vec<NodeAddrBytes>, addr: &NodeAddrBytes) -> bool {
    if let Some(existing) = peers
        .iter_mut()
        .find(|p| p.endpoint_id == addr.endpoint_id)
    {
        if existing == addr {
            return false;
        }
        *existing = addr.clone();
        return true;
    }
    if peers.len() >= MAX_SAVED_PEERS {
        peers.remove(0);
    }
    peers.push(addr.clone());
    true
}

fn persist_record(inner: &RoomInner, state: &RoomState) {
    let Some(topic) = state.topic else { return };
    let record = RoomRecord {
        id: inner.id.clone(),
        name: state.name.clone(),
        topic,
        created_at: state.created_at,
        peers: state.known_peers.clone(),
    };
    if let Err(e) = inner.store.save_record(&record) {
        warn!(room_id = %inner.id, error = %e, "Failed to save room record");
    }
}

/// Write every log entry storage does not have yet. Returns how many
/// were stored.
fn persist_new_entries(inner: &RoomInner, state: &mut RoomState) -> usize {
    let mut stored = 0;
    for (hash, entry) in state.log.ordered() {
        if state.persisted.contains(&hash) {
            continue;
        }
        match inner.store.append_entry(&entry) {
            Ok(()) => {
                state.persisted.insert(hash);
                stored += 1;
            }
            Err(e) => warn!(room_id = %inner.id, error = %e, "Failed to persist entry"),
        }
    }
    stored
}

fn schedule_from_view(view: &ScheduleView) -> RoomResult<ScheduleMap> {
    match view.get(SCHEDULE_KEY) {
        Some(value) => serde_json::from_value(value.clone())
            .map_err(|e| RoomError::Serialization(format!("Corrupt room schedule: {}", e))),
        None => Ok(ScheduleMap::new()),
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Replication task
// ═══════════════════════════════════════════════════════════════════════

/// Background loop owning the room's gossip receiver and, for hosts,
/// the pairing admission stream
async fn replication_task(
    inner: Arc<RoomInner>,
    mut receiver: TopicReceiver,
    mut member: Option<MemberHandle>,
) {
    debug!(room_id = %inner.id, "Replication task started");
    loop {
        tokio::select! {
            _ = inner.cancel.cancelled() => break,
            admission = next_admission(&mut member) => {
                match admission {
                    Some(admission) => handle_admission(&inner, admission).await,
                    None => member = None,
                }
            }
            event = receiver.recv_event() => {
                match event {
                    Some(TopicEvent::Message(message)) => {
                        handle_gossip_message(&inner, message).await;
                    }
                    Some(TopicEvent::NeighborUp(peer)) => {
                        debug!(room_id = %inner.id, peer = %peer, "Peer joined room topic");
                        let _ = inner.event_tx.send(RoomEvent::PeerConnected {
                            room_id: inner.id.clone(),
                            peer_id: peer.to_string(),
                        });
                        announce(&inner).await;
                    }
                    Some(TopicEvent::NeighborDown(peer)) => {
                        let _ = inner.event_tx.send(RoomEvent::PeerDisconnected {
                            room_id: inner.id.clone(),
                            peer_id: peer.to_string(),
                        });
                    }
                    None => {
                        debug!(room_id = %inner.id, "Room topic stream ended");
                        break;
                    }
                }
            }
        }
    }
    debug!(room_id = %inner.id, "Replication task ended");
}

async fn next_admission(member: &mut Option<MemberHandle>) -> Option<Admission> {
    match member {
        Some(handle) => handle.next_admission().await,
        None => std::future::pending().await,
    }
}

/// The pairing listener admitted a candidate: register it, append the
/// addWriter entry, and push it out
async fn handle_admission(inner: &Arc<RoomInner>, admission: Admission) {
    let mut guard = inner.state.lock().await;
    if guard.lifecycle == RoomLifecycle::Closed {
        return;
    }
    let state = &mut *guard;
    if !state.log.add_writer_key(admission.writer_key) {
        debug!(room_id = %inner.id, writer = %admission.writer_key, "Writer already admitted");
        return;
    }
    info!(room_id = %inner.id, writer = %admission.writer_key, "Admitting writer");

    let entry = match state.log.append(&Operation::AddWriter {
        key: admission.writer_key,
    }) {
        Ok(entry) => entry,
        Err(e) => {
            error!(room_id = %inner.id, error = %e, "Failed to append admission");
            drop(guard);
            let _ = inner.event_tx.send(RoomEvent::Error {
                room_id: inner.id.clone(),
                message: e.to_string(),
            });
            return;
        }
    };
    match view::replay(&mut state.log) {
        Ok(view) => state.view = view,
        Err(e) => error!(room_id = %inner.id, error = %e, "Replay failed after admission"),
    }
    persist_new_entries(inner, state);
    if let Err(e) = inner.store.save_view(&state.view) {
        warn!(room_id = %inner.id, error = %e, "Failed to save view");
    }
    let heads = state.log.heads();
    let sender = state.sender.clone();
    drop(guard);

    let _ = inner.event_tx.send(RoomEvent::WriterAdmitted {
        room_id: inner.id.clone(),
        writer: admission.writer_key,
    });
    if let Some(sender) = sender {
        broadcast_entries(&sender, &inner.id, vec![entry]).await;
        announce_heads(&sender, inner, heads).await;
    }
}

async fn handle_gossip_message(inner: &Arc<RoomInner>, message: crate::swarm::GossipMessage) {
    let message = match WireMessage::decode(&message.content) {
        Ok(message) => message.into_inner(),
        Err(e) => {
            debug!(room_id = %inner.id, error = %e, "Ignoring undecodable message");
            return;
        }
    };
    if message.room_id() != &inner.id {
        debug!(room_id = %inner.id, other = %message.room_id(), "Ignoring message for different room");
        return;
    }
    match message {
        RoomMessage::Announce { heads, addr, .. } => handle_announce(inner, heads, addr).await,
        RoomMessage::Request { have, .. } => handle_request(inner, have).await,
        RoomMessage::Entries { entries, .. } => handle_entries(inner, entries).await,
    }
}

/// A peer announced its heads: remember how to dial it and request
/// whatever we lack
async fn handle_announce(inner: &Arc<RoomInner>, heads: Vec<OpHash>, addr: NodeAddrBytes) {
    match addr.to_endpoint_addr() {
        Ok(endpoint_addr) => inner.swarm.add_peer_addr(endpoint_addr),
        Err(e) => debug!(room_id = %inner.id, error = %e, "Announce carried unusable address"),
    }

    let mut guard = inner.state.lock().await;
    if guard.lifecycle == RoomLifecycle::Closed {
        return;
    }
    let state = &mut *guard;
    if remember_peer(&mut state.known_peers, &addr) {
        persist_record(inner, state);
    }
    if state.log.has_all(&heads) {
        return;
    }
    let have = state.log.heads();
    let sender = state.sender.clone();
    drop(guard);

    debug!(room_id = %inner.id, "Peer has entries we lack, requesting");
    let Some(sender) = sender else { return };
    let message = WireMessage::new(RoomMessage::Request {
        room_id: inner.id.clone(),
        have,
    });
    match message.encode() {
        Ok(bytes) => {
            if let Err(e) = sender.broadcast(bytes).await {
                debug!(room_id = %inner.id, error = %e, "Request broadcast failed");
            }
        }
        Err(e) => warn!(room_id = %inner.id, error = %e, "Failed to encode request"),
    }
}

/// A peer asked for what it lacks: serve everything outside its
/// ancestor closure
async fn handle_request(inner: &Arc<RoomInner>, have: Vec<OpHash>) {
    let guard = inner.state.lock().await;
    if guard.lifecycle == RoomLifecycle::Closed {
        return;
    }
    let entries = guard.log.entries_since(&have);
    let sender = guard.sender.clone();
    drop(guard);

    if entries.is_empty() {
        return;
    }
    debug!(room_id = %inner.id, count = entries.len(), "Serving requested entries");
    let Some(sender) = sender else { return };
    broadcast_entries(&sender, &inner.id, entries).await;
}

/// A peer pushed entries: merge, refold the view, persist, and let
/// everyone know about the new heads
async fn handle_entries(inner: &Arc<RoomInner>, entries: Vec<SignedEntry>) {
    let received = entries.len();
    let mut guard = inner.state.lock().await;
    if guard.lifecycle == RoomLifecycle::Closed {
        return;
    }
    let state = &mut *guard;

    let writers_before = state.log.writers().clone();
    let integrated = state.log.integrate_batch(entries);
    if integrated.is_empty() {
        return;
    }
    debug!(room_id = %inner.id, received, integrated = integrated.len(), "Merged remote entries");

    match view::replay(&mut state.log) {
        Ok(view) => state.view = view,
        Err(e) => {
            error!(room_id = %inner.id, error = %e, "Replay failed after merge");
            drop(guard);
            let _ = inner.event_tx.send(RoomEvent::Error {
                room_id: inner.id.clone(),
                message: e.to_string(),
            });
            return;
        }
    }
    let applied = persist_new_entries(inner, state);
    if let Err(e) = inner.store.save_view(&state.view) {
        warn!(room_id = %inner.id, error = %e, "Failed to save view");
    }
    let new_writers: Vec<WriterKey> = state
        .log
        .writers()
        .difference(&writers_before)
        .copied()
        .collect();
    let heads = state.log.heads();
    let sender = state.sender.clone();
    drop(guard);

    for writer in new_writers {
        let _ = inner.event_tx.send(RoomEvent::WriterAdmitted {
            room_id: inner.id.clone(),
            writer,
        });
    }
    let _ = inner.event_tx.send(RoomEvent::ScheduleChanged {
        room_id: inner.id.clone(),
        ops_applied: applied,
    });
    if let Some(sender) = sender {
        announce_heads(&sender, inner, heads).await;
    }
}

/// Announce our heads and dial address on the room topic
async fn announce(inner: &Arc<RoomInner>) {
    let guard = inner.state.lock().await;
    let heads = guard.log.heads();
    let sender = guard.sender.clone();
    drop(guard);
    if let Some(sender) = sender {
        announce_heads(&sender, inner, heads).await;
    }
}

async fn announce_heads(sender: &TopicSender, inner: &RoomInner, heads: Vec<OpHash>) {
    let addr = NodeAddrBytes::from_endpoint_addr(&inner.swarm.endpoint_addr());
    let message = WireMessage::new(RoomMessage::Announce {
        room_id: inner.id.clone(),
        heads,
        addr,
    });
    match message.encode() {
        Ok(bytes) => {
            if let Err(e) = sender.broadcast(bytes).await {
                debug!(room_id = %inner.id, error = %e, "Announce failed");
            }
        }
        Err(e) => warn!(room_id = %inner.id, error = %e, "Failed to encode announce"),
    }
}

async fn broadcast_entries(sender: &TopicSender, room_id: &RoomId, entries: Vec<SignedEntry>) {
    for chunk in entries.chunks(ENTRIES_BATCH_SIZE) {
        let message = WireMessage::new(RoomMessage::Entries {
            room_id: room_id.clone(),
            entries: chunk.to_vec(),
        });
        match message.encode() {
            Ok(bytes) => {
                if let Err(e) = sender.broadcast(bytes).await {
                    debug!(%room_id, error = %e, "Entry broadcast failed");
                    break;
                }
            }
            Err(e) => {
                warn!(%room_id, error = %e, "Failed to encode entries");
                break;
            }
        }
    }
}
