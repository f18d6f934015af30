//! Invite pairing handshake
//!
//! Hosts and candidates meet on a rendezvous topic derived from the
//! invite, so neither side needs the other's room state up front:
//!
//! ```text
//!   Host                                   Candidate
//!    │  join pairing topic                    │  decode invite
//!    │  (awaiting-members)                    │  join pairing topic
//!    │                                        │  (awaiting-host)
//!    │        Request { writer_key, addr }    │
//!    │ ◄──────────────────────────────────────│
//!    │  (member-found)                        │
//!    │  Confirm { topic, host_key, addr }     │
//!    │ ──────────────────────────────────────►│
//!    │  (confirmed)                           │  (admitted)
//!    │  append addWriter(candidate)           │  append addWriter(host)
//! ```
//!
//! The room's real topic travels only in the Confirm. Both messages are
//! signed by their sender's writer key; an invite is a bearer token, so
//! the first valid redemption wins and later redemptions by a different
//! key are refused.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{RoomError, RoomResult};
use crate::identity::{self, AuthorKeypair, WriterKey};
use crate::invite::{Invite, NodeAddrBytes};
use crate::swarm::{Swarm, TopicEvent, TopicReceiver, TopicSender};
use crate::types::Topic;

/// Capacity of the admission channel a host room consumes
const ADMISSION_CHANNEL_CAPACITY: usize = 16;

/// Host-side pairing state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostPhase {
    /// Listening on the pairing topic, nobody has knocked yet
    AwaitingMembers,
    /// A valid request arrived and is being answered
    MemberFound,
    /// At least one candidate was confirmed
    Confirmed,
}

impl fmt::Display for HostPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HostPhase::AwaitingMembers => write!(f, "awaiting-members"),
            HostPhase::MemberFound => write!(f, "member-found"),
            HostPhase::Confirmed => write!(f, "confirmed"),
        }
    }
}

/// Candidate-side pairing state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CandidatePhase {
    /// Invite token is being decoded and validated
    Decoding,
    /// Request sent, waiting for the host's confirmation
    AwaitingHost,
    /// Confirmed by the host
    Admitted,
}

impl fmt::Display for CandidatePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CandidatePhase::Decoding => write!(f, "decoding"),
            CandidatePhase::AwaitingHost => write!(f, "awaiting-host"),
            CandidatePhase::Admitted => write!(f, "admitted"),
        }
    }
}

/// Messages exchanged on the pairing rendezvous topic
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PairingMessage {
    /// Candidate knocks, carrying its writer key and dial address
    Request {
        invite_id: [u8; 16],
        writer_key: WriterKey,
        addr: NodeAddrBytes,
        signature: Vec<u8>,
    },
    /// Host admits one candidate and hands over the room coordinates
    Confirm {
        invite_id: [u8; 16],
        host_key: WriterKey,
        /// Addressee, so concurrent candidates can share the topic
        candidate_key: WriterKey,
        topic: [u8; 32],
        room_name: Option<String>,
        addr: NodeAddrBytes,
        signature: Vec<u8>,
    },
}

impl PairingMessage {
    pub fn encode(&self) -> RoomResult<Vec<u8>> {
        postcard::to_allocvec(self)
            .map_err(|e| RoomError::Serialization(format!("Failed to encode pairing message: {}", e)))
    }

    pub fn decode(bytes: &[u8]) -> RoomResult<Self> {
        postcard::from_bytes(bytes)
            .map_err(|e| RoomError::Serialization(format!("Failed to decode pairing message: {}", e)))
    }

    /// The bytes the signature covers: this message with an empty signature
    fn signing_bytes(&self) -> RoomResult<Vec<u8>> {
        let mut unsigned = self.clone();
        match &mut unsigned {
            PairingMessage::Request { signature, .. } => signature.clear(),
            PairingMessage::Confirm { signature, .. } => signature.clear(),
        }
        unsigned.encode()
    }

    /// Sign in place with the sender's room author key
    pub fn sign(&mut self, author: &AuthorKeypair) -> RoomResult<()> {
        let bytes = self.signing_bytes()?;
        let signature = author.sign(&bytes);
        match self {
            PairingMessage::Request { signature: s, .. } => *s = signature,
            PairingMessage::Confirm { signature: s, .. } => *s = signature,
        }
        Ok(())
    }

    /// Verify against the expected signer's writer key
    pub fn verify(&self, signer: &WriterKey) -> RoomResult<()> {
        let bytes = self.signing_bytes()?;
        let signature = match self {
            PairingMessage::Request { signature, .. } => signature,
            PairingMessage::Confirm { signature, .. } => signature,
        };
        identity::verify_signature(signer, &bytes, signature)
    }
}

/// One admitted candidate, delivered to the host room
#[derive(Debug, Clone, PartialEq)]
pub struct Admission {
    pub writer_key: WriterKey,
}

/// The host's confirmation, delivered to the candidate room
#[derive(Debug, Clone, PartialEq)]
pub struct HostAdmission {
    pub host_key: WriterKey,
    pub topic: Topic,
    pub room_name: Option<String>,
}

/// Host-side handle: a stream of admissions for one invite
pub struct MemberHandle {
    admissions: mpsc::Receiver<Admission>,
}

impl MemberHandle {
    /// Next admitted candidate, or None once the listener ended
    pub async fn next_admission(&mut self) -> Option<Admission> {
        self.admissions.recv().await
    }
}

/// Candidate-side handle resolving to the host's confirmation
pub struct CandidateHandle {
    result: oneshot::Receiver<HostAdmission>,
}

impl CandidateHandle {
    /// Wait until the host confirms us
    ///
    /// # Errors
    ///
    /// Returns [`RoomError::Pairing`] if the handshake was cancelled or the
    /// pairing topic closed before a confirmation arrived.
    pub async fn admitted(self) -> RoomResult<HostAdmission> {
        self.result
            .await
            .map_err(|_| RoomError::Pairing("Pairing ended before admission".to_string()))
    }
}

/// Runs pairing handshakes for all rooms on one swarm
pub struct PairingCoordinator {
    swarm: Arc<Swarm>,
    /// invite_id -> the writer key that redeemed it
    redeemed: Arc<parking_lot::Mutex<HashMap<[u8; 16], WriterKey>>>,
}

impl PairingCoordinator {
    pub fn new(swarm: Arc<Swarm>) -> Self {
        Self {
            swarm,
            redeemed: Arc::new(parking_lot::Mutex::new(HashMap::new())),
        }
    }

    /// Whether an invite was already redeemed on this node
    ///
    /// Redemptions are tracked in memory only; a restarted host accepts a
    /// previously used invite again.
    pub fn is_redeemed(&self, invite_id: &[u8; 16]) -> bool {
        self.redeemed.lock().contains_key(invite_id)
    }

    /// Host side: listen for candidates redeeming `invite`
    ///
    /// Joins the pairing topic immediately so join failures surface here;
    /// the returned handle yields one [`Admission`] per distinct admitted
    /// writer key. The listener runs until `cancel` fires.
    pub async fn add_member(
        &self,
        invite: Invite,
        author: AuthorKeypair,
        topic: Topic,
        room_name: Option<String>,
        cancel: CancellationToken,
    ) -> RoomResult<MemberHandle> {
        let pairing_topic = invite.pairing_topic();
        let (sender, receiver) = self.swarm.join(pairing_topic, vec![]).await?;
        let (admission_tx, admission_rx) = mpsc::channel(ADMISSION_CHANNEL_CAPACITY);

        tokio::spawn(member_task(
            self.swarm.clone(),
            self.redeemed.clone(),
            invite,
            author,
            topic,
            room_name,
            sender,
            receiver,
            admission_tx,
            cancel,
        ));

        Ok(MemberHandle {
            admissions: admission_rx,
        })
    }

    /// Candidate side: redeem `invite` and wait for the host
    ///
    /// # Errors
    ///
    /// Returns [`RoomError::InvalidInvite`] for an expired invite and
    /// [`RoomError::Network`] if the host address in the invite is
    /// unusable.
    pub async fn add_candidate(
        &self,
        invite: Invite,
        author: AuthorKeypair,
        cancel: CancellationToken,
    ) -> RoomResult<CandidateHandle> {
        let phase = CandidatePhase::Decoding;
        debug!(invite = %invite, %phase, "Validating invite");

        if invite.is_expired() {
            return Err(RoomError::InvalidInvite("Invite has expired".to_string()));
        }

        let host_endpoint = invite.host_endpoint()?;
        let host_id = host_endpoint.id;
        self.swarm.add_peer_addr(host_endpoint);

        let pairing_topic = invite.pairing_topic();
        let (sender, receiver) = self.swarm.join(pairing_topic, vec![host_id]).await?;
        let (result_tx, result_rx) = oneshot::channel();

        tokio::spawn(candidate_task(
            self.swarm.clone(),
            invite,
            author,
            sender,
            receiver,
            result_tx,
            cancel,
        ));

        Ok(CandidateHandle { result: result_rx })
    }
}

#[allow(clippy::too_many_arguments)]
async fn member_task(
    swarm: Arc<Swarm>,
    redeemed: Arc<parking_lot::Mutex<HashMap<[u8; 16], WriterKey>>>,
    invite: Invite,
    author: AuthorKeypair,
    topic: Topic,
    room_name: Option<String>,
    sender: TopicSender,
    mut receiver: TopicReceiver,
    admissions: mpsc::Sender<Admission>,
    cancel: CancellationToken,
) {
    let pairing_topic = invite.pairing_topic();
    let mut phase = HostPhase::AwaitingMembers;
    info!(invite = %invite, %phase, "Pairing listener started");

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                debug!(invite = %invite, "Pairing listener cancelled");
                break;
            }
            event = receiver.recv_event() => match event {
                Some(TopicEvent::Message(msg)) => {
                    let message = match PairingMessage::decode(&msg.content) {
                        Ok(m) => m,
                        Err(e) => {
                            debug!(error = %e, "Ignoring undecodable pairing message");
                            continue;
                        }
                    };
                    let PairingMessage::Request { invite_id, writer_key, addr, .. } = &message else {
                        continue;
                    };
                    if *invite_id != invite.invite_id {
                        debug!("Request for a different invite, ignoring");
                        continue;
                    }
                    if let Err(e) = message.verify(writer_key) {
                        warn!(candidate = %writer_key, error = %e, "Rejecting unsigned pairing request");
                        continue;
                    }
                    if invite.is_expired() {
                        warn!(invite = %invite, "Refusing request for expired invite");
                        continue;
                    }

                    // First valid redemption wins; the same key may knock
                    // again and gets re-confirmed.
                    let fresh = {
                        let mut redeemed = redeemed.lock();
                        match redeemed.get(invite_id) {
                            None => {
                                redeemed.insert(*invite_id, *writer_key);
                                true
                            }
                            Some(existing) if existing == writer_key => false,
                            Some(_) => {
                                warn!(candidate = %writer_key, "Invite already redeemed, refusing");
                                continue;
                            }
                        }
                    };

                    if phase == HostPhase::AwaitingMembers {
                        phase = HostPhase::MemberFound;
                        info!(%phase, candidate = %writer_key, "Candidate found");
                    }

                    match addr.to_endpoint_addr() {
                        Ok(endpoint_addr) => swarm.add_peer_addr(endpoint_addr),
                        Err(e) => warn!(error = %e, "Candidate sent unusable address"),
                    }

                    let mut confirm = PairingMessage::Confirm {
                        invite_id: *invite_id,
                        host_key: author.writer_key(),
                        candidate_key: *writer_key,
                        topic: *topic.as_bytes(),
                        room_name: room_name.clone(),
                        addr: NodeAddrBytes::from_endpoint_addr(&swarm.endpoint_addr()),
                        signature: Vec::new(),
                    };
                    if let Err(e) = confirm.sign(&author) {
                        warn!(error = %e, "Failed to sign confirmation");
                        continue;
                    }
                    match confirm.encode() {
                        Ok(bytes) => {
                            if let Err(e) = sender.broadcast(bytes).await {
                                warn!(error = %e, "Failed to broadcast confirmation");
                                continue;
                            }
                        }
                        Err(e) => {
                            warn!(error = %e, "Failed to encode confirmation");
                            continue;
                        }
                    }

                    if phase != HostPhase::Confirmed {
                        phase = HostPhase::Confirmed;
                        info!(%phase, candidate = %writer_key, "Candidate confirmed");
                    }
                    if fresh && admissions.send(Admission { writer_key: *writer_key }).await.is_err() {
                        debug!("Admission receiver dropped, stopping pairing listener");
                        break;
                    }
                }
                Some(TopicEvent::NeighborUp(peer)) => {
                    debug!(?peer, "Peer appeared on pairing topic");
                }
                Some(TopicEvent::NeighborDown(_)) => {}
                None => {
                    debug!("Pairing topic closed");
                    break;
                }
            }
        }
    }

    swarm.leave(&pairing_topic);
}

async fn candidate_task(
    swarm: Arc<Swarm>,
    invite: Invite,
    author: AuthorKeypair,
    sender: TopicSender,
    mut receiver: TopicReceiver,
    result: oneshot::Sender<HostAdmission>,
    cancel: CancellationToken,
) {
    let pairing_topic = invite.pairing_topic();
    let mut phase = CandidatePhase::AwaitingHost;
    let mut result = Some(result);

    // The first broadcast must not race mesh formation.
    tokio::select! {
        _ = cancel.cancelled() => {
            swarm.leave(&pairing_topic);
            return;
        }
        joined = receiver.joined() => {
            if let Err(e) = joined {
                warn!(invite = %invite, error = %e, "Could not reach pairing topic");
                swarm.leave(&pairing_topic);
                return;
            }
        }
    }

    let mut request = PairingMessage::Request {
        invite_id: invite.invite_id,
        writer_key: author.writer_key(),
        addr: NodeAddrBytes::from_endpoint_addr(&swarm.endpoint_addr()),
        signature: Vec::new(),
    };
    let request_bytes = match request.sign(&author).and_then(|_| request.encode()) {
        Ok(bytes) => bytes,
        Err(e) => {
            warn!(error = %e, "Failed to build pairing request");
            swarm.leave(&pairing_topic);
            return;
        }
    };

    info!(invite = %invite, %phase, "Requesting admission");
    if let Err(e) = sender.broadcast(request_bytes.clone()).await {
        warn!(error = %e, "Failed to send pairing request");
    }

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                debug!(invite = %invite, "Pairing cancelled");
                break;
            }
            event = receiver.recv_event() => match event {
                Some(TopicEvent::Message(msg)) => {
                    let message = match PairingMessage::decode(&msg.content) {
                        Ok(m) => m,
                        Err(e) => {
                            debug!(error = %e, "Ignoring undecodable pairing message");
                            continue;
                        }
                    };
                    let PairingMessage::Confirm {
                        invite_id,
                        host_key,
                        candidate_key,
                        topic,
                        room_name,
                        addr,
                        ..
                    } = &message else {
                        continue;
                    };
                    if *invite_id != invite.invite_id {
                        continue;
                    }
                    if *candidate_key != author.writer_key() {
                        debug!("Confirmation addressed to another candidate");
                        continue;
                    }
                    if *host_key != invite.host_key {
                        warn!(got = %host_key, "Confirmation from unexpected host key");
                        continue;
                    }
                    if let Err(e) = message.verify(host_key) {
                        warn!(error = %e, "Rejecting confirmation with bad signature");
                        continue;
                    }

                    if let Ok(endpoint_addr) = addr.to_endpoint_addr() {
                        swarm.add_peer_addr(endpoint_addr);
                    }

                    phase = CandidatePhase::Admitted;
                    info!(%phase, host = %host_key, "Admitted to room");
                    if let Some(tx) = result.take() {
                        let _ = tx.send(HostAdmission {
                            host_key: *host_key,
                            topic: Topic::from_bytes(*topic),
                            room_name: room_name.clone(),
                        });
                    }
                    break;
                }
                Some(TopicEvent::NeighborUp(peer)) => {
                    // The host may have joined after our first request.
                    debug!(?peer, "Neighbor up, re-sending pairing request");
                    if let Err(e) = sender.broadcast(request_bytes.clone()).await {
                        warn!(error = %e, "Failed to re-send pairing request");
                    }
                }
                Some(TopicEvent::NeighborDown(_)) => {}
                None => {
                    debug!("Pairing topic closed before admission");
                    break;
                }
            }
        }
    }

    swarm.leave(&pairing_topic);
}
