//! Gossip swarm plumbing over iroh
//!
//! One [`Swarm`] per node: it owns the iroh endpoint, the gossip protocol
//! handler, and the static discovery provider that invite and pairing
//! flows feed out-of-band peer addresses into. Rooms join and leave
//! per-room topics on top of it.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use iroh::discovery::static_provider::StaticProvider;
use iroh::protocol::Router;
use iroh::{Endpoint, EndpointAddr, PublicKey, SecretKey};
use iroh_gossip::net::{Gossip, GOSSIP_ALPN};
use iroh_gossip::proto::TopicId;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::{RoomError, RoomResult};

/// Gossip payload ceiling. Entry batches can carry JSON schedule bodies,
/// so this is well above the 4KB protocol default.
const MAX_MESSAGE_SIZE: usize = 1024 * 1024;

/// Message received from a gossip topic
#[derive(Debug, Clone)]
pub struct GossipMessage {
    /// The sender's public key
    pub from: PublicKey,
    /// The raw message content
    pub content: Vec<u8>,
}

/// Event from a gossip topic (message or neighbor change)
#[derive(Debug)]
pub enum TopicEvent {
    /// A message was received from a peer
    Message(GossipMessage),
    /// A neighbor joined the topic
    NeighborUp(PublicKey),
    /// A neighbor left the topic
    NeighborDown(PublicKey),
}

/// Sending half of a topic subscription
///
/// Cloneable and shareable across tasks.
#[derive(Clone)]
pub struct TopicSender {
    sender: Arc<Mutex<iroh_gossip::api::GossipSender>>,
    topic_id: TopicId,
}

impl TopicSender {
    /// Broadcast a message to all peers on this topic
    pub async fn broadcast(&self, msg: impl Into<Vec<u8>>) -> RoomResult<()> {
        let data: Vec<u8> = msg.into();
        debug!(topic = ?self.topic_id, len = data.len(), "Broadcasting message");

        self.sender
            .lock()
            .await
            .broadcast(data.into())
            .await
            .map_err(|e| RoomError::Gossip(format!("Failed to broadcast: {}", e)))?;

        Ok(())
    }

    pub fn topic_id(&self) -> TopicId {
        self.topic_id
    }
}

/// Receiving half of a topic subscription
///
/// Poll from a single task; do not wrap in Arc<Mutex<...>>.
pub struct TopicReceiver {
    receiver: iroh_gossip::api::GossipReceiver,
    topic_id: TopicId,
}

impl TopicReceiver {
    /// Receive the next event from the topic
    ///
    /// Returns None once the subscription is closed.
    pub async fn recv_event(&mut self) -> Option<TopicEvent> {
        use iroh_gossip::api::Event;
        use n0_future::StreamExt;

        loop {
            match self.receiver.try_next().await {
                Ok(Some(event)) => match event {
                    Event::Received(msg) => {
                        debug!(topic = ?self.topic_id, from = ?msg.delivered_from, "Received message");
                        return Some(TopicEvent::Message(GossipMessage {
                            from: msg.delivered_from,
                            content: msg.content.to_vec(),
                        }));
                    }
                    Event::NeighborUp(peer) => {
                        info!(topic = ?self.topic_id, ?peer, "Neighbor joined");
                        return Some(TopicEvent::NeighborUp(peer));
                    }
                    Event::NeighborDown(peer) => {
                        info!(topic = ?self.topic_id, ?peer, "Neighbor left");
                        return Some(TopicEvent::NeighborDown(peer));
                    }
                    Event::Lagged => {
                        warn!(topic = ?self.topic_id, "Lagged behind on topic");
                        // Keep polling for real events
                    }
                },
                Ok(None) => {
                    debug!(topic = ?self.topic_id, "Topic subscription closed");
                    return None;
                }
                Err(e) => {
                    warn!(topic = ?self.topic_id, error = ?e, "Error receiving from topic");
                    return None;
                }
            }
        }
    }

    /// Whether we are connected to at least one peer on this topic
    pub fn is_joined(&self) -> bool {
        self.receiver.is_joined()
    }

    /// Wait until the gossip mesh for this topic has formed
    ///
    /// Broadcasts before this resolves can vanish into an empty mesh, so
    /// handshake flows wait here before their first send.
    pub async fn joined(&mut self) -> RoomResult<()> {
        self.receiver
            .joined()
            .await
            .map_err(|e| RoomError::Gossip(format!("Failed to join topic swarm: {}", e)))
    }

    pub fn topic_id(&self) -> TopicId {
        self.topic_id
    }
}

/// Node-wide gossip networking
#[derive(Debug)]
pub struct Swarm {
    endpoint: Endpoint,
    gossip: Gossip,
    router: Router,
    /// Static discovery provider for out-of-band peer addresses
    static_provider: StaticProvider,
    /// Topics currently subscribed, for diagnostics and leave bookkeeping
    topics: parking_lot::Mutex<HashSet<TopicId>>,
    closed: AtomicBool,
    #[allow(dead_code)]
    secret_key: SecretKey,
}

impl Swarm {
    /// Bind with a fresh random endpoint identity
    pub async fn bind() -> RoomResult<Self> {
        Self::with_secret_key(None).await
    }

    /// Bind the endpoint, optionally with a persistent secret key
    pub async fn with_secret_key(secret_key: Option<SecretKey>) -> RoomResult<Self> {
        let secret_key = secret_key.unwrap_or_else(|| SecretKey::generate(&mut rand::rng()));

        let static_provider = StaticProvider::new();

        let endpoint = Endpoint::builder()
            .secret_key(secret_key.clone())
            .alpns(vec![GOSSIP_ALPN.to_vec()])
            .discovery(static_provider.clone())
            .bind()
            .await
            .map_err(|e| RoomError::Network(format!("Failed to bind endpoint: {}", e)))?;

        let endpoint_id = endpoint.id();
        info!(%endpoint_id, "Endpoint bound");

        let gossip = Gossip::builder()
            .max_message_size(MAX_MESSAGE_SIZE)
            .spawn(endpoint.clone());

        let router = Router::builder(endpoint.clone())
            .accept(GOSSIP_ALPN, gossip.clone())
            .spawn();

        Ok(Self {
            endpoint,
            gossip,
            router,
            static_provider,
            topics: parking_lot::Mutex::new(HashSet::new()),
            closed: AtomicBool::new(false),
            secret_key,
        })
    }

    /// This node's endpoint id, the identifier peers dial
    pub fn endpoint_id(&self) -> iroh::EndpointId {
        self.endpoint.id()
    }

    /// Reference to the underlying endpoint
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// This node's full addressing info for sharing with peers
    pub fn endpoint_addr(&self) -> EndpointAddr {
        self.endpoint.addr()
    }

    /// Feed a peer's address into static discovery
    ///
    /// Connection attempts to that peer then skip DNS discovery entirely.
    pub fn add_peer_addr(&self, endpoint_addr: EndpointAddr) {
        debug!(
            peer = %endpoint_addr.id,
            addrs = endpoint_addr.addrs.len(),
            "Adding peer address to static discovery"
        );
        self.static_provider.add_endpoint_info(endpoint_addr);
    }

    /// Subscribe to a topic, returning split sender and receiver halves
    ///
    /// The receiver must be polled by a single task. `bootstrap_peers` may
    /// be empty for the first node on a topic.
    pub async fn join(
        &self,
        topic_id: TopicId,
        bootstrap_peers: Vec<iroh::EndpointId>,
    ) -> RoomResult<(TopicSender, TopicReceiver)> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(RoomError::Gossip("Swarm is shut down".to_string()));
        }
        info!(?topic_id, peer_count = bootstrap_peers.len(), "Joining topic");

        let gossip_topic = self
            .gossip
            .subscribe(topic_id, bootstrap_peers)
            .await
            .map_err(|e| RoomError::Gossip(format!("Failed to subscribe: {}", e)))?;

        let (sender, receiver) = gossip_topic.split();
        self.topics.lock().insert(topic_id);

        Ok((
            TopicSender {
                sender: Arc::new(Mutex::new(sender)),
                topic_id,
            },
            TopicReceiver { receiver, topic_id },
        ))
    }

    /// Record that a topic's handles were dropped
    ///
    /// The subscription itself ends when its sender and receiver are
    /// dropped; this clears the bookkeeping entry.
    pub fn leave(&self, topic_id: &TopicId) {
        if self.topics.lock().remove(topic_id) {
            info!(?topic_id, "Left topic");
        }
    }

    /// Topics currently subscribed
    pub fn active_topics(&self) -> Vec<TopicId> {
        self.topics.lock().iter().copied().collect()
    }

    /// Shut down the router and close the endpoint
    ///
    /// Safe to call more than once; later calls are no-ops.
    pub async fn shutdown(&self) -> RoomResult<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        info!("Shutting down swarm");

        if let Err(e) = self.router.shutdown().await {
            warn!(error = ?e, "Failed to shutdown router cleanly");
        }

        self.endpoint.close().await;
        info!("Swarm shutdown complete");

        Ok(())
    }
}
