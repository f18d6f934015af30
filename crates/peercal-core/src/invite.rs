//! Invite codec for out-of-band room sharing
//!
//! Hosts mint an [`Invite`] when a room becomes ready and hand the encoded
//! token to a future member over any side channel (chat, QR code, sticky
//! note). The token carries everything a candidate needs to reach the host:
//! the host's writer key, its network address for bootstrap, and a random
//! invite id both sides hash into a rendezvous topic for the pairing
//! handshake. The room's own topic is never in the invite; it travels in
//! the host's confirmation once the candidate is admitted.
//!
//! Tokens look like `cal-invite:nbswy3dpeb3w64tmmq...`: a fixed prefix plus
//! unpadded base32 of the postcard-encoded invite, lowercased so the token
//! survives chat clients and case-mangling clipboards.

use std::fmt;

use data_encoding::BASE32_NOPAD;
use iroh::{EndpointAddr, RelayUrl};
use iroh_gossip::proto::TopicId;
use serde::{Deserialize, Serialize};

use crate::error::{RoomError, RoomResult};
use crate::identity::WriterKey;

/// Prefix for encoded invite tokens
pub const INVITE_PREFIX: &str = "cal-invite:";

/// Current invite format version
pub const INVITE_VERSION: u8 = 1;

/// Domain separator for the pairing rendezvous topic
const PAIRING_TOPIC_CONTEXT: &[u8] = b"peercal-pairing-topic-v1";

/// Serializable network address of an endpoint
///
/// [`EndpointAddr`] itself is not serde-friendly, so invites and wire
/// messages carry this flattened form and convert at the edges.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeAddrBytes {
    /// Ed25519 public key of the endpoint
    pub endpoint_id: [u8; 32],
    /// Relay URL for hole-punching, if known
    pub relay_url: Option<String>,
    /// Direct socket addresses as strings
    pub direct_addresses: Vec<String>,
}

impl NodeAddrBytes {
    /// Capture an endpoint address in serializable form
    pub fn from_endpoint_addr(addr: &EndpointAddr) -> Self {
        Self {
            endpoint_id: *addr.id.as_bytes(),
            relay_url: addr.relay_urls().next().map(|u| u.to_string()),
            direct_addresses: addr.ip_addrs().map(|a| a.to_string()).collect(),
        }
    }

    /// Rebuild the endpoint address for dialing
    pub fn to_endpoint_addr(&self) -> RoomResult<EndpointAddr> {
        let public_key = iroh::PublicKey::from_bytes(&self.endpoint_id)
            .map_err(|e| RoomError::Network(format!("Invalid endpoint id: {}", e)))?;

        let mut addr = EndpointAddr::new(public_key);

        if let Some(ref url) = self.relay_url {
            let relay: RelayUrl = url
                .parse()
                .map_err(|e| RoomError::Network(format!("Invalid relay URL: {}", e)))?;
            addr = addr.with_relay_url(relay);
        }

        for s in &self.direct_addresses {
            let socket = s
                .parse()
                .map_err(|e| RoomError::Network(format!("Invalid socket address: {}", e)))?;
            addr = addr.with_ip_addr(socket);
        }

        Ok(addr)
    }
}

/// Out-of-band invite to a calendar room
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Invite {
    /// Invite format version
    pub version: u8,
    /// Random id distinguishing invites, mixed into the pairing topic
    pub invite_id: [u8; 16],
    /// Writer key of the inviting room instance
    pub host_key: WriterKey,
    /// Network address of the host for gossip bootstrap
    pub host_addr: NodeAddrBytes,
    /// Room name hint shown to the candidate before admission
    pub room_name: Option<String>,
    /// Unix timestamp after which the invite is refused, None means no expiry
    pub expires_at: Option<i64>,
}

impl Invite {
    pub fn new(host_key: WriterKey, host_addr: NodeAddrBytes) -> Self {
        Self {
            version: INVITE_VERSION,
            invite_id: rand::random(),
            host_key,
            host_addr,
            room_name: None,
            expires_at: None,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.room_name = Some(name.into());
        self
    }

    pub fn with_expiry(mut self, expires_at: i64) -> Self {
        self.expires_at = Some(expires_at);
        self
    }

    /// Whether the invite's expiry has passed
    pub fn is_expired(&self) -> bool {
        match self.expires_at {
            Some(t) => chrono::Utc::now().timestamp() > t,
            None => false,
        }
    }

    /// Encode as a copy-pasteable token
    pub fn encode(&self) -> RoomResult<String> {
        let bytes = postcard::to_stdvec(self)
            .map_err(|e| RoomError::Serialization(format!("Failed to encode invite: {}", e)))?;
        let encoded = BASE32_NOPAD.encode(&bytes).to_ascii_lowercase();
        Ok(format!("{}{}", INVITE_PREFIX, encoded))
    }

    /// Decode a token produced by [`Invite::encode`]
    ///
    /// # Errors
    ///
    /// Returns [`RoomError::InvalidInvite`] for a missing prefix, bad
    /// base32, undecodable payload, or unsupported version.
    pub fn decode(token: &str) -> RoomResult<Self> {
        let token = token.trim();
        let payload = token.strip_prefix(INVITE_PREFIX).ok_or_else(|| {
            let head: String = token.chars().take(15).collect();
            RoomError::InvalidInvite(format!("Missing {} prefix: {}", INVITE_PREFIX, head))
        })?;

        let bytes = BASE32_NOPAD
            .decode(payload.to_ascii_uppercase().as_bytes())
            .map_err(|e| RoomError::InvalidInvite(format!("Invalid base32: {}", e)))?;

        let invite: Invite = postcard::from_bytes(&bytes)
            .map_err(|e| RoomError::InvalidInvite(format!("Invalid invite data: {}", e)))?;

        if invite.version != INVITE_VERSION {
            return Err(RoomError::InvalidInvite(format!(
                "Unsupported invite version {}",
                invite.version
            )));
        }

        Ok(invite)
    }

    /// Rendezvous topic for the pairing handshake
    ///
    /// Both sides derive the same topic from the invite alone, so the
    /// handshake needs no prior coordination beyond the token itself.
    pub fn pairing_topic(&self) -> TopicId {
        let mut hasher = blake3::Hasher::new();
        hasher.update(PAIRING_TOPIC_CONTEXT);
        hasher.update(&self.invite_id);
        hasher.update(self.host_key.as_bytes());
        TopicId::from_bytes(*hasher.finalize().as_bytes())
    }

    /// The host's endpoint address for dialing
    pub fn host_endpoint(&self) -> RoomResult<EndpointAddr> {
        self.host_addr.to_endpoint_addr()
    }
}

impl fmt::Display for Invite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invite_{}", hex::encode(&self.invite_id[..4]))
    }
}
