//! Per-room author identities
//!
//! Every room instance appends under its own Ed25519 keypair. The public
//! half is the [`WriterKey`] other members admit into the room's writer
//! set; the seed is persisted per room so an instance keeps its identity
//! across restarts.

use std::fmt;

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use serde::{Deserialize, Serialize};

use crate::error::{RoomError, RoomResult};

/// Public key identifying one writer in a room
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WriterKey(pub [u8; 32]);

impl WriterKey {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Base58 encoding of the full key
    pub fn to_base58(&self) -> String {
        bs58::encode(&self.0).into_string()
    }

    /// Parse from a base58 string
    pub fn from_base58(s: &str) -> RoomResult<Self> {
        let bytes = bs58::decode(s)
            .into_vec()
            .map_err(|e| RoomError::Serialization(format!("Invalid base58 key: {}", e)))?;
        if bytes.len() != 32 {
            return Err(RoomError::Serialization(format!(
                "Writer key must be 32 bytes, got {}",
                bytes.len()
            )));
        }
        let mut arr = [0u8; 32];
        arr.copy_from_slice(&bytes);
        Ok(Self(arr))
    }
}

impl fmt::Display for WriterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "writer_{}", bs58::encode(&self.0[..8]).into_string())
    }
}

/// Ed25519 signing identity for the local author of a room
pub struct AuthorKeypair {
    signing: SigningKey,
}

impl AuthorKeypair {
    /// Generate a new random keypair
    pub fn generate() -> Self {
        let mut seed = [0u8; 32];
        getrandom::getrandom(&mut seed).expect("Failed to get random bytes");
        Self {
            signing: SigningKey::from_bytes(&seed),
        }
    }

    /// Restore a keypair from a stored seed
    pub fn from_seed(seed: &[u8; 32]) -> Self {
        Self {
            signing: SigningKey::from_bytes(seed),
        }
    }

    /// The seed bytes for persistence
    pub fn to_seed(&self) -> [u8; 32] {
        self.signing.to_bytes()
    }

    /// The public writer key for this author
    pub fn writer_key(&self) -> WriterKey {
        WriterKey(self.signing.verifying_key().to_bytes())
    }

    /// Sign a message, returning the 64-byte signature
    pub fn sign(&self, message: &[u8]) -> Vec<u8> {
        self.signing.sign(message).to_bytes().to_vec()
    }
}

impl Clone for AuthorKeypair {
    fn clone(&self) -> Self {
        Self::from_seed(&self.signing.to_bytes())
    }
}

impl fmt::Debug for AuthorKeypair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthorKeypair")
            .field("writer_key", &self.writer_key())
            .finish()
    }
}

/// Verify an Ed25519 signature against a writer key
pub fn verify_signature(key: &WriterKey, message: &[u8], signature: &[u8]) -> RoomResult<()> {
    let verifying = VerifyingKey::from_bytes(&key.0)
        .map_err(|e| RoomError::SignatureInvalid(format!("Bad writer key: {}", e)))?;
    let signature = Signature::from_slice(signature)
        .map_err(|e| RoomError::SignatureInvalid(format!("Bad signature bytes: {}", e)))?;
    verifying
        .verify(message, &signature)
        .map_err(|e| RoomError::SignatureInvalid(format!("Verification failed: {}", e)))
}
