// Keys - Ed25519 keypairs held by nyms and by the notary itself

use ed25519_dalek::{SigningKey, VerifyingKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum KeypairError {
    #[error("Invalid key length: expected {expected}, got {got}")]
    InvalidLength { expected: usize, got: usize },

    #[error("Invalid key bytes: {0}")]
    InvalidBytes(String),
}

/// Ed25519 public key (32 bytes)
///
/// Stored as raw bytes so it can be hashed, ordered and used as a map key.
/// The curve point is only decoded when a signature is checked.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PublicKey([u8; 32]);

impl PublicKey {
    /// Get the raw bytes of the public key
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Create a public key from raw bytes, rejecting points off the curve
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, KeypairError> {
        let bytes: [u8; 32] = bytes.try_into().map_err(|_| KeypairError::InvalidLength {
            expected: 32,
            got: bytes.len(),
        })?;

        VerifyingKey::from_bytes(&bytes).map_err(|e| KeypairError::InvalidBytes(e.to_string()))?;
        Ok(Self(bytes))
    }

    pub(crate) fn verifying_key(&self) -> Option<VerifyingKey> {
        VerifyingKey::from_bytes(&self.0).ok()
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({})", hex::encode(&self.0[..8]))
    }
}

/// Ed25519 signing keypair
#[derive(Clone)]
pub struct Keypair {
    signing_key: SigningKey,
}

impl Keypair {
    /// Generate a new random keypair
    pub fn generate() -> Self {
        Self {
            signing_key: SigningKey::generate(&mut OsRng),
        }
    }

    /// Deterministic keypair from a 32-byte seed
    pub fn from_seed(seed: &[u8; 32]) -> Self {
        Self {
            signing_key: SigningKey::from_bytes(seed),
        }
    }

    /// Get the public key
    pub fn public_key(&self) -> PublicKey {
        PublicKey(self.signing_key.verifying_key().to_bytes())
    }

    /// Serialize the keypair to bytes (secret seed)
    pub fn to_bytes(&self) -> Vec<u8> {
        self.signing_key.to_bytes().to_vec()
    }

    /// Deserialize a keypair from its secret seed
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, KeypairError> {
        let seed: [u8; 32] = bytes.try_into().map_err(|_| KeypairError::InvalidLength {
            expected: 32,
            got: bytes.len(),
        })?;
        Ok(Self::from_seed(&seed))
    }

    pub(crate) fn signing_key(&self) -> &SigningKey {
        &self.signing_key
    }
}

impl fmt::Debug for Keypair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Keypair")
            .field("public_key", &self.public_key())
            .finish_non_exhaustive()
    }
}
