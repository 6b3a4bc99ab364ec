use crate::identity::{KeypairError, PublicKey};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

const NYM_PREFIX: &str = "otx:nym:";

#[derive(Error, Debug)]
pub enum NymError {
    #[error("Invalid nym id format: {0}")]
    InvalidFormat(String),

    #[error("Invalid base58 encoding: {0}")]
    InvalidBase58(String),

    #[error("Invalid public key: {0}")]
    InvalidPublicKey(#[from] KeypairError),
}

/// Pseudonymous identity: `otx:nym:<base58_public_key>`
///
/// The id embeds the nym's signing key, so a notary can check a request
/// signature from the id alone.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NymId {
    key_part: String,
}

impl NymId {
    /// Create a nym id from a public key
    pub fn from_public_key(public_key: &PublicKey) -> Self {
        Self {
            key_part: bs58::encode(public_key.as_bytes()).into_string(),
        }
    }

    /// Parse a nym id from its string form
    pub fn parse(s: &str) -> Result<Self, NymError> {
        let key_part = s
            .strip_prefix(NYM_PREFIX)
            .ok_or_else(|| NymError::InvalidFormat(format!("expected '{}' prefix", NYM_PREFIX)))?;

        if key_part.is_empty() {
            return Err(NymError::InvalidFormat("key part cannot be empty".into()));
        }

        let bytes = bs58::decode(key_part)
            .into_vec()
            .map_err(|e| NymError::InvalidBase58(e.to_string()))?;
        PublicKey::from_bytes(&bytes)?;

        Ok(Self {
            key_part: key_part.to_string(),
        })
    }

    /// Extract the signing key of this nym
    pub fn public_key(&self) -> Result<PublicKey, NymError> {
        let bytes = bs58::decode(&self.key_part)
            .into_vec()
            .map_err(|e| NymError::InvalidBase58(e.to_string()))?;

        PublicKey::from_bytes(&bytes).map_err(NymError::InvalidPublicKey)
    }

    /// Raw bytes used when the nym appears in a storage key
    pub fn as_key(&self) -> &[u8] {
        self.key_part.as_bytes()
    }
}

impl fmt::Display for NymId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", NYM_PREFIX, self.key_part)
    }
}
