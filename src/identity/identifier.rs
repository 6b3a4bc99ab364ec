// Identifiers - 32-byte ids for notaries, accounts and units
//
// All three share one shape: a SHA-256 digest displayed as
// `otx:<kind>:<base58>`. Derivation is domain separated by kind.

use crate::identity::PublicKey;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum IdentifierError {
    #[error("Invalid identifier format: {0}")]
    InvalidFormat(String),

    #[error("Invalid base58 encoding: {0}")]
    InvalidBase58(String),
}

macro_rules! identifier {
    ($(#[$meta:meta])* $name:ident, $kind:literal) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        pub struct $name([u8; 32]);

        impl $name {
            pub const KIND: &'static str = $kind;

            /// Create from raw bytes
            pub fn from_bytes(bytes: [u8; 32]) -> Self {
                Self(bytes)
            }

            /// Get raw bytes
            pub fn as_bytes(&self) -> &[u8; 32] {
                &self.0
            }

            /// Random identifier
            pub fn generate() -> Self {
                use rand::RngCore;
                let mut bytes = [0u8; 32];
                rand::thread_rng().fill_bytes(&mut bytes);
                Self(bytes)
            }

            /// Derive an identifier from length-prefixed parts
            pub fn derive(parts: &[&[u8]]) -> Self {
                let mut hasher = Sha256::new();
                hasher.update(b"otx:");
                hasher.update($kind.as_bytes());
                for part in parts {
                    hasher.update((part.len() as u32).to_le_bytes());
                    hasher.update(part);
                }
                Self(hasher.finalize().into())
            }

            /// Parse `otx:<kind>:<base58>`
            pub fn parse(s: &str) -> Result<Self, IdentifierError> {
                let prefix = concat!("otx:", $kind, ":");
                let encoded = s.strip_prefix(prefix).ok_or_else(|| {
                    IdentifierError::InvalidFormat(format!("expected '{}' prefix", prefix))
                })?;
                let bytes = bs58::decode(encoded)
                    .into_vec()
                    .map_err(|e| IdentifierError::InvalidBase58(e.to_string()))?;
                let bytes: [u8; 32] = bytes.try_into().map_err(|_| {
                    IdentifierError::InvalidFormat("expected 32 bytes".to_string())
                })?;
                Ok(Self(bytes))
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "otx:{}:{}", $kind, bs58::encode(&self.0).into_string())
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), hex::encode(&self.0[..6]))
            }
        }
    };
}

identifier!(
    /// Identifies a notary (derived from the notary's signing key)
    NotaryId,
    "notary"
);
identifier!(
    /// Identifies an asset account held at a notary
    AccountId,
    "account"
);
identifier!(
    /// Identifies a unit (asset type) issued at a notary
    UnitId,
    "unit"
);

impl NotaryId {
    /// Notary id for a notary signing key
    pub fn for_key(key: &PublicKey) -> Self {
        Self::derive(&[key.as_bytes()])
    }
}
