// Signatures - Ed25519 signing plus the generic `Signed<T>` envelope every
// instrument, receipt and protocol message travels in

use crate::identity::{Keypair, PublicKey};
use ed25519_dalek::{Signature as DalekSignature, Signer as DalekSigner, Verifier};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SignatureError {
    #[error("Invalid signature length: expected 64, got {0}")]
    InvalidLength(usize),
}

/// Ed25519 signature (64 bytes)
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Signature([u8; 64]);

impl Signature {
    /// Get the raw bytes of the signature
    pub fn as_bytes(&self) -> &[u8; 64] {
        &self.0
    }

    /// Create a signature from raw bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, SignatureError> {
        let bytes: [u8; 64] = bytes
            .try_into()
            .map_err(|_| SignatureError::InvalidLength(bytes.len()))?;
        Ok(Self(bytes))
    }
}

impl Serialize for Signature {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_bytes(&self.0)
    }
}

impl<'de> Deserialize<'de> for Signature {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        use serde::de::{self, Visitor};

        struct SignatureVisitor;

        impl<'de> Visitor<'de> for SignatureVisitor {
            type Value = Signature;

            fn expecting(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
                formatter.write_str("64 bytes for Ed25519 signature")
            }

            fn visit_bytes<E>(self, v: &[u8]) -> Result<Self::Value, E>
            where
                E: de::Error,
            {
                Signature::from_bytes(v).map_err(|e| E::custom(e.to_string()))
            }

            fn visit_seq<A>(self, mut seq: A) -> Result<Self::Value, A::Error>
            where
                A: de::SeqAccess<'de>,
            {
                let mut bytes = Vec::with_capacity(64);
                while let Some(byte) = seq.next_element()? {
                    bytes.push(byte);
                }
                Signature::from_bytes(&bytes).map_err(|e| de::Error::custom(e.to_string()))
            }
        }

        deserializer.deserialize_bytes(SignatureVisitor)
    }
}

/// Signing and verification operations
pub struct Signer;

impl Signer {
    /// Sign a message with a keypair
    pub fn sign(keypair: &Keypair, message: &[u8]) -> Signature {
        Signature(keypair.signing_key().sign(message).to_bytes())
    }

    /// Verify a signature against a public key and message
    pub fn verify(public_key: &PublicKey, message: &[u8], signature: &Signature) -> bool {
        let Some(key) = public_key.verifying_key() else {
            return false;
        };
        key.verify(message, &DalekSignature::from_bytes(&signature.0)).is_ok()
    }
}

/// A serializable body that can be signed.
///
/// The domain tag is prepended to the postcard encoding so that a signature
/// over one document type can never be replayed as another.
pub trait Document: Serialize {
    const DOMAIN: &'static [u8];

    fn signing_bytes(&self) -> Vec<u8> {
        let mut bytes = Self::DOMAIN.to_vec();
        bytes.extend(postcard::to_allocvec(self).unwrap_or_default());
        bytes
    }
}

/// A document together with its signer and signature
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signed<T> {
    body: T,
    signer: PublicKey,
    signature: Signature,
}

impl<T: Document> Signed<T> {
    /// Sign a document
    pub fn sign(body: T, keypair: &Keypair) -> Self {
        let signature = Signer::sign(keypair, &body.signing_bytes());
        Self {
            body,
            signer: keypair.public_key(),
            signature,
        }
    }

    /// Get the signed document
    pub fn body(&self) -> &T {
        &self.body
    }

    /// Consume the envelope, returning the document
    pub fn into_body(self) -> T {
        self.body
    }

    /// Public key that produced the signature
    pub fn signer(&self) -> &PublicKey {
        &self.signer
    }

    pub fn signature(&self) -> &Signature {
        &self.signature
    }

    /// Verify the signature against the embedded signer
    pub fn verify(&self) -> bool {
        Signer::verify(&self.signer, &self.body.signing_bytes(), &self.signature)
    }

    /// Verify that `expected` signed this document
    pub fn verify_with(&self, expected: &PublicKey) -> bool {
        &self.signer == expected && self.verify()
    }
}
