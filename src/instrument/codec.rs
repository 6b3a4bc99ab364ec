use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

/// Errors that can occur during encoding/decoding
#[derive(Error, Debug)]
pub enum CodecError {
    #[error("Failed to encode: {0}")]
    EncodeError(String),

    #[error("Failed to decode: {0}")]
    DecodeError(String),

    #[error("Invalid base64 string: {0}")]
    InvalidBase64(String),
}

/// Binary (postcard) and armored (URL-safe base64 of postcard) forms of
/// any serializable document
pub trait Armored: Sized {
    fn encode(&self) -> Result<Vec<u8>, CodecError>;

    fn decode(bytes: &[u8]) -> Result<Self, CodecError>;

    fn to_armored(&self) -> Result<String, CodecError> {
        Ok(URL_SAFE_NO_PAD.encode(self.encode()?))
    }

    fn from_armored(text: &str) -> Result<Self, CodecError> {
        let bytes = URL_SAFE_NO_PAD
            .decode(text.trim())
            .map_err(|e| CodecError::InvalidBase64(e.to_string()))?;
        Self::decode(&bytes)
    }
}

impl<T: Serialize + DeserializeOwned> Armored for T {
    fn encode(&self) -> Result<Vec<u8>, CodecError> {
        postcard::to_allocvec(self).map_err(|e| CodecError::EncodeError(e.to_string()))
    }

    fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        postcard::from_bytes(bytes).map_err(|e| CodecError::DecodeError(e.to_string()))
    }
}
