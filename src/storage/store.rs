// Store - the load/store service every persisted record goes through
//
// Records:
// - consensus contexts, keyed by (local nym, remote nym)
// - accounts, box ledgers and unit definitions
// - cron items and the notary's own counters

use crate::identity::{AccountId, NymId, UnitId};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::Path;
use thiserror::Error;

/// Key layout
pub mod keys {
    use super::*;

    pub const CONTEXT_PREFIX: &[u8] = b"context:";
    pub const ACCOUNT_PREFIX: &[u8] = b"account:";
    pub const LEDGER_PREFIX: &[u8] = b"ledger:";
    pub const UNIT_PREFIX: &[u8] = b"unit:";
    pub const CRON_PREFIX: &[u8] = b"cron:";
    pub const NOTARY_STATE: &[u8] = b"notary:state";
    pub const NOTARY_KEYPAIR: &[u8] = b"notary:keypair";

    pub fn context(local: &NymId, remote: &NymId) -> Vec<u8> {
        [CONTEXT_PREFIX, local.as_key(), &b":"[..], remote.as_key()].concat()
    }

    pub fn account(id: &AccountId) -> Vec<u8> {
        [ACCOUNT_PREFIX, id.as_bytes().as_slice()].concat()
    }

    pub fn ledger(kind: &str, owner: &[u8]) -> Vec<u8> {
        [LEDGER_PREFIX, kind.as_bytes(), &b":"[..], owner].concat()
    }

    pub fn unit(id: &UnitId) -> Vec<u8> {
        [UNIT_PREFIX, id.as_bytes().as_slice()].concat()
    }

    pub fn cron(number: u64) -> Vec<u8> {
        [CRON_PREFIX, number.to_be_bytes().as_slice()].concat()
    }
}

/// Errors from storage operations
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Failed to open database: {0}")]
    OpenFailed(String),

    #[error("Database operation failed: {0}")]
    DatabaseError(String),

    #[error("Serialization failed: {0}")]
    SerializationFailed(String),

    #[error("Deserialization failed: {0}")]
    DeserializationFailed(String),

    #[error("Flush failed: {0}")]
    FlushFailed(String),
}

impl From<sled::Error> for StoreError {
    fn from(err: sled::Error) -> Self {
        StoreError::DatabaseError(err.to_string())
    }
}

/// Statistics about the storage
#[derive(Clone, Debug)]
pub struct StorageStats {
    /// Number of keys in the database
    pub key_count: usize,
    /// Approximate disk size in bytes
    pub disk_size_bytes: u64,
}

/// Opaque key-value persistence
pub trait Storage: Send + Sync {
    fn load(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError>;

    fn store(&self, key: &[u8], value: &[u8]) -> Result<(), StoreError>;

    fn remove(&self, key: &[u8]) -> Result<(), StoreError>;

    /// All keys starting with `prefix`, in key order
    fn keys_with_prefix(&self, prefix: &[u8]) -> Result<Vec<Vec<u8>>, StoreError>;

    fn flush(&self) -> Result<(), StoreError>;
}

impl dyn Storage {
    /// Load and decode a postcard record
    pub fn load_record<T: DeserializeOwned>(&self, key: &[u8]) -> Result<Option<T>, StoreError> {
        match self.load(key)? {
            Some(bytes) => postcard::from_bytes(&bytes)
                .map(Some)
                .map_err(|e| StoreError::DeserializationFailed(e.to_string())),
            None => Ok(None),
        }
    }

    /// Encode and store a postcard record
    pub fn store_record<T: Serialize>(&self, key: &[u8], value: &T) -> Result<(), StoreError> {
        let bytes = postcard::to_allocvec(value)
            .map_err(|e| StoreError::SerializationFailed(e.to_string()))?;
        self.store(key, &bytes)
    }
}

/// Persistent key-value store using sled
///
/// All writes are atomic per key and durable after flush.
pub struct SledStore {
    db: sled::Db,
}

impl SledStore {
    /// Open or create a store at the given path
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let db = sled::open(path).map_err(|e| StoreError::OpenFailed(e.to_string()))?;
        Ok(Self { db })
    }

    /// Store that lives only as long as the process
    pub fn temporary() -> Result<Self, StoreError> {
        let db = sled::Config::new()
            .temporary(true)
            .open()
            .map_err(|e| StoreError::OpenFailed(e.to_string()))?;
        Ok(Self { db })
    }

    /// Check if the store is empty
    pub fn is_empty(&self) -> bool {
        self.db.is_empty()
    }

    /// Get storage statistics
    pub fn stats(&self) -> StorageStats {
        StorageStats {
            key_count: self.db.len(),
            disk_size_bytes: self.db.size_on_disk().unwrap_or(0),
        }
    }
}

impl Storage for SledStore {
    fn load(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.db.get(key)?.map(|v| v.to_vec()))
    }

    fn store(&self, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
        self.db.insert(key, value)?;
        Ok(())
    }

    fn remove(&self, key: &[u8]) -> Result<(), StoreError> {
        self.db.remove(key)?;
        Ok(())
    }

    fn keys_with_prefix(&self, prefix: &[u8]) -> Result<Vec<Vec<u8>>, StoreError> {
        let mut keys = Vec::new();
        for result in self.db.scan_prefix(prefix) {
            let (key, _) = result?;
            keys.push(key.to_vec());
        }
        Ok(keys)
    }

    fn flush(&self) -> Result<(), StoreError> {
        self.db
            .flush()
            .map_err(|e| StoreError::FlushFailed(e.to_string()))?;
        Ok(())
    }
}
