// Storage module - PERSISTENCE
// Opaque load/store key-value service backed by sled, plus the
// lock-per-entry record arena the notary works through

mod arena;
mod store;

pub use arena::{Arena, Exclusive, Record};
pub use store::{keys, SledStore, Storage, StorageStats, StoreError};
