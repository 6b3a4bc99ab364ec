// Arena - storage-backed records with one lock per entry
//
// Contexts, accounts and box ledgers are all reached through an arena.
// Locking an entry hands out an `Exclusive` guard that edits a private
// copy; nothing becomes visible (in memory or on disk) until `commit()`.
// Dropping a guard without committing discards the edit.

use crate::storage::{Storage, StoreError};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use tokio::sync::{Mutex, OwnedMutexGuard};

/// Anything an arena can hold
pub trait Record: Serialize + DeserializeOwned + Clone + Send + 'static {}

impl<T> Record for T where T: Serialize + DeserializeOwned + Clone + Send + 'static {}

struct Slot<T> {
    loaded: bool,
    value: Option<T>,
}

type SlotHandle<T> = Arc<Mutex<Slot<T>>>;
type Entries<T> = Arc<StdMutex<HashMap<Vec<u8>, SlotHandle<T>>>>;

/// A locked slot. The guard is released before the slot is considered for
/// removal, so an idle slot without a record does not outlive its last user.
struct Held<T> {
    guard: OwnedMutexGuard<Slot<T>>,
    release: Release<T>,
}

struct Release<T> {
    entries: Entries<T>,
    key: Vec<u8>,
}

impl<T> Drop for Release<T> {
    fn drop(&mut self) {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        // only the map holds the handle, so nobody is waiting on it
        let idle_and_empty = entries.get(&self.key).is_some_and(|handle| {
            Arc::strong_count(handle) == 1 && handle.try_lock().is_ok_and(|slot| slot.value.is_none())
        });
        if idle_and_empty {
            entries.remove(&self.key);
        }
    }
}

/// Map of persisted records keyed by their storage key
pub struct Arena<T> {
    storage: Arc<dyn Storage>,
    entries: Entries<T>,
}

impl<T: Record> Arena<T> {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self {
            storage,
            entries: Arc::new(StdMutex::new(HashMap::new())),
        }
    }

    /// Backing storage
    pub fn storage(&self) -> &Arc<dyn Storage> {
        &self.storage
    }

    async fn slot(&self, key: &[u8]) -> Result<Held<T>, StoreError> {
        let handle = {
            // the map only holds handles, a poisoned lock cannot leave it torn
            let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
            entries
                .entry(key.to_vec())
                .or_insert_with(|| {
                    Arc::new(Mutex::new(Slot {
                        loaded: false,
                        value: None,
                    }))
                })
                .clone()
        };
        let release = Release {
            entries: self.entries.clone(),
            key: key.to_vec(),
        };

        let mut guard = handle.lock_owned().await;
        if !guard.loaded {
            guard.value = self.storage.load_record(key)?;
            guard.loaded = true;
        }
        Ok(Held { guard, release })
    }

    fn exclusive(&self, held: Held<T>, working: T) -> Exclusive<T> {
        Exclusive {
            held,
            working,
            storage: self.storage.clone(),
            delete: false,
        }
    }

    /// Lock an existing record; `None` if nothing is stored under `key`
    pub async fn lock(&self, key: Vec<u8>) -> Result<Option<Exclusive<T>>, StoreError> {
        let held = self.slot(&key).await?;
        match held.guard.value.clone() {
            Some(working) => Ok(Some(self.exclusive(held, working))),
            None => Ok(None),
        }
    }

    /// Lock a record, creating it (uncommitted) if absent
    pub async fn lock_or_insert_with<F>(&self, key: Vec<u8>, create: F) -> Result<Exclusive<T>, StoreError>
    where
        F: FnOnce() -> T,
    {
        let held = self.slot(&key).await?;
        let working = held.guard.value.clone().unwrap_or_else(create);
        Ok(self.exclusive(held, working))
    }

    /// Consistent copy of a record (waits for any writer to finish)
    pub async fn snapshot(&self, key: &[u8]) -> Result<Option<T>, StoreError> {
        Ok(self.slot(key).await?.guard.value.clone())
    }

    /// Check whether a record exists
    pub async fn contains(&self, key: &[u8]) -> Result<bool, StoreError> {
        Ok(self.slot(key).await?.guard.value.is_some())
    }
}

/// Exclusive, copy-on-write access to one arena record
pub struct Exclusive<T> {
    held: Held<T>,
    working: T,
    storage: Arc<dyn Storage>,
    delete: bool,
}

impl<T: Record> Exclusive<T> {
    /// Storage key of the record
    pub fn key(&self) -> &[u8] {
        &self.held.release.key
    }

    /// Mark the record for removal on commit
    pub fn delete(&mut self) {
        self.delete = true;
    }

    /// Persist the working copy and publish it to other lockers
    pub fn commit(self) -> Result<(), StoreError> {
        let Exclusive {
            mut held,
            working,
            storage,
            delete,
        } = self;

        if delete {
            storage.remove(&held.release.key)?;
            held.guard.value = None;
        } else {
            storage.store_record(&held.release.key, &working)?;
            held.guard.value = Some(working);
        }
        Ok(())
    }
}

impl<T> Deref for Exclusive<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.working
    }
}

impl<T> DerefMut for Exclusive<T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.working
    }
}
