// Cron queue - active cron items, persisted under `cron:<number>`
//
// The map lock is only ever held for a lookup or an update, never across
// an await, so ticks and live notarization can share the queue while
// holding their own context and account locks.

use crate::consensus::TransactionNumber;
use crate::cron::CronItem;
use crate::identity::{NymId, UnitId};
use crate::storage::{keys, Storage, StoreError};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use thiserror::Error;
use tracing::debug;

#[derive(Error, Debug)]
pub enum CronError {
    #[error("Cron item {0} already queued")]
    Duplicate(TransactionNumber),

    #[error("Cron item {0} not found")]
    NotFound(TransactionNumber),

    #[error("Storage failure: {0}")]
    Storage(String),
}

impl From<StoreError> for CronError {
    fn from(err: StoreError) -> Self {
        CronError::Storage(err.to_string())
    }
}

pub struct CronQueue {
    storage: Arc<dyn Storage>,
    items: Mutex<BTreeMap<TransactionNumber, CronItem>>,
}

impl CronQueue {
    /// Load every persisted item
    pub fn load(storage: Arc<dyn Storage>) -> Result<Self, CronError> {
        let mut items = BTreeMap::new();
        for key in storage.keys_with_prefix(keys::CRON_PREFIX)? {
            if let Some(item) = storage.load_record::<CronItem>(&key)? {
                items.insert(item.number(), item);
            }
        }
        debug!(items = items.len(), "loaded cron queue");
        Ok(Self {
            storage,
            items: Mutex::new(items),
        })
    }

    fn items(&self) -> MutexGuard<'_, BTreeMap<TransactionNumber, CronItem>> {
        // a poisoned map still holds whole items
        self.items.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn insert(&self, item: CronItem) -> Result<(), CronError> {
        let mut items = self.items();
        if items.contains_key(&item.number()) {
            return Err(CronError::Duplicate(item.number()));
        }
        self.storage.store_record(&keys::cron(item.number()), &item)?;
        items.insert(item.number(), item);
        Ok(())
    }

    pub fn get(&self, number: TransactionNumber) -> Option<CronItem> {
        self.items().get(&number).cloned()
    }

    /// Write back a processed item; `false` if it was removed meanwhile
    pub fn update(&self, item: CronItem) -> Result<bool, CronError> {
        let mut items = self.items();
        match items.get_mut(&item.number()) {
            Some(slot) => {
                self.storage.store_record(&keys::cron(item.number()), &item)?;
                *slot = item;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub fn remove(&self, number: TransactionNumber) -> Result<CronItem, CronError> {
        let mut items = self.items();
        let item = items.remove(&number).ok_or(CronError::NotFound(number))?;
        self.storage.remove(&keys::cron(number))?;
        Ok(item)
    }

    /// Item numbers in activation order
    pub fn numbers(&self) -> Vec<TransactionNumber> {
        self.items().keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.items().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items().is_empty()
    }

    /// Active items that involve `nym`
    pub fn count_for(&self, nym: &NymId) -> usize {
        self.items().values().filter(|item| item.involves(nym)).count()
    }

    /// Active offers in one market, oldest first
    pub fn offers_in(&self, market: (UnitId, UnitId, i64)) -> Vec<CronItem> {
        self.items()
            .values()
            .filter(|item| item.market() == Some(market))
            .cloned()
            .collect()
    }
}
