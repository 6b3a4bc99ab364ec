use crate::consensus::ConsensusError;
use crate::cron::CronError;
use crate::instrument::TransactionFailure;
use crate::ledger::LedgerError;
use crate::storage::StoreError;
use thiserror::Error;

/// Errors that stop the notary from answering normally
#[derive(Error, Debug)]
pub enum NotaryError {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Invalid notary key: {0}")]
    InvalidKey(String),

    #[error("Storage error: {0}")]
    Storage(#[from] StoreError),

    #[error("Consensus error: {0}")]
    Consensus(#[from] ConsensusError),

    #[error("Ledger error: {0}")]
    Ledger(#[from] LedgerError),

    #[error("Cron error: {0}")]
    Cron(#[from] CronError),

    #[error("Request rejected: {0}")]
    Rejected(String),
}

impl From<NotaryError> for TransactionFailure {
    fn from(err: NotaryError) -> Self {
        match err {
            NotaryError::Ledger(err) => err.into(),
            NotaryError::Consensus(err) => err.into(),
            other => TransactionFailure::CorruptedState(other.to_string()),
        }
    }
}

/// Configuration for the notary
#[derive(Clone, Debug)]
pub struct NotaryConfig {
    /// Numbers handed out per `getTransactionNumbers`
    pub numbers_per_batch: u32,
    /// Cap on issued plus offered numbers per nym
    pub max_outstanding_numbers: usize,
    /// Seconds between cron ticks when run on a timer
    pub cron_interval_secs: u64,
    /// Cap on active cron items involving one nym
    pub max_cron_items_per_nym: usize,
    /// Seconds a voucher stays valid
    pub voucher_validity_secs: i64,
}

impl NotaryConfig {
    /// Create a new config with builder pattern
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_numbers_per_batch(mut self, count: u32) -> Self {
        self.numbers_per_batch = count;
        self
    }

    pub fn with_max_outstanding_numbers(mut self, count: usize) -> Self {
        self.max_outstanding_numbers = count;
        self
    }

    pub fn with_cron_interval_secs(mut self, secs: u64) -> Self {
        self.cron_interval_secs = secs;
        self
    }

    pub fn with_max_cron_items_per_nym(mut self, count: usize) -> Self {
        self.max_cron_items_per_nym = count;
        self
    }

    pub fn with_voucher_validity_secs(mut self, secs: i64) -> Self {
        self.voucher_validity_secs = secs;
        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), NotaryError> {
        if self.numbers_per_batch == 0 {
            return Err(NotaryError::InvalidConfig("numbers_per_batch must be > 0".to_string()));
        }
        if self.max_outstanding_numbers < self.numbers_per_batch as usize {
            return Err(NotaryError::InvalidConfig(
                "max_outstanding_numbers must be >= numbers_per_batch".to_string(),
            ));
        }
        if self.cron_interval_secs == 0 {
            return Err(NotaryError::InvalidConfig("cron_interval_secs must be > 0".to_string()));
        }
        if self.voucher_validity_secs <= 0 {
            return Err(NotaryError::InvalidConfig("voucher_validity_secs must be > 0".to_string()));
        }
        Ok(())
    }
}

impl Default for NotaryConfig {
    fn default() -> Self {
        Self {
            numbers_per_batch: 20,
            max_outstanding_numbers: 400,
            cron_interval_secs: 10,
            max_cron_items_per_nym: 50,
            voucher_validity_secs: 180 * 24 * 60 * 60,
        }
    }
}
