// Account - a balance of one unit, owned by one nym, held at one notary

use crate::identity::{AccountId, NotaryId, NymId, UnitId};
use crate::storage::StoreError;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors from account and box ledger operations
#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("Account not found: {0}")]
    AccountNotFound(AccountId),

    #[error("Insufficient funds: available {available}, required {required}")]
    InsufficientFunds { available: i64, required: i64 },

    #[error("Invalid amount: {0}")]
    InvalidAmount(i64),

    #[error("Balance would overflow")]
    BalanceOverflow,

    #[error("Box item {0} already present")]
    DuplicateItem(u64),

    #[error("Box item {0} not found")]
    ItemNotFound(u64),

    #[error("Accounts hold different units")]
    UnitMismatch,

    #[error("Ledger not locked: {0}")]
    LedgerNotLocked(String),

    #[error("Unit not found: {0}")]
    UnitNotFound(UnitId),

    #[error("Unit already registered: {0}")]
    UnitExists(UnitId),

    #[error("Storage failure: {0}")]
    Storage(String),
}

impl From<StoreError> for LedgerError {
    fn from(err: StoreError) -> Self {
        LedgerError::Storage(err.to_string())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum AccountType {
    /// Ordinary user account; never negative
    Simple,
    /// The issuer's account for a unit; goes negative as units circulate
    Issuer,
    /// Notary-owned float backing outstanding vouchers
    Voucher,
    /// Notary-owned reserve backing a basket component
    Reserve,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    id: AccountId,
    owner: NymId,
    notary: NotaryId,
    unit: UnitId,
    balance: i64,
    kind: AccountType,
}

impl Account {
    pub fn new(id: AccountId, owner: NymId, notary: NotaryId, unit: UnitId, kind: AccountType) -> Self {
        Self {
            id,
            owner,
            notary,
            unit,
            balance: 0,
            kind,
        }
    }

    pub fn id(&self) -> &AccountId {
        &self.id
    }

    pub fn owner(&self) -> &NymId {
        &self.owner
    }

    pub fn notary(&self) -> &NotaryId {
        &self.notary
    }

    pub fn unit(&self) -> &UnitId {
        &self.unit
    }

    pub fn balance(&self) -> i64 {
        self.balance
    }

    pub fn kind(&self) -> AccountType {
        self.kind
    }

    /// Only issuer accounts may hold a negative balance
    pub fn can_go_negative(&self) -> bool {
        self.kind == AccountType::Issuer
    }

    /// Check that `amount` could be debited right now
    pub fn can_debit(&self, amount: i64) -> Result<(), LedgerError> {
        if amount <= 0 {
            return Err(LedgerError::InvalidAmount(amount));
        }
        let after = self.balance.checked_sub(amount).ok_or(LedgerError::BalanceOverflow)?;
        if after < 0 && !self.can_go_negative() {
            return Err(LedgerError::InsufficientFunds {
                available: self.balance,
                required: amount,
            });
        }
        Ok(())
    }

    /// Remove funds, returning the new balance
    pub fn debit(&mut self, amount: i64) -> Result<i64, LedgerError> {
        self.can_debit(amount)?;
        self.balance -= amount;
        Ok(self.balance)
    }

    /// Add funds, returning the new balance
    pub fn credit(&mut self, amount: i64) -> Result<i64, LedgerError> {
        if amount <= 0 {
            return Err(LedgerError::InvalidAmount(amount));
        }
        self.balance = self
            .balance
            .checked_add(amount)
            .ok_or(LedgerError::BalanceOverflow)?;
        Ok(self.balance)
    }

    /// Serialize the account to bytes
    pub fn to_bytes(&self) -> Vec<u8> {
        postcard::to_allocvec(self).unwrap_or_default()
    }

    /// Deserialize an account from bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, LedgerError> {
        postcard::from_bytes(bytes).map_err(|e| LedgerError::Storage(e.to_string()))
    }
}
