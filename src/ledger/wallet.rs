// Wallet - the account, box ledger and unit store the notary works through
//
// Accounts and ledgers are each an arena with one lock per record. The
// notary never touches raw storage; it asks the wallet for an exclusive
// accessor, edits it, and commits.

use crate::identity::{AccountId, NotaryId, NymId, UnitId};
use crate::ledger::{Account, AccountType, BoxKind, Ledger, LedgerError, LedgerOwner, UnitDefinition};
use crate::storage::{keys, Arena, Exclusive, Storage};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::debug;

/// Exclusive access to one account
pub type AccountGuard = Exclusive<Account>;

/// Exclusive access to one box ledger
pub type LedgerGuard = Exclusive<Ledger>;

pub struct Wallet {
    accounts: Arena<Account>,
    ledgers: Arena<Ledger>,
    units: Arena<UnitDefinition>,
}

impl Wallet {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self {
            accounts: Arena::new(storage.clone()),
            ledgers: Arena::new(storage.clone()),
            units: Arena::new(storage),
        }
    }

    fn storage(&self) -> &Arc<dyn Storage> {
        self.accounts.storage()
    }

    // ========================================================================
    // ACCOUNTS
    // ========================================================================

    /// Create an account with a fresh id; returns the locked, uncommitted account
    pub async fn create_account(
        &self,
        owner: NymId,
        notary: NotaryId,
        unit: UnitId,
        kind: AccountType,
    ) -> Result<AccountGuard, LedgerError> {
        let id = AccountId::generate();
        self.create_account_with_id(id, owner, notary, unit, kind).await
    }

    /// Create an account under a chosen id
    pub async fn create_account_with_id(
        &self,
        id: AccountId,
        owner: NymId,
        notary: NotaryId,
        unit: UnitId,
        kind: AccountType,
    ) -> Result<AccountGuard, LedgerError> {
        debug!(account = %id, unit = %unit, ?kind, "creating account");
        Ok(self
            .accounts
            .lock_or_insert_with(keys::account(&id), || Account::new(id, owner, notary, unit, kind))
            .await?)
    }

    /// Lock an account for the full validate, mutate, persist cycle
    pub async fn lock_account(&self, id: &AccountId) -> Result<AccountGuard, LedgerError> {
        self.accounts
            .lock(keys::account(id))
            .await?
            .ok_or(LedgerError::AccountNotFound(*id))
    }

    /// Lock several accounts in id order
    pub async fn lock_accounts(&self, ids: &BTreeSet<AccountId>) -> Result<AccountSet, LedgerError> {
        let mut guards = BTreeMap::new();
        for id in ids {
            guards.insert(*id, self.lock_account(id).await?);
        }
        Ok(AccountSet { guards })
    }

    /// Lock a notary-owned account, creating and persisting it on first use
    pub async fn ensure_account(
        &self,
        id: AccountId,
        owner: &NymId,
        notary: NotaryId,
        unit: UnitId,
        kind: AccountType,
    ) -> Result<(), LedgerError> {
        let key = keys::account(&id);
        if self.accounts.contains(&key).await? {
            return Ok(());
        }
        self.create_account_with_id(id, owner.clone(), notary, unit, kind)
            .await?
            .commit()?;
        Ok(())
    }

    /// Consistent copy of an account
    pub async fn account(&self, id: &AccountId) -> Result<Option<Account>, LedgerError> {
        Ok(self.accounts.snapshot(&keys::account(id)).await?)
    }

    /// Committed accounts denominated in `unit`, read without locking
    pub fn accounts_for_unit(&self, unit: &UnitId) -> Result<Vec<Account>, LedgerError> {
        let mut found = Vec::new();
        for key in self.storage().keys_with_prefix(keys::ACCOUNT_PREFIX)? {
            if let Some(account) = self.storage().load_record::<Account>(&key)? {
                if account.unit() == unit {
                    found.push(account);
                }
            }
        }
        Ok(found)
    }

    /// Committed accounts owned by `owner`, read without locking
    pub fn accounts_for_owner(&self, owner: &NymId) -> Result<Vec<Account>, LedgerError> {
        let mut found = Vec::new();
        for key in self.storage().keys_with_prefix(keys::ACCOUNT_PREFIX)? {
            if let Some(account) = self.storage().load_record::<Account>(&key)? {
                if account.owner() == owner {
                    found.push(account);
                }
            }
        }
        Ok(found)
    }

    // ========================================================================
    // BOX LEDGERS
    // ========================================================================

    /// Lock a box, creating an empty one if it does not exist yet
    pub async fn lock_ledger(&self, kind: BoxKind, owner: LedgerOwner) -> Result<LedgerGuard, LedgerError> {
        let key = Ledger::storage_key(kind, &owner);
        Ok(self
            .ledgers
            .lock_or_insert_with(key, || Ledger::new(kind, owner))
            .await?)
    }

    pub async fn lock_nymbox(&self, nym: &NymId) -> Result<LedgerGuard, LedgerError> {
        self.lock_ledger(BoxKind::Nymbox, LedgerOwner::Nym(nym.clone())).await
    }

    pub async fn lock_inbox(&self, account: &AccountId) -> Result<LedgerGuard, LedgerError> {
        self.lock_ledger(BoxKind::Inbox, LedgerOwner::Account(*account)).await
    }

    pub async fn lock_outbox(&self, account: &AccountId) -> Result<LedgerGuard, LedgerError> {
        self.lock_ledger(BoxKind::Outbox, LedgerOwner::Account(*account)).await
    }

    /// Lock several boxes in storage-key order
    pub async fn lock_ledgers(&self, wanted: Vec<(BoxKind, LedgerOwner)>) -> Result<LedgerSet, LedgerError> {
        let mut ordered = BTreeMap::new();
        for (kind, owner) in wanted {
            ordered.insert(Ledger::storage_key(kind, &owner), (kind, owner));
        }

        let mut guards = BTreeMap::new();
        for (key, (kind, owner)) in ordered {
            guards.insert(key, self.lock_ledger(kind, owner).await?);
        }
        Ok(LedgerSet { guards })
    }

    /// Consistent copy of a box; empty if it was never written
    pub async fn ledger(&self, kind: BoxKind, owner: LedgerOwner) -> Result<Ledger, LedgerError> {
        let key = Ledger::storage_key(kind, &owner);
        Ok(self
            .ledgers
            .snapshot(&key)
            .await?
            .unwrap_or_else(|| Ledger::new(kind, owner)))
    }

    // ========================================================================
    // UNITS
    // ========================================================================

    /// Register a unit definition; fails if the id is taken
    pub async fn register_unit(&self, unit: UnitDefinition) -> Result<(), LedgerError> {
        let id = *unit.id();
        let key = keys::unit(&id);
        let guard = self.units.lock_or_insert_with(key.clone(), || unit).await?;
        if self.units.storage().load(&key)?.is_some() {
            return Err(LedgerError::UnitExists(id));
        }
        guard.commit()?;
        Ok(())
    }

    pub async fn unit(&self, id: &UnitId) -> Result<UnitDefinition, LedgerError> {
        self.units
            .snapshot(&keys::unit(id))
            .await?
            .ok_or(LedgerError::UnitNotFound(*id))
    }
}

// ============================================================================
// LOCKED SETS
// ============================================================================

/// Accounts locked together for one operation
pub struct AccountSet {
    guards: BTreeMap<AccountId, AccountGuard>,
}

impl AccountSet {
    pub fn get(&self, id: &AccountId) -> Result<&Account, LedgerError> {
        self.guards
            .get(id)
            .map(|guard| &**guard)
            .ok_or(LedgerError::AccountNotFound(*id))
    }

    pub fn get_mut(&mut self, id: &AccountId) -> Result<&mut Account, LedgerError> {
        self.guards
            .get_mut(id)
            .map(|guard| &mut **guard)
            .ok_or(LedgerError::AccountNotFound(*id))
    }

    /// Move `amount` between two locked accounts of the same unit. Nothing
    /// is persisted until `commit`.
    pub fn transfer(&mut self, from: &AccountId, to: &AccountId, amount: i64) -> Result<(), LedgerError> {
        if from == to {
            return Err(LedgerError::InvalidAmount(amount));
        }
        if self.get(from)?.unit() != self.get(to)?.unit() {
            return Err(LedgerError::UnitMismatch);
        }
        self.get(to)?.clone().credit(amount)?;
        self.get_mut(from)?.debit(amount)?;
        self.get_mut(to)?.credit(amount)?;
        Ok(())
    }

    pub fn commit(self) -> Result<(), LedgerError> {
        for guard in self.guards.into_values() {
            guard.commit()?;
        }
        Ok(())
    }
}

/// Boxes locked together for one operation
pub struct LedgerSet {
    guards: BTreeMap<Vec<u8>, LedgerGuard>,
}

impl LedgerSet {
    pub fn get(&self, kind: BoxKind, owner: &LedgerOwner) -> Result<&Ledger, LedgerError> {
        let key = Ledger::storage_key(kind, owner);
        self.guards
            .get(&key)
            .map(|guard| &**guard)
            .ok_or_else(|| LedgerError::LedgerNotLocked(format!("{} {:?}", kind.as_str(), owner)))
    }

    pub fn get_mut(&mut self, kind: BoxKind, owner: &LedgerOwner) -> Result<&mut Ledger, LedgerError> {
        let key = Ledger::storage_key(kind, owner);
        self.guards
            .get_mut(&key)
            .map(|guard| &mut **guard)
            .ok_or_else(|| LedgerError::LedgerNotLocked(format!("{} {:?}", kind.as_str(), owner)))
    }

    pub fn commit(self) -> Result<(), LedgerError> {
        for guard in self.guards.into_values() {
            guard.commit()?;
        }
        Ok(())
    }
}
