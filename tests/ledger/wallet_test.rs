// Wallet Tests
// Account, box and unit storage

use otnotary::identity::{AccountId, Keypair, NotaryId, NymId, Signed};
use otnotary::ledger::{
    AccountType, Basket, BasketComponent, BoxItem, BoxItemKind, BoxKind, LedgerError, LedgerOwner, UnitDefinition,
    Wallet,
};
use otnotary::storage::SledStore;
use std::collections::BTreeSet;
use std::sync::Arc;

// ============================================================================
// HELPER FUNCTIONS
// ============================================================================

fn wallet() -> Wallet {
    Wallet::new(Arc::new(SledStore::temporary().unwrap()))
}

fn nym() -> NymId {
    NymId::from_public_key(&Keypair::generate().public_key())
}

// ============================================================================
// ACCOUNTS
// ============================================================================

/// Test: A created account exists only once committed
#[tokio::test]
async fn test_create_account_commit() {
    let wallet = wallet();
    let owner = nym();
    let unit = UnitDefinition::new(nym(), NotaryId::generate(), "gold");

    let guard = wallet
        .create_account(owner.clone(), *unit.notary(), *unit.id(), AccountType::Simple)
        .await
        .unwrap();
    let id = *guard.id();
    assert!(wallet.accounts_for_owner(&owner).unwrap().is_empty());

    guard.commit().unwrap();
    assert_eq!(wallet.account(&id).await.unwrap().unwrap().balance(), 0);
}

/// Test: A transfer between locked accounts conserves the total
#[tokio::test]
async fn test_transfer_conserves_total() {
    let wallet = wallet();
    let (notary, unit) = (NotaryId::generate(), UnitDefinition::new(nym(), NotaryId::generate(), "gold"));
    let issuer = wallet.create_account(nym(), notary, *unit.id(), AccountType::Issuer).await.unwrap();
    let holder = wallet.create_account(nym(), notary, *unit.id(), AccountType::Simple).await.unwrap();
    let (issuer_id, holder_id) = (*issuer.id(), *holder.id());
    issuer.commit().unwrap();
    holder.commit().unwrap();

    let mut accounts = wallet.lock_accounts(&BTreeSet::from([issuer_id, holder_id])).await.unwrap();
    accounts.transfer(&issuer_id, &holder_id, 500).unwrap();
    accounts.commit().unwrap();

    let issuer = wallet.account(&issuer_id).await.unwrap().unwrap();
    let holder = wallet.account(&holder_id).await.unwrap().unwrap();
    assert_eq!(issuer.balance() + holder.balance(), 0);
    assert_eq!(holder.balance(), 500);
}

/// Test: A failed transfer leaves both accounts untouched
#[tokio::test]
async fn test_failed_transfer_changes_nothing() {
    let wallet = wallet();
    let (notary, unit) = (NotaryId::generate(), UnitDefinition::new(nym(), NotaryId::generate(), "gold"));
    let a = wallet.create_account(nym(), notary, *unit.id(), AccountType::Simple).await.unwrap();
    let b = wallet.create_account(nym(), notary, *unit.id(), AccountType::Simple).await.unwrap();
    let (a_id, b_id) = (*a.id(), *b.id());
    a.commit().unwrap();
    b.commit().unwrap();

    let mut accounts = wallet.lock_accounts(&BTreeSet::from([a_id, b_id])).await.unwrap();
    assert!(matches!(
        accounts.transfer(&a_id, &b_id, 1),
        Err(LedgerError::InsufficientFunds { .. })
    ));
    assert_eq!(accounts.get(&b_id).unwrap().balance(), 0);
}

/// Test: Accounts of different units cannot trade directly
#[tokio::test]
async fn test_transfer_unit_mismatch() {
    let wallet = wallet();
    let notary = NotaryId::generate();
    let gold = UnitDefinition::new(nym(), notary, "gold");
    let silver = UnitDefinition::new(nym(), notary, "silver");
    let a = wallet.create_account(nym(), notary, *gold.id(), AccountType::Issuer).await.unwrap();
    let b = wallet.create_account(nym(), notary, *silver.id(), AccountType::Simple).await.unwrap();
    let (a_id, b_id) = (*a.id(), *b.id());
    a.commit().unwrap();
    b.commit().unwrap();

    let mut accounts = wallet.lock_accounts(&BTreeSet::from([a_id, b_id])).await.unwrap();
    assert!(matches!(accounts.transfer(&a_id, &b_id, 5), Err(LedgerError::UnitMismatch)));
}

/// Test: Locking a missing account fails cleanly
#[tokio::test]
async fn test_lock_missing_account() {
    let wallet = wallet();
    let missing = AccountId::generate();
    assert!(matches!(
        wallet.lock_accounts(&BTreeSet::from([missing])).await,
        Err(LedgerError::AccountNotFound(id)) if id == missing
    ));
}

/// Test: Holders of a unit are found by scanning
#[tokio::test]
async fn test_accounts_for_unit() {
    let wallet = wallet();
    let notary = NotaryId::generate();
    let gold = UnitDefinition::new(nym(), notary, "gold");
    for _ in 0..3 {
        wallet
            .create_account(nym(), notary, *gold.id(), AccountType::Simple)
            .await
            .unwrap()
            .commit()
            .unwrap();
    }
    wallet
        .create_account(nym(), notary, *UnitDefinition::new(nym(), notary, "tin").id(), AccountType::Simple)
        .await
        .unwrap()
        .commit()
        .unwrap();

    assert_eq!(wallet.accounts_for_unit(gold.id()).unwrap().len(), 3);
}

// ============================================================================
// BOXES AND UNITS
// ============================================================================

/// Test: Boxes edited together are committed together
#[tokio::test]
async fn test_ledger_set_commit() {
    let wallet = wallet();
    let owner = nym();
    let account = AccountId::generate();
    let keypair = Keypair::generate();

    let mut ledgers = wallet
        .lock_ledgers(vec![
            (BoxKind::Nymbox, LedgerOwner::Nym(owner.clone())),
            (BoxKind::Inbox, LedgerOwner::Account(account)),
        ])
        .await
        .unwrap();
    ledgers
        .get_mut(BoxKind::Inbox, &LedgerOwner::Account(account))
        .unwrap()
        .add(Signed::sign(BoxItem::new(BoxItemKind::Pending, 1, 7), &keypair))
        .unwrap();
    assert!(ledgers.get(BoxKind::Outbox, &LedgerOwner::Account(account)).is_err());
    ledgers.commit().unwrap();

    let inbox = wallet.ledger(BoxKind::Inbox, LedgerOwner::Account(account)).await.unwrap();
    assert_eq!(inbox.len(), 1);
    assert!(wallet.ledger(BoxKind::Nymbox, LedgerOwner::Nym(owner)).await.unwrap().is_empty());
}

/// Test: A unit id can only be registered once
#[tokio::test]
async fn test_register_unit_once() {
    let wallet = wallet();
    let unit = UnitDefinition::new(nym(), NotaryId::generate(), "gold");

    wallet.register_unit(unit.clone()).await.unwrap();
    assert!(matches!(wallet.register_unit(unit.clone()).await, Err(LedgerError::UnitExists(_))));
    assert_eq!(wallet.unit(unit.id()).await.unwrap(), unit);
}

/// Test: Basket validity rules
#[test]
fn test_basket_validity() {
    let notary = NotaryId::generate();
    let a = *UnitDefinition::new(nym(), notary, "a").id();
    let b = *UnitDefinition::new(nym(), notary, "b").id();

    let valid = Basket::new(
        vec![BasketComponent { unit: a, weight: 2 }, BasketComponent { unit: b, weight: 1 }],
        10,
    );
    assert!(valid.is_valid());

    let repeated = Basket::new(
        vec![BasketComponent { unit: a, weight: 2 }, BasketComponent { unit: a, weight: 1 }],
        10,
    );
    assert!(!repeated.is_valid());
    assert!(!Basket::new(vec![], 10).is_valid());
    assert!(!Basket::new(vec![BasketComponent { unit: a, weight: 0 }], 10).is_valid());
}
