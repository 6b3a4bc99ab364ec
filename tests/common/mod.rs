// Shared fixtures: an in-process notary and registered client sessions
#![allow(dead_code)]

use otnotary::client::{LocalChannel, ServerSession, SessionConfig};
use otnotary::identity::{AccountId, Keypair, NymId};
use otnotary::ledger::{BoxKind, Ledger, LedgerOwner, UnitDefinition};
use otnotary::notary::{Notary, NotaryConfig};
use otnotary::storage::SledStore;
use std::collections::BTreeSet;
use std::sync::Arc;

pub type Session = ServerSession<LocalChannel>;

pub fn notary() -> Arc<Notary> {
    notary_with(NotaryConfig::new())
}

pub fn notary_with(config: NotaryConfig) -> Arc<Notary> {
    let storage = Arc::new(SledStore::temporary().unwrap());
    Arc::new(Notary::new(storage, Keypair::generate(), config).unwrap())
}

/// Unregistered session for a fresh nym
pub fn new_session(notary: &Arc<Notary>, keypair: Keypair) -> Session {
    ServerSession::new(
        keypair,
        notary.public_key(),
        LocalChannel::new(notary.clone()),
        Arc::new(SledStore::temporary().unwrap()),
        SessionConfig::new(),
    )
    .unwrap()
}

/// Registered session holding one batch of transaction numbers
pub async fn session(notary: &Arc<Notary>) -> Session {
    let mut session = new_session(notary, Keypair::generate());
    session.register().await.unwrap();
    session.request_numbers().await.unwrap();
    session
}

/// Issue a plain unit; returns the definition and the issuer account
pub async fn issue(issuer: &mut Session, notary: &Notary, name: &str) -> (UnitDefinition, AccountId) {
    let unit = UnitDefinition::new(issuer.nym().clone(), *notary.id(), name);
    let account = issuer.issue_unit(unit.clone()).await.unwrap();
    (unit, account)
}

/// Move `amount` from the issuer to `holder` and settle both inboxes
pub async fn fund(
    issuer: &mut Session,
    issuer_account: AccountId,
    holder: &mut Session,
    account: AccountId,
    amount: i64,
) {
    let response = issuer.transfer(issuer_account, account, amount, "funding").await.unwrap();
    assert!(response.success, "funding failed: {:?}", response.failure);
    holder.process_inbox(account).await.unwrap();
    issuer.process_inbox(issuer_account).await.unwrap();
}

pub async fn balance(notary: &Notary, account: &AccountId) -> i64 {
    notary.wallet().account(account).await.unwrap().unwrap().balance()
}

pub async fn inbox(notary: &Notary, account: &AccountId) -> Ledger {
    notary
        .wallet()
        .ledger(BoxKind::Inbox, LedgerOwner::Account(*account))
        .await
        .unwrap()
}

pub async fn nymbox(notary: &Notary, nym: &NymId) -> Ledger {
    notary
        .wallet()
        .ledger(BoxKind::Nymbox, LedgerOwner::Nym(nym.clone()))
        .await
        .unwrap()
}

/// Numbers the notary holds as issued to `nym`
pub async fn issued_on_notary(notary: &Notary, nym: &NymId) -> BTreeSet<u64> {
    notary
        .contexts()
        .snapshot(notary.nym(), nym)
        .await
        .unwrap()
        .unwrap()
        .issued_numbers()
        .clone()
}

pub fn now() -> i64 {
    chrono::Utc::now().timestamp()
}
