// Sequencing Tests
// Registration, request numbers and transaction number issuance

use crate::common::{issued_on_notary, new_session, notary, notary_with, session};
use otnotary::client::SessionError;
use otnotary::consensus::TransactionStatement;
use otnotary::identity::{AccountId, Keypair, NymId, Signed};
use otnotary::instrument::{Operation, TransactionBuilder};
use otnotary::ledger::LedgerHash;
use otnotary::notary::{Notary, NotaryConfig};
use otnotary::protocol::{Command, ReplyPayload, ReplyStatus, Request, SignedRequest};
use std::collections::BTreeSet;

// ============================================================================
// HELPER FUNCTIONS
// ============================================================================

fn request(keypair: &Keypair, notary: &Notary, number: u64, command: Command) -> SignedRequest {
    let nym = NymId::from_public_key(&keypair.public_key());
    Signed::sign(Request::new(nym, *notary.id(), number, command), keypair)
}

async fn register(notary: &Notary, keypair: &Keypair) -> u64 {
    let reply = notary.handle_request(request(keypair, notary, 0, Command::RegisterNym)).await;
    assert!(reply.verify_with(&notary.public_key()));
    match &reply.body().payload {
        ReplyPayload::RequestNumber(current) => *current,
        other => panic!("unexpected payload {:?}", other),
    }
}

// ============================================================================
// REQUEST NUMBERS
// ============================================================================

/// Test: Only registered nyms are served
#[tokio::test]
async fn test_unregistered_nym_rejected() {
    let notary = notary();
    let keypair = Keypair::generate();

    let reply = notary.handle_request(request(&keypair, &notary, 1, Command::GetNymbox)).await;
    assert!(!reply.body().success);
    assert!(matches!(reply.body().status, ReplyStatus::Rejected(_)));
}

/// Test: Each request number is accepted exactly once, in order
#[tokio::test]
async fn test_request_numbers_are_sequenced() {
    let notary = notary();
    let keypair = Keypair::generate();
    let current = register(&notary, &keypair).await;

    let reply = notary
        .handle_request(request(&keypair, &notary, current + 1, Command::GetNymbox))
        .await;
    assert_eq!(reply.body().status, ReplyStatus::Ok);
    assert_eq!(reply.body().request_number, current + 1);

    let replay = notary
        .handle_request(request(&keypair, &notary, current + 1, Command::GetNymbox))
        .await;
    assert_eq!(
        replay.body().status,
        ReplyStatus::StaleRequestNumber { current: current + 1 }
    );

    let skipped = notary
        .handle_request(request(&keypair, &notary, current + 5, Command::GetNymbox))
        .await;
    assert_eq!(
        skipped.body().status,
        ReplyStatus::StaleRequestNumber { current: current + 1 }
    );
    assert_eq!(notary.stats().stale_requests, 2);
}

/// Test: getRequestNumber answers whatever number it carries
#[tokio::test]
async fn test_get_request_number_skips_sequencing() {
    let notary = notary();
    let keypair = Keypair::generate();
    let current = register(&notary, &keypair).await;

    let reply = notary
        .handle_request(request(&keypair, &notary, 9_999, Command::GetRequestNumber))
        .await;
    assert_eq!(reply.body().status, ReplyStatus::Ok);
    assert_eq!(reply.body().payload, ReplyPayload::RequestNumber(current));
}

/// Test: A request signed by another key is refused
#[tokio::test]
async fn test_forged_request_rejected() {
    let notary = notary();
    let keypair = Keypair::generate();
    let current = register(&notary, &keypair).await;

    let nym = NymId::from_public_key(&keypair.public_key());
    let forged = Signed::sign(
        Request::new(nym, *notary.id(), current + 1, Command::GetNymbox),
        &Keypair::generate(),
    );
    let reply = notary.handle_request(forged).await;
    assert!(matches!(reply.body().status, ReplyStatus::Rejected(_)));

    // the genuine request with the same number still goes through
    let reply = notary
        .handle_request(request(&keypair, &notary, current + 1, Command::GetNymbox))
        .await;
    assert_eq!(reply.body().status, ReplyStatus::Ok);
}

/// Test: Transactions sent with a stale nymbox hash are turned away
#[tokio::test]
async fn test_nymbox_hash_mismatch() {
    let notary = notary();
    let keypair = Keypair::generate();
    let nym = NymId::from_public_key(&keypair.public_key());
    let current = register(&notary, &keypair).await;

    let reply = notary
        .handle_request(request(&keypair, &notary, current + 1, Command::GetTransactionNumbers))
        .await;
    assert_eq!(reply.body().status, ReplyStatus::Ok);
    let nymbox_hash = reply.body().nymbox_hash;
    assert_ne!(nymbox_hash, LedgerHash::default());

    let statement = TransactionStatement::new(*notary.id(), nym.clone(), BTreeSet::new(), BTreeSet::new());
    let transaction = TransactionBuilder::new()
        .signer(&keypair)
        .notary(*notary.id())
        .account(AccountId::generate())
        .number(1)
        .operation(Operation::CancelCronItem { item: 1 })
        .balance_agreement(0, statement)
        .build()
        .unwrap();
    let signed = Signed::sign(
        Request::new(nym, *notary.id(), current + 2, Command::NotarizeTransaction { transaction }),
        &keypair,
    );

    let reply = notary.handle_request(signed).await;
    assert_eq!(reply.body().status, ReplyStatus::NymboxHashMismatch);
    assert_eq!(reply.body().nymbox_hash, nymbox_hash);
    assert_eq!(notary.stats().nymbox_mismatches, 1);
    assert_eq!(notary.stats().transactions_failed, 0);
}

/// Test: Undecodable bytes get no reply at all
#[tokio::test]
async fn test_garbage_bytes_ignored() {
    let notary = notary();
    assert!(notary.handle_bytes(&[0xff, 0x00, 0x13]).await.is_empty());
}

// ============================================================================
// TRANSACTION NUMBERS
// ============================================================================

/// Test: A batch of 100 numbers lands on both sides
#[tokio::test]
async fn test_batch_of_numbers_installed() {
    let notary = notary_with(
        NotaryConfig::new()
            .with_numbers_per_batch(100)
            .with_max_outstanding_numbers(400),
    );
    let alice = session(&notary).await;

    let context = alice.context().await.unwrap();
    assert_eq!(context.available_numbers().len(), 100);
    assert_eq!(context.issued_numbers(), &issued_on_notary(&notary, alice.nym()).await);
    assert!(context.numbers().tentative().is_empty());
    assert!(context.nymbox_in_sync());
}

/// Test: The outstanding-number cap is enforced
#[tokio::test]
async fn test_outstanding_cap() {
    let notary = notary_with(
        NotaryConfig::new()
            .with_numbers_per_batch(20)
            .with_max_outstanding_numbers(40),
    );
    let mut alice = session(&notary).await;

    alice.request_numbers().await.unwrap();
    assert!(matches!(
        alice.request_numbers().await,
        Err(SessionError::Rejected(_))
    ));
    assert_eq!(alice.context().await.unwrap().available_numbers().len(), 40);
}

/// Test: Registering twice keeps the existing relationship
#[tokio::test]
async fn test_register_is_idempotent() {
    let notary = notary();
    let keypair = Keypair::generate();
    let mut alice = new_session(&notary, Keypair::from_bytes(&keypair.to_bytes()).unwrap());
    alice.register().await.unwrap();
    alice.request_numbers().await.unwrap();

    let current = register(&notary, &keypair).await;
    assert!(current > 0);
    assert_eq!(issued_on_notary(&notary, alice.nym()).await.len(), 20);
}
