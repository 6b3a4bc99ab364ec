// Payment Tests
// Transfers and cheques through the notarization pipeline

use crate::common::{balance, fund, inbox, issue, issued_on_notary, new_session, notary, now, session};
use otnotary::identity::{Keypair, Signed};
use otnotary::instrument::{Operation, TransactionBuilder, TransactionFailure};
use otnotary::ledger::BoxItemKind;
use otnotary::protocol::{Command, ReplyPayload, ReplyStatus, Request};
use std::collections::BTreeSet;

/// Test: A balance agreement the notary does not compute fails the
/// transaction and burns its number
#[tokio::test]
async fn test_balance_agreement_mismatch_burns_number() {
    let notary = notary();
    let keypair = Keypair::generate();
    let mut alice = new_session(&notary, Keypair::from_bytes(&keypair.to_bytes()).unwrap());
    alice.register().await.unwrap();
    alice.request_numbers().await.unwrap();
    let mut bob = session(&notary).await;
    let (gold, issuer_account) = issue(&mut alice, &notary, "gold").await;
    let bob_account = bob.register_account(*gold.id()).await.unwrap();

    let context = alice.context().await.unwrap();
    let number = *context.available_numbers().iter().next().unwrap();
    let transaction = TransactionBuilder::new()
        .signer(&keypair)
        .notary(*notary.id())
        .account(issuer_account)
        .number(number)
        .operation(Operation::Transfer {
            to_account: bob_account,
            amount: 10,
            memo: "wrong total".to_string(),
        })
        .balance_agreement(999, context.statement(&BTreeSet::new(), &BTreeSet::new()))
        .build()
        .unwrap();
    let request = Request::new(
        alice.nym().clone(),
        *notary.id(),
        context.next_request_number(),
        Command::NotarizeTransaction { transaction },
    )
    .with_nymbox_hash(context.remote_nymbox_hash());

    let reply = notary.handle_request(Signed::sign(request, &keypair)).await;
    assert_eq!(reply.body().status, ReplyStatus::Ok);
    let ReplyPayload::Transaction(response) = &reply.body().payload else {
        panic!("expected a transaction response");
    };
    let response = response.body();
    assert!(!response.success);
    assert!(matches!(response.failure, Some(TransactionFailure::BalanceAgreementMismatch(_))));
    assert!(response.number_consumed);
    assert!(response.closed.contains(&number));
    assert!(!issued_on_notary(&notary, alice.nym()).await.contains(&number));
    assert_eq!(balance(&notary, &issuer_account).await, 0);
}

/// Test: A transfer debits at once and credits on acceptance
#[tokio::test]
async fn test_transfer_lifecycle() {
    let notary = notary();
    let mut alice = session(&notary).await;
    let mut bob = session(&notary).await;
    let (gold, issuer_account) = issue(&mut alice, &notary, "gold").await;
    let bob_account = bob.register_account(*gold.id()).await.unwrap();

    let response = alice
        .transfer(issuer_account, bob_account, 1_144_888, "first payment")
        .await
        .unwrap();
    assert!(response.success);
    assert_eq!(response.balance, Some(-1_144_888));
    assert_eq!(balance(&notary, &bob_account).await, 0);

    let pending = inbox(&notary, &bob_account).await;
    assert_eq!(pending.items_of_kind(BoxItemKind::Pending).len(), 1);
    // the transfer number stays open until the recipient accepts
    assert!(issued_on_notary(&notary, alice.nym()).await.contains(&response.number()));

    bob.process_inbox(bob_account).await.unwrap().unwrap();
    assert_eq!(balance(&notary, &bob_account).await, 1_144_888);
    assert!(inbox(&notary, &bob_account).await.is_empty());

    let receipts = inbox(&notary, &issuer_account).await;
    let receipt = receipts
        .find_by_reference(BoxItemKind::TransferReceipt, response.number())
        .unwrap();
    assert_eq!(receipt.body().amount(), 1_144_888);

    alice.process_inbox(issuer_account).await.unwrap().unwrap();
    assert!(!issued_on_notary(&notary, alice.nym()).await.contains(&response.number()));
    assert!(!alice.context().await.unwrap().verify_issued_number(response.number()));
}

/// Test: Every unit sums to zero across its accounts
#[tokio::test]
async fn test_units_balance_to_zero() {
    let notary = notary();
    let mut alice = session(&notary).await;
    let mut bob = session(&notary).await;
    let mut carol = session(&notary).await;
    let (gold, issuer_account) = issue(&mut alice, &notary, "gold").await;
    let bob_account = bob.register_account(*gold.id()).await.unwrap();
    let carol_account = carol.register_account(*gold.id()).await.unwrap();

    fund(&mut alice, issuer_account, &mut bob, bob_account, 700).await;
    let response = bob.transfer(bob_account, carol_account, 250, "split").await.unwrap();
    assert!(response.success);
    carol.process_inbox(carol_account).await.unwrap();

    let total: i64 = notary
        .wallet()
        .accounts_for_unit(gold.id())
        .unwrap()
        .iter()
        .map(|a| a.balance())
        .sum();
    assert_eq!(total, 0);
    assert_eq!(balance(&notary, &bob_account).await, 450);
    assert_eq!(balance(&notary, &carol_account).await, 250);
}

/// Test: A failed transfer burns its number on both sides
#[tokio::test]
async fn test_overdraft_burns_number() {
    let notary = notary();
    let mut alice = session(&notary).await;
    let mut bob = session(&notary).await;
    let (gold, issuer_account) = issue(&mut alice, &notary, "gold").await;
    let bob_account = bob.register_account(*gold.id()).await.unwrap();
    fund(&mut alice, issuer_account, &mut bob, bob_account, 100).await;

    let response = bob.transfer(bob_account, issuer_account, 101, "too much").await.unwrap();
    assert!(!response.success);
    assert!(matches!(
        response.failure,
        Some(TransactionFailure::InsufficientFunds { .. })
    ));
    assert!(response.number_consumed);
    assert!(!issued_on_notary(&notary, bob.nym()).await.contains(&response.number()));
    assert!(!bob.context().await.unwrap().verify_issued_number(response.number()));
    assert_eq!(balance(&notary, &bob_account).await, 100);

    // both sides still agree, so the next transaction goes through
    let response = bob.transfer(bob_account, issuer_account, 40, "refund").await.unwrap();
    assert!(response.success);
    assert_eq!(
        bob.context().await.unwrap().issued_numbers(),
        &issued_on_notary(&notary, bob.nym()).await
    );
}

/// Test: Transfers between units are refused
#[tokio::test]
async fn test_transfer_unit_mismatch() {
    let notary = notary();
    let mut alice = session(&notary).await;
    let (_, gold_account) = issue(&mut alice, &notary, "gold").await;
    let (_, silver_account) = issue(&mut alice, &notary, "silver").await;

    let response = alice.transfer(gold_account, silver_account, 5, "wrong").await.unwrap();
    assert_eq!(response.failure, Some(TransactionFailure::UnitMismatch));
}

// ============================================================================
// CHEQUES
// ============================================================================

/// Test: A cheque moves funds once and closes the drawer's number
#[tokio::test]
async fn test_cheque_deposit() {
    let notary = notary();
    let mut alice = session(&notary).await;
    let mut bob = session(&notary).await;
    let (gold, issuer_account) = issue(&mut alice, &notary, "gold").await;
    let bob_account = bob.register_account(*gold.id()).await.unwrap();

    let cheque = alice
        .write_cheque(issuer_account, Some(bob.nym().clone()), 144_488, now() - 60, now() + 3_600, "rent")
        .await
        .unwrap();
    let number = cheque.body().number();

    let response = bob.deposit_cheque(bob_account, cheque.clone()).await.unwrap();
    assert!(response.success);
    assert_eq!(balance(&notary, &bob_account).await, 144_488);
    assert_eq!(balance(&notary, &issuer_account).await, -144_488);

    let receipts = inbox(&notary, &issuer_account).await;
    let receipt = receipts.find_by_reference(BoxItemKind::ChequeReceipt, number).unwrap();
    assert!(receipt.body().closing_numbers().contains(&number));

    let again = bob.deposit_cheque(bob_account, cheque).await.unwrap();
    assert!(!again.success);
    assert!(matches!(again.failure, Some(TransactionFailure::ChequeInvalid(_))));
    assert_eq!(balance(&notary, &bob_account).await, 144_488);

    alice.process_inbox(issuer_account).await.unwrap().unwrap();
    assert!(!issued_on_notary(&notary, alice.nym()).await.contains(&number));
}

/// Test: A cheque made out to someone else cannot be deposited
#[tokio::test]
async fn test_cheque_wrong_recipient() {
    let notary = notary();
    let mut alice = session(&notary).await;
    let mut bob = session(&notary).await;
    let carol = session(&notary).await;
    let (gold, issuer_account) = issue(&mut alice, &notary, "gold").await;
    let bob_account = bob.register_account(*gold.id()).await.unwrap();

    let cheque = alice
        .write_cheque(issuer_account, Some(carol.nym().clone()), 10, now() - 60, now() + 3_600, "")
        .await
        .unwrap();
    let response = bob.deposit_cheque(bob_account, cheque.clone()).await.unwrap();
    assert!(matches!(response.failure, Some(TransactionFailure::ChequeInvalid(_))));

    // the drawer's number was never touched
    assert!(issued_on_notary(&notary, alice.nym()).await.contains(&cheque.body().number()));
}

/// Test: Expired cheques are refused
#[tokio::test]
async fn test_expired_cheque() {
    let notary = notary();
    let mut alice = session(&notary).await;
    let mut bob = session(&notary).await;
    let (gold, issuer_account) = issue(&mut alice, &notary, "gold").await;
    let bob_account = bob.register_account(*gold.id()).await.unwrap();

    let cheque = alice
        .write_cheque(issuer_account, None, 10, now() - 7_200, now() - 3_600, "stale")
        .await
        .unwrap();
    let response = bob.deposit_cheque(bob_account, cheque).await.unwrap();
    assert!(matches!(response.failure, Some(TransactionFailure::ChequeInvalid(_))));
    assert_eq!(balance(&notary, &bob_account).await, 0);
}
