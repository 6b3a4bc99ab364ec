// Consensus Context Tests
// Request numbers, statements, nymbox hashes and persistence

use otnotary::consensus::{ConsensusContext, ConsensusError, ConsensusRole, TransactionStatement};
use otnotary::identity::{Keypair, NotaryId, NymId, Signed};
use otnotary::ledger::{BoxItem, BoxItemKind, BoxKind, Ledger, LedgerOwner};
use std::collections::BTreeSet;

// ============================================================================
// HELPER FUNCTIONS
// ============================================================================

fn nym_of(keypair: &Keypair) -> NymId {
    NymId::from_public_key(&keypair.public_key())
}

/// The notary's context for a client, holding `numbers`
fn client_context(client: &NymId, notary: NotaryId, numbers: &[u64]) -> ConsensusContext {
    let mut ctx = ConsensusContext::new_client(nym_of(&Keypair::generate()), client.clone(), notary);
    for n in numbers {
        ctx.issue_number(*n).unwrap();
    }
    ctx
}

// ============================================================================
// REQUEST NUMBERS
// ============================================================================

/// Test: Request numbers advance one at a time
#[test]
fn test_request_numbers_advance() {
    let mut ctx = client_context(&nym_of(&Keypair::generate()), NotaryId::generate(), &[]);

    ctx.accept_request_number(1).unwrap();
    ctx.accept_request_number(2).unwrap();
    assert_eq!(ctx.request_number(), 2);
    assert_eq!(ctx.next_request_number(), 3);
}

/// Test: Skipping ahead is as stale as going back
#[test]
fn test_request_number_gap_rejected() {
    let mut ctx = client_context(&nym_of(&Keypair::generate()), NotaryId::generate(), &[]);
    ctx.accept_request_number(1).unwrap();

    assert!(matches!(
        ctx.accept_request_number(5),
        Err(ConsensusError::StaleRequestNumber { expected: 2, got: 5 })
    ));
    assert_eq!(ctx.request_number(), 1);
}

// ============================================================================
// STATEMENTS
// ============================================================================

/// Test: A client's statement matches the notary's view of its numbers
#[test]
fn test_both_sides_agree_on_statement() {
    let keypair = Keypair::generate();
    let client = nym_of(&keypair);
    let notary = NotaryId::generate();

    let notary_side = client_context(&client, notary, &[1, 2, 3]);
    let mut client_side = ConsensusContext::new_server(client.clone(), nym_of(&Keypair::generate()), notary);
    for n in [1, 2, 3] {
        client_side.add_tentative_number(n).unwrap();
    }
    let offered = TransactionStatement::new(notary, client.clone(), BTreeSet::from([1, 2, 3]), BTreeSet::from([1, 2, 3]));
    client_side.accept_issued_numbers(&offered).unwrap();

    let closing = BTreeSet::from([2]);
    let statement = client_side.statement(&BTreeSet::new(), &closing);
    assert!(notary_side.matches_statement(&statement, &closing));
    assert!(!notary_side.matches_statement(&statement, &BTreeSet::new()));
}

/// Test: Statements from another notary never match
#[test]
fn test_statement_for_other_notary_does_not_match() {
    let client = nym_of(&Keypair::generate());
    let ctx = client_context(&client, NotaryId::generate(), &[1]);
    let foreign = TransactionStatement::new(NotaryId::generate(), client, BTreeSet::from([1]), BTreeSet::from([1]));

    assert!(!ctx.matches_statement(&foreign, &BTreeSet::new()));
}

/// Test: Accepting someone else's numbers is refused
#[test]
fn test_accept_statement_for_other_nym() {
    let notary = NotaryId::generate();
    let mut ctx = ConsensusContext::new_server(nym_of(&Keypair::generate()), nym_of(&Keypair::generate()), notary);
    ctx.add_tentative_number(4).unwrap();

    let other = TransactionStatement::new(notary, nym_of(&Keypair::generate()), BTreeSet::from([4]), BTreeSet::from([4]));
    assert!(matches!(ctx.accept_issued_numbers(&other), Err(ConsensusError::StatementMismatch)));
}

// ============================================================================
// ACKNOWLEDGEMENTS AND NYMBOX HASHES
// ============================================================================

/// Test: The client drops the acknowledgements the notary has recorded
#[test]
fn test_acknowledged_numbers_shrink() {
    let mut ctx = ConsensusContext::new_server(nym_of(&Keypair::generate()), nym_of(&Keypair::generate()), NotaryId::generate());
    for n in 1..=4 {
        ctx.add_acknowledged_number(n);
    }
    ctx.remove_acknowledged_numbers(&BTreeSet::from([1, 2, 3]));

    assert_eq!(ctx.acknowledged_numbers(), &BTreeSet::from([4]));
}

/// Test: Nymbox is in sync only when both hashes agree
#[test]
fn test_nymbox_sync() {
    let mut ctx = client_context(&nym_of(&Keypair::generate()), NotaryId::generate(), &[]);
    assert!(ctx.nymbox_in_sync());

    let mut ledger = Ledger::new(BoxKind::Nymbox, LedgerOwner::Nym(ctx.remote_nym().clone()));
    let keypair = Keypair::generate();
    ledger
        .add(Signed::sign(BoxItem::new(BoxItemKind::Notice, 1, 0), &keypair))
        .unwrap();

    ctx.set_remote_nymbox_hash(ledger.hash());
    assert!(!ctx.nymbox_in_sync());
    ctx.set_local_nymbox_hash(ledger.hash());
    assert!(ctx.nymbox_in_sync());
}

// ============================================================================
// PERSISTENCE AND SIGNATURES
// ============================================================================

/// Test: A context survives serialization byte for byte
#[test]
fn test_context_serialization_roundtrip() {
    let client = nym_of(&Keypair::generate());
    let mut ctx = client_context(&client, NotaryId::generate(), &[10, 11, 12]);
    ctx.accept_request_number(1).unwrap();
    ctx.consume_available(11).unwrap();
    ctx.open_cron_item(12).unwrap();
    ctx.finalize_acknowledged_numbers(BTreeSet::from([1]));

    let bytes = ctx.to_bytes().unwrap();
    let restored = ConsensusContext::from_bytes(&bytes).unwrap();

    assert_eq!(restored, ctx);
    assert_eq!(restored.to_bytes().unwrap(), bytes);
    assert!(matches!(restored.role(), ConsensusRole::Client(_)));
}

/// Test: Corrupted bytes are reported, not panicked on
#[test]
fn test_context_corrupted_bytes() {
    assert!(matches!(
        ConsensusContext::from_bytes(&[0xFF; 3]),
        Err(ConsensusError::CorruptedState(_))
    ));
}

/// Test: Any mutation invalidates the context signature
#[test]
fn test_signature_cleared_by_mutation() {
    let keypair = Keypair::generate();
    let mut ctx = ConsensusContext::new_server(nym_of(&keypair), nym_of(&Keypair::generate()), NotaryId::generate());
    ctx.sign(&keypair).unwrap();
    assert!(ctx.verify_signature(&keypair.public_key()));

    let revision = ctx.revision();
    ctx.update_request_number(8);
    assert!(ctx.revision() > revision);
    assert!(ctx.signature().is_none());
    assert!(!ctx.verify_signature(&keypair.public_key()));
}
