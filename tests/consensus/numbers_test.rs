// Transaction Number Tests
// Issue, open, close and recover numbers

use otnotary::consensus::{ConsensusError, NumberState, TransactionNumberLedger};
use std::collections::BTreeSet;

fn ledger_with(numbers: &[u64]) -> TransactionNumberLedger {
    let mut ledger = TransactionNumberLedger::new();
    for n in numbers {
        ledger.issue(*n).unwrap();
    }
    ledger
}

/// Test: Issued numbers start out available
#[test]
fn test_issue_makes_available() {
    let ledger = ledger_with(&[1, 2]);

    assert_eq!(ledger.state(1), NumberState::Available);
    assert!(ledger.verify_available(2));
    assert!(ledger.verify_issued(2));
}

/// Test: Opening a number keeps it issued
#[test]
fn test_consume_available_keeps_issued() {
    let mut ledger = ledger_with(&[7]);
    ledger.consume_available(7).unwrap();

    assert!(!ledger.verify_available(7));
    assert!(ledger.verify_issued(7));
    assert_eq!(ledger.state(7), NumberState::Issued);
}

/// Test: Closing a number removes it for good
#[test]
fn test_consume_issued_removes_number() {
    let mut ledger = ledger_with(&[7]);
    ledger.consume_issued(7).unwrap();

    assert_eq!(ledger.state(7), NumberState::NotHeld);
    assert!(matches!(ledger.consume_issued(7), Err(ConsensusError::NumberNotFound(7))));
}

/// Test: A number can only be opened once
#[test]
fn test_double_open_fails() {
    let mut ledger = ledger_with(&[3]);
    ledger.consume_available(3).unwrap();

    assert!(matches!(ledger.consume_available(3), Err(ConsensusError::NumberNotFound(3))));
}

/// Test: Recovering needs an opened, still issued number
#[test]
fn test_recover_available() {
    let mut ledger = ledger_with(&[3, 4]);
    ledger.consume_available(3).unwrap();

    ledger.recover_available(3).unwrap();
    assert!(ledger.verify_available(3));
    assert!(ledger.recover_available(4).is_err(), "still available");
    assert!(ledger.recover_available(99).is_err(), "never issued");
}

/// Test: Accepting offered numbers is all or nothing
#[test]
fn test_accept_issued_all_or_nothing() {
    let mut ledger = TransactionNumberLedger::new();
    ledger.add_tentative(10).unwrap();
    ledger.add_tentative(11).unwrap();

    let result = ledger.accept_issued(&BTreeSet::from([10, 11, 12]));
    assert!(matches!(result, Err(ConsensusError::UnknownNumbers(ref unknown)) if unknown == &vec![12]));
    assert!(!ledger.verify_issued(10), "nothing may be accepted on failure");

    let added = ledger.accept_issued(&BTreeSet::from([10, 11])).unwrap();
    assert_eq!(added, BTreeSet::from([10, 11]));
    assert!(ledger.tentative().is_empty());
    assert!(ledger.verify_available(11));
}

/// Test: An issued number cannot be offered again
#[test]
fn test_tentative_rejects_issued() {
    let mut ledger = ledger_with(&[5]);
    assert!(matches!(ledger.add_tentative(5), Err(ConsensusError::NumberAlreadyIssued(5))));
}
