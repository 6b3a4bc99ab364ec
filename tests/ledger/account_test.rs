// Account Tests
// Balance rules per account type

use otnotary::identity::{AccountId, Keypair, NotaryId, NymId, UnitId};
use otnotary::ledger::{Account, AccountType, LedgerError};

fn account(kind: AccountType) -> Account {
    Account::new(
        AccountId::generate(),
        NymId::from_public_key(&Keypair::generate().public_key()),
        NotaryId::generate(),
        UnitId::generate(),
        kind,
    )
}

/// Test: Simple accounts never go negative
#[test]
fn test_simple_account_cannot_overdraw() {
    let mut simple = account(AccountType::Simple);
    simple.credit(100).unwrap();

    assert!(matches!(
        simple.debit(101),
        Err(LedgerError::InsufficientFunds { available: 100, required: 101 })
    ));
    assert_eq!(simple.debit(100).unwrap(), 0);
}

/// Test: Issuer accounts go negative as units circulate
#[test]
fn test_issuer_account_goes_negative() {
    let mut issuer = account(AccountType::Issuer);
    assert_eq!(issuer.debit(144_488).unwrap(), -144_488);
    assert!(issuer.can_go_negative());
}

/// Test: Reserve and voucher accounts behave like simple ones
#[test]
fn test_notary_accounts_cannot_overdraw() {
    for kind in [AccountType::Voucher, AccountType::Reserve] {
        let mut held = account(kind);
        assert!(held.debit(1).is_err());
    }
}

/// Test: Zero and negative amounts are refused
#[test]
fn test_non_positive_amounts_rejected() {
    let mut simple = account(AccountType::Simple);
    assert!(matches!(simple.credit(0), Err(LedgerError::InvalidAmount(0))));
    assert!(matches!(simple.debit(-5), Err(LedgerError::InvalidAmount(-5))));
}

/// Test: Credits cannot overflow the balance
#[test]
fn test_credit_overflow() {
    let mut simple = account(AccountType::Simple);
    simple.credit(i64::MAX).unwrap();
    assert!(matches!(simple.credit(1), Err(LedgerError::BalanceOverflow)));
}

/// Test: Account serialization round trip
#[test]
fn test_account_serialization() {
    let mut simple = account(AccountType::Simple);
    simple.credit(1_144_888).unwrap();

    let restored = Account::from_bytes(&simple.to_bytes()).unwrap();
    assert_eq!(restored, simple);
}
