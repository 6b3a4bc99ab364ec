// Signer Tests
// Raw signatures and signed documents

use otnotary::consensus::TransactionStatement;
use otnotary::identity::{Keypair, NotaryId, NymId, Signature, Signed, Signer};
use std::collections::BTreeSet;

/// Test: Can verify a valid signature
#[test]
fn test_verify_valid_signature() {
    let keypair = Keypair::generate();
    let message = b"request 42";

    let signature = Signer::sign(&keypair, message);

    assert!(Signer::verify(&keypair.public_key(), message, &signature));
}

/// Test: Tampered message fails verification
#[test]
fn test_tampered_message_fails() {
    let keypair = Keypair::generate();
    let signature = Signer::sign(&keypair, b"pay 100");

    assert!(!Signer::verify(&keypair.public_key(), b"pay 900", &signature));
}

/// Test: Corrupted signature fails verification
#[test]
fn test_corrupted_signature_fails() {
    let keypair = Keypair::generate();
    let message = b"pay 100";
    let mut bytes = Signer::sign(&keypair, message).as_bytes().to_vec();
    bytes[0] ^= 0xFF;

    let corrupted = Signature::from_bytes(&bytes).unwrap();
    assert!(!Signer::verify(&keypair.public_key(), message, &corrupted));
}

/// Test: Signature bytes must be 64 long
#[test]
fn test_invalid_signature_bytes_fails() {
    assert!(Signature::from_bytes(&[0u8; 10]).is_err());
}

// ============================================================================
// SIGNED DOCUMENTS
// ============================================================================

fn statement(keypair: &Keypair) -> TransactionStatement {
    let notary = NotaryId::generate();
    let nym = NymId::from_public_key(&keypair.public_key());
    TransactionStatement::new(notary, nym, BTreeSet::from([1, 2, 3]), BTreeSet::from([2, 3]))
}

/// Test: A signed document verifies against its signer only
#[test]
fn test_signed_document_verifies_with_signer() {
    let keypair = Keypair::generate();
    let signed = Signed::sign(statement(&keypair), &keypair);

    assert!(signed.verify());
    assert!(signed.verify_with(&keypair.public_key()));
    assert!(!signed.verify_with(&Keypair::generate().public_key()));
}

/// Test: Re-signing the same document with another key changes the signer
#[test]
fn test_signed_document_records_signer() {
    let owner = Keypair::generate();
    let other = Keypair::generate();
    let signed = Signed::sign(statement(&owner), &other);

    assert_eq!(signed.signer(), &other.public_key());
    assert!(signed.verify());
    assert!(!signed.verify_with(&owner.public_key()));
}
