// Keypair Tests
// Ed25519 keys and the nym ids derived from them

use otnotary::identity::{Keypair, KeypairError, NymError, NymId, PublicKey};

/// Test: Each generated keypair should be unique
#[test]
fn test_keypairs_are_unique() {
    let keypair1 = Keypair::generate();
    let keypair2 = Keypair::generate();

    assert_ne!(
        keypair1.public_key(),
        keypair2.public_key(),
        "Two generated keypairs should have different public keys"
    );
}

/// Test: Can serialize keypair to bytes and restore it
#[test]
fn test_keypair_serialization() {
    let original = Keypair::generate();
    let restored = Keypair::from_bytes(&original.to_bytes()).expect("Should deserialize keypair from bytes");

    assert_eq!(original.public_key(), restored.public_key());
}

/// Test: Garbage bytes are not a keypair
#[test]
fn test_invalid_keypair_bytes_fails() {
    assert!(Keypair::from_bytes(&[0u8; 5]).is_err());
}

/// Test: Public keys must be exactly 32 bytes
#[test]
fn test_invalid_public_key_bytes_fails() {
    assert!(matches!(
        PublicKey::from_bytes(&[1u8; 33]),
        Err(KeypairError::InvalidLength { expected: 32, got: 33 })
    ));
}

// ============================================================================
// NYM IDS
// ============================================================================

/// Test: Nym id string form carries the otx prefix
#[test]
fn test_nym_format() {
    let nym = NymId::from_public_key(&Keypair::generate().public_key());
    assert!(nym.to_string().starts_with("otx:nym:"));
}

/// Test: The signing key is recoverable from the nym id
#[test]
fn test_nym_recovers_public_key() {
    let keypair = Keypair::from_seed(&[3u8; 32]);
    let nym = NymId::from_public_key(&keypair.public_key());

    let parsed = NymId::parse(&nym.to_string()).unwrap();
    assert_eq!(parsed, nym);
    assert_eq!(parsed.public_key().unwrap(), keypair.public_key());
}

/// Test: Same key, same nym
#[test]
fn test_nym_deterministic() {
    let keypair = Keypair::generate();
    assert_eq!(
        NymId::from_public_key(&keypair.public_key()),
        NymId::from_public_key(&keypair.public_key())
    );
}

/// Test: Malformed nym strings are rejected
#[test]
fn test_invalid_nym_format_fails() {
    assert!(matches!(NymId::parse("otx:nym:"), Err(NymError::InvalidFormat(_))));
    assert!(matches!(NymId::parse("nym:abc"), Err(NymError::InvalidFormat(_))));
    assert!(NymId::parse("otx:nym:0OIl").is_err());
}
