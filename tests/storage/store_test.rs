// Store Tests
// Tests for the sled key-value store wrapper

use otnotary::storage::{keys, SledStore, Storage};
use std::sync::Arc;
use tempfile::TempDir;

// ============================================================================
// STORE CREATION AND BASIC OPERATIONS
// ============================================================================

#[test]
fn test_store_open_new() {
    let temp_dir = TempDir::new().unwrap();
    let store = SledStore::open(temp_dir.path()).unwrap();

    assert!(store.is_empty());
}

#[test]
fn test_store_open_existing() {
    let temp_dir = TempDir::new().unwrap();

    {
        let store = SledStore::open(temp_dir.path()).unwrap();
        store.store(b"test_key", b"test_value").unwrap();
        store.flush().unwrap();
    }

    {
        let store = SledStore::open(temp_dir.path()).unwrap();
        assert_eq!(store.load(b"test_key").unwrap(), Some(b"test_value".to_vec()));
    }
}

#[test]
fn test_store_remove() {
    let store = SledStore::temporary().unwrap();
    store.store(b"key", b"value").unwrap();
    store.remove(b"key").unwrap();

    assert_eq!(store.load(b"key").unwrap(), None);
}

#[test]
fn test_keys_with_prefix_in_order() {
    let store = SledStore::temporary().unwrap();
    store.store(&keys::cron(2), b"b").unwrap();
    store.store(&keys::cron(1), b"a").unwrap();
    store.store(&keys::cron(300), b"c").unwrap();
    store.store(keys::NOTARY_STATE, b"x").unwrap();

    let found = store.keys_with_prefix(keys::CRON_PREFIX).unwrap();
    assert_eq!(found, vec![keys::cron(1), keys::cron(2), keys::cron(300)]);
}

// ============================================================================
// RECORDS
// ============================================================================

#[test]
fn test_record_roundtrip() {
    let store: Arc<dyn Storage> = Arc::new(SledStore::temporary().unwrap());
    let value: Vec<u64> = vec![1, 44, 1_144_888];

    store.store_record(b"numbers", &value).unwrap();
    let loaded: Option<Vec<u64>> = store.load_record(b"numbers").unwrap();

    assert_eq!(loaded, Some(value));
}

#[test]
fn test_record_decode_failure_is_reported() {
    let store: Arc<dyn Storage> = Arc::new(SledStore::temporary().unwrap());
    store.store(b"broken", &[0xFF, 0xFF, 0xFF]).unwrap();

    let loaded: Result<Option<String>, _> = store.load_record(b"broken");
    assert!(loaded.is_err());
}
