// Arena Tests
// Per-record locking and copy-on-write guards

use otnotary::storage::{Arena, SledStore, Storage};
use std::sync::Arc;
use std::time::Duration;

fn arena() -> Arc<Arena<Vec<u64>>> {
    Arc::new(Arena::new(Arc::new(SledStore::temporary().unwrap())))
}

/// Test: A second locker waits until the first guard is gone
#[tokio::test]
async fn test_lock_is_exclusive() {
    let arena = arena();
    let mut first = arena.lock_or_insert_with(b"k".to_vec(), Vec::new).await.unwrap();
    first.push(1);

    let contender = {
        let arena = arena.clone();
        tokio::spawn(async move {
            let mut guard = arena.lock(b"k".to_vec()).await.unwrap().unwrap();
            guard.push(2);
            guard.commit().unwrap();
        })
    };

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!contender.is_finished(), "contender must wait for the first guard");

    first.commit().unwrap();
    contender.await.unwrap();

    assert_eq!(arena.snapshot(b"k").await.unwrap(), Some(vec![1, 2]));
}

/// Test: Different keys do not block each other
#[tokio::test]
async fn test_independent_keys() {
    let arena = arena();
    let _a = arena.lock_or_insert_with(b"a".to_vec(), Vec::new).await.unwrap();

    let b = tokio::time::timeout(Duration::from_secs(1), arena.lock_or_insert_with(b"b".to_vec(), Vec::new)).await;
    assert!(b.is_ok());
}

/// Test: A created but uncommitted record never reaches storage
#[tokio::test]
async fn test_uncommitted_insert_leaves_no_trace() {
    let arena = arena();
    {
        let mut entry = arena.lock_or_insert_with(b"k".to_vec(), Vec::new).await.unwrap();
        entry.push(7);
    }

    assert_eq!(arena.snapshot(b"k").await.unwrap(), None);
    assert_eq!(arena.storage().load(b"k").unwrap(), None);
}

/// Test: A fresh arena over the same storage sees committed records
#[tokio::test]
async fn test_records_survive_reload() {
    let storage: Arc<dyn Storage> = Arc::new(SledStore::temporary().unwrap());
    {
        let arena: Arena<Vec<u64>> = Arena::new(storage.clone());
        let mut entry = arena.lock_or_insert_with(b"k".to_vec(), Vec::new).await.unwrap();
        entry.extend([4, 4, 8]);
        entry.commit().unwrap();
    }

    let arena: Arena<Vec<u64>> = Arena::new(storage);
    assert_eq!(arena.snapshot(b"k").await.unwrap(), Some(vec![4, 4, 8]));
}
