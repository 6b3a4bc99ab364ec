// Context Repository Tests
// Locked, persisted contexts keyed by nym pair

use otnotary::consensus::{ConsensusError, ContextRepository};
use otnotary::identity::{Keypair, NotaryId, NymId};
use otnotary::storage::{SledStore, Storage};
use std::collections::BTreeSet;
use std::sync::Arc;

fn nym() -> NymId {
    NymId::from_public_key(&Keypair::generate().public_key())
}

/// Test: Contexts are reloaded from storage by a new repository
#[tokio::test]
async fn test_context_persists_across_repositories() {
    let storage: Arc<dyn Storage> = Arc::new(SledStore::temporary().unwrap());
    let (notary_nym, client, notary) = (nym(), nym(), NotaryId::generate());

    {
        let repo = ContextRepository::new(storage.clone());
        let mut ctx = repo.get_or_create_client(&notary_nym, &client, &notary).await.unwrap();
        ctx.issue_number(1).unwrap();
        ctx.accept_request_number(1).unwrap();
        ctx.commit().unwrap();
    }

    let repo = ContextRepository::new(storage);
    let ctx = repo.snapshot(&notary_nym, &client).await.unwrap().unwrap();
    assert_eq!(ctx.request_number(), 1);
    assert!(ctx.verify_available_number(1));
}

/// Test: The same key cannot be opened with the other role
#[tokio::test]
async fn test_role_mismatch_rejected() {
    let repo = ContextRepository::new(Arc::new(SledStore::temporary().unwrap()));
    let (a, b, notary) = (nym(), nym(), NotaryId::generate());

    repo.get_or_create_client(&a, &b, &notary).await.unwrap().commit().unwrap();
    let result = repo.get_or_create_server(&a, &b, &notary).await;
    assert!(matches!(result, Err(ConsensusError::WrongRole)));
}

/// Test: lock_many skips nyms that never registered
#[tokio::test]
async fn test_lock_many_skips_unknown() {
    let repo = ContextRepository::new(Arc::new(SledStore::temporary().unwrap()));
    let (notary_nym, known, unknown, notary) = (nym(), nym(), nym(), NotaryId::generate());
    repo.get_or_create_client(&notary_nym, &known, &notary).await.unwrap().commit().unwrap();

    let guards = repo
        .lock_many(&notary_nym, &BTreeSet::from([known.clone(), unknown.clone()]))
        .await
        .unwrap();
    assert_eq!(guards.len(), 1);
    assert!(guards.contains_key(&known));
}

/// Test: Unregistering destroys the context
#[tokio::test]
async fn test_unregister() {
    let repo = ContextRepository::new(Arc::new(SledStore::temporary().unwrap()));
    let (notary_nym, client, notary) = (nym(), nym(), NotaryId::generate());
    repo.get_or_create_client(&notary_nym, &client, &notary).await.unwrap().commit().unwrap();

    assert!(repo.unregister(&notary_nym, &client).await.unwrap());
    assert!(repo.snapshot(&notary_nym, &client).await.unwrap().is_none());
    assert!(!repo.unregister(&notary_nym, &client).await.unwrap());
}
