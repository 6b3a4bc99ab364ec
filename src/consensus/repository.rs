// Context repository - every context this process knows, one lock each
//
// Contexts for different (local, remote) pairs lock independently, so
// traffic from different nyms proceeds in parallel while requests from the
// same nym queue behind one another.

use crate::consensus::{ConsensusContext, ConsensusError, ConsensusRole};
use crate::identity::{NotaryId, NymId};
use crate::storage::{keys, Arena, Exclusive, Storage};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::debug;

/// Exclusive access to one context; `commit()` persists it
pub type ContextGuard = Exclusive<ConsensusContext>;

pub struct ContextRepository {
    arena: Arena<ConsensusContext>,
}

impl ContextRepository {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self {
            arena: Arena::new(storage),
        }
    }

    /// Lock an existing context
    pub async fn lock(&self, local: &NymId, remote: &NymId) -> Result<Option<ContextGuard>, ConsensusError> {
        Ok(self.arena.lock(keys::context(local, remote)).await?)
    }

    /// Lock the notary's context for a client nym, creating it on first
    /// contact. A new context is not persisted until the guard commits.
    pub async fn get_or_create_client(
        &self,
        notary_nym: &NymId,
        client_nym: &NymId,
        notary: &NotaryId,
    ) -> Result<ContextGuard, ConsensusError> {
        let guard = self
            .arena
            .lock_or_insert_with(keys::context(notary_nym, client_nym), || {
                debug!(nym = %client_nym, "creating client context");
                ConsensusContext::new_client(notary_nym.clone(), client_nym.clone(), *notary)
            })
            .await?;
        if !matches!(guard.role(), ConsensusRole::Client(_)) {
            return Err(ConsensusError::WrongRole);
        }
        Ok(guard)
    }

    /// Lock a nym's context for its notary, creating it on first contact
    pub async fn get_or_create_server(
        &self,
        client_nym: &NymId,
        notary_nym: &NymId,
        notary: &NotaryId,
    ) -> Result<ContextGuard, ConsensusError> {
        let guard = self
            .arena
            .lock_or_insert_with(keys::context(client_nym, notary_nym), || {
                debug!(notary = %notary, "creating server context");
                ConsensusContext::new_server(client_nym.clone(), notary_nym.clone(), *notary)
            })
            .await?;
        if !matches!(guard.role(), ConsensusRole::Server(_)) {
            return Err(ConsensusError::WrongRole);
        }
        Ok(guard)
    }

    /// Lock the existing contexts between `local` and each of `remotes`,
    /// in nym order. Remotes without a context are left out.
    pub async fn lock_many(
        &self,
        local: &NymId,
        remotes: &BTreeSet<NymId>,
    ) -> Result<BTreeMap<NymId, ContextGuard>, ConsensusError> {
        let mut guards = BTreeMap::new();
        for remote in remotes {
            if let Some(guard) = self.lock(local, remote).await? {
                guards.insert(remote.clone(), guard);
            }
        }
        Ok(guards)
    }

    /// Consistent copy of a context
    pub async fn snapshot(&self, local: &NymId, remote: &NymId) -> Result<Option<ConsensusContext>, ConsensusError> {
        Ok(self.arena.snapshot(&keys::context(local, remote)).await?)
    }

    /// Destroy a context (explicit unregistration)
    pub async fn unregister(&self, local: &NymId, remote: &NymId) -> Result<bool, ConsensusError> {
        match self.lock(local, remote).await? {
            Some(mut guard) => {
                guard.delete();
                guard.commit()?;
                Ok(true)
            }
            None => Ok(false),
        }
    }
}
