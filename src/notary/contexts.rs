// Context set - the consensus contexts one request or cron step holds

use crate::consensus::{ConsensusContext, ContextGuard};
use crate::identity::NymId;
use crate::instrument::TransactionFailure;
use crate::storage::StoreError;
use std::collections::BTreeMap;

pub(crate) type Checkpoint = BTreeMap<NymId, ConsensusContext>;

/// Contexts locked in nym order; persisted together by `commit`
pub(crate) struct ContextSet {
    guards: BTreeMap<NymId, ContextGuard>,
}

impl ContextSet {
    pub fn new(guards: BTreeMap<NymId, ContextGuard>) -> Self {
        Self { guards }
    }

    pub fn contains(&self, nym: &NymId) -> bool {
        self.guards.contains_key(nym)
    }

    pub fn get(&self, nym: &NymId) -> Result<&ConsensusContext, TransactionFailure> {
        self.guards
            .get(nym)
            .map(|guard| &**guard)
            .ok_or_else(|| TransactionFailure::AgreementInvalid(format!("{} is not registered", nym)))
    }

    pub fn get_mut(&mut self, nym: &NymId) -> Result<&mut ConsensusContext, TransactionFailure> {
        self.guards
            .get_mut(nym)
            .map(|guard| &mut **guard)
            .ok_or_else(|| TransactionFailure::AgreementInvalid(format!("{} is not registered", nym)))
    }

    /// Copy of every held context
    pub fn checkpoint(&self) -> Checkpoint {
        self.guards
            .iter()
            .map(|(nym, guard)| (nym.clone(), (**guard).clone()))
            .collect()
    }

    /// Roll every held context back to a checkpoint
    pub fn restore(&mut self, checkpoint: Checkpoint) {
        for (nym, context) in checkpoint {
            if let Some(guard) = self.guards.get_mut(&nym) {
                **guard = context;
            }
        }
    }

    pub fn commit(self) -> Result<(), StoreError> {
        for guard in self.guards.into_values() {
            guard.commit()?;
        }
        Ok(())
    }
}
