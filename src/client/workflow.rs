// Payment workflows - the sender's view of an outgoing cheque or transfer

use crate::consensus::TransactionNumber;
use crate::identity::{AccountId, NymId};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WorkflowError {
    #[error("Workflow {number} cannot move from {from:?} to {to:?}")]
    InvalidTransition {
        number: TransactionNumber,
        from: WorkflowState,
        to: WorkflowState,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkflowState {
    /// Created locally, not yet handed to anyone
    Unsent,
    /// Cheque handed to its recipient
    Conveyed,
    /// Transfer accepted by the notary
    Acknowledged,
    /// The counterparty took the funds
    Accepted,
    /// Our inbox receipt for it has been processed
    Completed,
    Failed,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum PaymentKind {
    Cheque,
    Transfer,
}

/// One outgoing payment, keyed by the transaction number it uses
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentWorkflow {
    kind: PaymentKind,
    number: TransactionNumber,
    account: AccountId,
    amount: i64,
    recipient: Option<NymId>,
    state: WorkflowState,
    /// Every state entered, with the time it was entered
    history: Vec<(WorkflowState, i64)>,
}

impl PaymentWorkflow {
    pub fn cheque(number: TransactionNumber, account: AccountId, amount: i64, recipient: Option<NymId>, now: i64) -> Self {
        Self::new(PaymentKind::Cheque, number, account, amount, recipient, now)
    }

    pub fn transfer(number: TransactionNumber, account: AccountId, amount: i64, now: i64) -> Self {
        Self::new(PaymentKind::Transfer, number, account, amount, None, now)
    }

    fn new(
        kind: PaymentKind,
        number: TransactionNumber,
        account: AccountId,
        amount: i64,
        recipient: Option<NymId>,
        now: i64,
    ) -> Self {
        Self {
            kind,
            number,
            account,
            amount,
            recipient,
            state: WorkflowState::Unsent,
            history: vec![(WorkflowState::Unsent, now)],
        }
    }

    pub fn kind(&self) -> PaymentKind {
        self.kind
    }

    pub fn number(&self) -> TransactionNumber {
        self.number
    }

    pub fn account(&self) -> &AccountId {
        &self.account
    }

    pub fn amount(&self) -> i64 {
        self.amount
    }

    pub fn recipient(&self) -> Option<&NymId> {
        self.recipient.as_ref()
    }

    pub fn state(&self) -> WorkflowState {
        self.state
    }

    pub fn history(&self) -> &[(WorkflowState, i64)] {
        &self.history
    }

    fn allows(&self, to: WorkflowState) -> bool {
        use WorkflowState::*;
        match self.kind {
            PaymentKind::Cheque => matches!(
                (self.state, to),
                (Unsent, Conveyed) | (Conveyed, Accepted) | (Accepted, Completed) | (Unsent | Conveyed, Failed)
            ),
            PaymentKind::Transfer => matches!(
                (self.state, to),
                (Unsent, Acknowledged) | (Acknowledged, Accepted) | (Accepted, Completed) | (Unsent, Failed)
            ),
        }
    }

    /// Move to `to` if the workflow's kind allows it from the current state
    pub fn advance(&mut self, to: WorkflowState, now: i64) -> Result<(), WorkflowError> {
        if !self.allows(to) {
            return Err(WorkflowError::InvalidTransition {
                number: self.number,
                from: self.state,
                to,
            });
        }
        self.state = to;
        self.history.push((to, now));
        Ok(())
    }

    pub fn is_finished(&self) -> bool {
        matches!(self.state, WorkflowState::Completed | WorkflowState::Failed)
    }
}
