// Transaction numbers - the single-use capability tokens a nym spends to
// authorize ledger-mutating operations
//
// A number held by a context is in exactly one state:
// - tentative: offered by the notary, not yet accepted
// - available: issued and not yet used to open a transaction
// - issued: used to open a transaction that has not closed yet
// Numbers in none of the sets were never held or are consumed.

use crate::consensus::ConsensusError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

pub type TransactionNumber = u64;
pub type RequestNumber = u64;

/// Where a number sits in its lifecycle
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NumberState {
    Tentative,
    Available,
    Issued,
    NotHeld,
}

/// Number sets of one context
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionNumberLedger {
    /// Every number issued and not yet closed (includes `available`)
    issued: BTreeSet<TransactionNumber>,
    available: BTreeSet<TransactionNumber>,
    tentative: BTreeSet<TransactionNumber>,
    /// Request numbers whose replies have been seen
    acknowledged: BTreeSet<RequestNumber>,
}

impl TransactionNumberLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn issued(&self) -> &BTreeSet<TransactionNumber> {
        &self.issued
    }

    pub fn available(&self) -> &BTreeSet<TransactionNumber> {
        &self.available
    }

    pub fn tentative(&self) -> &BTreeSet<TransactionNumber> {
        &self.tentative
    }

    pub fn acknowledged(&self) -> &BTreeSet<RequestNumber> {
        &self.acknowledged
    }

    /// Current lifecycle state of a number
    pub fn state(&self, number: TransactionNumber) -> NumberState {
        if self.available.contains(&number) {
            NumberState::Available
        } else if self.issued.contains(&number) {
            NumberState::Issued
        } else if self.tentative.contains(&number) {
            NumberState::Tentative
        } else {
            NumberState::NotHeld
        }
    }

    pub fn verify_issued(&self, number: TransactionNumber) -> bool {
        self.issued.contains(&number)
    }

    pub fn verify_available(&self, number: TransactionNumber) -> bool {
        self.available.contains(&number)
    }

    /// Issue a number: it becomes issued and available
    pub fn issue(&mut self, number: TransactionNumber) -> Result<(), ConsensusError> {
        if self.issued.contains(&number) {
            return Err(ConsensusError::NumberAlreadyIssued(number));
        }
        self.tentative.remove(&number);
        self.issued.insert(number);
        self.available.insert(number);
        Ok(())
    }

    /// Use a number to open a transaction; it stays issued until closed
    pub fn consume_available(&mut self, number: TransactionNumber) -> Result<(), ConsensusError> {
        if !self.available.remove(&number) {
            return Err(ConsensusError::NumberNotFound(number));
        }
        Ok(())
    }

    /// Close a number for good
    pub fn consume_issued(&mut self, number: TransactionNumber) -> Result<(), ConsensusError> {
        if !self.issued.remove(&number) {
            return Err(ConsensusError::NumberNotFound(number));
        }
        self.available.remove(&number);
        Ok(())
    }

    /// Return an opened-but-unsent number to the available set
    pub fn recover_available(&mut self, number: TransactionNumber) -> Result<(), ConsensusError> {
        if !self.issued.contains(&number) || self.available.contains(&number) {
            return Err(ConsensusError::NumberNotFound(number));
        }
        self.available.insert(number);
        Ok(())
    }

    /// Record a number the notary has offered but we have not accepted
    pub fn add_tentative(&mut self, number: TransactionNumber) -> Result<(), ConsensusError> {
        if self.issued.contains(&number) {
            return Err(ConsensusError::NumberAlreadyIssued(number));
        }
        self.tentative.insert(number);
        Ok(())
    }

    pub fn remove_tentative(&mut self, number: TransactionNumber) -> bool {
        self.tentative.remove(&number)
    }

    /// Accept a set of offered numbers, all or nothing.
    ///
    /// Every number must already be known (tentative or issued). Returns the
    /// numbers that moved from tentative to issued.
    pub fn accept_issued(
        &mut self,
        numbers: &BTreeSet<TransactionNumber>,
    ) -> Result<BTreeSet<TransactionNumber>, ConsensusError> {
        let unknown: Vec<TransactionNumber> = numbers
            .iter()
            .filter(|n| !self.tentative.contains(n) && !self.issued.contains(n))
            .copied()
            .collect();
        if !unknown.is_empty() {
            return Err(ConsensusError::UnknownNumbers(unknown));
        }

        let mut added = BTreeSet::new();
        for number in numbers {
            if self.tentative.remove(number) {
                self.issued.insert(*number);
                self.available.insert(*number);
                added.insert(*number);
            }
        }
        Ok(added)
    }

    pub fn add_acknowledged(&mut self, request: RequestNumber) {
        self.acknowledged.insert(request);
    }

    /// Drop acknowledgements the other side has confirmed
    pub fn remove_acknowledged(&mut self, requests: &BTreeSet<RequestNumber>) {
        self.acknowledged.retain(|r| !requests.contains(r));
    }

    /// Replace the acknowledged set with the counterparty's list
    pub fn set_acknowledged(&mut self, requests: BTreeSet<RequestNumber>) {
        self.acknowledged = requests;
    }
}
