// Transaction statement - signed affidavit of the numbers a nym holds at a
// notary at one point in time. Carried inside balance agreements and in
// the blank notices that deliver fresh numbers.

use crate::consensus::TransactionNumber;
use crate::identity::{Document, Keypair, NotaryId, NymId, Signed};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionStatement {
    notary: NotaryId,
    nym: NymId,
    issued: BTreeSet<TransactionNumber>,
    available: BTreeSet<TransactionNumber>,
}

pub type SignedStatement = Signed<TransactionStatement>;

impl Document for TransactionStatement {
    const DOMAIN: &'static [u8] = b"otx:statement:";
}

impl TransactionStatement {
    pub fn new(
        notary: NotaryId,
        nym: NymId,
        issued: BTreeSet<TransactionNumber>,
        available: BTreeSet<TransactionNumber>,
    ) -> Self {
        Self {
            notary,
            nym,
            issued,
            available,
        }
    }

    pub fn notary(&self) -> &NotaryId {
        &self.notary
    }

    pub fn nym(&self) -> &NymId {
        &self.nym
    }

    pub fn issued(&self) -> &BTreeSet<TransactionNumber> {
        &self.issued
    }

    pub fn available(&self) -> &BTreeSet<TransactionNumber> {
        &self.available
    }

    /// Sign the statement as its nym
    pub fn sign(self, keypair: &Keypair) -> SignedStatement {
        Signed::sign(self, keypair)
    }
}
