// Cheque - a signed order to pay drawn on one account
//
// The drawer reserves one of its transaction numbers for the cheque; the
// notary refuses the cheque once that number is no longer available.
// Vouchers are cheques the notary itself draws on a voucher account.

use crate::consensus::TransactionNumber;
use crate::identity::{AccountId, Document, NotaryId, NymId, Signed, UnitId};
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cheque {
    notary: NotaryId,
    unit: UnitId,
    drawer: NymId,
    drawer_account: AccountId,
    /// `None` makes the cheque payable to bearer
    recipient: Option<NymId>,
    /// Who bought the voucher, for notary-drawn cheques
    remitter: Option<NymId>,
    amount: i64,
    number: TransactionNumber,
    valid_from: i64,
    valid_to: i64,
    memo: String,
}

impl Document for Cheque {
    const DOMAIN: &'static [u8] = b"otx:cheque:";
}

pub type SignedCheque = Signed<Cheque>;

impl Cheque {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        notary: NotaryId,
        unit: UnitId,
        drawer: NymId,
        drawer_account: AccountId,
        recipient: Option<NymId>,
        amount: i64,
        number: TransactionNumber,
        valid_from: i64,
        valid_to: i64,
    ) -> Self {
        Self {
            notary,
            unit,
            drawer,
            drawer_account,
            recipient,
            remitter: None,
            amount,
            number,
            valid_from,
            valid_to,
            memo: String::new(),
        }
    }

    pub fn with_memo(mut self, memo: impl Into<String>) -> Self {
        self.memo = memo.into();
        self
    }

    pub fn with_remitter(mut self, remitter: NymId) -> Self {
        self.remitter = Some(remitter);
        self
    }

    pub fn notary(&self) -> &NotaryId {
        &self.notary
    }

    pub fn unit(&self) -> &UnitId {
        &self.unit
    }

    pub fn drawer(&self) -> &NymId {
        &self.drawer
    }

    pub fn drawer_account(&self) -> &AccountId {
        &self.drawer_account
    }

    pub fn recipient(&self) -> Option<&NymId> {
        self.recipient.as_ref()
    }

    pub fn remitter(&self) -> Option<&NymId> {
        self.remitter.as_ref()
    }

    pub fn amount(&self) -> i64 {
        self.amount
    }

    pub fn number(&self) -> TransactionNumber {
        self.number
    }

    pub fn memo(&self) -> &str {
        &self.memo
    }

    pub fn valid_from(&self) -> i64 {
        self.valid_from
    }

    pub fn valid_to(&self) -> i64 {
        self.valid_to
    }

    /// Inside the validity window at `now`
    pub fn is_valid_at(&self, now: i64) -> bool {
        now >= self.valid_from && now <= self.valid_to
    }

    /// `nym` may deposit this cheque
    pub fn payable_to(&self, nym: &NymId) -> bool {
        self.recipient.as_ref().map_or(true, |r| r == nym)
    }
}
