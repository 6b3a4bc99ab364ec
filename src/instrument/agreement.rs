// Agreements - multi-party instruments the notary runs on its cron queue
//
// A payment plan is proposed and signed by the recipient (the merchant) and
// activated by the sender, whose transaction covers the recipient's
// signature. Market offers belong to one nym. Smart contracts are endorsed
// by every party.

use crate::consensus::TransactionNumber;
use crate::identity::{AccountId, Document, NotaryId, NymId, Signed, UnitId};
use serde::{Deserialize, Serialize};

// ============================================================================
// PAYMENT PLAN
// ============================================================================

/// Recurring part of a payment plan
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecurringPayment {
    pub amount: i64,
    /// Seconds after activation before the first payment is due
    pub delay: i64,
    /// Seconds between payments
    pub interval: i64,
    /// Seconds after activation the plan stays alive; zero for no limit
    pub length: i64,
    /// Zero for no limit
    pub max_payments: u32,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentPlan {
    notary: NotaryId,
    unit: UnitId,
    sender: NymId,
    sender_account: AccountId,
    recipient: NymId,
    recipient_account: AccountId,
    /// Closing number the recipient reserved for this plan
    recipient_closing: TransactionNumber,
    /// Amount and delay (seconds after activation) of a one-off first payment
    initial: Option<(i64, i64)>,
    recurring: Option<RecurringPayment>,
    valid_from: i64,
    valid_to: i64,
    memo: String,
}

impl Document for PaymentPlan {
    const DOMAIN: &'static [u8] = b"otx:plan:";
}

pub type SignedPlan = Signed<PaymentPlan>;

impl PaymentPlan {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        notary: NotaryId,
        unit: UnitId,
        sender: NymId,
        sender_account: AccountId,
        recipient: NymId,
        recipient_account: AccountId,
        recipient_closing: TransactionNumber,
        valid_from: i64,
        valid_to: i64,
    ) -> Self {
        Self {
            notary,
            unit,
            sender,
            sender_account,
            recipient,
            recipient_account,
            recipient_closing,
            initial: None,
            recurring: None,
            valid_from,
            valid_to,
            memo: String::new(),
        }
    }

    pub fn with_initial_payment(mut self, amount: i64, delay: i64) -> Self {
        self.initial = Some((amount, delay));
        self
    }

    pub fn with_recurring(mut self, recurring: RecurringPayment) -> Self {
        self.recurring = Some(recurring);
        self
    }

    pub fn with_memo(mut self, memo: impl Into<String>) -> Self {
        self.memo = memo.into();
        self
    }

    pub fn notary(&self) -> &NotaryId {
        &self.notary
    }

    pub fn unit(&self) -> &UnitId {
        &self.unit
    }

    pub fn sender(&self) -> &NymId {
        &self.sender
    }

    pub fn sender_account(&self) -> &AccountId {
        &self.sender_account
    }

    pub fn recipient(&self) -> &NymId {
        &self.recipient
    }

    pub fn recipient_account(&self) -> &AccountId {
        &self.recipient_account
    }

    pub fn recipient_closing(&self) -> TransactionNumber {
        self.recipient_closing
    }

    pub fn initial_payment(&self) -> Option<(i64, i64)> {
        self.initial
    }

    pub fn recurring(&self) -> Option<&RecurringPayment> {
        self.recurring.as_ref()
    }

    pub fn valid_from(&self) -> i64 {
        self.valid_from
    }

    pub fn valid_to(&self) -> i64 {
        self.valid_to
    }

    /// Something to pay, and nothing negative
    pub fn is_well_formed(&self) -> bool {
        let initial_ok = self.initial.map_or(true, |(amount, delay)| amount > 0 && delay >= 0);
        let recurring_ok = self.recurring.as_ref().map_or(true, |r| {
            r.amount > 0 && r.delay >= 0 && r.interval > 0 && r.length >= 0
        });
        initial_ok
            && recurring_ok
            && (self.initial.is_some() || self.recurring.is_some())
            && self.sender_account != self.recipient_account
            && self.valid_from <= self.valid_to
    }
}

/// What the submitter of a payment plan wants done with it
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum PlanAction {
    Activate,
    /// Submit the plan so that it fails, burning the submitter's numbers
    /// and telling the counterparty to recover theirs
    Cancel,
}

// ============================================================================
// MARKET OFFER
// ============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum MarketSide {
    /// Buy the asset, paying currency
    Bid,
    /// Sell the asset for currency
    Ask,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarketOffer {
    pub notary: NotaryId,
    pub owner: NymId,
    pub asset_unit: UnitId,
    pub currency_unit: UnitId,
    pub asset_account: AccountId,
    pub currency_account: AccountId,
    /// Assets trade in lots of this size; `price` is per lot
    pub scale: i64,
    pub side: MarketSide,
    pub price: i64,
    pub total_assets: i64,
    /// Smallest number of assets a single trade may move
    pub minimum_increment: i64,
    pub closing_asset: TransactionNumber,
    pub closing_currency: TransactionNumber,
    pub valid_from: i64,
    pub valid_to: i64,
}

impl MarketOffer {
    pub fn is_well_formed(&self) -> bool {
        self.scale > 0
            && self.price > 0
            && self.total_assets > 0
            && self.minimum_increment > 0
            && self.minimum_increment <= self.total_assets
            && self.total_assets % self.scale == 0
            && self.minimum_increment % self.scale == 0
            && self.asset_unit != self.currency_unit
            && self.closing_asset != self.closing_currency
            && self.valid_from <= self.valid_to
    }

    /// Market key: offers only ever match inside one market
    pub fn market(&self) -> (UnitId, UnitId, i64) {
        (self.asset_unit, self.currency_unit, self.scale)
    }
}

// ============================================================================
// SMART CONTRACT
// ============================================================================

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContractParty {
    pub nym: NymId,
    pub account: AccountId,
    pub closing_number: TransactionNumber,
}

/// Held agreement between parties; the notary keeps it until it expires or
/// is cancelled and then hands every party a final receipt
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SmartContract {
    pub notary: NotaryId,
    pub parties: Vec<ContractParty>,
    pub terms: String,
    pub valid_from: i64,
    pub valid_to: i64,
}

impl Document for SmartContract {
    const DOMAIN: &'static [u8] = b"otx:contract:";
}

pub type SignedContract = Signed<SmartContract>;

impl SmartContract {
    pub fn party(&self, nym: &NymId) -> Option<&ContractParty> {
        self.parties.iter().find(|p| &p.nym == nym)
    }

    pub fn is_well_formed(&self) -> bool {
        let mut nyms = std::collections::BTreeSet::new();
        !self.parties.is_empty()
            && self.parties.iter().all(|p| nyms.insert(p.nym.clone()))
            && self.valid_from <= self.valid_to
    }
}

// ============================================================================
// BASKETS
// ============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum BasketDirection {
    /// Hand in components, receive basket units
    In,
    /// Hand in basket units, receive components
    Out,
}
