// Cron items - one scheduled agreement and its processing history

use crate::consensus::TransactionNumber;
use crate::identity::{AccountId, NymId, UnitId};
use crate::instrument::{MarketOffer, PaymentPlan, SmartContract};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum CronStatus {
    /// Activated, nothing attempted yet
    Confirmed,
    /// A configured initial payment has not gone through yet
    ProcessingInitial,
    ProcessingRecurring,
    Expired,
    Cancelled,
}

impl CronStatus {
    pub fn is_final(&self) -> bool {
        matches!(self, CronStatus::Expired | CronStatus::Cancelled)
    }
}

/// A party's stake in a cron item: the account it touches and the closing
/// number that account's final receipt will close
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CronParty {
    pub nym: NymId,
    pub account: AccountId,
    pub closing: TransactionNumber,
}

// ============================================================================
// PAYMENT PLAN STATE
// ============================================================================

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanState {
    pub plan: PaymentPlan,
    pub sender_closing: TransactionNumber,
    pub initial_paid: bool,
    pub done: u32,
    pub failed: u32,
    pub last_payment: Option<i64>,
}

/// What one tick should do with a payment plan
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PlanSchedule {
    pub expire: bool,
    pub initial: Option<i64>,
    pub recurring: Option<i64>,
}

impl PlanState {
    pub fn new(plan: PaymentPlan, sender_closing: TransactionNumber) -> Self {
        Self {
            plan,
            sender_closing,
            initial_paid: false,
            done: 0,
            failed: 0,
            last_payment: None,
        }
    }

    /// Schedule times count from the plan's `valid_from`
    fn anchor(&self) -> i64 {
        self.plan.valid_from()
    }

    fn initial_outstanding(&self) -> bool {
        self.plan.initial_payment().is_some() && !self.initial_paid
    }

    fn recurring_finished(&self) -> bool {
        match self.plan.recurring() {
            None => true,
            Some(r) => r.max_payments > 0 && self.done >= r.max_payments,
        }
    }

    fn out_of_time(&self, now: i64) -> bool {
        if now > self.plan.valid_to() {
            return true;
        }
        match self.plan.recurring() {
            Some(r) if r.length > 0 => now >= self.anchor() + r.length,
            _ => false,
        }
    }

    /// Decide what is due at `now`
    pub fn schedule(&self, now: i64) -> PlanSchedule {
        let finished = !self.initial_outstanding() && self.recurring_finished();
        if finished || self.out_of_time(now) {
            return PlanSchedule {
                expire: true,
                initial: None,
                recurring: None,
            };
        }

        let initial = match self.plan.initial_payment() {
            Some((amount, delay)) if !self.initial_paid && now >= self.anchor() + delay => Some(amount),
            _ => None,
        };
        let recurring = match self.plan.recurring() {
            Some(r) if !self.recurring_finished() => {
                let due = self.anchor() + r.delay + i64::from(self.done) * r.interval;
                (now >= due).then_some(r.amount)
            }
            _ => None,
        };

        PlanSchedule {
            expire: false,
            initial,
            recurring,
        }
    }

    pub fn record_initial(&mut self, paid: bool, now: i64) {
        if paid {
            self.initial_paid = true;
            self.last_payment = Some(now);
        } else {
            self.failed += 1;
        }
    }

    pub fn record_recurring(&mut self, paid: bool, now: i64) {
        if paid {
            self.done += 1;
            self.last_payment = Some(now);
        } else {
            self.failed += 1;
        }
    }

    fn status(&self) -> CronStatus {
        if self.initial_outstanding() {
            CronStatus::ProcessingInitial
        } else {
            CronStatus::ProcessingRecurring
        }
    }
}

// ============================================================================
// MARKET OFFER AND SMART CONTRACT STATE
// ============================================================================

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OfferState {
    pub offer: MarketOffer,
    pub filled: i64,
}

impl OfferState {
    pub fn remaining(&self) -> i64 {
        self.offer.total_assets - self.filled
    }

    pub fn is_filled(&self) -> bool {
        self.remaining() <= 0
    }

    /// Can a trade of `quantity` assets touch this offer?
    pub fn accepts(&self, quantity: i64) -> bool {
        quantity > 0
            && quantity <= self.remaining()
            && (quantity >= self.offer.minimum_increment || quantity == self.remaining())
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContractState {
    pub contract: SmartContract,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum CronKind {
    PaymentPlan(PlanState),
    MarketOffer(OfferState),
    SmartContract(ContractState),
}

// ============================================================================
// CRON ITEM
// ============================================================================

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CronItem {
    /// Opening transaction number of the activator; also the item's id
    number: TransactionNumber,
    activator: NymId,
    activated_at: i64,
    status: CronStatus,
    kind: CronKind,
}

impl CronItem {
    pub fn payment_plan(number: TransactionNumber, plan: PaymentPlan, sender_closing: TransactionNumber, now: i64) -> Self {
        Self {
            number,
            activator: plan.sender().clone(),
            activated_at: now,
            status: CronStatus::Confirmed,
            kind: CronKind::PaymentPlan(PlanState::new(plan, sender_closing)),
        }
    }

    pub fn market_offer(number: TransactionNumber, offer: MarketOffer, now: i64) -> Self {
        Self {
            number,
            activator: offer.owner.clone(),
            activated_at: now,
            status: CronStatus::Confirmed,
            kind: CronKind::MarketOffer(OfferState { offer, filled: 0 }),
        }
    }

    pub fn smart_contract(number: TransactionNumber, activator: NymId, contract: SmartContract, now: i64) -> Self {
        Self {
            number,
            activator,
            activated_at: now,
            status: CronStatus::Confirmed,
            kind: CronKind::SmartContract(ContractState { contract }),
        }
    }

    pub fn number(&self) -> TransactionNumber {
        self.number
    }

    pub fn activator(&self) -> &NymId {
        &self.activator
    }

    pub fn activated_at(&self) -> i64 {
        self.activated_at
    }

    pub fn status(&self) -> CronStatus {
        self.status
    }

    pub fn kind(&self) -> &CronKind {
        &self.kind
    }

    pub fn kind_mut(&mut self) -> &mut CronKind {
        &mut self.kind
    }

    pub fn kind_name(&self) -> &'static str {
        match self.kind {
            CronKind::PaymentPlan(_) => "payment_plan",
            CronKind::MarketOffer(_) => "market_offer",
            CronKind::SmartContract(_) => "smart_contract",
        }
    }

    pub fn set_status(&mut self, status: CronStatus) {
        self.status = status;
    }

    /// Refresh the processing status after a tick
    pub fn refresh_status(&mut self) {
        if self.status.is_final() {
            return;
        }
        self.status = match &self.kind {
            CronKind::PaymentPlan(state) => state.status(),
            _ => CronStatus::ProcessingRecurring,
        };
    }

    /// Every account touched, with the closing number its final receipt closes
    pub fn parties(&self) -> Vec<CronParty> {
        match &self.kind {
            CronKind::PaymentPlan(state) => vec![
                CronParty {
                    nym: state.plan.sender().clone(),
                    account: *state.plan.sender_account(),
                    closing: state.sender_closing,
                },
                CronParty {
                    nym: state.plan.recipient().clone(),
                    account: *state.plan.recipient_account(),
                    closing: state.plan.recipient_closing(),
                },
            ],
            CronKind::MarketOffer(state) => vec![
                CronParty {
                    nym: state.offer.owner.clone(),
                    account: state.offer.asset_account,
                    closing: state.offer.closing_asset,
                },
                CronParty {
                    nym: state.offer.owner.clone(),
                    account: state.offer.currency_account,
                    closing: state.offer.closing_currency,
                },
            ],
            CronKind::SmartContract(state) => state
                .contract
                .parties
                .iter()
                .map(|p| CronParty {
                    nym: p.nym.clone(),
                    account: p.account,
                    closing: p.closing_number,
                })
                .collect(),
        }
    }

    /// Every nym with a stake in the item, activator included
    pub fn nyms(&self) -> BTreeSet<NymId> {
        let mut nyms: BTreeSet<NymId> = self.parties().into_iter().map(|p| p.nym).collect();
        nyms.insert(self.activator.clone());
        nyms
    }

    pub fn involves(&self, nym: &NymId) -> bool {
        self.nyms().contains(nym)
    }

    /// Past the agreement's validity window
    pub fn is_past_valid_to(&self, now: i64) -> bool {
        let valid_to = match &self.kind {
            CronKind::PaymentPlan(state) => state.plan.valid_to(),
            CronKind::MarketOffer(state) => state.offer.valid_to,
            CronKind::SmartContract(state) => state.contract.valid_to,
        };
        now > valid_to
    }

    /// Market this item trades in, for market offers
    pub fn market(&self) -> Option<(UnitId, UnitId, i64)> {
        match &self.kind {
            CronKind::MarketOffer(state) => Some(state.offer.market()),
            _ => None,
        }
    }
}
