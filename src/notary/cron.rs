// Cron execution - scheduled plan payments, offer matching, final receipts
//
// Each item is processed under the contexts of every nym it involves. The
// queue itself is only locked for single reads and writes, so an item can
// vanish between the snapshot of numbers and its turn; it is re-read once
// the contexts are held.

use crate::consensus::TransactionNumber;
use crate::cron::{CronItem, CronKind, CronStatus, OfferState, PlanState};
use crate::instrument::{MarketSide, TransactionFailure};
use crate::ledger::{Attachment, BoxItem, BoxItemKind, BoxKind, LedgerOwner};
use crate::notary::contexts::ContextSet;
use crate::notary::notarize::require_owner;
use crate::notary::server::Notary;
use crate::notary::NotaryError;
use std::collections::BTreeSet;
use tracing::{debug, info, warn};

/// Summary of one cron tick
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CronReport {
    pub processed: usize,
    pub payments: usize,
    pub failed_payments: usize,
    pub trades: usize,
    /// Items finalized during the tick
    pub expired: Vec<TransactionNumber>,
    pub errors: usize,
}

fn offer_state(item: &CronItem) -> Option<&OfferState> {
    match item.kind() {
        CronKind::MarketOffer(state) => Some(state),
        _ => None,
    }
}

fn record_fill(item: &mut CronItem, quantity: i64) {
    if let CronKind::MarketOffer(state) = item.kind_mut() {
        state.filled += quantity;
    }
}

/// Bid and ask in a market cross when the bid pays at least the ask
fn crosses(a: &OfferState, b: &OfferState) -> bool {
    match (a.offer.side, b.offer.side) {
        (MarketSide::Bid, MarketSide::Ask) => a.offer.price >= b.offer.price,
        (MarketSide::Ask, MarketSide::Bid) => b.offer.price >= a.offer.price,
        _ => false,
    }
}

fn is_live(state: &OfferState, now: i64) -> bool {
    !state.is_filled() && now >= state.offer.valid_from && now <= state.offer.valid_to
}

impl Notary {
    /// Run every active cron item once at time `now`
    pub async fn process_cron(&self, now: i64) -> CronReport {
        let mut report = CronReport::default();
        for number in self.cron.numbers() {
            if let Err(err) = self.run_cron_item(number, now, &mut report).await {
                warn!(item = number, error = %err, "cron item failed");
                report.errors += 1;
            }
            report.processed += 1;
        }

        self.record(|s| {
            s.cron_ticks += 1;
            s.cron_payments += report.payments as u64;
            s.cron_failed_payments += report.failed_payments as u64;
            s.cron_trades += report.trades as u64;
            s.cron_expired += report.expired.len() as u64;
        });
        if report.payments + report.trades + report.expired.len() + report.errors > 0 {
            info!(
                processed = report.processed,
                payments = report.payments,
                trades = report.trades,
                expired = report.expired.len(),
                errors = report.errors,
                "cron tick"
            );
        } else {
            debug!(processed = report.processed, "cron tick");
        }
        report
    }

    /// Run one cron item at `now`; `false` once it is no longer active
    pub async fn process_cron_item(&self, number: TransactionNumber, now: i64) -> Result<bool, NotaryError> {
        let mut report = CronReport::default();
        self.run_cron_item(number, now, &mut report).await
    }

    async fn run_cron_item(
        &self,
        number: TransactionNumber,
        now: i64,
        report: &mut CronReport,
    ) -> Result<bool, NotaryError> {
        let Some(item) = self.cron.get(number) else {
            return Ok(false);
        };
        let counter = self.find_counter(&item, now);
        let mut nyms = item.nyms();
        if let Some(counter) = &counter {
            nyms.extend(counter.nyms());
        }
        nyms.remove(self.nym());

        let guards = self.contexts.lock_many(self.nym(), &nyms).await?;
        let mut contexts = ContextSet::new(guards);

        // Cancellation may have won the race for the locks
        let Some(mut item) = self.cron.get(number) else {
            return Ok(false);
        };
        let counter = counter.and_then(|c| self.cron.get(c.number()));

        let keep = if matches!(item.kind(), CronKind::PaymentPlan(_)) {
            self.tick_plan(&contexts, &mut item, now, report).await?
        } else if matches!(item.kind(), CronKind::MarketOffer(_)) {
            self.tick_offer(&mut item, counter, now, report).await?
        } else {
            !item.is_past_valid_to(now)
        };

        if keep {
            item.refresh_status();
            self.cron.update(item)?;
        } else {
            item.set_status(CronStatus::Expired);
            self.finalize_cron_item(&mut contexts, &item).await?;
            report.expired.push(number);
        }
        contexts.commit()?;
        Ok(keep)
    }

    // ========================================================================
    // PAYMENT PLANS
    // ========================================================================

    async fn tick_plan(
        &self,
        contexts: &ContextSet,
        item: &mut CronItem,
        now: i64,
        report: &mut CronReport,
    ) -> Result<bool, NotaryError> {
        let opening = item.number();
        let CronKind::PaymentPlan(state) = item.kind_mut() else {
            return Ok(true);
        };

        let schedule = state.schedule(now);
        if schedule.expire {
            return Ok(false);
        }
        if let Some(amount) = schedule.initial {
            let paid = self.plan_payment(contexts, opening, state, amount, report).await;
            state.record_initial(paid, now);
        }
        if let Some(amount) = schedule.recurring {
            let paid = self.plan_payment(contexts, opening, state, amount, report).await;
            state.record_recurring(paid, now);
        }
        Ok(true)
    }

    async fn plan_payment(
        &self,
        contexts: &ContextSet,
        opening: TransactionNumber,
        state: &PlanState,
        amount: i64,
        report: &mut CronReport,
    ) -> bool {
        match self.pay_plan(contexts, opening, state, amount).await {
            Ok(()) => {
                report.payments += 1;
                debug!(item = opening, amount, "plan payment made");
                true
            }
            Err(failure) => {
                report.failed_payments += 1;
                debug!(item = opening, amount, %failure, "plan payment failed");
                false
            }
        }
    }

    async fn pay_plan(
        &self,
        contexts: &ContextSet,
        opening: TransactionNumber,
        state: &PlanState,
        amount: i64,
    ) -> Result<(), TransactionFailure> {
        let plan = &state.plan;
        if amount <= 0 {
            return Err(TransactionFailure::InvalidAmount(amount));
        }
        Self::verify_plan_numbers(contexts, opening, state)?;

        let (from, to) = (*plan.sender_account(), *plan.recipient_account());
        let mut accounts = self.wallet.lock_accounts(&BTreeSet::from([from, to])).await?;
        let (source, destination) = (accounts.get(&from)?, accounts.get(&to)?);
        require_owner(source, plan.sender())?;
        require_owner(destination, plan.recipient())?;
        if source.unit() != plan.unit() || destination.unit() != plan.unit() {
            return Err(TransactionFailure::UnitMismatch);
        }
        accounts.transfer(&from, &to, amount)?;

        let numbers = self.allocate_numbers(2).await?;
        let mut ledgers = self
            .wallet
            .lock_ledgers(vec![
                (BoxKind::Inbox, LedgerOwner::Account(from)),
                (BoxKind::Inbox, LedgerOwner::Account(to)),
            ])
            .await?;
        for (account, number) in [from, to].into_iter().zip(numbers) {
            let receipt = self.sign_receipt(
                BoxItem::new(BoxItemKind::PaymentReceipt, number, opening)
                    .with_amount(amount)
                    .with_from(plan.sender().clone(), Some(from))
                    .with_to_account(to),
            );
            ledgers.get_mut(BoxKind::Inbox, &LedgerOwner::Account(account))?.add(receipt)?;
        }

        accounts.commit()?;
        ledgers.commit()?;
        Ok(())
    }

    /// Both parties must still hold the plan's numbers and list it as open
    fn verify_plan_numbers(
        contexts: &ContextSet,
        opening: TransactionNumber,
        state: &PlanState,
    ) -> Result<(), TransactionFailure> {
        let plan = &state.plan;
        let held = [
            (plan.sender(), vec![opening, state.sender_closing]),
            (plan.recipient(), vec![plan.recipient_closing()]),
        ];
        for (nym, numbers) in held {
            let context = contexts.get(nym)?;
            if !context.open_cron_items().contains(&opening) {
                return Err(TransactionFailure::CronItemNotFound(opening));
            }
            if let Some(number) = numbers.into_iter().find(|n| !context.verify_issued_number(*n)) {
                return Err(TransactionFailure::TransactionNumberInvalid(number));
            }
        }
        Ok(())
    }

    // ========================================================================
    // MARKET OFFERS
    // ========================================================================

    /// Best live offer on the other side of `item`'s market, if prices cross
    fn find_counter(&self, item: &CronItem, now: i64) -> Option<CronItem> {
        let state = offer_state(item)?;
        if !is_live(state, now) {
            return None;
        }
        self.cron
            .offers_in(state.offer.market())
            .into_iter()
            .filter(|candidate| candidate.number() != item.number())
            .filter(|candidate| {
                offer_state(candidate).is_some_and(|other| {
                    other.offer.owner != state.offer.owner && is_live(other, now) && crosses(state, other)
                })
            })
            .min_by_key(|candidate| {
                let price = offer_state(candidate).map(|o| o.offer.price).unwrap_or_default();
                let rank = match state.offer.side {
                    MarketSide::Bid => price,
                    MarketSide::Ask => -price,
                };
                (rank, candidate.number())
            })
    }

    async fn tick_offer(
        &self,
        item: &mut CronItem,
        counter: Option<CronItem>,
        now: i64,
        report: &mut CronReport,
    ) -> Result<bool, NotaryError> {
        let Some(state) = offer_state(item) else {
            return Ok(true);
        };
        if state.is_filled() || now > state.offer.valid_to {
            return Ok(false);
        }
        if now < state.offer.valid_from {
            return Ok(true);
        }

        if let Some(mut counter) = counter {
            match self.trade(item, &mut counter).await {
                Ok(_) => {
                    report.trades += 1;
                    counter.refresh_status();
                    self.cron.update(counter)?;
                }
                Err(failure) => debug!(item = item.number(), counter = counter.number(), %failure, "trade failed"),
            }
        }
        Ok(offer_state(item).is_some_and(|state| !state.is_filled()))
    }

    /// Trade between two crossing offers at the older offer's price
    async fn trade(&self, item: &mut CronItem, counter: &mut CronItem) -> Result<i64, TransactionFailure> {
        let not_offer = || TransactionFailure::CorruptedState("cron item is not a market offer".to_string());
        let mine = offer_state(item).cloned().ok_or_else(not_offer)?;
        let theirs = offer_state(counter).cloned().ok_or_else(not_offer)?;
        if !crosses(&mine, &theirs) {
            return Err(TransactionFailure::AgreementInvalid("offers no longer cross".to_string()));
        }
        let ((bid, bid_number), (ask, ask_number)) = match mine.offer.side {
            MarketSide::Bid => ((&mine, item.number()), (&theirs, counter.number())),
            MarketSide::Ask => ((&theirs, counter.number()), (&mine, item.number())),
        };

        let quantity = bid.remaining().min(ask.remaining());
        if !bid.accepts(quantity) || !ask.accepts(quantity) {
            return Err(TransactionFailure::AgreementInvalid("no quantity both offers accept".to_string()));
        }
        let price = if bid_number < ask_number { bid.offer.price } else { ask.offer.price };
        let currency = (quantity / bid.offer.scale)
            .checked_mul(price)
            .ok_or(TransactionFailure::InvalidAmount(price))?;

        let ids = BTreeSet::from([
            ask.offer.asset_account,
            bid.offer.asset_account,
            bid.offer.currency_account,
            ask.offer.currency_account,
        ]);
        let mut accounts = self.wallet.lock_accounts(&ids).await?;
        accounts.transfer(&ask.offer.asset_account, &bid.offer.asset_account, quantity)?;
        accounts.transfer(&bid.offer.currency_account, &ask.offer.currency_account, currency)?;

        let legs = [
            (ask.offer.asset_account, ask_number, -quantity),
            (bid.offer.asset_account, bid_number, quantity),
            (bid.offer.currency_account, bid_number, -currency),
            (ask.offer.currency_account, ask_number, currency),
        ];
        let numbers = self.allocate_numbers(legs.len()).await?;
        let mut ledgers = self
            .wallet
            .lock_ledgers(
                legs.iter()
                    .map(|(account, _, _)| (BoxKind::Inbox, LedgerOwner::Account(*account)))
                    .collect(),
            )
            .await?;
        for ((account, offer_number, amount), number) in legs.into_iter().zip(numbers) {
            let receipt = self.sign_receipt(
                BoxItem::new(BoxItemKind::MarketReceipt, number, offer_number)
                    .with_amount(amount)
                    .with_to_account(account),
            );
            ledgers.get_mut(BoxKind::Inbox, &LedgerOwner::Account(account))?.add(receipt)?;
        }

        accounts.commit()?;
        ledgers.commit()?;
        info!(bid = bid_number, ask = ask_number, quantity, price, "offers traded");

        record_fill(item, quantity);
        record_fill(counter, quantity);
        Ok(quantity)
    }

    // ========================================================================
    // FINALIZATION
    // ========================================================================

    /// Remove an item from cron, issuing its final receipts: one to the
    /// activator's nymbox for the opening number and one to each party
    /// account's inbox for that party's closing number
    pub(crate) async fn finalize_cron_item(&self, contexts: &mut ContextSet, item: &CronItem) -> Result<(), NotaryError> {
        let parties = item.parties();
        let mut numbers = self.allocate_numbers(parties.len() + 1).await?.into_iter();
        let mut next = || {
            numbers
                .next()
                .ok_or_else(|| NotaryError::Rejected("receipt numbers exhausted".to_string()))
        };

        let activator = LedgerOwner::Nym(item.activator().clone());
        let mut wanted = vec![(BoxKind::Nymbox, activator.clone())];
        wanted.extend(
            parties
                .iter()
                .map(|p| (BoxKind::Inbox, LedgerOwner::Account(p.account))),
        );
        let mut ledgers = self.wallet.lock_ledgers(wanted).await?;

        let note = format!("{} {:?}", item.kind_name(), item.status());
        let opening = self.sign_receipt(
            BoxItem::new(BoxItemKind::FinalReceipt, next()?, item.number())
                .with_closing_numbers(BTreeSet::from([item.number()]))
                .with_attachment(Attachment::Note(note.clone())),
        );
        ledgers.get_mut(BoxKind::Nymbox, &activator)?.add(opening)?;

        for party in &parties {
            let receipt = self.sign_receipt(
                BoxItem::new(BoxItemKind::FinalReceipt, next()?, item.number())
                    .with_from(party.nym.clone(), Some(party.account))
                    .with_closing_numbers(BTreeSet::from([party.closing]))
                    .with_attachment(Attachment::Note(note.clone())),
            );
            ledgers
                .get_mut(BoxKind::Inbox, &LedgerOwner::Account(party.account))?
                .add(receipt)?;
        }

        for nym in item.nyms() {
            if let Ok(context) = contexts.get_mut(&nym) {
                context.close_cron_item(item.number())?;
            }
        }
        ledgers.commit()?;
        self.cron.remove(item.number())?;

        info!(item = item.number(), kind = item.kind_name(), status = ?item.status(), "cron item finalized");
        Ok(())
    }
}
