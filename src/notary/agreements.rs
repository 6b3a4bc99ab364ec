// Cron-backed agreements - payment plans, market offers, smart contracts
//
// Activation opens the transaction number as the item's opening number and
// consumes every party's closing number. Nothing moves until cron runs.

use crate::consensus::TransactionNumber;
use crate::cron::{CronItem, CronStatus};
use crate::identity::{AccountId, NymId, UnitId};
use crate::instrument::{MarketOffer, SignedContract, SignedPlan, SignedTransaction, SmartContract, TransactionFailure};
use crate::ledger::{Account, Attachment, BoxItem, BoxItemKind, BoxKind, LedgerError, LedgerOwner};
use crate::notary::contexts::ContextSet;
use crate::notary::notarize::{verify_balance_agreement, Applied};
use crate::notary::server::Notary;
use crate::notary::NotaryError;
use std::collections::BTreeSet;
use tracing::info;

fn invalid(reason: impl Into<String>) -> TransactionFailure {
    TransactionFailure::AgreementInvalid(reason.into())
}

impl Notary {
    /// Snapshot of an account that must belong to `owner` and hold `unit`
    async fn party_account(&self, id: &AccountId, owner: &NymId, unit: &UnitId) -> Result<Account, TransactionFailure> {
        let account = self
            .wallet
            .account(id)
            .await?
            .ok_or(TransactionFailure::AccountNotFound(*id))?;
        if account.owner() != owner {
            return Err(TransactionFailure::NotOwner);
        }
        if account.unit() != unit {
            return Err(TransactionFailure::UnitMismatch);
        }
        Ok(account)
    }

    fn check_cron_capacity(&self, nym: &NymId) -> Result<(), TransactionFailure> {
        if self.cron.count_for(nym) >= self.config().max_cron_items_per_nym {
            return Err(TransactionFailure::CronLimitReached);
        }
        Ok(())
    }

    /// Closing number that must still be available in `nym`'s context
    fn require_closing(
        contexts: &ContextSet,
        nym: &NymId,
        closing: TransactionNumber,
        opening: TransactionNumber,
    ) -> Result<(), TransactionFailure> {
        if closing == opening || !contexts.get(nym)?.verify_available_number(closing) {
            return Err(TransactionFailure::TransactionNumberInvalid(closing));
        }
        Ok(())
    }

    fn insert_cron_item(&self, item: CronItem) -> Result<(), TransactionFailure> {
        info!(number = item.number(), kind = item.kind_name(), activator = %item.activator(), "cron item activated");
        self.cron.insert(item).map_err(NotaryError::from)?;
        Ok(())
    }

    // ========================================================================
    // PAYMENT PLANS
    // ========================================================================

    pub(crate) async fn activate_plan(
        &self,
        contexts: &mut ContextSet,
        signed: &SignedTransaction,
        plan: &SignedPlan,
        sender_closing: TransactionNumber,
        now: i64,
    ) -> Result<Applied, TransactionFailure> {
        let transaction = signed.body();
        let opening = transaction.number();
        let body = plan.body();

        if body.sender() != transaction.nym() {
            return Err(invalid("only the sender activates a payment plan"));
        }
        let recipient_key = body.recipient().public_key().map_err(|e| invalid(e.to_string()))?;
        if !plan.verify_with(&recipient_key) {
            return Err(TransactionFailure::SignatureInvalid);
        }
        if body.notary() != self.id() || !body.is_well_formed() {
            return Err(invalid("payment plan is malformed"));
        }
        if now < body.valid_from() || now > body.valid_to() {
            return Err(invalid("payment plan is outside its validity window"));
        }
        if transaction.account() != body.sender_account() {
            return Err(invalid("transaction account must be the paying account"));
        }
        self.check_cron_capacity(body.sender())?;
        self.check_cron_capacity(body.recipient())?;

        let sender_account = self.party_account(body.sender_account(), body.sender(), body.unit()).await?;
        self.party_account(body.recipient_account(), body.recipient(), body.unit())
            .await?;

        Self::require_closing(contexts, body.sender(), sender_closing, opening)?;
        Self::require_closing(contexts, body.recipient(), body.recipient_closing(), opening)?;

        let inbox_hash = self.inbox_hash(body.sender_account()).await?;
        verify_balance_agreement(
            contexts.get(transaction.nym())?,
            transaction,
            &sender_account,
            0,
            &BTreeSet::new(),
            inbox_hash,
        )?;

        let sender = contexts.get_mut(body.sender())?;
        sender.consume_available(sender_closing)?;
        sender.open_cron_item(opening)?;
        let recipient = contexts.get_mut(body.recipient())?;
        recipient.consume_available(body.recipient_closing())?;
        recipient.open_cron_item(opening)?;

        self.insert_cron_item(CronItem::payment_plan(opening, body.clone(), sender_closing, now))?;
        Ok(Applied::opened(sender_account.balance()))
    }

    /// Refuse or withdraw from a plan before it runs. Either party may
    /// cancel; the counterparty learns through its nymbox and recovers its
    /// own closing number.
    pub(crate) async fn cancel_plan(
        &self,
        contexts: &mut ContextSet,
        signed: &SignedTransaction,
        plan: &SignedPlan,
        sender_closing: TransactionNumber,
    ) -> Result<Applied, TransactionFailure> {
        let transaction = signed.body();
        let canceller = transaction.nym();
        let body = plan.body();

        let recipient_key = body.recipient().public_key().map_err(|e| invalid(e.to_string()))?;
        if !plan.verify_with(&recipient_key) {
            return Err(TransactionFailure::SignatureInvalid);
        }
        if body.notary() != self.id() {
            return Err(invalid("payment plan is for another notary"));
        }
        let (own_closing, counterparty) = if canceller == body.sender() {
            (sender_closing, body.recipient())
        } else if canceller == body.recipient() {
            (body.recipient_closing(), body.sender())
        } else {
            return Err(invalid("only a party can cancel a payment plan"));
        };

        let mut closed = BTreeSet::from([transaction.number()]);
        if own_closing != transaction.number() && contexts.get(canceller)?.verify_available_number(own_closing) {
            closed.insert(own_closing);
        }

        let account = self
            .wallet
            .account(transaction.account())
            .await?
            .ok_or(TransactionFailure::AccountNotFound(*transaction.account()))?;
        if account.owner() != canceller {
            return Err(TransactionFailure::NotOwner);
        }
        let inbox_hash = self.inbox_hash(transaction.account()).await?;
        verify_balance_agreement(contexts.get(canceller)?, transaction, &account, 0, &closed, inbox_hash)?;

        let context = contexts.get_mut(canceller)?;
        for number in &closed {
            if *number != transaction.number() {
                context.consume_available(*number)?;
            }
            context.consume_issued(*number)?;
        }

        let notice = self.sign_receipt(
            BoxItem::new(BoxItemKind::Notice, self.allocate_number().await?, transaction.number())
                .with_from(canceller.clone(), Some(*transaction.account()))
                .with_attachment(Attachment::Transaction(Box::new(signed.clone()))),
        );
        let mut nymbox = self.wallet.lock_nymbox(counterparty).await?;
        nymbox.add(notice)?;
        nymbox.commit().map_err(LedgerError::from)?;

        info!(canceller = %canceller, counterparty = %counterparty, "payment plan cancelled");
        Ok(Applied {
            closed,
            balance: Some(account.balance()),
            voucher: None,
            failure: Some(TransactionFailure::PlanCancelled(canceller.clone())),
        })
    }

    // ========================================================================
    // MARKET OFFERS
    // ========================================================================

    pub(crate) async fn activate_offer(
        &self,
        contexts: &mut ContextSet,
        signed: &SignedTransaction,
        offer: &MarketOffer,
        now: i64,
    ) -> Result<Applied, TransactionFailure> {
        let transaction = signed.body();
        let opening = transaction.number();

        if &offer.owner != transaction.nym() {
            return Err(invalid("offer belongs to another nym"));
        }
        if offer.notary != *self.id() || !offer.is_well_formed() {
            return Err(invalid("market offer is malformed"));
        }
        if now > offer.valid_to {
            return Err(invalid("market offer has expired"));
        }
        if transaction.account() != &offer.asset_account {
            return Err(invalid("transaction account must be the asset account"));
        }
        self.check_cron_capacity(&offer.owner)?;

        let asset_account = self
            .party_account(&offer.asset_account, &offer.owner, &offer.asset_unit)
            .await?;
        self.party_account(&offer.currency_account, &offer.owner, &offer.currency_unit)
            .await?;

        Self::require_closing(contexts, &offer.owner, offer.closing_asset, opening)?;
        Self::require_closing(contexts, &offer.owner, offer.closing_currency, opening)?;

        let inbox_hash = self.inbox_hash(&offer.asset_account).await?;
        verify_balance_agreement(
            contexts.get(transaction.nym())?,
            transaction,
            &asset_account,
            0,
            &BTreeSet::new(),
            inbox_hash,
        )?;

        let context = contexts.get_mut(&offer.owner)?;
        context.consume_available(offer.closing_asset)?;
        context.consume_available(offer.closing_currency)?;
        context.open_cron_item(opening)?;

        self.insert_cron_item(CronItem::market_offer(opening, offer.clone(), now))?;
        Ok(Applied::opened(asset_account.balance()))
    }

    // ========================================================================
    // SMART CONTRACTS
    // ========================================================================

    pub(crate) async fn activate_contract(
        &self,
        contexts: &mut ContextSet,
        signed: &SignedTransaction,
        contract: &SmartContract,
        endorsements: &[SignedContract],
        now: i64,
    ) -> Result<Applied, TransactionFailure> {
        let transaction = signed.body();
        let opening = transaction.number();

        if contract.notary != *self.id() || !contract.is_well_formed() {
            return Err(invalid("smart contract is malformed"));
        }
        if now < contract.valid_from || now > contract.valid_to {
            return Err(invalid("smart contract is outside its validity window"));
        }
        let activator = contract
            .party(transaction.nym())
            .ok_or_else(|| invalid("activator is not a party"))?;
        if &activator.account != transaction.account() {
            return Err(invalid("transaction account must be the activator's party account"));
        }

        let mut activator_account = None;
        for party in &contract.parties {
            let key = party.nym.public_key().map_err(|e| invalid(e.to_string()))?;
            let endorsed = endorsements
                .iter()
                .any(|e| e.body() == contract && e.verify_with(&key));
            if !endorsed {
                return Err(TransactionFailure::SignatureInvalid);
            }

            let account = self
                .wallet
                .account(&party.account)
                .await?
                .ok_or(TransactionFailure::AccountNotFound(party.account))?;
            if account.owner() != &party.nym {
                return Err(TransactionFailure::NotOwner);
            }
            if &party.nym == transaction.nym() {
                activator_account = Some(account);
            }

            self.check_cron_capacity(&party.nym)?;
            Self::require_closing(contexts, &party.nym, party.closing_number, opening)?;
        }
        let activator_account = activator_account.ok_or_else(|| invalid("activator is not a party"))?;

        let inbox_hash = self.inbox_hash(transaction.account()).await?;
        verify_balance_agreement(
            contexts.get(transaction.nym())?,
            transaction,
            &activator_account,
            0,
            &BTreeSet::new(),
            inbox_hash,
        )?;

        for party in &contract.parties {
            let context = contexts.get_mut(&party.nym)?;
            context.consume_available(party.closing_number)?;
            context.open_cron_item(opening)?;
        }

        self.insert_cron_item(CronItem::smart_contract(
            opening,
            transaction.nym().clone(),
            contract.clone(),
            now,
        ))?;
        Ok(Applied::opened(activator_account.balance()))
    }

    // ========================================================================
    // CANCELLATION
    // ========================================================================

    /// Cancel an active cron item; every party gets its final receipt
    pub(crate) async fn cancel_cron_item(
        &self,
        contexts: &mut ContextSet,
        signed: &SignedTransaction,
        number: TransactionNumber,
    ) -> Result<Applied, TransactionFailure> {
        let transaction = signed.body();
        let mut item = self.cron.get(number).ok_or(TransactionFailure::CronItemNotFound(number))?;
        if !item.involves(transaction.nym()) {
            return Err(TransactionFailure::NotOwner);
        }

        let account = self
            .wallet
            .account(transaction.account())
            .await?
            .ok_or(TransactionFailure::AccountNotFound(*transaction.account()))?;
        if account.owner() != transaction.nym() {
            return Err(TransactionFailure::NotOwner);
        }
        let closing = BTreeSet::from([transaction.number()]);
        let inbox_hash = self.inbox_hash(transaction.account()).await?;
        verify_balance_agreement(
            contexts.get(transaction.nym())?,
            transaction,
            &account,
            0,
            &closing,
            inbox_hash,
        )?;

        contexts.get_mut(transaction.nym())?.consume_issued(transaction.number())?;
        item.set_status(CronStatus::Cancelled);
        self.finalize_cron_item(contexts, &item).await?;
        Ok(Applied::closed(transaction.number(), account.balance()))
    }
}
