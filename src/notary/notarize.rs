// Notarization pipeline - number checks, balance agreements, and the
// fund-moving operations
//
// Every transaction consumes its number as an opening number first. If the
// operation then fails, context changes are rolled back and the number is
// burned: it leaves both the available and the issued set.

use crate::consensus::{ConsensusContext, TransactionNumber};
use crate::identity::{AccountId, NymId, Signed, UnitId};
use crate::instrument::{
    BasketDirection, Operation, PlanAction, SignedCheque, SignedResponse, SignedTransaction, Transaction,
    TransactionFailure, TransactionResponse,
};
use crate::ledger::{Account, AccountType, Attachment, BoxItem, BoxItemKind, BoxKind, LedgerError, LedgerHash, LedgerOwner};
use crate::notary::contexts::ContextSet;
use crate::notary::server::Notary;
use std::collections::BTreeSet;
use tracing::{debug, info};

/// Outcome of an operation that went through
#[derive(Debug, Default)]
pub(crate) struct Applied {
    pub closed: BTreeSet<TransactionNumber>,
    pub balance: Option<i64>,
    pub voucher: Option<SignedCheque>,
    /// Reported to the requester while the side effects stand
    pub failure: Option<TransactionFailure>,
}

impl Applied {
    /// The transaction number stays open
    pub fn opened(balance: i64) -> Self {
        Self {
            balance: Some(balance),
            ..Self::default()
        }
    }

    /// The transaction number was closed
    pub fn closed(number: TransactionNumber, balance: i64) -> Self {
        Self {
            closed: BTreeSet::from([number]),
            balance: Some(balance),
            ..Self::default()
        }
    }
}

fn mismatch(reason: impl Into<String>) -> TransactionFailure {
    TransactionFailure::BalanceAgreementMismatch(reason.into())
}

/// Check a balance agreement against the account as it stands before the
/// operation. `closing` holds the numbers the operation closes.
pub(crate) fn verify_balance_agreement(
    context: &ConsensusContext,
    transaction: &Transaction,
    account: &Account,
    delta: i64,
    closing: &BTreeSet<TransactionNumber>,
    inbox_hash: LedgerHash,
) -> Result<(), TransactionFailure> {
    let agreement = transaction.balance_agreement();
    if &agreement.account != account.id() {
        return Err(mismatch("agreement names another account"));
    }

    let statement = agreement.statement.body();
    if statement.nym() != context.number_owner() {
        return Err(mismatch("statement belongs to another nym"));
    }
    let key = context
        .number_owner()
        .public_key()
        .map_err(|e| TransactionFailure::CorruptedState(e.to_string()))?;
    if !agreement.statement.verify_with(&key) {
        return Err(TransactionFailure::SignatureInvalid);
    }
    if !context.matches_statement(statement, closing) {
        return Err(mismatch("statement does not match the issued numbers"));
    }

    check_expected_balance(account, delta, agreement.expected_balance)?;

    if let Some(hash) = agreement.inbox_hash {
        if hash != inbox_hash {
            return Err(mismatch(format!("inbox hash {} is stale, current is {}", hash, inbox_hash)));
        }
    }
    Ok(())
}

fn check_expected_balance(account: &Account, delta: i64, expected: i64) -> Result<(), TransactionFailure> {
    let computed = account
        .balance()
        .checked_add(delta)
        .ok_or(TransactionFailure::InvalidAmount(delta))?;
    if computed != expected {
        return Err(mismatch(format!("expected balance {} but the notary computes {}", expected, computed)));
    }
    Ok(())
}

pub(crate) fn require_owner(account: &Account, nym: &NymId) -> Result<(), TransactionFailure> {
    if account.owner() != nym {
        return Err(TransactionFailure::NotOwner);
    }
    Ok(())
}

impl Notary {
    /// Notarize one transaction and sign the response, success or not
    pub(crate) async fn notarize(&self, contexts: &mut ContextSet, signed: SignedTransaction) -> SignedResponse {
        let response = self.notarize_transaction(contexts, &signed).await;
        let transaction = signed.body();
        match &response.failure {
            None => {
                self.record(|s| s.transactions_succeeded += 1);
                info!(
                    nym = %transaction.nym(),
                    number = transaction.number(),
                    operation = transaction.operation().name(),
                    "transaction notarized"
                );
            }
            Some(failure) => {
                self.record(|s| s.transactions_failed += 1);
                info!(
                    nym = %transaction.nym(),
                    number = transaction.number(),
                    operation = transaction.operation().name(),
                    consumed = response.number_consumed,
                    %failure,
                    "transaction failed"
                );
            }
        }
        Signed::sign(response, self.keypair())
    }

    async fn notarize_transaction(&self, contexts: &mut ContextSet, signed: &SignedTransaction) -> TransactionResponse {
        let transaction = signed.body();
        let number = transaction.number();
        let reject = |failure| TransactionResponse::failure(*self.id(), signed.clone(), failure, false);

        if transaction.notary() != self.id() {
            return reject(TransactionFailure::AgreementInvalid("transaction is for another notary".to_string()));
        }
        let signature_ok = transaction
            .nym()
            .public_key()
            .map(|key| signed.verify_with(&key))
            .unwrap_or(false);
        if !signature_ok {
            return reject(TransactionFailure::SignatureInvalid);
        }
        match contexts.get(transaction.nym()) {
            Ok(context) if context.verify_available_number(number) => {}
            Ok(_) => return reject(TransactionFailure::TransactionNumberInvalid(number)),
            Err(failure) => return reject(failure),
        }

        let checkpoint = contexts.checkpoint();
        match self.apply(contexts, signed).await {
            Ok(applied) => {
                let mut response = TransactionResponse::success(*self.id(), signed.clone());
                response.closed = applied.closed;
                response.balance = applied.balance;
                response.voucher = applied.voucher;
                if let Some(failure) = applied.failure {
                    response.success = false;
                    response.failure = Some(failure);
                }
                response
            }
            Err(failure) => {
                contexts.restore(checkpoint);
                let burned = match contexts.get_mut(transaction.nym()) {
                    Ok(context) => context
                        .consume_available(number)
                        .and_then(|_| context.consume_issued(number))
                        .is_ok(),
                    Err(_) => false,
                };
                debug!(number, burned, "transaction number burned on failure");
                let mut response = TransactionResponse::failure(*self.id(), signed.clone(), failure, burned);
                if burned {
                    response.closed.insert(number);
                }
                response
            }
        }
    }

    async fn apply(&self, contexts: &mut ContextSet, signed: &SignedTransaction) -> Result<Applied, TransactionFailure> {
        let transaction = signed.body();
        contexts
            .get_mut(transaction.nym())?
            .consume_available(transaction.number())?;
        let now = Self::now();

        match transaction.operation() {
            Operation::Transfer { to_account, amount, .. } => self.transfer(contexts, signed, *to_account, *amount).await,
            Operation::DepositCheque { cheque } => self.deposit_cheque(contexts, signed, cheque, now).await,
            Operation::WithdrawVoucher { amount, recipient } => {
                self.withdraw_voucher(contexts, signed, *amount, recipient.clone(), now).await
            }
            Operation::PayDividend {
                share_unit,
                amount_per_share,
            } => self.pay_dividend(contexts, signed, *share_unit, *amount_per_share, now).await,
            Operation::ExchangeBasket {
                basket,
                direction,
                multiple,
                component_accounts,
            } => {
                self.exchange_basket(contexts, signed, *basket, *direction, *multiple, component_accounts)
                    .await
            }
            Operation::ProcessInbox { accept } => self.process_inbox(contexts, signed, accept).await,
            Operation::MarketOffer { offer } => self.activate_offer(contexts, signed, offer, now).await,
            Operation::PaymentPlan {
                plan,
                sender_closing,
                action,
            } => match action {
                PlanAction::Activate => self.activate_plan(contexts, signed, plan, *sender_closing, now).await,
                PlanAction::Cancel => self.cancel_plan(contexts, signed, plan, *sender_closing).await,
            },
            Operation::SmartContract { contract, endorsements } => {
                self.activate_contract(contexts, signed, contract, endorsements, now).await
            }
            Operation::CancelCronItem { item } => self.cancel_cron_item(contexts, signed, *item).await,
        }
    }

    // ========================================================================
    // TRANSFER
    // ========================================================================

    /// Debit now; the recipient is credited when it accepts the pending item
    async fn transfer(
        &self,
        contexts: &mut ContextSet,
        signed: &SignedTransaction,
        to: AccountId,
        amount: i64,
    ) -> Result<Applied, TransactionFailure> {
        let transaction = signed.body();
        let from = *transaction.account();
        if amount <= 0 {
            return Err(TransactionFailure::InvalidAmount(amount));
        }
        if from == to {
            return Err(TransactionFailure::AgreementInvalid("transfer to the same account".to_string()));
        }

        let inbox_hash = self.inbox_hash(&from).await?;
        let mut accounts = self.wallet.lock_accounts(&BTreeSet::from([from, to])).await?;
        let source = accounts.get(&from)?;
        require_owner(source, transaction.nym())?;
        if source.unit() != accounts.get(&to)?.unit() {
            return Err(TransactionFailure::UnitMismatch);
        }
        verify_balance_agreement(
            contexts.get(transaction.nym())?,
            transaction,
            source,
            -amount,
            &BTreeSet::new(),
            inbox_hash,
        )?;

        let balance = accounts.get_mut(&from)?.debit(amount)?;

        let pending = self.sign_receipt(
            BoxItem::new(BoxItemKind::Pending, self.allocate_number().await?, transaction.number())
                .with_amount(amount)
                .with_from(transaction.nym().clone(), Some(from))
                .with_to_account(to)
                .with_attachment(Attachment::Transaction(Box::new(signed.clone()))),
        );
        let mut ledgers = self
            .wallet
            .lock_ledgers(vec![
                (BoxKind::Inbox, LedgerOwner::Account(to)),
                (BoxKind::Outbox, LedgerOwner::Account(from)),
            ])
            .await?;
        ledgers.get_mut(BoxKind::Inbox, &LedgerOwner::Account(to))?.add(pending.clone())?;
        ledgers.get_mut(BoxKind::Outbox, &LedgerOwner::Account(from))?.add(pending)?;

        accounts.commit()?;
        ledgers.commit()?;
        Ok(Applied::opened(balance))
    }

    // ========================================================================
    // CHEQUES AND VOUCHERS
    // ========================================================================

    async fn deposit_cheque(
        &self,
        contexts: &mut ContextSet,
        signed: &SignedTransaction,
        cheque: &SignedCheque,
        now: i64,
    ) -> Result<Applied, TransactionFailure> {
        let transaction = signed.body();
        let depositor = *transaction.account();
        let body = cheque.body();
        let invalid = |reason: &str| TransactionFailure::ChequeInvalid(reason.to_string());

        let drawer_key = body.drawer().public_key().map_err(|_| invalid("drawer id is not a key"))?;
        if !cheque.verify_with(&drawer_key) {
            return Err(invalid("drawer signature does not verify"));
        }
        if body.notary() != self.id() {
            return Err(invalid("cheque is drawn at another notary"));
        }
        if !body.is_valid_at(now) {
            return Err(invalid("cheque is outside its validity window"));
        }
        if !body.payable_to(transaction.nym()) {
            return Err(invalid("cheque is payable to another nym"));
        }
        if body.amount() <= 0 {
            return Err(TransactionFailure::InvalidAmount(body.amount()));
        }

        let is_voucher = body.drawer() == self.nym();
        if is_voucher {
            if !self.outstanding_vouchers().await.contains(&body.number()) {
                return Err(invalid("voucher is unknown or already cashed"));
            }
        } else if !contexts.get(body.drawer())?.verify_available_number(body.number()) {
            return Err(invalid("cheque number is not available to the drawer"));
        }

        let drawer_account = *body.drawer_account();
        if drawer_account == depositor {
            return Err(invalid("cheque deposited into the account it is drawn on"));
        }
        let inbox_hash = self.inbox_hash(&depositor).await?;
        let mut accounts = self
            .wallet
            .lock_accounts(&BTreeSet::from([drawer_account, depositor]))
            .await?;
        let target = accounts.get(&depositor)?;
        require_owner(target, transaction.nym())?;
        if accounts.get(&drawer_account)?.owner() != body.drawer() {
            return Err(invalid("cheque is drawn on an account the drawer does not own"));
        }
        if target.unit() != body.unit() || accounts.get(&drawer_account)?.unit() != body.unit() {
            return Err(TransactionFailure::UnitMismatch);
        }

        let closing = BTreeSet::from([transaction.number()]);
        verify_balance_agreement(
            contexts.get(transaction.nym())?,
            transaction,
            target,
            body.amount(),
            &closing,
            inbox_hash,
        )?;

        accounts.transfer(&drawer_account, &depositor, body.amount())?;
        let balance = accounts.get(&depositor)?.balance();

        let mut drawer_inbox = None;
        if is_voucher {
            self.update_vouchers(&[], Some(body.number())).await?;
        } else {
            contexts.get_mut(body.drawer())?.consume_available(body.number())?;
            let receipt = self.sign_receipt(
                BoxItem::new(BoxItemKind::ChequeReceipt, self.allocate_number().await?, body.number())
                    .with_amount(body.amount())
                    .with_from(transaction.nym().clone(), Some(depositor))
                    .with_to_account(depositor)
                    .with_closing_numbers(BTreeSet::from([body.number()]))
                    .with_attachment(Attachment::Cheque(cheque.clone())),
            );
            let mut inbox = self.wallet.lock_inbox(&drawer_account).await?;
            inbox.add(receipt)?;
            drawer_inbox = Some(inbox);
        }
        contexts.get_mut(transaction.nym())?.consume_issued(transaction.number())?;

        accounts.commit()?;
        if let Some(inbox) = drawer_inbox {
            inbox.commit().map_err(LedgerError::from)?;
        }
        Ok(Applied::closed(transaction.number(), balance))
    }

    async fn withdraw_voucher(
        &self,
        contexts: &mut ContextSet,
        signed: &SignedTransaction,
        amount: i64,
        recipient: Option<NymId>,
        now: i64,
    ) -> Result<Applied, TransactionFailure> {
        let transaction = signed.body();
        let source = *transaction.account();
        if amount <= 0 {
            return Err(TransactionFailure::InvalidAmount(amount));
        }

        let unit = *self
            .wallet
            .account(&source)
            .await?
            .ok_or(TransactionFailure::AccountNotFound(source))?
            .unit();
        let voucher_account = self.voucher_account(&unit);
        self.wallet
            .ensure_account(voucher_account, self.nym(), *self.id(), unit, AccountType::Voucher)
            .await?;

        let inbox_hash = self.inbox_hash(&source).await?;
        let mut accounts = self
            .wallet
            .lock_accounts(&BTreeSet::from([source, voucher_account]))
            .await?;
        require_owner(accounts.get(&source)?, transaction.nym())?;
        let closing = BTreeSet::from([transaction.number()]);
        verify_balance_agreement(
            contexts.get(transaction.nym())?,
            transaction,
            accounts.get(&source)?,
            -amount,
            &closing,
            inbox_hash,
        )?;

        accounts.transfer(&source, &voucher_account, amount)?;
        let balance = accounts.get(&source)?.balance();

        let number = self.allocate_number().await?;
        let voucher = self.draw_voucher(unit, transaction.nym(), recipient, amount, number, now, "voucher");
        contexts.get_mut(transaction.nym())?.consume_issued(transaction.number())?;

        accounts.commit()?;
        self.update_vouchers(&[number], None).await?;
        info!(nym = %transaction.nym(), number, amount, "voucher issued");

        let mut applied = Applied::closed(transaction.number(), balance);
        applied.voucher = Some(voucher);
        Ok(applied)
    }

    // ========================================================================
    // DIVIDENDS
    // ========================================================================

    /// Pay `amount_per_share` to every holder of `share_unit`, one voucher
    /// per holding account
    async fn pay_dividend(
        &self,
        contexts: &mut ContextSet,
        signed: &SignedTransaction,
        share_unit: UnitId,
        amount_per_share: i64,
        now: i64,
    ) -> Result<Applied, TransactionFailure> {
        let transaction = signed.body();
        let payer = *transaction.account();
        if amount_per_share <= 0 {
            return Err(TransactionFailure::InvalidAmount(amount_per_share));
        }

        let shares = self
            .wallet
            .unit(&share_unit)
            .await
            .map_err(|e| TransactionFailure::AgreementInvalid(e.to_string()))?;
        if shares.issuer() != transaction.nym() {
            return Err(TransactionFailure::NotOwner);
        }
        let currency = *self
            .wallet
            .account(&payer)
            .await?
            .ok_or(TransactionFailure::AccountNotFound(payer))?
            .unit();
        if currency == share_unit {
            return Err(TransactionFailure::UnitMismatch);
        }

        let mut payouts = Vec::new();
        let mut total: i64 = 0;
        for holder in self.wallet.accounts_for_unit(&share_unit)? {
            if holder.kind() != AccountType::Simple || holder.balance() <= 0 {
                continue;
            }
            let payout = holder
                .balance()
                .checked_mul(amount_per_share)
                .ok_or(TransactionFailure::InvalidAmount(amount_per_share))?;
            total = total.checked_add(payout).ok_or(TransactionFailure::InvalidAmount(payout))?;
            payouts.push((holder.owner().clone(), payout));
        }

        let voucher_account = self.voucher_account(&currency);
        self.wallet
            .ensure_account(voucher_account, self.nym(), *self.id(), currency, AccountType::Voucher)
            .await?;

        let inbox_hash = self.inbox_hash(&payer).await?;
        let mut accounts = self
            .wallet
            .lock_accounts(&BTreeSet::from([payer, voucher_account]))
            .await?;
        require_owner(accounts.get(&payer)?, transaction.nym())?;
        let closing = BTreeSet::from([transaction.number()]);
        verify_balance_agreement(
            contexts.get(transaction.nym())?,
            transaction,
            accounts.get(&payer)?,
            -total,
            &closing,
            inbox_hash,
        )?;
        if total > 0 {
            accounts.transfer(&payer, &voucher_account, total)?;
        }
        let balance = accounts.get(&payer)?.balance();

        let numbers = self.allocate_numbers(payouts.len() * 2).await?;
        let owners = payouts
            .iter()
            .map(|(owner, _)| (BoxKind::Nymbox, LedgerOwner::Nym(owner.clone())))
            .collect();
        let mut nymboxes = self.wallet.lock_ledgers(owners).await?;
        let mut vouchers = Vec::with_capacity(payouts.len());
        for ((owner, payout), pair) in payouts.iter().zip(numbers.chunks(2)) {
            let (voucher_number, receipt_number) = (pair[0], pair[1]);
            let voucher = self.draw_voucher(currency, transaction.nym(), Some(owner.clone()), *payout, voucher_number, now, "dividend");
            let notice = self.sign_receipt(
                BoxItem::new(BoxItemKind::Notice, receipt_number, transaction.number())
                    .with_amount(*payout)
                    .with_from(transaction.nym().clone(), Some(payer))
                    .with_attachment(Attachment::Cheque(voucher)),
            );
            nymboxes.get_mut(BoxKind::Nymbox, &LedgerOwner::Nym(owner.clone()))?.add(notice)?;
            vouchers.push(voucher_number);
        }
        contexts.get_mut(transaction.nym())?.consume_issued(transaction.number())?;

        accounts.commit()?;
        nymboxes.commit()?;
        self.update_vouchers(&vouchers, None).await?;
        info!(unit = %share_unit, holders = payouts.len(), total, "dividend paid");
        Ok(Applied::closed(transaction.number(), balance))
    }

    // ========================================================================
    // BASKETS
    // ========================================================================

    /// Exchange components for basket units (`In`) or back (`Out`)
    #[allow(clippy::too_many_arguments)]
    async fn exchange_basket(
        &self,
        contexts: &mut ContextSet,
        signed: &SignedTransaction,
        basket_unit: UnitId,
        direction: BasketDirection,
        multiple: i64,
        component_accounts: &[AccountId],
    ) -> Result<Applied, TransactionFailure> {
        let transaction = signed.body();
        let basket_account = *transaction.account();
        let invalid = |reason: &str| TransactionFailure::BasketInvalid(reason.to_string());
        if multiple <= 0 {
            return Err(TransactionFailure::InvalidAmount(multiple));
        }

        let definition = self
            .wallet
            .unit(&basket_unit)
            .await
            .map_err(|e| TransactionFailure::BasketInvalid(e.to_string()))?;
        let basket = definition
            .basket_definition()
            .ok_or_else(|| invalid("unit is not a basket"))?;
        if component_accounts.len() != basket.components.len() {
            return Err(invalid("one account is needed per component"));
        }
        let basket_amount = basket
            .minimum_transfer
            .checked_mul(multiple)
            .ok_or(TransactionFailure::InvalidAmount(multiple))?;

        let issuer = self.basket_issuer_account(&basket_unit);
        let mut legs = Vec::with_capacity(basket.components.len());
        for (component, account) in basket.components.iter().zip(component_accounts) {
            let amount = component
                .weight
                .checked_mul(multiple)
                .ok_or(TransactionFailure::InvalidAmount(multiple))?;
            legs.push((*account, self.reserve_account(&basket_unit, &component.unit), component.unit, amount));
        }

        let mut ids = BTreeSet::from([basket_account, issuer]);
        for (account, reserve, _, _) in &legs {
            if !ids.insert(*account) || !ids.insert(*reserve) {
                return Err(invalid("component accounts must be distinct"));
            }
        }

        let inbox_hash = self.inbox_hash(&basket_account).await?;
        let mut accounts = self.wallet.lock_accounts(&ids).await?;
        let target = accounts.get(&basket_account)?;
        require_owner(target, transaction.nym())?;
        if target.unit() != &basket_unit {
            return Err(TransactionFailure::UnitMismatch);
        }
        for (account, _, unit, _) in &legs {
            let component = accounts.get(account)?;
            require_owner(component, transaction.nym())?;
            if component.unit() != unit {
                return Err(TransactionFailure::UnitMismatch);
            }
        }

        let delta = match direction {
            BasketDirection::In => basket_amount,
            BasketDirection::Out => -basket_amount,
        };
        let closing = BTreeSet::from([transaction.number()]);
        verify_balance_agreement(
            contexts.get(transaction.nym())?,
            transaction,
            accounts.get(&basket_account)?,
            delta,
            &closing,
            inbox_hash,
        )?;

        match direction {
            BasketDirection::In => {
                for (account, reserve, _, amount) in &legs {
                    accounts.transfer(account, reserve, *amount)?;
                }
                accounts.transfer(&issuer, &basket_account, basket_amount)?;
            }
            BasketDirection::Out => {
                accounts.transfer(&basket_account, &issuer, basket_amount)?;
                for (account, reserve, _, amount) in &legs {
                    accounts.transfer(reserve, account, *amount)?;
                }
            }
        }
        let balance = accounts.get(&basket_account)?.balance();

        let numbers = self.allocate_numbers(legs.len()).await?;
        let inboxes = legs
            .iter()
            .map(|(account, _, _, _)| (BoxKind::Inbox, LedgerOwner::Account(*account)))
            .collect();
        let mut ledgers = self.wallet.lock_ledgers(inboxes).await?;
        for ((account, _, _, amount), number) in legs.iter().zip(numbers) {
            let signed_amount = match direction {
                BasketDirection::In => -amount,
                BasketDirection::Out => *amount,
            };
            let receipt = self.sign_receipt(
                BoxItem::new(BoxItemKind::BasketReceipt, number, transaction.number())
                    .with_amount(signed_amount)
                    .with_from(transaction.nym().clone(), Some(basket_account))
                    .with_to_account(*account),
            );
            ledgers.get_mut(BoxKind::Inbox, &LedgerOwner::Account(*account))?.add(receipt)?;
        }
        contexts.get_mut(transaction.nym())?.consume_issued(transaction.number())?;

        accounts.commit()?;
        ledgers.commit()?;
        debug!(basket = %basket_unit, ?direction, multiple, "basket exchanged");
        Ok(Applied::closed(transaction.number(), balance))
    }
}
