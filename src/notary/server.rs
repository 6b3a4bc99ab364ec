// Notary server - request verification, sequencing and dispatch
//
// Lock order, everywhere: contexts (nym order), then accounts (id order),
// then box ledgers (key order). The notary's own counters are locked last
// and only for the moment it takes to allocate numbers.

use crate::consensus::{ContextRepository, TransactionNumber, TransactionStatement};
use crate::cron::CronQueue;
use crate::identity::{AccountId, Keypair, NotaryId, NymId, PublicKey, Signed, UnitId};
use crate::instrument::{Cheque, Operation, SignedCheque};
use crate::ledger::{AccountType, Attachment, BoxItem, BoxItemKind, BoxKind, LedgerHash, LedgerOwner, Receipt, Wallet};
use crate::notary::contexts::ContextSet;
use crate::notary::{NotaryConfig, NotaryError};
use crate::protocol::{Command, Reply, ReplyPayload, ReplyStatus, Request, SignedReply, SignedRequest};
use crate::storage::{keys, Storage};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Counters the notary keeps for itself
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub(crate) struct NotaryState {
    /// Next transaction or receipt number to hand out
    pub next_number: TransactionNumber,
    /// Vouchers issued and not yet deposited
    pub outstanding_vouchers: BTreeSet<TransactionNumber>,
}

/// Statistics about notary operations
#[derive(Clone, Debug, Default)]
pub struct NotaryStats {
    pub requests: u64,
    pub rejected: u64,
    pub stale_requests: u64,
    pub nymbox_mismatches: u64,
    pub numbers_issued: u64,
    pub transactions_succeeded: u64,
    pub transactions_failed: u64,
    pub cron_ticks: u64,
    pub cron_payments: u64,
    pub cron_failed_payments: u64,
    pub cron_trades: u64,
    pub cron_expired: u64,
}

pub struct Notary {
    id: NotaryId,
    nym: NymId,
    keypair: Keypair,
    config: NotaryConfig,
    storage: Arc<dyn Storage>,
    pub(crate) contexts: ContextRepository,
    pub(crate) wallet: Wallet,
    pub(crate) cron: CronQueue,
    pub(crate) state: Mutex<NotaryState>,
    stats: StdMutex<NotaryStats>,
}

impl Notary {
    /// Create a notary over `storage` with a known signing key
    pub fn new(storage: Arc<dyn Storage>, keypair: Keypair, config: NotaryConfig) -> Result<Self, NotaryError> {
        config.validate()?;

        let public_key = keypair.public_key();
        let state = storage
            .load_record::<NotaryState>(keys::NOTARY_STATE)?
            .unwrap_or(NotaryState {
                next_number: 1,
                outstanding_vouchers: BTreeSet::new(),
            });
        let cron = CronQueue::load(storage.clone())?;

        let notary = Self {
            id: NotaryId::for_key(&public_key),
            nym: NymId::from_public_key(&public_key),
            keypair,
            config,
            contexts: ContextRepository::new(storage.clone()),
            wallet: Wallet::new(storage.clone()),
            cron,
            storage,
            state: Mutex::new(state),
            stats: StdMutex::new(NotaryStats::default()),
        };
        info!(notary = %notary.id, "notary ready");
        Ok(notary)
    }

    /// Open a notary, generating and persisting its key on first start
    pub fn open(storage: Arc<dyn Storage>, config: NotaryConfig) -> Result<Self, NotaryError> {
        let keypair = match storage.load(keys::NOTARY_KEYPAIR)? {
            Some(bytes) => Keypair::from_bytes(&bytes).map_err(|e| NotaryError::InvalidKey(e.to_string()))?,
            None => {
                let keypair = Keypair::generate();
                storage.store(keys::NOTARY_KEYPAIR, &keypair.to_bytes())?;
                storage.flush()?;
                info!("generated notary key");
                keypair
            }
        };
        Self::new(storage, keypair, config)
    }

    /// Get the notary id
    pub fn id(&self) -> &NotaryId {
        &self.id
    }

    /// Get the notary's own nym
    pub fn nym(&self) -> &NymId {
        &self.nym
    }

    pub(crate) fn keypair(&self) -> &Keypair {
        &self.keypair
    }

    pub fn public_key(&self) -> PublicKey {
        self.keypair.public_key()
    }

    pub fn config(&self) -> &NotaryConfig {
        &self.config
    }

    pub fn wallet(&self) -> &Wallet {
        &self.wallet
    }

    pub fn contexts(&self) -> &ContextRepository {
        &self.contexts
    }

    pub fn cron_queue(&self) -> &CronQueue {
        &self.cron
    }

    /// Get a copy of the statistics
    pub fn stats(&self) -> NotaryStats {
        self.stats.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub(crate) fn record(&self, update: impl FnOnce(&mut NotaryStats)) {
        update(&mut self.stats.lock().unwrap_or_else(PoisonError::into_inner));
    }

    /// Vouchers issued and not yet deposited
    pub async fn outstanding_vouchers(&self) -> BTreeSet<TransactionNumber> {
        self.state.lock().await.outstanding_vouchers.clone()
    }

    /// Flush storage to disk
    pub fn flush(&self) -> Result<(), NotaryError> {
        Ok(self.storage.flush()?)
    }

    // ========================================================================
    // NOTARY-OWNED RESOURCES
    // ========================================================================

    pub(crate) fn now() -> i64 {
        Utc::now().timestamp()
    }

    /// Hand out `count` consecutive numbers from the notary counter
    pub(crate) async fn allocate_numbers(&self, count: usize) -> Result<Vec<TransactionNumber>, NotaryError> {
        let mut state = self.state.lock().await;
        let first = state.next_number;
        state.next_number += count as u64;
        self.storage.store_record(keys::NOTARY_STATE, &*state)?;
        Ok((first..first + count as u64).collect())
    }

    pub(crate) async fn allocate_number(&self) -> Result<TransactionNumber, NotaryError> {
        let numbers = self.allocate_numbers(1).await?;
        numbers
            .first()
            .copied()
            .ok_or_else(|| NotaryError::Rejected("number allocation failed".to_string()))
    }

    pub(crate) async fn update_vouchers(
        &self,
        issued: &[TransactionNumber],
        cashed: Option<TransactionNumber>,
    ) -> Result<(), NotaryError> {
        let mut state = self.state.lock().await;
        state.outstanding_vouchers.extend(issued.iter().copied());
        if let Some(number) = cashed {
            state.outstanding_vouchers.remove(&number);
        }
        self.storage.store_record(keys::NOTARY_STATE, &*state)?;
        Ok(())
    }

    pub(crate) fn sign_receipt(&self, item: BoxItem) -> Receipt {
        Signed::sign(item, &self.keypair)
    }

    /// Voucher cheque drawn on the notary's voucher account for `unit`
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn draw_voucher(
        &self,
        unit: UnitId,
        remitter: &NymId,
        recipient: Option<NymId>,
        amount: i64,
        number: TransactionNumber,
        now: i64,
        memo: &str,
    ) -> SignedCheque {
        let cheque = Cheque::new(
            self.id,
            unit,
            self.nym.clone(),
            self.voucher_account(&unit),
            recipient,
            amount,
            number,
            now,
            now + self.config.voucher_validity_secs,
        )
        .with_remitter(remitter.clone())
        .with_memo(memo);
        Signed::sign(cheque, &self.keypair)
    }

    pub(crate) fn voucher_account(&self, unit: &UnitId) -> AccountId {
        AccountId::derive(&[b"voucher", self.id.as_bytes(), unit.as_bytes()])
    }

    pub(crate) fn basket_issuer_account(&self, basket: &UnitId) -> AccountId {
        AccountId::derive(&[b"basket-issuer", self.id.as_bytes(), basket.as_bytes()])
    }

    pub(crate) fn reserve_account(&self, basket: &UnitId, component: &UnitId) -> AccountId {
        AccountId::derive(&[b"reserve", self.id.as_bytes(), basket.as_bytes(), component.as_bytes()])
    }

    pub(crate) async fn nymbox_hash(&self, nym: &NymId) -> Result<LedgerHash, NotaryError> {
        Ok(self.wallet.ledger(BoxKind::Nymbox, LedgerOwner::Nym(nym.clone())).await?.hash())
    }

    pub(crate) async fn inbox_hash(&self, account: &AccountId) -> Result<LedgerHash, NotaryError> {
        Ok(self.wallet.ledger(BoxKind::Inbox, LedgerOwner::Account(*account)).await?.hash())
    }

    // ========================================================================
    // REQUEST HANDLING
    // ========================================================================

    /// Decode, handle and encode one request; undecodable input gets no reply
    pub async fn handle_bytes(&self, bytes: &[u8]) -> Vec<u8> {
        match SignedRequest::from_bytes(bytes) {
            Ok(request) => self.handle_request(request).await.to_bytes(),
            Err(err) => {
                warn!(error = %err, "dropping undecodable request");
                Vec::new()
            }
        }
    }

    /// Handle one signed request. Always answers with a signed reply.
    pub async fn handle_request(&self, signed: SignedRequest) -> SignedReply {
        self.record(|s| s.requests += 1);
        let request = signed.body();
        let reply = match self.process_request(&signed).await {
            Ok(reply) => reply,
            Err(err) => {
                warn!(nym = %request.nym, command = ?request.command.command_type(), error = %err, "request rejected");
                self.record(|s| s.rejected += 1);
                Reply::new(request, ReplyStatus::Rejected(err.to_string()))
            }
        };
        Signed::sign(reply, &self.keypair)
    }

    async fn process_request(&self, signed: &SignedRequest) -> Result<Reply, NotaryError> {
        let request = signed.body();
        if request.notary != self.id {
            return Err(NotaryError::Rejected(format!("request is for notary {}", request.notary)));
        }
        let key = request
            .nym
            .public_key()
            .map_err(|e| NotaryError::Rejected(e.to_string()))?;
        if !signed.verify_with(&key) {
            return Err(NotaryError::Rejected("request signature invalid".to_string()));
        }

        if request.command == Command::RegisterNym {
            return self.register_nym(request).await;
        }

        let related = self.related_nyms(request);
        let guards = self.contexts.lock_many(&self.nym, &related).await?;
        let mut contexts = ContextSet::new(guards);
        let command_type = request.command.command_type();

        {
            let context = contexts
                .get_mut(&request.nym)
                .map_err(|_| NotaryError::Rejected("nym is not registered".to_string()))?;
            if !command_type.skips_sequencing() {
                if let Err(err) = context.accept_request_number(request.request_number) {
                    debug!(nym = %request.nym, error = %err, "stale request number");
                    self.record(|s| s.stale_requests += 1);
                    let current = context.request_number();
                    return Ok(Reply::new(request, ReplyStatus::StaleRequestNumber { current }));
                }
            }
            context.finalize_acknowledged_numbers(request.acknowledged.clone());
            context.set_remote_nymbox_hash(request.nymbox_hash);
        }

        let nymbox_hash = self.nymbox_hash(&request.nym).await?;
        if command_type.requires_nymbox_sync() && request.nymbox_hash != nymbox_hash {
            debug!(nym = %request.nym, ours = %nymbox_hash, theirs = %request.nymbox_hash, "nymbox hash mismatch");
            self.record(|s| s.nymbox_mismatches += 1);
            let mut reply = Reply::new(request, ReplyStatus::NymboxHashMismatch);
            reply.nymbox_hash = nymbox_hash;
            reply.acknowledged = request.acknowledged.clone();
            contexts.commit()?;
            return Ok(reply);
        }

        let checkpoint = contexts.checkpoint();
        let (status, payload) = match self.dispatch(&mut contexts, request).await {
            Ok(payload) => (ReplyStatus::Ok, payload),
            Err(err) => {
                warn!(nym = %request.nym, command = ?command_type, error = %err, "command failed");
                self.record(|s| s.rejected += 1);
                contexts.restore(checkpoint);
                (ReplyStatus::Rejected(err.to_string()), ReplyPayload::None)
            }
        };

        let nymbox_hash = self.nymbox_hash(&request.nym).await?;
        let acknowledged = {
            let context = contexts
                .get_mut(&request.nym)
                .map_err(|e| NotaryError::Rejected(e.to_string()))?;
            context.set_local_nymbox_hash(nymbox_hash);
            context.acknowledged_numbers().clone()
        };
        contexts.commit()?;

        let mut reply = Reply::new(request, status).with_payload(payload);
        reply.nymbox_hash = nymbox_hash;
        reply.acknowledged = acknowledged;
        Ok(reply)
    }

    /// Every nym whose context a request may touch
    fn related_nyms(&self, request: &Request) -> BTreeSet<NymId> {
        let mut nyms = BTreeSet::new();
        nyms.insert(request.nym.clone());

        if let Some(transaction) = request.command.transaction() {
            match transaction.body().operation() {
                Operation::DepositCheque { cheque } => {
                    nyms.insert(cheque.body().drawer().clone());
                }
                Operation::PaymentPlan { plan, .. } => {
                    nyms.insert(plan.body().sender().clone());
                    nyms.insert(plan.body().recipient().clone());
                }
                Operation::SmartContract { contract, .. } => {
                    nyms.extend(contract.parties.iter().map(|p| p.nym.clone()));
                }
                Operation::CancelCronItem { item } => {
                    if let Some(item) = self.cron.get(*item) {
                        nyms.extend(item.nyms());
                    }
                }
                _ => {}
            }
        }

        nyms.remove(&self.nym);
        nyms
    }

    async fn dispatch(&self, contexts: &mut ContextSet, request: &Request) -> Result<ReplyPayload, NotaryError> {
        let nym = &request.nym;
        match &request.command {
            Command::RegisterNym => Err(NotaryError::Rejected("nym already registered".to_string())),
            Command::GetRequestNumber => {
                let context = contexts.get(nym).map_err(|e| NotaryError::Rejected(e.to_string()))?;
                Ok(ReplyPayload::RequestNumber(context.request_number()))
            }
            Command::GetTransactionNumbers => self.issue_numbers(contexts, nym).await,
            Command::RegisterAccount { unit } => self.register_account(nym, unit).await,
            Command::IssueUnit { definition } => self.issue_unit(nym, definition.clone()).await,
            Command::NotarizeTransaction { transaction } => {
                if matches!(transaction.body().operation(), Operation::ProcessInbox { .. }) {
                    return Err(NotaryError::Rejected("inbox processing uses processInbox".to_string()));
                }
                let response = self.notarize(contexts, transaction.clone()).await;
                Ok(ReplyPayload::Transaction(Box::new(response)))
            }
            Command::ProcessInbox { transaction } => {
                if !matches!(transaction.body().operation(), Operation::ProcessInbox { .. }) {
                    return Err(NotaryError::Rejected("processInbox carries an inbox transaction".to_string()));
                }
                let response = self.notarize(contexts, transaction.clone()).await;
                Ok(ReplyPayload::Transaction(Box::new(response)))
            }
            Command::ProcessNymbox { accept, statement } => {
                self.process_nymbox(contexts, nym, accept, statement.as_ref()).await
            }
            Command::GetNymbox => {
                let nymbox = self.wallet.ledger(BoxKind::Nymbox, LedgerOwner::Nym(nym.clone())).await?;
                Ok(ReplyPayload::Nymbox(nymbox))
            }
            Command::GetAccountData { account } => {
                let snapshot = self
                    .wallet
                    .account(account)
                    .await?
                    .ok_or_else(|| NotaryError::Rejected(format!("account {} not found", account)))?;
                if snapshot.owner() != nym {
                    return Err(NotaryError::Rejected("account belongs to another nym".to_string()));
                }
                let inbox = self.wallet.ledger(BoxKind::Inbox, LedgerOwner::Account(*account)).await?;
                let outbox = self.wallet.ledger(BoxKind::Outbox, LedgerOwner::Account(*account)).await?;
                Ok(ReplyPayload::AccountData {
                    account: snapshot,
                    inbox,
                    outbox,
                })
            }
        }
    }

    // ========================================================================
    // COMMANDS
    // ========================================================================

    async fn register_nym(&self, request: &Request) -> Result<Reply, NotaryError> {
        if request.nym == self.nym {
            return Err(NotaryError::Rejected("the notary cannot register with itself".to_string()));
        }
        let guard = self
            .contexts
            .get_or_create_client(&self.nym, &request.nym, &self.id)
            .await?;
        let current = guard.request_number();
        guard.commit()?;
        info!(nym = %request.nym, "nym registered");

        let mut reply = Reply::new(request, ReplyStatus::Ok).with_payload(ReplyPayload::RequestNumber(current));
        reply.nymbox_hash = self.nymbox_hash(&request.nym).await?;
        Ok(reply)
    }

    /// Offer a batch of fresh numbers through the nymbox
    async fn issue_numbers(&self, contexts: &mut ContextSet, nym: &NymId) -> Result<ReplyPayload, NotaryError> {
        let batch = self.config.numbers_per_batch as usize;
        {
            let context = contexts.get(nym).map_err(|e| NotaryError::Rejected(e.to_string()))?;
            let outstanding = context.numbers().issued().len() + context.numbers().tentative().len();
            if outstanding + batch > self.config.max_outstanding_numbers {
                return Err(NotaryError::Rejected(format!(
                    "{} numbers outstanding, limit is {}",
                    outstanding, self.config.max_outstanding_numbers
                )));
            }
        }

        let mut allocated = self.allocate_numbers(batch + 1).await?;
        let receipt_number = allocated.pop().ok_or_else(|| NotaryError::Rejected("allocation failed".to_string()))?;
        let numbers: BTreeSet<TransactionNumber> = allocated.into_iter().collect();

        let context = contexts.get_mut(nym).map_err(|e| NotaryError::Rejected(e.to_string()))?;
        for number in &numbers {
            context.add_tentative_number(*number)?;
        }

        let statement = TransactionStatement::new(self.id, nym.clone(), numbers.clone(), numbers.clone()).sign(&self.keypair);
        let blank = BoxItem::new(BoxItemKind::Blank, receipt_number, 0).with_attachment(Attachment::Numbers(statement));
        let mut nymbox = self.wallet.lock_nymbox(nym).await?;
        nymbox.add(self.sign_receipt(blank))?;
        nymbox.commit()?;

        self.record(|s| s.numbers_issued += numbers.len() as u64);
        info!(nym = %nym, count = numbers.len(), "offered transaction numbers");
        Ok(ReplyPayload::Numbers(numbers))
    }

    async fn register_account(&self, nym: &NymId, unit: &UnitId) -> Result<ReplyPayload, NotaryError> {
        self.wallet.unit(unit).await?;
        let account = self
            .wallet
            .create_account(nym.clone(), self.id, *unit, AccountType::Simple)
            .await?;
        let snapshot = (*account).clone();
        account.commit()?;
        info!(nym = %nym, account = %snapshot.id(), "account registered");
        Ok(ReplyPayload::Account(snapshot))
    }

    /// Register a unit; plain units get an issuer account owned by the
    /// issuer, baskets get notary-owned issuer and reserve accounts
    async fn issue_unit(
        &self,
        nym: &NymId,
        definition: crate::ledger::UnitDefinition,
    ) -> Result<ReplyPayload, NotaryError> {
        if definition.notary() != &self.id {
            return Err(NotaryError::Rejected("unit is defined for another notary".to_string()));
        }
        if definition.issuer() != nym {
            return Err(NotaryError::Rejected("unit issuer must be the requesting nym".to_string()));
        }

        let unit = *definition.id();
        let basket = definition.basket_definition().cloned();
        if let Some(basket) = &basket {
            if !basket.is_valid() {
                return Err(NotaryError::Rejected("basket definition is invalid".to_string()));
            }
            for component in &basket.components {
                self.wallet.unit(&component.unit).await?;
            }
        }
        self.wallet.register_unit(definition).await?;

        let issuer_account = match &basket {
            None => {
                let account = self
                    .wallet
                    .create_account(nym.clone(), self.id, unit, AccountType::Issuer)
                    .await?;
                let snapshot = (*account).clone();
                account.commit()?;
                snapshot
            }
            Some(basket) => {
                let issuer = self.basket_issuer_account(&unit);
                self.wallet
                    .ensure_account(issuer, &self.nym, self.id, unit, AccountType::Issuer)
                    .await?;
                for component in &basket.components {
                    self.wallet
                        .ensure_account(
                            self.reserve_account(&unit, &component.unit),
                            &self.nym,
                            self.id,
                            component.unit,
                            AccountType::Reserve,
                        )
                        .await?;
                }
                self.wallet
                    .account(&issuer)
                    .await?
                    .ok_or_else(|| NotaryError::Rejected("basket issuer account missing".to_string()))?
            }
        };

        info!(nym = %nym, unit = %unit, basket = basket.is_some(), "unit issued");
        Ok(ReplyPayload::Account(issuer_account))
    }
}
