// Server session - one nym's conversation with one notary
//
// Every command goes out as a signed request carrying the next request
// number, the nymbox hash the nym last processed and the replies it has
// already seen. Delivery is retried a bounded number of times; a stale
// request number is resynced and a nymbox mismatch is repaired before the
// command is sent again. Transactions are rebuilt for each attempt so the
// balance agreement always matches the context it is sent from.

use crate::client::channel::NotaryChannel;
use crate::client::workflow::{PaymentWorkflow, WorkflowState};
use crate::consensus::{
    ConsensusContext, ConsensusError, ContextGuard, ContextRepository, PendingDelivery, SignedStatement,
    TransactionNumber, TransactionStatement,
};
use crate::identity::{AccountId, Keypair, NotaryId, NymId, PublicKey, Signed};
use crate::instrument::{
    BasketDirection, BuildError, Cheque, MarketOffer, Operation, PaymentPlan, PlanAction, SignedCheque,
    SignedContract, SignedPlan, SmartContract, TransactionBuilder, TransactionFailure, TransactionResponse,
};
use crate::ledger::{
    Account, Attachment, BoxItemKind, BoxKind, Ledger, LedgerError, LedgerHash, LedgerOwner, Receipt,
    UnitDefinition,
};
use crate::protocol::{Command, Reply, ReplyPayload, ReplyStatus, Request, SignedReply};
use crate::storage::{Storage, StoreError};
use chrono::Utc;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Delivery outcome unknown after {attempts} attempts")]
    Unknown { attempts: u32 },

    #[error("Request rejected: {0}")]
    Rejected(String),

    #[error("Invalid reply: {0}")]
    InvalidReply(String),

    #[error("Nymbox still out of sync after {0} repairs")]
    NymboxOutOfSync(u32),

    #[error("No transaction numbers available")]
    NoTransactionNumbers,

    #[error("Unknown account: {0}")]
    UnknownAccount(AccountId),

    #[error("Consensus error: {0}")]
    Consensus(#[from] ConsensusError),

    #[error("Ledger error: {0}")]
    Ledger(#[from] LedgerError),

    #[error("Storage error: {0}")]
    Storage(#[from] StoreError),

    #[error("Build error: {0}")]
    Build(#[from] BuildError),
}

// ============================================================================
// CONFIGURATION
// ============================================================================

#[derive(Clone, Debug)]
pub struct SessionConfig {
    /// Deliveries tried before the outcome is reported unknown
    pub max_attempts: u32,
    pub reply_timeout_ms: u64,
    /// Nymbox repairs allowed per command
    pub max_repairs: u32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            reply_timeout_ms: 5_000,
            max_repairs: 2,
        }
    }
}

impl SessionConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    pub fn with_reply_timeout_ms(mut self, ms: u64) -> Self {
        self.reply_timeout_ms = ms;
        self
    }

    pub fn with_max_repairs(mut self, repairs: u32) -> Self {
        self.max_repairs = repairs;
        self
    }

    pub fn reply_timeout(&self) -> Duration {
        Duration::from_millis(self.reply_timeout_ms)
    }

    pub fn validate(&self) -> Result<(), SessionError> {
        if self.max_attempts == 0 {
            return Err(SessionError::InvalidConfig("max_attempts must be > 0".to_string()));
        }
        if self.reply_timeout_ms == 0 {
            return Err(SessionError::InvalidConfig("reply_timeout_ms must be > 0".to_string()));
        }
        Ok(())
    }
}

// ============================================================================
// DELIVERY STATE
// ============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeliveryState {
    Idle,
    PendingSend,
    NeedNymbox,
    NeedBoxItems,
    NeedProcessNymbox,
    Delivered,
    Error,
}

/// What a delivery carries
#[derive(Clone, Debug)]
enum Outgoing {
    Command(Command),
    Transaction(TransactionIntent),
}

/// A transaction before it has a number and a balance agreement
#[derive(Clone, Debug)]
struct TransactionIntent {
    account: AccountId,
    operation: Operation,
    /// Change the operation makes to the account balance
    delta: i64,
    /// Numbers besides the transaction number the operation closes
    closing: BTreeSet<TransactionNumber>,
    /// The transaction number itself closes with the operation
    closes_own: bool,
    inbox_hash: Option<LedgerHash>,
    /// Numbers set aside for the operation, released if it fails
    reserved: Vec<TransactionNumber>,
}

impl TransactionIntent {
    fn new(account: AccountId, operation: Operation, delta: i64) -> Self {
        Self {
            account,
            operation,
            delta,
            closing: BTreeSet::new(),
            closes_own: true,
            inbox_hash: None,
            reserved: Vec::new(),
        }
    }

    fn kept_open(mut self) -> Self {
        self.closes_own = false;
        self
    }

    fn with_reserved(mut self, reserved: Vec<TransactionNumber>) -> Self {
        self.reserved = reserved;
        self
    }
}

/// The nym's copy of an account and its boxes as of the last download
#[derive(Clone, Debug)]
pub struct AccountCopy {
    pub account: Account,
    pub inbox: Ledger,
    pub outbox: Ledger,
}

fn now() -> i64 {
    Utc::now().timestamp()
}

// ============================================================================
// SERVER SESSION
// ============================================================================

pub struct ServerSession<C> {
    keypair: Keypair,
    nym: NymId,
    notary: NotaryId,
    notary_nym: NymId,
    notary_key: PublicKey,
    channel: C,
    config: SessionConfig,
    contexts: ContextRepository,
    state: DeliveryState,
    accounts: BTreeMap<AccountId, AccountCopy>,
    workflows: BTreeMap<TransactionNumber, PaymentWorkflow>,
    vouchers: Vec<SignedCheque>,
}

impl<C: NotaryChannel> ServerSession<C> {
    pub fn new(
        keypair: Keypair,
        notary_key: PublicKey,
        channel: C,
        storage: Arc<dyn Storage>,
        config: SessionConfig,
    ) -> Result<Self, SessionError> {
        config.validate()?;
        let nym = NymId::from_public_key(&keypair.public_key());
        Ok(Self {
            nym,
            notary: NotaryId::for_key(&notary_key),
            notary_nym: NymId::from_public_key(&notary_key),
            notary_key,
            keypair,
            channel,
            config,
            contexts: ContextRepository::new(storage),
            state: DeliveryState::Idle,
            accounts: BTreeMap::new(),
            workflows: BTreeMap::new(),
            vouchers: Vec::new(),
        })
    }

    pub fn nym(&self) -> &NymId {
        &self.nym
    }

    pub fn notary(&self) -> &NotaryId {
        &self.notary
    }

    pub fn state(&self) -> DeliveryState {
        self.state
    }

    pub fn channel(&self) -> &C {
        &self.channel
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Copy of the context with the notary
    pub async fn context(&self) -> Result<ConsensusContext, SessionError> {
        Ok((*self.lock_context().await?).clone())
    }

    pub fn account(&self, id: &AccountId) -> Option<&AccountCopy> {
        self.accounts.get(id)
    }

    pub fn workflow(&self, number: TransactionNumber) -> Option<&PaymentWorkflow> {
        self.workflows.get(&number)
    }

    pub fn workflows(&self) -> impl Iterator<Item = &PaymentWorkflow> {
        self.workflows.values()
    }

    /// Vouchers received through the nymbox
    pub fn vouchers(&self) -> &[SignedCheque] {
        &self.vouchers
    }

    pub fn take_vouchers(&mut self) -> Vec<SignedCheque> {
        std::mem::take(&mut self.vouchers)
    }

    async fn lock_context(&self) -> Result<ContextGuard, SessionError> {
        Ok(self
            .contexts
            .get_or_create_server(&self.nym, &self.notary_nym, &self.notary)
            .await?)
    }

    // ========================================================================
    // DELIVERY
    // ========================================================================

    /// Deliver once, retrying lost messages and stale request numbers
    async fn exchange(&mut self, outgoing: &Outgoing) -> Result<Reply, SessionError> {
        let mut failures = 0;
        let mut resyncs = 0;
        // a transaction whose reply went missing may already be applied
        let mut maybe_applied = false;

        loop {
            let mut context = self.lock_context().await?;
            let before = (*context).clone();
            self.state = DeliveryState::PendingSend;

            let request_number = context.next_request_number();
            let command = self.build_command(&mut context, outgoing)?;
            let command_type = command.command_type();
            let request = Request::new(self.nym.clone(), self.notary, request_number, command)
                .with_nymbox_hash(context.local_nymbox_hash())
                .with_acknowledged(context.acknowledged_numbers().clone());
            let bytes = Signed::sign(request, &self.keypair).to_bytes();

            let reply = match tokio::time::timeout(self.config.reply_timeout(), self.channel.exchange(bytes)).await {
                Ok(Ok(bytes)) => match self.open_reply(&bytes, request_number) {
                    Ok(reply) => Some(reply),
                    Err(err) => {
                        warn!(request = request_number, error = %err, "discarding reply");
                        None
                    }
                },
                Ok(Err(err)) => {
                    warn!(request = request_number, error = %err, "delivery failed");
                    None
                }
                Err(_) => {
                    warn!(request = request_number, "reply timed out");
                    None
                }
            };

            let Some(reply) = reply else {
                drop(context);
                failures += 1;
                maybe_applied |= matches!(outgoing, Outgoing::Transaction(_));
                if failures >= self.config.max_attempts {
                    self.state = DeliveryState::Error;
                    let mut context = self.lock_context().await?;
                    context.push_pending(PendingDelivery {
                        request_number,
                        command: command_type,
                        attempts: failures,
                    })?;
                    context.commit()?;
                    return Err(SessionError::Unknown { attempts: failures });
                }
                continue;
            };

            match &reply.status {
                ReplyStatus::StaleRequestNumber { current } => {
                    resyncs += 1;
                    if resyncs > self.config.max_attempts {
                        self.state = DeliveryState::Error;
                        return Err(SessionError::Unknown {
                            attempts: failures + resyncs,
                        });
                    }
                    if maybe_applied {
                        // the number stays out of the available set until the account is refreshed
                        warn!(ours = request_number, current, "transaction outcome unknown after lost reply");
                        self.state = DeliveryState::Error;
                        context.update_request_number(*current);
                        context.push_pending(PendingDelivery {
                            request_number,
                            command: command_type,
                            attempts: failures + resyncs,
                        })?;
                        context.commit()?;
                        return Err(SessionError::Unknown {
                            attempts: failures + resyncs,
                        });
                    }
                    debug!(ours = request_number, current, "request number stale, resyncing");
                    *context = before;
                    context.update_request_number(*current);
                    context.commit()?;
                    continue;
                }
                ReplyStatus::Ok => {}
                ReplyStatus::NymboxHashMismatch | ReplyStatus::Rejected(_) => {
                    // only the request number was spent
                    *context = before;
                }
            }

            if command_type.skips_sequencing() {
                if let ReplyPayload::RequestNumber(current) = &reply.payload {
                    context.update_request_number(*current);
                }
            } else {
                context.update_request_number(request_number);
            }
            context.remove_acknowledged_numbers(&reply.acknowledged);
            context.add_acknowledged_number(request_number);
            // requests refused before sequencing carry no nymbox hash
            if !matches!(reply.status, ReplyStatus::Rejected(_)) {
                context.set_remote_nymbox_hash(reply.nymbox_hash);
            }

            let settled: Vec<_> = context
                .pending_deliveries()?
                .iter()
                .map(|p| p.request_number)
                .filter(|n| *n <= request_number)
                .collect();
            for number in settled {
                context.resolve_pending(number)?;
            }

            if let (ReplyPayload::Transaction(response), Outgoing::Transaction(intent)) = (&reply.payload, outgoing) {
                Self::settle_numbers(&mut context, response.body(), intent)?;
            }
            context.commit()?;
            self.state = DeliveryState::Delivered;
            return Ok(reply);
        }
    }

    /// Deliver, repairing the nymbox first whenever the notary needs it
    async fn send(&mut self, outgoing: Outgoing) -> Result<Reply, SessionError> {
        let needs_sync = match &outgoing {
            Outgoing::Transaction(_) => true,
            Outgoing::Command(command) => command.command_type().requires_nymbox_sync(),
        };
        let mut repairs = 0;

        loop {
            let in_sync = self.lock_context().await?.nymbox_in_sync();
            if needs_sync && !in_sync {
                if repairs >= self.config.max_repairs {
                    self.state = DeliveryState::Error;
                    return Err(SessionError::NymboxOutOfSync(repairs));
                }
                repairs += 1;
                debug!(repairs, "nymbox out of date, processing before sending");
                self.process_nymbox().await?;
                continue;
            }

            let reply = self.exchange(&outgoing).await?;
            if reply.status != ReplyStatus::NymboxHashMismatch {
                return Ok(reply);
            }
            if repairs >= self.config.max_repairs {
                self.state = DeliveryState::Error;
                return Err(SessionError::NymboxOutOfSync(repairs));
            }
            repairs += 1;
            info!(repairs, "notary reports nymbox mismatch, repairing");
            self.process_nymbox().await?;
        }
    }

    /// Send a command and insist on an accepted reply
    async fn command(&mut self, command: Command) -> Result<Reply, SessionError> {
        let reply = self.send(Outgoing::Command(command)).await?;
        match &reply.status {
            ReplyStatus::Ok => Ok(reply),
            ReplyStatus::Rejected(reason) => Err(SessionError::Rejected(reason.clone())),
            other => Err(SessionError::InvalidReply(format!("unexpected status {:?}", other))),
        }
    }

    /// Notarize a transaction and return the notary's response
    async fn transact(&mut self, intent: TransactionIntent) -> Result<TransactionResponse, SessionError> {
        let reserved = intent.reserved.clone();
        let reply = match self.send(Outgoing::Transaction(intent)).await {
            Ok(reply) => reply,
            Err(err) => {
                if !matches!(err, SessionError::Unknown { .. }) {
                    for number in reserved {
                        self.release_number(number).await?;
                    }
                }
                return Err(err);
            }
        };
        match reply.payload {
            ReplyPayload::Transaction(response) => Ok(response.into_body()),
            _ => match reply.status {
                ReplyStatus::Rejected(reason) => {
                    for number in reserved {
                        self.release_number(number).await?;
                    }
                    Err(SessionError::Rejected(reason))
                }
                other => Err(SessionError::InvalidReply(format!("no transaction response, status {:?}", other))),
            },
        }
    }

    fn build_command(&self, context: &mut ConsensusContext, outgoing: &Outgoing) -> Result<Command, SessionError> {
        let intent = match outgoing {
            Outgoing::Command(command) => return Ok(command.clone()),
            Outgoing::Transaction(intent) => intent,
        };

        let number = context
            .available_numbers()
            .iter()
            .next()
            .copied()
            .ok_or(SessionError::NoTransactionNumbers)?;
        context.consume_available(number)?;

        let mut closing = intent.closing.clone();
        if intent.closes_own {
            closing.insert(number);
        }
        let statement = context.statement(&BTreeSet::new(), &closing);
        let balance = self
            .accounts
            .get(&intent.account)
            .ok_or(SessionError::UnknownAccount(intent.account))?
            .account
            .balance();

        let mut builder = TransactionBuilder::new()
            .signer(&self.keypair)
            .notary(self.notary)
            .account(intent.account)
            .number(number)
            .operation(intent.operation.clone())
            .balance_agreement(balance + intent.delta, statement);
        if let Some(hash) = intent.inbox_hash {
            builder = builder.inbox_hash(hash);
        }
        let transaction = builder.build()?;

        Ok(match intent.operation {
            Operation::ProcessInbox { .. } => Command::ProcessInbox { transaction },
            _ => Command::NotarizeTransaction { transaction },
        })
    }

    fn open_reply(&self, bytes: &[u8], request_number: u64) -> Result<Reply, SessionError> {
        let signed = SignedReply::from_bytes(bytes).map_err(|e| SessionError::InvalidReply(e.to_string()))?;
        if !signed.verify_with(&self.notary_key) {
            return Err(SessionError::InvalidReply("reply is not signed by the notary".to_string()));
        }
        let reply = signed.into_body();
        if reply.nym != self.nym || reply.notary != self.notary || reply.request_number != request_number {
            return Err(SessionError::InvalidReply("reply answers another request".to_string()));
        }
        if let ReplyPayload::Transaction(response) = &reply.payload {
            if !response.verify_with(&self.notary_key) {
                return Err(SessionError::InvalidReply("response is not signed by the notary".to_string()));
            }
        }
        Ok(reply)
    }

    /// Mirror the notary's number bookkeeping for a transaction response
    fn settle_numbers(
        context: &mut ConsensusContext,
        response: &TransactionResponse,
        intent: &TransactionIntent,
    ) -> Result<(), ConsensusError> {
        for number in &response.closed {
            if context.verify_issued_number(*number) {
                context.consume_issued(*number)?;
            }
        }

        let number = response.number();
        let release_reserved = match &response.failure {
            None | Some(TransactionFailure::PlanCancelled(_)) => false,
            Some(TransactionFailure::TransactionNumberInvalid(n)) if *n == number => {
                warn!(number, "notary does not hold our transaction number");
                true
            }
            Some(failure) => {
                debug!(number, %failure, consumed = response.number_consumed, "transaction failed");
                if !response.number_consumed && context.verify_issued_number(number) {
                    context.recover_available_number(number)?;
                }
                true
            }
        };
        if release_reserved {
            for reserved in &intent.reserved {
                if context.verify_issued_number(*reserved) && !context.verify_available_number(*reserved) {
                    context.recover_available_number(*reserved)?;
                }
            }
        }
        Ok(())
    }

    // ========================================================================
    // NYMBOX
    // ========================================================================

    /// Download the nymbox, accept everything in it and bring the local
    /// nymbox hash up to date. Returns the number of items processed.
    pub async fn process_nymbox(&mut self) -> Result<usize, SessionError> {
        self.state = DeliveryState::NeedNymbox;
        let reply = self.exchange(&Outgoing::Command(Command::GetNymbox)).await?;
        let nymbox = match reply.payload {
            ReplyPayload::Nymbox(nymbox) => nymbox,
            _ => {
                self.state = DeliveryState::Error;
                return Err(SessionError::Rejected(format!("getNymbox answered {:?}", reply.status)));
            }
        };

        self.state = DeliveryState::NeedBoxItems;
        if !nymbox.verify_hash() || nymbox.hash() != reply.nymbox_hash {
            self.state = DeliveryState::Error;
            return Err(SessionError::InvalidReply("nymbox hash does not verify".to_string()));
        }
        if nymbox.items().any(|receipt| !receipt.verify_with(&self.notary_key)) {
            self.state = DeliveryState::Error;
            return Err(SessionError::InvalidReply("nymbox item not signed by the notary".to_string()));
        }

        if nymbox.is_empty() {
            let mut context = self.lock_context().await?;
            context.set_local_nymbox_hash(nymbox.hash());
            context.commit()?;
            self.state = DeliveryState::Delivered;
            return Ok(0);
        }

        let mut offered: Vec<SignedStatement> = Vec::new();
        let statement = {
            let mut context = self.lock_context().await?;
            let mut closed = BTreeSet::new();
            for receipt in nymbox.items() {
                let item = receipt.body();
                match (item.kind(), item.attachment()) {
                    (BoxItemKind::Blank, Attachment::Numbers(numbers)) => {
                        if !numbers.verify_with(&self.notary_key) || numbers.body().nym() != &self.nym {
                            return Err(SessionError::InvalidReply("blank numbers not meant for us".to_string()));
                        }
                        for number in numbers.body().issued() {
                            if !context.verify_issued_number(*number) {
                                context.add_tentative_number(*number)?;
                            }
                        }
                        offered.push(numbers.clone());
                    }
                    (BoxItemKind::FinalReceipt, _) => {
                        closed.extend(
                            item.closing_numbers()
                                .iter()
                                .filter(|n| context.verify_issued_number(**n))
                                .copied(),
                        );
                    }
                    _ => {}
                }
            }

            let adding: BTreeSet<TransactionNumber> = offered
                .iter()
                .flat_map(|s| s.body().issued().iter().copied())
                .filter(|n| !context.verify_issued_number(*n))
                .collect();
            let statement = if offered.is_empty() {
                None
            } else {
                Some(context.statement(&adding, &closed).sign(&self.keypair))
            };
            context.commit()?;
            statement
        };

        self.state = DeliveryState::NeedProcessNymbox;
        let accept: BTreeSet<u64> = nymbox.items().map(|r| r.body().number()).collect();
        let reply = self
            .exchange(&Outgoing::Command(Command::ProcessNymbox {
                accept: accept.clone(),
                statement,
            }))
            .await?;
        if reply.status != ReplyStatus::Ok {
            self.state = DeliveryState::Error;
            return Err(SessionError::Rejected(format!("processNymbox answered {:?}", reply.status)));
        }
        let closed = match reply.payload {
            ReplyPayload::NymboxProcessed { closed, .. } => closed,
            _ => BTreeSet::new(),
        };

        let mut context = self.lock_context().await?;
        for numbers in &offered {
            let body = numbers.body();
            let fresh: BTreeSet<_> = body
                .issued()
                .iter()
                .filter(|n| !context.verify_issued_number(**n))
                .copied()
                .collect();
            context.accept_issued_numbers(&TransactionStatement::new(
                *body.notary(),
                body.nym().clone(),
                fresh.clone(),
                fresh,
            ))?;
        }
        for number in &closed {
            if context.verify_issued_number(*number) {
                context.consume_issued(*number)?;
            }
        }
        for receipt in nymbox.items() {
            self.absorb_notice(&mut context, receipt)?;
        }

        let mut remaining = nymbox.clone();
        for number in &accept {
            remaining.remove(*number)?;
        }
        context.set_local_nymbox_hash(remaining.hash());
        context.commit()?;

        self.state = DeliveryState::Delivered;
        info!(
            items = accept.len(),
            numbers = offered.iter().map(|s| s.body().issued().len()).sum::<usize>(),
            closed = closed.len(),
            "nymbox processed"
        );
        Ok(accept.len())
    }

    fn absorb_notice(&mut self, context: &mut ConsensusContext, receipt: &Receipt) -> Result<(), SessionError> {
        let item = receipt.body();
        if item.kind() != BoxItemKind::Notice {
            return Ok(());
        }
        match item.attachment() {
            Attachment::Cheque(voucher) => {
                debug!(number = voucher.body().number(), amount = voucher.body().amount(), "voucher received");
                self.vouchers.push(voucher.clone());
            }
            Attachment::Transaction(transaction) => {
                if let Operation::PaymentPlan {
                    plan,
                    action: PlanAction::Cancel,
                    ..
                } = transaction.body().operation()
                {
                    let plan = plan.body();
                    let closing = plan.recipient_closing();
                    if plan.recipient() == &self.nym
                        && transaction.body().nym() == plan.sender()
                        && context.verify_issued_number(closing)
                        && !context.verify_available_number(closing)
                    {
                        context.recover_available_number(closing)?;
                        info!(number = closing, "plan refused by sender, closing number recovered");
                    }
                }
            }
            _ => {}
        }
        Ok(())
    }

    // ========================================================================
    // REGISTRATION AND NUMBERS
    // ========================================================================

    /// Register the nym; returns the current request number
    pub async fn register(&mut self) -> Result<u64, SessionError> {
        let reply = self.command(Command::RegisterNym).await?;
        match reply.payload {
            ReplyPayload::RequestNumber(current) => Ok(current),
            _ => Err(SessionError::InvalidReply("registerNym without request number".to_string())),
        }
    }

    pub async fn sync_request_number(&mut self) -> Result<u64, SessionError> {
        let reply = self.command(Command::GetRequestNumber).await?;
        match reply.payload {
            ReplyPayload::RequestNumber(current) => Ok(current),
            _ => Err(SessionError::InvalidReply("getRequestNumber without request number".to_string())),
        }
    }

    /// Ask for a batch of transaction numbers and accept it from the nymbox
    pub async fn request_numbers(&mut self) -> Result<BTreeSet<TransactionNumber>, SessionError> {
        let reply = self.command(Command::GetTransactionNumbers).await?;
        let numbers = match reply.payload {
            ReplyPayload::Numbers(numbers) => numbers,
            _ => return Err(SessionError::InvalidReply("getTransactionNumbers without numbers".to_string())),
        };
        self.process_nymbox().await?;
        info!(count = numbers.len(), "transaction numbers accepted");
        Ok(numbers)
    }

    /// Set aside an available number for an instrument
    pub async fn reserve_number(&self) -> Result<TransactionNumber, SessionError> {
        let mut context = self.lock_context().await?;
        let number = context
            .available_numbers()
            .iter()
            .next()
            .copied()
            .ok_or(SessionError::NoTransactionNumbers)?;
        context.consume_available(number)?;
        context.commit()?;
        Ok(number)
    }

    /// Return a reserved number that the notary never saw used
    pub async fn release_number(&self, number: TransactionNumber) -> Result<(), SessionError> {
        let mut context = self.lock_context().await?;
        if context.verify_issued_number(number) && !context.verify_available_number(number) {
            context.recover_available_number(number)?;
            context.commit()?;
        }
        Ok(())
    }

    // ========================================================================
    // ACCOUNTS AND UNITS
    // ========================================================================

    fn track_account(&mut self, account: Account) -> AccountId {
        let id = *account.id();
        self.accounts.insert(
            id,
            AccountCopy {
                inbox: Ledger::new(BoxKind::Inbox, LedgerOwner::Account(id)),
                outbox: Ledger::new(BoxKind::Outbox, LedgerOwner::Account(id)),
                account,
            },
        );
        id
    }

    pub async fn register_account(&mut self, unit: crate::identity::UnitId) -> Result<AccountId, SessionError> {
        let reply = self.command(Command::RegisterAccount { unit }).await?;
        match reply.payload {
            ReplyPayload::Account(account) => Ok(self.track_account(account)),
            _ => Err(SessionError::InvalidReply("registerAccount without account".to_string())),
        }
    }

    /// Issue a unit; returns its issuer account
    pub async fn issue_unit(&mut self, definition: UnitDefinition) -> Result<AccountId, SessionError> {
        let reply = self.command(Command::IssueUnit { definition }).await?;
        match reply.payload {
            ReplyPayload::Account(account) => {
                if account.owner() == &self.nym {
                    Ok(self.track_account(account))
                } else {
                    Ok(*account.id())
                }
            }
            _ => Err(SessionError::InvalidReply("issueUnit without account".to_string())),
        }
    }

    /// Download an account with its boxes and advance the workflows its
    /// receipts settle
    pub async fn refresh_account(&mut self, id: &AccountId) -> Result<Account, SessionError> {
        let reply = self.command(Command::GetAccountData { account: *id }).await?;
        let (account, inbox, outbox) = match reply.payload {
            ReplyPayload::AccountData { account, inbox, outbox } => (account, inbox, outbox),
            _ => return Err(SessionError::InvalidReply("getAccountData without account".to_string())),
        };
        if !inbox.verify_hash() || !outbox.verify_hash() {
            return Err(SessionError::InvalidReply("account box hash does not verify".to_string()));
        }

        let now = now();
        for receipt in inbox.items() {
            let item = receipt.body();
            if matches!(item.kind(), BoxItemKind::ChequeReceipt | BoxItemKind::TransferReceipt) {
                self.advance_workflow(item.in_reference_to(), WorkflowState::Accepted, now);
            }
        }

        self.accounts.insert(
            *id,
            AccountCopy {
                account: account.clone(),
                inbox,
                outbox,
            },
        );
        Ok(account)
    }

    fn advance_workflow(&mut self, number: TransactionNumber, to: WorkflowState, now: i64) {
        if let Some(workflow) = self.workflows.get_mut(&number) {
            if workflow.state() == to {
                return;
            }
            if let Err(err) = workflow.advance(to, now) {
                debug!(error = %err, "workflow unchanged");
            }
        }
    }

    // ========================================================================
    // PAYMENTS
    // ========================================================================

    pub async fn transfer(
        &mut self,
        from: AccountId,
        to: AccountId,
        amount: i64,
        memo: impl Into<String>,
    ) -> Result<TransactionResponse, SessionError> {
        self.refresh_account(&from).await?;
        let operation = Operation::Transfer {
            to_account: to,
            amount,
            memo: memo.into(),
        };
        // the number stays open until the recipient accepts
        let response = self
            .transact(TransactionIntent::new(from, operation, -amount).kept_open())
            .await?;

        let now = now();
        let mut workflow = PaymentWorkflow::transfer(response.number(), from, amount, now);
        let next = if response.success {
            WorkflowState::Acknowledged
        } else {
            WorkflowState::Failed
        };
        if let Err(err) = workflow.advance(next, now) {
            debug!(error = %err, "transfer workflow unchanged");
        }
        self.workflows.insert(response.number(), workflow);
        Ok(response)
    }

    /// Write a cheque against one of our accounts
    #[allow(clippy::too_many_arguments)]
    pub async fn write_cheque(
        &mut self,
        account: AccountId,
        recipient: Option<NymId>,
        amount: i64,
        valid_from: i64,
        valid_to: i64,
        memo: impl Into<String>,
    ) -> Result<SignedCheque, SessionError> {
        let unit = *self
            .accounts
            .get(&account)
            .ok_or(SessionError::UnknownAccount(account))?
            .account
            .unit();
        let number = self.reserve_number().await?;
        let cheque = Cheque::new(
            self.notary,
            unit,
            self.nym.clone(),
            account,
            recipient.clone(),
            amount,
            number,
            valid_from,
            valid_to,
        )
        .with_memo(memo);

        self.workflows
            .insert(number, PaymentWorkflow::cheque(number, account, amount, recipient, now()));
        debug!(number, amount, "cheque written");
        Ok(Signed::sign(cheque, &self.keypair))
    }

    /// Record that a cheque left our hands
    pub fn convey_cheque(&mut self, number: TransactionNumber) -> Result<(), SessionError> {
        let workflow = self
            .workflows
            .get_mut(&number)
            .ok_or_else(|| SessionError::Rejected(format!("no workflow for cheque {}", number)))?;
        workflow
            .advance(WorkflowState::Conveyed, now())
            .map_err(|e| SessionError::Rejected(e.to_string()))
    }

    pub async fn deposit_cheque(
        &mut self,
        account: AccountId,
        cheque: SignedCheque,
    ) -> Result<TransactionResponse, SessionError> {
        self.refresh_account(&account).await?;
        let amount = cheque.body().amount();
        self.transact(TransactionIntent::new(account, Operation::DepositCheque { cheque }, amount))
            .await
    }

    /// Buy a notary-drawn voucher; the response carries it
    pub async fn withdraw_voucher(
        &mut self,
        account: AccountId,
        amount: i64,
        recipient: Option<NymId>,
    ) -> Result<TransactionResponse, SessionError> {
        self.refresh_account(&account).await?;
        let operation = Operation::WithdrawVoucher { amount, recipient };
        self.transact(TransactionIntent::new(account, operation, -amount)).await
    }

    /// Pay `amount_per_share` to every holder of `share_unit`
    pub async fn pay_dividend(
        &mut self,
        account: AccountId,
        share_unit: crate::identity::UnitId,
        amount_per_share: i64,
        shares_outstanding: i64,
    ) -> Result<TransactionResponse, SessionError> {
        self.refresh_account(&account).await?;
        let total = amount_per_share
            .checked_mul(shares_outstanding)
            .ok_or_else(|| SessionError::Rejected("dividend total overflows".to_string()))?;
        let operation = Operation::PayDividend {
            share_unit,
            amount_per_share,
        };
        self.transact(TransactionIntent::new(account, operation, -total)).await
    }

    /// Exchange basket units against their components. `account` holds the
    /// basket units.
    pub async fn exchange_basket(
        &mut self,
        account: AccountId,
        basket: &UnitDefinition,
        direction: BasketDirection,
        multiple: i64,
        component_accounts: Vec<AccountId>,
    ) -> Result<TransactionResponse, SessionError> {
        let definition = basket
            .basket_definition()
            .ok_or_else(|| SessionError::Rejected("unit is not a basket".to_string()))?;
        let units = definition
            .minimum_transfer
            .checked_mul(multiple)
            .ok_or_else(|| SessionError::Rejected("basket amount overflows".to_string()))?;
        let delta = match direction {
            BasketDirection::In => units,
            BasketDirection::Out => -units,
        };

        self.refresh_account(&account).await?;
        let operation = Operation::ExchangeBasket {
            basket: *basket.id(),
            direction,
            multiple,
            component_accounts,
        };
        self.transact(TransactionIntent::new(account, operation, delta)).await
    }

    /// Accept everything in an account's inbox. Returns `None` when the
    /// inbox is empty.
    pub async fn process_inbox(&mut self, account: AccountId) -> Result<Option<TransactionResponse>, SessionError> {
        self.refresh_account(&account).await?;
        let context = self.context().await?;
        let copy = self.accounts.get(&account).ok_or(SessionError::UnknownAccount(account))?;
        if copy.inbox.is_empty() {
            return Ok(None);
        }

        let mut accept = BTreeSet::new();
        let mut closing = BTreeSet::new();
        let mut delta = 0i64;
        let mut settled = Vec::new();
        for receipt in copy.inbox.items() {
            let item = receipt.body();
            accept.insert(item.number());
            match item.kind() {
                BoxItemKind::Pending if item.to_account() == Some(&account) => {
                    delta = delta
                        .checked_add(item.amount())
                        .ok_or_else(|| SessionError::Rejected("inbox total overflows".to_string()))?;
                }
                BoxItemKind::TransferReceipt | BoxItemKind::ChequeReceipt | BoxItemKind::FinalReceipt => {
                    closing.extend(
                        item.closing_numbers()
                            .iter()
                            .filter(|n| context.verify_issued_number(**n))
                            .copied(),
                    );
                    settled.push(item.in_reference_to());
                }
                _ => {}
            }
        }

        let mut intent = TransactionIntent::new(account, Operation::ProcessInbox { accept }, delta);
        intent.closing = closing;
        intent.inbox_hash = Some(copy.inbox.hash());
        let response = self.transact(intent).await?;

        if response.success {
            let now = now();
            for number in settled {
                self.advance_workflow(number, WorkflowState::Accepted, now);
                self.advance_workflow(number, WorkflowState::Completed, now);
            }
        }
        self.refresh_account(&account).await?;
        Ok(Some(response))
    }

    // ========================================================================
    // AGREEMENTS
    // ========================================================================

    /// Sign a plan as its recipient. The plan's closing number must come
    /// from `reserve_number`.
    pub fn sign_plan(&self, plan: PaymentPlan) -> SignedPlan {
        Signed::sign(plan, &self.keypair)
    }

    /// Activate a plan the recipient signed, as its sender
    pub async fn activate_plan(&mut self, plan: SignedPlan) -> Result<TransactionResponse, SessionError> {
        let account = *plan.body().sender_account();
        self.refresh_account(&account).await?;
        let sender_closing = self.reserve_number().await?;
        let operation = Operation::PaymentPlan {
            plan,
            sender_closing,
            action: PlanAction::Activate,
        };
        self.transact(
            TransactionIntent::new(account, operation, 0)
                .kept_open()
                .with_reserved(vec![sender_closing]),
        )
        .await
    }

    /// Refuse a plan on purpose so that both parties get their numbers
    /// back. As recipient, our own closing number is burnt with it.
    pub async fn cancel_plan(&mut self, account: AccountId, plan: SignedPlan) -> Result<TransactionResponse, SessionError> {
        self.refresh_account(&account).await?;
        let mut closing = BTreeSet::new();
        if plan.body().recipient() == &self.nym {
            closing.insert(plan.body().recipient_closing());
        }
        let operation = Operation::PaymentPlan {
            plan,
            sender_closing: 0,
            action: PlanAction::Cancel,
        };
        let mut intent = TransactionIntent::new(account, operation, 0);
        intent.closing = closing;
        self.transact(intent).await
    }

    /// Place a market offer; owner, notary and closing numbers are filled in
    pub async fn place_offer(&mut self, mut offer: MarketOffer) -> Result<TransactionResponse, SessionError> {
        let account = offer.asset_account;
        self.refresh_account(&account).await?;
        offer.owner = self.nym.clone();
        offer.notary = self.notary;
        offer.closing_asset = self.reserve_number().await?;
        offer.closing_currency = self.reserve_number().await?;
        let reserved = vec![offer.closing_asset, offer.closing_currency];
        self.transact(
            TransactionIntent::new(account, Operation::MarketOffer { offer }, 0)
                .kept_open()
                .with_reserved(reserved),
        )
        .await
    }

    pub fn endorse_contract(&self, contract: SmartContract) -> SignedContract {
        Signed::sign(contract, &self.keypair)
    }

    /// Activate a contract every party has endorsed; our party entry's
    /// closing number must come from `reserve_number`
    pub async fn activate_contract(
        &mut self,
        contract: SmartContract,
        endorsements: Vec<SignedContract>,
    ) -> Result<TransactionResponse, SessionError> {
        let party = contract
            .party(&self.nym)
            .cloned()
            .ok_or_else(|| SessionError::Rejected("not a party to the contract".to_string()))?;
        self.refresh_account(&party.account).await?;
        let operation = Operation::SmartContract { contract, endorsements };
        self.transact(
            TransactionIntent::new(party.account, operation, 0)
                .kept_open()
                .with_reserved(vec![party.closing_number]),
        )
        .await
    }

    pub async fn cancel_cron_item(
        &mut self,
        account: AccountId,
        item: TransactionNumber,
    ) -> Result<TransactionResponse, SessionError> {
        self.refresh_account(&account).await?;
        self.transact(TransactionIntent::new(account, Operation::CancelCronItem { item }, 0))
            .await
    }
}
