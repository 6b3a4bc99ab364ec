// Transaction - one ledger-mutating operation authorized by one
// transaction number, plus the nym's balance agreement

use crate::consensus::{ConsensusError, SignedStatement, TransactionNumber};
use crate::identity::{AccountId, Document, NotaryId, NymId, Signed, UnitId};
use crate::instrument::{
    BasketDirection, MarketOffer, PlanAction, SignedCheque, SignedContract, SignedPlan, SmartContract,
};
use crate::ledger::{LedgerError, LedgerHash};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use thiserror::Error;

/// The nym's signed view of its account after the operation
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BalanceAgreement {
    pub account: AccountId,
    /// Balance once the operation has been applied
    pub expected_balance: i64,
    /// Numbers the nym will hold once the operation has been applied
    pub statement: SignedStatement,
    /// Inbox the nym last saw, if it wants that checked too
    pub inbox_hash: Option<LedgerHash>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Operation {
    Transfer {
        to_account: AccountId,
        amount: i64,
        memo: String,
    },
    DepositCheque {
        cheque: SignedCheque,
    },
    WithdrawVoucher {
        amount: i64,
        recipient: Option<NymId>,
    },
    MarketOffer {
        offer: MarketOffer,
    },
    PaymentPlan {
        plan: SignedPlan,
        /// The sender's closing number; unused when the recipient cancels
        sender_closing: TransactionNumber,
        action: PlanAction,
    },
    SmartContract {
        contract: SmartContract,
        endorsements: Vec<SignedContract>,
    },
    CancelCronItem {
        item: TransactionNumber,
    },
    ExchangeBasket {
        basket: UnitId,
        direction: BasketDirection,
        /// Multiples of the basket's minimum transfer
        multiple: i64,
        /// One account per basket component, in component order
        component_accounts: Vec<AccountId>,
    },
    PayDividend {
        share_unit: UnitId,
        amount_per_share: i64,
    },
    ProcessInbox {
        accept: BTreeSet<u64>,
    },
}

impl Operation {
    pub fn name(&self) -> &'static str {
        match self {
            Operation::Transfer { .. } => "transfer",
            Operation::DepositCheque { .. } => "deposit_cheque",
            Operation::WithdrawVoucher { .. } => "withdraw_voucher",
            Operation::MarketOffer { .. } => "market_offer",
            Operation::PaymentPlan { .. } => "payment_plan",
            Operation::SmartContract { .. } => "smart_contract",
            Operation::CancelCronItem { .. } => "cancel_cron_item",
            Operation::ExchangeBasket { .. } => "exchange_basket",
            Operation::PayDividend { .. } => "pay_dividend",
            Operation::ProcessInbox { .. } => "process_inbox",
        }
    }

    /// Cron operations register an agreement instead of moving funds now
    pub fn is_cron(&self) -> bool {
        matches!(
            self,
            Operation::MarketOffer { .. }
                | Operation::PaymentPlan {
                    action: PlanAction::Activate,
                    ..
                }
                | Operation::SmartContract { .. }
        )
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    notary: NotaryId,
    nym: NymId,
    account: AccountId,
    number: TransactionNumber,
    operation: Operation,
    balance_agreement: BalanceAgreement,
    created_at: i64,
}

impl Document for Transaction {
    const DOMAIN: &'static [u8] = b"otx:transaction:";
}

pub type SignedTransaction = Signed<Transaction>;

impl Transaction {
    pub fn new(
        notary: NotaryId,
        nym: NymId,
        account: AccountId,
        number: TransactionNumber,
        operation: Operation,
        balance_agreement: BalanceAgreement,
        created_at: i64,
    ) -> Self {
        Self {
            notary,
            nym,
            account,
            number,
            operation,
            balance_agreement,
            created_at,
        }
    }

    pub fn notary(&self) -> &NotaryId {
        &self.notary
    }

    pub fn nym(&self) -> &NymId {
        &self.nym
    }

    pub fn account(&self) -> &AccountId {
        &self.account
    }

    pub fn number(&self) -> TransactionNumber {
        self.number
    }

    pub fn operation(&self) -> &Operation {
        &self.operation
    }

    pub fn balance_agreement(&self) -> &BalanceAgreement {
        &self.balance_agreement
    }

    pub fn created_at(&self) -> i64 {
        self.created_at
    }
}

/// Why the notary refused a transaction. Carried inside the signed
/// response; never returned as an `Err` from notarization.
#[derive(Error, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransactionFailure {
    #[error("Insufficient funds: available {available}, required {required}")]
    InsufficientFunds { available: i64, required: i64 },

    #[error("Balance agreement mismatch: {0}")]
    BalanceAgreementMismatch(String),

    #[error("Transaction number {0} is not available")]
    TransactionNumberInvalid(TransactionNumber),

    #[error("Account not found: {0}")]
    AccountNotFound(AccountId),

    #[error("Signature invalid")]
    SignatureInvalid,

    #[error("Cheque invalid: {0}")]
    ChequeInvalid(String),

    #[error("Accounts are denominated in different units")]
    UnitMismatch,

    #[error("Account is not owned by the requesting nym")]
    NotOwner,

    #[error("Cron item {0} not found")]
    CronItemNotFound(TransactionNumber),

    #[error("Too many active cron items")]
    CronLimitReached,

    #[error("Agreement invalid: {0}")]
    AgreementInvalid(String),

    #[error("Basket exchange invalid: {0}")]
    BasketInvalid(String),

    #[error("Payment plan cancelled by {0}")]
    PlanCancelled(NymId),

    #[error("Inbox item {0} not found")]
    InboxItemNotFound(u64),

    #[error("Invalid amount: {0}")]
    InvalidAmount(i64),

    #[error("Corrupted state: {0}")]
    CorruptedState(String),
}

impl From<LedgerError> for TransactionFailure {
    fn from(err: LedgerError) -> Self {
        match err {
            LedgerError::InsufficientFunds { available, required } => {
                TransactionFailure::InsufficientFunds { available, required }
            }
            LedgerError::AccountNotFound(id) => TransactionFailure::AccountNotFound(id),
            LedgerError::InvalidAmount(amount) => TransactionFailure::InvalidAmount(amount),
            LedgerError::UnitMismatch => TransactionFailure::UnitMismatch,
            LedgerError::ItemNotFound(number) => TransactionFailure::InboxItemNotFound(number),
            other => TransactionFailure::CorruptedState(other.to_string()),
        }
    }
}

impl From<ConsensusError> for TransactionFailure {
    fn from(err: ConsensusError) -> Self {
        match err {
            ConsensusError::NumberNotFound(number) => TransactionFailure::TransactionNumberInvalid(number),
            other => TransactionFailure::CorruptedState(other.to_string()),
        }
    }
}

/// The notary's mirrored answer to a transaction, produced on success and
/// failure alike
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionResponse {
    pub notary: NotaryId,
    pub request: Box<SignedTransaction>,
    pub success: bool,
    pub failure: Option<TransactionFailure>,
    /// The transaction number is spent (opened or closed) at the notary
    pub number_consumed: bool,
    /// Requester numbers the notary closed while processing
    pub closed: BTreeSet<TransactionNumber>,
    /// Requester account balance after processing
    pub balance: Option<i64>,
    pub voucher: Option<SignedCheque>,
}

impl Document for TransactionResponse {
    const DOMAIN: &'static [u8] = b"otx:response:";
}

pub type SignedResponse = Signed<TransactionResponse>;

impl TransactionResponse {
    pub fn success(notary: NotaryId, request: SignedTransaction) -> Self {
        Self {
            notary,
            request: Box::new(request),
            success: true,
            failure: None,
            number_consumed: true,
            closed: BTreeSet::new(),
            balance: None,
            voucher: None,
        }
    }

    pub fn failure(notary: NotaryId, request: SignedTransaction, failure: TransactionFailure, consumed: bool) -> Self {
        Self {
            notary,
            request: Box::new(request),
            success: false,
            failure: Some(failure),
            number_consumed: consumed,
            closed: BTreeSet::new(),
            balance: None,
            voucher: None,
        }
    }

    /// Number of the transaction this answers
    pub fn number(&self) -> TransactionNumber {
        self.request.body().number()
    }
}
