// Messages - wire format of the OTX protocol
//
// Every request names the nym, the notary and a request number, and is
// signed by the nym. Every reply mirrors the request number and command,
// reports the nym's current nymbox hash, and is signed by the notary.

use crate::consensus::{RequestNumber, SignedStatement, TransactionNumber};
use crate::identity::{AccountId, Document, NotaryId, NymId, Signed, UnitId};
use crate::instrument::{SignedResponse, SignedTransaction};
use crate::ledger::{Account, Ledger, LedgerHash, UnitDefinition};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use thiserror::Error;

/// Largest message either side will decode
pub const MAX_MESSAGE_SIZE: usize = 4 * 1024 * 1024;

/// Protocol errors
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Deserialization failed: {0}")]
    DeserializationFailed(String),

    #[error("Message too large: {0} bytes")]
    MessageTooLarge(usize),
}

/// Types of commands in the protocol
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum CommandType {
    RegisterNym,
    GetRequestNumber,
    GetTransactionNumbers,
    RegisterAccount,
    IssueUnit,
    NotarizeTransaction,
    ProcessInbox,
    ProcessNymbox,
    GetNymbox,
    GetAccountData,
}

impl CommandType {
    /// Commands accepted without request-number sequencing
    pub fn skips_sequencing(&self) -> bool {
        matches!(self, CommandType::RegisterNym | CommandType::GetRequestNumber)
    }

    /// Commands refused while the nym's copy of its nymbox is stale
    pub fn requires_nymbox_sync(&self) -> bool {
        matches!(self, CommandType::NotarizeTransaction | CommandType::ProcessInbox)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Command {
    RegisterNym,
    GetRequestNumber,
    GetTransactionNumbers,
    RegisterAccount {
        unit: UnitId,
    },
    IssueUnit {
        definition: UnitDefinition,
    },
    NotarizeTransaction {
        transaction: SignedTransaction,
    },
    ProcessInbox {
        transaction: SignedTransaction,
    },
    ProcessNymbox {
        accept: BTreeSet<u64>,
        /// Required when accepting blank numbers: the nym's issued set
        /// including the accepted numbers
        statement: Option<SignedStatement>,
    },
    GetNymbox,
    GetAccountData {
        account: AccountId,
    },
}

impl Command {
    /// Get the command type
    pub fn command_type(&self) -> CommandType {
        match self {
            Command::RegisterNym => CommandType::RegisterNym,
            Command::GetRequestNumber => CommandType::GetRequestNumber,
            Command::GetTransactionNumbers => CommandType::GetTransactionNumbers,
            Command::RegisterAccount { .. } => CommandType::RegisterAccount,
            Command::IssueUnit { .. } => CommandType::IssueUnit,
            Command::NotarizeTransaction { .. } => CommandType::NotarizeTransaction,
            Command::ProcessInbox { .. } => CommandType::ProcessInbox,
            Command::ProcessNymbox { .. } => CommandType::ProcessNymbox,
            Command::GetNymbox => CommandType::GetNymbox,
            Command::GetAccountData { .. } => CommandType::GetAccountData,
        }
    }

    /// Transaction carried by the command, if any
    pub fn transaction(&self) -> Option<&SignedTransaction> {
        match self {
            Command::NotarizeTransaction { transaction } | Command::ProcessInbox { transaction } => Some(transaction),
            _ => None,
        }
    }
}

// ============================================================================
// REQUEST
// ============================================================================

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Request {
    pub nym: NymId,
    pub notary: NotaryId,
    pub request_number: RequestNumber,
    /// Nymbox hash the nym last saw
    pub nymbox_hash: LedgerHash,
    /// Replies the nym has already seen
    pub acknowledged: BTreeSet<RequestNumber>,
    pub command: Command,
}

impl Document for Request {
    const DOMAIN: &'static [u8] = b"otx:request:";
}

pub type SignedRequest = Signed<Request>;

impl Request {
    pub fn new(nym: NymId, notary: NotaryId, request_number: RequestNumber, command: Command) -> Self {
        Self {
            nym,
            notary,
            request_number,
            nymbox_hash: LedgerHash::default(),
            acknowledged: BTreeSet::new(),
            command,
        }
    }

    pub fn with_nymbox_hash(mut self, hash: LedgerHash) -> Self {
        self.nymbox_hash = hash;
        self
    }

    pub fn with_acknowledged(mut self, acknowledged: BTreeSet<RequestNumber>) -> Self {
        self.acknowledged = acknowledged;
        self
    }
}

// ============================================================================
// REPLY
// ============================================================================

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReplyStatus {
    Ok,
    /// The request number was not the next one; `current` is the last
    /// number the notary accepted
    StaleRequestNumber { current: RequestNumber },
    /// The nym's nymbox hash is out of date; nothing was processed
    NymboxHashMismatch,
    Rejected(String),
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReplyPayload {
    None,
    RequestNumber(RequestNumber),
    /// Numbers dropped into the nymbox as a blank
    Numbers(BTreeSet<TransactionNumber>),
    Account(Account),
    AccountData {
        account: Account,
        inbox: Ledger,
        outbox: Ledger,
    },
    Nymbox(Ledger),
    Transaction(Box<SignedResponse>),
    /// Nymbox items removed, with the numbers they closed
    NymboxProcessed {
        removed: BTreeSet<u64>,
        closed: BTreeSet<TransactionNumber>,
    },
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reply {
    pub nym: NymId,
    pub notary: NotaryId,
    pub request_number: RequestNumber,
    pub command: CommandType,
    pub success: bool,
    pub status: ReplyStatus,
    /// The nym's nymbox hash after processing
    pub nymbox_hash: LedgerHash,
    /// Request numbers the notary has recorded as acknowledged
    pub acknowledged: BTreeSet<RequestNumber>,
    pub payload: ReplyPayload,
}

impl Document for Reply {
    const DOMAIN: &'static [u8] = b"otx:reply:";
}

pub type SignedReply = Signed<Reply>;

impl Reply {
    pub fn new(request: &Request, status: ReplyStatus) -> Self {
        Self {
            nym: request.nym.clone(),
            notary: request.notary,
            request_number: request.request_number,
            command: request.command.command_type(),
            success: status == ReplyStatus::Ok,
            status,
            nymbox_hash: LedgerHash::default(),
            acknowledged: BTreeSet::new(),
            payload: ReplyPayload::None,
        }
    }

    pub fn with_payload(mut self, payload: ReplyPayload) -> Self {
        self.payload = payload;
        self
    }
}

/// Serialize a signed message to bytes
pub(crate) fn to_bytes<T: Serialize>(message: &T) -> Vec<u8> {
    postcard::to_allocvec(message).unwrap_or_default()
}

/// Deserialize a signed message from bytes
pub(crate) fn from_bytes<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T, ProtocolError> {
    if bytes.len() > MAX_MESSAGE_SIZE {
        return Err(ProtocolError::MessageTooLarge(bytes.len()));
    }
    postcard::from_bytes(bytes).map_err(|e| ProtocolError::DeserializationFailed(e.to_string()))
}

impl Signed<Request> {
    /// Serialize to bytes
    pub fn to_bytes(&self) -> Vec<u8> {
        to_bytes(self)
    }

    /// Deserialize from bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ProtocolError> {
        from_bytes(bytes)
    }
}

impl Signed<Reply> {
    /// Serialize to bytes
    pub fn to_bytes(&self) -> Vec<u8> {
        to_bytes(self)
    }

    /// Deserialize from bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ProtocolError> {
        from_bytes(bytes)
    }
}
