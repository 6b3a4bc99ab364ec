// Consensus context - everything one nym and one notary must agree on
//
// The notary keeps a Client-role context for every registered nym; each
// nym keeps a Server-role context for every notary it talks to. Both
// carry the same core (request number, number sets, nymbox hashes) and a
// role-specific extension.

use crate::consensus::{
    RequestNumber, TransactionNumber, TransactionNumberLedger, TransactionStatement,
};
use crate::identity::{Keypair, NotaryId, NymId, PublicKey, Signature, Signer};
use crate::ledger::LedgerHash;
use crate::protocol::CommandType;
use crate::storage::StoreError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use thiserror::Error;

const CONTEXT_DOMAIN: &[u8] = b"otx:context:";

/// Errors from context bookkeeping
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConsensusError {
    #[error("Transaction number {0} not found")]
    NumberNotFound(TransactionNumber),

    #[error("Transaction number {0} already issued")]
    NumberAlreadyIssued(TransactionNumber),

    #[error("Transaction number {number} is at or below the accepted watermark {highest}")]
    NumberBelowWatermark {
        number: TransactionNumber,
        highest: TransactionNumber,
    },

    #[error("Statement offers numbers this context never saw: {0:?}")]
    UnknownNumbers(Vec<TransactionNumber>),

    #[error("Statement belongs to a different notary or nym")]
    StatementMismatch,

    #[error("Stale request number: expected {expected}, got {got}")]
    StaleRequestNumber {
        expected: RequestNumber,
        got: RequestNumber,
    },

    #[error("Context has the wrong role for this operation")]
    WrongRole,

    #[error("Corrupted state: {0}")]
    CorruptedState(String),

    #[error("Storage failure: {0}")]
    Storage(String),
}

impl From<StoreError> for ConsensusError {
    fn from(err: StoreError) -> Self {
        ConsensusError::Storage(err.to_string())
    }
}

/// Notary-side extension: what the notary tracks about a client nym
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientState {
    /// Opening numbers of cron items this nym is party to
    open_cron_items: BTreeSet<TransactionNumber>,
}

/// A command that left the client and has not resolved yet
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingDelivery {
    pub request_number: RequestNumber,
    pub command: CommandType,
    pub attempts: u32,
}

/// Client-side extension: what a nym tracks about its notary
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerState {
    admin_password: Option<String>,
    admin_attempted: bool,
    admin_success: bool,
    /// Highest transaction number ever accepted from this notary
    highest_number: TransactionNumber,
    pending: Vec<PendingDelivery>,
}

/// Which side of the relationship this context describes
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConsensusRole {
    Client(ClientState),
    Server(ServerState),
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsensusContext {
    local_nym: NymId,
    remote_nym: NymId,
    notary: NotaryId,
    /// Last request number used on this relationship
    request_number: RequestNumber,
    numbers: TransactionNumberLedger,
    local_nymbox_hash: LedgerHash,
    remote_nymbox_hash: LedgerHash,
    revision: u64,
    role: ConsensusRole,
    signature: Option<Signature>,
}

impl ConsensusContext {
    /// Context the notary keeps for a client nym
    pub fn new_client(notary_nym: NymId, client_nym: NymId, notary: NotaryId) -> Self {
        Self::with_role(
            notary_nym,
            client_nym,
            notary,
            ConsensusRole::Client(ClientState::default()),
        )
    }

    /// Context a nym keeps for its notary
    pub fn new_server(client_nym: NymId, notary_nym: NymId, notary: NotaryId) -> Self {
        Self::with_role(
            client_nym,
            notary_nym,
            notary,
            ConsensusRole::Server(ServerState::default()),
        )
    }

    fn with_role(local_nym: NymId, remote_nym: NymId, notary: NotaryId, role: ConsensusRole) -> Self {
        Self {
            local_nym,
            remote_nym,
            notary,
            request_number: 0,
            numbers: TransactionNumberLedger::new(),
            local_nymbox_hash: LedgerHash::default(),
            remote_nymbox_hash: LedgerHash::default(),
            revision: 0,
            role,
            signature: None,
        }
    }

    pub fn local_nym(&self) -> &NymId {
        &self.local_nym
    }

    pub fn remote_nym(&self) -> &NymId {
        &self.remote_nym
    }

    pub fn notary(&self) -> &NotaryId {
        &self.notary
    }

    pub fn role(&self) -> &ConsensusRole {
        &self.role
    }

    /// Bumped on every mutation
    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub fn numbers(&self) -> &TransactionNumberLedger {
        &self.numbers
    }

    pub fn issued_numbers(&self) -> &BTreeSet<TransactionNumber> {
        self.numbers.issued()
    }

    pub fn available_numbers(&self) -> &BTreeSet<TransactionNumber> {
        self.numbers.available()
    }

    /// The nym whose numbers this context tracks
    pub fn number_owner(&self) -> &NymId {
        match &self.role {
            ConsensusRole::Client(_) => &self.remote_nym,
            ConsensusRole::Server(_) => &self.local_nym,
        }
    }

    fn touch(&mut self) {
        self.revision += 1;
        self.signature = None;
    }

    // ========================================================================
    // REQUEST NUMBERS
    // ========================================================================

    pub fn request_number(&self) -> RequestNumber {
        self.request_number
    }

    /// Number the next outgoing request must carry
    pub fn next_request_number(&self) -> RequestNumber {
        self.request_number + 1
    }

    /// Adopt the notary's counter after a `getRequestNumber` round trip
    pub fn update_request_number(&mut self, number: RequestNumber) {
        self.request_number = number;
        self.touch();
    }

    /// Check an incoming request number without touching state
    pub fn verify_request_number(&self, number: RequestNumber) -> Result<(), ConsensusError> {
        let expected = self.next_request_number();
        if number != expected {
            return Err(ConsensusError::StaleRequestNumber {
                expected,
                got: number,
            });
        }
        Ok(())
    }

    /// Verify and advance to an incoming request number
    pub fn accept_request_number(&mut self, number: RequestNumber) -> Result<(), ConsensusError> {
        self.verify_request_number(number)?;
        self.request_number = number;
        self.touch();
        Ok(())
    }

    // ========================================================================
    // TRANSACTION NUMBERS
    // ========================================================================

    pub fn issue_number(&mut self, number: TransactionNumber) -> Result<(), ConsensusError> {
        self.numbers.issue(number)?;
        self.touch();
        Ok(())
    }

    pub fn consume_available(&mut self, number: TransactionNumber) -> Result<(), ConsensusError> {
        self.numbers.consume_available(number)?;
        self.touch();
        Ok(())
    }

    pub fn consume_issued(&mut self, number: TransactionNumber) -> Result<(), ConsensusError> {
        self.numbers.consume_issued(number)?;
        self.touch();
        Ok(())
    }

    pub fn recover_available_number(&mut self, number: TransactionNumber) -> Result<(), ConsensusError> {
        self.numbers.recover_available(number)?;
        self.touch();
        Ok(())
    }

    pub fn verify_issued_number(&self, number: TransactionNumber) -> bool {
        self.numbers.verify_issued(number)
    }

    pub fn verify_available_number(&self, number: TransactionNumber) -> bool {
        self.numbers.verify_available(number)
    }

    /// Record numbers offered in a blank notice (client side)
    pub fn add_tentative_number(&mut self, number: TransactionNumber) -> Result<(), ConsensusError> {
        if let ConsensusRole::Server(state) = &self.role {
            if number <= state.highest_number {
                return Err(ConsensusError::NumberBelowWatermark {
                    number,
                    highest: state.highest_number,
                });
            }
        }
        self.numbers.add_tentative(number)?;
        self.touch();
        Ok(())
    }

    /// Install the numbers of a notary statement, all or nothing
    pub fn accept_issued_numbers(
        &mut self,
        statement: &TransactionStatement,
    ) -> Result<BTreeSet<TransactionNumber>, ConsensusError> {
        if statement.notary() != &self.notary || statement.nym() != self.number_owner() {
            return Err(ConsensusError::StatementMismatch);
        }

        let added = self.numbers.accept_issued(statement.issued())?;
        if let ConsensusRole::Server(state) = &mut self.role {
            if let Some(highest) = added.iter().next_back() {
                state.highest_number = state.highest_number.max(*highest);
            }
        }
        self.touch();
        Ok(added)
    }

    /// Statement of the numbers this context will hold once `adding` is
    /// issued and `without` is closed
    pub fn statement(
        &self,
        adding: &BTreeSet<TransactionNumber>,
        without: &BTreeSet<TransactionNumber>,
    ) -> TransactionStatement {
        let issued = self
            .numbers
            .issued()
            .union(adding)
            .filter(|n| !without.contains(n))
            .copied()
            .collect();
        let available = self
            .numbers
            .available()
            .union(adding)
            .filter(|n| !without.contains(n))
            .copied()
            .collect();

        TransactionStatement::new(self.notary, self.number_owner().clone(), issued, available)
    }

    /// Does `statement` describe exactly our issued set minus `without`?
    pub fn matches_statement(
        &self,
        statement: &TransactionStatement,
        without: &BTreeSet<TransactionNumber>,
    ) -> bool {
        if statement.notary() != &self.notary {
            return false;
        }
        let expected: BTreeSet<TransactionNumber> = self
            .numbers
            .issued()
            .iter()
            .filter(|n| !without.contains(n))
            .copied()
            .collect();
        statement.issued() == &expected
    }

    // ========================================================================
    // ACKNOWLEDGED REQUESTS
    // ========================================================================

    pub fn acknowledged_numbers(&self) -> &BTreeSet<RequestNumber> {
        self.numbers.acknowledged()
    }

    pub fn add_acknowledged_number(&mut self, request: RequestNumber) {
        self.numbers.add_acknowledged(request);
        self.touch();
    }

    pub fn remove_acknowledged_numbers(&mut self, requests: &BTreeSet<RequestNumber>) {
        self.numbers.remove_acknowledged(requests);
        self.touch();
    }

    /// Notary side: adopt the client's list of acknowledged replies
    pub fn finalize_acknowledged_numbers(&mut self, requests: BTreeSet<RequestNumber>) {
        self.numbers.set_acknowledged(requests);
        self.touch();
    }

    // ========================================================================
    // NYMBOX HASHES
    // ========================================================================

    /// Hash of our own copy of the nymbox
    pub fn local_nymbox_hash(&self) -> LedgerHash {
        self.local_nymbox_hash
    }

    /// Hash the counterparty last reported for the nymbox
    pub fn remote_nymbox_hash(&self) -> LedgerHash {
        self.remote_nymbox_hash
    }

    pub fn set_local_nymbox_hash(&mut self, hash: LedgerHash) {
        self.local_nymbox_hash = hash;
        self.touch();
    }

    pub fn set_remote_nymbox_hash(&mut self, hash: LedgerHash) {
        self.remote_nymbox_hash = hash;
        self.touch();
    }

    pub fn nymbox_in_sync(&self) -> bool {
        self.local_nymbox_hash == self.remote_nymbox_hash
    }

    // ========================================================================
    // ROLE EXTENSIONS
    // ========================================================================

    fn client_state_mut(&mut self) -> Result<&mut ClientState, ConsensusError> {
        match &mut self.role {
            ConsensusRole::Client(state) => Ok(state),
            ConsensusRole::Server(_) => Err(ConsensusError::WrongRole),
        }
    }

    fn server_state(&self) -> Result<&ServerState, ConsensusError> {
        match &self.role {
            ConsensusRole::Server(state) => Ok(state),
            ConsensusRole::Client(_) => Err(ConsensusError::WrongRole),
        }
    }

    fn server_state_mut(&mut self) -> Result<&mut ServerState, ConsensusError> {
        match &mut self.role {
            ConsensusRole::Server(state) => Ok(state),
            ConsensusRole::Client(_) => Err(ConsensusError::WrongRole),
        }
    }

    pub fn open_cron_items(&self) -> BTreeSet<TransactionNumber> {
        match &self.role {
            ConsensusRole::Client(state) => state.open_cron_items.clone(),
            ConsensusRole::Server(_) => BTreeSet::new(),
        }
    }

    pub fn open_cron_item(&mut self, number: TransactionNumber) -> Result<(), ConsensusError> {
        self.client_state_mut()?.open_cron_items.insert(number);
        self.touch();
        Ok(())
    }

    pub fn close_cron_item(&mut self, number: TransactionNumber) -> Result<bool, ConsensusError> {
        let removed = self.client_state_mut()?.open_cron_items.remove(&number);
        self.touch();
        Ok(removed)
    }

    pub fn admin_password(&self) -> Result<Option<&str>, ConsensusError> {
        Ok(self.server_state()?.admin_password.as_deref())
    }

    pub fn set_admin_password(&mut self, password: &str) -> Result<(), ConsensusError> {
        self.server_state_mut()?.admin_password = Some(password.to_string());
        self.touch();
        Ok(())
    }

    pub fn admin_attempted(&self) -> Result<bool, ConsensusError> {
        Ok(self.server_state()?.admin_attempted)
    }

    pub fn set_admin_attempted(&mut self) -> Result<(), ConsensusError> {
        self.server_state_mut()?.admin_attempted = true;
        self.touch();
        Ok(())
    }

    pub fn admin_success(&self) -> Result<bool, ConsensusError> {
        Ok(self.server_state()?.admin_success)
    }

    pub fn set_admin_success(&mut self) -> Result<(), ConsensusError> {
        let state = self.server_state_mut()?;
        state.admin_attempted = true;
        state.admin_success = true;
        self.touch();
        Ok(())
    }

    /// Highest transaction number accepted from the notary
    pub fn highest_number(&self) -> Result<TransactionNumber, ConsensusError> {
        Ok(self.server_state()?.highest_number)
    }

    pub fn pending_deliveries(&self) -> Result<&[PendingDelivery], ConsensusError> {
        Ok(&self.server_state()?.pending)
    }

    pub fn push_pending(&mut self, delivery: PendingDelivery) -> Result<(), ConsensusError> {
        self.server_state_mut()?.pending.push(delivery);
        self.touch();
        Ok(())
    }

    /// Remove the pending entry for a resolved request
    pub fn resolve_pending(&mut self, request: RequestNumber) -> Result<Option<PendingDelivery>, ConsensusError> {
        let pending = &mut self.server_state_mut()?.pending;
        let resolved = pending
            .iter()
            .position(|p| p.request_number == request)
            .map(|index| pending.remove(index));
        self.touch();
        Ok(resolved)
    }

    // ========================================================================
    // SIGNATURE AND SERIALIZATION
    // ========================================================================

    fn signing_bytes(&self) -> Result<Vec<u8>, ConsensusError> {
        let mut unsigned = self.clone();
        unsigned.signature = None;
        let mut bytes = CONTEXT_DOMAIN.to_vec();
        bytes.extend(postcard::to_allocvec(&unsigned).map_err(|e| ConsensusError::CorruptedState(e.to_string()))?);
        Ok(bytes)
    }

    /// Sign the current state as the local nym
    pub fn sign(&mut self, keypair: &Keypair) -> Result<(), ConsensusError> {
        self.signature = Some(Signer::sign(keypair, &self.signing_bytes()?));
        Ok(())
    }

    pub fn verify_signature(&self, key: &PublicKey) -> bool {
        match (&self.signature, self.signing_bytes()) {
            (Some(signature), Ok(bytes)) => Signer::verify(key, &bytes, signature),
            _ => false,
        }
    }

    pub fn signature(&self) -> Option<&Signature> {
        self.signature.as_ref()
    }

    /// Serialize the context to bytes
    pub fn to_bytes(&self) -> Result<Vec<u8>, ConsensusError> {
        postcard::to_allocvec(self).map_err(|e| ConsensusError::CorruptedState(e.to_string()))
    }

    /// Deserialize a context from bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ConsensusError> {
        postcard::from_bytes(bytes).map_err(|e| ConsensusError::CorruptedState(e.to_string()))
    }
}
