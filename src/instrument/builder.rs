use crate::consensus::{TransactionNumber, TransactionStatement};
use crate::identity::{AccountId, Keypair, NotaryId, NymId, Signed};
use crate::instrument::{BalanceAgreement, Operation, SignedTransaction, Transaction};
use crate::ledger::LedgerHash;
use chrono::Utc;
use thiserror::Error;

/// Errors that can occur when building a transaction
#[derive(Error, Debug)]
pub enum BuildError {
    #[error("Missing signer: the nym's keypair is required")]
    MissingSigner,

    #[error("Missing notary")]
    MissingNotary,

    #[error("Missing account")]
    MissingAccount,

    #[error("Missing transaction number")]
    MissingNumber,

    #[error("Missing operation")]
    MissingOperation,

    #[error("Missing balance agreement: expected balance and statement are required")]
    MissingBalanceAgreement,

    #[error("Statement belongs to {0}, not the signer")]
    StatementNymMismatch(NymId),
}

/// Builder for signed transactions
pub struct TransactionBuilder<'a> {
    signer: Option<&'a Keypair>,
    notary: Option<NotaryId>,
    account: Option<AccountId>,
    number: Option<TransactionNumber>,
    operation: Option<Operation>,
    expected_balance: Option<i64>,
    statement: Option<TransactionStatement>,
    inbox_hash: Option<LedgerHash>,
    created_at: Option<i64>,
}

impl<'a> TransactionBuilder<'a> {
    pub fn new() -> Self {
        Self {
            signer: None,
            notary: None,
            account: None,
            number: None,
            operation: None,
            expected_balance: None,
            statement: None,
            inbox_hash: None,
            created_at: None,
        }
    }

    /// Set the signing nym (required)
    pub fn signer(mut self, keypair: &'a Keypair) -> Self {
        self.signer = Some(keypair);
        self
    }

    /// Set the notary (required)
    pub fn notary(mut self, notary: NotaryId) -> Self {
        self.notary = Some(notary);
        self
    }

    /// Set the account the operation acts on (required)
    pub fn account(mut self, account: AccountId) -> Self {
        self.account = Some(account);
        self
    }

    /// Set the authorizing transaction number (required)
    pub fn number(mut self, number: TransactionNumber) -> Self {
        self.number = Some(number);
        self
    }

    /// Set the operation (required)
    pub fn operation(mut self, operation: Operation) -> Self {
        self.operation = Some(operation);
        self
    }

    /// Balance agreement: the account balance after the operation and the
    /// numbers held after it (required)
    pub fn balance_agreement(mut self, expected_balance: i64, statement: TransactionStatement) -> Self {
        self.expected_balance = Some(expected_balance);
        self.statement = Some(statement);
        self
    }

    /// Ask the notary to check the inbox hash as well (optional)
    pub fn inbox_hash(mut self, hash: LedgerHash) -> Self {
        self.inbox_hash = Some(hash);
        self
    }

    /// Set the creation time (optional - defaults to now)
    pub fn created_at(mut self, timestamp: i64) -> Self {
        self.created_at = Some(timestamp);
        self
    }

    /// Build and sign the transaction
    pub fn build(self) -> Result<SignedTransaction, BuildError> {
        let keypair = self.signer.ok_or(BuildError::MissingSigner)?;
        let notary = self.notary.ok_or(BuildError::MissingNotary)?;
        let account = self.account.ok_or(BuildError::MissingAccount)?;
        let number = self.number.ok_or(BuildError::MissingNumber)?;
        let operation = self.operation.ok_or(BuildError::MissingOperation)?;
        let expected_balance = self.expected_balance.ok_or(BuildError::MissingBalanceAgreement)?;
        let statement = self.statement.ok_or(BuildError::MissingBalanceAgreement)?;

        let nym = NymId::from_public_key(&keypair.public_key());
        if statement.nym() != &nym {
            return Err(BuildError::StatementNymMismatch(statement.nym().clone()));
        }

        let balance_agreement = BalanceAgreement {
            account,
            expected_balance,
            statement: statement.sign(keypair),
            inbox_hash: self.inbox_hash,
        };
        let created_at = self.created_at.unwrap_or_else(|| Utc::now().timestamp());

        let transaction = Transaction::new(notary, nym, account, number, operation, balance_agreement, created_at);
        Ok(Signed::sign(transaction, keypair))
    }
}

impl<'a> Default for TransactionBuilder<'a> {
    fn default() -> Self {
        Self::new()
    }
}
