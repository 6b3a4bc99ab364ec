// Box ledgers - nymbox, inbox and outbox
//
// Every box is an ordered set of notary-signed receipts keyed by receipt
// number, plus a hash chain over those receipts. Client and notary compare
// the chain head to detect a stale local copy.

use crate::consensus::{SignedStatement, TransactionNumber};
use crate::identity::{AccountId, Document, NymId, Signed};
use crate::instrument::{SignedCheque, SignedTransaction};
use crate::ledger::LedgerError;
use crate::storage::keys;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// Head of a box hash chain; all zero for an empty box
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LedgerHash([u8; 32]);

impl LedgerHash {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0 == [0u8; 32]
    }
}

impl fmt::Display for LedgerHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(&self.0[..8]))
    }
}

impl fmt::Debug for LedgerHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "LedgerHash({})", self)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum BoxKind {
    Nymbox,
    Inbox,
    Outbox,
}

impl BoxKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BoxKind::Nymbox => "nymbox",
            BoxKind::Inbox => "inbox",
            BoxKind::Outbox => "outbox",
        }
    }
}

/// Nymboxes belong to nyms, inboxes and outboxes to accounts
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum LedgerOwner {
    Nym(NymId),
    Account(AccountId),
}

impl LedgerOwner {
    fn key(&self) -> Vec<u8> {
        match self {
            LedgerOwner::Nym(nym) => nym.as_key().to_vec(),
            LedgerOwner::Account(account) => account.as_bytes().to_vec(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum BoxItemKind {
    /// Incoming transfer awaiting acceptance (and its outbox mirror)
    Pending,
    /// The recipient accepted a transfer
    TransferReceipt,
    /// A cheque drawn on the account was deposited
    ChequeReceipt,
    /// A cron payment moved funds
    PaymentReceipt,
    /// A market trade moved funds
    MarketReceipt,
    /// A basket exchange moved funds
    BasketReceipt,
    /// A cron item closed; its numbers close with this receipt
    FinalReceipt,
    /// Fresh transaction numbers
    Blank,
    /// Anything else delivered to a nym (vouchers, cancellations)
    Notice,
}

/// Payload carried by a receipt
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Attachment {
    None,
    Transaction(Box<SignedTransaction>),
    Cheque(SignedCheque),
    Numbers(SignedStatement),
    Note(String),
}

/// Receipt body; the notary signs it to make a `Receipt`
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoxItem {
    number: u64,
    in_reference_to: TransactionNumber,
    kind: BoxItemKind,
    amount: i64,
    from_nym: Option<NymId>,
    from_account: Option<AccountId>,
    to_account: Option<AccountId>,
    /// Numbers the box owner closes by accepting this item
    closing_numbers: BTreeSet<TransactionNumber>,
    attachment: Attachment,
}

impl Document for BoxItem {
    const DOMAIN: &'static [u8] = b"otx:receipt:";
}

pub type Receipt = Signed<BoxItem>;

impl BoxItem {
    pub fn new(kind: BoxItemKind, number: u64, in_reference_to: TransactionNumber) -> Self {
        Self {
            number,
            in_reference_to,
            kind,
            amount: 0,
            from_nym: None,
            from_account: None,
            to_account: None,
            closing_numbers: BTreeSet::new(),
            attachment: Attachment::None,
        }
    }

    pub fn with_amount(mut self, amount: i64) -> Self {
        self.amount = amount;
        self
    }

    pub fn with_from(mut self, nym: NymId, account: Option<AccountId>) -> Self {
        self.from_nym = Some(nym);
        self.from_account = account;
        self
    }

    pub fn with_to_account(mut self, account: AccountId) -> Self {
        self.to_account = Some(account);
        self
    }

    pub fn with_closing_numbers(mut self, numbers: BTreeSet<TransactionNumber>) -> Self {
        self.closing_numbers = numbers;
        self
    }

    pub fn with_attachment(mut self, attachment: Attachment) -> Self {
        self.attachment = attachment;
        self
    }

    pub fn number(&self) -> u64 {
        self.number
    }

    pub fn in_reference_to(&self) -> TransactionNumber {
        self.in_reference_to
    }

    pub fn kind(&self) -> BoxItemKind {
        self.kind
    }

    pub fn amount(&self) -> i64 {
        self.amount
    }

    pub fn from_nym(&self) -> Option<&NymId> {
        self.from_nym.as_ref()
    }

    pub fn from_account(&self) -> Option<&AccountId> {
        self.from_account.as_ref()
    }

    pub fn to_account(&self) -> Option<&AccountId> {
        self.to_account.as_ref()
    }

    pub fn closing_numbers(&self) -> &BTreeSet<TransactionNumber> {
        &self.closing_numbers
    }

    pub fn attachment(&self) -> &Attachment {
        &self.attachment
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ledger {
    kind: BoxKind,
    owner: LedgerOwner,
    items: BTreeMap<u64, Receipt>,
    hash: LedgerHash,
}

impl Ledger {
    pub fn new(kind: BoxKind, owner: LedgerOwner) -> Self {
        Self {
            kind,
            owner,
            items: BTreeMap::new(),
            hash: LedgerHash::default(),
        }
    }

    /// Storage key of a box
    pub fn storage_key(kind: BoxKind, owner: &LedgerOwner) -> Vec<u8> {
        keys::ledger(kind.as_str(), &owner.key())
    }

    pub fn kind(&self) -> BoxKind {
        self.kind
    }

    pub fn owner(&self) -> &LedgerOwner {
        &self.owner
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Head of the hash chain as last recomputed
    pub fn hash(&self) -> LedgerHash {
        self.hash
    }

    pub fn get(&self, number: u64) -> Option<&Receipt> {
        self.items.get(&number)
    }

    pub fn contains(&self, number: u64) -> bool {
        self.items.contains_key(&number)
    }

    pub fn items(&self) -> impl Iterator<Item = &Receipt> {
        self.items.values()
    }

    pub fn items_of_kind(&self, kind: BoxItemKind) -> Vec<&Receipt> {
        self.items.values().filter(|r| r.body().kind() == kind).collect()
    }

    /// First receipt of `kind` that refers to transaction `number`
    pub fn find_by_reference(&self, kind: BoxItemKind, number: TransactionNumber) -> Option<&Receipt> {
        self.items
            .values()
            .find(|r| r.body().kind() == kind && r.body().in_reference_to() == number)
    }

    pub fn add(&mut self, receipt: Receipt) -> Result<(), LedgerError> {
        let number = receipt.body().number();
        if self.items.contains_key(&number) {
            return Err(LedgerError::DuplicateItem(number));
        }
        self.items.insert(number, receipt);
        self.hash = self.compute_hash();
        Ok(())
    }

    pub fn remove(&mut self, number: u64) -> Result<Receipt, LedgerError> {
        let receipt = self
            .items
            .remove(&number)
            .ok_or(LedgerError::ItemNotFound(number))?;
        self.hash = self.compute_hash();
        Ok(receipt)
    }

    /// Recompute the chain head from the items
    pub fn compute_hash(&self) -> LedgerHash {
        if self.items.is_empty() {
            return LedgerHash::default();
        }

        let mut head = [0u8; 32];
        for (number, receipt) in &self.items {
            let mut hasher = Sha256::new();
            hasher.update(head);
            hasher.update(number.to_le_bytes());
            hasher.update(receipt.body().signing_bytes());
            hasher.update(receipt.signature().as_bytes());
            head = hasher.finalize().into();
        }
        LedgerHash(head)
    }

    /// Stored head agrees with the items
    pub fn verify_hash(&self) -> bool {
        self.hash == self.compute_hash()
    }
}
