// Inbox and nymbox processing
//
// Accepting an inbox item is itself a transaction: it carries a balance
// agreement covering every credit and every number the accepted receipts
// close. Nymbox processing is a plain command; the only agreement it needs
// is the signed statement that installs newly offered numbers.

use crate::consensus::{SignedStatement, TransactionNumber, TransactionStatement};
use crate::identity::NymId;
use crate::instrument::{SignedTransaction, TransactionFailure};
use crate::ledger::{Attachment, BoxItem, BoxItemKind, BoxKind, LedgerOwner};
use crate::notary::contexts::ContextSet;
use crate::notary::notarize::{verify_balance_agreement, Applied};
use crate::notary::server::Notary;
use crate::notary::NotaryError;
use crate::protocol::ReplyPayload;
use std::collections::BTreeSet;
use tracing::{debug, info};

impl Notary {
    /// Accept items from an account inbox
    pub(crate) async fn process_inbox(
        &self,
        contexts: &mut ContextSet,
        signed: &SignedTransaction,
        accept: &BTreeSet<u64>,
    ) -> Result<Applied, TransactionFailure> {
        let transaction = signed.body();
        let account_id = *transaction.account();
        let own_inbox = LedgerOwner::Account(account_id);

        // Plan the ledger set from a snapshot, then re-read under the locks
        let snapshot = self.wallet.ledger(BoxKind::Inbox, own_inbox.clone()).await?;
        let mut wanted = vec![(BoxKind::Inbox, own_inbox.clone())];
        for number in accept {
            let receipt = snapshot.get(*number).ok_or(TransactionFailure::InboxItemNotFound(*number))?;
            if receipt.body().kind() == BoxItemKind::Pending {
                if let Some(from) = receipt.body().from_account() {
                    wanted.push((BoxKind::Outbox, LedgerOwner::Account(*from)));
                    wanted.push((BoxKind::Inbox, LedgerOwner::Account(*from)));
                }
            }
        }

        let mut accounts = self.wallet.lock_accounts(&BTreeSet::from([account_id])).await?;
        if accounts.get(&account_id)?.owner() != transaction.nym() {
            return Err(TransactionFailure::NotOwner);
        }
        let mut ledgers = self.wallet.lock_ledgers(wanted).await?;
        let inbox = ledgers.get(BoxKind::Inbox, &own_inbox)?;
        let inbox_hash = inbox.hash();

        let context = contexts.get(transaction.nym())?;
        let mut closing = BTreeSet::from([transaction.number()]);
        let mut credit: i64 = 0;
        let mut accepted = Vec::with_capacity(accept.len());
        for number in accept {
            let receipt = inbox
                .get(*number)
                .cloned()
                .ok_or(TransactionFailure::InboxItemNotFound(*number))?;
            let item = receipt.body();
            match item.kind() {
                BoxItemKind::Pending => {
                    if item.to_account() != Some(&account_id) {
                        return Err(TransactionFailure::CorruptedState(format!(
                            "pending item {} is addressed elsewhere",
                            number
                        )));
                    }
                    credit = credit
                        .checked_add(item.amount())
                        .ok_or(TransactionFailure::InvalidAmount(item.amount()))?;
                }
                BoxItemKind::TransferReceipt | BoxItemKind::ChequeReceipt | BoxItemKind::FinalReceipt => {
                    closing.extend(
                        item.closing_numbers()
                            .iter()
                            .filter(|n| context.verify_issued_number(**n))
                            .copied(),
                    );
                }
                _ => {}
            }
            accepted.push(receipt);
        }

        verify_balance_agreement(
            context,
            transaction,
            accounts.get(&account_id)?,
            credit,
            &closing,
            inbox_hash,
        )?;

        let balance = if credit > 0 {
            accounts.get_mut(&account_id)?.credit(credit)?
        } else {
            accounts.get(&account_id)?.balance()
        };

        let pending = accepted
            .iter()
            .filter(|r| r.body().kind() == BoxItemKind::Pending)
            .count();
        let mut numbers = self.allocate_numbers(pending).await?.into_iter();
        for receipt in &accepted {
            let item = receipt.body();
            ledgers.get_mut(BoxKind::Inbox, &own_inbox)?.remove(item.number())?;
            if item.kind() != BoxItemKind::Pending {
                continue;
            }
            let from = *item
                .from_account()
                .ok_or_else(|| TransactionFailure::CorruptedState("pending item without a source".to_string()))?;
            ledgers.get_mut(BoxKind::Outbox, &LedgerOwner::Account(from))?.remove(item.number())?;

            let number = numbers
                .next()
                .ok_or_else(|| TransactionFailure::CorruptedState("receipt numbers exhausted".to_string()))?;
            let transfer_receipt = self.sign_receipt(
                BoxItem::new(BoxItemKind::TransferReceipt, number, item.in_reference_to())
                    .with_amount(item.amount())
                    .with_from(transaction.nym().clone(), Some(account_id))
                    .with_to_account(account_id)
                    .with_closing_numbers(BTreeSet::from([item.in_reference_to()]))
                    .with_attachment(item.attachment().clone()),
            );
            ledgers
                .get_mut(BoxKind::Inbox, &LedgerOwner::Account(from))?
                .add(transfer_receipt)?;
        }

        let context = contexts.get_mut(transaction.nym())?;
        for number in &closing {
            context.consume_issued(*number)?;
        }

        accounts.commit()?;
        ledgers.commit()?;
        debug!(account = %account_id, accepted = accepted.len(), credit, "inbox processed");
        Ok(Applied {
            closed: closing,
            balance: Some(balance),
            ..Applied::default()
        })
    }

    /// Accept nymbox items: blanks install their numbers, final receipts
    /// close opening numbers, notices are simply removed
    pub(crate) async fn process_nymbox(
        &self,
        contexts: &mut ContextSet,
        nym: &NymId,
        accept: &BTreeSet<u64>,
        statement: Option<&SignedStatement>,
    ) -> Result<ReplyPayload, NotaryError> {
        let mut nymbox = self.wallet.lock_nymbox(nym).await?;
        let context = contexts.get_mut(nym).map_err(|e| NotaryError::Rejected(e.to_string()))?;

        let mut offered = BTreeSet::new();
        let mut closed = BTreeSet::new();
        for number in accept {
            let receipt = nymbox
                .get(*number)
                .ok_or_else(|| NotaryError::Rejected(format!("nymbox item {} not found", number)))?;
            let item = receipt.body();
            match item.kind() {
                BoxItemKind::Blank => {
                    if let Attachment::Numbers(numbers) = item.attachment() {
                        offered.extend(numbers.body().issued().iter().copied());
                    }
                }
                BoxItemKind::FinalReceipt => {
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

        if !offered.is_empty() {
            let statement = statement
                .ok_or_else(|| NotaryError::Rejected("accepting numbers needs a signed statement".to_string()))?;
            let key = nym.public_key().map_err(|e| NotaryError::Rejected(e.to_string()))?;
            if !statement.verify_with(&key) {
                return Err(NotaryError::Rejected("statement signature invalid".to_string()));
            }
            let expected: BTreeSet<TransactionNumber> = context
                .issued_numbers()
                .union(&offered)
                .filter(|n| !closed.contains(n))
                .copied()
                .collect();
            if statement.body().issued() != &expected {
                return Err(NotaryError::Rejected("statement does not match the offered numbers".to_string()));
            }
            let installing = TransactionStatement::new(*self.id(), nym.clone(), offered.clone(), offered.clone());
            context.accept_issued_numbers(&installing)?;
        }

        for number in &closed {
            context.consume_issued(*number)?;
        }
        for number in accept {
            nymbox.remove(*number)?;
        }
        nymbox.commit()?;

        info!(nym = %nym, removed = accept.len(), numbers = offered.len(), closed = closed.len(), "nymbox processed");
        Ok(ReplyPayload::NymboxProcessed {
            removed: accept.clone(),
            closed,
        })
    }
}
