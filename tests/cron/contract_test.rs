// Smart Contract Tests
// Endorsement, activation, expiry and cancellation of held contracts

use crate::common::{inbox, issue, issued_on_notary, notary, now, nymbox, session, Session};
use otnotary::identity::AccountId;
use otnotary::instrument::{ContractParty, SmartContract, TransactionFailure};
use otnotary::ledger::BoxItemKind;
use otnotary::notary::Notary;

async fn contract(notary: &Notary, parties: &[(&Session, AccountId)], valid_to: i64) -> SmartContract {
    let mut entries = Vec::with_capacity(parties.len());
    for (session, account) in parties {
        entries.push(ContractParty {
            nym: session.nym().clone(),
            account: *account,
            closing_number: session.reserve_number().await.unwrap(),
        });
    }
    SmartContract {
        notary: *notary.id(),
        parties: entries,
        terms: "escrow until delivery".to_string(),
        valid_from: now() - 10,
        valid_to,
    }
}

/// Test: A contract endorsed by every party is held until it expires
#[tokio::test]
async fn test_contract_held_until_expiry() {
    let notary = notary();
    let mut mint = session(&notary).await;
    let mut alice = session(&notary).await;
    let mut bob = session(&notary).await;
    let (gold, _) = issue(&mut mint, &notary, "gold").await;
    let alice_gold = alice.register_account(*gold.id()).await.unwrap();
    let bob_gold = bob.register_account(*gold.id()).await.unwrap();

    let valid_to = now() + 600;
    let terms = contract(&notary, &[(&alice, alice_gold), (&bob, bob_gold)], valid_to).await;
    let bob_closing = terms.parties[1].closing_number;
    let endorsements = vec![alice.endorse_contract(terms.clone()), bob.endorse_contract(terms.clone())];
    let response = alice.activate_contract(terms, endorsements).await.unwrap();
    assert!(response.success, "{:?}", response.failure);
    let opening = response.number();

    assert!(notary.process_cron_item(opening, now()).await.unwrap());
    assert!(notary.process_cron_item(opening, valid_to).await.unwrap());
    assert!(!notary.process_cron_item(opening, valid_to + 1).await.unwrap());
    assert!(notary.cron_queue().get(opening).is_none());

    assert_eq!(nymbox(&notary, alice.nym()).await.items_of_kind(BoxItemKind::FinalReceipt).len(), 1);
    assert_eq!(inbox(&notary, &alice_gold).await.items_of_kind(BoxItemKind::FinalReceipt).len(), 1);
    assert_eq!(inbox(&notary, &bob_gold).await.items_of_kind(BoxItemKind::FinalReceipt).len(), 1);

    bob.process_inbox(bob_gold).await.unwrap();
    let issued = issued_on_notary(&notary, bob.nym()).await;
    assert!(!issued.contains(&bob_closing));
    assert_eq!(&issued, bob.context().await.unwrap().issued_numbers());
}

/// Test: Every party must endorse before activation
#[tokio::test]
async fn test_contract_missing_endorsement() {
    let notary = notary();
    let mut mint = session(&notary).await;
    let mut alice = session(&notary).await;
    let mut bob = session(&notary).await;
    let (gold, _) = issue(&mut mint, &notary, "gold").await;
    let alice_gold = alice.register_account(*gold.id()).await.unwrap();
    let bob_gold = bob.register_account(*gold.id()).await.unwrap();

    let terms = contract(&notary, &[(&alice, alice_gold), (&bob, bob_gold)], now() + 600).await;
    let endorsements = vec![alice.endorse_contract(terms.clone())];
    let response = alice.activate_contract(terms, endorsements).await.unwrap();
    assert_eq!(response.failure, Some(TransactionFailure::SignatureInvalid));
    assert!(notary.cron_queue().is_empty());
}

/// Test: Any party can cancel, and a cancelled item cannot be cancelled again
#[tokio::test]
async fn test_contract_cancelled_by_party() {
    let notary = notary();
    let mut mint = session(&notary).await;
    let mut alice = session(&notary).await;
    let mut bob = session(&notary).await;
    let (gold, _) = issue(&mut mint, &notary, "gold").await;
    let alice_gold = alice.register_account(*gold.id()).await.unwrap();
    let bob_gold = bob.register_account(*gold.id()).await.unwrap();

    let terms = contract(&notary, &[(&alice, alice_gold), (&bob, bob_gold)], now() + 600).await;
    let endorsements = vec![alice.endorse_contract(terms.clone()), bob.endorse_contract(terms.clone())];
    let opening = alice.activate_contract(terms, endorsements).await.unwrap().number();

    let response = bob.cancel_cron_item(bob_gold, opening).await.unwrap();
    assert!(response.success, "{:?}", response.failure);
    assert!(notary.cron_queue().is_empty());
    assert_eq!(nymbox(&notary, alice.nym()).await.items_of_kind(BoxItemKind::FinalReceipt).len(), 1);

    let again = bob.cancel_cron_item(bob_gold, opening).await.unwrap();
    assert_eq!(again.failure, Some(TransactionFailure::CronItemNotFound(opening)));
}

/// Test: Outsiders cannot cancel someone else's contract
#[tokio::test]
async fn test_contract_cancel_by_outsider() {
    let notary = notary();
    let mut mint = session(&notary).await;
    let mut alice = session(&notary).await;
    let mut carol = session(&notary).await;
    let (gold, _) = issue(&mut mint, &notary, "gold").await;
    let alice_gold = alice.register_account(*gold.id()).await.unwrap();
    let carol_gold = carol.register_account(*gold.id()).await.unwrap();

    let terms = contract(&notary, &[(&alice, alice_gold)], now() + 600).await;
    let endorsements = vec![alice.endorse_contract(terms.clone())];
    let opening = alice.activate_contract(terms, endorsements).await.unwrap().number();

    let response = carol.cancel_cron_item(carol_gold, opening).await.unwrap();
    assert_eq!(response.failure, Some(TransactionFailure::NotOwner));
    assert!(notary.cron_queue().get(opening).is_some());
}
