// Market Tests
// Offer placement and matching on cron ticks

use crate::common::{balance, fund, inbox, issue, issued_on_notary, notary, now, session, Session};
use otnotary::identity::{AccountId, UnitId};
use otnotary::instrument::{MarketOffer, MarketSide, TransactionFailure};
use otnotary::ledger::BoxItemKind;
use otnotary::notary::Notary;

// ============================================================================
// HELPER FUNCTIONS
// ============================================================================

/// Offer for `total` gold at `price` dollars each; owner and closing
/// numbers are filled in when placed
fn offer(
    notary: &Notary,
    owner: &Session,
    units: (UnitId, UnitId),
    accounts: (AccountId, AccountId),
    side: MarketSide,
    total: i64,
    price: i64,
) -> MarketOffer {
    MarketOffer {
        notary: *notary.id(),
        owner: owner.nym().clone(),
        asset_unit: units.0,
        currency_unit: units.1,
        asset_account: accounts.0,
        currency_account: accounts.1,
        scale: 1,
        side,
        price,
        total_assets: total,
        minimum_increment: 1,
        closing_asset: 0,
        closing_currency: 0,
        valid_from: now() - 10,
        valid_to: now() + 3_600,
    }
}

// ============================================================================
// MATCHING
// ============================================================================

/// Test: Crossing offers trade at the older offer's price and both expire
/// once filled
#[tokio::test]
async fn test_crossing_offers_trade() {
    let notary = notary();
    let mut mint = session(&notary).await;
    let mut alice = session(&notary).await;
    let mut bob = session(&notary).await;
    let (gold, gold_issuer) = issue(&mut mint, &notary, "gold").await;
    let (dollars, dollar_issuer) = issue(&mut mint, &notary, "dollars").await;
    let units = (*gold.id(), *dollars.id());

    let alice_gold = alice.register_account(*gold.id()).await.unwrap();
    let alice_dollars = alice.register_account(*dollars.id()).await.unwrap();
    let bob_gold = bob.register_account(*gold.id()).await.unwrap();
    let bob_dollars = bob.register_account(*dollars.id()).await.unwrap();
    fund(&mut mint, gold_issuer, &mut alice, alice_gold, 10).await;
    fund(&mut mint, dollar_issuer, &mut bob, bob_dollars, 100).await;

    let ask = offer(&notary, &alice, units, (alice_gold, alice_dollars), MarketSide::Ask, 10, 5);
    let ask_response = alice.place_offer(ask).await.unwrap();
    assert!(ask_response.success, "{:?}", ask_response.failure);
    let bid = offer(&notary, &bob, units, (bob_gold, bob_dollars), MarketSide::Bid, 10, 6);
    let bid_response = bob.place_offer(bid).await.unwrap();
    assert!(bid_response.success, "{:?}", bid_response.failure);
    assert_eq!(notary.cron_queue().len(), 2);

    let report = notary.process_cron(now()).await;
    assert_eq!(report.trades, 1);
    assert_eq!(report.errors, 0);
    assert_eq!(report.expired.len(), 2);
    assert!(notary.cron_queue().is_empty());

    assert_eq!(balance(&notary, &alice_gold).await, 0);
    assert_eq!(balance(&notary, &alice_dollars).await, 50);
    assert_eq!(balance(&notary, &bob_gold).await, 10);
    assert_eq!(balance(&notary, &bob_dollars).await, 50);

    let receipts = inbox(&notary, &bob_gold).await;
    assert_eq!(receipts.items_of_kind(BoxItemKind::MarketReceipt).len(), 1);
    assert_eq!(receipts.items_of_kind(BoxItemKind::FinalReceipt).len(), 1);
    assert_eq!(
        inbox(&notary, &alice_dollars).await.items_of_kind(BoxItemKind::FinalReceipt).len(),
        1
    );
}

/// Test: Offers that do not cross stay on the market untouched
#[tokio::test]
async fn test_offers_without_cross_wait() {
    let notary = notary();
    let mut mint = session(&notary).await;
    let mut alice = session(&notary).await;
    let mut bob = session(&notary).await;
    let (gold, gold_issuer) = issue(&mut mint, &notary, "gold").await;
    let (dollars, dollar_issuer) = issue(&mut mint, &notary, "dollars").await;
    let units = (*gold.id(), *dollars.id());

    let alice_gold = alice.register_account(*gold.id()).await.unwrap();
    let alice_dollars = alice.register_account(*dollars.id()).await.unwrap();
    let bob_gold = bob.register_account(*gold.id()).await.unwrap();
    let bob_dollars = bob.register_account(*dollars.id()).await.unwrap();
    fund(&mut mint, gold_issuer, &mut alice, alice_gold, 10).await;
    fund(&mut mint, dollar_issuer, &mut bob, bob_dollars, 100).await;

    alice
        .place_offer(offer(&notary, &alice, units, (alice_gold, alice_dollars), MarketSide::Ask, 10, 8))
        .await
        .unwrap();
    bob.place_offer(offer(&notary, &bob, units, (bob_gold, bob_dollars), MarketSide::Bid, 10, 6))
        .await
        .unwrap();

    let report = notary.process_cron(now()).await;
    assert_eq!(report.processed, 2);
    assert_eq!(report.trades, 0);
    assert!(report.expired.is_empty());
    assert_eq!(balance(&notary, &alice_gold).await, 10);
    assert_eq!(balance(&notary, &bob_dollars).await, 100);
}

/// Test: An offer that has passed its window is finalized and its numbers
/// can be closed
#[tokio::test]
async fn test_offer_expires() {
    let notary = notary();
    let mut mint = session(&notary).await;
    let mut alice = session(&notary).await;
    let (gold, _) = issue(&mut mint, &notary, "gold").await;
    let (dollars, _) = issue(&mut mint, &notary, "dollars").await;
    let alice_gold = alice.register_account(*gold.id()).await.unwrap();
    let alice_dollars = alice.register_account(*dollars.id()).await.unwrap();

    let ask = offer(
        &notary,
        &alice,
        (*gold.id(), *dollars.id()),
        (alice_gold, alice_dollars),
        MarketSide::Ask,
        10,
        5,
    );
    let valid_to = ask.valid_to;
    let opening = alice.place_offer(ask).await.unwrap().number();

    let report = notary.process_cron(valid_to + 1).await;
    assert_eq!(report.expired, vec![opening]);
    assert_eq!(
        inbox(&notary, &alice_gold).await.items_of_kind(BoxItemKind::FinalReceipt).len(),
        1
    );

    alice.process_nymbox().await.unwrap();
    alice.process_inbox(alice_gold).await.unwrap();
    alice.process_inbox(alice_dollars).await.unwrap();
    let issued = issued_on_notary(&notary, alice.nym()).await;
    assert!(!issued.contains(&opening));
    assert_eq!(&issued, alice.context().await.unwrap().issued_numbers());
}

/// Test: Offering the same unit on both legs is refused
#[tokio::test]
async fn test_malformed_offer_refused() {
    let notary = notary();
    let mut mint = session(&notary).await;
    let mut alice = session(&notary).await;
    let (gold, _) = issue(&mut mint, &notary, "gold").await;
    let alice_gold = alice.register_account(*gold.id()).await.unwrap();
    let alice_other = alice.register_account(*gold.id()).await.unwrap();

    let ask = offer(
        &notary,
        &alice,
        (*gold.id(), *gold.id()),
        (alice_gold, alice_other),
        MarketSide::Ask,
        10,
        5,
    );
    let response = alice.place_offer(ask).await.unwrap();
    assert!(matches!(response.failure, Some(TransactionFailure::AgreementInvalid(_))));
    assert!(notary.cron_queue().is_empty());
}
