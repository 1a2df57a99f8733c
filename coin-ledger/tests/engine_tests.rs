//! End-to-end scenarios over the in-memory store
//!
//! Covers the documented ledger properties plus races between concurrent
//! requests on a multi-threaded runtime.

use async_trait::async_trait;
use chrono::{Duration, Utc};
use coin_ledger::{
    AccountId, BidRequest, BidStatus, Coins, Config, EntryFilter, EntryKind, Error, Exchange,
    FeeBreakdown, IntentRequest, LedgerEntry, Listing, ListingStatus, ListingTerms, LotStatus,
    MemoryStore, Metrics, NewCoinListing, NewJadeListing, PaymentGateway, PaymentIntent,
    PaymentOutcome, PurchaseRequest, RedemptionStatus, Result, Store, Write, WriteBatch,
};
use rust_decimal_macros::dec;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use uuid::Uuid;

#[derive(Default)]
struct SequentialGateway {
    next: AtomicU64,
}

#[async_trait]
impl PaymentGateway for SequentialGateway {
    async fn create_intent(&self, _request: &IntentRequest) -> Result<PaymentIntent> {
        let n = self.next.fetch_add(1, Ordering::SeqCst);
        Ok(PaymentIntent {
            id: format!("pi_test_{}", n),
            client_secret: format!("pi_test_{}_secret_x", n),
        })
    }
}

fn exchange_with(config: Config) -> (Arc<MemoryStore>, Exchange) {
    let store = Arc::new(MemoryStore::new());
    let exchange = Exchange::new(
        store.clone(),
        Arc::new(SequentialGateway::default()),
        config,
        Metrics::new().unwrap(),
    )
    .unwrap();
    (store, exchange)
}

fn exchange() -> (Arc<MemoryStore>, Exchange) {
    let mut config = Config::default();
    config.retry.max_attempts = 100;
    config.retry.initial_delay_ms = 1;
    config.retry.max_delay_ms = 5;
    exchange_with(config)
}

fn account(name: &str) -> AccountId {
    AccountId::new(name)
}

/// Credit matured coins
async fn fund(exchange: &Exchange, name: &str, coins: Coins) {
    exchange
        .ledger
        .append(vec![LedgerEntry::new(
            account(name),
            coins,
            EntryKind::Purchase,
            format!("seed_{}", name),
            "seed",
        )
        .at(Utc::now() - Duration::hours(48))])
        .await
        .unwrap();
}

async fn total(exchange: &Exchange, name: &str) -> Coins {
    exchange.balances.balance(&account(name)).await.unwrap().total
}

async fn live_lot(exchange: &Exchange, starting_price: Coins) -> (Uuid, Uuid) {
    let auction = exchange
        .bids
        .create_auction("Autumn jade evening", Utc::now())
        .await
        .unwrap();
    let lot = exchange
        .bids
        .add_lot(auction.id, "Lavender jadeite bead necklace", starting_price)
        .await
        .unwrap();
    exchange.bids.open_auction(auction.id).await.unwrap();
    (auction.id, lot.id)
}

fn bid(auction_id: Uuid, lot_id: Uuid, name: &str, amount: Coins) -> BidRequest {
    BidRequest {
        auction_id,
        lot_id,
        account_id: account(name),
        amount,
        request_id: None,
    }
}

fn jade_listing(price_coins: Coins) -> NewJadeListing {
    NewJadeListing {
        title: "Qing dynasty belt hook".to_string(),
        description: Some("Celadon nephrite".to_string()),
        images: vec!["https://img.example/hook.jpg".to_string()],
        provenance: None,
        price_coins: Some(price_coins),
        price_usd: None,
        sale_type: "fixed".to_string(),
        expires_in_days: Some(14),
    }
}

// ==================== Ledger authority ====================

#[tokio::test]
async fn test_total_balance_is_sum_of_entries() {
    let (_store, exchange) = exchange();
    fund(&exchange, "a", 40).await;
    fund(&exchange, "b", 40).await;
    let (auction_id, lot_id) = live_lot(&exchange, 5).await;

    exchange.bids.place_bid(bid(auction_id, lot_id, "a", 10)).await.unwrap();
    exchange.bids.place_bid(bid(auction_id, lot_id, "b", 12)).await.unwrap();
    exchange.redemptions.request_redemption(&account("a"), 3, None).await.unwrap();

    for name in ["a", "b"] {
        let history = exchange.ledger.history(&account(name)).await.unwrap();
        let summed: Coins = history.iter().map(|entry| entry.amount).sum();
        assert_eq!(total(&exchange, name).await, summed);
    }
    assert_eq!(total(&exchange, "a").await, 37);
    assert_eq!(total(&exchange, "b").await, 28);
}

// ==================== Bidding ====================

#[tokio::test]
async fn test_outbid_release_nets_to_zero() {
    let (store, exchange) = exchange();
    fund(&exchange, "a", 100).await;
    fund(&exchange, "b", 100).await;
    let (auction_id, lot_id) = live_lot(&exchange, 10).await;

    let first = exchange.bids.place_bid(bid(auction_id, lot_id, "a", 20)).await.unwrap();
    assert_eq!(total(&exchange, "a").await, 80);

    exchange.bids.place_bid(bid(auction_id, lot_id, "b", 30)).await.unwrap();
    assert_eq!(total(&exchange, "b").await, 70);
    assert_eq!(total(&exchange, "a").await, 100);

    let a_bid = store.bid(first.bid_id).await.unwrap().unwrap();
    assert_eq!(a_bid.status, BidStatus::Outbid);

    let a_effect: Coins = exchange
        .ledger
        .entries_for_reference(&first.bid_id.to_string())
        .await
        .unwrap()
        .iter()
        .filter(|entry| entry.account_id == account("a"))
        .map(|entry| entry.amount)
        .sum();
    assert_eq!(a_effect, 0);
}

#[tokio::test]
async fn test_winner_matches_lot_price() {
    let (store, exchange) = exchange();
    for name in ["a", "b", "c"] {
        fund(&exchange, name, 100).await;
    }
    let (auction_id, lot_id) = live_lot(&exchange, 1).await;

    for (name, amount) in [("a", 5), ("b", 9), ("c", 15), ("a", 22)] {
        exchange.bids.place_bid(bid(auction_id, lot_id, name, amount)).await.unwrap();
    }
    assert_eq!(
        exchange.bids.place_bid(bid(auction_id, lot_id, "b", 22)).await,
        Err(Error::BidTooLow { amount: 22, current_price: 22 })
    );

    let bids = store.bids_for_lot(lot_id).await.unwrap();
    let winners: Vec<_> = bids.iter().filter(|b| b.status == BidStatus::Winning).collect();
    assert_eq!(winners.len(), 1);

    let lot = store.lot(lot_id).await.unwrap().unwrap();
    assert_eq!(lot.current_price, Some(winners[0].amount));
    assert_eq!(lot.winning_bid_id, Some(winners[0].id));
    assert_eq!(total(&exchange, "a").await, 78);
    assert_eq!(total(&exchange, "b").await, 100);
    assert_eq!(total(&exchange, "c").await, 100);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_bids_100_and_90() {
    for _ in 0..20 {
        let (store, exchange) = exchange();
        fund(&exchange, "hundred", 200).await;
        fund(&exchange, "ninety", 200).await;
        let (auction_id, lot_id) = live_lot(&exchange, 50).await;

        let high = {
            let exchange = exchange.clone();
            tokio::spawn(async move {
                exchange.bids.place_bid(bid(auction_id, lot_id, "hundred", 100)).await
            })
        };
        let low = {
            let exchange = exchange.clone();
            tokio::spawn(async move {
                exchange.bids.place_bid(bid(auction_id, lot_id, "ninety", 90)).await
            })
        };

        let high = high.await.unwrap();
        let low = low.await.unwrap();

        // The 100 always wins
        let high = high.unwrap();
        assert_eq!(high.status, BidStatus::Winning);
        let lot = store.lot(lot_id).await.unwrap().unwrap();
        assert_eq!(lot.current_price, Some(100));
        assert_eq!(lot.winning_bid_id, Some(high.bid_id));

        // The 90 either lost the race outright or was accepted first and outbid
        match low {
            Err(e) => assert_eq!(e, Error::BidTooLow { amount: 90, current_price: 100 }),
            Ok(receipt) => {
                let stored = store.bid(receipt.bid_id).await.unwrap().unwrap();
                assert_eq!(stored.status, BidStatus::Outbid);
                assert_eq!(high.released_bid_id, Some(receipt.bid_id));
            }
        }

        let winning = store
            .bids_for_lot(lot_id)
            .await
            .unwrap()
            .into_iter()
            .filter(|b| b.status == BidStatus::Winning)
            .count();
        assert_eq!(winning, 1);
        assert_eq!(total(&exchange, "hundred").await, 100);
        assert_eq!(total(&exchange, "ninety").await, 200);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn test_bid_storm_keeps_single_winner() {
    let (store, exchange) = exchange();
    let bidders: Vec<String> = (0..8).map(|i| format!("bidder-{}", i)).collect();
    for name in &bidders {
        fund(&exchange, name, 1_000).await;
    }
    let (auction_id, lot_id) = live_lot(&exchange, 10).await;

    let mut handles = Vec::new();
    for (i, name) in bidders.iter().enumerate() {
        for round in 0..10i64 {
            let exchange = exchange.clone();
            let name = name.clone();
            let amount = 11 + round * 17 + i as i64 * 3;
            handles.push(tokio::spawn(async move {
                exchange.bids.place_bid(bid(auction_id, lot_id, &name, amount)).await
            }));
        }
    }

    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) | Err(Error::BidTooLow { .. }) | Err(Error::InsufficientFunds { .. }) => {}
            Err(other) => panic!("unexpected bid error {:?}", other),
        }
    }

    let bids = store.bids_for_lot(lot_id).await.unwrap();
    let winners: Vec<_> = bids.iter().filter(|b| b.status == BidStatus::Winning).collect();
    assert_eq!(winners.len(), 1);

    let max_accepted = bids.iter().map(|b| b.amount).max().unwrap();
    let lot = store.lot(lot_id).await.unwrap().unwrap();
    assert_eq!(winners[0].amount, max_accepted);
    assert_eq!(lot.current_price, Some(max_accepted));

    // Each accepted bid beat the one before it, so no amount repeats
    let mut accepted: Vec<Coins> = bids.iter().map(|b| b.amount).collect();
    accepted.sort_unstable();
    accepted.dedup();
    assert_eq!(accepted.len(), bids.len());

    // Only the leader is still holding coins
    for name in &bidders {
        let expected = if winners[0].account_id == account(name) {
            1_000 - max_accepted
        } else {
            1_000
        };
        assert_eq!(total(&exchange, name).await, expected);
    }
}

#[tokio::test]
async fn test_withdrawn_lot_returns_hold() {
    let (_store, exchange) = exchange();
    fund(&exchange, "a", 50).await;
    let (auction_id, lot_id) = live_lot(&exchange, 10).await;

    exchange.bids.place_bid(bid(auction_id, lot_id, "a", 30)).await.unwrap();
    let lot = exchange.bids.withdraw_lot(lot_id).await.unwrap();

    assert_eq!(lot.status, LotStatus::Withdrawn);
    assert_eq!(total(&exchange, "a").await, 50);
}

// ==================== Marketplace ====================

#[tokio::test]
async fn test_coin_listing_ten_at_two_dollars() {
    let (_store, exchange) = exchange();
    fund(&exchange, "seller", 10).await;
    fund(&exchange, "buyer", 10).await;

    let listing = exchange
        .marketplace
        .create_coin_listing(
            &account("seller"),
            NewCoinListing {
                coins_offered: 10,
                price_per_coin_usd: dec!(2.00),
                sale_type: "fixed".to_string(),
                expires_in_days: None,
            },
        )
        .await
        .unwrap();

    let receipt = exchange
        .marketplace
        .purchase(PurchaseRequest {
            listing_id: listing.id,
            buyer_id: account("buyer"),
            request_id: None,
        })
        .await
        .unwrap();

    assert_eq!(
        receipt.transaction.fees,
        FeeBreakdown::Usd {
            total_cents: 2000,
            platform_fee_cents: 100,
            seller_receives_cents: 1900,
        }
    );

    let legs = exchange
        .ledger
        .entries_for_reference(&receipt.transaction.id.to_string())
        .await
        .unwrap();
    let buyer_leg: Coins = legs
        .iter()
        .filter(|e| e.account_id == account("buyer"))
        .map(|e| e.amount)
        .sum();
    let seller_leg: Coins = legs
        .iter()
        .filter(|e| e.account_id == account("seller"))
        .map(|e| e.amount)
        .sum();
    assert_eq!(buyer_leg, -10);
    assert_eq!(seller_leg, 10);
}

#[tokio::test]
async fn test_jade_listing_hundred_coins() {
    let (_store, exchange) = exchange();
    fund(&exchange, "buyer", 100).await;

    let listing = exchange
        .marketplace
        .create_jade_listing(&account("seller"), jade_listing(100))
        .await
        .unwrap();
    let receipt = exchange
        .marketplace
        .purchase(PurchaseRequest {
            listing_id: listing.id,
            buyer_id: account("buyer"),
            request_id: None,
        })
        .await
        .unwrap();

    assert_eq!(
        receipt.transaction.fees,
        FeeBreakdown::Coins {
            price_coins: 100,
            platform_fee_coins: 5,
            seller_receives_coins: 95,
        }
    );

    let mut legs: Vec<(EntryKind, Coins)> = exchange
        .ledger
        .entries_for_reference(&receipt.transaction.id.to_string())
        .await
        .unwrap()
        .into_iter()
        .map(|e| (e.kind, e.amount))
        .collect();
    legs.sort_by_key(|(_, amount)| *amount);
    assert_eq!(
        legs,
        vec![
            (EntryKind::MarketplaceBuy, -100),
            (EntryKind::MarketplaceFee, -5),
            (EntryKind::MarketplaceSell, 95),
        ]
    );
    assert_eq!(total(&exchange, "buyer").await, 0);
    assert_eq!(total(&exchange, "seller").await, 90);
}

#[tokio::test]
async fn test_expired_listing_is_unavailable() {
    let (store, exchange) = exchange();
    fund(&exchange, "buyer", 20).await;

    let now = Utc::now();
    let listing = Listing {
        id: Uuid::new_v4(),
        seller_id: account("seller"),
        terms: ListingTerms::Jade {
            title: "Lapsed listing".to_string(),
            description: None,
            images: vec![],
            provenance: None,
            price_coins: Some(5),
            price_usd: None,
        },
        sale_type: "fixed".to_string(),
        status: ListingStatus::Active,
        expires_at: Some(now - Duration::hours(1)),
        created_at: now - Duration::days(8),
        sold_at: None,
    };
    store
        .apply(WriteBatch::new().write(Write::InsertListing(listing.clone())))
        .await
        .unwrap();

    assert_eq!(
        exchange
            .marketplace
            .purchase(PurchaseRequest {
                listing_id: listing.id,
                buyer_id: account("buyer"),
                request_id: None,
            })
            .await,
        Err(Error::ListingUnavailable(listing.id))
    );
    assert!(exchange.marketplace.active_listings(None).await.unwrap().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_buyers_of_one_listing() {
    let (store, exchange) = exchange();
    let buyers = ["b1", "b2", "b3", "b4"];
    for name in buyers {
        fund(&exchange, name, 50).await;
    }
    let listing = exchange
        .marketplace
        .create_jade_listing(&account("seller"), jade_listing(40))
        .await
        .unwrap();

    let handles: Vec<_> = buyers
        .iter()
        .map(|name| {
            let exchange = exchange.clone();
            let request = PurchaseRequest {
                listing_id: listing.id,
                buyer_id: account(name),
                request_id: None,
            };
            tokio::spawn(async move { exchange.marketplace.purchase(request).await })
        })
        .collect();

    let mut sold = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) => sold += 1,
            Err(e) => assert_eq!(e, Error::ListingUnavailable(listing.id)),
        }
    }
    assert_eq!(sold, 1);

    let listing = store.listing(listing.id).await.unwrap().unwrap();
    assert_eq!(listing.status, ListingStatus::Sold);

    let spent: Coins = {
        let mut sum = 0;
        for name in buyers {
            sum += 50 - total(&exchange, name).await;
        }
        sum
    };
    assert_eq!(spent, 40);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_spends_cannot_overdraw() {
    let (_store, exchange) = exchange();
    fund(&exchange, "buyer", 10).await;

    let mut listings = Vec::new();
    for _ in 0..6 {
        listings.push(
            exchange
                .marketplace
                .create_jade_listing(&account("seller"), jade_listing(10))
                .await
                .unwrap(),
        );
    }

    let handles: Vec<_> = listings
        .iter()
        .map(|listing| {
            let exchange = exchange.clone();
            let request = PurchaseRequest {
                listing_id: listing.id,
                buyer_id: account("buyer"),
                request_id: None,
            };
            tokio::spawn(async move { exchange.marketplace.purchase(request).await })
        })
        .collect();

    let mut bought = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) => bought += 1,
            Err(Error::InsufficientFunds { required: 10, .. }) => {}
            Err(other) => panic!("unexpected purchase error {:?}", other),
        }
    }

    assert_eq!(bought, 1);
    assert_eq!(total(&exchange, "buyer").await, 0);
}

// ==================== Redemption ====================

#[tokio::test]
async fn test_redemption_of_five_coins() {
    let (_store, exchange) = exchange();
    fund(&exchange, "a", 5).await;

    let receipt = exchange
        .redemptions
        .request_redemption(&account("a"), 5, None)
        .await
        .unwrap();
    assert_eq!(receipt.request.status, RedemptionStatus::Pending);
    assert_eq!(receipt.request.payout_cents, 10_000);
    assert_eq!(total(&exchange, "a").await, 0);

    exchange
        .redemptions
        .reject_redemption(receipt.request.id)
        .await
        .unwrap();
    assert_eq!(total(&exchange, "a").await, 5);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_redemptions_respect_total() {
    let (_store, exchange) = exchange();
    fund(&exchange, "a", 5).await;

    let handles: Vec<_> = (0..4)
        .map(|_| {
            let exchange = exchange.clone();
            tokio::spawn(async move {
                exchange
                    .redemptions
                    .request_redemption(&AccountId::new("a"), 5, None)
                    .await
            })
        })
        .collect();

    let mut accepted = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) => accepted += 1,
            Err(e) => assert!(matches!(e, Error::InsufficientFunds { .. })),
        }
    }
    assert_eq!(accepted, 1);
    assert_eq!(total(&exchange, "a").await, 0);
}

// ==================== Maturation and payments ====================

#[tokio::test]
async fn test_purchase_matures_after_window() {
    let (_store, exchange) = exchange();
    let checkout = exchange
        .payments
        .create_checkout(&account("a"), 250)
        .await
        .unwrap();
    exchange
        .payments
        .on_payment_succeeded(&checkout.purchase.payment_intent_id)
        .await
        .unwrap();

    let credited = exchange
        .ledger
        .entries_for_reference(&checkout.purchase.payment_intent_id)
        .await
        .unwrap();
    assert_eq!(credited.len(), 1);
    let t0 = credited[0].created_at;

    let at_t0 = exchange.balances.balance_at(&account("a"), t0).await.unwrap();
    assert_eq!((at_t0.total, at_t0.maturing, at_t0.spendable), (10, 10, 0));

    let at_25h = exchange
        .balances
        .balance_at(&account("a"), t0 + Duration::hours(25))
        .await
        .unwrap();
    assert_eq!((at_25h.total, at_25h.maturing, at_25h.spendable), (10, 0, 10));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_replayed_payment_success_credits_once() {
    let (_store, exchange) = exchange();
    let checkout = exchange
        .payments
        .create_checkout(&account("a"), 100)
        .await
        .unwrap();
    let intent = checkout.purchase.payment_intent_id.clone();

    let handles: Vec<_> = (0..5)
        .map(|_| {
            let exchange = exchange.clone();
            let intent = intent.clone();
            tokio::spawn(async move { exchange.payments.on_payment_succeeded(&intent).await })
        })
        .collect();

    let mut credited = 0;
    for handle in handles {
        match handle.await.unwrap().unwrap() {
            PaymentOutcome::Credited { .. } => credited += 1,
            PaymentOutcome::AlreadyProcessed { .. } => {}
        }
    }

    assert_eq!(credited, 1);
    assert_eq!(total(&exchange, "a").await, 4);
    assert_eq!(
        exchange
            .ledger
            .sum_for(&account("a"), &EntryFilter::all().kind(EntryKind::Purchase))
            .await
            .unwrap(),
        4
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_mint_cap_holds_under_concurrent_checkouts() {
    let mut config = Config::default();
    config.mint_cap_coins = Some(100);
    config.retry.max_attempts = 100;
    config.retry.initial_delay_ms = 1;
    let (_store, exchange) = exchange_with(config);

    let handles: Vec<_> = (0..10)
        .map(|i| {
            let exchange = exchange.clone();
            tokio::spawn(async move {
                exchange
                    .payments
                    .create_checkout(&AccountId::new(format!("buyer-{}", i)), 1000)
                    .await
            })
        })
        .collect();

    let mut accepted = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) => accepted += 1,
            Err(e) => assert!(matches!(e, Error::MintCapExceeded { requested: 40, .. })),
        }
    }

    assert_eq!(accepted, 2);
    assert_eq!(exchange.payments.remaining_supply().await.unwrap(), Some(20));
}

#[tokio::test]
async fn test_failed_purchase_cannot_complete_past_mint_cap() {
    let mut config = Config::default();
    config.mint_cap_coins = Some(40);
    let (store, exchange) = exchange_with(config);
    let payments = &exchange.payments;

    payments.create_checkout(&account("first"), 1000).await.unwrap();
    payments.on_payment_failed("pi_test_0").await.unwrap();

    // The freed supply goes to someone else
    payments.create_checkout(&account("second"), 1000).await.unwrap();
    payments.on_payment_succeeded("pi_test_1").await.unwrap();

    let late = payments.on_payment_succeeded("pi_test_0").await;
    assert!(matches!(late, Err(Error::MintCapExceeded { requested: 40, .. })));

    assert_eq!(store.minted_coins().await.unwrap(), 40);
    assert_eq!(total(&exchange, "first").await, 0);
    assert_eq!(total(&exchange, "second").await, 40);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_late_success_races_new_checkout_for_freed_supply() {
    let mut config = Config::default();
    config.mint_cap_coins = Some(40);
    config.retry.max_attempts = 100;
    config.retry.initial_delay_ms = 1;
    let (store, exchange) = exchange_with(config);

    exchange
        .payments
        .create_checkout(&account("first"), 1000)
        .await
        .unwrap();
    exchange.payments.on_payment_failed("pi_test_0").await.unwrap();

    let revive = {
        let exchange = exchange.clone();
        tokio::spawn(async move { exchange.payments.on_payment_succeeded("pi_test_0").await })
    };
    let checkout = {
        let exchange = exchange.clone();
        tokio::spawn(async move {
            exchange
                .payments
                .create_checkout(&account("second"), 1000)
                .await
        })
    };

    let revived = revive.await.unwrap();
    let checked_out = checkout.await.unwrap();
    assert!(revived.is_ok() != checked_out.is_ok());
    assert_eq!(store.minted_coins().await.unwrap(), 40);
    if revived.is_ok() {
        assert_eq!(total(&exchange, "first").await, 40);
    } else {
        assert!(matches!(revived, Err(Error::MintCapExceeded { .. })));
        assert_eq!(total(&exchange, "first").await, 0);
    }
}
