//! Property-based tests for ledger invariants
//!
//! These tests use proptest to verify:
//! - Conservation: an account's total always equals the sum of its entries
//! - Bid ordering: one winner per lot, priced at the highest accepted bid
//! - Fee arithmetic: fee plus seller proceeds equals the gross price

use chrono::{Duration, Utc};
use coin_ledger::{
    money::redemption_payout_cents, AccountId, BidRequest, BidStatus, Coins, Config, EntryKind,
    Error, Exchange, FeeBreakdown, FeeSchedule, IntentRequest, LedgerEntry, MemoryStore, Metrics,
    PaymentGateway, PaymentIntent, Result, Store,
};
use proptest::prelude::*;
use rust_decimal::Decimal;
use std::sync::Arc;
use uuid::Uuid;

const ACCOUNTS: [&str; 3] = ["alice", "bob", "carol"];

struct NoGateway;

#[async_trait::async_trait]
impl PaymentGateway for NoGateway {
    async fn create_intent(&self, _request: &IntentRequest) -> Result<PaymentIntent> {
        Err(Error::Gateway("payments disabled in property tests".to_string()))
    }
}

#[derive(Debug, Clone)]
enum Op {
    Bid { who: usize, amount: Coins },
    Redeem { who: usize, coins: Coins },
}

/// Strategy for generating starting balances
fn funding_strategy() -> impl Strategy<Value = Vec<Coins>> {
    prop::collection::vec(0i64..200, ACCOUNTS.len())
}

/// Strategy for generating bids against one lot
fn bid_strategy() -> impl Strategy<Value = (usize, Coins)> {
    (0..ACCOUNTS.len(), 1i64..150)
}

/// Strategy for generating mixed operations
fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        3 => bid_strategy().prop_map(|(who, amount)| Op::Bid { who, amount }),
        1 => (0..ACCOUNTS.len(), 1i64..50).prop_map(|(who, coins)| Op::Redeem { who, coins }),
    ]
}

fn exchange() -> Exchange {
    Exchange::new(
        Arc::new(MemoryStore::new()),
        Arc::new(NoGateway),
        Config::default(),
        Metrics::new().unwrap(),
    )
    .unwrap()
}

async fn fund(exchange: &Exchange, funding: &[Coins]) {
    let seeded = Utc::now() - Duration::hours(48);
    let entries: Vec<_> = ACCOUNTS
        .iter()
        .zip(funding)
        .filter(|(_, coins)| **coins > 0)
        .map(|(name, coins)| {
            LedgerEntry::new(AccountId::new(*name), *coins, EntryKind::Purchase, "seed", "seed")
                .at(seeded)
        })
        .collect();
    if !entries.is_empty() {
        exchange.ledger.append(entries).await.unwrap();
    }
}

async fn live_lot(exchange: &Exchange) -> (Uuid, Uuid) {
    let auction = exchange.bids.create_auction("Property auction", Utc::now()).await.unwrap();
    let lot = exchange.bids.add_lot(auction.id, "Jade cabochon", 10).await.unwrap();
    exchange.bids.open_auction(auction.id).await.unwrap();
    (auction.id, lot.id)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Total balance is always the sum of the account's entries
    #[test]
    fn prop_total_equals_entry_sum(
        funding in funding_strategy(),
        ops in prop::collection::vec(op_strategy(), 1..25),
    ) {
        tokio_test::block_on(async {
            let exchange = exchange();
            fund(&exchange, &funding).await;
            let (auction_id, lot_id) = live_lot(&exchange).await;

            for op in &ops {
                match op {
                    Op::Bid { who, amount } => {
                        let _ = exchange.bids.place_bid(BidRequest {
                            auction_id,
                            lot_id,
                            account_id: AccountId::new(ACCOUNTS[*who]),
                            amount: *amount,
                            request_id: None,
                        }).await;
                    }
                    Op::Redeem { who, coins } => {
                        let _ = exchange
                            .redemptions
                            .request_redemption(&AccountId::new(ACCOUNTS[*who]), *coins, None)
                            .await;
                    }
                }

                for name in ACCOUNTS {
                    let account = AccountId::new(name);
                    let balance = exchange.balances.balance(&account).await.unwrap();
                    let history = exchange.ledger.history(&account).await.unwrap();
                    let summed: Coins = history.iter().map(|e| e.amount).sum();

                    prop_assert_eq!(balance.total, summed);
                    prop_assert!(balance.total >= 0);
                    prop_assert!(balance.spendable <= balance.total);
                }
            }
            Ok(())
        })?;
    }

    /// A lot has at most one winning bid and its price is the highest accepted amount
    #[test]
    fn prop_single_winner_at_highest_bid(
        bids in prop::collection::vec(bid_strategy(), 1..30),
    ) {
        tokio_test::block_on(async {
            let exchange = exchange();
            fund(&exchange, &[500, 500, 500]).await;
            let (auction_id, lot_id) = live_lot(&exchange).await;

            let mut price: Option<Coins> = None;
            for (who, amount) in &bids {
                let result = exchange.bids.place_bid(BidRequest {
                    auction_id,
                    lot_id,
                    account_id: AccountId::new(ACCOUNTS[*who]),
                    amount: *amount,
                    request_id: None,
                }).await;

                let to_beat = price.unwrap_or(10);
                if *amount > to_beat {
                    prop_assert!(result.is_ok());
                    price = Some(*amount);
                } else {
                    prop_assert_eq!(
                        result,
                        Err(Error::BidTooLow { amount: *amount, current_price: to_beat })
                    );
                }
            }

            let store = exchange.ledger.store();
            let lot = store.lot(lot_id).await.unwrap().unwrap();
            prop_assert_eq!(lot.current_price, price);

            let recorded = store.bids_for_lot(lot_id).await.unwrap();
            let winners: Vec<_> = recorded
                .iter()
                .filter(|b| b.status == BidStatus::Winning)
                .collect();
            prop_assert_eq!(winners.len(), usize::from(price.is_some()));

            for name in ACCOUNTS {
                let account = AccountId::new(name);
                let held = winners
                    .iter()
                    .filter(|b| b.account_id == account)
                    .map(|b| b.amount)
                    .sum::<Coins>();
                let total = exchange.balances.balance(&account).await.unwrap().total;
                prop_assert_eq!(total, 500 - held);
            }
            Ok(())
        })?;
    }

    /// Coin fees round half-up and never exceed the price
    #[test]
    fn prop_coin_fee_split(price in 1i64..1_000_000_000, bps in 0u32..=10_000) {
        let fees = FeeSchedule::from_bps(bps);
        match fees.split_coins(price).unwrap() {
            FeeBreakdown::Coins { price_coins, platform_fee_coins, seller_receives_coins } => {
                prop_assert_eq!(price_coins, price);
                prop_assert_eq!(platform_fee_coins + seller_receives_coins, price);
                prop_assert!(platform_fee_coins >= 0);
                prop_assert!(platform_fee_coins <= price);

                let exact = i128::from(price) * i128::from(bps);
                let expected = (exact + 5_000) / 10_000;
                prop_assert_eq!(i128::from(platform_fee_coins), expected);
            }
            other => prop_assert!(false, "unexpected breakdown {:?}", other),
        }
    }

    /// USD splits are exact to the cent
    #[test]
    fn prop_usd_fee_split(coins in 1i64..10_000, price_cents in 1i64..100_000) {
        let fees = FeeSchedule::from_bps(500);
        let total_usd = Decimal::new(coins * price_cents, 2);
        match fees.split_usd(total_usd).unwrap() {
            FeeBreakdown::Usd { total_cents, platform_fee_cents, seller_receives_cents } => {
                prop_assert_eq!(total_cents, coins * price_cents);
                prop_assert_eq!(platform_fee_cents + seller_receives_cents, total_cents);
                prop_assert_eq!(platform_fee_cents, (total_cents * 5 + 50) / 100);
            }
            other => prop_assert!(false, "unexpected breakdown {:?}", other),
        }
    }

    /// Redemption payout is linear in coins
    #[test]
    fn prop_redemption_payout(coins in 1i64..1_000_000, rate in 1i64..100_000) {
        prop_assert_eq!(redemption_payout_cents(coins, rate).unwrap(), coins * rate);
    }
}
