//! Coin Ledger
//!
//! Value accounting and bid resolution for a sealed-economy jade auction.
//!
//! # Architecture
//!
//! - **Append-only ledger**: every movement of coins is an immutable entry
//! - **Derived balances**: total, maturing and spendable are sums over the ledger
//! - **Guarded batches**: each operation commits its entries and entity updates
//!   as one atomic unit, with preconditions re-checked inside that unit
//! - **Optimistic retry**: a commit that loses a race re-runs against fresh state
//!
//! # Invariants
//!
//! - An account's total balance equals the sum of its ledger entries
//! - At most one `winning` bid per lot, and its amount is the lot's price
//! - Accepted bid amounts on a lot strictly increase
//! - No operation is ever partially applied

#![forbid(unsafe_code)]
#![warn(
    missing_docs,
    rust_2018_idioms,
    missing_debug_implementations,
    clippy::all
)]

pub mod balance;
pub mod bidding;
pub mod config;
pub mod error;
pub mod exchange;
pub mod ledger;
pub mod marketplace;
pub mod metrics;
pub mod money;
pub mod payments;
pub mod redemption;
pub mod retry;
pub mod storage;
pub mod types;

// Re-exports
pub use balance::BalanceCalculator;
pub use bidding::{AuctionView, BidEngine, BidReceipt, BidRequest, LotView};
pub use config::{Config, RetryConfig};
pub use error::{Error, Result};
pub use exchange::Exchange;
pub use ledger::Ledger;
pub use marketplace::{
    MarketplaceProcessor, NewCoinListing, NewJadeListing, PurchaseReceipt, PurchaseRequest,
};
pub use metrics::Metrics;
pub use money::{coins_for_tier, CoinTier, FeeSchedule, COIN_TIERS};
pub use payments::{
    Checkout, IntentRequest, PaymentGateway, PaymentIntent, PaymentOutcome, PaymentWorkflow,
};
pub use redemption::{RedemptionReceipt, RedemptionWorkflow};
pub use retry::RetryPolicy;
pub use storage::{Guard, MemoryStore, Store, Write, WriteBatch};
pub use types::{
    AccountId, Auction, AuctionStatus, Balance, Bid, BidStatus, Cents, CoinPurchase, Coins,
    EntryFilter, EntryKind, FeeBreakdown, LedgerEntry, Listing, ListingKind, ListingStatus,
    ListingTerms, Lot, LotStatus, MarketplaceTransaction, PayoutStatus, PurchaseStatus,
    RedemptionRequest, RedemptionStatus,
};
