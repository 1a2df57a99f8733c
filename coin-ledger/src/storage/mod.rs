//! Storage layer
//!
//! Every entity is owned by the backing store; engines hold no long-lived
//! copies. Reads are plain queries. All mutation goes through
//! [`Store::apply`], which takes a [`WriteBatch`]: a set of guards re-checked
//! inside the atomic unit, followed by the writes. Either every guard holds
//! and every write lands, or nothing is visible.
//!
//! No write updates or deletes a ledger entry.

pub mod memory;

use crate::{
    types::{
        AccountId, Auction, AuctionStatus, Bid, CoinPurchase, Coins, EntryFilter, LedgerEntry,
        Listing, ListingKind, ListingStatus, Lot, LotStatus, MarketplaceTransaction,
        PurchaseStatus, RedemptionRequest, RedemptionStatus,
    },
    Result,
};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;

pub use memory::MemoryStore;

/// Precondition checked atomically with the writes of a batch
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Guard {
    /// Lot is still open with the price and leader the caller validated against
    LotUnchanged {
        /// Lot
        lot_id: Uuid,
        /// Expected current price
        current_price: Option<Coins>,
        /// Expected winning bid
        winning_bid_id: Option<Uuid>,
    },

    /// Auction is live
    AuctionLive {
        /// Auction
        auction_id: Uuid,
    },

    /// Listing is still active
    ListingActive {
        /// Listing
        listing_id: Uuid,
    },

    /// Account's spendable balance covers `amount` as of `as_of`
    SpendableAtLeast {
        /// Account
        account_id: AccountId,
        /// Required coins
        amount: Coins,
        /// Evaluation instant
        as_of: DateTime<Utc>,
        /// Maturation window
        maturation: Duration,
    },

    /// Account's total balance covers `amount`
    TotalAtLeast {
        /// Account
        account_id: AccountId,
        /// Required coins
        amount: Coins,
    },

    /// Purchase for the intent is in one of the given states
    PurchaseStatusIs {
        /// Payment intent
        payment_intent_id: String,
        /// Accepted states
        statuses: Vec<PurchaseStatus>,
    },

    /// Redemption request is still pending
    RedemptionPending {
        /// Request
        redemption_id: Uuid,
    },

    /// Coins granted by non-failed purchases stay within `cap`, counting this
    /// batch's inserts and any failed purchase it moves back out of `Failed`
    MintedAtMost {
        /// Supply cap
        cap: Coins,
    },
}

/// A single mutation inside a batch
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Write {
    /// Append an immutable ledger entry
    AppendEntry(LedgerEntry),
    /// Create a bid
    InsertBid(Bid),
    /// Demote a winning bid
    MarkBidOutbid {
        /// Bid
        bid_id: Uuid,
    },
    /// Move a lot's price and leader to a new bid
    AdvanceLot {
        /// Lot
        lot_id: Uuid,
        /// New price
        price: Coins,
        /// New leader
        winning_bid_id: Uuid,
    },
    /// Change a lot's status
    SetLotStatus {
        /// Lot
        lot_id: Uuid,
        /// New status
        status: LotStatus,
    },
    /// Create an auction
    InsertAuction(Auction),
    /// Change an auction's status
    SetAuctionStatus {
        /// Auction
        auction_id: Uuid,
        /// New status
        status: AuctionStatus,
        /// Transition time
        at: DateTime<Utc>,
    },
    /// Create a lot
    InsertLot(Lot),
    /// Create a listing
    InsertListing(Listing),
    /// Move a listing to a terminal state
    SetListingStatus {
        /// Listing
        listing_id: Uuid,
        /// New status
        status: ListingStatus,
        /// Transition time
        at: DateTime<Utc>,
    },
    /// Record a completed purchase
    InsertTransaction(MarketplaceTransaction),
    /// Create a redemption request
    InsertRedemption(RedemptionRequest),
    /// Decide a redemption request
    SetRedemptionStatus {
        /// Request
        redemption_id: Uuid,
        /// New status
        status: RedemptionStatus,
        /// Decision time
        at: DateTime<Utc>,
    },
    /// Record a checkout
    InsertPurchase(CoinPurchase),
    /// Progress a checkout
    SetPurchaseStatus {
        /// Payment intent
        payment_intent_id: String,
        /// New status
        status: PurchaseStatus,
    },
}

/// Guards plus writes, applied as one atomic unit
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WriteBatch {
    /// Preconditions
    pub guards: Vec<Guard>,
    /// Mutations, applied in order
    pub writes: Vec<Write>,
}

impl WriteBatch {
    /// Empty batch
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a precondition
    pub fn guard(mut self, guard: Guard) -> Self {
        self.guards.push(guard);
        self
    }

    /// Add a mutation
    pub fn write(mut self, write: Write) -> Self {
        self.writes.push(write);
        self
    }

    /// Add a ledger entry
    pub fn entry(self, entry: LedgerEntry) -> Self {
        self.write(Write::AppendEntry(entry))
    }

    /// Ledger entries carried by the batch
    pub fn entries(&self) -> impl Iterator<Item = &LedgerEntry> {
        self.writes.iter().filter_map(|write| match write {
            Write::AppendEntry(entry) => Some(entry),
            _ => None,
        })
    }

    /// True when there is nothing to write
    pub fn is_empty(&self) -> bool {
        self.writes.is_empty()
    }
}

/// Backing store for ledger entries and every entity the engines mutate
#[async_trait]
pub trait Store: Send + Sync {
    // ==================== Ledger ====================

    /// Entries of an account, oldest first
    async fn entries_for(&self, account_id: &AccountId) -> Result<Vec<LedgerEntry>>;

    /// Entries caused by one bid, transaction, redemption or payment intent
    async fn entries_for_reference(&self, reference_id: &str) -> Result<Vec<LedgerEntry>>;

    /// Signed sum of an account's entries matching the filter
    async fn sum_for(&self, account_id: &AccountId, filter: &EntryFilter) -> Result<Coins>;

    // ==================== Auctions ====================

    /// Auction by id
    async fn auction(&self, auction_id: Uuid) -> Result<Option<Auction>>;

    /// Most recently started live auction
    async fn live_auction(&self) -> Result<Option<Auction>>;

    /// Lots of an auction, in creation order
    async fn lots_for_auction(&self, auction_id: Uuid) -> Result<Vec<Lot>>;

    /// Lot by id
    async fn lot(&self, lot_id: Uuid) -> Result<Option<Lot>>;

    /// Bid by id
    async fn bid(&self, bid_id: Uuid) -> Result<Option<Bid>>;

    /// Bids on a lot, in placement order
    async fn bids_for_lot(&self, lot_id: Uuid) -> Result<Vec<Bid>>;

    // ==================== Marketplace ====================

    /// Listing by id
    async fn listing(&self, listing_id: Uuid) -> Result<Option<Listing>>;

    /// Active listings, newest first, optionally of one kind
    async fn active_listings(&self, kind: Option<ListingKind>) -> Result<Vec<Listing>>;

    /// Listings of a seller, newest first
    async fn listings_by_seller(&self, seller_id: &AccountId) -> Result<Vec<Listing>>;

    /// Transaction by id
    async fn transaction(&self, transaction_id: Uuid) -> Result<Option<MarketplaceTransaction>>;

    // ==================== Redemptions ====================

    /// Redemption request by id
    async fn redemption(&self, redemption_id: Uuid) -> Result<Option<RedemptionRequest>>;

    /// Requests of an account, newest first
    async fn redemptions_for(&self, account_id: &AccountId) -> Result<Vec<RedemptionRequest>>;

    // ==================== Purchases ====================

    /// Checkout by payment-intent id
    async fn purchase_by_intent(&self, payment_intent_id: &str) -> Result<Option<CoinPurchase>>;

    /// Coins granted by purchases that have not failed
    async fn minted_coins(&self) -> Result<Coins>;

    // ==================== Writes ====================

    /// Check every guard and apply every write atomically.
    ///
    /// Returns `ConcurrencyConflict` when a guard fails or an insert collides
    /// with an existing id; nothing is written in that case.
    async fn apply(&self, batch: WriteBatch) -> Result<()>;
}
