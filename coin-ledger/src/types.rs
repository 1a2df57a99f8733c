//! Core types for the coin ledger
//!
//! All types are designed for:
//! - Integer coin arithmetic (no floating point anywhere near a balance)
//! - Exact decimals for currency prices
//! - Stable snake_case text forms shared by JSON and the relational store

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Whole coins. Signed so a ledger entry can carry a debit.
pub type Coins = i64;

/// Currency minor units (cents).
pub type Cents = i64;

/// Defines a fieldless enum with a fixed snake_case text form, used both by
/// serde and by the SQL text columns.
macro_rules! text_enum {
    (
        $(#[$meta:meta])*
        pub enum $name:ident {
            $( $(#[$vmeta:meta])* $variant:ident => $text:literal ),+ $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(rename_all = "snake_case")]
        pub enum $name {
            $( $(#[$vmeta])* $variant ),+
        }

        impl $name {
            /// Stable text form
            pub fn as_str(&self) -> &'static str {
                match self {
                    $( $name::$variant => $text ),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = crate::Error;

            fn from_str(s: &str) -> crate::Result<Self> {
                match s {
                    $( $text => Ok($name::$variant), )+
                    other => Err(crate::Error::Validation(format!(
                        "unknown {} '{}'",
                        stringify!($name),
                        other
                    ))),
                }
            }
        }
    };
}

/// Participant identifier issued by the external identity provider
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AccountId(String);

impl AccountId {
    /// Create new account ID
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get as string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AccountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

text_enum! {
    /// Cause of a ledger movement
    pub enum EntryKind {
        /// Coins minted by a completed payment
        Purchase => "purchase",
        /// Coins encumbered by a winning bid
        BidHold => "bid_hold",
        /// Hold returned to an outbid bidder
        BidRelease => "bid_release",
        /// Buyer leg of a marketplace purchase
        MarketplaceBuy => "marketplace_buy",
        /// Seller leg of a marketplace purchase
        MarketplaceSell => "marketplace_sell",
        /// Platform fee taken from a seller
        MarketplaceFee => "marketplace_fee",
        /// Coins withdrawn for a cash payout (or restored on rejection)
        Redemption => "redemption",
    }
}

/// Immutable ledger entry. Never updated, never deleted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    /// Unique entry ID (UUIDv7 for time-ordering)
    pub id: Uuid,

    /// Account the movement belongs to
    pub account_id: AccountId,

    /// Signed amount; negative is a debit
    pub amount: Coins,

    /// Cause of the movement
    pub kind: EntryKind,

    /// Bid, transaction, redemption or payment-intent id that caused it
    pub reference_id: String,

    /// Append timestamp
    pub created_at: DateTime<Utc>,

    /// Free-text note
    pub note: String,
}

impl LedgerEntry {
    /// Create an entry stamped now
    pub fn new(
        account_id: AccountId,
        amount: Coins,
        kind: EntryKind,
        reference_id: impl Into<String>,
        note: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::now_v7(),
            account_id,
            amount,
            kind,
            reference_id: reference_id.into(),
            created_at: Utc::now(),
            note: note.into(),
        }
    }

    /// Override the timestamp (imports and replays)
    pub fn at(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = created_at;
        self
    }

    /// True for credits
    pub fn is_credit(&self) -> bool {
        self.amount > 0
    }
}

/// Predicate over ledger entries of one account
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EntryFilter {
    /// Only these kinds (all kinds when `None`)
    pub kinds: Option<Vec<EntryKind>>,

    /// Only entries created at or after this instant
    pub since: Option<DateTime<Utc>>,
}

impl EntryFilter {
    /// Match every entry
    pub fn all() -> Self {
        Self::default()
    }

    /// Restrict to one kind
    pub fn kind(mut self, kind: EntryKind) -> Self {
        self.kinds.get_or_insert_with(Vec::new).push(kind);
        self
    }

    /// Restrict to entries at or after `since`
    pub fn since(mut self, since: DateTime<Utc>) -> Self {
        self.since = Some(since);
        self
    }

    /// Evaluate against an entry
    pub fn matches(&self, entry: &LedgerEntry) -> bool {
        if let Some(kinds) = &self.kinds {
            if !kinds.contains(&entry.kind) {
                return false;
            }
        }
        match self.since {
            Some(since) => entry.created_at >= since,
            None => true,
        }
    }
}

/// Derived balance view. Never stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Balance {
    /// Sum of every entry
    pub total: Coins,

    /// Purchases still inside the maturation window
    pub maturing: Coins,

    /// `total - maturing`, floored at zero
    pub spendable: Coins,
}

text_enum! {
    /// Auction lifecycle
    pub enum AuctionStatus {
        /// Not yet accepting bids
        Scheduled => "scheduled",
        /// Accepting bids
        Live => "live",
        /// Finished
        Closed => "closed",
    }
}

/// A time-boxed auction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Auction {
    /// Auction ID
    pub id: Uuid,
    /// Display title
    pub title: String,
    /// Lifecycle status
    pub status: AuctionStatus,
    /// Scheduled start
    pub starts_at: DateTime<Utc>,
    /// When it went live
    pub started_at: Option<DateTime<Utc>>,
    /// Creation timestamp
    pub created_at: DateTime<Utc>,
}

text_enum! {
    /// Lot lifecycle
    pub enum LotStatus {
        /// Accepting bids
        Open => "open",
        /// Sale finalized
        Sold => "sold",
        /// Pulled from the auction
        Withdrawn => "withdrawn",
    }
}

/// Item auctioned within an auction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lot {
    /// Lot ID
    pub id: Uuid,
    /// Owning auction
    pub auction_id: Uuid,
    /// Display title
    pub title: String,
    /// Lifecycle status
    pub status: LotStatus,
    /// Opening price in coins
    pub starting_price: Coins,
    /// Highest accepted bid, unset until the first bid
    pub current_price: Option<Coins>,
    /// Bid whose amount equals `current_price`
    pub winning_bid_id: Option<Uuid>,
    /// Creation timestamp
    pub created_at: DateTime<Utc>,
}

impl Lot {
    /// Price a new bid must strictly exceed
    pub fn price_to_beat(&self) -> Coins {
        self.current_price.unwrap_or(self.starting_price)
    }
}

text_enum! {
    /// Bid status, the only mutable field of a bid
    pub enum BidStatus {
        /// Current leader on its lot
        Winning => "winning",
        /// Superseded by a higher bid
        Outbid => "outbid",
    }
}

/// A bid. Amount is immutable once recorded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bid {
    /// Bid ID
    pub id: Uuid,
    /// Lot bid on
    pub lot_id: Uuid,
    /// Bidder
    pub account_id: AccountId,
    /// Amount in coins
    pub amount: Coins,
    /// Status
    pub status: BidStatus,
    /// Placement timestamp
    pub created_at: DateTime<Utc>,
}

text_enum! {
    /// What a listing sells
    pub enum ListingKind {
        /// Coins for currency
        Coins => "coins",
        /// A piece of jade (goods)
        Jade => "jade",
    }
}

text_enum! {
    /// Listing lifecycle; `active` is the only non-terminal state
    pub enum ListingStatus {
        /// Purchasable
        Active => "active",
        /// Bought
        Sold => "sold",
        /// Withdrawn by the seller
        Cancelled => "cancelled",
    }
}

impl ListingStatus {
    /// Terminal states admit no further transition
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ListingStatus::Active)
    }
}

/// Price terms of a listing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "listing_type", rename_all = "snake_case")]
pub enum ListingTerms {
    /// Coins offered at a per-coin currency price
    Coins {
        /// Coins for sale
        coins_offered: Coins,
        /// Price of one coin in USD
        price_per_coin_usd: Decimal,
    },
    /// Goods priced in coins and/or USD
    Jade {
        /// Title
        title: String,
        /// Description
        description: Option<String>,
        /// Image URLs
        images: Vec<String>,
        /// Provenance notes
        provenance: Option<String>,
        /// Price in coins
        price_coins: Option<Coins>,
        /// Price in USD
        price_usd: Option<Decimal>,
    },
}

impl ListingTerms {
    /// Listing kind implied by the terms
    pub fn kind(&self) -> ListingKind {
        match self {
            ListingTerms::Coins { .. } => ListingKind::Coins,
            ListingTerms::Jade { .. } => ListingKind::Jade,
        }
    }
}

/// Secondary-market offer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Listing {
    /// Listing ID
    pub id: Uuid,
    /// Owning account
    pub seller_id: AccountId,
    /// Price terms
    #[serde(flatten)]
    pub terms: ListingTerms,
    /// Sale format, carried as given by the seller
    pub sale_type: String,
    /// Lifecycle status
    pub status: ListingStatus,
    /// Optional expiry
    pub expires_at: Option<DateTime<Utc>>,
    /// Creation timestamp
    pub created_at: DateTime<Utc>,
    /// When it sold
    pub sold_at: Option<DateTime<Utc>>,
}

impl Listing {
    /// Listing kind
    pub fn kind(&self) -> ListingKind {
        self.terms.kind()
    }

    /// Active and not past its expiry
    pub fn is_purchasable(&self, now: DateTime<Utc>) -> bool {
        self.status == ListingStatus::Active && self.expires_at.map_or(true, |at| at > now)
    }
}

text_enum! {
    /// Progress of the out-of-band seller payout
    pub enum PayoutStatus {
        /// Awaiting settlement
        Pending => "pending",
        /// Settled
        Complete => "complete",
    }
}

/// How a completed purchase was priced and split
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "settlement", rename_all = "snake_case")]
pub enum FeeBreakdown {
    /// Settled in USD outside the ledger
    Usd {
        /// Gross price in cents
        total_cents: Cents,
        /// Platform fee in cents
        platform_fee_cents: Cents,
        /// Seller proceeds in cents
        seller_receives_cents: Cents,
    },
    /// Settled in coins on the ledger
    Coins {
        /// Gross price in coins
        price_coins: Coins,
        /// Platform fee in coins
        platform_fee_coins: Coins,
        /// Seller proceeds in coins
        seller_receives_coins: Coins,
    },
}

/// Immutable record of one completed marketplace purchase
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarketplaceTransaction {
    /// Transaction ID, also the reference of its ledger entries
    pub id: Uuid,
    /// Listing bought
    pub listing_id: Uuid,
    /// Seller
    pub seller_id: AccountId,
    /// Buyer
    pub buyer_id: AccountId,
    /// Listing kind
    pub listing_kind: ListingKind,
    /// Coins moved by the purchase
    pub coins_transacted: Coins,
    /// Price and fee split
    pub fees: FeeBreakdown,
    /// Payout progression, owned by the external payout process
    pub payout_status: PayoutStatus,
    /// Completion timestamp
    pub created_at: DateTime<Utc>,
}

text_enum! {
    /// Redemption request lifecycle
    pub enum RedemptionStatus {
        /// Awaiting an administrative decision
        Pending => "pending",
        /// Payout approved
        Approved => "approved",
        /// Refused; coins restored
        Rejected => "rejected",
    }
}

/// Request to convert coins back to currency
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RedemptionRequest {
    /// Request ID, also the reference of its ledger entries
    pub id: Uuid,
    /// Requesting account
    pub account_id: AccountId,
    /// Coins debited at request time
    pub coins_redeemed: Coins,
    /// Cash payout in cents
    pub payout_cents: Cents,
    /// Status
    pub status: RedemptionStatus,
    /// Request timestamp
    pub requested_at: DateTime<Utc>,
    /// Decision timestamp
    pub resolved_at: Option<DateTime<Utc>>,
}

text_enum! {
    /// Coin purchase (checkout) lifecycle
    pub enum PurchaseStatus {
        /// Payment intent created, not yet paid
        Pending => "pending",
        /// Paid; coins credited
        Complete => "complete",
        /// Payment failed
        Failed => "failed",
    }
}

/// Coin purchase keyed by the processor's payment-intent id
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoinPurchase {
    /// Purchase ID
    pub id: Uuid,
    /// Buyer
    pub account_id: AccountId,
    /// Processor payment-intent id
    pub payment_intent_id: String,
    /// Charged amount in cents
    pub amount_cents: Cents,
    /// Coins granted on success
    pub coins_granted: Coins,
    /// Tier label, e.g. `$100`
    pub tier: String,
    /// Status
    pub status: PurchaseStatus,
    /// Checkout timestamp
    pub created_at: DateTime<Utc>,
}
