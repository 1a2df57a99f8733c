//! Error types for the coin ledger

use crate::types::Coins;
use thiserror::Error;
use uuid::Uuid;

/// Result type for ledger operations
pub type Result<T> = std::result::Result<T, Error>;

/// Ledger errors
///
/// Business-rule rejections are final for the given request. Only
/// `ConcurrencyConflict` is retried internally; `StorageUnavailable` is safe
/// for the caller to retry.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// Malformed or missing input
    #[error("Validation error: {0}")]
    Validation(String),

    /// Not enough coins for the operation
    #[error("Insufficient funds: required {required}, available {available}")]
    InsufficientFunds {
        /// Coins the operation needs
        required: Coins,
        /// Coins the account can use
        available: Coins,
    },

    /// Bid does not beat the current price
    #[error("Bid of {amount} must be higher than current price {current_price}")]
    BidTooLow {
        /// Rejected amount
        amount: Coins,
        /// Price that had to be exceeded
        current_price: Coins,
    },

    /// Auction is not accepting bids
    #[error("Auction {0} is not live")]
    AuctionNotLive(Uuid),

    /// Auction does not exist
    #[error("Auction not found: {0}")]
    AuctionNotFound(Uuid),

    /// Lot is not accepting bids
    #[error("Lot {0} is not open for bidding")]
    LotNotOpen(Uuid),

    /// Lot does not exist in the given auction
    #[error("Lot not found: {0}")]
    LotNotFound(Uuid),

    /// Listing does not exist (or is not visible to the caller)
    #[error("Listing not found: {0}")]
    ListingNotFound(Uuid),

    /// Listing is sold, cancelled or expired
    #[error("Listing {0} is not available")]
    ListingUnavailable(Uuid),

    /// Buyer is the seller
    #[error("Cannot buy your own listing")]
    SelfPurchase,

    /// No coin tier for the amount
    #[error("No coin tier for ${0}")]
    UnknownTier(u32),

    /// Listing is priced only in a currency the engine cannot settle
    #[error("Unsupported payment method: {0}")]
    UnsupportedPaymentMethod(String),

    /// Checkout would mint past the coin supply cap
    #[error("Mint cap exceeded: requested {requested}, remaining {remaining}")]
    MintCapExceeded {
        /// Coins the checkout would grant
        requested: Coins,
        /// Coins still mintable
        remaining: Coins,
    },

    /// Redemption request does not exist
    #[error("Redemption not found: {0}")]
    RedemptionNotFound(Uuid),

    /// Redemption request was already decided
    #[error("Redemption {0} is not pending")]
    RedemptionNotPending(Uuid),

    /// No checkout recorded for the payment intent
    #[error("Purchase not found for payment intent {0}")]
    PurchaseNotFound(String),

    /// Optimistic precondition failed at commit time
    #[error("Concurrency conflict: {0}")]
    ConcurrencyConflict(String),

    /// Payment processor call failed
    #[error("Payment gateway error: {0}")]
    Gateway(String),

    /// Backing store failed
    #[error("Storage unavailable: {0}")]
    StorageUnavailable(String),

    /// Invalid configuration
    #[error("Configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Stable taxonomy name reported to callers
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Validation(_) => "validation_error",
            Error::InsufficientFunds { .. } => "insufficient_funds",
            Error::BidTooLow { .. } => "bid_too_low",
            Error::AuctionNotLive(_) => "auction_not_live",
            Error::AuctionNotFound(_) => "auction_not_found",
            Error::LotNotOpen(_) => "lot_not_open",
            Error::LotNotFound(_) => "lot_not_found",
            Error::ListingNotFound(_) => "listing_not_found",
            Error::ListingUnavailable(_) => "listing_unavailable",
            Error::SelfPurchase => "self_purchase",
            Error::UnknownTier(_) => "unknown_tier",
            Error::UnsupportedPaymentMethod(_) => "unsupported_payment_method",
            Error::MintCapExceeded { .. } => "mint_cap_exceeded",
            Error::RedemptionNotFound(_) => "redemption_not_found",
            Error::RedemptionNotPending(_) => "redemption_not_pending",
            Error::PurchaseNotFound(_) => "purchase_not_found",
            Error::ConcurrencyConflict(_) => "concurrency_conflict",
            Error::Gateway(_) => "payment_gateway_error",
            Error::StorageUnavailable(_) => "storage_unavailable",
            Error::Config(_) => "config_error",
        }
    }

    /// Whether the engine retries the whole read-validate-commit sequence
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::ConcurrencyConflict(_))
    }

    /// Whether the caller may safely retry the same request
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::ConcurrencyConflict(_) | Error::StorageUnavailable(_) | Error::Gateway(_)
        )
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Config(err.to_string())
    }
}
