use chrono::{DateTime, Utc};
use coin_ledger::{
    Balance, CoinTier, Coins, LedgerEntry, ListingKind, NewCoinListing, NewJadeListing,
};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use validator::Validate;

/// Coin checkout request
#[derive(Debug, Deserialize, Serialize, Validate)]
pub struct CheckoutRequest {
    #[validate(range(min = 1))]
    pub tier_usd: u32,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CheckoutResponse {
    pub client_secret: String,
    pub payment_intent_id: String,
    pub coins: Coins,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct TierResponse {
    pub usd: u32,
    pub coins: Coins,
    pub label: String,
}

impl From<&CoinTier> for TierResponse {
    fn from(tier: &CoinTier) -> Self {
        TierResponse {
            usd: tier.usd,
            coins: tier.coins,
            label: tier.label(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct TiersResponse {
    pub tiers: Vec<TierResponse>,
    /// Coins still mintable; absent when supply is uncapped
    pub remaining_supply: Option<Coins>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct BalanceResponse {
    pub account_id: String,
    #[serde(flatten)]
    pub balance: Balance,
}

/// Caller identity as taken from the token, with the coin balance
#[derive(Debug, Serialize, Deserialize)]
pub struct MeResponse {
    pub account_id: String,
    pub email: Option<String>,
    pub is_admin: bool,
    pub coin_balance: Balance,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HistoryResponse {
    pub account_id: String,
    pub entries: Vec<LedgerEntry>,
}

/// Bid on a lot of the auction named in the path
#[derive(Debug, Deserialize, Serialize, Validate)]
pub struct PlaceBidRequest {
    pub lot_id: Uuid,
    #[validate(range(min = 1))]
    pub amount_coins: i64,
    pub request_id: Option<Uuid>,
}

#[derive(Debug, Deserialize, Serialize, Validate)]
pub struct CreateCoinListingRequest {
    #[validate(range(min = 1))]
    pub coins_offered: i64,
    pub price_per_coin_usd: Decimal,
    #[validate(length(min = 1, max = 32))]
    pub sale_type: String,
    #[validate(range(min = 1, max = 365))]
    pub expires_in_days: Option<u32>,
}

impl From<CreateCoinListingRequest> for NewCoinListing {
    fn from(request: CreateCoinListingRequest) -> Self {
        NewCoinListing {
            coins_offered: request.coins_offered,
            price_per_coin_usd: request.price_per_coin_usd,
            sale_type: request.sale_type,
            expires_in_days: request.expires_in_days,
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Validate)]
pub struct CreateJadeListingRequest {
    #[validate(length(min = 1, max = 200))]
    pub jade_title: String,
    #[validate(length(max = 5000))]
    pub jade_description: Option<String>,
    #[serde(default)]
    #[validate(length(max = 20))]
    pub jade_images: Vec<String>,
    #[validate(length(max = 5000))]
    pub jade_provenance: Option<String>,
    #[validate(range(min = 1))]
    pub jade_price_coins: Option<i64>,
    pub jade_price_usd: Option<Decimal>,
    #[validate(length(min = 1, max = 32))]
    pub sale_type: String,
    #[validate(range(min = 1, max = 365))]
    pub expires_in_days: Option<u32>,
}

impl From<CreateJadeListingRequest> for NewJadeListing {
    fn from(request: CreateJadeListingRequest) -> Self {
        NewJadeListing {
            title: request.jade_title,
            description: request.jade_description,
            images: request.jade_images,
            provenance: request.jade_provenance,
            price_coins: request.jade_price_coins,
            price_usd: request.jade_price_usd,
            sale_type: request.sale_type,
            expires_in_days: request.expires_in_days,
        }
    }
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct BuyRequest {
    pub request_id: Option<Uuid>,
}

#[derive(Debug, Deserialize, Serialize, Validate)]
pub struct RedeemRequest {
    #[validate(range(min = 1))]
    pub coins: i64,
    pub request_id: Option<Uuid>,
}

#[derive(Debug, Deserialize)]
pub struct ListingsQuery {
    #[serde(rename = "type")]
    pub listing_type: Option<String>,
}

impl ListingsQuery {
    /// `coins` or `jade` filter; anything else lists every kind
    pub fn kind(&self) -> Option<ListingKind> {
        self.listing_type
            .as_deref()
            .and_then(|value| value.parse::<ListingKind>().ok())
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct WebhookResponse {
    pub received: bool,
    /// False when the event was ignored or could not be confirmed
    pub applied: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub service: String,
    pub version: String,
    pub timestamp: DateTime<Utc>,
}
