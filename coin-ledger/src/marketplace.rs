//! Marketplace transaction processor
//!
//! Secondary market for coins and jade. A purchase re-reads the listing and
//! the buyer's balance, computes fees, then commits the transaction record,
//! every ledger leg and the listing's `sold` transition as one batch guarded
//! by "listing still active" and "buyer can still afford it".
//!
//! Settlement:
//!
//! | Listing | Ledger legs | Fee |
//! |---|---|---|
//! | coins | buyer `marketplace_buy -n`, seller `marketplace_sell +n` | USD, recorded on the transaction, paid out of band |
//! | jade priced in coins | buyer `marketplace_buy -p`, seller `marketplace_sell +(p - fee)`, seller `marketplace_fee -fee` | coins, half-up |
//! | jade priced in USD only | none | `UnsupportedPaymentMethod` |

use crate::{
    balance::BalanceCalculator,
    money::{coin_listing_total_usd, FeeSchedule},
    retry::RetryPolicy,
    storage::{Guard, Write, WriteBatch},
    types::{
        AccountId, Coins, EntryKind, FeeBreakdown, LedgerEntry, Listing, ListingKind,
        ListingStatus, ListingTerms, MarketplaceTransaction, PayoutStatus,
    },
    Error, Ledger, Result,
};
use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

/// Offer of coins for USD
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewCoinListing {
    /// Coins for sale
    pub coins_offered: Coins,
    /// Price of one coin in USD
    pub price_per_coin_usd: Decimal,
    /// Sale format
    pub sale_type: String,
    /// Days until the listing lapses
    pub expires_in_days: Option<u32>,
}

/// Offer of a piece of jade
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewJadeListing {
    /// Title
    pub title: String,
    /// Description
    pub description: Option<String>,
    /// Image URLs
    #[serde(default)]
    pub images: Vec<String>,
    /// Provenance notes
    pub provenance: Option<String>,
    /// Price in coins
    pub price_coins: Option<Coins>,
    /// Price in USD
    pub price_usd: Option<Decimal>,
    /// Sale format
    pub sale_type: String,
    /// Days until the listing lapses
    pub expires_in_days: Option<u32>,
}

/// Purchase request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PurchaseRequest {
    /// Listing to buy
    pub listing_id: Uuid,
    /// Buyer
    pub buyer_id: AccountId,
    /// Caller idempotency key, used as the transaction id
    pub request_id: Option<Uuid>,
}

/// Outcome of a purchase
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PurchaseReceipt {
    /// Transaction record
    pub transaction: MarketplaceTransaction,
    /// True when the request id matched an existing transaction
    pub replayed: bool,
}

/// Listing lifecycle and purchases
#[derive(Debug, Clone)]
pub struct MarketplaceProcessor {
    ledger: Ledger,
    balances: BalanceCalculator,
    fees: FeeSchedule,
    retry: RetryPolicy,
}

impl MarketplaceProcessor {
    /// Create processor
    pub fn new(
        ledger: Ledger,
        balances: BalanceCalculator,
        fees: FeeSchedule,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            ledger,
            balances,
            fees,
            retry,
        }
    }

    // ==================== Listings ====================

    /// List coins for sale. The seller must hold them, but nothing is reserved.
    pub async fn create_coin_listing(
        &self,
        seller_id: &AccountId,
        new: NewCoinListing,
    ) -> Result<Listing> {
        if new.coins_offered <= 0 {
            return Err(Error::Validation("coins_offered must be positive".to_string()));
        }
        if new.price_per_coin_usd <= Decimal::ZERO {
            return Err(Error::Validation("price_per_coin_usd must be positive".to_string()));
        }
        let sale_type = required_sale_type(&new.sale_type)?;

        let balance = self.balances.balance(seller_id).await?;
        if balance.total < new.coins_offered {
            return Err(Error::InsufficientFunds {
                required: new.coins_offered,
                available: balance.total,
            });
        }

        let terms = ListingTerms::Coins {
            coins_offered: new.coins_offered,
            price_per_coin_usd: new.price_per_coin_usd,
        };
        self.insert_listing(seller_id, terms, sale_type, new.expires_in_days)
            .await
    }

    /// List a piece of jade priced in coins, USD, or both
    pub async fn create_jade_listing(
        &self,
        seller_id: &AccountId,
        new: NewJadeListing,
    ) -> Result<Listing> {
        let title = new.title.trim();
        if title.is_empty() {
            return Err(Error::Validation("title is required".to_string()));
        }
        if new.price_coins.is_none() && new.price_usd.is_none() {
            return Err(Error::Validation(
                "must specify price in coins or USD".to_string(),
            ));
        }
        if matches!(new.price_coins, Some(price) if price <= 0) {
            return Err(Error::Validation("price_coins must be positive".to_string()));
        }
        if matches!(new.price_usd, Some(price) if price <= Decimal::ZERO) {
            return Err(Error::Validation("price_usd must be positive".to_string()));
        }
        let sale_type = required_sale_type(&new.sale_type)?;

        let terms = ListingTerms::Jade {
            title: title.to_string(),
            description: new.description,
            images: new.images,
            provenance: new.provenance,
            price_coins: new.price_coins,
            price_usd: new.price_usd,
        };
        self.insert_listing(seller_id, terms, sale_type, new.expires_in_days)
            .await
    }

    async fn insert_listing(
        &self,
        seller_id: &AccountId,
        terms: ListingTerms,
        sale_type: String,
        expires_in_days: Option<u32>,
    ) -> Result<Listing> {
        let now = Utc::now();
        let expires_at = match expires_in_days {
            Some(0) => {
                return Err(Error::Validation("expires_in_days must be positive".to_string()))
            }
            Some(days) => Some(expiry_after(now, days)),
            None => None,
        };

        let listing = Listing {
            id: Uuid::now_v7(),
            seller_id: seller_id.clone(),
            terms,
            sale_type,
            status: ListingStatus::Active,
            expires_at,
            created_at: now,
            sold_at: None,
        };
        self.ledger
            .commit(WriteBatch::new().write(Write::InsertListing(listing.clone())))
            .await?;

        info!(
            listing_id = %listing.id,
            seller_id = %seller_id,
            kind = %listing.kind(),
            "Listing created"
        );
        Ok(listing)
    }

    /// Withdraw an active listing. Only the seller may cancel.
    pub async fn cancel_listing(&self, listing_id: Uuid, account_id: &AccountId) -> Result<Listing> {
        self.retry
            .run("cancel_listing", self.ledger.metrics(), || async move {
                let mut listing = self
                    .ledger
                    .store()
                    .listing(listing_id)
                    .await?
                    .filter(|listing| &listing.seller_id == account_id)
                    .ok_or(Error::ListingNotFound(listing_id))?;
                if listing.status != ListingStatus::Active {
                    return Err(Error::ListingUnavailable(listing_id));
                }

                self.ledger
                    .commit(
                        WriteBatch::new()
                            .guard(Guard::ListingActive { listing_id })
                            .write(Write::SetListingStatus {
                                listing_id,
                                status: ListingStatus::Cancelled,
                                at: Utc::now(),
                            }),
                    )
                    .await?;

                listing.status = ListingStatus::Cancelled;
                info!(%listing_id, "Listing cancelled");
                Ok(listing)
            })
            .await
    }

    /// Purchasable listings, newest first
    pub async fn active_listings(&self, kind: Option<ListingKind>) -> Result<Vec<Listing>> {
        let now = Utc::now();
        let listings = self.ledger.store().active_listings(kind).await?;
        Ok(listings
            .into_iter()
            .filter(|listing| listing.is_purchasable(now))
            .collect())
    }

    /// Every listing of a seller, newest first
    pub async fn listings_by_seller(&self, seller_id: &AccountId) -> Result<Vec<Listing>> {
        self.ledger.store().listings_by_seller(seller_id).await
    }

    /// Transaction by id
    pub async fn transaction(&self, transaction_id: Uuid) -> Result<Option<MarketplaceTransaction>> {
        self.ledger.store().transaction(transaction_id).await
    }

    // ==================== Purchases ====================

    /// Buy a listing
    pub async fn purchase(&self, request: PurchaseRequest) -> Result<PurchaseReceipt> {
        let req = &request;
        let result = self
            .retry
            .run("purchase", self.ledger.metrics(), || self.try_purchase(req))
            .await;

        match &result {
            Ok(receipt) if !receipt.replayed => {
                self.ledger.metrics().marketplace_purchases.inc();
                info!(
                    transaction_id = %receipt.transaction.id,
                    listing_id = %request.listing_id,
                    buyer_id = %request.buyer_id,
                    coins = receipt.transaction.coins_transacted,
                    "Marketplace purchase complete"
                );
            }
            Ok(receipt) => debug!(transaction_id = %receipt.transaction.id, "Purchase replayed"),
            Err(e) => debug!(listing_id = %request.listing_id, reason = e.kind(), "Purchase rejected"),
        }
        result
    }

    async fn try_purchase(&self, request: &PurchaseRequest) -> Result<PurchaseReceipt> {
        let store = self.ledger.store();

        if let Some(id) = request.request_id {
            if let Some(existing) = store.transaction(id).await? {
                if existing.listing_id != request.listing_id || existing.buyer_id != request.buyer_id {
                    return Err(Error::Validation(format!(
                        "request id {} was already used for a different purchase",
                        id
                    )));
                }
                return Ok(PurchaseReceipt {
                    transaction: existing,
                    replayed: true,
                });
            }
        }

        // 1. Listing
        let now = Utc::now();
        let listing = store
            .listing(request.listing_id)
            .await?
            .ok_or(Error::ListingNotFound(request.listing_id))?;
        if !listing.is_purchasable(now) {
            return Err(Error::ListingUnavailable(listing.id));
        }

        // 2. Self-dealing
        if listing.seller_id == request.buyer_id {
            return Err(Error::SelfPurchase);
        }

        // 3. Settlement
        let settlement = self.settle(&listing)?;

        let balance = self.balances.balance_at(&request.buyer_id, now).await?;
        if settlement.buyer_pays > balance.spendable {
            return Err(Error::InsufficientFunds {
                required: settlement.buyer_pays,
                available: balance.spendable,
            });
        }

        // 4. Commit
        let transaction = MarketplaceTransaction {
            id: request.request_id.unwrap_or_else(Uuid::now_v7),
            listing_id: listing.id,
            seller_id: listing.seller_id.clone(),
            buyer_id: request.buyer_id.clone(),
            listing_kind: listing.kind(),
            coins_transacted: settlement.buyer_pays,
            fees: settlement.fees,
            payout_status: settlement.payout_status,
            created_at: now,
        };

        let reference = transaction.id.to_string();
        let leg = |account: &AccountId, amount: Coins, kind: EntryKind, note: String| {
            LedgerEntry::new(account.clone(), amount, kind, reference.clone(), note).at(now)
        };

        let mut batch = WriteBatch::new()
            .guard(Guard::ListingActive {
                listing_id: listing.id,
            })
            .guard(
                self.balances
                    .spendable_guard(&request.buyer_id, settlement.buyer_pays, now),
            )
            .write(Write::InsertTransaction(transaction.clone()))
            .entry(leg(
                &request.buyer_id,
                -settlement.buyer_pays,
                EntryKind::MarketplaceBuy,
                format!("Purchased {} on marketplace", settlement.description),
            ))
            .entry(leg(
                &listing.seller_id,
                settlement.seller_credit,
                EntryKind::MarketplaceSell,
                format!("Sold {} on marketplace", settlement.description),
            ));

        if settlement.fee_coins > 0 {
            batch = batch.entry(leg(
                &listing.seller_id,
                -settlement.fee_coins,
                EntryKind::MarketplaceFee,
                format!(
                    "Platform fee ({}%)",
                    (self.fees.rate() * Decimal::ONE_HUNDRED).normalize()
                ),
            ));
        }

        batch = batch.write(Write::SetListingStatus {
            listing_id: listing.id,
            status: ListingStatus::Sold,
            at: now,
        });

        self.ledger.commit(batch).await?;

        Ok(PurchaseReceipt {
            transaction,
            replayed: false,
        })
    }

    fn settle(&self, listing: &Listing) -> Result<Settlement> {
        match &listing.terms {
            ListingTerms::Coins {
                coins_offered,
                price_per_coin_usd,
            } => {
                let total_usd = coin_listing_total_usd(*coins_offered, *price_per_coin_usd)?;
                Ok(Settlement {
                    buyer_pays: *coins_offered,
                    seller_credit: *coins_offered,
                    fee_coins: 0,
                    fees: self.fees.split_usd(total_usd)?,
                    payout_status: PayoutStatus::Pending,
                    description: format!("{} coins", coins_offered),
                })
            }
            ListingTerms::Jade {
                title,
                price_coins: Some(price),
                ..
            } => {
                let fees = self.fees.split_coins(*price)?;
                let fee_coins = match fees {
                    FeeBreakdown::Coins {
                        platform_fee_coins, ..
                    } => platform_fee_coins,
                    FeeBreakdown::Usd { .. } => 0,
                };
                Ok(Settlement {
                    buyer_pays: *price,
                    seller_credit: price - fee_coins,
                    fee_coins,
                    fees,
                    payout_status: PayoutStatus::Complete,
                    description: format!("jade: {}", title),
                })
            }
            ListingTerms::Jade {
                price_coins: None,
                price_usd: Some(_),
                ..
            } => Err(Error::UnsupportedPaymentMethod(
                "USD settlement of jade listings".to_string(),
            )),
            ListingTerms::Jade { .. } => Err(Error::Validation(format!(
                "listing {} has no valid price",
                listing.id
            ))),
        }
    }
}

/// Ledger effect of buying one listing
struct Settlement {
    buyer_pays: Coins,
    seller_credit: Coins,
    fee_coins: Coins,
    fees: FeeBreakdown,
    payout_status: PayoutStatus,
    description: String,
}

fn required_sale_type(sale_type: &str) -> Result<String> {
    let sale_type = sale_type.trim();
    if sale_type.is_empty() {
        return Err(Error::Validation("sale_type is required".to_string()));
    }
    Ok(sale_type.to_string())
}

/// Expiry instant for a listing created at `now`
pub fn expiry_after(now: DateTime<Utc>, days: u32) -> DateTime<Utc> {
    now + Duration::days(i64::from(days))
}
