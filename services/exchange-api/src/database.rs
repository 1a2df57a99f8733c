//! PostgreSQL store
//!
//! Each [`WriteBatch`] runs in one SQL transaction. Advisory locks serialize
//! balance-guarded debits per account and checkouts against the mint cap;
//! contended rows (lots, listings, redemptions, purchases) are read
//! `FOR UPDATE` while their guard is checked. Unique, exclusion and
//! serialization failures surface as `ConcurrencyConflict` so the engines
//! retry them.

use crate::config::DatabaseConfig;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use coin_ledger::{
    AccountId, Auction, Bid, CoinPurchase, Coins, EntryFilter, EntryKind, Error as LedgerError,
    FeeBreakdown, Guard, LedgerEntry, Listing, ListingKind, ListingTerms, Lot,
    MarketplaceTransaction, PurchaseStatus, RedemptionRequest, Result, Store, Write, WriteBatch,
};
use rust_decimal::Decimal;
use sqlx::postgres::{PgConnection, PgPool, PgPoolOptions};
use sqlx::FromRow;
use std::collections::BTreeSet;
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, error, info};
use uuid::Uuid;

/// Advisory lock namespaces (first key of the two-key form)
const ACCOUNT_LOCK_SPACE: i32 = 1;
const MINT_LOCK_SPACE: i32 = 2;

/// Map a driver error onto the ledger taxonomy
pub fn db_error(err: sqlx::Error) -> LedgerError {
    if let sqlx::Error::Database(db) = &err {
        // unique, exclusion, serialization, deadlock
        if let Some("23505" | "23P01" | "40001" | "40P01") = db.code().as_deref() {
            return LedgerError::ConcurrencyConflict(db.message().to_string());
        }
    }
    error!("Database error: {}", err);
    LedgerError::StorageUnavailable(err.to_string())
}

fn corrupt(table: &str, detail: impl std::fmt::Display) -> LedgerError {
    error!(table, "Unreadable row: {}", detail);
    LedgerError::StorageUnavailable(format!("unreadable {} row: {}", table, detail))
}

fn parse<T: FromStr<Err = LedgerError>>(table: &str, value: &str) -> Result<T> {
    value.parse::<T>().map_err(|e| corrupt(table, e))
}

// ==================== Rows ====================

#[derive(Debug, Clone, FromRow)]
pub struct EntryRow {
    pub id: Uuid,
    pub account_id: String,
    pub amount: i64,
    pub kind: String,
    pub reference_id: String,
    pub note: String,
    pub created_at: DateTime<Utc>,
}

impl TryFrom<EntryRow> for LedgerEntry {
    type Error = LedgerError;

    fn try_from(row: EntryRow) -> Result<Self> {
        Ok(LedgerEntry {
            id: row.id,
            account_id: AccountId::new(row.account_id),
            amount: row.amount,
            kind: parse("ledger_entries", &row.kind)?,
            reference_id: row.reference_id,
            created_at: row.created_at,
            note: row.note,
        })
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct AuctionRow {
    pub id: Uuid,
    pub title: String,
    pub status: String,
    pub starts_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl TryFrom<AuctionRow> for Auction {
    type Error = LedgerError;

    fn try_from(row: AuctionRow) -> Result<Self> {
        Ok(Auction {
            id: row.id,
            title: row.title,
            status: parse("auctions", &row.status)?,
            starts_at: row.starts_at,
            started_at: row.started_at,
            created_at: row.created_at,
        })
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct LotRow {
    pub id: Uuid,
    pub auction_id: Uuid,
    pub title: String,
    pub status: String,
    pub starting_price: i64,
    pub current_price: Option<i64>,
    pub winning_bid_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

impl TryFrom<LotRow> for Lot {
    type Error = LedgerError;

    fn try_from(row: LotRow) -> Result<Self> {
        Ok(Lot {
            id: row.id,
            auction_id: row.auction_id,
            title: row.title,
            status: parse("auction_lots", &row.status)?,
            starting_price: row.starting_price,
            current_price: row.current_price,
            winning_bid_id: row.winning_bid_id,
            created_at: row.created_at,
        })
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct BidRow {
    pub id: Uuid,
    pub lot_id: Uuid,
    pub account_id: String,
    pub amount: i64,
    pub status: String,
    pub created_at: DateTime<Utc>,
}

impl TryFrom<BidRow> for Bid {
    type Error = LedgerError;

    fn try_from(row: BidRow) -> Result<Self> {
        Ok(Bid {
            id: row.id,
            lot_id: row.lot_id,
            account_id: AccountId::new(row.account_id),
            amount: row.amount,
            status: parse("bids", &row.status)?,
            created_at: row.created_at,
        })
    }
}

/// Listing terms flattened into nullable columns
#[derive(Debug, Clone, FromRow)]
pub struct ListingRow {
    pub id: Uuid,
    pub seller_id: String,
    pub listing_type: String,
    pub coins_offered: Option<i64>,
    pub price_per_coin_usd: Option<Decimal>,
    pub jade_title: Option<String>,
    pub jade_description: Option<String>,
    pub jade_images: Vec<String>,
    pub jade_provenance: Option<String>,
    pub jade_price_coins: Option<i64>,
    pub jade_price_usd: Option<Decimal>,
    pub sale_type: String,
    pub status: String,
    pub expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub sold_at: Option<DateTime<Utc>>,
}

impl From<&Listing> for ListingRow {
    fn from(listing: &Listing) -> Self {
        let mut row = ListingRow {
            id: listing.id,
            seller_id: listing.seller_id.to_string(),
            listing_type: listing.kind().to_string(),
            coins_offered: None,
            price_per_coin_usd: None,
            jade_title: None,
            jade_description: None,
            jade_images: Vec::new(),
            jade_provenance: None,
            jade_price_coins: None,
            jade_price_usd: None,
            sale_type: listing.sale_type.clone(),
            status: listing.status.to_string(),
            expires_at: listing.expires_at,
            created_at: listing.created_at,
            sold_at: listing.sold_at,
        };

        match &listing.terms {
            ListingTerms::Coins {
                coins_offered,
                price_per_coin_usd,
            } => {
                row.coins_offered = Some(*coins_offered);
                row.price_per_coin_usd = Some(*price_per_coin_usd);
            }
            ListingTerms::Jade {
                title,
                description,
                images,
                provenance,
                price_coins,
                price_usd,
            } => {
                row.jade_title = Some(title.clone());
                row.jade_description = description.clone();
                row.jade_images = images.clone();
                row.jade_provenance = provenance.clone();
                row.jade_price_coins = *price_coins;
                row.jade_price_usd = *price_usd;
            }
        }
        row
    }
}

impl TryFrom<ListingRow> for Listing {
    type Error = LedgerError;

    fn try_from(row: ListingRow) -> Result<Self> {
        let terms = match parse::<ListingKind>("marketplace_listings", &row.listing_type)? {
            ListingKind::Coins => ListingTerms::Coins {
                coins_offered: row
                    .coins_offered
                    .ok_or_else(|| corrupt("marketplace_listings", "coins_offered missing"))?,
                price_per_coin_usd: row
                    .price_per_coin_usd
                    .ok_or_else(|| corrupt("marketplace_listings", "price_per_coin_usd missing"))?,
            },
            ListingKind::Jade => ListingTerms::Jade {
                title: row
                    .jade_title
                    .ok_or_else(|| corrupt("marketplace_listings", "jade_title missing"))?,
                description: row.jade_description,
                images: row.jade_images,
                provenance: row.jade_provenance,
                price_coins: row.jade_price_coins,
                price_usd: row.jade_price_usd,
            },
        };

        Ok(Listing {
            id: row.id,
            seller_id: AccountId::new(row.seller_id),
            terms,
            sale_type: row.sale_type,
            status: parse("marketplace_listings", &row.status)?,
            expires_at: row.expires_at,
            created_at: row.created_at,
            sold_at: row.sold_at,
        })
    }
}

/// Fee breakdown stored as settlement currency plus three amounts
#[derive(Debug, Clone, FromRow)]
pub struct TransactionRow {
    pub id: Uuid,
    pub listing_id: Uuid,
    pub seller_id: String,
    pub buyer_id: String,
    pub listing_type: String,
    pub coins_transacted: i64,
    pub settlement: String,
    pub gross_amount: i64,
    pub platform_fee: i64,
    pub seller_receives: i64,
    pub payout_status: String,
    pub created_at: DateTime<Utc>,
}

impl From<&MarketplaceTransaction> for TransactionRow {
    fn from(tx: &MarketplaceTransaction) -> Self {
        let (settlement, gross_amount, platform_fee, seller_receives) = match tx.fees {
            FeeBreakdown::Usd {
                total_cents,
                platform_fee_cents,
                seller_receives_cents,
            } => ("usd", total_cents, platform_fee_cents, seller_receives_cents),
            FeeBreakdown::Coins {
                price_coins,
                platform_fee_coins,
                seller_receives_coins,
            } => ("coins", price_coins, platform_fee_coins, seller_receives_coins),
        };

        TransactionRow {
            id: tx.id,
            listing_id: tx.listing_id,
            seller_id: tx.seller_id.to_string(),
            buyer_id: tx.buyer_id.to_string(),
            listing_type: tx.listing_kind.to_string(),
            coins_transacted: tx.coins_transacted,
            settlement: settlement.to_string(),
            gross_amount,
            platform_fee,
            seller_receives,
            payout_status: tx.payout_status.to_string(),
            created_at: tx.created_at,
        }
    }
}

impl TryFrom<TransactionRow> for MarketplaceTransaction {
    type Error = LedgerError;

    fn try_from(row: TransactionRow) -> Result<Self> {
        let fees = match row.settlement.as_str() {
            "usd" => FeeBreakdown::Usd {
                total_cents: row.gross_amount,
                platform_fee_cents: row.platform_fee,
                seller_receives_cents: row.seller_receives,
            },
            "coins" => FeeBreakdown::Coins {
                price_coins: row.gross_amount,
                platform_fee_coins: row.platform_fee,
                seller_receives_coins: row.seller_receives,
            },
            other => {
                return Err(corrupt(
                    "marketplace_transactions",
                    format!("unknown settlement '{}'", other),
                ))
            }
        };

        Ok(MarketplaceTransaction {
            id: row.id,
            listing_id: row.listing_id,
            seller_id: AccountId::new(row.seller_id),
            buyer_id: AccountId::new(row.buyer_id),
            listing_kind: parse("marketplace_transactions", &row.listing_type)?,
            coins_transacted: row.coins_transacted,
            fees,
            payout_status: parse("marketplace_transactions", &row.payout_status)?,
            created_at: row.created_at,
        })
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct RedemptionRow {
    pub id: Uuid,
    pub account_id: String,
    pub coins_redeemed: i64,
    pub payout_cents: i64,
    pub status: String,
    pub requested_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
}

impl TryFrom<RedemptionRow> for RedemptionRequest {
    type Error = LedgerError;

    fn try_from(row: RedemptionRow) -> Result<Self> {
        Ok(RedemptionRequest {
            id: row.id,
            account_id: AccountId::new(row.account_id),
            coins_redeemed: row.coins_redeemed,
            payout_cents: row.payout_cents,
            status: parse("redemption_requests", &row.status)?,
            requested_at: row.requested_at,
            resolved_at: row.resolved_at,
        })
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct PurchaseRow {
    pub id: Uuid,
    pub account_id: String,
    pub payment_intent_id: String,
    pub amount_cents: i64,
    pub coins_granted: i64,
    pub tier: String,
    pub status: String,
    pub created_at: DateTime<Utc>,
}

impl TryFrom<PurchaseRow> for CoinPurchase {
    type Error = LedgerError;

    fn try_from(row: PurchaseRow) -> Result<Self> {
        Ok(CoinPurchase {
            id: row.id,
            account_id: AccountId::new(row.account_id),
            payment_intent_id: row.payment_intent_id,
            amount_cents: row.amount_cents,
            coins_granted: row.coins_granted,
            tier: row.tier,
            status: parse("coin_purchases", &row.status)?,
            created_at: row.created_at,
        })
    }
}

fn convert_all<R, T>(rows: Vec<R>) -> Result<Vec<T>>
where
    T: TryFrom<R, Error = LedgerError>,
{
    rows.into_iter().map(T::try_from).collect()
}

fn kind_names(filter: &EntryFilter) -> Option<Vec<String>> {
    filter
        .kinds
        .as_ref()
        .map(|kinds| kinds.iter().map(|kind| kind.to_string()).collect())
}

// ==================== Store ====================

pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(config: &DatabaseConfig) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(Duration::from_secs(config.acquire_timeout_secs))
            .connect(&config.url)
            .await
            .map_err(db_error)?;

        Ok(PgStore { pool })
    }

    pub fn new(pool: PgPool) -> Self {
        PgStore { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Apply the bundled schema migrations
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| LedgerError::StorageUnavailable(format!("migration failed: {}", e)))?;
        info!("Database migrations applied");
        Ok(())
    }

    /// Liveness probe used by the health route
    pub async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(db_error)?;
        Ok(())
    }
}

async fn sum_entries(
    conn: &mut PgConnection,
    account_id: &AccountId,
    kinds: Option<Vec<String>>,
    since: Option<DateTime<Utc>>,
) -> Result<Coins> {
    sqlx::query_scalar::<_, i64>(
        r#"
        SELECT COALESCE(SUM(amount), 0)::BIGINT
        FROM ledger_entries
        WHERE account_id = $1
          AND ($2::TEXT[] IS NULL OR kind = ANY($2))
          AND ($3::TIMESTAMPTZ IS NULL OR created_at >= $3)
        "#,
    )
    .bind(account_id.as_str())
    .bind(kinds)
    .bind(since)
    .fetch_one(conn)
    .await
    .map_err(db_error)
}

/// Take advisory locks in a fixed order: mint cap first, then accounts sorted
async fn lock_for(conn: &mut PgConnection, batch: &WriteBatch) -> Result<()> {
    if batch
        .guards
        .iter()
        .any(|guard| matches!(guard, Guard::MintedAtMost { .. }))
    {
        sqlx::query("SELECT pg_advisory_xact_lock($1, 0)")
            .bind(MINT_LOCK_SPACE)
            .execute(&mut *conn)
            .await
            .map_err(db_error)?;
    }

    let accounts: BTreeSet<&str> = batch
        .guards
        .iter()
        .filter_map(|guard| match guard {
            Guard::SpendableAtLeast { account_id, .. } | Guard::TotalAtLeast { account_id, .. } => {
                Some(account_id.as_str())
            }
            _ => None,
        })
        .collect();

    for account in accounts {
        sqlx::query("SELECT pg_advisory_xact_lock($1, hashtext($2))")
            .bind(ACCOUNT_LOCK_SPACE)
            .bind(account)
            .execute(&mut *conn)
            .await
            .map_err(db_error)?;
    }
    Ok(())
}

fn conflict(message: String) -> LedgerError {
    LedgerError::ConcurrencyConflict(message)
}

async fn check_guard(conn: &mut PgConnection, guard: &Guard, batch: &WriteBatch) -> Result<()> {
    match guard {
        Guard::LotUnchanged {
            lot_id,
            current_price,
            winning_bid_id,
        } => {
            let row = sqlx::query_as::<_, (String, Option<i64>, Option<Uuid>)>(
                "SELECT status, current_price, winning_bid_id FROM auction_lots WHERE id = $1 FOR UPDATE",
            )
            .bind(lot_id)
            .fetch_optional(&mut *conn)
            .await
            .map_err(db_error)?
            .ok_or_else(|| conflict(format!("lot {} vanished", lot_id)))?;

            if row.0 != "open" || row.1 != *current_price || row.2 != *winning_bid_id {
                return Err(conflict(format!("lot {} changed", lot_id)));
            }
        }
        Guard::AuctionLive { auction_id } => {
            let status = sqlx::query_scalar::<_, String>(
                "SELECT status FROM auctions WHERE id = $1 FOR SHARE",
            )
            .bind(auction_id)
            .fetch_optional(&mut *conn)
            .await
            .map_err(db_error)?;

            if status.as_deref() != Some("live") {
                return Err(conflict(format!("auction {} no longer live", auction_id)));
            }
        }
        Guard::ListingActive { listing_id } => {
            let status = sqlx::query_scalar::<_, String>(
                "SELECT status FROM marketplace_listings WHERE id = $1 FOR UPDATE",
            )
            .bind(listing_id)
            .fetch_optional(&mut *conn)
            .await
            .map_err(db_error)?;

            if status.as_deref() != Some("active") {
                return Err(conflict(format!("listing {} no longer active", listing_id)));
            }
        }
        Guard::SpendableAtLeast {
            account_id,
            amount,
            as_of,
            maturation,
        } => {
            let total = sum_entries(&mut *conn, account_id, None, None).await?;
            let maturing = sum_entries(
                &mut *conn,
                account_id,
                Some(vec![EntryKind::Purchase.to_string()]),
                Some(*as_of - *maturation),
            )
            .await?;
            let spendable = (total - maturing).max(0);
            if spendable < *amount {
                return Err(conflict(format!(
                    "spendable balance of {} moved to {}",
                    account_id, spendable
                )));
            }
        }
        Guard::TotalAtLeast { account_id, amount } => {
            let total = sum_entries(&mut *conn, account_id, None, None).await?;
            if total < *amount {
                return Err(conflict(format!(
                    "total balance of {} moved to {}",
                    account_id, total
                )));
            }
        }
        Guard::PurchaseStatusIs {
            payment_intent_id,
            statuses,
        } => {
            let status = sqlx::query_scalar::<_, String>(
                "SELECT status FROM coin_purchases WHERE payment_intent_id = $1 FOR UPDATE",
            )
            .bind(payment_intent_id)
            .fetch_optional(&mut *conn)
            .await
            .map_err(db_error)?;

            let matches = match status {
                Some(status) => statuses.contains(&parse::<PurchaseStatus>("coin_purchases", &status)?),
                None => false,
            };
            if !matches {
                return Err(conflict(format!("purchase {} changed state", payment_intent_id)));
            }
        }
        Guard::RedemptionPending { redemption_id } => {
            let status = sqlx::query_scalar::<_, String>(
                "SELECT status FROM redemption_requests WHERE id = $1 FOR UPDATE",
            )
            .bind(redemption_id)
            .fetch_optional(&mut *conn)
            .await
            .map_err(db_error)?;

            if status.as_deref() != Some("pending") {
                return Err(conflict(format!("redemption {} no longer pending", redemption_id)));
            }
        }
        Guard::MintedAtMost { cap } => {
            let minted = sqlx::query_scalar::<_, i64>(
                "SELECT COALESCE(SUM(coins_granted), 0)::BIGINT FROM coin_purchases WHERE status <> 'failed'",
            )
            .fetch_one(&mut *conn)
            .await
            .map_err(db_error)?;

            let mut incoming: Coins = 0;
            for write in &batch.writes {
                match write {
                    Write::InsertPurchase(purchase) if purchase.status != PurchaseStatus::Failed => {
                        incoming += purchase.coins_granted;
                    }
                    // A failed purchase completing late re-enters the supply
                    Write::SetPurchaseStatus {
                        payment_intent_id,
                        status,
                    } if *status != PurchaseStatus::Failed => {
                        let revived = sqlx::query_scalar::<_, i64>(
                            "SELECT coins_granted FROM coin_purchases \
                             WHERE payment_intent_id = $1 AND status = 'failed'",
                        )
                        .bind(payment_intent_id)
                        .fetch_optional(&mut *conn)
                        .await
                        .map_err(db_error)?;
                        incoming += revived.unwrap_or(0);
                    }
                    _ => {}
                }
            }
            if minted + incoming > *cap {
                return Err(conflict("mint cap reached".to_string()));
            }
        }
    }
    Ok(())
}

/// Run an UPDATE and map "no row" onto the given error
async fn update_one(
    conn: &mut PgConnection,
    query: sqlx::query::Query<'_, sqlx::Postgres, sqlx::postgres::PgArguments>,
    missing: LedgerError,
) -> Result<()> {
    let result = query.execute(conn).await.map_err(db_error)?;
    if result.rows_affected() == 0 {
        return Err(missing);
    }
    Ok(())
}

async fn apply_write(conn: &mut PgConnection, write: &Write) -> Result<()> {
    match write {
        Write::AppendEntry(entry) => {
            sqlx::query(
                r#"
                INSERT INTO ledger_entries (id, account_id, amount, kind, reference_id, note, created_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7)
                "#,
            )
            .bind(entry.id)
            .bind(entry.account_id.as_str())
            .bind(entry.amount)
            .bind(entry.kind.as_str())
            .bind(&entry.reference_id)
            .bind(&entry.note)
            .bind(entry.created_at)
            .execute(conn)
            .await
            .map_err(db_error)?;
        }
        Write::InsertBid(bid) => {
            sqlx::query(
                r#"
                INSERT INTO bids (id, lot_id, account_id, amount, status, created_at)
                VALUES ($1, $2, $3, $4, $5, $6)
                "#,
            )
            .bind(bid.id)
            .bind(bid.lot_id)
            .bind(bid.account_id.as_str())
            .bind(bid.amount)
            .bind(bid.status.as_str())
            .bind(bid.created_at)
            .execute(conn)
            .await
            .map_err(db_error)?;
        }
        Write::MarkBidOutbid { bid_id } => {
            update_one(
                conn,
                sqlx::query("UPDATE bids SET status = 'outbid' WHERE id = $1").bind(*bid_id),
                conflict(format!("bid {} vanished", bid_id)),
            )
            .await?;
        }
        Write::AdvanceLot {
            lot_id,
            price,
            winning_bid_id,
        } => {
            update_one(
                conn,
                sqlx::query(
                    "UPDATE auction_lots SET current_price = $2, winning_bid_id = $3 WHERE id = $1",
                )
                .bind(*lot_id)
                .bind(*price)
                .bind(*winning_bid_id),
                LedgerError::LotNotFound(*lot_id),
            )
            .await?;
        }
        Write::SetLotStatus { lot_id, status } => {
            update_one(
                conn,
                sqlx::query("UPDATE auction_lots SET status = $2 WHERE id = $1")
                    .bind(*lot_id)
                    .bind(status.as_str()),
                LedgerError::LotNotFound(*lot_id),
            )
            .await?;
        }
        Write::InsertAuction(auction) => {
            sqlx::query(
                r#"
                INSERT INTO auctions (id, title, status, starts_at, started_at, created_at)
                VALUES ($1, $2, $3, $4, $5, $6)
                "#,
            )
            .bind(auction.id)
            .bind(&auction.title)
            .bind(auction.status.as_str())
            .bind(auction.starts_at)
            .bind(auction.started_at)
            .bind(auction.created_at)
            .execute(conn)
            .await
            .map_err(db_error)?;
        }
        Write::SetAuctionStatus {
            auction_id,
            status,
            at,
        } => {
            update_one(
                conn,
                sqlx::query(
                    r#"
                    UPDATE auctions
                    SET status = $2,
                        started_at = CASE WHEN $2 = 'live' THEN $3 ELSE started_at END
                    WHERE id = $1
                    "#,
                )
                .bind(*auction_id)
                .bind(status.as_str())
                .bind(*at),
                LedgerError::AuctionNotFound(*auction_id),
            )
            .await?;
        }
        Write::InsertLot(lot) => {
            let exists = sqlx::query_scalar::<_, bool>(
                "SELECT EXISTS (SELECT 1 FROM auctions WHERE id = $1)",
            )
            .bind(lot.auction_id)
            .fetch_one(&mut *conn)
            .await
            .map_err(db_error)?;
            if !exists {
                return Err(LedgerError::AuctionNotFound(lot.auction_id));
            }

            sqlx::query(
                r#"
                INSERT INTO auction_lots
                    (id, auction_id, title, status, starting_price, current_price, winning_bid_id, created_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                "#,
            )
            .bind(lot.id)
            .bind(lot.auction_id)
            .bind(&lot.title)
            .bind(lot.status.as_str())
            .bind(lot.starting_price)
            .bind(lot.current_price)
            .bind(lot.winning_bid_id)
            .bind(lot.created_at)
            .execute(conn)
            .await
            .map_err(db_error)?;
        }
        Write::InsertListing(listing) => {
            let row = ListingRow::from(listing);
            sqlx::query(
                r#"
                INSERT INTO marketplace_listings
                    (id, seller_id, listing_type, coins_offered, price_per_coin_usd,
                     jade_title, jade_description, jade_images, jade_provenance,
                     jade_price_coins, jade_price_usd, sale_type, status,
                     expires_at, created_at, sold_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)
                "#,
            )
            .bind(row.id)
            .bind(row.seller_id)
            .bind(row.listing_type)
            .bind(row.coins_offered)
            .bind(row.price_per_coin_usd)
            .bind(row.jade_title)
            .bind(row.jade_description)
            .bind(row.jade_images)
            .bind(row.jade_provenance)
            .bind(row.jade_price_coins)
            .bind(row.jade_price_usd)
            .bind(row.sale_type)
            .bind(row.status)
            .bind(row.expires_at)
            .bind(row.created_at)
            .bind(row.sold_at)
            .execute(conn)
            .await
            .map_err(db_error)?;
        }
        Write::SetListingStatus {
            listing_id,
            status,
            at,
        } => {
            update_one(
                conn,
                sqlx::query(
                    r#"
                    UPDATE marketplace_listings
                    SET status = $2,
                        sold_at = CASE WHEN $2 = 'sold' THEN $3 ELSE sold_at END
                    WHERE id = $1
                    "#,
                )
                .bind(*listing_id)
                .bind(status.as_str())
                .bind(*at),
                LedgerError::ListingNotFound(*listing_id),
            )
            .await?;
        }
        Write::InsertTransaction(tx) => {
            let row = TransactionRow::from(tx);
            sqlx::query(
                r#"
                INSERT INTO marketplace_transactions
                    (id, listing_id, seller_id, buyer_id, listing_type, coins_transacted,
                     settlement, gross_amount, platform_fee, seller_receives, payout_status, created_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
                "#,
            )
            .bind(row.id)
            .bind(row.listing_id)
            .bind(row.seller_id)
            .bind(row.buyer_id)
            .bind(row.listing_type)
            .bind(row.coins_transacted)
            .bind(row.settlement)
            .bind(row.gross_amount)
            .bind(row.platform_fee)
            .bind(row.seller_receives)
            .bind(row.payout_status)
            .bind(row.created_at)
            .execute(conn)
            .await
            .map_err(db_error)?;
        }
        Write::InsertRedemption(request) => {
            sqlx::query(
                r#"
                INSERT INTO redemption_requests
                    (id, account_id, coins_redeemed, payout_cents, status, requested_at, resolved_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7)
                "#,
            )
            .bind(request.id)
            .bind(request.account_id.as_str())
            .bind(request.coins_redeemed)
            .bind(request.payout_cents)
            .bind(request.status.as_str())
            .bind(request.requested_at)
            .bind(request.resolved_at)
            .execute(conn)
            .await
            .map_err(db_error)?;
        }
        Write::SetRedemptionStatus {
            redemption_id,
            status,
            at,
        } => {
            update_one(
                conn,
                sqlx::query(
                    "UPDATE redemption_requests SET status = $2, resolved_at = $3 WHERE id = $1",
                )
                .bind(*redemption_id)
                .bind(status.as_str())
                .bind(*at),
                LedgerError::RedemptionNotFound(*redemption_id),
            )
            .await?;
        }
        Write::InsertPurchase(purchase) => {
            sqlx::query(
                r#"
                INSERT INTO coin_purchases
                    (id, account_id, payment_intent_id, amount_cents, coins_granted, tier, status, created_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                "#,
            )
            .bind(purchase.id)
            .bind(purchase.account_id.as_str())
            .bind(&purchase.payment_intent_id)
            .bind(purchase.amount_cents)
            .bind(purchase.coins_granted)
            .bind(&purchase.tier)
            .bind(purchase.status.as_str())
            .bind(purchase.created_at)
            .execute(conn)
            .await
            .map_err(db_error)?;
        }
        Write::SetPurchaseStatus {
            payment_intent_id,
            status,
        } => {
            update_one(
                conn,
                sqlx::query("UPDATE coin_purchases SET status = $2 WHERE payment_intent_id = $1")
                    .bind(payment_intent_id.clone())
                    .bind(status.as_str()),
                LedgerError::PurchaseNotFound(payment_intent_id.clone()),
            )
            .await?;
        }
    }
    Ok(())
}

const ENTRY_COLUMNS: &str = "id, account_id, amount, kind, reference_id, note, created_at";
const LISTING_COLUMNS: &str = "id, seller_id, listing_type, coins_offered, price_per_coin_usd, \
     jade_title, jade_description, jade_images, jade_provenance, jade_price_coins, \
     jade_price_usd, sale_type, status, expires_at, created_at, sold_at";

#[async_trait]
impl Store for PgStore {
    async fn entries_for(&self, account_id: &AccountId) -> Result<Vec<LedgerEntry>> {
        let rows = sqlx::query_as::<_, EntryRow>(&format!(
            "SELECT {} FROM ledger_entries WHERE account_id = $1 ORDER BY created_at, id",
            ENTRY_COLUMNS
        ))
        .bind(account_id.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(db_error)?;
        convert_all(rows)
    }

    async fn entries_for_reference(&self, reference_id: &str) -> Result<Vec<LedgerEntry>> {
        let rows = sqlx::query_as::<_, EntryRow>(&format!(
            "SELECT {} FROM ledger_entries WHERE reference_id = $1 ORDER BY created_at, id",
            ENTRY_COLUMNS
        ))
        .bind(reference_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_error)?;
        convert_all(rows)
    }

    async fn sum_for(&self, account_id: &AccountId, filter: &EntryFilter) -> Result<Coins> {
        let mut conn = self.pool.acquire().await.map_err(db_error)?;
        sum_entries(&mut conn, account_id, kind_names(filter), filter.since).await
    }

    async fn auction(&self, auction_id: Uuid) -> Result<Option<Auction>> {
        sqlx::query_as::<_, AuctionRow>("SELECT * FROM auctions WHERE id = $1")
            .bind(auction_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_error)?
            .map(Auction::try_from)
            .transpose()
    }

    async fn live_auction(&self) -> Result<Option<Auction>> {
        sqlx::query_as::<_, AuctionRow>(
            r#"
            SELECT * FROM auctions
            WHERE status = 'live'
            ORDER BY started_at DESC NULLS LAST
            LIMIT 1
            "#,
        )
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error)?
        .map(Auction::try_from)
        .transpose()
    }

    async fn lots_for_auction(&self, auction_id: Uuid) -> Result<Vec<Lot>> {
        let rows = sqlx::query_as::<_, LotRow>(
            "SELECT * FROM auction_lots WHERE auction_id = $1 ORDER BY created_at, id",
        )
        .bind(auction_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_error)?;
        convert_all(rows)
    }

    async fn lot(&self, lot_id: Uuid) -> Result<Option<Lot>> {
        sqlx::query_as::<_, LotRow>("SELECT * FROM auction_lots WHERE id = $1")
            .bind(lot_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_error)?
            .map(Lot::try_from)
            .transpose()
    }

    async fn bid(&self, bid_id: Uuid) -> Result<Option<Bid>> {
        sqlx::query_as::<_, BidRow>("SELECT * FROM bids WHERE id = $1")
            .bind(bid_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_error)?
            .map(Bid::try_from)
            .transpose()
    }

    async fn bids_for_lot(&self, lot_id: Uuid) -> Result<Vec<Bid>> {
        let rows = sqlx::query_as::<_, BidRow>(
            "SELECT * FROM bids WHERE lot_id = $1 ORDER BY created_at, amount",
        )
        .bind(lot_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_error)?;
        convert_all(rows)
    }

    async fn listing(&self, listing_id: Uuid) -> Result<Option<Listing>> {
        sqlx::query_as::<_, ListingRow>(&format!(
            "SELECT {} FROM marketplace_listings WHERE id = $1",
            LISTING_COLUMNS
        ))
        .bind(listing_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error)?
        .map(Listing::try_from)
        .transpose()
    }

    async fn active_listings(&self, kind: Option<ListingKind>) -> Result<Vec<Listing>> {
        let rows = sqlx::query_as::<_, ListingRow>(&format!(
            r#"
            SELECT {} FROM marketplace_listings
            WHERE status = 'active' AND ($1::TEXT IS NULL OR listing_type = $1)
            ORDER BY created_at DESC
            "#,
            LISTING_COLUMNS
        ))
        .bind(kind.map(|kind| kind.as_str()))
        .fetch_all(&self.pool)
        .await
        .map_err(db_error)?;
        convert_all(rows)
    }

    async fn listings_by_seller(&self, seller_id: &AccountId) -> Result<Vec<Listing>> {
        let rows = sqlx::query_as::<_, ListingRow>(&format!(
            "SELECT {} FROM marketplace_listings WHERE seller_id = $1 ORDER BY created_at DESC",
            LISTING_COLUMNS
        ))
        .bind(seller_id.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(db_error)?;
        convert_all(rows)
    }

    async fn transaction(&self, transaction_id: Uuid) -> Result<Option<MarketplaceTransaction>> {
        sqlx::query_as::<_, TransactionRow>("SELECT * FROM marketplace_transactions WHERE id = $1")
            .bind(transaction_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_error)?
            .map(MarketplaceTransaction::try_from)
            .transpose()
    }

    async fn redemption(&self, redemption_id: Uuid) -> Result<Option<RedemptionRequest>> {
        sqlx::query_as::<_, RedemptionRow>("SELECT * FROM redemption_requests WHERE id = $1")
            .bind(redemption_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_error)?
            .map(RedemptionRequest::try_from)
            .transpose()
    }

    async fn redemptions_for(&self, account_id: &AccountId) -> Result<Vec<RedemptionRequest>> {
        let rows = sqlx::query_as::<_, RedemptionRow>(
            "SELECT * FROM redemption_requests WHERE account_id = $1 ORDER BY requested_at DESC",
        )
        .bind(account_id.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(db_error)?;
        convert_all(rows)
    }

    async fn purchase_by_intent(&self, payment_intent_id: &str) -> Result<Option<CoinPurchase>> {
        sqlx::query_as::<_, PurchaseRow>(
            "SELECT * FROM coin_purchases WHERE payment_intent_id = $1",
        )
        .bind(payment_intent_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error)?
        .map(CoinPurchase::try_from)
        .transpose()
    }

    async fn minted_coins(&self) -> Result<Coins> {
        sqlx::query_scalar::<_, i64>(
            "SELECT COALESCE(SUM(coins_granted), 0)::BIGINT FROM coin_purchases WHERE status <> 'failed'",
        )
        .fetch_one(&self.pool)
        .await
        .map_err(db_error)
    }

    async fn apply(&self, batch: WriteBatch) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(db_error)?;

        lock_for(&mut *tx, &batch).await?;
        for guard in &batch.guards {
            check_guard(&mut *tx, guard, &batch).await?;
        }
        for write in &batch.writes {
            apply_write(&mut *tx, write).await?;
        }

        tx.commit().await.map_err(db_error)?;
        debug!(
            guards = batch.guards.len(),
            writes = batch.writes.len(),
            "Batch committed"
        );
        Ok(())
    }
}
