//! In-memory store
//!
//! All tables sit behind one `RwLock`. `apply` holds the write lock while it
//! checks guards, validates every write and then applies them, so a batch is
//! atomic and batches are linearizable. Used by tests and by single-process
//! deployments that do not need durability.

use super::{Guard, Store, Write, WriteBatch};
use crate::{
    types::{
        AccountId, Auction, AuctionStatus, Bid, BidStatus, CoinPurchase, Coins, EntryFilter,
        EntryKind, LedgerEntry, Listing, ListingKind, ListingStatus, Lot, LotStatus,
        MarketplaceTransaction, PurchaseStatus, RedemptionRequest, RedemptionStatus,
    },
    Error, Result,
};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use uuid::Uuid;

#[derive(Debug, Default)]
struct Tables {
    entries: Vec<LedgerEntry>,
    auctions: HashMap<Uuid, Auction>,
    lots: HashMap<Uuid, Lot>,
    bids: HashMap<Uuid, Bid>,
    listings: HashMap<Uuid, Listing>,
    transactions: HashMap<Uuid, MarketplaceTransaction>,
    redemptions: HashMap<Uuid, RedemptionRequest>,
    purchases: HashMap<String, CoinPurchase>,
}

impl Tables {
    fn sum(&self, account_id: &AccountId, filter: &EntryFilter) -> Coins {
        self.entries
            .iter()
            .filter(|entry| &entry.account_id == account_id && filter.matches(entry))
            .map(|entry| entry.amount)
            .sum()
    }

    fn minted(&self) -> Coins {
        self.purchases
            .values()
            .filter(|purchase| purchase.status != PurchaseStatus::Failed)
            .map(|purchase| purchase.coins_granted)
            .sum()
    }

    fn check_guard(&self, guard: &Guard, batch: &WriteBatch) -> Result<()> {
        match guard {
            Guard::LotUnchanged {
                lot_id,
                current_price,
                winning_bid_id,
            } => {
                let lot = self
                    .lots
                    .get(lot_id)
                    .ok_or_else(|| conflict(format!("lot {} vanished", lot_id)))?;
                if lot.status != LotStatus::Open
                    || lot.current_price != *current_price
                    || lot.winning_bid_id != *winning_bid_id
                {
                    return Err(conflict(format!("lot {} changed", lot_id)));
                }
            }
            Guard::AuctionLive { auction_id } => {
                let live = self
                    .auctions
                    .get(auction_id)
                    .map_or(false, |auction| auction.status == AuctionStatus::Live);
                if !live {
                    return Err(conflict(format!("auction {} no longer live", auction_id)));
                }
            }
            Guard::ListingActive { listing_id } => {
                let active = self
                    .listings
                    .get(listing_id)
                    .map_or(false, |listing| listing.status == ListingStatus::Active);
                if !active {
                    return Err(conflict(format!("listing {} no longer active", listing_id)));
                }
            }
            Guard::SpendableAtLeast {
                account_id,
                amount,
                as_of,
                maturation,
            } => {
                let total = self.sum(account_id, &EntryFilter::all());
                let maturing = self.sum(
                    account_id,
                    &EntryFilter::all()
                        .kind(EntryKind::Purchase)
                        .since(*as_of - *maturation),
                );
                let spendable = (total - maturing).max(0);
                if spendable < *amount {
                    return Err(conflict(format!(
                        "spendable balance of {} moved to {}",
                        account_id, spendable
                    )));
                }
            }
            Guard::TotalAtLeast { account_id, amount } => {
                let total = self.sum(account_id, &EntryFilter::all());
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
                let matches = self
                    .purchases
                    .get(payment_intent_id)
                    .map_or(false, |purchase| statuses.contains(&purchase.status));
                if !matches {
                    return Err(conflict(format!(
                        "purchase {} changed state",
                        payment_intent_id
                    )));
                }
            }
            Guard::RedemptionPending { redemption_id } => {
                let pending = self
                    .redemptions
                    .get(redemption_id)
                    .map_or(false, |request| request.status == RedemptionStatus::Pending);
                if !pending {
                    return Err(conflict(format!(
                        "redemption {} no longer pending",
                        redemption_id
                    )));
                }
            }
            Guard::MintedAtMost { cap } => {
                let incoming: Coins = batch
                    .writes
                    .iter()
                    .filter_map(|write| match write {
                        Write::InsertPurchase(purchase)
                            if purchase.status != PurchaseStatus::Failed =>
                        {
                            Some(purchase.coins_granted)
                        }
                        // A failed purchase completing late re-enters the supply
                        Write::SetPurchaseStatus {
                            payment_intent_id,
                            status,
                        } if *status != PurchaseStatus::Failed => self
                            .purchases
                            .get(payment_intent_id)
                            .filter(|purchase| purchase.status == PurchaseStatus::Failed)
                            .map(|purchase| purchase.coins_granted),
                        _ => None,
                    })
                    .sum();
                if self.minted() + incoming > *cap {
                    return Err(conflict("mint cap reached".to_string()));
                }
            }
        }
        Ok(())
    }

    /// Reject the batch before touching anything if a write could not land
    fn check_writes(&self, batch: &WriteBatch) -> Result<()> {
        let mut new_ids: HashSet<Uuid> = HashSet::new();
        let mut new_intents: HashSet<&str> = HashSet::new();
        let mut new_lots: HashSet<Uuid> = HashSet::new();
        let mut new_auctions: HashSet<Uuid> = HashSet::new();

        fn fresh(new_ids: &mut HashSet<Uuid>, id: Uuid, taken: bool) -> Result<()> {
            if taken || !new_ids.insert(id) {
                return Err(conflict(format!("id {} already exists", id)));
            }
            Ok(())
        }

        for write in &batch.writes {
            match write {
                Write::AppendEntry(entry) => {
                    let taken = self.entries.iter().any(|e| e.id == entry.id);
                    fresh(&mut new_ids, entry.id, taken)?
                }
                Write::InsertBid(bid) => {
                    fresh(&mut new_ids, bid.id, self.bids.contains_key(&bid.id))?
                }
                Write::InsertAuction(auction) => {
                    fresh(&mut new_ids, auction.id, self.auctions.contains_key(&auction.id))?;
                    new_auctions.insert(auction.id);
                }
                Write::InsertLot(lot) => {
                    fresh(&mut new_ids, lot.id, self.lots.contains_key(&lot.id))?;
                    if !self.auctions.contains_key(&lot.auction_id)
                        && !new_auctions.contains(&lot.auction_id)
                    {
                        return Err(Error::AuctionNotFound(lot.auction_id));
                    }
                    new_lots.insert(lot.id);
                }
                Write::InsertListing(listing) => {
                    fresh(&mut new_ids, listing.id, self.listings.contains_key(&listing.id))?
                }
                Write::InsertTransaction(tx) => {
                    fresh(&mut new_ids, tx.id, self.transactions.contains_key(&tx.id))?
                }
                Write::InsertRedemption(request) => {
                    fresh(&mut new_ids, request.id, self.redemptions.contains_key(&request.id))?
                }
                Write::InsertPurchase(purchase) => {
                    let intent = purchase.payment_intent_id.as_str();
                    if self.purchases.contains_key(intent) || !new_intents.insert(intent) {
                        return Err(conflict(format!("payment intent {} already recorded", intent)));
                    }
                }
                Write::MarkBidOutbid { bid_id } => {
                    if !self.bids.contains_key(bid_id) && !new_ids.contains(bid_id) {
                        return Err(conflict(format!("bid {} vanished", bid_id)));
                    }
                }
                Write::AdvanceLot { lot_id, .. } | Write::SetLotStatus { lot_id, .. } => {
                    if !self.lots.contains_key(lot_id) && !new_lots.contains(lot_id) {
                        return Err(Error::LotNotFound(*lot_id));
                    }
                }
                Write::SetAuctionStatus { auction_id, .. } => {
                    if !self.auctions.contains_key(auction_id) && !new_auctions.contains(auction_id)
                    {
                        return Err(Error::AuctionNotFound(*auction_id));
                    }
                }
                Write::SetListingStatus { listing_id, .. } => {
                    if !self.listings.contains_key(listing_id) {
                        return Err(Error::ListingNotFound(*listing_id));
                    }
                }
                Write::SetRedemptionStatus { redemption_id, .. } => {
                    if !self.redemptions.contains_key(redemption_id) {
                        return Err(Error::RedemptionNotFound(*redemption_id));
                    }
                }
                Write::SetPurchaseStatus {
                    payment_intent_id, ..
                } => {
                    if !self.purchases.contains_key(payment_intent_id) {
                        return Err(Error::PurchaseNotFound(payment_intent_id.clone()));
                    }
                }
            }
        }
        Ok(())
    }

    fn apply_write(&mut self, write: Write) {
        match write {
            Write::AppendEntry(entry) => self.entries.push(entry),
            Write::InsertBid(bid) => {
                self.bids.insert(bid.id, bid);
            }
            Write::MarkBidOutbid { bid_id } => {
                if let Some(bid) = self.bids.get_mut(&bid_id) {
                    bid.status = BidStatus::Outbid;
                }
            }
            Write::AdvanceLot {
                lot_id,
                price,
                winning_bid_id,
            } => {
                if let Some(lot) = self.lots.get_mut(&lot_id) {
                    lot.current_price = Some(price);
                    lot.winning_bid_id = Some(winning_bid_id);
                }
            }
            Write::SetLotStatus { lot_id, status } => {
                if let Some(lot) = self.lots.get_mut(&lot_id) {
                    lot.status = status;
                }
            }
            Write::InsertAuction(auction) => {
                self.auctions.insert(auction.id, auction);
            }
            Write::SetAuctionStatus {
                auction_id,
                status,
                at,
            } => {
                if let Some(auction) = self.auctions.get_mut(&auction_id) {
                    auction.status = status;
                    if status == AuctionStatus::Live {
                        auction.started_at = Some(at);
                    }
                }
            }
            Write::InsertLot(lot) => {
                self.lots.insert(lot.id, lot);
            }
            Write::InsertListing(listing) => {
                self.listings.insert(listing.id, listing);
            }
            Write::SetListingStatus {
                listing_id,
                status,
                at,
            } => {
                if let Some(listing) = self.listings.get_mut(&listing_id) {
                    listing.status = status;
                    if status == ListingStatus::Sold {
                        listing.sold_at = Some(at);
                    }
                }
            }
            Write::InsertTransaction(tx) => {
                self.transactions.insert(tx.id, tx);
            }
            Write::InsertRedemption(request) => {
                self.redemptions.insert(request.id, request);
            }
            Write::SetRedemptionStatus {
                redemption_id,
                status,
                at,
            } => {
                if let Some(request) = self.redemptions.get_mut(&redemption_id) {
                    request.status = status;
                    request.resolved_at = Some(at);
                }
            }
            Write::InsertPurchase(purchase) => {
                self.purchases
                    .insert(purchase.payment_intent_id.clone(), purchase);
            }
            Write::SetPurchaseStatus {
                payment_intent_id,
                status,
            } => {
                if let Some(purchase) = self.purchases.get_mut(&payment_intent_id) {
                    purchase.status = status;
                }
            }
        }
    }
}

fn conflict(message: String) -> Error {
    Error::ConcurrencyConflict(message)
}

/// Store backed by process memory
#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
}

impl MemoryStore {
    /// Empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of ledger entries
    pub fn entry_count(&self) -> usize {
        self.tables.read().entries.len()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn entries_for(&self, account_id: &AccountId) -> Result<Vec<LedgerEntry>> {
        let tables = self.tables.read();
        Ok(tables
            .entries
            .iter()
            .filter(|entry| &entry.account_id == account_id)
            .cloned()
            .collect())
    }

    async fn entries_for_reference(&self, reference_id: &str) -> Result<Vec<LedgerEntry>> {
        let tables = self.tables.read();
        Ok(tables
            .entries
            .iter()
            .filter(|entry| entry.reference_id == reference_id)
            .cloned()
            .collect())
    }

    async fn sum_for(&self, account_id: &AccountId, filter: &EntryFilter) -> Result<Coins> {
        Ok(self.tables.read().sum(account_id, filter))
    }

    async fn auction(&self, auction_id: Uuid) -> Result<Option<Auction>> {
        Ok(self.tables.read().auctions.get(&auction_id).cloned())
    }

    async fn live_auction(&self) -> Result<Option<Auction>> {
        let tables = self.tables.read();
        Ok(tables
            .auctions
            .values()
            .filter(|auction| auction.status == AuctionStatus::Live)
            .max_by_key(|auction| auction.started_at)
            .cloned())
    }

    async fn lots_for_auction(&self, auction_id: Uuid) -> Result<Vec<Lot>> {
        let tables = self.tables.read();
        let mut lots: Vec<Lot> = tables
            .lots
            .values()
            .filter(|lot| lot.auction_id == auction_id)
            .cloned()
            .collect();
        lots.sort_by_key(|lot| (lot.created_at, lot.id));
        Ok(lots)
    }

    async fn lot(&self, lot_id: Uuid) -> Result<Option<Lot>> {
        Ok(self.tables.read().lots.get(&lot_id).cloned())
    }

    async fn bid(&self, bid_id: Uuid) -> Result<Option<Bid>> {
        Ok(self.tables.read().bids.get(&bid_id).cloned())
    }

    async fn bids_for_lot(&self, lot_id: Uuid) -> Result<Vec<Bid>> {
        let tables = self.tables.read();
        let mut bids: Vec<Bid> = tables
            .bids
            .values()
            .filter(|bid| bid.lot_id == lot_id)
            .cloned()
            .collect();
        bids.sort_by_key(|bid| (bid.created_at, bid.amount));
        Ok(bids)
    }

    async fn listing(&self, listing_id: Uuid) -> Result<Option<Listing>> {
        Ok(self.tables.read().listings.get(&listing_id).cloned())
    }

    async fn active_listings(&self, kind: Option<ListingKind>) -> Result<Vec<Listing>> {
        let tables = self.tables.read();
        let mut listings: Vec<Listing> = tables
            .listings
            .values()
            .filter(|listing| listing.status == ListingStatus::Active)
            .filter(|listing| kind.map_or(true, |kind| listing.kind() == kind))
            .cloned()
            .collect();
        listings.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(listings)
    }

    async fn listings_by_seller(&self, seller_id: &AccountId) -> Result<Vec<Listing>> {
        let tables = self.tables.read();
        let mut listings: Vec<Listing> = tables
            .listings
            .values()
            .filter(|listing| &listing.seller_id == seller_id)
            .cloned()
            .collect();
        listings.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(listings)
    }

    async fn transaction(&self, transaction_id: Uuid) -> Result<Option<MarketplaceTransaction>> {
        Ok(self.tables.read().transactions.get(&transaction_id).cloned())
    }

    async fn redemption(&self, redemption_id: Uuid) -> Result<Option<RedemptionRequest>> {
        Ok(self.tables.read().redemptions.get(&redemption_id).cloned())
    }

    async fn redemptions_for(&self, account_id: &AccountId) -> Result<Vec<RedemptionRequest>> {
        let tables = self.tables.read();
        let mut requests: Vec<RedemptionRequest> = tables
            .redemptions
            .values()
            .filter(|request| &request.account_id == account_id)
            .cloned()
            .collect();
        requests.sort_by(|a, b| b.requested_at.cmp(&a.requested_at));
        Ok(requests)
    }

    async fn purchase_by_intent(&self, payment_intent_id: &str) -> Result<Option<CoinPurchase>> {
        Ok(self.tables.read().purchases.get(payment_intent_id).cloned())
    }

    async fn minted_coins(&self) -> Result<Coins> {
        Ok(self.tables.read().minted())
    }

    async fn apply(&self, batch: WriteBatch) -> Result<()> {
        let mut tables = self.tables.write();

        for guard in &batch.guards {
            tables.check_guard(guard, &batch)?;
        }
        tables.check_writes(&batch)?;

        let (guards, writes) = (batch.guards.len(), batch.writes.len());
        for write in batch.writes {
            tables.apply_write(write);
        }

        tracing::debug!(guards, writes, "Batch applied");
        Ok(())
    }
}
