//! Auction bid engine
//!
//! Per-lot state machine: `open` → (bid accepted) → `open` with a higher price
//! and a new leader, then `sold` when the sale is finalized, or `withdrawn`.
//!
//! A bid is validated against freshly read state and committed with guards
//! asserting the auction is still live, the lot still carries the price and
//! leader it was validated against, and the bidder's spendable balance still
//! covers the amount. If another bid commits first the guard fails, the whole
//! sequence re-runs, and the late bid is rejected against the new price. This
//! makes acceptance linearizable per lot: accepted amounts strictly increase
//! and at most one bid is `winning`.

use crate::{
    balance::BalanceCalculator,
    retry::RetryPolicy,
    storage::{Guard, Write, WriteBatch},
    types::{
        AccountId, Auction, AuctionStatus, Bid, BidStatus, Coins, EntryKind, LedgerEntry, Lot,
        LotStatus,
    },
    Error, Ledger, Result,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

/// Bid placement request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BidRequest {
    /// Auction the lot belongs to
    pub auction_id: Uuid,
    /// Lot bid on
    pub lot_id: Uuid,
    /// Bidder
    pub account_id: AccountId,
    /// Amount in coins
    pub amount: Coins,
    /// Caller idempotency key, used as the bid id
    pub request_id: Option<Uuid>,
}

/// Outcome of an accepted bid
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BidReceipt {
    /// Bid ID
    pub bid_id: Uuid,
    /// Lot bid on
    pub lot_id: Uuid,
    /// Lot price after the bid
    pub new_price: Coins,
    /// Current status of the bid
    pub status: BidStatus,
    /// Previous leader whose hold was released
    pub released_bid_id: Option<Uuid>,
    /// True when the request id matched an existing bid
    pub replayed: bool,
}

/// Lot with its current leader
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LotView {
    /// Lot
    #[serde(flatten)]
    pub lot: Lot,
    /// Winning bid, if any
    pub winning_bid: Option<Bid>,
}

/// Auction with its lots
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuctionView {
    /// Auction
    #[serde(flatten)]
    pub auction: Auction,
    /// Lots in creation order
    pub lots: Vec<LotView>,
}

/// Bid engine plus auction administration
#[derive(Debug, Clone)]
pub struct BidEngine {
    ledger: Ledger,
    balances: BalanceCalculator,
    retry: RetryPolicy,
}

impl BidEngine {
    /// Create engine
    pub fn new(ledger: Ledger, balances: BalanceCalculator, retry: RetryPolicy) -> Self {
        Self {
            ledger,
            balances,
            retry,
        }
    }

    /// Place a bid on a lot
    pub async fn place_bid(&self, request: BidRequest) -> Result<BidReceipt> {
        let req = &request;
        let result = self
            .retry
            .run("place_bid", self.ledger.metrics(), || self.try_place_bid(req))
            .await;

        let metrics = self.ledger.metrics();
        match &result {
            Ok(receipt) if !receipt.replayed => {
                metrics.bids_accepted.inc();
                info!(
                    bid_id = %receipt.bid_id,
                    lot_id = %request.lot_id,
                    account_id = %request.account_id,
                    amount = request.amount,
                    released = ?receipt.released_bid_id,
                    "Bid accepted"
                );
            }
            Ok(receipt) => {
                debug!(bid_id = %receipt.bid_id, "Bid request replayed");
            }
            Err(e) if !e.is_transient() => {
                metrics.bids_rejected.inc();
                info!(
                    lot_id = %request.lot_id,
                    account_id = %request.account_id,
                    amount = request.amount,
                    reason = e.kind(),
                    "Bid rejected"
                );
            }
            Err(_) => {}
        }
        result
    }

    async fn try_place_bid(&self, request: &BidRequest) -> Result<BidReceipt> {
        let store = self.ledger.store();

        if let Some(id) = request.request_id {
            if let Some(existing) = store.bid(id).await? {
                return replay(existing, request);
            }
        }

        // 1. Amount
        if request.amount <= 0 {
            return Err(Error::Validation(format!(
                "bid amount must be positive, got {}",
                request.amount
            )));
        }

        // 2. Funds
        let now = Utc::now();
        let balance = self.balances.balance_at(&request.account_id, now).await?;
        if request.amount > balance.spendable {
            return Err(Error::InsufficientFunds {
                required: request.amount,
                available: balance.spendable,
            });
        }

        // 3. Auction
        let auction = store
            .auction(request.auction_id)
            .await?
            .ok_or(Error::AuctionNotFound(request.auction_id))?;
        if auction.status != AuctionStatus::Live {
            return Err(Error::AuctionNotLive(auction.id));
        }

        // 4. Lot
        let lot = store
            .lot(request.lot_id)
            .await?
            .filter(|lot| lot.auction_id == auction.id)
            .ok_or(Error::LotNotFound(request.lot_id))?;
        if lot.status != LotStatus::Open {
            return Err(Error::LotNotOpen(lot.id));
        }

        // 5. Price
        let current_price = lot.price_to_beat();
        if request.amount <= current_price {
            return Err(Error::BidTooLow {
                amount: request.amount,
                current_price,
            });
        }

        let previous = match lot.winning_bid_id {
            Some(bid_id) => Some(store.bid(bid_id).await?.ok_or_else(|| {
                Error::ConcurrencyConflict(format!("winning bid {} not visible yet", bid_id))
            })?),
            None => None,
        };

        // 6-9. Commit
        let bid = Bid {
            id: request.request_id.unwrap_or_else(Uuid::now_v7),
            lot_id: lot.id,
            account_id: request.account_id.clone(),
            amount: request.amount,
            status: BidStatus::Winning,
            created_at: now,
        };

        let mut batch = WriteBatch::new()
            .guard(Guard::AuctionLive {
                auction_id: auction.id,
            })
            .guard(Guard::LotUnchanged {
                lot_id: lot.id,
                current_price: lot.current_price,
                winning_bid_id: lot.winning_bid_id,
            })
            .guard(self.balances.spendable_guard(&request.account_id, request.amount, now))
            .write(Write::InsertBid(bid.clone()))
            .entry(
                LedgerEntry::new(
                    bid.account_id.clone(),
                    -bid.amount,
                    EntryKind::BidHold,
                    bid.id.to_string(),
                    format!("Hold for bid on lot {}", lot.id),
                )
                .at(now),
            );

        if let Some(previous) = &previous {
            batch = batch
                .entry(release_entry(previous, "outbid", now))
                .write(Write::MarkBidOutbid {
                    bid_id: previous.id,
                });
        }

        batch = batch.write(Write::AdvanceLot {
            lot_id: lot.id,
            price: bid.amount,
            winning_bid_id: bid.id,
        });

        self.ledger.commit(batch).await?;

        Ok(BidReceipt {
            bid_id: bid.id,
            lot_id: lot.id,
            new_price: bid.amount,
            status: BidStatus::Winning,
            released_bid_id: previous.map(|bid| bid.id),
            replayed: false,
        })
    }

    // ==================== Administration ====================

    /// Schedule a new auction
    pub async fn create_auction(&self, title: &str, starts_at: DateTime<Utc>) -> Result<Auction> {
        let title = title.trim();
        if title.is_empty() {
            return Err(Error::Validation("auction title is required".to_string()));
        }

        let auction = Auction {
            id: Uuid::now_v7(),
            title: title.to_string(),
            status: AuctionStatus::Scheduled,
            starts_at,
            started_at: None,
            created_at: Utc::now(),
        };
        self.ledger
            .commit(WriteBatch::new().write(Write::InsertAuction(auction.clone())))
            .await?;

        info!(auction_id = %auction.id, %starts_at, "Auction scheduled");
        Ok(auction)
    }

    /// Start accepting bids
    pub async fn open_auction(&self, auction_id: Uuid) -> Result<Auction> {
        let mut auction = self.require_auction(auction_id).await?;
        if auction.status != AuctionStatus::Scheduled {
            return Err(Error::Validation(format!(
                "auction {} is {}, only scheduled auctions can open",
                auction_id, auction.status
            )));
        }

        let now = Utc::now();
        self.ledger
            .commit(WriteBatch::new().write(Write::SetAuctionStatus {
                auction_id,
                status: AuctionStatus::Live,
                at: now,
            }))
            .await?;

        auction.status = AuctionStatus::Live;
        auction.started_at = Some(now);
        info!(%auction_id, "Auction live");
        Ok(auction)
    }

    /// Stop accepting bids
    pub async fn close_auction(&self, auction_id: Uuid) -> Result<Auction> {
        let mut auction = self.require_auction(auction_id).await?;
        if auction.status == AuctionStatus::Closed {
            return Err(Error::Validation(format!("auction {} is already closed", auction_id)));
        }

        self.ledger
            .commit(WriteBatch::new().write(Write::SetAuctionStatus {
                auction_id,
                status: AuctionStatus::Closed,
                at: Utc::now(),
            }))
            .await?;

        auction.status = AuctionStatus::Closed;
        info!(%auction_id, "Auction closed");
        Ok(auction)
    }

    /// Add an open lot to an auction
    pub async fn add_lot(&self, auction_id: Uuid, title: &str, starting_price: Coins) -> Result<Lot> {
        if starting_price <= 0 {
            return Err(Error::Validation(format!(
                "starting price must be positive, got {}",
                starting_price
            )));
        }
        let auction = self.require_auction(auction_id).await?;
        if auction.status == AuctionStatus::Closed {
            return Err(Error::Validation(format!("auction {} is closed", auction_id)));
        }

        let lot = Lot {
            id: Uuid::now_v7(),
            auction_id,
            title: title.trim().to_string(),
            status: LotStatus::Open,
            starting_price,
            current_price: None,
            winning_bid_id: None,
            created_at: Utc::now(),
        };
        self.ledger
            .commit(WriteBatch::new().write(Write::InsertLot(lot.clone())))
            .await?;

        debug!(%auction_id, lot_id = %lot.id, starting_price, "Lot added");
        Ok(lot)
    }

    /// Mark a lot sold to its current leader. The winning hold stays debited.
    pub async fn finalize_lot(&self, lot_id: Uuid) -> Result<Lot> {
        self.retry
            .run("finalize_lot", self.ledger.metrics(), || async move {
                let mut lot = self.require_open_lot(lot_id).await?;
                self.ledger
                    .commit(
                        WriteBatch::new()
                            .guard(lot_unchanged(&lot))
                            .write(Write::SetLotStatus {
                                lot_id,
                                status: LotStatus::Sold,
                            }),
                    )
                    .await?;

                lot.status = LotStatus::Sold;
                info!(%lot_id, price = ?lot.current_price, winner = ?lot.winning_bid_id, "Lot sold");
                Ok(lot)
            })
            .await
    }

    /// Pull a lot, releasing the leader's hold
    pub async fn withdraw_lot(&self, lot_id: Uuid) -> Result<Lot> {
        self.retry
            .run("withdraw_lot", self.ledger.metrics(), || async move {
                let mut lot = self.require_open_lot(lot_id).await?;
                let now = Utc::now();

                let mut batch = WriteBatch::new().guard(lot_unchanged(&lot));
                if let Some(bid_id) = lot.winning_bid_id {
                    let leader = self.ledger.store().bid(bid_id).await?.ok_or_else(|| {
                        Error::ConcurrencyConflict(format!("winning bid {} not visible yet", bid_id))
                    })?;
                    batch = batch
                        .entry(release_entry(&leader, "lot withdrawn", now))
                        .write(Write::MarkBidOutbid { bid_id });
                }
                batch = batch.write(Write::SetLotStatus {
                    lot_id,
                    status: LotStatus::Withdrawn,
                });

                self.ledger.commit(batch).await?;

                lot.status = LotStatus::Withdrawn;
                info!(%lot_id, "Lot withdrawn");
                Ok(lot)
            })
            .await
    }

    // ==================== Reads ====================

    /// Most recently started live auction with its lots
    pub async fn live_auction(&self) -> Result<Option<AuctionView>> {
        match self.ledger.store().live_auction().await? {
            Some(auction) => self.view(auction).await.map(Some),
            None => Ok(None),
        }
    }

    /// Auction with its lots
    pub async fn auction(&self, auction_id: Uuid) -> Result<AuctionView> {
        let auction = self.require_auction(auction_id).await?;
        self.view(auction).await
    }

    /// Bids on a lot, in placement order
    pub async fn bids_for_lot(&self, lot_id: Uuid) -> Result<Vec<Bid>> {
        self.ledger.store().bids_for_lot(lot_id).await
    }

    async fn view(&self, auction: Auction) -> Result<AuctionView> {
        let store = self.ledger.store();
        let mut lots = Vec::new();
        for lot in store.lots_for_auction(auction.id).await? {
            let winning_bid = match lot.winning_bid_id {
                Some(bid_id) => store.bid(bid_id).await?,
                None => None,
            };
            lots.push(LotView { lot, winning_bid });
        }
        Ok(AuctionView { auction, lots })
    }

    async fn require_auction(&self, auction_id: Uuid) -> Result<Auction> {
        self.ledger
            .store()
            .auction(auction_id)
            .await?
            .ok_or(Error::AuctionNotFound(auction_id))
    }

    async fn require_open_lot(&self, lot_id: Uuid) -> Result<Lot> {
        let lot = self
            .ledger
            .store()
            .lot(lot_id)
            .await?
            .ok_or(Error::LotNotFound(lot_id))?;
        if lot.status != LotStatus::Open {
            return Err(Error::LotNotOpen(lot_id));
        }
        Ok(lot)
    }
}

fn lot_unchanged(lot: &Lot) -> Guard {
    Guard::LotUnchanged {
        lot_id: lot.id,
        current_price: lot.current_price,
        winning_bid_id: lot.winning_bid_id,
    }
}

/// Credit returning a bid's hold, referenced to that bid
fn release_entry(bid: &Bid, reason: &str, at: DateTime<Utc>) -> LedgerEntry {
    LedgerEntry::new(
        bid.account_id.clone(),
        bid.amount,
        EntryKind::BidRelease,
        bid.id.to_string(),
        format!("Released hold - {} on lot {}", reason, bid.lot_id),
    )
    .at(at)
}

fn replay(existing: Bid, request: &BidRequest) -> Result<BidReceipt> {
    if existing.lot_id != request.lot_id
        || existing.account_id != request.account_id
        || existing.amount != request.amount
    {
        return Err(Error::Validation(format!(
            "request id {} was already used for a different bid",
            existing.id
        )));
    }

    Ok(BidReceipt {
        bid_id: existing.id,
        lot_id: existing.lot_id,
        new_price: existing.amount,
        status: existing.status,
        released_bid_id: None,
        replayed: true,
    })
}
