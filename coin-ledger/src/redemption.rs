//! Redemption workflow
//!
//! Coins leave the ledger when the request is made, not when it is approved.
//! Redemption draws on the total balance, matured or not. Rejection appends an
//! offsetting `redemption` credit under the same reference.

use crate::{
    money::redemption_payout_cents,
    retry::RetryPolicy,
    storage::{Guard, Write, WriteBatch},
    types::{
        AccountId, Cents, Coins, EntryFilter, EntryKind, LedgerEntry, RedemptionRequest,
        RedemptionStatus,
    },
    Error, Ledger, Result,
};
use chrono::Utc;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

/// Outcome of a redemption request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RedemptionReceipt {
    /// Request record
    pub request: RedemptionRequest,
    /// True when the request id matched an existing request
    pub replayed: bool,
}

/// Redemption workflow
#[derive(Debug, Clone)]
pub struct RedemptionWorkflow {
    ledger: Ledger,
    rate_cents: Cents,
    retry: RetryPolicy,
}

impl RedemptionWorkflow {
    /// Create workflow paying `rate_cents` per coin
    pub fn new(ledger: Ledger, rate_cents: Cents, retry: RetryPolicy) -> Self {
        Self {
            ledger,
            rate_cents,
            retry,
        }
    }

    /// Request a cash payout, debiting the coins immediately
    pub async fn request_redemption(
        &self,
        account_id: &AccountId,
        coins: Coins,
        request_id: Option<Uuid>,
    ) -> Result<RedemptionReceipt> {
        let result = self
            .retry
            .run("request_redemption", self.ledger.metrics(), || {
                self.try_request(account_id, coins, request_id)
            })
            .await;

        if let Ok(receipt) = &result {
            if !receipt.replayed {
                self.ledger.metrics().redemptions_requested.inc();
                info!(
                    redemption_id = %receipt.request.id,
                    %account_id,
                    coins,
                    payout_cents = receipt.request.payout_cents,
                    "Redemption requested"
                );
            }
        }
        result
    }

    async fn try_request(
        &self,
        account_id: &AccountId,
        coins: Coins,
        request_id: Option<Uuid>,
    ) -> Result<RedemptionReceipt> {
        let store = self.ledger.store();

        if let Some(id) = request_id {
            if let Some(existing) = store.redemption(id).await? {
                if &existing.account_id != account_id || existing.coins_redeemed != coins {
                    return Err(Error::Validation(format!(
                        "request id {} was already used for a different redemption",
                        id
                    )));
                }
                debug!(redemption_id = %id, "Redemption replayed");
                return Ok(RedemptionReceipt {
                    request: existing,
                    replayed: true,
                });
            }
        }

        if coins <= 0 {
            return Err(Error::Validation(format!(
                "redemption amount must be positive, got {}",
                coins
            )));
        }

        let total = store.sum_for(account_id, &EntryFilter::all()).await?;
        if total < coins {
            return Err(Error::InsufficientFunds {
                required: coins,
                available: total,
            });
        }

        let now = Utc::now();
        let request = RedemptionRequest {
            id: request_id.unwrap_or_else(Uuid::now_v7),
            account_id: account_id.clone(),
            coins_redeemed: coins,
            payout_cents: redemption_payout_cents(coins, self.rate_cents)?,
            status: RedemptionStatus::Pending,
            requested_at: now,
            resolved_at: None,
        };

        let batch = WriteBatch::new()
            .guard(Guard::TotalAtLeast {
                account_id: account_id.clone(),
                amount: coins,
            })
            .write(Write::InsertRedemption(request.clone()))
            .entry(
                LedgerEntry::new(
                    account_id.clone(),
                    -coins,
                    EntryKind::Redemption,
                    request.id.to_string(),
                    format!(
                        "Redemption request - {} coins at ${}/coin",
                        coins,
                        Decimal::new(self.rate_cents, 2)
                    ),
                )
                .at(now),
            );
        self.ledger.commit(batch).await?;

        Ok(RedemptionReceipt {
            request,
            replayed: false,
        })
    }

    /// Approve a pending request. No ledger effect.
    pub async fn approve_redemption(&self, redemption_id: Uuid) -> Result<RedemptionRequest> {
        self.resolve(redemption_id, RedemptionStatus::Approved).await
    }

    /// Reject a pending request, restoring the debited coins
    pub async fn reject_redemption(&self, redemption_id: Uuid) -> Result<RedemptionRequest> {
        self.resolve(redemption_id, RedemptionStatus::Rejected).await
    }

    async fn resolve(&self, redemption_id: Uuid, status: RedemptionStatus) -> Result<RedemptionRequest> {
        self.retry
            .run("resolve_redemption", self.ledger.metrics(), || async move {
                let mut request = self
                    .ledger
                    .store()
                    .redemption(redemption_id)
                    .await?
                    .ok_or(Error::RedemptionNotFound(redemption_id))?;
                if request.status != RedemptionStatus::Pending {
                    return Err(Error::RedemptionNotPending(redemption_id));
                }

                let now = Utc::now();
                let mut batch = WriteBatch::new()
                    .guard(Guard::RedemptionPending { redemption_id })
                    .write(Write::SetRedemptionStatus {
                        redemption_id,
                        status,
                        at: now,
                    });
                if status == RedemptionStatus::Rejected {
                    batch = batch.entry(
                        LedgerEntry::new(
                            request.account_id.clone(),
                            request.coins_redeemed,
                            EntryKind::Redemption,
                            redemption_id.to_string(),
                            "Redemption rejected - coins restored",
                        )
                        .at(now),
                    );
                }
                self.ledger.commit(batch).await?;

                request.status = status;
                request.resolved_at = Some(now);
                info!(%redemption_id, %status, coins = request.coins_redeemed, "Redemption resolved");
                Ok(request)
            })
            .await
    }

    /// Requests of an account, newest first
    pub async fn redemptions_for(&self, account_id: &AccountId) -> Result<Vec<RedemptionRequest>> {
        self.ledger.store().redemptions_for(account_id).await
    }
}
