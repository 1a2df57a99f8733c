//! Coin purchases through the external payment processor
//!
//! Checkout creates a payment intent and records a `pending` purchase keyed by
//! the intent id. The processor later reports success or failure. Success
//! marks the purchase `complete` and mints the coins with one `purchase` entry;
//! a replayed success finds the purchase already complete and does nothing.

use crate::{
    money::{tier_for_usd, CoinTier, COIN_TIERS},
    retry::RetryPolicy,
    storage::{Guard, Write, WriteBatch},
    types::{AccountId, Cents, CoinPurchase, Coins, EntryKind, LedgerEntry, PurchaseStatus},
    Error, Ledger, Result,
};
use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

/// Parameters of a payment intent
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IntentRequest {
    /// Charge in cents
    pub amount_cents: Cents,
    /// ISO currency code
    pub currency: String,
    /// Paying account
    pub account_id: AccountId,
    /// Coins to grant
    pub coins: Coins,
    /// Tier price in dollars
    pub tier_usd: u32,
    /// Statement description
    pub description: String,
}

/// Intent created by the processor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentIntent {
    /// Processor intent id
    pub id: String,
    /// Secret the client uses to confirm payment
    pub client_secret: String,
}

/// External payment processor
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    /// Create a payment intent
    async fn create_intent(&self, request: &IntentRequest) -> Result<PaymentIntent>;
}

/// Checkout handed back to the client
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkout {
    /// Secret for the client-side payment form
    pub client_secret: String,
    /// Recorded purchase
    pub purchase: CoinPurchase,
}

/// Result of a payment-success notification
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum PaymentOutcome {
    /// Coins minted by this notification
    Credited {
        /// Completed purchase
        purchase: CoinPurchase,
    },
    /// Purchase was already complete; nothing minted
    AlreadyProcessed {
        /// Completed purchase
        purchase: CoinPurchase,
    },
}

impl PaymentOutcome {
    /// Purchase the notification refers to
    pub fn purchase(&self) -> &CoinPurchase {
        match self {
            PaymentOutcome::Credited { purchase } | PaymentOutcome::AlreadyProcessed { purchase } => {
                purchase
            }
        }
    }
}

/// Checkout and payment notifications
#[derive(Clone)]
pub struct PaymentWorkflow {
    ledger: Ledger,
    gateway: Arc<dyn PaymentGateway>,
    mint_cap: Option<Coins>,
    retry: RetryPolicy,
}

impl std::fmt::Debug for PaymentWorkflow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PaymentWorkflow")
            .field("mint_cap", &self.mint_cap)
            .finish_non_exhaustive()
    }
}

impl PaymentWorkflow {
    /// Create workflow
    pub fn new(
        ledger: Ledger,
        gateway: Arc<dyn PaymentGateway>,
        mint_cap: Option<Coins>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            ledger,
            gateway,
            mint_cap,
            retry,
        }
    }

    /// Fixed tier table
    pub fn tiers(&self) -> &'static [CoinTier] {
        &COIN_TIERS
    }

    /// Coins still mintable under the cap
    pub async fn remaining_supply(&self) -> Result<Option<Coins>> {
        match self.mint_cap {
            Some(cap) => {
                let minted = self.ledger.store().minted_coins().await?;
                Ok(Some((cap - minted).max(0)))
            }
            None => Ok(None),
        }
    }

    async fn check_cap(&self, coins: Coins) -> Result<()> {
        if let Some(remaining) = self.remaining_supply().await? {
            if coins > remaining {
                return Err(Error::MintCapExceeded {
                    requested: coins,
                    remaining,
                });
            }
        }
        Ok(())
    }

    /// Start a coin purchase for a tier
    pub async fn create_checkout(&self, account_id: &AccountId, tier_usd: u32) -> Result<Checkout> {
        let tier = tier_for_usd(tier_usd)?;
        self.check_cap(tier.coins).await?;

        let intent = self
            .gateway
            .create_intent(&IntentRequest {
                amount_cents: tier.amount_cents(),
                currency: "usd".to_string(),
                account_id: account_id.clone(),
                coins: tier.coins,
                tier_usd,
                description: format!(
                    "Jade coin purchase - {} coin{}",
                    tier.coins,
                    if tier.coins > 1 { "s" } else { "" }
                ),
            })
            .await?;

        let purchase = CoinPurchase {
            id: Uuid::now_v7(),
            account_id: account_id.clone(),
            payment_intent_id: intent.id.clone(),
            amount_cents: tier.amount_cents(),
            coins_granted: tier.coins,
            tier: tier.label(),
            status: PurchaseStatus::Pending,
            created_at: Utc::now(),
        };

        let recorded = self
            .retry
            .run("create_checkout", self.ledger.metrics(), || {
                let purchase = purchase.clone();
                async move {
                    self.check_cap(purchase.coins_granted).await?;
                    let mut batch = WriteBatch::new();
                    if let Some(cap) = self.mint_cap {
                        batch = batch.guard(Guard::MintedAtMost { cap });
                    }
                    self.ledger
                        .commit(batch.write(Write::InsertPurchase(purchase)))
                        .await
                }
            })
            .await;

        if let Err(e) = recorded {
            warn!(payment_intent_id = %intent.id, error = %e, "Checkout abandoned after intent creation");
            return Err(e);
        }

        info!(
            payment_intent_id = %intent.id,
            %account_id,
            coins = tier.coins,
            tier = %tier.label(),
            "Checkout created"
        );
        Ok(Checkout {
            client_secret: intent.client_secret,
            purchase,
        })
    }

    /// Mint the coins of a paid intent. Replays are no-ops.
    pub async fn on_payment_succeeded(&self, payment_intent_id: &str) -> Result<PaymentOutcome> {
        self.retry
            .run("payment_succeeded", self.ledger.metrics(), || async move {
                let mut purchase = self.require_purchase(payment_intent_id).await?;
                if purchase.status == PurchaseStatus::Complete {
                    info!(payment_intent_id, "Payment already processed");
                    return Ok(PaymentOutcome::AlreadyProcessed { purchase });
                }

                // A failed purchase gave its coins back to the supply
                let mut batch = WriteBatch::new();
                if purchase.status == PurchaseStatus::Failed {
                    self.check_cap(purchase.coins_granted).await?;
                    if let Some(cap) = self.mint_cap {
                        batch = batch.guard(Guard::MintedAtMost { cap });
                    }
                }

                let batch = batch
                    .guard(Guard::PurchaseStatusIs {
                        payment_intent_id: payment_intent_id.to_string(),
                        statuses: vec![purchase.status],
                    })
                    .write(Write::SetPurchaseStatus {
                        payment_intent_id: payment_intent_id.to_string(),
                        status: PurchaseStatus::Complete,
                    })
                    .entry(LedgerEntry::new(
                        purchase.account_id.clone(),
                        purchase.coins_granted,
                        EntryKind::Purchase,
                        payment_intent_id,
                        format!("Purchased via payment processor - {}", payment_intent_id),
                    ));
                self.ledger.commit(batch).await?;

                purchase.status = PurchaseStatus::Complete;
                info!(
                    payment_intent_id,
                    account_id = %purchase.account_id,
                    coins = purchase.coins_granted,
                    "Coins credited"
                );
                Ok(PaymentOutcome::Credited { purchase })
            })
            .await
    }

    /// Record a failed payment. No ledger effect.
    pub async fn on_payment_failed(&self, payment_intent_id: &str) -> Result<CoinPurchase> {
        self.retry
            .run("payment_failed", self.ledger.metrics(), || async move {
                let mut purchase = self.require_purchase(payment_intent_id).await?;
                if purchase.status != PurchaseStatus::Pending {
                    return Ok(purchase);
                }

                self.ledger
                    .commit(
                        WriteBatch::new()
                            .guard(Guard::PurchaseStatusIs {
                                payment_intent_id: payment_intent_id.to_string(),
                                statuses: vec![PurchaseStatus::Pending],
                            })
                            .write(Write::SetPurchaseStatus {
                                payment_intent_id: payment_intent_id.to_string(),
                                status: PurchaseStatus::Failed,
                            }),
                    )
                    .await?;

                purchase.status = PurchaseStatus::Failed;
                warn!(payment_intent_id, "Payment failed");
                Ok(purchase)
            })
            .await
    }

    async fn require_purchase(&self, payment_intent_id: &str) -> Result<CoinPurchase> {
        self.ledger
            .store()
            .purchase_by_intent(payment_intent_id)
            .await?
            .ok_or_else(|| Error::PurchaseNotFound(payment_intent_id.to_string()))
    }
}
