//! Derived balances
//!
//! Balances are never stored. Every call sums the ledger afresh:
//!
//! - `total`: every entry of the account
//! - `maturing`: `purchase` entries with `created_at >= now - window`
//! - `spendable`: `total - maturing`, floored at zero
//!
//! Holds of active bids are debits, so they are already inside `total`.

use crate::{
    storage::Guard,
    types::{AccountId, Balance, Coins, EntryFilter, EntryKind},
    Ledger, Result,
};
use chrono::{DateTime, Duration, Utc};

/// Computes balances from the ledger
#[derive(Debug, Clone)]
pub struct BalanceCalculator {
    ledger: Ledger,
    maturation: Duration,
}

impl BalanceCalculator {
    /// Create with a maturation window
    pub fn new(ledger: Ledger, maturation: Duration) -> Self {
        Self { ledger, maturation }
    }

    /// Maturation window
    pub fn maturation(&self) -> Duration {
        self.maturation
    }

    /// Balance as of now
    pub async fn balance(&self, account_id: &AccountId) -> Result<Balance> {
        self.balance_at(account_id, Utc::now()).await
    }

    /// Balance as of `now`
    pub async fn balance_at(&self, account_id: &AccountId, now: DateTime<Utc>) -> Result<Balance> {
        let total = self.ledger.sum_for(account_id, &EntryFilter::all()).await?;
        let maturing = self
            .ledger
            .sum_for(account_id, &self.maturing_filter(now))
            .await?;

        Ok(Balance {
            total,
            maturing,
            spendable: (total - maturing).max(0),
        })
    }

    /// Guard re-checking the spendable balance at commit time
    pub fn spendable_guard(&self, account_id: &AccountId, amount: Coins, as_of: DateTime<Utc>) -> Guard {
        Guard::SpendableAtLeast {
            account_id: account_id.clone(),
            amount,
            as_of,
            maturation: self.maturation,
        }
    }

    fn maturing_filter(&self, now: DateTime<Utc>) -> EntryFilter {
        EntryFilter::all()
            .kind(EntryKind::Purchase)
            .since(now - self.maturation)
    }
}
