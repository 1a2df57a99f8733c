//! Ledger orchestration layer
//!
//! Wraps a [`Store`] with the commit path every engine uses: timing, entry
//! counting and logging around [`Store::apply`]. Also exposes the plain ledger
//! reads.
//!
//! # Example
//!
//! ```no_run
//! use coin_ledger::{storage::MemoryStore, metrics::Metrics, types::*, Ledger};
//! use std::sync::Arc;
//!
//! # async fn run() -> coin_ledger::Result<()> {
//! let ledger = Ledger::new(Arc::new(MemoryStore::new()), Metrics::new().unwrap());
//! let account = AccountId::new("user-1");
//!
//! ledger
//!     .append(vec![LedgerEntry::new(account.clone(), 4, EntryKind::Purchase, "pi_1", "")])
//!     .await?;
//! assert_eq!(ledger.sum_for(&account, &EntryFilter::all()).await?, 4);
//! # Ok(())
//! # }
//! ```

use crate::{
    metrics::Metrics,
    storage::{Store, WriteBatch},
    types::{AccountId, Coins, EntryFilter, LedgerEntry},
    Error, Result,
};
use std::sync::Arc;
use std::time::Instant;

/// Append-only coin ledger
#[derive(Clone)]
pub struct Ledger {
    store: Arc<dyn Store>,
    metrics: Metrics,
}

impl std::fmt::Debug for Ledger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ledger").finish_non_exhaustive()
    }
}

impl Ledger {
    /// Create over a store
    pub fn new(store: Arc<dyn Store>, metrics: Metrics) -> Self {
        Self { store, metrics }
    }

    /// Backing store
    pub fn store(&self) -> &dyn Store {
        self.store.as_ref()
    }

    /// Metrics collector
    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    /// Apply a batch atomically
    pub async fn commit(&self, batch: WriteBatch) -> Result<()> {
        let entries = batch.entries().count();
        let started = Instant::now();

        let result = self.store.apply(batch).await;
        self.metrics
            .record_commit_duration(started.elapsed().as_secs_f64());

        match &result {
            Ok(()) => self.metrics.record_entries(entries),
            Err(Error::StorageUnavailable(reason)) => {
                tracing::error!(%reason, "Store rejected commit");
            }
            Err(_) => {}
        }
        result
    }

    /// Append entries as one atomic unit
    pub async fn append(&self, entries: Vec<LedgerEntry>) -> Result<()> {
        if entries.is_empty() {
            return Err(Error::Validation("nothing to append".to_string()));
        }
        if let Some(entry) = entries.iter().find(|entry| entry.amount == 0) {
            return Err(Error::Validation(format!(
                "entry {} has a zero amount",
                entry.id
            )));
        }

        let batch = entries
            .into_iter()
            .fold(WriteBatch::new(), |batch, entry| batch.entry(entry));
        self.commit(batch).await
    }

    /// Signed sum of an account's entries matching `filter`
    pub async fn sum_for(&self, account_id: &AccountId, filter: &EntryFilter) -> Result<Coins> {
        self.store.sum_for(account_id, filter).await
    }

    /// Account history, oldest first
    pub async fn history(&self, account_id: &AccountId) -> Result<Vec<LedgerEntry>> {
        let mut entries = self.store.entries_for(account_id).await?;
        entries.sort_by_key(|entry| (entry.created_at, entry.id));
        Ok(entries)
    }

    /// Entries caused by one operation
    pub async fn entries_for_reference(&self, reference_id: &str) -> Result<Vec<LedgerEntry>> {
        self.store.entries_for_reference(reference_id).await
    }

    /// Net coin movement of one operation across all accounts
    pub async fn net_for_reference(&self, reference_id: &str) -> Result<Coins> {
        Ok(self
            .entries_for_reference(reference_id)
            .await?
            .iter()
            .map(|entry| entry.amount)
            .sum())
    }
}
