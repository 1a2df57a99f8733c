//! Metrics collection for observability
//!
//! Prometheus metrics for monitoring the engines. Each `Metrics` owns its
//! registry, so several instances can coexist in one process.
//!
//! # Metrics
//!
//! - `ledger_entries_appended_total` - Ledger entries committed
//! - `bids_accepted_total` - Bids accepted as winning
//! - `bids_rejected_total` - Bids rejected by a business rule
//! - `marketplace_purchases_total` - Completed marketplace purchases
//! - `redemptions_requested_total` - Redemption requests created
//! - `commit_conflicts_total` - Optimistic commits that hit a conflict
//! - `commit_duration_seconds` - Histogram of store commit latencies

use prometheus::{Encoder, Histogram, HistogramOpts, IntCounter, Registry, TextEncoder};
use std::sync::Arc;

/// Metrics collector
#[derive(Clone, Debug)]
pub struct Metrics {
    /// Ledger entries committed
    pub entries_appended: IntCounter,

    /// Bids accepted
    pub bids_accepted: IntCounter,

    /// Bids rejected
    pub bids_rejected: IntCounter,

    /// Marketplace purchases completed
    pub marketplace_purchases: IntCounter,

    /// Redemption requests created
    pub redemptions_requested: IntCounter,

    /// Commit conflicts observed
    pub commit_conflicts: IntCounter,

    /// Commit duration histogram
    pub commit_duration: Histogram,

    registry: Arc<Registry>,
}

impl Metrics {
    /// Create new metrics collector
    pub fn new() -> prometheus::Result<Self> {
        let registry = Arc::new(Registry::new());

        let counter = |name: &str, help: &str| -> prometheus::Result<IntCounter> {
            let counter = IntCounter::new(name, help)?;
            registry.register(Box::new(counter.clone()))?;
            Ok(counter)
        };

        let entries_appended = counter("ledger_entries_appended_total", "Ledger entries committed")?;
        let bids_accepted = counter("bids_accepted_total", "Bids accepted as winning")?;
        let bids_rejected = counter("bids_rejected_total", "Bids rejected by a business rule")?;
        let marketplace_purchases =
            counter("marketplace_purchases_total", "Completed marketplace purchases")?;
        let redemptions_requested =
            counter("redemptions_requested_total", "Redemption requests created")?;
        let commit_conflicts =
            counter("commit_conflicts_total", "Optimistic commits that hit a conflict")?;

        let commit_duration = Histogram::with_opts(
            HistogramOpts::new("commit_duration_seconds", "Histogram of store commit latencies")
                .buckets(vec![0.0005, 0.001, 0.005, 0.010, 0.025, 0.050, 0.100, 0.250, 1.0]),
        )?;
        registry.register(Box::new(commit_duration.clone()))?;

        Ok(Self {
            entries_appended,
            bids_accepted,
            bids_rejected,
            marketplace_purchases,
            redemptions_requested,
            commit_conflicts,
            commit_duration,
            registry,
        })
    }

    /// Record committed ledger entries
    pub fn record_entries(&self, count: usize) {
        self.entries_appended.inc_by(count as u64);
    }

    /// Record a conflict
    pub fn record_conflict(&self) {
        self.commit_conflicts.inc();
    }

    /// Record commit duration
    pub fn record_commit_duration(&self, duration_seconds: f64) {
        self.commit_duration.observe(duration_seconds);
    }

    /// Get metrics registry
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Render every metric in the Prometheus text format
    pub fn render(&self) -> String {
        let mut buffer = Vec::new();
        if let Err(e) = TextEncoder::new().encode(&self.registry.gather(), &mut buffer) {
            tracing::error!(error = %e, "Failed to encode metrics");
            return String::new();
        }
        String::from_utf8(buffer).unwrap_or_default()
    }
}
