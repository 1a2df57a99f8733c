//! Bounded retry of optimistic commits
//!
//! Engines run read → validate → apply. When `apply` reports a
//! `ConcurrencyConflict`, the whole sequence is re-run against fresh state after
//! an exponentially growing, jittered delay. Any other error is returned as is.

use crate::{config::RetryConfig, metrics::Metrics, Error, Result};
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

/// Retry policy for conflicting commits
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    config: RetryConfig,
}

impl RetryPolicy {
    /// Create with explicit settings
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    /// Delay before the retry following `attempt` (0-based)
    pub(crate) fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let base = self.config.initial_delay_ms as f64 * self.config.backoff_multiplier.powi(exponent);
        let capped = base.min(self.config.max_delay_ms as f64);

        let jitter_range = capped * self.config.jitter_factor;
        let jitter = (rand::random::<f64>() - 0.5) * jitter_range * 2.0;

        Duration::from_millis((capped + jitter).max(0.0) as u64)
    }

    /// Run `operation` until it succeeds, fails with a non-retryable error, or
    /// the attempt budget is spent
    pub async fn run<F, Fut, T>(&self, operation_name: &str, metrics: &Metrics, operation: F) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let attempts = self.config.max_attempts.max(1);
        let mut last_error = None;

        for attempt in 0..attempts {
            if attempt > 0 {
                let delay = self.delay_for(attempt - 1);
                debug!(operation = operation_name, attempt, ?delay, "Retrying after conflict");
                tokio::time::sleep(delay).await;
            }

            match operation().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() => {
                    metrics.record_conflict();
                    warn!(
                        operation = operation_name,
                        attempt = attempt + 1,
                        max_attempts = attempts,
                        error = %e,
                        "Commit conflict"
                    );
                    last_error = Some(e);
                }
                Err(e) => return Err(e),
            }
        }

        Err(last_error.unwrap_or_else(|| {
            Error::ConcurrencyConflict(format!("{} exhausted its retries", operation_name))
        }))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(RetryConfig::default())
    }
}
