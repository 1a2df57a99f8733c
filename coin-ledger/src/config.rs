//! Configuration for the ledger engines

use crate::{money::FeeSchedule, types::{Cents, Coins}, Error, Result};
use serde::{Deserialize, Serialize};

/// Engine configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Hours a purchase stays out of the spendable balance
    pub maturation_hours: u32,

    /// Marketplace platform fee in basis points (500 = 5%)
    pub platform_fee_bps: u32,

    /// Cash paid per redeemed coin, in cents
    pub redemption_rate_cents: Cents,

    /// Upper bound on coins granted by purchases; `None` disables the cap
    pub mint_cap_coins: Option<Coins>,

    /// Conflict retry policy
    pub retry: RetryConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            maturation_hours: 24,
            platform_fee_bps: 500,
            redemption_rate_cents: 2000, // $20 per coin
            mint_cap_coins: Some(1000),
            retry: RetryConfig::default(),
        }
    }
}

/// Bounded retry of optimistic commits
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Attempts including the first one
    pub max_attempts: u32,

    /// Delay before the first retry (milliseconds)
    pub initial_delay_ms: u64,

    /// Delay ceiling (milliseconds)
    pub max_delay_ms: u64,

    /// Growth factor between retries
    pub backoff_multiplier: f64,

    /// Relative jitter applied to each delay
    pub jitter_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay_ms: 5,
            max_delay_ms: 200,
            backoff_multiplier: 2.0,
            jitter_factor: 0.1, // 10% jitter
        }
    }
}

impl Config {
    /// Load from file
    pub fn from_file(path: impl AsRef<std::path::Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)
            .map_err(|e| Error::Config(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from environment variables
    pub fn from_env() -> Result<Self> {
        let mut config = Config::default();

        if let Some(hours) = env_parse("COIN_LEDGER_MATURATION_HOURS")? {
            config.maturation_hours = hours;
        }

        if let Some(bps) = env_parse("COIN_LEDGER_PLATFORM_FEE_BPS")? {
            config.platform_fee_bps = bps;
        }

        if let Some(rate) = env_parse("COIN_LEDGER_REDEMPTION_RATE_CENTS")? {
            config.redemption_rate_cents = rate;
        }

        if let Ok(cap) = std::env::var("COIN_LEDGER_MINT_CAP") {
            config.mint_cap_coins = match cap.as_str() {
                "" | "none" | "off" => None,
                value => Some(value.parse().map_err(|e| {
                    Error::Config(format!("COIN_LEDGER_MINT_CAP: {}", e))
                })?),
            };
        }

        if let Some(attempts) = env_parse("COIN_LEDGER_RETRY_MAX_ATTEMPTS")? {
            config.retry.max_attempts = attempts;
        }

        config.validate()?;
        Ok(config)
    }

    /// Reject settings the engines cannot operate with
    pub fn validate(&self) -> Result<()> {
        if self.maturation_hours == 0 {
            return Err(Error::Config("maturation_hours must be positive".to_string()));
        }
        if self.platform_fee_bps >= 10_000 {
            return Err(Error::Config(format!(
                "platform_fee_bps {} must be below 10000",
                self.platform_fee_bps
            )));
        }
        if self.redemption_rate_cents <= 0 {
            return Err(Error::Config("redemption_rate_cents must be positive".to_string()));
        }
        if matches!(self.mint_cap_coins, Some(cap) if cap < 0) {
            return Err(Error::Config("mint_cap_coins must not be negative".to_string()));
        }
        if self.retry.max_attempts == 0 {
            return Err(Error::Config("retry.max_attempts must be at least 1".to_string()));
        }
        if !(0.0..=1.0).contains(&self.retry.jitter_factor) {
            return Err(Error::Config("retry.jitter_factor must be within [0, 1]".to_string()));
        }
        Ok(())
    }

    /// Maturation window as a duration
    pub fn maturation(&self) -> chrono::Duration {
        chrono::Duration::hours(i64::from(self.maturation_hours))
    }

    /// Marketplace fee schedule
    pub fn fee_schedule(&self) -> FeeSchedule {
        FeeSchedule::from_bps(self.platform_fee_bps)
    }
}

fn env_parse<T>(key: &str) -> Result<Option<T>>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(value) => value
            .parse()
            .map(Some)
            .map_err(|e| Error::Config(format!("{}: {}", key, e))),
        Err(_) => Ok(None),
    }
}
