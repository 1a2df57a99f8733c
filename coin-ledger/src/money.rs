//! Fixed-point money arithmetic
//!
//! Coins are whole integers. Currency is carried as exact `Decimal` prices and
//! settled in integer cents. Every rounding step is half away from zero, which
//! is half-up for the non-negative amounts handled here.

use crate::{
    types::{Cents, Coins, FeeBreakdown},
    Error, Result,
};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};
use serde::Serialize;

/// Purchase price → coins granted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CoinTier {
    /// Price in whole dollars
    pub usd: u32,
    /// Coins granted
    pub coins: Coins,
}

impl CoinTier {
    /// Charged amount in cents
    pub fn amount_cents(&self) -> Cents {
        Cents::from(self.usd) * 100
    }

    /// Short label, e.g. `$100`
    pub fn label(&self) -> String {
        format!("${}", self.usd)
    }
}

/// Fixed tier table
pub const COIN_TIERS: [CoinTier; 6] = [
    CoinTier { usd: 25, coins: 1 },
    CoinTier { usd: 50, coins: 2 },
    CoinTier { usd: 100, coins: 4 },
    CoinTier { usd: 250, coins: 10 },
    CoinTier { usd: 500, coins: 20 },
    CoinTier { usd: 1000, coins: 40 },
];

/// Look up the tier for a purchase price
pub fn tier_for_usd(usd: u32) -> Result<CoinTier> {
    COIN_TIERS
        .iter()
        .copied()
        .find(|tier| tier.usd == usd)
        .ok_or(Error::UnknownTier(usd))
}

/// Coins granted for a purchase price
pub fn coins_for_tier(usd: u32) -> Result<Coins> {
    tier_for_usd(usd).map(|tier| tier.coins)
}

/// Round half-up to `dp` decimal places
pub fn round_half_up(value: Decimal, dp: u32) -> Decimal {
    value.round_dp_with_strategy(dp, RoundingStrategy::MidpointAwayFromZero)
}

/// Convert a USD amount to cents, rounding to the nearest cent
pub fn usd_to_cents(amount: Decimal) -> Result<Cents> {
    let cents = round_half_up(amount, 2)
        .checked_mul(Decimal::ONE_HUNDRED)
        .ok_or_else(|| Error::Validation(format!("amount {} out of range", amount)))?;

    cents
        .to_i64()
        .ok_or_else(|| Error::Validation(format!("amount {} out of range", amount)))
}

/// Platform fee rate, in basis points
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeeSchedule {
    rate_bps: u32,
}

impl FeeSchedule {
    /// 500 bps = 5%
    pub fn from_bps(rate_bps: u32) -> Self {
        Self { rate_bps }
    }

    /// Rate as a fraction
    pub fn rate(&self) -> Decimal {
        Decimal::new(i64::from(self.rate_bps), 4)
    }

    /// Fee on a coin price, rounded to the nearest whole coin
    pub fn coin_fee(&self, price: Coins) -> Result<Coins> {
        let fee = Decimal::from(price)
            .checked_mul(self.rate())
            .ok_or_else(|| Error::Validation(format!("price {} out of range", price)))?;

        round_half_up(fee, 0)
            .to_i64()
            .ok_or_else(|| Error::Validation(format!("price {} out of range", price)))
    }

    /// Split a coin-priced sale into fee and seller proceeds
    pub fn split_coins(&self, price: Coins) -> Result<FeeBreakdown> {
        let fee = self.coin_fee(price)?;
        Ok(FeeBreakdown::Coins {
            price_coins: price,
            platform_fee_coins: fee,
            seller_receives_coins: price - fee,
        })
    }

    /// Split a USD-priced sale into fee and seller proceeds, in cents.
    /// The fee is rounded once; the seller gets the exact remainder.
    pub fn split_usd(&self, total_usd: Decimal) -> Result<FeeBreakdown> {
        let total_cents = usd_to_cents(total_usd)?;
        let fee_usd = total_usd
            .checked_mul(self.rate())
            .ok_or_else(|| Error::Validation(format!("amount {} out of range", total_usd)))?;
        let platform_fee_cents = usd_to_cents(fee_usd)?;

        Ok(FeeBreakdown::Usd {
            total_cents,
            platform_fee_cents,
            seller_receives_cents: total_cents - platform_fee_cents,
        })
    }
}

/// Gross USD price of a coin listing
pub fn coin_listing_total_usd(coins: Coins, price_per_coin_usd: Decimal) -> Result<Decimal> {
    Decimal::from(coins)
        .checked_mul(price_per_coin_usd)
        .ok_or_else(|| Error::Validation("listing total out of range".to_string()))
}

/// Cash payout for redeemed coins at a fixed per-coin rate
pub fn redemption_payout_cents(coins: Coins, rate_cents: Cents) -> Result<Cents> {
    coins
        .checked_mul(rate_cents)
        .ok_or_else(|| Error::Validation(format!("redemption of {} coins out of range", coins)))
}
