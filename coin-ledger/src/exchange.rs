//! Wiring of every engine over one store

use crate::{
    balance::BalanceCalculator,
    bidding::BidEngine,
    marketplace::MarketplaceProcessor,
    metrics::Metrics,
    payments::{PaymentGateway, PaymentWorkflow},
    redemption::RedemptionWorkflow,
    retry::RetryPolicy,
    storage::Store,
    Config, Ledger, Result,
};
use std::sync::Arc;

/// All engines sharing one ledger
#[derive(Debug, Clone)]
pub struct Exchange {
    /// Append-only ledger
    pub ledger: Ledger,
    /// Derived balances
    pub balances: BalanceCalculator,
    /// Auctions and bids
    pub bids: BidEngine,
    /// Listings and purchases
    pub marketplace: MarketplaceProcessor,
    /// Cash-out requests
    pub redemptions: RedemptionWorkflow,
    /// Coin purchases
    pub payments: PaymentWorkflow,
    config: Config,
}

impl Exchange {
    /// Build every engine from a validated configuration
    pub fn new(
        store: Arc<dyn Store>,
        gateway: Arc<dyn PaymentGateway>,
        config: Config,
        metrics: Metrics,
    ) -> Result<Self> {
        config.validate()?;

        let ledger = Ledger::new(store, metrics);
        let retry = RetryPolicy::new(config.retry.clone());
        let balances = BalanceCalculator::new(ledger.clone(), config.maturation());

        Ok(Self {
            bids: BidEngine::new(ledger.clone(), balances.clone(), retry.clone()),
            marketplace: MarketplaceProcessor::new(
                ledger.clone(),
                balances.clone(),
                config.fee_schedule(),
                retry.clone(),
            ),
            redemptions: RedemptionWorkflow::new(
                ledger.clone(),
                config.redemption_rate_cents,
                retry.clone(),
            ),
            payments: PaymentWorkflow::new(ledger.clone(), gateway, config.mint_cap_coins, retry),
            balances,
            ledger,
            config,
        })
    }

    /// Active configuration
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Metrics collector
    pub fn metrics(&self) -> &Metrics {
        self.ledger.metrics()
    }
}
