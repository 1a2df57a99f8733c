//! Stripe client
//!
//! Creates payment intents for coin checkouts and re-reads intents named by
//! webhook events, so an event is only acted on once the processor itself
//! reports the matching intent state.

use crate::config::PaymentsConfig;
use async_trait::async_trait;
use coin_ledger::{Error as LedgerError, IntentRequest, PaymentGateway, PaymentIntent};
use reqwest::Client;
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;
use tracing::{error, info};

/// Intent state as reported by the processor
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RetrievedIntent {
    pub id: String,
    pub status: String,
    #[serde(default)]
    pub amount: i64,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl RetrievedIntent {
    pub fn is_succeeded(&self) -> bool {
        self.status == "succeeded"
    }

    pub fn is_failed(&self) -> bool {
        matches!(self.status.as_str(), "requires_payment_method" | "canceled")
    }
}

/// Looks up the current state of an intent
#[async_trait]
pub trait IntentLookup: Send + Sync {
    async fn retrieve_intent(&self, payment_intent_id: &str) -> coin_ledger::Result<RetrievedIntent>;
}

/// Payment event relevant to coin purchases
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PaymentEvent {
    Succeeded(String),
    Failed(String),
}

impl PaymentEvent {
    pub fn intent_id(&self) -> &str {
        match self {
            PaymentEvent::Succeeded(id) | PaymentEvent::Failed(id) => id,
        }
    }

    /// Whether the retrieved intent backs this event
    pub fn confirmed_by(&self, intent: &RetrievedIntent) -> bool {
        intent.id == self.intent_id()
            && match self {
                PaymentEvent::Succeeded(_) => intent.is_succeeded(),
                PaymentEvent::Failed(_) => intent.is_failed(),
            }
    }
}

#[derive(Debug, Deserialize)]
struct WebhookEnvelope {
    #[serde(rename = "type")]
    event_type: String,
    data: WebhookData,
}

#[derive(Debug, Deserialize)]
struct WebhookData {
    object: WebhookObject,
}

#[derive(Debug, Deserialize)]
struct WebhookObject {
    id: String,
}

/// Parse a webhook body. Unrelated event types yield `None`.
pub fn parse_event(body: &[u8]) -> Result<Option<PaymentEvent>, serde_json::Error> {
    let envelope: WebhookEnvelope = serde_json::from_slice(body)?;
    let id = envelope.data.object.id;

    Ok(match envelope.event_type.as_str() {
        "payment_intent.succeeded" => Some(PaymentEvent::Succeeded(id)),
        "payment_intent.payment_failed" => Some(PaymentEvent::Failed(id)),
        _ => None,
    })
}

#[derive(Debug, Deserialize)]
struct CreatedIntent {
    id: String,
    client_secret: Option<String>,
}

pub struct StripeClient {
    base_url: String,
    secret_key: String,
    currency: String,
    client: Client,
}

impl StripeClient {
    pub fn new(config: &PaymentsConfig) -> anyhow::Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(StripeClient {
            base_url: config.api_base.trim_end_matches('/').to_string(),
            secret_key: config.stripe_secret_key.clone(),
            currency: config.currency.clone(),
            client,
        })
    }

    fn gateway_error(context: &str, err: impl std::fmt::Display) -> LedgerError {
        error!("Stripe {} failed: {}", context, err);
        LedgerError::Gateway(format!("{} failed: {}", context, err))
    }

    async fn read_json<T: for<'de> Deserialize<'de>>(
        context: &str,
        response: reqwest::Response,
    ) -> coin_ledger::Result<T> {
        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            return Err(Self::gateway_error(
                context,
                format!("status {}: {}", status, error_text),
            ));
        }

        response
            .json::<T>()
            .await
            .map_err(|e| Self::gateway_error(context, format!("unreadable response: {}", e)))
    }
}

#[async_trait]
impl PaymentGateway for StripeClient {
    async fn create_intent(&self, request: &IntentRequest) -> coin_ledger::Result<PaymentIntent> {
        if self.secret_key.is_empty() {
            return Err(LedgerError::Gateway("payment processor is not configured".to_string()));
        }

        let currency = if request.currency.is_empty() {
            self.currency.clone()
        } else {
            request.currency.clone()
        };
        let form = [
            ("amount", request.amount_cents.to_string()),
            ("currency", currency),
            ("description", request.description.clone()),
            ("metadata[user_id]", request.account_id.to_string()),
            ("metadata[coins]", request.coins.to_string()),
            ("metadata[tier_usd]", request.tier_usd.to_string()),
            ("automatic_payment_methods[enabled]", "true".to_string()),
        ];

        let url = format!("{}/v1/payment_intents", self.base_url);
        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.secret_key)
            .form(&form)
            .send()
            .await
            .map_err(|e| Self::gateway_error("create intent", e))?;

        let created: CreatedIntent = Self::read_json("create intent", response).await?;
        let client_secret = created.client_secret.ok_or_else(|| {
            Self::gateway_error("create intent", "response carried no client secret")
        })?;

        info!(
            payment_intent_id = %created.id,
            account_id = %request.account_id,
            amount_cents = request.amount_cents,
            "Payment intent created"
        );

        Ok(PaymentIntent {
            id: created.id,
            client_secret,
        })
    }
}

#[async_trait]
impl IntentLookup for StripeClient {
    async fn retrieve_intent(&self, payment_intent_id: &str) -> coin_ledger::Result<RetrievedIntent> {
        if self.secret_key.is_empty() {
            return Err(LedgerError::Gateway("payment processor is not configured".to_string()));
        }

        let url = format!("{}/v1/payment_intents/{}", self.base_url, payment_intent_id);
        let response = self
            .client
            .get(&url)
            .bearer_auth(&self.secret_key)
            .send()
            .await
            .map_err(|e| Self::gateway_error("retrieve intent", e))?;

        Self::read_json("retrieve intent", response).await
    }
}
