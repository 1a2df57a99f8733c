use crate::errors::{ApiError, Result};
use crate::models::{
    BalanceResponse, BuyRequest, CheckoutRequest, CheckoutResponse, CreateCoinListingRequest,
    CreateJadeListingRequest, HealthResponse, HistoryResponse, ListingsQuery, MeResponse,
    PlaceBidRequest, RedeemRequest, TierResponse, TiersResponse, WebhookResponse,
};
use crate::payments::{parse_event, IntentLookup, PaymentEvent};
use crate::security_middleware::{AdminAccount, AuthenticatedAccount};
use actix_web::{web, HttpResponse};
use coin_ledger::{BidRequest, Exchange, PurchaseRequest};
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;
use validator::Validate;

/// Shared state handed to every route
#[derive(Clone)]
pub struct AppState {
    pub exchange: Exchange,
    pub intents: Arc<dyn IntentLookup>,
}

impl AppState {
    pub fn new(exchange: Exchange, intents: Arc<dyn IntentLookup>) -> Self {
        Self { exchange, intents }
    }
}

/// Health check endpoint
pub async fn health_check() -> HttpResponse {
    HttpResponse::Ok().json(HealthResponse {
        status: "healthy".to_string(),
        service: "exchange-api".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        timestamp: chrono::Utc::now(),
    })
}

/// Prometheus metrics endpoint
pub async fn metrics_endpoint(state: web::Data<AppState>) -> HttpResponse {
    HttpResponse::Ok()
        .content_type("text/plain; version=0.0.4")
        .body(state.exchange.metrics().render())
}

// ==================== Auth ====================

pub async fn me(state: web::Data<AppState>, caller: AuthenticatedAccount) -> Result<HttpResponse> {
    let coin_balance = state.exchange.balances.balance(caller.account_id()).await?;
    let identity = caller.0;

    Ok(HttpResponse::Ok().json(MeResponse {
        account_id: identity.account_id.to_string(),
        email: identity.email,
        is_admin: identity.is_admin,
        coin_balance,
    }))
}

// ==================== Coins ====================

pub async fn list_tiers(state: web::Data<AppState>) -> Result<HttpResponse> {
    let payments = &state.exchange.payments;
    let remaining_supply = payments.remaining_supply().await?;

    Ok(HttpResponse::Ok().json(TiersResponse {
        tiers: payments.tiers().iter().map(TierResponse::from).collect(),
        remaining_supply,
    }))
}

pub async fn get_balance(
    state: web::Data<AppState>,
    caller: AuthenticatedAccount,
) -> Result<HttpResponse> {
    let balance = state.exchange.balances.balance(caller.account_id()).await?;

    Ok(HttpResponse::Ok().json(BalanceResponse {
        account_id: caller.account_id().to_string(),
        balance,
    }))
}

pub async fn get_history(
    state: web::Data<AppState>,
    caller: AuthenticatedAccount,
) -> Result<HttpResponse> {
    let entries = state.exchange.ledger.history(caller.account_id()).await?;

    Ok(HttpResponse::Ok().json(HistoryResponse {
        account_id: caller.account_id().to_string(),
        entries,
    }))
}

pub async fn checkout(
    state: web::Data<AppState>,
    caller: AuthenticatedAccount,
    request: web::Json<CheckoutRequest>,
) -> Result<HttpResponse> {
    request.validate()?;

    let checkout = state
        .exchange
        .payments
        .create_checkout(caller.account_id(), request.tier_usd)
        .await?;

    Ok(HttpResponse::Ok().json(CheckoutResponse {
        client_secret: checkout.client_secret,
        payment_intent_id: checkout.purchase.payment_intent_id,
        coins: checkout.purchase.coins_granted,
    }))
}

/// Payment processor webhook.
///
/// The event body is only a hint: the named intent is re-read from the
/// processor and the ledger is touched only when its state agrees.
pub async fn payment_webhook(state: web::Data<AppState>, body: web::Bytes) -> Result<HttpResponse> {
    let event = match parse_event(&body)? {
        Some(event) => event,
        None => {
            return Ok(HttpResponse::Ok().json(WebhookResponse {
                received: true,
                applied: false,
            }))
        }
    };

    let intent = state.intents.retrieve_intent(event.intent_id()).await?;
    if !event.confirmed_by(&intent) {
        warn!(
            payment_intent_id = event.intent_id(),
            status = %intent.status,
            "Webhook event not confirmed by processor"
        );
        return Ok(HttpResponse::Ok().json(WebhookResponse {
            received: true,
            applied: false,
        }));
    }

    let payments = &state.exchange.payments;
    match &event {
        PaymentEvent::Succeeded(id) => {
            let outcome = payments.on_payment_succeeded(id).await?;
            info!(payment_intent_id = %id, coins = outcome.purchase().coins_granted, "Payment succeeded");
        }
        PaymentEvent::Failed(id) => {
            payments.on_payment_failed(id).await?;
            info!(payment_intent_id = %id, "Payment failed");
        }
    }

    Ok(HttpResponse::Ok().json(WebhookResponse {
        received: true,
        applied: true,
    }))
}

// ==================== Auction ====================

pub async fn live_auction(state: web::Data<AppState>) -> Result<HttpResponse> {
    match state.exchange.bids.live_auction().await? {
        Some(view) => Ok(HttpResponse::Ok().json(view)),
        None => Err(ApiError::NotFound("No live auction".to_string())),
    }
}

pub async fn get_auction(
    state: web::Data<AppState>,
    auction_id: web::Path<Uuid>,
) -> Result<HttpResponse> {
    let view = state.exchange.bids.auction(*auction_id).await?;
    Ok(HttpResponse::Ok().json(view))
}

pub async fn place_bid(
    state: web::Data<AppState>,
    caller: AuthenticatedAccount,
    auction_id: web::Path<Uuid>,
    request: web::Json<PlaceBidRequest>,
) -> Result<HttpResponse> {
    request.validate()?;
    let request = request.into_inner();

    let receipt = state
        .exchange
        .bids
        .place_bid(BidRequest {
            auction_id: *auction_id,
            lot_id: request.lot_id,
            account_id: caller.account_id().clone(),
            amount: request.amount_coins,
            request_id: request.request_id,
        })
        .await?;

    Ok(HttpResponse::Ok().json(receipt))
}

// ==================== Marketplace ====================

pub async fn list_listings(
    state: web::Data<AppState>,
    query: web::Query<ListingsQuery>,
) -> Result<HttpResponse> {
    let listings = state.exchange.marketplace.active_listings(query.kind()).await?;
    Ok(HttpResponse::Ok().json(listings))
}

pub async fn my_listings(
    state: web::Data<AppState>,
    caller: AuthenticatedAccount,
) -> Result<HttpResponse> {
    let listings = state
        .exchange
        .marketplace
        .listings_by_seller(caller.account_id())
        .await?;
    Ok(HttpResponse::Ok().json(listings))
}

pub async fn create_coin_listing(
    state: web::Data<AppState>,
    caller: AuthenticatedAccount,
    request: web::Json<CreateCoinListingRequest>,
) -> Result<HttpResponse> {
    request.validate()?;

    let listing = state
        .exchange
        .marketplace
        .create_coin_listing(caller.account_id(), request.into_inner().into())
        .await?;
    Ok(HttpResponse::Created().json(listing))
}

pub async fn create_jade_listing(
    state: web::Data<AppState>,
    caller: AuthenticatedAccount,
    request: web::Json<CreateJadeListingRequest>,
) -> Result<HttpResponse> {
    request.validate()?;

    let listing = state
        .exchange
        .marketplace
        .create_jade_listing(caller.account_id(), request.into_inner().into())
        .await?;
    Ok(HttpResponse::Created().json(listing))
}

pub async fn cancel_listing(
    state: web::Data<AppState>,
    caller: AuthenticatedAccount,
    listing_id: web::Path<Uuid>,
) -> Result<HttpResponse> {
    let listing = state
        .exchange
        .marketplace
        .cancel_listing(*listing_id, caller.account_id())
        .await?;
    Ok(HttpResponse::Ok().json(listing))
}

/// Buy a listing; the body is optional and only carries an idempotency key
pub async fn buy_listing(
    state: web::Data<AppState>,
    caller: AuthenticatedAccount,
    listing_id: web::Path<Uuid>,
    request: Option<web::Json<BuyRequest>>,
) -> Result<HttpResponse> {
    let request = request.map(web::Json::into_inner).unwrap_or_default();

    let receipt = state
        .exchange
        .marketplace
        .purchase(PurchaseRequest {
            listing_id: *listing_id,
            buyer_id: caller.account_id().clone(),
            request_id: request.request_id,
        })
        .await?;
    Ok(HttpResponse::Ok().json(receipt))
}

pub async fn redeem(
    state: web::Data<AppState>,
    caller: AuthenticatedAccount,
    request: web::Json<RedeemRequest>,
) -> Result<HttpResponse> {
    request.validate()?;

    let receipt = state
        .exchange
        .redemptions
        .request_redemption(caller.account_id(), request.coins, request.request_id)
        .await?;
    Ok(HttpResponse::Ok().json(receipt))
}

pub async fn my_redemptions(
    state: web::Data<AppState>,
    caller: AuthenticatedAccount,
) -> Result<HttpResponse> {
    let requests = state
        .exchange
        .redemptions
        .redemptions_for(caller.account_id())
        .await?;
    Ok(HttpResponse::Ok().json(requests))
}

// ==================== Admin ====================

pub async fn approve_redemption(
    state: web::Data<AppState>,
    admin: AdminAccount,
    redemption_id: web::Path<Uuid>,
) -> Result<HttpResponse> {
    let request = state
        .exchange
        .redemptions
        .approve_redemption(*redemption_id)
        .await?;

    info!(redemption_id = %request.id, admin = %admin.0.account_id, "Redemption approved");
    Ok(HttpResponse::Ok().json(request))
}

pub async fn reject_redemption(
    state: web::Data<AppState>,
    admin: AdminAccount,
    redemption_id: web::Path<Uuid>,
) -> Result<HttpResponse> {
    let request = state
        .exchange
        .redemptions
        .reject_redemption(*redemption_id)
        .await?;

    info!(redemption_id = %request.id, admin = %admin.0.account_id, "Redemption rejected");
    Ok(HttpResponse::Ok().json(request))
}

/// Configure routes
pub fn configure_routes(cfg: &mut web::ServiceConfig) {
    cfg.app_data(
        web::JsonConfig::default()
            .error_handler(|err, _req| ApiError::Validation(err.to_string()).into()),
    )
    .service(web::scope("/api/auth").route("/me", web::get().to(me)))
    .service(
        web::scope("/api/coins")
            .route("/tiers", web::get().to(list_tiers))
            .route("/balance", web::get().to(get_balance))
            .route("/checkout", web::post().to(checkout))
            .route("/webhook", web::post().to(payment_webhook))
            .route("/history", web::get().to(get_history)),
    )
    .service(
        web::scope("/api/auction")
            .route("/live", web::get().to(live_auction))
            .route("/{auction_id}", web::get().to(get_auction))
            .route("/{auction_id}/bid", web::post().to(place_bid)),
    )
    .service(
        web::scope("/api/marketplace")
            .route("/listings", web::get().to(list_listings))
            .route("/my-listings", web::get().to(my_listings))
            .route("/listings/coins", web::post().to(create_coin_listing))
            .route("/listings/jade", web::post().to(create_jade_listing))
            .route("/listings/{listing_id}", web::delete().to(cancel_listing))
            .route("/buy/{listing_id}", web::post().to(buy_listing))
            .route("/redeem", web::post().to(redeem))
            .route("/redemptions", web::get().to(my_redemptions)),
    )
    .service(
        web::scope("/api/admin")
            .route("/redemptions/{redemption_id}/approve", web::post().to(approve_redemption))
            .route("/redemptions/{redemption_id}/reject", web::post().to(reject_redemption)),
    )
    .route("/metrics", web::get().to(metrics_endpoint))
    .route("/health", web::get().to(health_check));
}
