//! HTTP routes over the in-memory store
//!
//! The payment processor is replaced by a fake that both creates intents and
//! reports their state back to the webhook route.

use actix_web::dev::Service;
use actix_web::{http::StatusCode, test, web, App};
use async_trait::async_trait;
use chrono::{Duration, Utc};
use coin_ledger::{
    AccountId, Coins, Config as EngineConfig, EntryKind, Exchange, IntentRequest, LedgerEntry,
    MemoryStore, Metrics, PaymentGateway, PaymentIntent,
};
use exchange_api::{
    handlers::{configure_routes, AppState},
    payments::{IntentLookup, RetrievedIntent},
    security_middleware::{Claims, JwtAuth},
};
use jsonwebtoken::{encode, EncodingKey, Header};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

const SECRET: &str = "test-secret";
const ADMIN_ROLE: &str = "service_role";

/// Processor stand-in: intents start as `requires_payment_method`
#[derive(Default)]
struct FakeProcessor {
    intents: Mutex<HashMap<String, String>>,
}

impl FakeProcessor {
    fn set_status(&self, id: &str, status: &str) {
        self.intents
            .lock()
            .unwrap()
            .insert(id.to_string(), status.to_string());
    }
}

#[async_trait]
impl PaymentGateway for FakeProcessor {
    async fn create_intent(&self, request: &IntentRequest) -> coin_ledger::Result<PaymentIntent> {
        let mut intents = self.intents.lock().unwrap();
        let id = format!("pi_fake_{}", intents.len());
        intents.insert(id.clone(), "requires_payment_method".to_string());

        assert!(request.amount_cents > 0);
        Ok(PaymentIntent {
            client_secret: format!("{}_secret", id),
            id,
        })
    }
}

#[async_trait]
impl IntentLookup for FakeProcessor {
    async fn retrieve_intent(&self, payment_intent_id: &str) -> coin_ledger::Result<RetrievedIntent> {
        let status = self
            .intents
            .lock()
            .unwrap()
            .get(payment_intent_id)
            .cloned()
            .ok_or_else(|| coin_ledger::Error::Gateway("no such intent".to_string()))?;

        Ok(RetrievedIntent {
            id: payment_intent_id.to_string(),
            status,
            amount: 0,
            metadata: HashMap::new(),
        })
    }
}

fn setup() -> (Exchange, Arc<FakeProcessor>, AppState) {
    let processor = Arc::new(FakeProcessor::default());
    let mut config = EngineConfig::default();
    config.retry.initial_delay_ms = 1;
    config.retry.max_delay_ms = 5;

    let exchange = Exchange::new(
        Arc::new(MemoryStore::new()),
        processor.clone(),
        config,
        Metrics::new().unwrap(),
    )
    .unwrap();
    let state = AppState::new(exchange.clone(), processor.clone());
    (exchange, processor, state)
}

macro_rules! app {
    ($state:expr) => {
        test::init_service(
            App::new()
                .wrap(JwtAuth::new(SECRET.to_string(), ADMIN_ROLE.to_string()))
                .app_data(web::Data::new($state))
                .configure(configure_routes),
        )
        .await
    };
}

fn token(sub: &str, role: &str) -> String {
    let claims = Claims {
        sub: sub.to_string(),
        email: None,
        role: role.to_string(),
        exp: (Utc::now().timestamp() + 3600) as usize,
    };
    encode(&Header::default(), &claims, &EncodingKey::from_secret(SECRET.as_bytes())).unwrap()
}

fn bearer(sub: &str) -> (&'static str, String) {
    ("Authorization", format!("Bearer {}", token(sub, "authenticated")))
}

fn admin_bearer() -> (&'static str, String) {
    ("Authorization", format!("Bearer {}", token("ops", ADMIN_ROLE)))
}

async fn fund(exchange: &Exchange, name: &str, coins: Coins) {
    exchange
        .ledger
        .append(vec![LedgerEntry::new(
            AccountId::new(name),
            coins,
            EntryKind::Purchase,
            format!("seed_{}", name),
            "seed",
        )
        .at(Utc::now() - Duration::hours(48))])
        .await
        .unwrap();
}

fn webhook_body(event_type: &str, intent_id: &str) -> Value {
    json!({
        "id": "evt_1",
        "type": event_type,
        "data": { "object": { "id": intent_id, "object": "payment_intent" } }
    })
}

#[actix_web::test]
async fn test_health_and_metrics_are_public() {
    let (_exchange, _processor, state) = setup();
    let app = app!(state);

    let resp = test::call_service(&app, test::TestRequest::get().uri("/health").to_request()).await;
    assert_eq!(resp.status(), StatusCode::OK);
    let body: Value = test::read_body_json(resp).await;
    assert_eq!(body["service"], "exchange-api");

    let resp = test::call_service(&app, test::TestRequest::get().uri("/metrics").to_request()).await;
    assert_eq!(resp.status(), StatusCode::OK);
}

#[actix_web::test]
async fn test_tiers_report_remaining_supply() {
    let (_exchange, _processor, state) = setup();
    let app = app!(state);

    let req = test::TestRequest::get().uri("/api/coins/tiers").to_request();
    let body: Value = test::call_and_read_body_json(&app, req).await;

    assert_eq!(body["tiers"].as_array().unwrap().len(), 6);
    assert_eq!(body["tiers"][0]["usd"], 25);
    assert_eq!(body["tiers"][0]["coins"], 1);
    assert_eq!(body["remaining_supply"], 1000);
}

#[actix_web::test]
async fn test_balance_requires_identity() {
    let (exchange, _processor, state) = setup();
    fund(&exchange, "alice", 12).await;
    let app = app!(state);

    let req = test::TestRequest::get().uri("/api/coins/balance").to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

    let req = test::TestRequest::get()
        .uri("/api/coins/balance")
        .insert_header(bearer("alice"))
        .to_request();
    let body: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(body["account_id"], "alice");
    assert_eq!(body["total"], 12);
    assert_eq!(body["spendable"], 12);
}

#[actix_web::test]
async fn test_me_reports_identity_and_balance() {
    let (exchange, _processor, state) = setup();
    fund(&exchange, "carol", 7).await;
    let app = app!(state);

    let req = test::TestRequest::get().uri("/api/auth/me").to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

    let req = test::TestRequest::get()
        .uri("/api/auth/me")
        .insert_header(bearer("carol"))
        .to_request();
    let body: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(body["account_id"], "carol");
    assert_eq!(body["is_admin"], false);
    assert_eq!(body["coin_balance"]["total"], 7);
    assert_eq!(body["coin_balance"]["spendable"], 7);
}

#[actix_web::test]
async fn test_invalid_token_is_rejected_by_middleware() {
    let (_exchange, _processor, state) = setup();
    let app = app!(state);

    let req = test::TestRequest::get()
        .uri("/api/coins/balance")
        .insert_header(("Authorization", "Bearer not-a-token"))
        .to_request();
    let err = match app.call(req).await {
        Err(err) => err,
        Ok(resp) => panic!("expected rejection, got {}", resp.status()),
    };
    assert_eq!(err.error_response().status(), StatusCode::UNAUTHORIZED);
}

#[actix_web::test]
async fn test_checkout_is_credited_only_after_confirmed_webhook() {
    let (exchange, processor, state) = setup();
    let app = app!(state);

    let req = test::TestRequest::post()
        .uri("/api/coins/checkout")
        .insert_header(bearer("alice"))
        .set_json(json!({ "tier_usd": 100 }))
        .to_request();
    let checkout: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(checkout["coins"], 4);
    let intent_id = checkout["payment_intent_id"].as_str().unwrap().to_string();

    // Processor has not settled the intent yet
    let req = test::TestRequest::post()
        .uri("/api/coins/webhook")
        .set_json(webhook_body("payment_intent.succeeded", &intent_id))
        .to_request();
    let body: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(body["applied"], false);
    let alice = AccountId::new("alice");
    assert_eq!(exchange.balances.balance(&alice).await.unwrap().total, 0);

    processor.set_status(&intent_id, "succeeded");
    for _ in 0..2 {
        let req = test::TestRequest::post()
            .uri("/api/coins/webhook")
            .set_json(webhook_body("payment_intent.succeeded", &intent_id))
            .to_request();
        let body: Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["applied"], true);
    }

    let balance = exchange.balances.balance(&alice).await.unwrap();
    assert_eq!(balance.total, 4);
    assert_eq!(balance.maturing, 4);
    assert_eq!(balance.spendable, 0);
}

#[actix_web::test]
async fn test_unrelated_webhook_event_is_acknowledged() {
    let (_exchange, _processor, state) = setup();
    let app = app!(state);

    let req = test::TestRequest::post()
        .uri("/api/coins/webhook")
        .set_json(webhook_body("charge.refunded", "ch_1"))
        .to_request();
    let body: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(body["received"], true);
    assert_eq!(body["applied"], false);
}

#[actix_web::test]
async fn test_unknown_tier_is_bad_request() {
    let (_exchange, _processor, state) = setup();
    let app = app!(state);

    let req = test::TestRequest::post()
        .uri("/api/coins/checkout")
        .insert_header(bearer("alice"))
        .set_json(json!({ "tier_usd": 30 }))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    let body: Value = test::read_body_json(resp).await;
    assert_eq!(body["error"]["type"], "unknown_tier");
}

#[actix_web::test]
async fn test_bid_flow_reports_price_on_rejection() {
    let (exchange, _processor, state) = setup();
    fund(&exchange, "alice", 50).await;
    fund(&exchange, "bob", 50).await;
    let auction = exchange
        .bids
        .create_auction("Spring jade evening", Utc::now())
        .await
        .unwrap();
    let lot = exchange
        .bids
        .add_lot(auction.id, "Icy jadeite bangle", 5)
        .await
        .unwrap();
    exchange.bids.open_auction(auction.id).await.unwrap();
    let app = app!(state);

    let uri = format!("/api/auction/{}/bid", auction.id);
    let req = test::TestRequest::post()
        .uri(&uri)
        .insert_header(bearer("alice"))
        .set_json(json!({ "lot_id": lot.id, "amount_coins": 10 }))
        .to_request();
    let receipt: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(receipt["new_price"], 10);
    assert_eq!(receipt["status"], "winning");

    let req = test::TestRequest::post()
        .uri(&uri)
        .insert_header(bearer("bob"))
        .set_json(json!({ "lot_id": lot.id, "amount_coins": 10 }))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    let body: Value = test::read_body_json(resp).await;
    assert_eq!(body["error"]["type"], "bid_too_low");
    assert_eq!(body["error"]["current_price"], 10);

    let req = test::TestRequest::get().uri("/api/auction/live").to_request();
    let live: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(live["lots"][0]["current_price"], 10);
    assert_eq!(live["lots"][0]["winning_bid"]["account_id"], "alice");
}

#[actix_web::test]
async fn test_no_live_auction_is_not_found() {
    let (_exchange, _processor, state) = setup();
    let app = app!(state);

    let req = test::TestRequest::get().uri("/api/auction/live").to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
}

#[actix_web::test]
async fn test_jade_listing_bought_with_coins() {
    let (exchange, _processor, state) = setup();
    fund(&exchange, "seller", 5).await;
    fund(&exchange, "buyer", 100).await;
    let app = app!(state);

    let req = test::TestRequest::post()
        .uri("/api/marketplace/listings/jade")
        .insert_header(bearer("seller"))
        .set_json(json!({
            "jade_title": "Burmese jadeite ring",
            "jade_price_coins": 100,
            "sale_type": "fixed",
            "expires_in_days": 7
        }))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::CREATED);
    let listing: Value = test::read_body_json(resp).await;
    let listing_id = listing["id"].as_str().unwrap().to_string();

    let req = test::TestRequest::get()
        .uri("/api/marketplace/listings?type=jade")
        .to_request();
    let listings: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(listings.as_array().unwrap().len(), 1);

    let req = test::TestRequest::post()
        .uri(&format!("/api/marketplace/buy/{}", listing_id))
        .insert_header(bearer("buyer"))
        .to_request();
    let receipt: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(receipt["transaction"]["fees"]["platform_fee_coins"], 5);

    let buyer = exchange.balances.balance(&AccountId::new("buyer")).await.unwrap();
    let seller = exchange.balances.balance(&AccountId::new("seller")).await.unwrap();
    assert_eq!(buyer.total, 0);
    assert_eq!(seller.total, 95);

    // Sold listings drop out of the public list
    let req = test::TestRequest::get().uri("/api/marketplace/listings").to_request();
    let listings: Value = test::call_and_read_body_json(&app, req).await;
    assert!(listings.as_array().unwrap().is_empty());
}

#[actix_web::test]
async fn test_seller_cannot_buy_own_listing() {
    let (exchange, _processor, state) = setup();
    fund(&exchange, "seller", 20).await;
    let app = app!(state);

    let req = test::TestRequest::post()
        .uri("/api/marketplace/listings/coins")
        .insert_header(bearer("seller"))
        .set_json(json!({ "coins_offered": 10, "price_per_coin_usd": "2.00", "sale_type": "fixed" }))
        .to_request();
    let listing: Value = test::call_and_read_body_json(&app, req).await;

    let req = test::TestRequest::post()
        .uri(&format!("/api/marketplace/buy/{}", listing["id"].as_str().unwrap()))
        .insert_header(bearer("seller"))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    let body: Value = test::read_body_json(resp).await;
    assert_eq!(body["error"]["type"], "self_purchase");
}

#[actix_web::test]
async fn test_redemption_review_requires_admin_role() {
    let (exchange, _processor, state) = setup();
    fund(&exchange, "alice", 10).await;
    let app = app!(state);

    let req = test::TestRequest::post()
        .uri("/api/marketplace/redeem")
        .insert_header(bearer("alice"))
        .set_json(json!({ "coins": 5 }))
        .to_request();
    let receipt: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(receipt["request"]["payout_cents"], 10000);
    assert_eq!(receipt["request"]["status"], "pending");
    let redemption_id = receipt["request"]["id"].as_str().unwrap().to_string();

    let uri = format!("/api/admin/redemptions/{}/reject", redemption_id);
    let req = test::TestRequest::post()
        .uri(&uri)
        .insert_header(bearer("alice"))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::FORBIDDEN);

    let req = test::TestRequest::post()
        .uri(&uri)
        .insert_header(admin_bearer())
        .to_request();
    let decided: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(decided["status"], "rejected");

    let alice = exchange.balances.balance(&AccountId::new("alice")).await.unwrap();
    assert_eq!(alice.total, 10);

    // Decided requests stay decided
    let req = test::TestRequest::post()
        .uri(&format!("/api/admin/redemptions/{}/approve", redemption_id))
        .insert_header(admin_bearer())
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::CONFLICT);
}

#[actix_web::test]
async fn test_malformed_body_is_validation_error() {
    let (_exchange, _processor, state) = setup();
    let app = app!(state);

    let req = test::TestRequest::post()
        .uri("/api/marketplace/redeem")
        .insert_header(bearer("alice"))
        .set_json(json!({ "coins": "lots" }))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    let body: Value = test::read_body_json(resp).await;
    assert_eq!(body["error"]["type"], "validation_error");
}
