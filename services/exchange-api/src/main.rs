use actix_cors::Cors;
use actix_web::{middleware, web, App, HttpServer};
use anyhow::Context;
use coin_ledger::{Exchange, Metrics, PaymentGateway};
use dotenv::dotenv;
use exchange_api::{
    config::Config,
    database::PgStore,
    handlers::{self, AppState},
    payments::{IntentLookup, StripeClient},
    security_middleware::JwtAuth,
};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

fn init_tracing(config: &Config) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log.level));

    let builder = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_file(true)
        .with_line_number(true)
        .with_thread_ids(true)
        .with_target(false);

    if config.log.json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn cors_for(origins: &[String]) -> Cors {
    if origins.is_empty() {
        return Cors::permissive();
    }

    origins
        .iter()
        .fold(Cors::default(), |cors, origin| cors.allowed_origin(origin))
        .allow_any_method()
        .allow_any_header()
        .max_age(3600)
}

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();

    let config = Config::from_env().context("Failed to load configuration")?;
    config.validate().map_err(anyhow::Error::msg)?;
    init_tracing(&config);

    info!(
        "Starting Exchange API on {}:{}",
        config.server.host, config.server.port
    );

    let store = PgStore::connect(&config.database)
        .await
        .context("Failed to connect to database")?;
    if config.database.run_migrations {
        store.migrate().await?;
    }

    let stripe = Arc::new(StripeClient::new(&config.payments)?);
    let gateway: Arc<dyn PaymentGateway> = stripe.clone();
    let intents: Arc<dyn IntentLookup> = stripe;

    let metrics = Metrics::new()?;
    let exchange = Exchange::new(Arc::new(store), gateway, config.engine.clone(), metrics)?;
    let state = AppState::new(exchange, intents);

    let origins = config.server.allowed_origins.clone();
    let jwt_secret = config.auth.jwt_secret.clone();
    let admin_role = config.auth.admin_role.clone();

    HttpServer::new(move || {
        App::new()
            .wrap(JwtAuth::new(jwt_secret.clone(), admin_role.clone()))
            .wrap(cors_for(&origins))
            .wrap(middleware::Logger::default())
            .wrap(middleware::NormalizePath::trim())
            .app_data(web::Data::new(state.clone()))
            .configure(handlers::configure_routes)
    })
    .workers(config.server.workers)
    .bind((config.server.host.as_str(), config.server.port))?
    .run()
    .await?;

    Ok(())
}
