pub mod config;
pub mod database;
pub mod errors;
pub mod handlers;
pub mod models;
pub mod payments;
pub mod security_middleware;

pub use config::Config;
pub use database::PgStore;
pub use errors::{ApiError, Result};
pub use handlers::{configure_routes, AppState};
pub use payments::{IntentLookup, StripeClient};
