use actix_web::{error::ResponseError, http::StatusCode, HttpResponse};
use coin_ledger::Error as LedgerError;
use serde_json::{json, Map, Value};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, ApiError>;

#[derive(Error, Debug)]
pub enum ApiError {
    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Forbidden")]
    Forbidden,

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Internal server error: {0}")]
    Internal(String),
}

impl From<validator::ValidationErrors> for ApiError {
    fn from(err: validator::ValidationErrors) -> Self {
        ApiError::Validation(err.to_string())
    }
}

impl From<serde_json::Error> for ApiError {
    fn from(err: serde_json::Error) -> Self {
        ApiError::Validation(format!("Malformed JSON: {}", err))
    }
}

impl ResponseError for ApiError {
    fn error_response(&self) -> HttpResponse {
        let status_code = self.status_code();

        let message = match self {
            ApiError::Ledger(LedgerError::StorageUnavailable(detail)) => {
                tracing::error!(error = %detail, "Storage failure surfaced to caller");
                "Service temporarily unavailable".to_string()
            }
            ApiError::Internal(detail) => {
                tracing::error!(error = %detail, "Internal error");
                "Internal server error".to_string()
            }
            other => other.to_string(),
        };

        let mut body = Map::new();
        body.insert("code".to_string(), json!(status_code.as_u16()));
        body.insert("type".to_string(), json!(self.error_type()));
        body.insert("message".to_string(), json!(message));
        body.extend(self.context());

        HttpResponse::build(status_code).json(json!({ "error": Value::Object(body) }))
    }

    fn status_code(&self) -> StatusCode {
        match self {
            ApiError::Ledger(err) => match err {
                LedgerError::Validation(_)
                | LedgerError::InsufficientFunds { .. }
                | LedgerError::BidTooLow { .. }
                | LedgerError::SelfPurchase
                | LedgerError::UnknownTier(_) => StatusCode::BAD_REQUEST,
                LedgerError::AuctionNotFound(_)
                | LedgerError::LotNotFound(_)
                | LedgerError::ListingNotFound(_)
                | LedgerError::RedemptionNotFound(_)
                | LedgerError::PurchaseNotFound(_) => StatusCode::NOT_FOUND,
                LedgerError::AuctionNotLive(_)
                | LedgerError::LotNotOpen(_)
                | LedgerError::ListingUnavailable(_)
                | LedgerError::RedemptionNotPending(_)
                | LedgerError::ConcurrencyConflict(_) => StatusCode::CONFLICT,
                LedgerError::MintCapExceeded { .. } => StatusCode::UNPROCESSABLE_ENTITY,
                LedgerError::UnsupportedPaymentMethod(_) => StatusCode::NOT_IMPLEMENTED,
                LedgerError::Gateway(_) => StatusCode::BAD_GATEWAY,
                LedgerError::StorageUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
                LedgerError::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
            },
            ApiError::Validation(_) => StatusCode::BAD_REQUEST,
            ApiError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            ApiError::Forbidden => StatusCode::FORBIDDEN,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl ApiError {
    fn error_type(&self) -> &str {
        match self {
            ApiError::Ledger(err) => err.kind(),
            ApiError::Validation(_) => "validation_error",
            ApiError::Unauthorized(_) => "unauthorized",
            ApiError::Forbidden => "forbidden",
            ApiError::NotFound(_) => "not_found",
            ApiError::Internal(_) => "internal_error",
        }
    }

    /// Extra fields a client needs to react to a rejection
    fn context(&self) -> Map<String, Value> {
        let mut context = Map::new();
        match self {
            ApiError::Ledger(LedgerError::InsufficientFunds { required, available }) => {
                context.insert("required".to_string(), json!(required));
                context.insert("available".to_string(), json!(available));
            }
            ApiError::Ledger(LedgerError::BidTooLow { amount, current_price }) => {
                context.insert("amount".to_string(), json!(amount));
                context.insert("current_price".to_string(), json!(current_price));
            }
            ApiError::Ledger(LedgerError::MintCapExceeded { requested, remaining }) => {
                context.insert("requested".to_string(), json!(requested));
                context.insert("remaining".to_string(), json!(remaining));
            }
            ApiError::Ledger(err) if err.is_transient() => {
                context.insert("retryable".to_string(), json!(true));
            }
            _ => {}
        }
        context
    }
}
