//! API error types and handling

use axum::{
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use whatsflow_billing::{BillingError, ErrorKind};
use whatsflow_shared::SubscriptionStatus;

/// Application error type
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    // Authentication errors
    #[error("Invalid or expired token")]
    InvalidToken,
    #[error("Invalid API key")]
    InvalidApiKey,
    #[error("Authentication required")]
    Unauthorized,
    #[error("Insufficient permissions")]
    Forbidden,

    // Validation errors
    #[error("Validation error: {0}")]
    Validation(String),
    #[error("Invalid request: {0}")]
    BadRequest(String),

    // Resource errors
    #[error("Resource not found")]
    NotFound,
    #[error("{0}")]
    Conflict(String),

    // Rate limiting
    #[error("Rate limit exceeded. Try again in {retry_after} seconds.")]
    RateLimited { retry_after: u64 },

    // Billing errors
    #[error("{message}")]
    EntitlementDenied { message: String, is_past_due: bool },
    #[error("Billing is disabled")]
    BillingDisabled,

    // Internal errors
    #[error("Database error: {0}")]
    Database(String),
    #[error("Internal server error")]
    Internal,
    #[error("Service unavailable")]
    ServiceUnavailable,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code, message) = match &self {
            // Authentication
            ApiError::InvalidToken => (StatusCode::UNAUTHORIZED, "INVALID_TOKEN", self.to_string()),
            ApiError::InvalidApiKey => (StatusCode::UNAUTHORIZED, "INVALID_API_KEY", self.to_string()),
            ApiError::Unauthorized => (StatusCode::UNAUTHORIZED, "UNAUTHORIZED", self.to_string()),
            ApiError::Forbidden => (StatusCode::FORBIDDEN, "FORBIDDEN", self.to_string()),

            // Validation
            ApiError::Validation(msg) => (StatusCode::BAD_REQUEST, "VALIDATION_ERROR", msg.clone()),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "BAD_REQUEST", msg.clone()),

            // Resources
            ApiError::NotFound => (StatusCode::NOT_FOUND, "NOT_FOUND", self.to_string()),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, "CONFLICT", msg.clone()),

            // Rate limiting
            ApiError::RateLimited { .. } => (StatusCode::TOO_MANY_REQUESTS, "RATE_LIMITED", self.to_string()),

            // Billing
            ApiError::EntitlementDenied { message, .. } => (StatusCode::FORBIDDEN, "ENTITLEMENT_DENIED", message.clone()),
            ApiError::BillingDisabled => (StatusCode::NOT_FOUND, "BILLING_DISABLED", self.to_string()),

            // Internal
            ApiError::Database(_) => (StatusCode::INTERNAL_SERVER_ERROR, "DATABASE_ERROR", "Database error".to_string()),
            ApiError::Internal => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR", self.to_string()),
            ApiError::ServiceUnavailable => (StatusCode::SERVICE_UNAVAILABLE, "SERVICE_UNAVAILABLE", self.to_string()),
        };

        let mut body = json!({
            "success": false,
            "error": code,
            "message": message,
        });

        match &self {
            ApiError::RateLimited { retry_after } => {
                body["retryAfter"] = json!(retry_after);
                let mut response = (status, Json(body)).into_response();
                response
                    .headers_mut()
                    .insert(header::RETRY_AFTER, HeaderValue::from(*retry_after));
                return response;
            }
            ApiError::EntitlementDenied { is_past_due, .. } => {
                body["needsUpgrade"] = json!(true);
                body["isPastDue"] = json!(is_past_due);
            }
            _ => {}
        }

        (status, Json(body)).into_response()
    }
}

impl From<BillingError> for ApiError {
    fn from(err: BillingError) -> Self {
        match err.kind() {
            ErrorKind::Validation => ApiError::Validation(err.to_string()),
            ErrorKind::EntitlementDenied => {
                let is_past_due = matches!(
                    err,
                    BillingError::NotActive {
                        status: SubscriptionStatus::PastDue
                    }
                );
                ApiError::EntitlementDenied {
                    message: err.to_string(),
                    is_past_due,
                }
            }
            ErrorKind::NotFound => ApiError::NotFound,
            ErrorKind::StateConflict => ApiError::Conflict(err.to_string()),
            ErrorKind::Integrity => ApiError::Conflict("Resource already exists".to_string()),
            ErrorKind::Infrastructure => {
                tracing::error!(error = %err, "Billing infrastructure error");
                ApiError::ServiceUnavailable
            }
        }
    }
}

impl From<sqlx::Error> for ApiError {
    fn from(err: sqlx::Error) -> Self {
        tracing::error!("Database error: {:?}", err);
        match err {
            sqlx::Error::RowNotFound => ApiError::NotFound,
            sqlx::Error::Database(db_err) => {
                if db_err.code().as_deref() == Some("23505") {
                    return ApiError::Conflict("Resource already exists".to_string());
                }
                ApiError::Database(db_err.to_string())
            }
            _ => ApiError::Database(err.to_string()),
        }
    }
}

/// Result type alias for API handlers
pub type ApiResult<T> = Result<T, ApiError>;
