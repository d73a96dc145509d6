//! Billing error types

use thiserror::Error;
use time::OffsetDateTime;
use whatsflow_shared::{ParseError, PaymentStatus, SubscriptionStatus};

/// Coarse classification used by callers to pick a response policy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Bad caller input, 4xx
    Validation,
    /// Subscription does not permit the operation, 403 with an upgrade hint
    EntitlementDenied,
    /// Store or gateway unavailable. Gates fail open on this kind.
    Infrastructure,
    /// Uniqueness or integrity constraint hit; usually a duplicate delivery
    Integrity,
    /// Operation does not apply in the current state
    StateConflict,
    NotFound,
}

/// Billing-specific errors
#[derive(Debug, Error)]
pub enum BillingError {
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Unknown plan key: {0}")]
    UnknownKey(#[from] ParseError),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("No subscription found")]
    NoSubscription,

    #[error("Subscription is {status}")]
    NotActive { status: SubscriptionStatus },

    #[error("Free trial has already been used")]
    TrialAlreadyUsed,

    #[error("An open subscription already exists")]
    SubscriptionAlreadyExists,

    #[error("Cannot {action} a subscription that is {status}")]
    InvalidTransition {
        status: SubscriptionStatus,
        action: &'static str,
    },

    #[error("Reactivation is available after {available_at}")]
    ReactivationCooldown { available_at: OffsetDateTime },

    #[error("Webhook signature verification failed")]
    WebhookSignatureInvalid,

    #[error("Duplicate record: {0}")]
    Duplicate(String),

    #[error("Insufficient credits: requested {requested}, available {available}")]
    InsufficientCredits { requested: i64, available: i64 },

    #[error("Payment cannot be refunded while {0}")]
    RefundNotAllowed(PaymentStatus),

    #[error("Payment gateway error: {0}")]
    Gateway(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Ledger store timed out during {0}")]
    Timeout(&'static str),
}

impl BillingError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            BillingError::InvalidInput(_)
            | BillingError::UnknownKey(_)
            | BillingError::WebhookSignatureInvalid
            | BillingError::InsufficientCredits { .. } => ErrorKind::Validation,
            BillingError::NotActive { .. } => ErrorKind::EntitlementDenied,
            BillingError::NotFound(_) | BillingError::NoSubscription => ErrorKind::NotFound,
            BillingError::TrialAlreadyUsed
            | BillingError::SubscriptionAlreadyExists
            | BillingError::InvalidTransition { .. }
            | BillingError::ReactivationCooldown { .. }
            | BillingError::RefundNotAllowed(_) => ErrorKind::StateConflict,
            BillingError::Duplicate(_) => ErrorKind::Integrity,
            BillingError::Gateway(_)
            | BillingError::Config(_)
            | BillingError::Database(_)
            | BillingError::Timeout(_) => ErrorKind::Infrastructure,
        }
    }

    pub fn is_infrastructure(&self) -> bool {
        self.kind() == ErrorKind::Infrastructure
    }
}

impl From<sqlx::Error> for BillingError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::Database(db_err) if db_err.code().as_deref() == Some("23505") => {
                BillingError::Duplicate(
                    db_err
                        .constraint()
                        .unwrap_or("unique constraint")
                        .to_string(),
                )
            }
            sqlx::Error::RowNotFound => BillingError::NotFound("row".to_string()),
            _ => BillingError::Database(err.to_string()),
        }
    }
}

impl From<reqwest::Error> for BillingError {
    fn from(err: reqwest::Error) -> Self {
        BillingError::Gateway(err.to_string())
    }
}

pub type BillingResult<T> = Result<T, BillingError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kinds() {
        assert_eq!(
            BillingError::NotActive {
                status: SubscriptionStatus::Expired
            }
            .kind(),
            ErrorKind::EntitlementDenied
        );
        assert_eq!(BillingError::Duplicate("x".into()).kind(), ErrorKind::Integrity);
        assert!(BillingError::Timeout("read").is_infrastructure());
        assert_eq!(BillingError::TrialAlreadyUsed.kind(), ErrorKind::StateConflict);
    }
}
