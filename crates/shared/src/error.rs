//! Error types for shared infrastructure

use thiserror::Error;

/// Errors raised by a [`crate::CounterStore`] backend
#[derive(Debug, Error)]
pub enum CounterError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Counter store timed out after {0} ms")]
    Timeout(u64),

    #[error("Unexpected counter reply: {0}")]
    Protocol(String),
}

/// Errors raised while parsing a domain value from text
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("Unknown feature: {0}")]
    UnknownFeature(String),

    #[error("Unknown action: {0}")]
    UnknownAction(String),

    #[error("Invalid {kind}: {value}")]
    InvalidValue { kind: &'static str, value: String },
}
