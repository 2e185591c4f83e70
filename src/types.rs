//! Error types for Turnstile

use thiserror::Error;

/// Errors surfaced by the metering and progression core
#[derive(Debug, Error)]
pub enum TurnstileError {
    /// Requested spend exceeds the caller's weekly quota
    #[error("Insufficient quota: requested {requested}, {remaining} remaining this week")]
    InsufficientQuota { requested: i64, remaining: i64 },

    /// Consumption amounts must be positive
    #[error("Invalid amount: {0}")]
    InvalidAmount(i64),

    /// Metering store (MongoDB) failure
    #[error("Database error: {0}")]
    Database(String),

    /// Gamification store (PostgreSQL) failure
    #[error("Progression store error: {0}")]
    Progression(String),

    /// Change feed failure
    #[error("Change feed error: {0}")]
    Feed(String),

    /// An operation exceeded its deadline
    #[error("Timed out: {0}")]
    Timeout(String),

    /// Invalid configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl TurnstileError {
    /// Whether this is a transient store failure rather than a business-rule
    /// rejection. Transient failures are safe to retry: usage writes are
    /// deduplicated per event id.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            TurnstileError::Database(_) | TurnstileError::Progression(_) | TurnstileError::Timeout(_)
        )
    }
}

/// Result type alias using TurnstileError
pub type Result<T> = std::result::Result<T, TurnstileError>;
