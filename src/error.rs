//! Core Error Types
//!
//! Every adapter and domain service returns a kind-tagged [`CoreError`].
//! The HTTP projection maps kinds to status codes deterministically; nothing
//! inside the core recovers from [`CoreError::Internal`].

use rust_decimal::Decimal;
use thiserror::Error;

use crate::money::MoneyError;

/// Coarse error kind, one per recovery strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Validation,
    NotFound,
    Forbidden,
    ConflictingTransition,
    InsufficientFunds,
    SignatureMismatch,
    AmountMismatch,
    GatewayFailure,
    AlreadyTerminal,
    Internal,
}

#[derive(Error, Debug, Clone)]
pub enum CoreError {
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Conflicting transition: {0}")]
    ConflictingTransition(String),

    #[error("Insufficient funds")]
    InsufficientFunds,

    #[error("Payment signature mismatch")]
    SignatureMismatch,

    #[error("Amount mismatch: expected {expected}, gateway reported {actual}")]
    AmountMismatch { expected: Decimal, actual: Decimal },

    #[error("Gateway failure: {0}")]
    GatewayFailure(String),

    #[error("Already terminal: {0}")]
    AlreadyTerminal(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type CoreResult<T> = Result<T, CoreError>;

impl CoreError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound(what.into())
    }

    pub fn forbidden(msg: impl Into<String>) -> Self {
        Self::Forbidden(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::ConflictingTransition(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            CoreError::Validation(_) => ErrorKind::Validation,
            CoreError::NotFound(_) => ErrorKind::NotFound,
            CoreError::Forbidden(_) => ErrorKind::Forbidden,
            CoreError::ConflictingTransition(_) => ErrorKind::ConflictingTransition,
            CoreError::InsufficientFunds => ErrorKind::InsufficientFunds,
            CoreError::SignatureMismatch => ErrorKind::SignatureMismatch,
            CoreError::AmountMismatch { .. } => ErrorKind::AmountMismatch,
            CoreError::GatewayFailure(_) => ErrorKind::GatewayFailure,
            CoreError::AlreadyTerminal(_) => ErrorKind::AlreadyTerminal,
            CoreError::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Stable error code for API responses
    pub fn code(&self) -> &'static str {
        match self.kind() {
            ErrorKind::Validation => "VALIDATION_ERROR",
            ErrorKind::NotFound => "NOT_FOUND",
            ErrorKind::Forbidden => "FORBIDDEN",
            ErrorKind::ConflictingTransition => "CONFLICTING_TRANSITION",
            ErrorKind::InsufficientFunds => "INSUFFICIENT_FUNDS",
            ErrorKind::SignatureMismatch => "SIGNATURE_MISMATCH",
            ErrorKind::AmountMismatch => "AMOUNT_MISMATCH",
            ErrorKind::GatewayFailure => "GATEWAY_FAILURE",
            ErrorKind::AlreadyTerminal => "ALREADY_TERMINAL",
            ErrorKind::Internal => "INTERNAL_ERROR",
        }
    }

    /// HTTP status code for the projection layer
    pub fn http_status(&self) -> u16 {
        match self.kind() {
            ErrorKind::Validation => 400,
            ErrorKind::NotFound => 404,
            ErrorKind::Forbidden => 403,
            ErrorKind::ConflictingTransition | ErrorKind::AlreadyTerminal => 409,
            ErrorKind::InsufficientFunds
            | ErrorKind::SignatureMismatch
            | ErrorKind::AmountMismatch => 422,
            ErrorKind::GatewayFailure => 503,
            ErrorKind::Internal => 500,
        }
    }

    /// Only transient external failures are retried (by the scheduler).
    pub fn is_retryable(&self) -> bool {
        matches!(self, CoreError::GatewayFailure(_))
    }
}

impl From<sqlx::Error> for CoreError {
    fn from(e: sqlx::Error) -> Self {
        match &e {
            sqlx::Error::RowNotFound => CoreError::NotFound("row".to_string()),
            sqlx::Error::Database(db) if db.is_unique_violation() => {
                CoreError::ConflictingTransition(format!("unique constraint: {}", db.message()))
            }
            _ => {
                tracing::error!(error = %e, "Database error");
                CoreError::Internal(format!("database: {}", e))
            }
        }
    }
}

impl From<MoneyError> for CoreError {
    fn from(e: MoneyError) -> Self {
        CoreError::Validation(e.to_string())
    }
}
