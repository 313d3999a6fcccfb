//! Error types for the spendgate domain.
//!
//! Uses `thiserror` for ergonomic error definitions.
//! Each bounded context has its own error variant.

use rust_decimal::Decimal;
use thiserror::Error;

/// The top-level error type for all spendgate operations.
#[derive(Debug, Error)]
pub enum Error {
    // --- Admission errors (caller-visible) ---
    #[error("Admission error: {0}")]
    Admission(#[from] AdmissionError),

    // --- Ledger / storage errors ---
    #[error("Ledger error: {0}")]
    Ledger(#[from] LedgerError),

    // --- Configuration errors ---
    #[error("Configuration error: {message}")]
    Config { message: String },

    // --- Serialization ---
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    // --- Generic ---
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias using our Error.
pub type Result<T> = std::result::Result<T, Error>;

// --- Bounded context errors ---

/// Errors surfaced to the caller of the admission path.
///
/// These map one-to-one onto the wire-level error codes the gateway
/// returns; see [`AdmissionError::code`].
#[derive(Debug, Clone, Error)]
pub enum AdmissionError {
    #[error(
        "budget exceeded on {scope}: requested ${requested}, used ${used}, remaining ${remaining} of ${limit}"
    )]
    BudgetExceeded {
        scope: String,
        requested: Decimal,
        used: Decimal,
        remaining: Decimal,
        limit: Decimal,
    },

    #[error("invalid monetary amount: ${0}")]
    InvalidAmount(Decimal),

    #[error("scope resolution failed: {0}")]
    ScopeResolution(String),

    #[error("reservation not found or already settled: {0}")]
    ReservationNotFound(String),
}

impl AdmissionError {
    /// Machine-readable error code for API responses and audit records.
    pub fn code(&self) -> &'static str {
        match self {
            Self::BudgetExceeded { .. } => "BUDGET_EXCEEDED",
            Self::InvalidAmount(_) => "INVALID_AMOUNT",
            Self::ScopeResolution(_) => "SCOPE_RESOLUTION_ERROR",
            Self::ReservationNotFound(_) => "RESERVATION_NOT_FOUND",
        }
    }
}

/// Errors from the durable ledger store.
///
/// `Conflict` is the one retryable variant: it signals that the locking
/// discipline detected a concurrent writer, and callers retry it
/// internally with bounded backoff. It is never surfaced to callers.
#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Migration failed: {0}")]
    MigrationFailed(String),

    #[error("Query failed: {0}")]
    QueryFailed(String),

    #[error("Write conflict: {0}")]
    Conflict(String),

    #[error("Corrupt monetary amount in {column}: {value:?}")]
    CorruptAmount { column: String, value: String },
}

impl LedgerError {
    /// Whether the operation may be retried against the same store.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Conflict(_))
    }
}
