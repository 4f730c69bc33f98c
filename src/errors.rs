//! Typed error hierarchy for the atelier backend.
//!
//! `StoreError` is the single failure taxonomy shared by the store and the
//! HTTP layer: every store method returns it, and `api::ApiError` maps each
//! variant onto exactly one status code.

use thiserror::Error;

/// Errors from the store and the order lifecycle operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Row missing. Also covers reads the caller may not see: an order
    /// belonging to someone else reports "not found", not "forbidden".
    #[error("{0} not found")]
    NotFound(String),

    /// Ownership or status guard violated on a write.
    #[error("Forbidden: {0}")]
    Forbidden(String),

    /// Unique constraint violated (duplicate line item, duplicate login).
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Malformed or semantically invalid input.
    #[error("Invalid request: {0}")]
    BadRequest(String),

    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;
