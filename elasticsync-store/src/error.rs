//! Error types for the change-log store.

use thiserror::Error;

/// Result type for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors that can occur while talking to the change log.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Database driver error.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Installing the capture objects failed.
    #[error("capture install failed: {0}")]
    Ddl(String),

    /// The store could not be reached.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// The notification subscription ended or failed.
    #[error("notification subscription failed: {0}")]
    Subscription(String),
}
