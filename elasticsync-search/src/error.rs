//! Error types for the search layer.

use thiserror::Error;

/// Result type for search operations.
pub type SearchResult<T> = Result<T, SearchError>;

/// Errors that can occur talking to the index engine.
#[derive(Debug, Error)]
pub enum SearchError {
    /// HTTP client error (connect, timeout, body read).
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// The bulk call failed as a whole; no per-item results are available.
    #[error("transport error: {0}")]
    Transport(String),

    /// Creating an index or alias failed.
    #[error("failed to provision index {index}: {reason}")]
    Provision { index: String, reason: String },

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The endpoint URL could not be used.
    #[error("invalid endpoint: {0}")]
    InvalidUrl(String),
}
