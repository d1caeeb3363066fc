//! Error types for the sync engine.

use elasticsync_search::SearchError;
use elasticsync_store::StoreError;
use elasticsync_types::ConfigError;
use thiserror::Error;

/// Result type for engine operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors surfaced by the sync engine.
#[derive(Debug, Error)]
pub enum SyncError {
    /// Missing or invalid configuration.
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Installing the capture triggers failed.
    #[error("capture install failed: {0}")]
    Ddl(#[source] StoreError),

    /// Creating an index or alias failed.
    #[error("index provisioning failed: {0}")]
    Provision(#[source] SearchError),

    /// A bulk call failed as a whole.
    #[error("bulk transport failed: {0}")]
    Transport(#[source] SearchError),

    /// Change-log access failed.
    #[error("change log error: {0}")]
    Store(#[from] StoreError),

    /// `start` was called on an engine that is already running.
    #[error("engine is already running")]
    AlreadyRunning,
}
