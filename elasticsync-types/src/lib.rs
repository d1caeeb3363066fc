//! Core type definitions for ElasticSync.
//!
//! This crate defines the types shared by the store, search and engine
//! crates:
//! - Change-log entries and their operations
//! - Tracked-table configuration
//! - Engine options (sync mode, retry policy, workers)
//! - The raw PascalCase settings surface and its validation
//! - Worker identifiers stamped into claim columns

mod entity;
mod entry;
mod ids;
mod options;
mod settings;

pub use entity::TrackedEntity;
pub use entry::{ChangeLogEntry, ChangeOperation};
pub use ids::{InstanceTag, WorkerId};
pub use options::{
    Backoff, RetryPolicy, SyncMode, SyncOptions, WorkerOptions, DEFAULT_BATCH_SIZE,
    DEFAULT_CLAIM_TIMEOUT, DEFAULT_INTERVAL, DEFAULT_MAX_RETRIES, DEFAULT_RETRY_DELAY,
    DEFAULT_WORKER_BATCH_SIZE, DEFAULT_WORKER_COUNT, MAX_RETRY_DELAY,
};
pub use settings::{ModeKind, SyncConfig, SyncSettings, SETTINGS_SECTION};

/// Result type alias using the crate's error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in type conversions.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("unknown change operation: {0}")]
    UnknownOperation(String),
}

/// Missing or invalid configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("missing required option: {0}")]
    Missing(&'static str),

    #[error("invalid configuration: {0}")]
    Invalid(String),

    #[error("failed to parse settings: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("table {table}: no document shape registered for entity type {entity_type:?}")]
    UnknownEntityType { table: String, entity_type: String },

    #[error("no tracked entity configured for table {0}")]
    UnmappedTable(String),
}
