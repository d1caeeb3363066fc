//! Store abstraction.
//!
//! Defines the traits the engine drains the change log through, so the same
//! worker code runs against Postgres or the in-memory store.

use crate::error::StoreResult;
use async_trait::async_trait;
use elasticsync_types::{ChangeLogEntry, TrackedEntity, WorkerId};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// How a session selects rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimStrategy {
    /// Plain ordered select; only valid when a single worker drains the log.
    SingleWorker,
    /// Atomic claim with `FOR UPDATE SKIP LOCKED`. Claims older than
    /// `claim_timeout` are treated as abandoned.
    SkipLocked { claim_timeout: Duration },
}

/// A rejected row headed for the retry state machine.
#[derive(Debug, Clone, PartialEq)]
pub struct RowFailure {
    pub id: i64,
    pub reason: String,
    /// Delay before the row becomes eligible again.
    pub retry_delay: Duration,
    /// Whether this failure exhausts the row's retries.
    pub dead_letter: bool,
}

/// A row that can never succeed and goes straight to the dead-letter state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowReject {
    pub id: i64,
    pub reason: String,
}

impl RowReject {
    pub fn new(id: i64, reason: impl Into<String>) -> Self {
        Self {
            id,
            reason: reason.into(),
        }
    }
}

/// One inbound change-log signal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    /// Source table named in the payload. Empty when signals were coalesced.
    pub table_name: String,
}

/// Row counts by lifecycle state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeLogStats {
    /// Neither processed nor dead-lettered.
    pub pending: i64,
    /// Pending rows currently stamped with a worker claim.
    pub claimed: i64,
    /// Pending rows that have failed at least once.
    pub retrying: i64,
    pub processed: i64,
    pub dead_lettered: i64,
}

/// The durable change log shared by every worker.
#[async_trait]
pub trait ChangeLogStore: Send + Sync {
    /// Installs (or upgrades) the capture objects for `entities`.
    async fn install(&self, entities: &[TrackedEntity]) -> StoreResult<()>;

    /// Opens a private session for one worker.
    async fn open_session(
        &self,
        worker: &WorkerId,
        strategy: ClaimStrategy,
    ) -> StoreResult<Box<dyn ChangeLogSession>>;

    /// Subscribes to change notifications.
    async fn subscribe(&self) -> StoreResult<Box<dyn NotificationSubscription>>;

    /// Counts rows by lifecycle state.
    async fn stats(&self) -> StoreResult<ChangeLogStats>;

    /// Resets dead-lettered rows to pending with a zero retry count.
    /// `None` requeues every dead-lettered row. Returns the number requeued.
    async fn requeue_dead_letters(&self, ids: Option<&[i64]>) -> StoreResult<u64>;
}

/// A worker's private connection to the change log.
#[async_trait]
pub trait ChangeLogSession: Send {
    /// The identifier stamped into claim columns.
    fn worker_id(&self) -> &WorkerId;

    /// Fetches up to `batch_size` eligible rows, oldest first.
    async fn claim(&mut self, batch_size: usize) -> StoreResult<Vec<ChangeLogEntry>>;

    /// Marks rows processed and clears their claim.
    ///
    /// Outcome writes only touch rows that are still pending and, under
    /// [`ClaimStrategy::SkipLocked`], still claimed by this session. Rows
    /// reclaimed by another worker are skipped.
    async fn mark_processed(&mut self, ids: &[i64]) -> StoreResult<()>;

    /// Records failed attempts.
    async fn mark_failed(&mut self, failures: &[RowFailure]) -> StoreResult<()>;

    /// Dead-letters rows that can never be applied.
    async fn dead_letter(&mut self, rejects: &[RowReject]) -> StoreResult<()>;
}

/// A live subscription to change notifications.
#[async_trait]
pub trait NotificationSubscription: Send {
    /// Waits for the next notification. An error means the subscription is
    /// gone and must be re-established.
    async fn recv(&mut self) -> StoreResult<Notification>;
}
