//! One claim-map-write-reconcile step.

use crate::error::{SyncError, SyncResult};
use crate::registry::EntityRegistry;
use crate::stats::EngineCounters;
use elasticsync_search::{BulkRequest, SearchIndex};
use elasticsync_store::{ChangeLogSession, RowFailure, RowReject};
use elasticsync_types::{ChangeLogEntry, RetryPolicy};
use std::sync::Arc;
use tracing::{debug, warn};

/// Result of one step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchOutcome {
    /// The claim returned no rows.
    Idle,
    Processed(BatchReport),
}

/// Row counts for one non-empty batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchReport {
    pub claimed: usize,
    pub processed: usize,
    /// Rows the index rejected, whether retried or dead-lettered.
    pub failed: usize,
    /// Rows dead-lettered in this batch.
    pub dead_lettered: usize,
}

/// Turns claimed change-log rows into one bulk call and records the outcome
/// of every row.
pub struct ChangeProcessor {
    registry: Arc<EntityRegistry>,
    search: Arc<dyn SearchIndex>,
    retry: RetryPolicy,
    counters: Arc<EngineCounters>,
}

impl ChangeProcessor {
    pub fn new(
        registry: Arc<EntityRegistry>,
        search: Arc<dyn SearchIndex>,
        retry: RetryPolicy,
        counters: Arc<EngineCounters>,
    ) -> Self {
        Self {
            registry,
            search,
            retry,
            counters,
        }
    }

    /// Claims up to `batch_size` rows through `session` and processes them.
    ///
    /// A failed bulk call returns [`SyncError::Transport`] and leaves every
    /// claimed row untouched.
    pub async fn process_batch(
        &self,
        session: &mut dyn ChangeLogSession,
        batch_size: usize,
    ) -> SyncResult<BatchOutcome> {
        let batch = session.claim(batch_size).await?;
        if batch.is_empty() {
            return Ok(BatchOutcome::Idle);
        }

        let mut report = BatchReport {
            claimed: batch.len(),
            ..BatchReport::default()
        };
        let mut request = BulkRequest::new();
        let mut submitted: Vec<&ChangeLogEntry> = Vec::with_capacity(batch.len());
        let mut rejects = Vec::new();

        for entry in &batch {
            match self.registry.map(entry) {
                Ok(action) => {
                    request.push(action);
                    submitted.push(entry);
                }
                Err(reason) => {
                    warn!(id = entry.id, table = %entry.table_name, %reason, "dead-lettering unmappable row");
                    rejects.push(RowReject::new(entry.id, reason));
                }
            }
        }

        if !rejects.is_empty() {
            session.dead_letter(&rejects).await?;
            report.dead_lettered += rejects.len();
        }

        if !request.is_empty() {
            let response = match self.search.bulk(&request).await {
                Ok(response) => response,
                Err(e) => {
                    self.counters.record_transport_error();
                    warn!(
                        worker = %session.worker_id(),
                        rows = submitted.len(),
                        error = %e,
                        "bulk call failed, batch abandoned"
                    );
                    return Err(SyncError::Transport(e));
                }
            };

            let mut done = Vec::with_capacity(submitted.len());
            let mut failures = Vec::new();
            for (entry, item) in submitted.iter().zip(&response.items) {
                if item.is_success() {
                    done.push(entry.id);
                } else {
                    failures.push(self.failure_for(entry, item.failure_reason()));
                }
            }

            if !done.is_empty() {
                session.mark_processed(&done).await?;
            }
            if !failures.is_empty() {
                session.mark_failed(&failures).await?;
            }

            report.processed = done.len();
            report.failed = failures.len();
            report.dead_lettered += failures.iter().filter(|f| f.dead_letter).count();
        }

        self.counters
            .record_batch(report.processed, report.failed, report.dead_lettered);
        debug!(
            worker = %session.worker_id(),
            claimed = report.claimed,
            processed = report.processed,
            failed = report.failed,
            dead_lettered = report.dead_lettered,
            "batch reconciled"
        );
        Ok(BatchOutcome::Processed(report))
    }

    fn failure_for(&self, entry: &ChangeLogEntry, reason: String) -> RowFailure {
        let attempt = entry.retry_count.saturating_add(1);
        let dead_letter = self.retry.is_exhausted(attempt);
        if dead_letter {
            warn!(id = entry.id, table = %entry.table_name, attempts = attempt, %reason, "row out of retries");
        } else {
            debug!(id = entry.id, attempt, %reason, "row rejected, will retry");
        }
        RowFailure {
            id: entry.id,
            reason,
            retry_delay: self.retry.delay_for(attempt),
            dead_letter,
        }
    }
}
