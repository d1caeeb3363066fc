//! In-memory change log.
//!
//! Applies the same eligibility and claim rules as the Postgres store under a
//! single mutex, which makes claims trivially disjoint. Used by the engine's
//! tests and by hosts that embed the engine without a database.

use crate::error::{StoreError, StoreResult};
use crate::store::{
    ChangeLogSession, ChangeLogStats, ChangeLogStore, ClaimStrategy, Notification,
    NotificationSubscription, RowFailure, RowReject,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use elasticsync_types::{ChangeLogEntry, ChangeOperation, TrackedEntity, WorkerId};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::broadcast;
use tracing::warn;

const NOTIFY_CAPACITY: usize = 1024;

/// Converts to chrono, saturating at a century so date arithmetic cannot overflow.
fn span(duration: std::time::Duration) -> chrono::Duration {
    let cap = chrono::Duration::days(36_500);
    chrono::Duration::from_std(duration).map_or(cap, |d| d.min(cap))
}

#[derive(Default)]
struct LogState {
    entries: Vec<ChangeLogEntry>,
    next_id: i64,
    installed: Vec<String>,
    /// Added to wall-clock time, so tests can skip past backoff delays.
    clock_offset: chrono::Duration,
    failing_claims: usize,
    failing_opens: usize,
}

impl LogState {
    fn now(&self) -> DateTime<Utc> {
        Utc::now() + self.clock_offset
    }

    fn entry_mut(&mut self, id: i64) -> Option<&mut ChangeLogEntry> {
        self.entries.iter_mut().find(|entry| entry.id == id)
    }
}

struct Shared {
    state: Mutex<LogState>,
    notify: Mutex<broadcast::Sender<String>>,
    claim_calls: AtomicU64,
    open_calls: AtomicU64,
    subscriptions: AtomicUsize,
}

impl Shared {
    fn state(&self) -> MutexGuard<'_, LogState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn sender(&self) -> MutexGuard<'_, broadcast::Sender<String>> {
        self.notify.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn signal(&self, table_name: &str) {
        // No receivers is fine: nobody is listening yet.
        let _ = self.sender().send(table_name.to_string());
    }
}

/// Change log held in process memory.
#[derive(Clone)]
pub struct MemoryChangeLogStore {
    shared: Arc<Shared>,
}

impl Default for MemoryChangeLogStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryChangeLogStore {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(NOTIFY_CAPACITY);
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(LogState {
                    next_id: 1,
                    ..LogState::default()
                }),
                notify: Mutex::new(tx),
                claim_calls: AtomicU64::new(0),
                open_calls: AtomicU64::new(0),
                subscriptions: AtomicUsize::new(0),
            }),
        }
    }

    /// Appends an entry as the capture trigger would, and notifies listeners.
    pub fn capture(
        &self,
        table_name: &str,
        operation: ChangeOperation,
        record_id: &str,
        payload: serde_json::Value,
    ) -> i64 {
        let id = {
            let mut state = self.shared.state();
            let id = state.next_id;
            state.next_id += 1;
            let mut entry = ChangeLogEntry::new(id, table_name, operation, record_id, payload);
            entry.created_at = state.now();
            state.entries.push(entry);
            id
        };
        self.shared.signal(table_name);
        id
    }

    /// Snapshot of one entry.
    pub fn entry(&self, id: i64) -> Option<ChangeLogEntry> {
        self.shared.state().entries.iter().find(|e| e.id == id).cloned()
    }

    /// Snapshot of every entry, in capture order.
    pub fn entries(&self) -> Vec<ChangeLogEntry> {
        self.shared.state().entries.clone()
    }

    /// Tables passed to the last [`ChangeLogStore::install`] call.
    pub fn installed_tables(&self) -> Vec<String> {
        self.shared.state().installed.clone()
    }

    /// Number of claim calls made across all sessions.
    pub fn claim_calls(&self) -> u64 {
        self.shared.claim_calls.load(Ordering::SeqCst)
    }

    /// Number of session opens attempted, including failed ones.
    pub fn open_calls(&self) -> u64 {
        self.shared.open_calls.load(Ordering::SeqCst)
    }

    /// Number of subscriptions opened so far.
    pub fn subscription_count(&self) -> usize {
        self.shared.subscriptions.load(Ordering::SeqCst)
    }

    /// Moves the store's clock forward.
    pub fn advance_clock(&self, by: chrono::Duration) {
        self.shared.state().clock_offset += by;
    }

    /// Ends every open subscription with an error. Later subscriptions work.
    pub fn disconnect_listeners(&self) {
        let (tx, _) = broadcast::channel(NOTIFY_CAPACITY);
        *self.shared.sender() = tx;
    }

    /// Makes the next `count` claim calls fail.
    pub fn fail_next_claims(&self, count: usize) {
        self.shared.state().failing_claims = count;
    }

    /// Makes the next `count` session opens fail.
    pub fn fail_next_opens(&self, count: usize) {
        self.shared.state().failing_opens = count;
    }

    /// Mutates one entry in place.
    pub fn update_entry(&self, id: i64, f: impl FnOnce(&mut ChangeLogEntry)) {
        if let Some(entry) = self.shared.state().entry_mut(id) {
            f(entry);
        }
    }
}

#[async_trait]
impl ChangeLogStore for MemoryChangeLogStore {
    async fn install(&self, entities: &[TrackedEntity]) -> StoreResult<()> {
        self.shared.state().installed = entities.iter().map(|e| e.table.clone()).collect();
        Ok(())
    }

    async fn open_session(
        &self,
        worker: &WorkerId,
        strategy: ClaimStrategy,
    ) -> StoreResult<Box<dyn ChangeLogSession>> {
        self.shared.open_calls.fetch_add(1, Ordering::SeqCst);
        {
            let mut state = self.shared.state();
            if state.failing_opens > 0 {
                state.failing_opens -= 1;
                return Err(StoreError::Unavailable("injected open failure".into()));
            }
        }
        Ok(Box::new(MemorySession {
            shared: Arc::clone(&self.shared),
            worker: worker.clone(),
            strategy,
        }))
    }

    async fn subscribe(&self) -> StoreResult<Box<dyn NotificationSubscription>> {
        let rx = self.shared.sender().subscribe();
        self.shared.subscriptions.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MemorySubscription { rx }))
    }

    async fn stats(&self) -> StoreResult<ChangeLogStats> {
        let state = self.shared.state();
        let mut stats = ChangeLogStats::default();
        for entry in &state.entries {
            if entry.processed {
                stats.processed += 1;
            } else if entry.dead_letter {
                stats.dead_lettered += 1;
            } else {
                stats.pending += 1;
                if entry.locked_by.is_some() {
                    stats.claimed += 1;
                }
                if entry.retry_count > 0 {
                    stats.retrying += 1;
                }
            }
        }
        Ok(stats)
    }

    async fn requeue_dead_letters(&self, ids: Option<&[i64]>) -> StoreResult<u64> {
        let requeued = {
            let mut state = self.shared.state();
            let mut requeued = 0;
            for entry in state.entries.iter_mut() {
                let selected = ids.is_none_or(|ids| ids.contains(&entry.id));
                if entry.dead_letter && !entry.processed && selected {
                    entry.dead_letter = false;
                    entry.retry_count = 0;
                    entry.next_retry_at = None;
                    entry.locked_by = None;
                    entry.locked_at = None;
                    requeued += 1;
                }
            }
            requeued
        };
        if requeued > 0 {
            self.shared.signal("");
        }
        Ok(requeued)
    }
}

/// A worker session over the shared in-memory log.
pub struct MemorySession {
    shared: Arc<Shared>,
    worker: WorkerId,
    strategy: ClaimStrategy,
}

impl MemorySession {
    /// Whether an outcome from this session may still be written to `entry`.
    fn owns(&self, entry: &ChangeLogEntry) -> bool {
        if entry.processed || entry.dead_letter {
            return false;
        }
        match self.strategy {
            ClaimStrategy::SingleWorker => true,
            ClaimStrategy::SkipLocked { .. } => {
                entry.locked_by.as_deref() == Some(self.worker.as_str())
            }
        }
    }

    /// Applies `update` to each owned row in `ids`, logging the rest.
    fn apply_outcome(
        &self,
        outcome: &str,
        ids: impl IntoIterator<Item = (i64, usize)>,
        mut update: impl FnMut(&mut ChangeLogEntry, usize, DateTime<Utc>),
    ) {
        let mut state = self.shared.state();
        let now = state.now();
        let mut skipped = 0usize;
        for (id, index) in ids {
            match state.entries.iter_mut().find(|entry| entry.id == id) {
                Some(entry) if self.owns(entry) => update(entry, index, now),
                _ => skipped += 1,
            }
        }
        if skipped > 0 {
            warn!(
                worker = %self.worker,
                skipped,
                outcome,
                "claim lost before outcome was recorded, rows left to their new owner"
            );
        }
    }
}

#[async_trait]
impl ChangeLogSession for MemorySession {
    fn worker_id(&self) -> &WorkerId {
        &self.worker
    }

    async fn claim(&mut self, batch_size: usize) -> StoreResult<Vec<ChangeLogEntry>> {
        self.shared.claim_calls.fetch_add(1, Ordering::SeqCst);
        let mut state = self.shared.state();
        if state.failing_claims > 0 {
            state.failing_claims -= 1;
            return Err(StoreError::Unavailable("injected claim failure".into()));
        }

        let now = state.now();
        let mut claimed = Vec::new();
        for entry in state.entries.iter_mut() {
            if claimed.len() >= batch_size {
                break;
            }
            match self.strategy {
                ClaimStrategy::SingleWorker => {
                    if entry.is_pending(now) {
                        claimed.push(entry.clone());
                    }
                }
                ClaimStrategy::SkipLocked { claim_timeout } => {
                    if entry.is_claimable(now, span(claim_timeout)) {
                        entry.locked_by = Some(self.worker.to_string());
                        entry.locked_at = Some(now);
                        entry.processed_by = Some(self.worker.to_string());
                        claimed.push(entry.clone());
                    }
                }
            }
        }
        Ok(claimed)
    }

    async fn mark_processed(&mut self, ids: &[i64]) -> StoreResult<()> {
        let rows = ids.iter().copied().zip(0..);
        self.apply_outcome("processed", rows, |entry, _, now| {
            entry.processed = true;
            entry.last_attempt_at = Some(now);
            entry.locked_by = None;
            entry.locked_at = None;
            entry.next_retry_at = None;
        });
        Ok(())
    }

    async fn mark_failed(&mut self, failures: &[RowFailure]) -> StoreResult<()> {
        let rows = failures.iter().map(|f| f.id).zip(0..);
        self.apply_outcome("failed", rows, |entry, index, now| {
            let failure = &failures[index];
            entry.retry_count += 1;
            entry.last_error = Some(failure.reason.clone());
            entry.last_attempt_at = Some(now);
            entry.locked_by = None;
            entry.locked_at = None;
            entry.dead_letter = failure.dead_letter;
            entry.next_retry_at = if failure.dead_letter {
                None
            } else {
                Some(now + span(failure.retry_delay))
            };
        });
        Ok(())
    }

    async fn dead_letter(&mut self, rejects: &[RowReject]) -> StoreResult<()> {
        let rows = rejects.iter().map(|r| r.id).zip(0..);
        self.apply_outcome("dead-lettered", rows, |entry, index, now| {
            entry.dead_letter = true;
            entry.last_error = Some(rejects[index].reason.clone());
            entry.last_attempt_at = Some(now);
            entry.locked_by = None;
            entry.locked_at = None;
            entry.next_retry_at = None;
        });
        Ok(())
    }
}

/// Receiver side of the in-memory notification channel.
pub struct MemorySubscription {
    rx: broadcast::Receiver<String>,
}

#[async_trait]
impl NotificationSubscription for MemorySubscription {
    async fn recv(&mut self) -> StoreResult<Notification> {
        match self.rx.recv().await {
            Ok(table_name) => Ok(Notification { table_name }),
            // Missed signals still mean there is work.
            Err(broadcast::error::RecvError::Lagged(_)) => Ok(Notification {
                table_name: String::new(),
            }),
            Err(broadcast::error::RecvError::Closed) => {
                Err(StoreError::Subscription("notification channel closed".into()))
            }
        }
    }
}
