//! Engine counters.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Monotonic counters shared by every worker and the relay.
#[derive(Debug, Default)]
pub struct EngineCounters {
    batches: AtomicU64,
    processed: AtomicU64,
    failed: AtomicU64,
    dead_lettered: AtomicU64,
    transport_errors: AtomicU64,
    notifications: AtomicU64,
}

impl EngineCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_batch(&self, processed: usize, failed: usize, dead_lettered: usize) {
        self.batches.fetch_add(1, Ordering::Relaxed);
        self.processed.fetch_add(processed as u64, Ordering::Relaxed);
        self.failed.fetch_add(failed as u64, Ordering::Relaxed);
        self.dead_lettered
            .fetch_add(dead_lettered as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_transport_error(&self) {
        self.transport_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_notification(&self) {
        self.notifications.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            batches: self.batches.load(Ordering::Relaxed),
            processed: self.processed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            dead_lettered: self.dead_lettered.load(Ordering::Relaxed),
            transport_errors: self.transport_errors.load(Ordering::Relaxed),
            notifications: self.notifications.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`EngineCounters`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CounterSnapshot {
    /// Batches that claimed at least one row.
    pub batches: u64,
    pub processed: u64,
    /// Rows rejected by the index, including those dead-lettered for it.
    pub failed: u64,
    /// Rows dead-lettered, whether unmappable or out of retries.
    pub dead_lettered: u64,
    pub transport_errors: u64,
    pub notifications: u64,
}

/// Engine status as reported by `SyncEngine::stats`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineStats {
    pub instance: String,
    pub running: bool,
    pub mode: &'static str,
    pub workers: usize,
    pub queued_wakeups: usize,
    #[serde(flatten)]
    pub counters: CounterSnapshot,
}
