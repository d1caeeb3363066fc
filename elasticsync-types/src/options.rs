//! Engine options.
//!
//! `SyncOptions` is the validated, immutable configuration the engine runs
//! with. The sync mode is a tagged variant, so "realtime and interval at the
//! same time" cannot be expressed.

use crate::{ConfigError, TrackedEntity};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::time::Duration;

/// Rows fetched per batch in single-worker mode.
pub const DEFAULT_BATCH_SIZE: usize = 500;
/// Failed attempts before a row is dead-lettered.
pub const DEFAULT_MAX_RETRIES: i32 = 5;
/// Base delay before a failed row becomes eligible again.
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(5);
/// Poll period in interval mode.
pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(60);
/// Age after which an unreconciled claim is treated as abandoned.
pub const DEFAULT_CLAIM_TIMEOUT: Duration = Duration::from_secs(60);
/// Upper bound for exponential backoff.
pub const MAX_RETRY_DELAY: Duration = Duration::from_secs(60 * 60);
/// Default worker count when multiple workers are enabled.
pub const DEFAULT_WORKER_COUNT: usize = 2;
/// Default per-worker batch size when multiple workers are enabled.
pub const DEFAULT_WORKER_BATCH_SIZE: usize = 250;

/// How wake-ups are produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncMode {
    /// Wake on database notifications.
    Realtime { batch_size: usize },
    /// Wake on a fixed timer.
    Interval { interval: Duration, batch_size: usize },
}

impl SyncMode {
    #[must_use]
    pub const fn batch_size(&self) -> usize {
        match self {
            Self::Realtime { batch_size } | Self::Interval { batch_size, .. } => *batch_size,
        }
    }

    /// The poll period, in interval mode only.
    #[must_use]
    pub const fn poll_interval(&self) -> Option<Duration> {
        match self {
            Self::Interval { interval, .. } => Some(*interval),
            Self::Realtime { .. } => None,
        }
    }
}

impl Default for SyncMode {
    fn default() -> Self {
        Self::Realtime {
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }
}

/// Parallel worker settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct WorkerOptions {
    pub number_of_workers: usize,
    pub batch_size_per_worker: usize,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self {
            number_of_workers: DEFAULT_WORKER_COUNT,
            batch_size_per_worker: DEFAULT_WORKER_BATCH_SIZE,
        }
    }
}

/// Growth of the retry delay across attempts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Backoff {
    /// `base * 2^(attempt - 1)`, capped at [`MAX_RETRY_DELAY`].
    #[default]
    Exponential,
    /// Always `base`.
    Fixed,
}

/// Retry and dead-letter policy for rejected rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: i32,
    pub base_delay: Duration,
    pub backoff: Backoff,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            base_delay: DEFAULT_RETRY_DELAY,
            backoff: Backoff::default(),
        }
    }
}

impl RetryPolicy {
    /// Delay applied after failed attempt number `attempt` (1-based).
    #[must_use]
    pub fn delay_for(&self, attempt: i32) -> Duration {
        match self.backoff {
            Backoff::Fixed => self.base_delay,
            Backoff::Exponential => {
                let exponent = attempt.saturating_sub(1).clamp(0, 31) as u32;
                self.base_delay
                    .checked_mul(1u32 << exponent)
                    .map_or(MAX_RETRY_DELAY, |delay| delay.min(MAX_RETRY_DELAY))
            }
        }
    }

    /// Whether a row that has now failed `retry_count` times is dead.
    #[must_use]
    pub const fn is_exhausted(&self, retry_count: i32) -> bool {
        retry_count >= self.max_retries
    }
}

/// Validated engine options.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncOptions {
    pub mode: SyncMode,
    pub retry: RetryPolicy,
    pub claim_timeout: Duration,
    /// `Some` enables multi-worker mode with skip-locked claiming.
    pub workers: Option<WorkerOptions>,
    pub entities: Vec<TrackedEntity>,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            mode: SyncMode::default(),
            retry: RetryPolicy::default(),
            claim_timeout: DEFAULT_CLAIM_TIMEOUT,
            workers: None,
            entities: Vec::new(),
        }
    }
}

impl SyncOptions {
    /// Realtime (notification-driven) options.
    pub fn realtime(batch_size: usize) -> Self {
        Self {
            mode: SyncMode::Realtime { batch_size },
            ..Self::default()
        }
    }

    /// Interval (timer-driven) options.
    pub fn interval(interval: Duration, batch_size: usize) -> Self {
        Self {
            mode: SyncMode::Interval {
                interval,
                batch_size,
            },
            ..Self::default()
        }
    }

    pub fn with_workers(mut self, workers: WorkerOptions) -> Self {
        self.workers = Some(workers);
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_claim_timeout(mut self, timeout: Duration) -> Self {
        self.claim_timeout = timeout;
        self
    }

    pub fn with_entity(mut self, entity: TrackedEntity) -> Self {
        self.entities.push(entity);
        self
    }

    #[must_use]
    pub fn is_multi_worker(&self) -> bool {
        self.workers.is_some()
    }

    #[must_use]
    pub fn worker_count(&self) -> usize {
        self.workers.map_or(1, |w| w.number_of_workers)
    }

    /// Rows each worker claims per batch.
    #[must_use]
    pub fn worker_batch_size(&self) -> usize {
        self.workers
            .map_or(self.mode.batch_size(), |w| w.batch_size_per_worker)
    }

    /// Rejects zero sizes and delays, empty or duplicate entity lists and bad
    /// names.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.mode.batch_size() == 0 {
            return Err(ConfigError::Invalid("BatchSize must be greater than zero".into()));
        }
        if self.mode.poll_interval().is_some_and(|i| i.is_zero()) {
            return Err(ConfigError::Invalid(
                "IntervalInSeconds must be greater than zero".into(),
            ));
        }
        if let Some(workers) = self.workers {
            if workers.number_of_workers == 0 {
                return Err(ConfigError::Invalid(
                    "WorkerOptions.NumberOfWorkers must be greater than zero".into(),
                ));
            }
            if workers.batch_size_per_worker == 0 {
                return Err(ConfigError::Invalid(
                    "WorkerOptions.BatchSizePerWorker must be greater than zero".into(),
                ));
            }
        }
        if self.retry.max_retries < 1 {
            return Err(ConfigError::Invalid("MaxRetries must be at least 1".into()));
        }
        if self.retry.base_delay.is_zero() {
            return Err(ConfigError::Invalid(
                "RetryDelayInSeconds must be greater than zero".into(),
            ));
        }
        if self.claim_timeout.is_zero() {
            return Err(ConfigError::Invalid(
                "ClaimTimeoutInSeconds must be greater than zero".into(),
            ));
        }
        if self.entities.is_empty() {
            return Err(ConfigError::Missing("Entities"));
        }

        let mut tables = HashSet::new();
        for entity in &self.entities {
            entity.validate()?;
            if !tables.insert(entity.table.to_lowercase()) {
                return Err(ConfigError::Invalid(format!(
                    "table {} is tracked more than once",
                    entity.table
                )));
            }
        }
        Ok(())
    }
}
