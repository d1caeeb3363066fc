//! Engine lifecycle: install, provision, start, stop.

use crate::error::{SyncError, SyncResult};
use crate::processor::ChangeProcessor;
use crate::registry::{EntityRegistry, ShapeCatalog};
use crate::relay::{run_relay, run_timer};
use crate::stats::{EngineCounters, EngineStats};
use crate::wake::WakeQueue;
use crate::worker::Worker;
use elasticsync_search::{IndexProvisioner, ProvisionedIndex, SearchIndex};
use elasticsync_store::{ChangeLogStore, ClaimStrategy};
use elasticsync_types::{ConfigError, InstanceTag, SyncMode, SyncOptions, WorkerId};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Shortest period of the realtime retry sweep.
const MIN_SWEEP_PERIOD: Duration = Duration::from_secs(1);
/// Shortest pause before a worker retries opening its session.
const MIN_REOPEN_DELAY: Duration = Duration::from_secs(1);

/// Propagates captured row changes from the change log to the search index.
pub struct SyncEngine {
    /// Validated options.
    options: SyncOptions,
    /// Tag prefixed to every worker id of this process.
    instance: InstanceTag,
    /// Change log shared by every worker.
    store: Arc<dyn ChangeLogStore>,
    /// Index engine written to by every worker.
    search: Arc<dyn SearchIndex>,
    /// Table → index dispatch.
    registry: Arc<EntityRegistry>,
    counters: Arc<EngineCounters>,
    running: Arc<AtomicBool>,
    /// Wake queue of the current run, for status reporting.
    queue: Mutex<Option<Arc<WakeQueue>>>,
}

impl SyncEngine {
    /// Creates an engine. Fails on invalid options, an `EntityType` with no
    /// shape in `shapes`, or a claim timeout no longer than the index
    /// client's request timeout.
    pub fn new(
        options: SyncOptions,
        store: Arc<dyn ChangeLogStore>,
        search: Arc<dyn SearchIndex>,
        shapes: &ShapeCatalog,
    ) -> SyncResult<Self> {
        options.validate()?;
        let outlived = search
            .request_timeout()
            .filter(|timeout| options.is_multi_worker() && options.claim_timeout <= *timeout);
        if let Some(request_timeout) = outlived {
            return Err(ConfigError::Invalid(format!(
                "ClaimTimeoutInSeconds ({}s) must be longer than the search request timeout ({}s)",
                options.claim_timeout.as_secs(),
                request_timeout.as_secs()
            ))
            .into());
        }
        let registry = EntityRegistry::build(&options.entities, shapes)?;
        Ok(Self {
            options,
            instance: InstanceTag::new(),
            store,
            search,
            registry: Arc::new(registry),
            counters: Arc::new(EngineCounters::new()),
            running: Arc::new(AtomicBool::new(false)),
            queue: Mutex::new(None),
        })
    }

    /// Replaces the generated instance tag.
    pub fn with_instance(mut self, instance: InstanceTag) -> Self {
        self.instance = instance;
        self
    }

    pub fn options(&self) -> &SyncOptions {
        &self.options
    }

    pub fn instance(&self) -> &InstanceTag {
        &self.instance
    }

    pub fn registry(&self) -> &EntityRegistry {
        &self.registry
    }

    pub fn store(&self) -> &Arc<dyn ChangeLogStore> {
        &self.store
    }

    /// Identifiers of the workers `start` spawns.
    pub fn worker_ids(&self) -> Vec<WorkerId> {
        (0..self.options.worker_count())
            .map(|n| WorkerId::new(&self.instance, n))
            .collect()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Installs the change-log table and capture triggers.
    pub async fn install(&self) -> SyncResult<()> {
        self.store
            .install(&self.options.entities)
            .await
            .map_err(SyncError::Ddl)?;
        info!(tables = self.options.entities.len(), "capture installed");
        Ok(())
    }

    /// Creates missing indices and version aliases.
    pub async fn ensure_indices(&self) -> SyncResult<Vec<ProvisionedIndex>> {
        IndexProvisioner::new(Arc::clone(&self.search))
            .ensure_indices(&self.options.entities)
            .await
            .map_err(SyncError::Provision)
    }

    /// Spawns the workers and the wake-token producers.
    ///
    /// Must be called from within a tokio runtime. One token per worker is
    /// queued immediately so rows captured while the engine was down drain
    /// without waiting for a notification.
    pub fn start(&self) -> SyncResult<EngineHandle> {
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(SyncError::AlreadyRunning);
        }

        let queue = Arc::new(WakeQueue::default());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let processor = Arc::new(ChangeProcessor::new(
            Arc::clone(&self.registry),
            Arc::clone(&self.search),
            self.options.retry,
            Arc::clone(&self.counters),
        ));
        let strategy = if self.options.is_multi_worker() {
            ClaimStrategy::SkipLocked {
                claim_timeout: self.options.claim_timeout,
            }
        } else {
            ClaimStrategy::SingleWorker
        };
        let worker_count = self.options.worker_count();

        let mut tasks = Vec::with_capacity(worker_count + 2);
        for id in self.worker_ids() {
            let worker = Worker {
                id,
                strategy,
                batch_size: self.options.worker_batch_size(),
                reopen_delay: self.options.retry.base_delay.max(MIN_REOPEN_DELAY),
                store: Arc::clone(&self.store),
                processor: Arc::clone(&processor),
                queue: Arc::clone(&queue),
                shutdown: shutdown_rx.clone(),
            };
            tasks.push(tokio::spawn(worker.run()));
        }

        match self.options.mode {
            SyncMode::Interval { interval, .. } => {
                tasks.push(tokio::spawn(run_timer(
                    Arc::clone(&queue),
                    interval,
                    shutdown_rx.clone(),
                )));
            }
            SyncMode::Realtime { .. } => {
                tasks.push(tokio::spawn(run_relay(
                    Arc::clone(&self.store),
                    Arc::clone(&queue),
                    worker_count,
                    Arc::clone(&self.counters),
                    shutdown_rx.clone(),
                )));
                // Backed-off rows and abandoned claims produce no notification.
                let sweep = self.options.retry.base_delay.max(MIN_SWEEP_PERIOD);
                tasks.push(tokio::spawn(run_timer(
                    Arc::clone(&queue),
                    sweep,
                    shutdown_rx.clone(),
                )));
            }
        }

        queue.push(worker_count);
        *self.queue.lock().unwrap_or_else(|e| e.into_inner()) = Some(Arc::clone(&queue));

        info!(
            instance = %self.instance,
            mode = mode_name(&self.options.mode),
            workers = worker_count,
            "sync engine started"
        );
        Ok(EngineHandle {
            shutdown: shutdown_tx,
            queue,
            tasks,
            running: Arc::clone(&self.running),
        })
    }

    /// Current status and counters.
    pub fn stats(&self) -> EngineStats {
        let queued_wakeups = self
            .queue
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .map_or(0, |queue| queue.pending());
        EngineStats {
            instance: self.instance.to_string(),
            running: self.is_running(),
            mode: mode_name(&self.options.mode),
            workers: self.options.worker_count(),
            queued_wakeups,
            counters: self.counters.snapshot(),
        }
    }
}

fn mode_name(mode: &SyncMode) -> &'static str {
    match mode {
        SyncMode::Realtime { .. } => "realtime",
        SyncMode::Interval { .. } => "interval",
    }
}

/// Handle to a started engine. Dropping it signals shutdown without waiting;
/// the engine stays marked running, so only [`EngineHandle::stop`] allows a
/// restart.
pub struct EngineHandle {
    shutdown: watch::Sender<bool>,
    queue: Arc<WakeQueue>,
    tasks: Vec<JoinHandle<()>>,
    running: Arc<AtomicBool>,
}

impl EngineHandle {
    /// Queues `count` extra wake tokens. Returns how many fit.
    pub fn wake(&self, count: usize) -> usize {
        self.queue.push(count)
    }

    /// Signals shutdown and waits for every task. In-flight batches finish
    /// their current statement first.
    pub async fn stop(mut self) {
        self.signal();
        let tasks = std::mem::take(&mut self.tasks);
        for result in futures::future::join_all(tasks).await {
            if let Err(e) = result {
                warn!(error = %e, "engine task ended abnormally");
            }
        }
        self.running.store(false, Ordering::SeqCst);
        info!("sync engine stopped");
    }

    fn signal(&self) {
        // Receivers may already be gone.
        let _ = self.shutdown.send(true);
        self.queue.close();
    }
}

impl Drop for EngineHandle {
    fn drop(&mut self) {
        if !self.tasks.is_empty() {
            self.signal();
        }
    }
}
