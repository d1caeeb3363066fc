//! Worker loop: wait for a token, drain until no work remains.

use crate::error::SyncError;
use crate::processor::{BatchOutcome, ChangeProcessor};
use crate::wake::WakeQueue;
use elasticsync_store::{ChangeLogSession, ChangeLogStore, ClaimStrategy};
use elasticsync_types::WorkerId;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Everything one worker task owns.
pub(crate) struct Worker {
    pub id: WorkerId,
    pub strategy: ClaimStrategy,
    pub batch_size: usize,
    /// Wait before retrying a failed session open.
    pub reopen_delay: Duration,
    pub store: Arc<dyn ChangeLogStore>,
    pub processor: Arc<ChangeProcessor>,
    pub queue: Arc<WakeQueue>,
    pub shutdown: watch::Receiver<bool>,
}

impl Worker {
    pub(crate) async fn run(mut self) {
        info!(worker = %self.id, batch_size = self.batch_size, "worker started");
        let mut session: Option<Box<dyn ChangeLogSession>> = None;

        while self.queue.wait().await {
            if self.is_shutting_down() {
                break;
            }

            let mut current = match session.take() {
                Some(current) => current,
                None => match self.open_session().await {
                    Some(opened) => opened,
                    None => break,
                },
            };

            if self.drain(&mut *current).await {
                session = Some(current);
            } else {
                debug!(worker = %self.id, "session dropped");
            }
        }

        info!(worker = %self.id, "worker stopped");
    }

    /// Processes batches until a claim comes back empty. Returns `false`
    /// when the session must be replaced.
    async fn drain(&mut self, session: &mut dyn ChangeLogSession) -> bool {
        loop {
            if self.is_shutting_down() {
                return true;
            }
            match self.processor.process_batch(session, self.batch_size).await {
                Ok(BatchOutcome::Idle) => return true,
                Ok(BatchOutcome::Processed(_)) => {}
                // Already logged; the rows come back on a later wake.
                Err(SyncError::Transport(_)) => return true,
                Err(e) => {
                    warn!(worker = %self.id, error = %e, "change-log session failed");
                    return false;
                }
            }
        }
    }

    /// Opens a session, retrying until it succeeds. `None` means shutdown.
    async fn open_session(&mut self) -> Option<Box<dyn ChangeLogSession>> {
        loop {
            match self.store.open_session(&self.id, self.strategy).await {
                Ok(session) => return Some(session),
                Err(e) => {
                    warn!(worker = %self.id, error = %e, "failed to open change-log session");
                }
            }
            tokio::select! {
                _ = self.shutdown.changed() => return None,
                _ = tokio::time::sleep(self.reopen_delay) => {}
            }
            if self.is_shutting_down() {
                return None;
            }
        }
    }

    fn is_shutting_down(&self) -> bool {
        *self.shutdown.borrow()
    }
}
