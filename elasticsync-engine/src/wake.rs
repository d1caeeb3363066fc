//! Content-free wake tokens shared by the relay, the timer and the workers.

use std::sync::Mutex;
use tokio::sync::Semaphore;

/// Tokens a queue holds before further pushes are dropped.
pub const WAKE_QUEUE_CAPACITY: usize = 1000;

/// Bounded counting queue.
///
/// Tokens carry no data, so dropping the oldest on overflow is the same as
/// saturating the count at capacity.
#[derive(Debug)]
pub struct WakeQueue {
    permits: Semaphore,
    capacity: usize,
    push_lock: Mutex<()>,
}

impl WakeQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            permits: Semaphore::new(0),
            capacity,
            push_lock: Mutex::new(()),
        }
    }

    /// Adds up to `count` tokens and returns how many were added.
    pub fn push(&self, count: usize) -> usize {
        let _guard = self.push_lock.lock().unwrap_or_else(|e| e.into_inner());
        if self.permits.is_closed() {
            return 0;
        }
        let room = self.capacity.saturating_sub(self.permits.available_permits());
        let added = count.min(room);
        if added > 0 {
            self.permits.add_permits(added);
        }
        added
    }

    /// Waits for one token. Returns `false` once the queue is closed.
    pub async fn wait(&self) -> bool {
        match self.permits.acquire().await {
            Ok(permit) => {
                permit.forget();
                true
            }
            Err(_) => false,
        }
    }

    /// Wakes every waiter with `false` and rejects further pushes.
    pub fn close(&self) {
        self.permits.close();
    }

    pub fn is_closed(&self) -> bool {
        self.permits.is_closed()
    }

    /// Tokens currently queued.
    pub fn pending(&self) -> usize {
        self.permits.available_permits()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl Default for WakeQueue {
    fn default() -> Self {
        Self::new(WAKE_QUEUE_CAPACITY)
    }
}
