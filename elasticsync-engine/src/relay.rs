//! Wake-token producers: the notification relay and the poll timer.

use crate::stats::EngineCounters;
use crate::wake::WakeQueue;
use elasticsync_store::ChangeLogStore;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// Pause before resubscribing after the listener fails.
pub const RESUBSCRIBE_DELAY: Duration = Duration::from_secs(1);

/// Forwards change-log notifications as wake tokens.
///
/// Every notification pushes `fan_out` tokens, one per worker. A failed
/// subscription is logged and retried after [`RESUBSCRIBE_DELAY`]; the relay
/// only returns on shutdown.
pub(crate) async fn run_relay(
    store: Arc<dyn ChangeLogStore>,
    queue: Arc<WakeQueue>,
    fan_out: usize,
    counters: Arc<EngineCounters>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        if *shutdown.borrow() {
            return;
        }

        let subscribed = tokio::select! {
            _ = shutdown.changed() => return,
            result = store.subscribe() => result,
        };

        match subscribed {
            Ok(mut subscription) => {
                info!("listening for change-log notifications");
                loop {
                    let received = tokio::select! {
                        _ = shutdown.changed() => return,
                        received = subscription.recv() => received,
                    };
                    match received {
                        Ok(notification) => {
                            counters.record_notification();
                            let added = queue.push(fan_out);
                            debug!(table = %notification.table_name, added, "change-log notification");
                        }
                        Err(e) => {
                            warn!(error = %e, "notification listener failed, resubscribing");
                            break;
                        }
                    }
                }
            }
            Err(e) => warn!(error = %e, "failed to subscribe to change-log notifications"),
        }

        tokio::select! {
            _ = shutdown.changed() => return,
            _ = tokio::time::sleep(RESUBSCRIBE_DELAY) => {}
        }
    }
}

/// Pushes one wake token every `period` until shutdown.
///
/// The first tick is skipped; startup catch-up covers it.
pub(crate) async fn run_timer(
    queue: Arc<WakeQueue>,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = shutdown.changed() => return,
            _ = ticker.tick() => {
                queue.push(1);
            }
        }
    }
}
