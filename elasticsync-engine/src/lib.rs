//! Sync engine for ElasticSync.
//!
//! - [`SyncEngine`]: lifecycle (install, provision, start) and status
//! - [`EngineHandle`]: stops a running engine
//! - [`EntityRegistry`] / [`ShapeCatalog`]: table → index dispatch
//! - [`ChangeProcessor`]: one claim-map-write-reconcile step
//! - [`WakeQueue`]: bounded wake tokens shared by the relay and workers

mod engine;
mod error;
mod processor;
mod registry;
mod relay;
mod stats;
mod wake;
mod worker;

pub use engine::{EngineHandle, SyncEngine};
pub use error::{SyncError, SyncResult};
pub use processor::{BatchOutcome, BatchReport, ChangeProcessor};
pub use registry::{DocumentShape, EntityDescriptor, EntityRegistry, ShapeCatalog, ShapeFn};
pub use relay::RESUBSCRIBE_DELAY;
pub use stats::{CounterSnapshot, EngineCounters, EngineStats};
pub use wake::{WakeQueue, WAKE_QUEUE_CAPACITY};
