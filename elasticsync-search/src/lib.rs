//! Index-engine side of ElasticSync.
//!
//! - [`SearchIndex`]: the operations the engine needs from an index engine
//! - [`ElasticClient`]: Elasticsearch over HTTP
//! - [`BulkRequest`] / [`BulkResponse`]: the `_bulk` wire model
//! - [`IndexProvisioner`]: creates indices and version aliases at startup
//! - [`index::mock::MockSearchIndex`]: an in-memory engine for tests

mod bulk;
mod client;
mod error;
pub mod index;
mod provisioner;

pub use bulk::{BulkAction, BulkItemResult, BulkOp, BulkRequest, BulkResponse};
pub use client::{ElasticClient, REQUEST_TIMEOUT};
pub use error::{SearchError, SearchResult};
pub use index::SearchIndex;
pub use provisioner::{IndexProvisioner, ProvisionedIndex};
