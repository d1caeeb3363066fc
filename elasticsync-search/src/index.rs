//! Index engine abstraction.
//!
//! The engine writes through [`SearchIndex`], so it runs unchanged against
//! Elasticsearch or the in-memory [`mock::MockSearchIndex`].

use crate::bulk::{BulkRequest, BulkResponse};
use crate::error::SearchResult;
use async_trait::async_trait;
use std::time::Duration;

/// The operations the sync engine needs from an index engine.
#[async_trait]
pub trait SearchIndex: Send + Sync {
    /// Upper bound on one request, when the client enforces one.
    fn request_timeout(&self) -> Option<Duration> {
        None
    }

    /// Whether the index (or an alias of that name) exists.
    async fn index_exists(&self, index: &str) -> SearchResult<bool>;

    /// Creates an index with default settings. Succeeds if it already exists.
    async fn create_index(&self, index: &str) -> SearchResult<()>;

    /// Points `alias` at `index`.
    async fn put_alias(&self, index: &str, alias: &str) -> SearchResult<()>;

    /// Submits one bulk call. A returned response always has one item per action.
    async fn bulk(&self, request: &BulkRequest) -> SearchResult<BulkResponse>;
}

/// An in-memory index for testing.
pub mod mock {
    use super::*;
    use crate::bulk::{BulkAction, BulkItemResult};
    use crate::error::SearchError;
    use serde_json::Value;
    use std::collections::{BTreeMap, HashMap};
    use std::sync::{Arc, Mutex, MutexGuard};

    #[derive(Default)]
    struct MockState {
        indices: BTreeMap<String, BTreeMap<String, Value>>,
        aliases: BTreeMap<String, String>,
        rejections: HashMap<String, (u16, String)>,
        transport_failures: usize,
        provision_failure: Option<String>,
        request_timeout: Option<Duration>,
        bulk_calls: usize,
        bulk_actions: usize,
    }

    /// Index engine state held in memory. Clones share state.
    #[derive(Clone, Default)]
    pub struct MockSearchIndex {
        state: Arc<Mutex<MockState>>,
    }

    impl MockSearchIndex {
        pub fn new() -> Self {
            Self::default()
        }

        fn state(&self) -> MutexGuard<'_, MockState> {
            self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
        }

        fn resolve(state: &MockState, name: &str) -> String {
            state
                .aliases
                .get(name)
                .cloned()
                .unwrap_or_else(|| name.to_string())
        }

        /// Rejects every write or delete of document `id` with `status`.
        pub fn reject_id(&self, id: &str, status: u16, reason: &str) {
            self.state()
                .rejections
                .insert(id.to_string(), (status, reason.to_string()));
        }

        /// Stops rejecting document `id`.
        pub fn accept_id(&self, id: &str) {
            self.state().rejections.remove(id);
        }

        /// Fails the next `count` bulk calls as a whole.
        pub fn fail_next_bulk(&self, count: usize) {
            self.state().transport_failures = count;
        }

        /// Reports `timeout` as the per-request timeout.
        pub fn set_request_timeout(&self, timeout: Duration) {
            self.state().request_timeout = Some(timeout);
        }

        /// Makes index creation fail with `reason`.
        pub fn fail_provisioning(&self, reason: &str) {
            self.state().provision_failure = Some(reason.to_string());
        }

        /// Stored document, looked up through aliases.
        pub fn document(&self, index: &str, id: &str) -> Option<Value> {
            let state = self.state();
            let index = Self::resolve(&state, index);
            state.indices.get(&index).and_then(|docs| docs.get(id)).cloned()
        }

        /// Number of documents in an index.
        pub fn document_count(&self, index: &str) -> usize {
            let state = self.state();
            let index = Self::resolve(&state, index);
            state.indices.get(&index).map_or(0, BTreeMap::len)
        }

        /// Names of concrete indices.
        pub fn indices(&self) -> Vec<String> {
            self.state().indices.keys().cloned().collect()
        }

        /// The index an alias points at.
        pub fn alias_target(&self, alias: &str) -> Option<String> {
            self.state().aliases.get(alias).cloned()
        }

        /// Bulk calls received, including failed ones.
        pub fn bulk_calls(&self) -> usize {
            self.state().bulk_calls
        }

        /// Actions received across all successful bulk calls.
        pub fn bulk_actions(&self) -> usize {
            self.state().bulk_actions
        }
    }

    #[async_trait]
    impl SearchIndex for MockSearchIndex {
        fn request_timeout(&self) -> Option<Duration> {
            self.state().request_timeout
        }

        async fn index_exists(&self, index: &str) -> SearchResult<bool> {
            let state = self.state();
            Ok(state.indices.contains_key(index) || state.aliases.contains_key(index))
        }

        async fn create_index(&self, index: &str) -> SearchResult<()> {
            let mut state = self.state();
            if let Some(reason) = &state.provision_failure {
                return Err(SearchError::Provision {
                    index: index.to_string(),
                    reason: reason.clone(),
                });
            }
            state.indices.entry(index.to_string()).or_default();
            Ok(())
        }

        async fn put_alias(&self, index: &str, alias: &str) -> SearchResult<()> {
            let mut state = self.state();
            if !state.indices.contains_key(index) {
                return Err(SearchError::Provision {
                    index: index.to_string(),
                    reason: "index_not_found_exception".into(),
                });
            }
            state.aliases.insert(alias.to_string(), index.to_string());
            Ok(())
        }

        async fn bulk(&self, request: &BulkRequest) -> SearchResult<BulkResponse> {
            let mut state = self.state();
            state.bulk_calls += 1;
            if state.transport_failures > 0 {
                state.transport_failures -= 1;
                return Err(SearchError::Transport("503 Service Unavailable".into()));
            }
            state.bulk_actions += request.len();

            let mut items = Vec::with_capacity(request.len());
            for action in request.actions() {
                if let Some((status, reason)) = state.rejections.get(action.id()).cloned() {
                    items.push(BulkItemResult::failed(action.op(), action.id(), status, reason));
                    continue;
                }
                let index = Self::resolve(&state, action.index());
                let docs = state.indices.entry(index).or_default();
                let item = match action {
                    BulkAction::Index { id, document, .. } => {
                        let status = if docs.insert(id.clone(), document.clone()).is_some() {
                            200
                        } else {
                            201
                        };
                        BulkItemResult::ok(action.op(), id, status)
                    }
                    BulkAction::Delete { id, .. } => {
                        let status = if docs.remove(id).is_some() { 200 } else { 404 };
                        BulkItemResult::ok(action.op(), id, status)
                    }
                };
                items.push(item);
            }

            Ok(BulkResponse {
                took: 1,
                items,
            })
        }
    }
}
