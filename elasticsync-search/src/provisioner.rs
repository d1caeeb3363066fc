//! Ensures every tracked entity's index exists before workers write to it.

use crate::error::{SearchError, SearchResult};
use crate::index::SearchIndex;
use elasticsync_types::TrackedEntity;
use std::sync::Arc;
use tracing::info;

/// What provisioning did for one entity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProvisionedIndex {
    pub index: String,
    pub created: bool,
    pub alias: Option<String>,
}

/// Creates missing indices and version aliases.
pub struct IndexProvisioner {
    search: Arc<dyn SearchIndex>,
}

impl IndexProvisioner {
    pub fn new(search: Arc<dyn SearchIndex>) -> Self {
        Self { search }
    }

    /// Provisions one entity: create the concrete index if absent, then
    /// point the base name at it when a version is configured.
    pub async fn ensure_index(&self, entity: &TrackedEntity) -> SearchResult<ProvisionedIndex> {
        let index = entity.target_index();
        let created = if self.search.index_exists(&index).await? {
            false
        } else {
            self.search.create_index(&index).await?;
            true
        };

        let alias = entity.alias();
        if let Some(alias) = &alias {
            self.search.put_alias(&index, alias).await?;
        }

        info!(table = %entity.table, %index, created, alias = ?alias, "index ready");
        Ok(ProvisionedIndex {
            index,
            created,
            alias,
        })
    }

    /// Provisions every entity, stopping at the first failure.
    pub async fn ensure_indices(
        &self,
        entities: &[TrackedEntity],
    ) -> SearchResult<Vec<ProvisionedIndex>> {
        let mut provisioned = Vec::with_capacity(entities.len());
        for entity in entities {
            let result = self.ensure_index(entity).await.map_err(|e| match e {
                SearchError::Provision { .. } => e,
                other => SearchError::Provision {
                    index: entity.target_index(),
                    reason: other.to_string(),
                },
            })?;
            provisioned.push(result);
        }
        Ok(provisioned)
    }
}
