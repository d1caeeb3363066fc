//! Tracked-table configuration.

use crate::ConfigError;
use serde::{Deserialize, Serialize};

/// A source table whose changes are propagated to a search index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct TrackedEntity {
    /// Table name as it exists in the database (case-sensitive).
    pub table: String,
    /// Primary-key column. Introspected at install time when absent.
    #[serde(default)]
    pub primary_key: Option<String>,
    /// Name of a registered document shape used to deserialize payloads.
    /// Payloads pass through untouched when absent.
    #[serde(default)]
    pub entity_type: Option<String>,
    /// Target index. Defaults to the lower-cased table name.
    #[serde(default)]
    pub index_name: Option<String>,
    /// Version suffix; when set the concrete index is `<name>-<version>`
    /// and `<name>` becomes an alias for it.
    #[serde(default)]
    pub index_version: Option<String>,
}

impl TrackedEntity {
    /// Tracks `table` with every other setting defaulted.
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            primary_key: None,
            entity_type: None,
            index_name: None,
            index_version: None,
        }
    }

    pub fn with_primary_key(mut self, column: impl Into<String>) -> Self {
        self.primary_key = Some(column.into());
        self
    }

    pub fn with_entity_type(mut self, name: impl Into<String>) -> Self {
        self.entity_type = Some(name.into());
        self
    }

    pub fn with_index_name(mut self, name: impl Into<String>) -> Self {
        self.index_name = Some(name.into());
        self
    }

    pub fn with_index_version(mut self, version: impl Into<String>) -> Self {
        self.index_version = Some(version.into());
        self
    }

    /// The index name without any version suffix.
    #[must_use]
    pub fn base_index_name(&self) -> String {
        match &self.index_name {
            Some(name) => name.clone(),
            None => self.table.to_lowercase(),
        }
    }

    /// The concrete index documents are written to.
    #[must_use]
    pub fn target_index(&self) -> String {
        match &self.index_version {
            Some(version) => format!("{}-{}", self.base_index_name(), version),
            None => self.base_index_name(),
        }
    }

    /// The alias pointing at the versioned index, if versioning is configured.
    #[must_use]
    pub fn alias(&self) -> Option<String> {
        self.index_version.as_ref().map(|_| self.base_index_name())
    }

    /// Checks the names are usable as a Postgres identifier and an index name.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.table.trim().is_empty() {
            return Err(ConfigError::Invalid("tracked entity has an empty table name".into()));
        }
        if self.primary_key.as_deref().is_some_and(|pk| pk.trim().is_empty()) {
            return Err(ConfigError::Invalid(format!(
                "table {}: primary key must not be empty",
                self.table
            )));
        }
        let index = self.target_index();
        if index.is_empty() {
            return Err(ConfigError::Invalid(format!(
                "table {}: index name must not be empty",
                self.table
            )));
        }
        if index != index.to_lowercase() {
            return Err(ConfigError::Invalid(format!(
                "table {}: index name {index:?} must be lower-case",
                self.table
            )));
        }
        if index.starts_with(['_', '-', '+'])
            || index.contains(['\\', '/', '*', '?', '"', '<', '>', '|', ' ', ',', '#', ':'])
        {
            return Err(ConfigError::Invalid(format!(
                "table {}: {index:?} is not a valid index name",
                self.table
            )));
        }
        Ok(())
    }
}
