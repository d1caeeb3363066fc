//! Table → index dispatch.
//!
//! The registry is built once at startup from the tracked entities and a
//! catalog of document shapes. Each shape is a plain function pointer that
//! round-trips a payload through a Rust type, so a row that does not fit its
//! entity type is caught before it reaches the index.

use elasticsync_search::BulkAction;
use elasticsync_types::{ChangeLogEntry, ConfigError, TrackedEntity};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;

/// Converts a captured row image into the indexed document.
pub type ShapeFn = fn(Value) -> Result<Value, serde_json::Error>;

/// A named document shape.
#[derive(Clone, Copy)]
pub struct DocumentShape {
    name: &'static str,
    shape: ShapeFn,
}

impl DocumentShape {
    /// Shape that deserializes the payload into `T` and serializes it back.
    pub fn of<T: DeserializeOwned + Serialize>() -> Self {
        Self {
            name: std::any::type_name::<T>(),
            shape: round_trip::<T>,
        }
    }

    /// Shape that indexes the row image as captured.
    pub fn passthrough() -> Self {
        Self {
            name: "passthrough",
            shape: Ok,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn apply(&self, payload: Value) -> Result<Value, serde_json::Error> {
        (self.shape)(payload)
    }
}

impl fmt::Debug for DocumentShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("DocumentShape").field(&self.name).finish()
    }
}

fn round_trip<T: DeserializeOwned + Serialize>(payload: Value) -> Result<Value, serde_json::Error> {
    let typed: T = serde_json::from_value(payload)?;
    serde_json::to_value(typed)
}

/// Document shapes the host makes available to `EntityType` settings.
#[derive(Debug, Clone, Default)]
pub struct ShapeCatalog {
    shapes: HashMap<String, DocumentShape>,
}

impl ShapeCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `T` under `name`.
    pub fn register<T: DeserializeOwned + Serialize>(mut self, name: impl Into<String>) -> Self {
        self.shapes.insert(name.into(), DocumentShape::of::<T>());
        self
    }

    /// Registers an existing shape under `name`.
    pub fn register_shape(mut self, name: impl Into<String>, shape: DocumentShape) -> Self {
        self.shapes.insert(name.into(), shape);
        self
    }

    /// Registers a hand-written shape function under `name`.
    pub fn register_fn(mut self, name: &'static str, shape: ShapeFn) -> Self {
        self.shapes
            .insert(name.to_string(), DocumentShape { name, shape });
        self
    }

    /// Exact match first, then case-insensitive.
    pub fn get(&self, name: &str) -> Option<DocumentShape> {
        self.shapes.get(name).copied().or_else(|| {
            self.shapes
                .iter()
                .find(|(key, _)| key.eq_ignore_ascii_case(name))
                .map(|(_, shape)| *shape)
        })
    }

    pub fn len(&self) -> usize {
        self.shapes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shapes.is_empty()
    }
}

/// Everything needed to turn one change-log row into a bulk action.
#[derive(Debug, Clone)]
pub struct EntityDescriptor {
    pub table: String,
    /// Concrete index documents are written to.
    pub index: String,
    /// Payload field holding the document id; `record_id` is used when absent.
    pub key_field: Option<String>,
    pub shape: DocumentShape,
}

impl EntityDescriptor {
    fn from_entity(entity: &TrackedEntity, shapes: &ShapeCatalog) -> Result<Self, ConfigError> {
        let shape = match &entity.entity_type {
            Some(name) => shapes.get(name).ok_or_else(|| ConfigError::UnknownEntityType {
                table: entity.table.clone(),
                entity_type: name.clone(),
            })?,
            None => DocumentShape::passthrough(),
        };
        Ok(Self {
            table: entity.table.clone(),
            index: entity.target_index(),
            key_field: entity.primary_key.clone(),
            shape,
        })
    }

    /// Maps a row to its bulk action, or returns the reason it cannot be
    /// indexed.
    pub fn to_action(&self, entry: &ChangeLogEntry) -> Result<BulkAction, String> {
        if entry.operation.is_delete() {
            let id = self
                .document_id(&entry.payload, entry)
                .ok_or_else(|| self.missing_key_reason())?;
            return Ok(BulkAction::Delete {
                index: self.index.clone(),
                id,
            });
        }

        if !entry.payload.is_object() {
            return Err(format!(
                "payload for {} row {} is not a JSON object",
                entry.table_name, entry.record_id
            ));
        }
        let document = self.shape.apply(entry.payload.clone()).map_err(|e| {
            format!(
                "payload does not match document shape {}: {e}",
                self.shape.name()
            )
        })?;
        let id = self
            .document_id(&document, entry)
            .or_else(|| self.document_id(&entry.payload, entry))
            .ok_or_else(|| self.missing_key_reason())?;

        Ok(BulkAction::Index {
            index: self.index.clone(),
            id,
            document,
        })
    }

    fn document_id(&self, document: &Value, entry: &ChangeLogEntry) -> Option<String> {
        match &self.key_field {
            Some(field) => key_value(document, field),
            None if entry.record_id.is_empty() => None,
            None => Some(entry.record_id.clone()),
        }
    }

    fn missing_key_reason(&self) -> String {
        match &self.key_field {
            Some(field) => format!("no primary-key value in field {field:?}"),
            None => "no primary-key value captured".to_string(),
        }
    }
}

/// Reads `field` from an object (exact, then case-insensitive) as text.
fn key_value(document: &Value, field: &str) -> Option<String> {
    let object = document.as_object()?;
    let value = object.get(field).or_else(|| {
        object
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(field))
            .map(|(_, value)| value)
    })?;
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// Static table → descriptor map.
#[derive(Debug, Clone, Default)]
pub struct EntityRegistry {
    by_table: HashMap<String, EntityDescriptor>,
    by_lower: HashMap<String, String>,
}

impl EntityRegistry {
    /// Builds the registry, failing on entity types with no registered shape.
    pub fn build(entities: &[TrackedEntity], shapes: &ShapeCatalog) -> Result<Self, ConfigError> {
        let mut registry = Self::default();
        for entity in entities {
            let descriptor = EntityDescriptor::from_entity(entity, shapes)?;
            registry
                .by_lower
                .insert(entity.table.to_lowercase(), entity.table.clone());
            registry.by_table.insert(entity.table.clone(), descriptor);
        }
        Ok(registry)
    }

    /// Resolves a table name, exact first.
    pub fn lookup(&self, table_name: &str) -> Option<&EntityDescriptor> {
        self.by_table.get(table_name).or_else(|| {
            self.by_lower
                .get(&table_name.to_lowercase())
                .and_then(|table| self.by_table.get(table))
        })
    }

    /// Maps a row, treating an unknown table as a rejection.
    pub fn map(&self, entry: &ChangeLogEntry) -> Result<BulkAction, String> {
        match self.lookup(&entry.table_name) {
            Some(descriptor) => descriptor.to_action(entry),
            None => Err(ConfigError::UnmappedTable(entry.table_name.clone()).to_string()),
        }
    }

    pub fn len(&self) -> usize {
        self.by_table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_table.is_empty()
    }
}
