//! `_bulk` request and response model.
//!
//! A request is a list of index/delete actions serialized as NDJSON. The
//! response carries one status per action, in submission order.

use crate::error::{SearchError, SearchResult};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::collections::HashMap;

/// Kind of a bulk action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BulkOp {
    Index,
    Delete,
}

impl BulkOp {
    /// The action name used on the wire.
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Index => "index",
            Self::Delete => "delete",
        }
    }

    fn parse(name: &str) -> Option<Self> {
        match name {
            "index" | "create" | "update" => Some(Self::Index),
            "delete" => Some(Self::Delete),
            _ => None,
        }
    }
}

/// One action in a bulk request.
#[derive(Debug, Clone, PartialEq)]
pub enum BulkAction {
    /// Write (create or overwrite) a document by id.
    Index {
        index: String,
        id: String,
        document: Value,
    },
    /// Remove a document by id.
    Delete { index: String, id: String },
}

impl BulkAction {
    pub fn op(&self) -> BulkOp {
        match self {
            Self::Index { .. } => BulkOp::Index,
            Self::Delete { .. } => BulkOp::Delete,
        }
    }

    pub fn index(&self) -> &str {
        match self {
            Self::Index { index, .. } | Self::Delete { index, .. } => index,
        }
    }

    pub fn id(&self) -> &str {
        match self {
            Self::Index { id, .. } | Self::Delete { id, .. } => id,
        }
    }
}

/// An ordered batch of actions for one `_bulk` call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BulkRequest {
    actions: Vec<BulkAction>,
}

impl BulkRequest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, action: BulkAction) {
        self.actions.push(action);
    }

    pub fn index(&mut self, index: impl Into<String>, id: impl Into<String>, document: Value) {
        self.push(BulkAction::Index {
            index: index.into(),
            id: id.into(),
            document,
        });
    }

    pub fn delete(&mut self, index: impl Into<String>, id: impl Into<String>) {
        self.push(BulkAction::Delete {
            index: index.into(),
            id: id.into(),
        });
    }

    pub fn actions(&self) -> &[BulkAction] {
        &self.actions
    }

    pub fn len(&self) -> usize {
        self.actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    /// Serializes to the NDJSON body `_bulk` expects, trailing newline included.
    pub fn to_ndjson(&self) -> SearchResult<String> {
        let mut body = String::new();
        for action in &self.actions {
            let mut meta = Map::new();
            meta.insert(
                action.op().as_str().to_string(),
                json!({ "_index": action.index(), "_id": action.id() }),
            );
            body.push_str(&serde_json::to_string(&Value::Object(meta))?);
            body.push('\n');
            if let BulkAction::Index { document, .. } = action {
                body.push_str(&serde_json::to_string(document)?);
                body.push('\n');
            }
        }
        Ok(body)
    }
}

/// Result of one action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BulkItemResult {
    pub op: BulkOp,
    pub id: Option<String>,
    pub status: u16,
    /// Error reason reported by the engine, when the item failed.
    pub error: Option<String>,
}

impl BulkItemResult {
    pub fn ok(op: BulkOp, id: impl Into<String>, status: u16) -> Self {
        Self {
            op,
            id: Some(id.into()),
            status,
            error: None,
        }
    }

    pub fn failed(op: BulkOp, id: impl Into<String>, status: u16, reason: impl Into<String>) -> Self {
        Self {
            op,
            id: Some(id.into()),
            status,
            error: Some(reason.into()),
        }
    }

    /// 200/201, or 404 for a delete (the document is already gone).
    pub fn is_success(&self) -> bool {
        matches!(self.status, 200 | 201) || (self.op == BulkOp::Delete && self.status == 404)
    }

    /// A reason suitable for `last_error`.
    pub fn failure_reason(&self) -> String {
        match &self.error {
            Some(reason) => reason.clone(),
            None => format!("bulk item failed with status {}", self.status),
        }
    }
}

/// Parsed `_bulk` response.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BulkResponse {
    pub took: u64,
    pub items: Vec<BulkItemResult>,
}

#[derive(Debug, Deserialize)]
struct RawResponse {
    #[serde(default)]
    took: u64,
    #[serde(default)]
    items: Vec<HashMap<String, RawItem>>,
}

#[derive(Debug, Deserialize)]
struct RawItem {
    #[serde(rename = "_id")]
    id: Option<String>,
    status: u16,
    #[serde(default)]
    error: Option<Value>,
}

fn error_reason(error: &Value) -> String {
    match error {
        Value::String(s) => s.clone(),
        Value::Object(obj) => {
            let kind = obj.get("type").and_then(Value::as_str);
            let reason = obj.get("reason").and_then(Value::as_str);
            match (kind, reason) {
                (Some(kind), Some(reason)) => format!("{kind}: {reason}"),
                (Some(only), None) | (None, Some(only)) => only.to_string(),
                (None, None) => error.to_string(),
            }
        }
        other => other.to_string(),
    }
}

impl BulkResponse {
    /// Parses a response body and checks it has one item per submitted action.
    pub fn parse(body: &str, expected_items: usize) -> SearchResult<Self> {
        let raw: RawResponse = serde_json::from_str(body)?;

        let mut items = Vec::with_capacity(raw.items.len());
        for entry in raw.items {
            let (name, item) = entry
                .into_iter()
                .next()
                .ok_or_else(|| SearchError::Transport("bulk response item has no action".into()))?;
            let op = BulkOp::parse(&name).ok_or_else(|| {
                SearchError::Transport(format!("bulk response has unknown action {name:?}"))
            })?;
            items.push(BulkItemResult {
                op,
                id: item.id,
                status: item.status,
                error: item.error.as_ref().map(error_reason),
            });
        }

        if items.len() != expected_items {
            return Err(SearchError::Transport(format!(
                "bulk response has {} items for {} actions",
                items.len(),
                expected_items
            )));
        }

        Ok(Self {
            took: raw.took,
            items,
        })
    }

    /// Number of failed items.
    pub fn failure_count(&self) -> usize {
        self.items.iter().filter(|item| !item.is_success()).count()
    }
}
