//! Change-log entries.
//!
//! One entry is written by the capture trigger for every row mutation on a
//! tracked table. Entries are never deleted by the engine; they move from
//! pending to processed or dead-lettered.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// The row operation that produced an entry (`TG_OP` in the trigger).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeOperation {
    Insert,
    Update,
    Delete,
}

impl ChangeOperation {
    /// All operations, in trigger installation order.
    pub const ALL: [ChangeOperation; 3] = [Self::Insert, Self::Update, Self::Delete];

    /// The SQL keyword for this operation.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Insert => "INSERT",
            Self::Update => "UPDATE",
            Self::Delete => "DELETE",
        }
    }

    /// Whether the index document should be removed rather than written.
    #[must_use]
    pub const fn is_delete(&self) -> bool {
        matches!(self, Self::Delete)
    }
}

impl fmt::Display for ChangeOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ChangeOperation {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "INSERT" => Ok(Self::Insert),
            "UPDATE" => Ok(Self::Update),
            "DELETE" => Ok(Self::Delete),
            other => Err(crate::Error::UnknownOperation(other.to_string())),
        }
    }
}

/// A captured row mutation awaiting propagation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeLogEntry {
    /// Capture order.
    pub id: i64,
    /// Source table (`TG_TABLE_NAME`).
    pub table_name: String,
    pub operation: ChangeOperation,
    /// Primary-key value as text.
    pub record_id: String,
    /// Full row image at capture time.
    pub payload: serde_json::Value,
    pub processed: bool,
    pub retry_count: i32,
    pub last_error: Option<String>,
    pub dead_letter: bool,
    /// Worker currently holding the claim.
    pub locked_by: Option<String>,
    pub locked_at: Option<DateTime<Utc>>,
    /// Last worker that claimed the row.
    pub processed_by: Option<String>,
    pub last_attempt_at: Option<DateTime<Utc>>,
    /// Earliest time the row may be retried.
    pub next_retry_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl ChangeLogEntry {
    /// Creates a fresh, pending entry as the capture trigger would.
    #[must_use]
    pub fn new(
        id: i64,
        table_name: impl Into<String>,
        operation: ChangeOperation,
        record_id: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            id,
            table_name: table_name.into(),
            operation,
            record_id: record_id.into(),
            payload,
            processed: false,
            retry_count: 0,
            last_error: None,
            dead_letter: false,
            locked_by: None,
            locked_at: None,
            processed_by: None,
            last_attempt_at: None,
            next_retry_at: None,
            created_at: Utc::now(),
        }
    }

    /// Not yet finished and not backing off.
    ///
    /// This is the eligibility rule used in single-worker mode.
    #[must_use]
    pub fn is_pending(&self, now: DateTime<Utc>) -> bool {
        !self.processed && !self.dead_letter && self.next_retry_at.is_none_or(|at| at <= now)
    }

    /// Held by a worker whose claim has not yet timed out.
    ///
    /// A claim with no `locked_at` never times out, matching the SQL
    /// `locked_at < now() - timeout` comparison against NULL.
    #[must_use]
    pub fn has_live_claim(&self, now: DateTime<Utc>, claim_timeout: Duration) -> bool {
        self.locked_by.is_some() && self.locked_at.is_none_or(|at| at >= now - claim_timeout)
    }

    /// Eligibility rule used in multi-worker mode.
    #[must_use]
    pub fn is_claimable(&self, now: DateTime<Utc>, claim_timeout: Duration) -> bool {
        self.is_pending(now) && !self.has_live_claim(now, claim_timeout)
    }
}
