//! Identifiers stamped into the change log's claim columns.
//!
//! Several processes may drain the same change log, so worker identifiers
//! carry a per-process instance tag derived from a UUID v7.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Short tag identifying one running engine process.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InstanceTag(String);

impl InstanceTag {
    /// Creates a new tag from the random tail of a UUID v7.
    #[must_use]
    pub fn new() -> Self {
        let simple = Uuid::now_v7().simple().to_string();
        // Leading 48 bits are the timestamp; the tail is random.
        Self(simple[simple.len() - 8..].to_string())
    }

    /// Creates a tag from a fixed string (tests, or hosts with their own naming).
    #[must_use]
    pub fn from_static(tag: &str) -> Self {
        Self(tag.to_string())
    }

    /// Returns the tag as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for InstanceTag {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for InstanceTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifier of one worker, written to `locked_by` when it claims rows.
///
/// Rendered as `<instance>:worker_<n>`, with `n` starting at 1.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkerId(String);

impl WorkerId {
    /// Creates the identifier for worker `index` (zero-based) of an instance.
    #[must_use]
    pub fn new(instance: &InstanceTag, index: usize) -> Self {
        Self(format!("{}:worker_{}", instance, index + 1))
    }

    /// Returns the identifier as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns the instance tag portion, if the identifier has one.
    #[must_use]
    pub fn instance(&self) -> Option<&str> {
        self.0.split_once(':').map(|(instance, _)| instance)
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for WorkerId {
    type Err = crate::ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.trim().is_empty() {
            return Err(crate::ConfigError::Invalid("worker id must not be empty".into()));
        }
        Ok(Self(s.to_string()))
    }
}
