//! The raw configuration surface, as it appears in a settings file.
//!
//! Keys are PascalCase (`ElasticsearchUrl`, `WorkerOptions.NumberOfWorkers`,
//! ...). A file may hold the settings object directly or nest it under an
//! `"ElasticSync"` key.

use crate::options::{
    DEFAULT_BATCH_SIZE, DEFAULT_CLAIM_TIMEOUT, DEFAULT_INTERVAL, DEFAULT_MAX_RETRIES,
    DEFAULT_RETRY_DELAY,
};
use crate::{Backoff, ConfigError, RetryPolicy, SyncMode, SyncOptions, TrackedEntity, WorkerOptions};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Key under which settings may be nested in a larger settings document.
pub const SETTINGS_SECTION: &str = "ElasticSync";

/// Which wake-up source drives the workers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ModeKind {
    #[default]
    #[serde(alias = "RealTime", alias = "realtime")]
    Realtime,
    #[serde(alias = "interval")]
    Interval,
}

/// Unvalidated settings. Convert with [`SyncSettings::validate`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct SyncSettings {
    pub elasticsearch_url: String,
    pub connection_string: String,
    pub mode: ModeKind,
    pub batch_size: usize,
    pub max_retries: i32,
    pub retry_delay_in_seconds: u64,
    /// Interval mode only.
    pub interval_in_seconds: u64,
    pub claim_timeout_in_seconds: u64,
    pub backoff: Backoff,
    /// Present to enable multiple workers.
    pub worker_options: Option<WorkerOptions>,
    pub entities: Vec<TrackedEntity>,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            elasticsearch_url: String::new(),
            connection_string: String::new(),
            mode: ModeKind::default(),
            batch_size: DEFAULT_BATCH_SIZE,
            max_retries: DEFAULT_MAX_RETRIES,
            retry_delay_in_seconds: DEFAULT_RETRY_DELAY.as_secs(),
            interval_in_seconds: DEFAULT_INTERVAL.as_secs(),
            claim_timeout_in_seconds: DEFAULT_CLAIM_TIMEOUT.as_secs(),
            backoff: Backoff::default(),
            worker_options: None,
            entities: Vec::new(),
        }
    }
}

/// Endpoints plus validated engine options.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncConfig {
    pub elasticsearch_url: String,
    pub connection_string: String,
    pub options: SyncOptions,
}

impl SyncSettings {
    /// Parses settings from JSON, accepting the `"ElasticSync"` wrapper.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let mut value: serde_json::Value = serde_json::from_str(json)?;
        if let Some(section) = value.get_mut(SETTINGS_SECTION) {
            value = section.take();
        }
        Ok(serde_json::from_value(value)?)
    }

    /// Builds the engine options, without checking endpoints.
    pub fn to_options(&self) -> Result<SyncOptions, ConfigError> {
        let mode = match self.mode {
            ModeKind::Realtime => SyncMode::Realtime {
                batch_size: self.batch_size,
            },
            ModeKind::Interval => SyncMode::Interval {
                interval: Duration::from_secs(self.interval_in_seconds),
                batch_size: self.batch_size,
            },
        };
        let options = SyncOptions {
            mode,
            retry: RetryPolicy {
                max_retries: self.max_retries,
                base_delay: Duration::from_secs(self.retry_delay_in_seconds),
                backoff: self.backoff,
            },
            claim_timeout: Duration::from_secs(self.claim_timeout_in_seconds),
            workers: self.worker_options,
            entities: self.entities.clone(),
        };
        options.validate()?;
        Ok(options)
    }

    /// Checks every required option and converts to a [`SyncConfig`].
    pub fn validate(&self) -> Result<SyncConfig, ConfigError> {
        if self.elasticsearch_url.trim().is_empty() {
            return Err(ConfigError::Missing("ElasticsearchUrl"));
        }
        if !(self.elasticsearch_url.starts_with("http://")
            || self.elasticsearch_url.starts_with("https://"))
        {
            return Err(ConfigError::Invalid(
                "ElasticsearchUrl must be an http(s) URL".into(),
            ));
        }
        if self.connection_string.trim().is_empty() {
            return Err(ConfigError::Missing("ConnectionString"));
        }

        Ok(SyncConfig {
            elasticsearch_url: self.elasticsearch_url.trim_end_matches('/').to_string(),
            connection_string: self.connection_string.clone(),
            options: self.to_options()?,
        })
    }
}
