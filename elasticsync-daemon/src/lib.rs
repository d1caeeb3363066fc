//! Config loading and HTTP status API for the ElasticSync daemon.

use anyhow::{Context, Result};
use axum::http::StatusCode;
use axum::{extract::State, response::Json, routing::get, Router};
use elasticsync_engine::{DocumentShape, EngineStats, ShapeCatalog, SyncEngine};
use elasticsync_store::installer::{install_script, CaptureTarget};
use elasticsync_store::ChangeLogStats;
use elasticsync_types::{SyncConfig, SyncSettings};
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;
use tracing::warn;

/// Command-line values that take precedence over the settings file.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub elasticsearch_url: Option<String>,
    pub connection_string: Option<String>,
}

/// Reads and validates the settings file, applying `overrides`.
pub fn load_config(path: &Path, overrides: &Overrides) -> Result<SyncConfig> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read settings file {}", path.display()))?;
    let mut settings = SyncSettings::from_json(&raw)
        .with_context(|| format!("Failed to parse settings file {}", path.display()))?;

    if let Some(url) = &overrides.elasticsearch_url {
        settings.elasticsearch_url = url.clone();
    }
    if let Some(connection_string) = &overrides.connection_string {
        settings.connection_string = connection_string.clone();
    }

    settings.validate().context("Invalid settings")
}

/// Shape catalog for the daemon binary.
///
/// No entity types are compiled into the daemon, so each configured
/// `EntityType` indexes rows as captured.
pub fn shape_catalog(config: &SyncConfig) -> ShapeCatalog {
    let mut catalog = ShapeCatalog::new();
    let typed = config
        .options
        .entities
        .iter()
        .filter_map(|entity| entity.entity_type.as_ref().map(|name| (&entity.table, name)));
    for (table, entity_type) in typed {
        if catalog.get(entity_type).is_none() {
            warn!(
                %table,
                %entity_type,
                "no document shape for entity type, indexing rows as captured"
            );
            catalog = catalog.register_shape(entity_type.clone(), DocumentShape::passthrough());
        }
    }
    catalog
}

/// The capture DDL for the configured tables.
///
/// Tables without a configured primary key use the fallback column; the
/// database install introspects it instead.
pub fn capture_ddl(config: &SyncConfig) -> String {
    let targets: Vec<CaptureTarget> = config
        .options
        .entities
        .iter()
        .map(CaptureTarget::from_entity)
        .collect();
    install_script(&targets)
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusResponse {
    pub engine: EngineStats,
    pub change_log: Option<ChangeLogStats>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

async fn status_handler(
    State(engine): State<Arc<SyncEngine>>,
) -> (StatusCode, Json<StatusResponse>) {
    let stats = engine.stats();
    match engine.store().stats().await {
        Ok(change_log) => (
            StatusCode::OK,
            Json(StatusResponse {
                engine: stats,
                change_log: Some(change_log),
                error: None,
            }),
        ),
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(StatusResponse {
                engine: stats,
                change_log: None,
                error: Some(e.to_string()),
            }),
        ),
    }
}

/// Build the HTTP API router for a running engine.
pub fn build_router(engine: Arc<SyncEngine>) -> Router {
    Router::new()
        .route("/api/v1/status", get(status_handler))
        .with_state(engine)
}
