//! ElasticSync daemon
//!
//! Captures row changes on configured Postgres tables and keeps matching
//! Elasticsearch indices in step with them.
//!
//! Usage:
//!   elasticsync --config elasticsync.json run
//!   elasticsync install | print-ddl | stats | requeue [IDS...]

use std::{path::PathBuf, sync::Arc};
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use elasticsync_daemon::{build_router, capture_ddl, load_config, shape_catalog, Overrides};
use elasticsync_engine::SyncEngine;
use elasticsync_search::ElasticClient;
use elasticsync_store::{ChangeLogStore, PgChangeLogStore};
use elasticsync_types::SyncConfig;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "elasticsync")]
#[command(about = "Keeps Elasticsearch indices in step with Postgres tables")]
struct Args {
    /// Path to the JSON settings file
    #[arg(short, long, default_value = "elasticsync.json")]
    config: PathBuf,

    /// Overrides ElasticsearchUrl from the settings file
    #[arg(long)]
    elasticsearch_url: Option<String>,

    /// Overrides ConnectionString from the settings file
    #[arg(long)]
    connection_string: Option<String>,

    /// HTTP port for the status endpoint (run only)
    #[arg(long, default_value = "4080")]
    http_port: u16,

    /// Enable verbose debug logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
enum Command {
    /// Install capture, provision indices and sync until interrupted (default)
    Run,
    /// Install the change-log table and capture triggers, then exit
    Install,
    /// Print the capture DDL without applying it
    PrintDdl,
    /// Print change-log row counts as JSON
    Stats,
    /// Return dead-lettered rows to pending (all of them when no ids are given)
    Requeue { ids: Vec<i64> },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let default_level = if args.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();

    let overrides = Overrides {
        elasticsearch_url: args.elasticsearch_url.clone(),
        connection_string: args.connection_string.clone(),
    };
    let config = load_config(&args.config, &overrides)?;

    match args.command.clone().unwrap_or(Command::Run) {
        Command::Run => run(config, args.http_port).await,
        Command::Install => {
            let store = connect(&config).await?;
            store.install(&config.options.entities).await?;
            info!(tables = config.options.entities.len(), "Capture installed");
            Ok(())
        }
        Command::PrintDdl => {
            println!("{}", capture_ddl(&config));
            Ok(())
        }
        Command::Stats => {
            let store = connect(&config).await?;
            let stats = store.stats().await?;
            println!("{}", serde_json::to_string_pretty(&stats)?);
            Ok(())
        }
        Command::Requeue { ids } => {
            let store = connect(&config).await?;
            let selected = if ids.is_empty() { None } else { Some(ids.as_slice()) };
            let requeued = store.requeue_dead_letters(selected).await?;
            info!(requeued, "Dead-lettered rows returned to pending");
            Ok(())
        }
    }
}

async fn connect(config: &SyncConfig) -> Result<PgChangeLogStore> {
    PgChangeLogStore::connect(&config.connection_string)
        .await
        .context("Failed to connect to Postgres")
}

async fn run(config: SyncConfig, http_port: u16) -> Result<()> {
    info!("ElasticSync starting...");
    let store = connect(&config).await?;
    let search = ElasticClient::new(&config.elasticsearch_url)
        .context("Invalid ElasticsearchUrl")?;
    info!(elasticsearch = %search.base_url(), "Elasticsearch client ready");

    let shapes = shape_catalog(&config);
    let engine = Arc::new(SyncEngine::new(
        config.options,
        Arc::new(store),
        Arc::new(search),
        &shapes,
    )?);
    engine.install().await?;
    for index in engine.ensure_indices().await? {
        info!(index = %index.index, created = index.created, "Index ready");
    }
    let handle = engine.start()?;

    let app = build_router(Arc::clone(&engine));
    let server = tokio::spawn(async move {
        let listener = match tokio::net::TcpListener::bind(format!("0.0.0.0:{}", http_port)).await {
            Ok(listener) => listener,
            Err(e) => {
                error!("Failed to bind HTTP port {}: {}", http_port, e);
                return;
            }
        };
        info!("HTTP status endpoint listening on port {}", http_port);
        if let Err(e) = axum::serve(listener, app).await {
            error!("HTTP server failed: {}", e);
        }
    });

    println!("\n========================================");
    println!("  ElasticSync Running");
    println!("========================================");
    println!("  Instance:  {}", engine.instance());
    println!("  Mode:      {}", engine.stats().mode);
    println!("  Workers:   {}", engine.options().worker_count());
    println!("  Tables:    {}", engine.registry().len());
    println!("  HTTP Port: {}", http_port);
    println!("========================================\n");

    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for shutdown signal: {}", e);
    }
    info!("Shutdown requested");
    handle.stop().await;
    server.abort();
    Ok(())
}
