//! # REX Service - Export Engine Runner
//!
//! Embeds the export engine in a small HTTP service: loads export
//! configurations from a YAML file, exposes run triggers and run-status
//! reads, serves Prometheus metrics, and drives the scheduler and the
//! stuck-run sweeper in the background.
//!
//! ## Usage
//!
//! ```bash
//! # Run with a configuration file
//! rex-service --configs exports.yml --upstream-url https://api.shop.example/connector
//!
//! # Enable debug logging
//! RUST_LOG=debug rex-service --configs exports.yml
//! ```
//!
//! ## Configuration
//!
//! The YAML file holds a list of export configurations:
//!
//! ```yaml
//! exports:
//!   - id: exp-1
//!     tenant_id: tenant-1
//!     api_token: "..."
//!     dataset: orders
//!     selected_fields: [order_id, date_add, email]
//!     schedule_minutes: 60
//!     destination: "sheet://1AbC/Sheet1"
//! ```

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use clap::Parser;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use rex_core::{Catalog, EngineError, MemoryConfigStore, MemoryRunStore, RunTrigger};
use rex_engine::{
    run_sweeper, DispatchOptions, Dispatcher, HttpApiFactory, RunRequest, Scheduler,
};
use rex_io::writer_stdout::StdoutWriter;
use rex_io::{BudgetRegistry, FetcherRegistry, HttpRateProvider, RateService, DEFAULT_PIVOT};
use rex_tx::EnricherRegistry;
use serde::Deserialize;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

/// Command-line arguments for the export service
#[derive(Parser, Debug)]
#[command(name = "rex-service")]
#[command(about = "Multi-tenant export pipeline service")]
struct Args {
    /// Path to the YAML file with export configurations
    #[arg(short, long)]
    configs: PathBuf,

    /// Upstream commerce API endpoint
    #[arg(long, default_value = "https://api.commerce.local/connector")]
    upstream_url: String,

    /// Exchange-rate provider base URL
    #[arg(long, default_value = "https://rates.commerce.local")]
    rates_url: String,

    /// Address for the HTTP surface
    #[arg(long, default_value = "0.0.0.0:3000")]
    bind: SocketAddr,

    /// Scheduler tick in seconds
    #[arg(long, default_value_t = 60)]
    tick_secs: u64,

    /// Upstream calls allowed per token per window
    #[arg(long, default_value_t = 100)]
    budget_calls: usize,

    /// Rate-budget window in seconds
    #[arg(long, default_value_t = 60)]
    budget_window_secs: u64,
}

/// Shape of the YAML configuration file.
#[derive(Debug, Deserialize)]
struct ServiceConfig {
    exports: Vec<rex_core::ExportConfig>,
}

#[derive(Clone)]
struct AppState {
    dispatcher: Arc<Dispatcher>,
    metrics: PrometheusHandle,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    let service_config: ServiceConfig = {
        let raw = std::fs::read_to_string(&args.configs)
            .with_context(|| format!("read {}", args.configs.display()))?;
        serde_yaml::from_str(&raw).context("parse export configurations")?
    };
    info!(exports = service_config.exports.len(), "configurations loaded");

    let metrics = PrometheusBuilder::new()
        .install_recorder()
        .context("install metrics recorder")?;

    let budgets = BudgetRegistry::new(
        args.budget_calls,
        Duration::from_secs(args.budget_window_secs),
    );
    let rates = Arc::new(RateService::new(
        Box::new(HttpRateProvider::new(&args.rates_url)?),
        DEFAULT_PIVOT,
    ));
    let runs = Arc::new(MemoryRunStore::new());
    let dispatcher = Arc::new(Dispatcher::new(
        Arc::new(Catalog::builtin()),
        Arc::new(FetcherRegistry::builtin()),
        Arc::new(EnricherRegistry::builtin()),
        Arc::new(MemoryConfigStore::new(service_config.exports)),
        runs.clone(),
        Arc::new(StdoutWriter),
        rates,
        Arc::new(HttpApiFactory::new(&args.upstream_url, budgets)),
        DispatchOptions::default(),
    ));

    let cancel = CancellationToken::new();
    let scheduler = Scheduler::new(dispatcher.clone(), Duration::from_secs(args.tick_secs));
    tokio::spawn(scheduler.run(cancel.child_token()));
    tokio::spawn(run_sweeper(
        runs,
        chrono::Duration::minutes(15),
        Duration::from_secs(60),
        cancel.child_token(),
    ));

    let state = AppState {
        dispatcher,
        metrics,
    };
    let app = Router::new()
        .route("/exports/:config_id/runs", post(trigger_run))
        .route("/runs/:run_id", get(read_run))
        .route("/metrics", get(render_metrics))
        .with_state(state);

    info!(bind = %args.bind, "export service listening");
    let listener = tokio::net::TcpListener::bind(args.bind).await?;
    let shutdown = cancel.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = signal::ctrl_c().await;
            info!("shutting down");
            shutdown.cancel();
        })
        .await?;
    Ok(())
}

#[derive(Debug, Deserialize, Default)]
struct TriggerBody {
    run_id: Option<String>,
    trigger: Option<RunTrigger>,
}

async fn trigger_run(
    State(state): State<AppState>,
    Path(config_id): Path<String>,
    body: Option<Json<TriggerBody>>,
) -> Response {
    let body = body.map(|Json(b)| b).unwrap_or_default();
    let request = RunRequest {
        run_id: body.run_id.unwrap_or_else(|| Uuid::new_v4().to_string()),
        trigger: body.trigger.unwrap_or(RunTrigger::Manual),
    };
    match state.dispatcher.run_export(&config_id, request).await {
        Ok(status) => Json(status).into_response(),
        Err(e) => error_response(e),
    }
}

async fn read_run(State(state): State<AppState>, Path(run_id): Path<String>) -> Response {
    match state.dispatcher.run_status(&run_id).await {
        Ok(Some(status)) => Json(status).into_response(),
        Ok(None) => (StatusCode::NOT_FOUND, "unknown run id").into_response(),
        Err(e) => error_response(e),
    }
}

async fn render_metrics(State(state): State<AppState>) -> String {
    state.metrics.render()
}

fn error_response(e: EngineError) -> Response {
    let status = match e {
        EngineError::Configuration(_) => StatusCode::UNPROCESSABLE_ENTITY,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, e.to_string()).into_response()
}
