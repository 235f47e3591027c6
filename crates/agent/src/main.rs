//! Platform resource manager agent
//!
//! Runs next to the host orchestrator on every node, regulating the CPU,
//! cache and memory bandwidth budget of best-effort tasks so that
//! latency-critical tasks stay within their learned thresholds.

use anyhow::{Context, Result};
use prm_lib::{
    health::{components, HealthRegistry},
    host::{JsonFileSource, JsonLinesSink},
    observability::{AgentMetrics, StructuredLogger},
    regulator::{RegulationLoopBuilder, ResourceRegulator, SharedStatus},
    threshold::{LocalModelStore, ModelStore, ThresholdHandle, ThresholdRefresher},
};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod api;
mod config;

const AGENT_VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with JSON output and env filter
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().json())
        .init();

    info!("Starting prm-agent");

    let config = config::AgentConfig::load()?;
    info!(
        node_name = %config.node_name,
        snapshot = %config.snapshot_path.display(),
        enable_control = config.enable_control,
        "Agent configured"
    );

    let health_registry = HealthRegistry::new();

    let metrics = AgentMetrics::new();
    let logger = StructuredLogger::new(&config.node_name);
    logger.log_startup(AGENT_VERSION, config.enable_control);

    if let Err(e) = tokio::fs::create_dir_all(&config.model_store_dir).await {
        warn!(
            path = %config.model_store_dir.display(),
            error = %e,
            "Failed to create threshold store directory"
        );
    }
    let store: Arc<dyn ModelStore> = Arc::new(LocalModelStore::new(&config.model_store_dir));

    // Thresholds start empty and are pulled on the first aggregation boundary,
    // once the snapshot tells us the cpu model
    let thresholds = ThresholdHandle::default();
    let mut regulator = ResourceRegulator::new(config.regulator_config(), thresholds.clone());
    match store.load_lc_util_max().await {
        Ok(Some(value)) => {
            info!(lc_util_max = value, "Restored LC utilization peak");
            regulator.restore_lc_util_max(value);
        }
        Ok(None) => {}
        Err(e) => warn!(error = %e, "Failed to load LC utilization peak"),
    }

    let refresher = ThresholdRefresher::new(Arc::clone(&store), thresholds)
        .with_timeout(config.pull_timeout())
        .with_metrics(metrics.clone())
        .with_logger(logger.clone());

    let status = SharedStatus::default();
    let mut builder = RegulationLoopBuilder::new()
        .regulator(regulator)
        .source(Arc::new(JsonFileSource::new(&config.snapshot_path)))
        .sink(Arc::new(JsonLinesSink::new(&config.allocations_path)))
        .refresher(refresher)
        .model_store(store)
        .health(health_registry.clone())
        .metrics(metrics.clone())
        .logger(logger.clone())
        .status(Arc::clone(&status));
    if let Some(path) = &config.workload_meta_path {
        builder = builder.workload_meta_path(path);
    }
    let regulation_loop = builder.build().context("Failed to build regulation loop")?;

    let app_state = Arc::new(api::AppState::new(
        health_registry.clone(),
        metrics.clone(),
        status,
    ));

    health_registry.record_success(components::REGULATOR).await;
    health_registry.set_ready(true).await;

    let (shutdown_tx, _) = broadcast::channel(1);
    let loop_handle = tokio::spawn(regulation_loop.run(shutdown_tx.subscribe()));

    let api_port = config.api_port;
    let api_handle = tokio::spawn(async move {
        if let Err(e) = api::serve(api_port, app_state).await {
            warn!(error = %e, "API server stopped");
        }
    });

    tokio::signal::ctrl_c().await?;
    logger.log_shutdown("SIGINT received");
    info!("Shutting down");

    let _ = shutdown_tx.send(());
    if let Err(e) = loop_handle.await {
        warn!(error = %e, "Regulation loop task failed");
    }
    api_handle.abort();

    Ok(())
}
