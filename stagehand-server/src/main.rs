//! Stagehand server
//!
//! Cluster-internal orchestrator that launches short-lived worker pods on
//! behalf of an external CI/CD control plane, drives DAG pipelines over
//! them, and streams worker logs back in real time.
//!
//! Architecture:
//! - Cluster gateway: thin wrapper over the cluster pod API
//! - Worker manager: pod lifecycle with unconditional cleanup
//! - Log fabric: ingests worker logs and forwards them to the handler
//! - Pipeline executor: DAG scheduling with streaming progress
//! - API: the HTTP surface tying the above together

mod api;
mod cluster;
mod config;
mod logs;
mod pipeline;
mod worker;

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use stagehand_client::HandlerClient;

use crate::api::AppState;
use crate::cluster::{ClusterGateway, KubeGateway};
use crate::config::Settings;
use crate::logs::{FabricConfig, LogFabric};
use crate::pipeline::PipelineRegistry;
use crate::worker::{ManagerConfig, WorkerManager};

#[tokio::main]
async fn main() -> Result<()> {
    let settings =
        Settings::load(std::env::var("STAGEHAND_CONFIG").ok().as_deref())
            .context("failed to load configuration")?;

    init_tracing(&settings);
    info!("starting stagehand server");

    // Cluster access and worker lifecycle
    let gateway: Arc<dyn ClusterGateway> = Arc::new(
        KubeGateway::connect(&settings.kubernetes.namespace)
            .await
            .context("failed to initialize cluster gateway")?,
    );
    let manager = Arc::new(WorkerManager::new(
        Arc::clone(&gateway),
        ManagerConfig::default(),
    ));

    // Handler egress; a single client per process
    let handler = Arc::new(
        HandlerClient::new(&settings.server.handler_host, settings.server.mock_mode)
            .context("failed to build handler client")?,
    );
    if settings.server.mock_mode {
        info!("running in mock mode - handler egress is simulated");
    }
    if let Err(e) = handler.connect().await {
        warn!("handler connection failed, will retry on first use: {}", e);
    }

    let fabric = Arc::new(LogFabric::new(
        Arc::clone(&handler),
        settings.kubernetes.namespace.clone(),
        FabricConfig::default(),
    ));
    let pipelines = Arc::new(PipelineRegistry::new());

    let shutdown = CancellationToken::new();
    spawn_session_sweeper(Arc::clone(&fabric), shutdown.clone());

    let state = AppState {
        settings: Arc::new(settings.clone()),
        manager,
        fabric: Arc::clone(&fabric),
        pipelines: Arc::clone(&pipelines),
        shutdown: shutdown.clone(),
    };
    let app = api::create_router(state);

    let addr = settings.bind_addr();
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind to {}", addr))?;
    info!("listening on {}", addr);

    let signal = {
        let shutdown = shutdown.clone();
        async move {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown signal received");
            shutdown.cancel();
        }
    };

    axum::serve(listener, app)
        .with_graceful_shutdown(signal)
        .await
        .context("server failed")?;

    info!(
        "at shutdown: {} running pipelines, {} active log sessions, {} dropped log entries",
        pipelines.running_count(),
        fabric.active_session_count(),
        fabric.dropped_entry_count()
    );
    handler
        .disconnect()
        .await
        .context("failed to disconnect handler client")?;

    info!("server stopped gracefully");
    Ok(())
}

fn init_tracing(settings: &Settings) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        format!(
            "stagehand_server={level},stagehand_client={level},tower_http=info",
            level = settings.logging.level
        )
        .into()
    });

    let registry = tracing_subscriber::registry().with(filter);
    if settings.logging.format == "json" {
        registry
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

/// Periodically drops inactive and aged-out log sessions
fn spawn_session_sweeper(fabric: Arc<LogFabric>, shutdown: CancellationToken) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(fabric.config().sweep_interval);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    fabric.sweep_sessions();
                }
            }
        }
    });
}
