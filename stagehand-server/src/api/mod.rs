//! API module
//!
//! HTTP surface of the orchestrator. Each submodule handles one operation
//! group: scaling, pipeline execution, and worker log ingress.

pub mod error;
pub mod health;
pub mod logs;
pub mod pipeline;
pub mod scaling;

use std::sync::Arc;

use axum::{
    routing::{get, post},
    Router,
};
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;

use crate::config::Settings;
use crate::logs::LogFabric;
use crate::pipeline::PipelineRegistry;
use crate::worker::WorkerManager;

/// Shared handles for the API handlers
#[derive(Clone)]
pub struct AppState {
    pub settings: Arc<Settings>,
    pub manager: Arc<WorkerManager>,
    pub fabric: Arc<LogFabric>,
    pub pipelines: Arc<PipelineRegistry>,
    /// Process-wide shutdown domain; every pipeline token is a child of it
    pub shutdown: CancellationToken,
}

/// Create the main API router with all endpoints
pub fn create_router(state: AppState) -> Router {
    Router::new()
        // Health check
        .route("/health", get(health::health_check))
        // Scaling and worker status
        .route("/v1/scale/up", post(scaling::scale_up))
        .route("/v1/scale/down", post(scaling::scale_down))
        .route("/v1/workers/status", get(scaling::worker_status))
        // Pipeline execution (streaming progress)
        .route("/v1/pipelines/execute", post(pipeline::execute_pipeline))
        // Worker log ingress
        .route("/v1/logs/register", post(logs::register_worker))
        .route("/v1/logs/stream", get(logs::stream_logs))
        // Add state and middleware
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}
