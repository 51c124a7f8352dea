//! Scaling and worker-status handlers

use axum::extract::{Query, State};
use axum::Json;
use serde::Deserialize;
use tracing::{error, info};

use stagehand_core::domain::worker::{ResourceLimits, WorkerSpec};
use stagehand_core::dto::scaling::{
    ScaleRequest, ScaleResponse, ScaleStatus, WorkerPodStatus, WorkerStatusResponse,
};
use stagehand_core::names;

use crate::cluster::pod::{Pod, PodPhase};
use crate::config::Settings;

use super::error::{ApiError, ApiResult};
use super::AppState;

/// POST /v1/scale/up
///
/// Validates the request, composes the worker specs, and kicks the batch off
/// on a detached task so the call returns promptly. `success` here means the
/// request was accepted; outcomes are observed via the status operation.
pub async fn scale_up(
    State(state): State<AppState>,
    Json(req): Json<ScaleRequest>,
) -> ApiResult<Json<ScaleResponse>> {
    let started_at = chrono::Utc::now();
    info!(
        "scale up request: task_id={}, worker_count={}, repository={}",
        req.task_id, req.worker_count, req.repository
    );

    if req.task_id.is_empty() {
        return Err(ApiError::BadRequest("task_id is required".to_string()));
    }
    if req.worker_count <= 0 {
        return Err(ApiError::BadRequest(
            "worker_count must be positive".to_string(),
        ));
    }

    let specs = build_scale_worker_specs(&state.settings, &req);
    let worker_pod_names: Vec<String> = specs.iter().map(|s| s.name.clone()).collect();

    let manager = state.manager.clone();
    let cancel = state.shutdown.child_token();
    let task_id = req.task_id.clone();
    tokio::spawn(async move {
        if let Err(e) = manager.run_batch(specs, cancel).await {
            error!("worker batch for task {} failed: {}", task_id, e);
        }
    });

    Ok(Json(ScaleResponse {
        status: ScaleStatus::Success,
        message: format!(
            "successfully started {} workers for task {}",
            req.worker_count, req.task_id
        ),
        processed_count: req.worker_count,
        worker_pod_names,
        started_at,
        completed_at: chrono::Utc::now(),
    }))
}

/// POST /v1/scale/down
///
/// Gracefully terminates up to the requested number of this task's workers,
/// oldest first, and reports the names actually issued.
pub async fn scale_down(
    State(state): State<AppState>,
    Json(req): Json<ScaleRequest>,
) -> ApiResult<Json<ScaleResponse>> {
    let started_at = chrono::Utc::now();
    info!(
        "scale down request: task_id={}, target count={}",
        req.task_id, req.worker_count
    );

    if req.task_id.is_empty() {
        return Err(ApiError::BadRequest("task_id is required".to_string()));
    }

    let count = req.worker_count.max(0) as usize;
    let terminated = state
        .manager
        .terminate_oldest(count, Some(&req.task_id))
        .await?;

    Ok(Json(ScaleResponse {
        status: ScaleStatus::Success,
        message: format!(
            "terminated {} workers for task {}",
            terminated.len(),
            req.task_id
        ),
        processed_count: terminated.len() as i32,
        worker_pod_names: terminated,
        started_at,
        completed_at: chrono::Utc::now(),
    }))
}

#[derive(Debug, Deserialize)]
pub struct WorkerStatusQuery {
    pub task_id: Option<String>,
}

/// GET /v1/workers/status
///
/// Lists active worker pods, optionally filtered by task id, with aggregate
/// per-phase counts.
pub async fn worker_status(
    State(state): State<AppState>,
    Query(query): Query<WorkerStatusQuery>,
) -> ApiResult<Json<WorkerStatusResponse>> {
    let pods = state.manager.list_active().await?;

    let workers: Vec<WorkerPodStatus> = pods
        .iter()
        .filter(|pod| match &query.task_id {
            Some(task_id) if !task_id.is_empty() => {
                pod.metadata.labels.get(names::TASK_ID_LABEL) == Some(task_id)
            }
            _ => true,
        })
        .map(pod_status_record)
        .collect();

    let (running, pending, succeeded, failed) = count_phases(&workers);

    Ok(Json(WorkerStatusResponse {
        total_count: workers.len() as i32,
        running_count: running,
        pending_count: pending,
        succeeded_count: succeeded,
        failed_count: failed,
        workers,
    }))
}

/// Worker specs for a scale request, indexed 1..=worker_count
fn build_scale_worker_specs(settings: &Settings, req: &ScaleRequest) -> Vec<WorkerSpec> {
    let mut stem = format!(
        "{}-{}",
        names::POD_NAME_PREFIX,
        names::sanitize_pod_name(&req.task_id)
    );
    names::truncate_on_boundary(&mut stem, 50);
    let stem = stem.trim_end_matches('-').to_string();

    (1..=req.worker_count)
        .map(|index| {
            let labels = settings.worker_labels(
                [
                    (
                        names::APP_LABEL.to_string(),
                        names::WORKER_APP_VALUE.to_string(),
                    ),
                    (names::TASK_ID_LABEL.to_string(), req.task_id.clone()),
                    (
                        "repository".to_string(),
                        names::sanitize_label_value(&req.repository),
                    ),
                    (
                        "commit-sha".to_string(),
                        names::sanitize_label_value(&req.commit_sha),
                    ),
                    ("worker-index".to_string(), index.to_string()),
                ]
                .into(),
            );

            WorkerSpec {
                name: format!("{}-{}", stem, index),
                image: settings.worker.image.clone(),
                command: build_worker_command(),
                args: build_worker_args(req),
                labels,
                resources: Some(ResourceLimits {
                    cpu_limit: Some(settings.worker.cpu_limit.clone()),
                    memory_limit: Some(settings.worker.memory_limit.clone()),
                    ..Default::default()
                }),
            }
        })
        .collect()
}

fn build_worker_command() -> Vec<String> {
    vec!["sh".to_string(), "-c".to_string()]
}

// TODO: wire the real worker entrypoint once the agent image ships one;
// until then the worker surfaces its task context in the logs and exits.
fn build_worker_args(req: &ScaleRequest) -> Vec<String> {
    let script = format!(
        "echo \"worker started\"\n\
         echo \"task: {}\"\n\
         echo \"repository: {}\"\n\
         echo \"commit: {}\"\n\
         echo \"triggered by: {}\"\n\
         echo \"reason: {}\"\n",
        req.task_id, req.repository, req.commit_sha, req.triggered_by, req.reason
    );
    vec![script]
}

/// Converts a pod into a worker status record
fn pod_status_record(pod: &Pod) -> WorkerPodStatus {
    let mut record = WorkerPodStatus {
        pod_name: pod.metadata.name.clone(),
        task_id: pod
            .metadata
            .labels
            .get(names::TASK_ID_LABEL)
            .cloned()
            .unwrap_or_default(),
        status: pod.status.phase.as_str().to_string(),
        created_at: pod.metadata.creation_timestamp,
        started_at: pod.status.start_time,
        completed_at: None,
        node_name: pod.spec.node_name.clone().unwrap_or_default(),
        pod_ip: pod.status.pod_ip.clone().unwrap_or_default(),
        labels: pod.metadata.labels.clone(),
        error_message: None,
    };

    for status in &pod.status.container_statuses {
        if let Some(terminated) = &status.state.terminated {
            record.completed_at = terminated.finished_at;
            if terminated.exit_code != 0 {
                record.error_message = Some(format!(
                    "container exited with code {}: {}",
                    terminated.exit_code, terminated.reason
                ));
            }
        }
    }

    record
}

fn count_phases(workers: &[WorkerPodStatus]) -> (i32, i32, i32, i32) {
    let (mut running, mut pending, mut succeeded, mut failed) = (0, 0, 0, 0);
    for worker in workers {
        match worker.status.as_str() {
            s if s == PodPhase::Running.as_str() => running += 1,
            s if s == PodPhase::Pending.as_str() => pending += 1,
            s if s == PodPhase::Succeeded.as_str() => succeeded += 1,
            s if s == PodPhase::Failed.as_str() => failed += 1,
            _ => {}
        }
    }
    (running, pending, succeeded, failed)
}
