//! Scaling and worker-status DTOs

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Request to scale workers up or down for a task
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScaleRequest {
    pub task_id: String,
    pub worker_count: i32,
    #[serde(default)]
    pub repository: String,
    #[serde(default)]
    pub commit_sha: String,
    #[serde(default)]
    pub triggered_by: String,
    #[serde(default)]
    pub reason: String,
}

/// Acceptance status for a scale request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScaleStatus {
    Success,
    Failure,
}

/// Response to a scale request
///
/// `success` means the request was accepted; observable worker outcomes
/// are queried afterwards through the worker-status operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScaleResponse {
    pub status: ScaleStatus,
    pub message: String,
    pub processed_count: i32,
    pub worker_pod_names: Vec<String>,
    pub started_at: chrono::DateTime<chrono::Utc>,
    pub completed_at: chrono::DateTime<chrono::Utc>,
}

/// Status snapshot of one worker pod
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerPodStatus {
    pub pod_name: String,
    #[serde(default)]
    pub task_id: String,
    /// Pod phase as reported by the cluster
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<chrono::DateTime<chrono::Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<chrono::DateTime<chrono::Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<chrono::DateTime<chrono::Utc>>,
    #[serde(default)]
    pub node_name: String,
    #[serde(default)]
    pub pod_ip: String,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub labels: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

/// Aggregated worker status
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerStatusResponse {
    pub total_count: i32,
    pub running_count: i32,
    pub pending_count: i32,
    pub succeeded_count: i32,
    pub failed_count: i32,
    pub workers: Vec<WorkerPodStatus>,
}
