//! Pipeline domain types

use serde::{Deserialize, Serialize};

/// One node of a pipeline DAG
///
/// A stage produces `worker_count` pods and succeeds only if all of them
/// succeed. `stage_type` is opaque to the engine and carried through to
/// pod labels.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Stage {
    /// Unique within the pipeline
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub stage_type: String,
    /// Container image; the system default applies when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(default)]
    pub command: Vec<String>,
    #[serde(default)]
    pub args: Vec<String>,
    /// Number of parallel workers, at least 1
    pub worker_count: u32,
    /// Ids of stages that must complete before this one starts
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryPolicy>,
}

/// Per-stage retry policy
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Additional attempts after the first failure
    pub max_attempts: u32,
    /// Seconds to wait before re-entering the stage
    pub delay_seconds: u64,
}

/// Request to execute a pipeline
///
/// Dependency edges must induce a partial order and every referenced
/// dependency id must exist; admission rejects anything else.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineRequest {
    pub pipeline_id: String,
    pub name: String,
    pub stages: Vec<Stage>,
    #[serde(default)]
    pub repository: String,
    #[serde(default)]
    pub commit_sha: String,
    #[serde(default)]
    pub triggered_by: String,
    #[serde(default)]
    pub reason: String,
}

/// Stage execution status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Retrying,
    Skipped,
}

/// Computed metrics for a finished stage
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct StageMetrics {
    pub duration_seconds: i64,
    pub successful_workers: u32,
    pub total_workers: u32,
}

/// Structured progress message emitted by the scheduler
///
/// Pipeline-level envelopes carry no stage id; stage events additionally
/// carry the spawned pod names, metrics and stage timestamps when known.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub pipeline_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage_id: Option<String>,
    pub status: StageStatus,
    pub message: String,
    /// Integer percentage in [0, 100]
    pub progress_percentage: i32,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub worker_pod_names: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metrics: Option<StageMetrics>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<chrono::DateTime<chrono::Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<chrono::DateTime<chrono::Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl ProgressEvent {
    /// Creates a pipeline-level envelope
    pub fn pipeline(
        pipeline_id: impl Into<String>,
        status: StageStatus,
        message: impl Into<String>,
        progress_percentage: i32,
    ) -> Self {
        Self {
            pipeline_id: pipeline_id.into(),
            stage_id: None,
            status,
            message: message.into(),
            progress_percentage,
            timestamp: chrono::Utc::now(),
            worker_pod_names: Vec::new(),
            metrics: None,
            started_at: None,
            completed_at: None,
            error_message: None,
        }
    }

    /// True for a terminal pipeline-level event
    pub fn is_terminal(&self) -> bool {
        self.stage_id.is_none()
            && matches!(self.status, StageStatus::Completed | StageStatus::Failed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_defaults() {
        let stage: Stage = serde_json::from_str(
            r#"{"id": "build", "name": "Build", "worker_count": 1}"#,
        )
        .unwrap();

        assert!(stage.command.is_empty());
        assert!(stage.depends_on.is_empty());
        assert!(stage.image.is_none());
        assert!(stage.retry.is_none());
    }

    #[test]
    fn test_terminal_event_detection() {
        let mut event =
            ProgressEvent::pipeline("p-1", StageStatus::Completed, "pipeline completed", 100);
        assert!(event.is_terminal());

        event.status = StageStatus::Pending;
        assert!(!event.is_terminal());

        event.status = StageStatus::Failed;
        event.stage_id = Some("build".to_string());
        assert!(!event.is_terminal());
    }
}
