//! Worker domain types

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Immutable description of one worker pod
///
/// Built by the scheduler (one per stage worker index) or by the scaling
/// surface, and handed to the lifecycle manager for execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerSpec {
    /// Pod name, DNS-label safe, at most 63 characters
    pub name: String,
    /// Container image reference
    pub image: String,
    #[serde(default)]
    pub command: Vec<String>,
    #[serde(default)]
    pub args: Vec<String>,
    /// Pod labels; the manager merges the mandatory management labels in
    #[serde(default)]
    pub labels: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourceLimits>,
}

/// Resource bounds for a worker pod
///
/// Quantities are opaque strings honored by the cluster (e.g. "500m", "128Mi").
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResourceLimits {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu_request: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_request: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu_limit: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_limit: Option<String>,
}

/// Terminal phase of a worker pod
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerPhase {
    Succeeded,
    Failed,
}

/// Record produced when a worker reaches a terminal phase
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerOutcome {
    pub name: String,
    pub phase: WorkerPhase,
    pub started_at: chrono::DateTime<chrono::Utc>,
    pub finished_at: chrono::DateTime<chrono::Utc>,
    /// Reason derived from the last container-terminated state or a
    /// persistent waiting state; absent on success
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
}

impl WorkerOutcome {
    /// Creates a successful outcome
    pub fn succeeded(
        name: impl Into<String>,
        started_at: chrono::DateTime<chrono::Utc>,
        finished_at: chrono::DateTime<chrono::Utc>,
    ) -> Self {
        Self {
            name: name.into(),
            phase: WorkerPhase::Succeeded,
            started_at,
            finished_at,
            failure_reason: None,
        }
    }

    /// Creates a failed outcome carrying the synthesized reason
    pub fn failed(
        name: impl Into<String>,
        started_at: chrono::DateTime<chrono::Utc>,
        finished_at: chrono::DateTime<chrono::Utc>,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            phase: WorkerPhase::Failed,
            started_at,
            finished_at,
            failure_reason: Some(reason.into()),
        }
    }

    pub fn is_success(&self) -> bool {
        self.phase == WorkerPhase::Succeeded
    }

    /// Wall-clock duration between start and terminal transition
    pub fn duration(&self) -> chrono::Duration {
        self.finished_at - self.started_at
    }
}
