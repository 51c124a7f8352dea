//! Log-ingress registration and status-notification DTOs

use serde::{Deserialize, Serialize};

use crate::domain::log::LoggingConfig;

/// Request from a starting worker to open a log session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistrationRequest {
    #[serde(default)]
    pub worker_id: String,
    #[serde(default)]
    pub task_id: String,
}

/// Outcome of a registration attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RegistrationStatus {
    Success,
    /// An active session already exists; its id is returned
    AlreadyRegistered,
    /// The per-worker session cap is reached
    ServerFull,
}

/// Response to a registration request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistrationResponse {
    pub status: RegistrationStatus,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<LoggingConfig>,
}

/// One-shot worker status notification toward the handler
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerStatusNotification {
    pub worker_id: String,
    pub task_id: String,
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

/// Handler's acknowledgement of a status notification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AckStatus {
    Received,
    Rejected,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerStatusAck {
    pub status: AckStatus,
    #[serde(default)]
    pub message: String,
}
