//! Log domain types
//!
//! Two shapes travel through the system: the ingress `LogEntry` a worker
//! sends to the engine, and the egress `WorkerLogEntry` the engine forwards
//! to the handler (the ingress entry plus pod metadata).

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Severity of a log line
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
}

/// Which stream a log line came from
///
/// Best-effort hint only; the cluster logs API does not distinguish the two.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogSource {
    Stdout,
    Stderr,
}

/// A log entry received from a worker
///
/// `worker_id`, `task_id` and `message` are required; the engine fills
/// timestamp, level and source when absent. Unrecognized keys travel in
/// `metadata`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    #[serde(default)]
    pub worker_id: String,
    #[serde(default)]
    pub task_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<chrono::DateTime<chrono::Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub level: Option<LogLevel>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<LogSource>,
    #[serde(default)]
    pub message: String,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, String>,
}

/// Pod metadata attached to forwarded entries
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PodMetadata {
    pub pod_name: String,
    pub namespace: String,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

/// A log entry as forwarded to the handler
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerLogEntry {
    pub worker_id: String,
    pub task_id: String,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub level: LogLevel,
    pub source: LogSource,
    pub message: String,
    pub pod_metadata: PodMetadata,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, String>,
}

/// Per-entry disposition returned to a streaming worker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogStatus {
    /// Entry accepted and forwarded
    Ack,
    /// Forwarding failed; the client should re-send later
    Retry,
    /// Entry rejected; the client must not re-send
    Drop,
}

/// Response to one ingress log entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogResponse {
    pub status: LogStatus,
    pub message: String,
    /// Strictly increasing per-session sequence, present on ack
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sequence: Option<i64>,
}

impl LogResponse {
    pub fn ack(sequence: i64) -> Self {
        Self {
            status: LogStatus::Ack,
            message: "log received successfully".to_string(),
            sequence: Some(sequence),
        }
    }

    pub fn retry(message: impl Into<String>) -> Self {
        Self {
            status: LogStatus::Retry,
            message: message.into(),
            sequence: None,
        }
    }

    pub fn drop_entry(message: impl Into<String>) -> Self {
        Self {
            status: LogStatus::Drop,
            message: message.into(),
            sequence: None,
        }
    }
}

/// Handler's disposition for one forwarded entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogForwardStatus {
    Ack,
    Retry,
    Drop,
}

/// Response from the handler's log ingest
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogForwardResponse {
    pub status: LogForwardStatus,
    #[serde(default)]
    pub message: String,
    /// Server-requested delay before the next send, in milliseconds
    #[serde(default)]
    pub throttle_ms: u64,
}

/// Default logging configuration returned to a registering worker
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Maximum entries per second
    pub rate_limit: u32,
    /// Client-side buffer size
    pub buffer_size: u32,
    /// Maximum message size in bytes
    pub max_message_size: u32,
    pub include_metadata: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            rate_limit: 100,
            buffer_size: 50,
            max_message_size: 1024,
            include_metadata: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entry_deserializes_with_defaults() {
        let entry: LogEntry = serde_json::from_str(
            r#"{"worker_id": "w-1", "task_id": "t-1", "message": "hello"}"#,
        )
        .unwrap();

        assert!(entry.timestamp.is_none());
        assert!(entry.level.is_none());
        assert!(entry.source.is_none());
        assert!(entry.metadata.is_empty());
    }

    #[test]
    fn test_entry_missing_fields_deserialize_empty() {
        let entry: LogEntry = serde_json::from_str(r#"{"message": "orphan"}"#).unwrap();

        assert!(entry.worker_id.is_empty());
        assert!(entry.task_id.is_empty());
        assert_eq!(entry.message, "orphan");
    }

    #[test]
    fn test_level_wire_format() {
        let entry: LogEntry = serde_json::from_str(
            r#"{"worker_id": "w", "task_id": "t", "message": "m", "level": "WARNING", "source": "stderr"}"#,
        )
        .unwrap();

        assert_eq!(entry.level, Some(LogLevel::Warning));
        assert_eq!(entry.source, Some(LogSource::Stderr));
    }

    #[test]
    fn test_ack_response_shape() {
        let response = LogResponse::ack(7);
        let json = serde_json::to_value(&response).unwrap();

        assert_eq!(json["status"], "ack");
        assert_eq!(json["sequence"], 7);
    }
}
