//! Cluster access
//!
//! A thin, testable wrapper over pod create/get/list/delete/watch and
//! log-stream opening. The gateway carries no state beyond its connection
//! and bound namespace, surfaces errors verbatim (wrapped with the operation
//! and pod name), and never retries.

pub mod kube;
pub mod pod;
#[cfg(test)]
pub mod testing;

pub use kube::KubeGateway;
pub use pod::{Pod, PodPhase};

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

use stagehand_core::domain::log::LogSource;

/// Errors from cluster API calls
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("{operation} {pod}: {source}")]
    Request {
        operation: &'static str,
        pod: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("{operation} {pod}: status {status}: {message}")]
    Api {
        operation: &'static str,
        pod: String,
        status: u16,
        message: String,
    },

    #[error("pod {0} not found")]
    NotFound(String),

    #[error("{operation} {pod}: failed to decode response: {message}")]
    Decode {
        operation: &'static str,
        pod: String,
        message: String,
    },

    #[error("cluster authentication failed: {0}")]
    Auth(String),
}

impl GatewayError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, GatewayError::NotFound(_))
    }
}

/// Options for pod log retrieval
#[derive(Debug, Clone, Default)]
pub struct LogStreamOptions {
    /// Keep the stream open and follow new output
    pub follow: bool,
    /// Only return the last N lines
    pub tail_lines: Option<i64>,
    /// Only return lines after this instant
    pub since_time: Option<chrono::DateTime<chrono::Utc>>,
    /// Select a specific container
    pub container: Option<String>,
    /// Ask the cluster to prefix each line with its timestamp
    pub timestamps: bool,
    /// Read the previous container instance's logs
    pub previous: bool,
}

/// A single log line collected from a pod
#[derive(Debug, Clone)]
pub struct LogLine {
    pub pod_name: String,
    pub container: Option<String>,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub message: String,
    /// Best-effort hint; the logs API does not distinguish streams
    pub source: LogSource,
}

/// Namespace-scoped pod operations against the cluster API
#[async_trait]
pub trait ClusterGateway: Send + Sync {
    async fn create_pod(&self, pod: Pod) -> Result<Pod, GatewayError>;

    async fn get_pod(&self, name: &str) -> Result<Pod, GatewayError>;

    async fn list_pods(&self, label_selector: &str) -> Result<Vec<Pod>, GatewayError>;

    async fn delete_pod(&self, name: &str) -> Result<(), GatewayError>;

    /// Follow a pod's state until a terminal phase is observed
    ///
    /// The channel closes on terminal transition, stream end, or when the
    /// receiver is dropped.
    async fn watch_pod(&self, name: &str) -> Result<mpsc::Receiver<Pod>, GatewayError>;

    /// Stream a pod's log output line by line
    ///
    /// Returns a log channel and an error channel; both close on EOF or when
    /// the receiver is dropped.
    async fn stream_pod_logs(
        &self,
        name: &str,
        options: LogStreamOptions,
    ) -> Result<(mpsc::Receiver<LogLine>, mpsc::Receiver<GatewayError>), GatewayError>;

    /// Fetch a pod's logs in one shot
    async fn get_pod_logs(
        &self,
        name: &str,
        options: LogStreamOptions,
    ) -> Result<String, GatewayError>;

    /// Namespace every operation is scoped to
    fn namespace(&self) -> &str;
}
