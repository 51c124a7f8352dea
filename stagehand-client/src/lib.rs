//! Handler egress client
//!
//! HTTP client that forwards worker log entries to the external handler and
//! notifies it of worker status changes. The client keeps at most one
//! outbound log stream per worker id and interprets the handler's per-entry
//! disposition (ack / retry / drop plus an optional throttle).
//!
//! A mock mode simulates the handler for offline runs: nothing is dialed,
//! forwards are logged locally after a small simulated latency, and the
//! per-stream counters keep working so callers can still observe traffic.

pub mod error;

pub use error::{ClientError, Result};

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use reqwest::Client;
use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use stagehand_core::domain::log::{LogForwardResponse, LogForwardStatus, WorkerLogEntry};
use stagehand_core::dto::logs::{AckStatus, WorkerStatusAck, WorkerStatusNotification};

/// Tuning knobs for the egress client
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Retry budget advertised to the log fabric
    pub max_retries: u32,
    /// Delay between forwarding retries
    pub retry_delay: Duration,
    /// Transport connect timeout
    pub connect_timeout: Duration,
    /// Maximum lifetime of one worker stream
    pub stream_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_delay: Duration::from_secs(5),
            connect_timeout: Duration::from_secs(10),
            stream_timeout: Duration::from_secs(30 * 60),
        }
    }
}

/// Counters for one worker stream
#[derive(Debug, Clone, Copy)]
pub struct StreamStats {
    pub log_count: i64,
    pub error_count: i64,
    pub dropped_count: i64,
}

/// One outbound log stream toward the handler
struct WorkerStream {
    worker_id: String,
    task_id: String,
    created_at: chrono::DateTime<chrono::Utc>,
    last_active: Mutex<chrono::DateTime<chrono::Utc>>,
    log_count: AtomicI64,
    error_count: AtomicI64,
    dropped_count: AtomicI64,
    cancel: CancellationToken,
}

impl WorkerStream {
    fn touch(&self) {
        *self.last_active.lock().unwrap() = chrono::Utc::now();
    }

    fn stats(&self) -> StreamStats {
        StreamStats {
            log_count: self.log_count.load(Ordering::Relaxed),
            error_count: self.error_count.load(Ordering::Relaxed),
            dropped_count: self.dropped_count.load(Ordering::Relaxed),
        }
    }
}

/// HTTP client for the handler's log and status ingest
pub struct HandlerClient {
    /// Base URL of the handler (e.g. "http://handler:8080")
    base_url: String,
    http: Client,
    mock_mode: bool,
    config: ClientConfig,
    connected: RwLock<bool>,
    streams: Arc<RwLock<HashMap<String, Arc<WorkerStream>>>>,
}

impl HandlerClient {
    /// Create a new handler client
    ///
    /// # Arguments
    /// * `base_url` - Base URL of the handler ingest API
    /// * `mock_mode` - Simulate the handler instead of dialing it
    pub fn new(base_url: impl Into<String>, mock_mode: bool) -> Result<Self> {
        Self::with_config(base_url, mock_mode, ClientConfig::default())
    }

    /// Create a new handler client with custom tuning
    pub fn with_config(
        base_url: impl Into<String>,
        mock_mode: bool,
        config: ClientConfig,
    ) -> Result<Self> {
        let base_url = base_url.into();
        let http = Client::builder()
            .connect_timeout(config.connect_timeout)
            .build()?;

        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            http,
            mock_mode,
            config,
            connected: RwLock::new(false),
            streams: Arc::new(RwLock::new(HashMap::new())),
        })
    }

    /// Get the base URL of the handler
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Retry budget for callers implementing their own retry loop
    pub fn max_retries(&self) -> u32 {
        self.config.max_retries
    }

    /// Delay between caller-driven retries
    pub fn retry_delay(&self) -> Duration {
        self.config.retry_delay
    }

    /// Establish the connection to the handler
    ///
    /// In mock mode nothing is dialed. In real mode the handler's health
    /// endpoint is probed so that a misconfigured target surfaces at startup
    /// rather than on the first forwarded entry.
    pub async fn connect(&self) -> Result<()> {
        if self.is_connected() {
            return Ok(());
        }

        if self.mock_mode {
            info!("[mock] connecting to handler at {}", self.base_url);
            *self.connected.write().unwrap() = true;
            return Ok(());
        }

        let url = format!("{}/health", self.base_url);
        let response = self
            .http
            .get(&url)
            .timeout(self.config.connect_timeout)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(ClientError::api_error(
                response.status().as_u16(),
                "handler health probe failed",
            ));
        }

        *self.connected.write().unwrap() = true;
        info!("connected to handler at {}", self.base_url);
        Ok(())
    }

    /// Close every stream and the transport
    pub async fn disconnect(&self) -> Result<()> {
        if !self.is_connected() {
            return Ok(());
        }

        self.close_all_streams();
        *self.connected.write().unwrap() = false;

        if self.mock_mode {
            info!("[mock] disconnected from handler");
        } else {
            info!("disconnected from handler at {}", self.base_url);
        }
        Ok(())
    }

    pub fn is_connected(&self) -> bool {
        *self.connected.read().unwrap()
    }

    /// Open an outbound log stream for a worker
    ///
    /// At most one stream per worker id may exist. The stream is bounded by
    /// the configured stream timeout; past the deadline it is cancelled and
    /// removed so a stuck worker does not pin resources forever.
    pub async fn start_stream(
        &self,
        worker_id: impl Into<String>,
        task_id: impl Into<String>,
    ) -> Result<()> {
        let worker_id = worker_id.into();
        let task_id = task_id.into();

        let stream = {
            let mut streams = self.streams.write().unwrap();
            if streams.contains_key(&worker_id) {
                return Err(ClientError::StreamAlreadyOpen(worker_id));
            }

            let stream = Arc::new(WorkerStream {
                worker_id: worker_id.clone(),
                task_id: task_id.clone(),
                created_at: chrono::Utc::now(),
                last_active: Mutex::new(chrono::Utc::now()),
                log_count: AtomicI64::new(0),
                error_count: AtomicI64::new(0),
                dropped_count: AtomicI64::new(0),
                cancel: CancellationToken::new(),
            });
            streams.insert(worker_id.clone(), Arc::clone(&stream));
            stream
        };

        self.spawn_stream_reaper(Arc::clone(&stream));

        if self.mock_mode {
            info!(
                "[mock] started log stream for worker {} (task: {})",
                worker_id, task_id
            );
        } else {
            info!(
                "started log stream for worker {} (task: {})",
                worker_id, task_id
            );
        }
        Ok(())
    }

    /// Removes the stream once its deadline passes or it is cancelled
    fn spawn_stream_reaper(&self, stream: Arc<WorkerStream>) {
        let streams = Arc::clone(&self.streams);
        let timeout = self.config.stream_timeout;

        tokio::spawn(async move {
            tokio::select! {
                _ = stream.cancel.cancelled() => {}
                _ = tokio::time::sleep(timeout) => {
                    let last_active = *stream.last_active.lock().unwrap();
                    warn!(
                        "log stream for worker {} exceeded its deadline (opened {}, last active {}), closing",
                        stream.worker_id, stream.created_at, last_active
                    );
                    stream.cancel.cancel();
                }
            }

            let mut streams = streams.write().unwrap();
            if let Some(current) = streams.get(&stream.worker_id) {
                if Arc::ptr_eq(current, &stream) {
                    streams.remove(&stream.worker_id);
                }
            }
        });
    }

    /// Forward one log entry on an existing worker stream
    ///
    /// The handler's response is interpreted inline: an ack may carry a
    /// throttle honored before the next send, a retry surfaces as an error so
    /// the caller's retry loop takes over, and a drop is counted but not an
    /// error (the handler made a final decision about the entry).
    pub async fn forward(&self, entry: &WorkerLogEntry) -> Result<()> {
        let stream = self
            .stream_for(&entry.worker_id)
            .ok_or_else(|| ClientError::NoActiveStream(entry.worker_id.clone()))?;

        if stream.cancel.is_cancelled() {
            return Err(ClientError::StreamClosed(entry.worker_id.clone()));
        }

        stream.touch();

        if self.mock_mode {
            tokio::time::sleep(Duration::from_millis(10)).await;
            stream.log_count.fetch_add(1, Ordering::Relaxed);
            debug!(
                "[mock] forwarded log [{}|{}] {:?}: {}",
                entry.worker_id, entry.task_id, entry.level, entry.message
            );
            return Ok(());
        }

        let url = format!("{}/v1/worker-logs", self.base_url);
        let response = self.http.post(&url).json(entry).send().await?;
        let forward: LogForwardResponse = self.handle_response(response).await?;

        match forward.status {
            LogForwardStatus::Ack => {
                stream.log_count.fetch_add(1, Ordering::Relaxed);
                if forward.throttle_ms > 0 {
                    debug!(
                        "handler requested {} ms throttle for worker {}",
                        forward.throttle_ms, entry.worker_id
                    );
                    tokio::time::sleep(Duration::from_millis(forward.throttle_ms)).await;
                }
                Ok(())
            }
            LogForwardStatus::Retry => {
                stream.error_count.fetch_add(1, Ordering::Relaxed);
                Err(ClientError::RetryRequested(forward.message))
            }
            LogForwardStatus::Drop => {
                stream.dropped_count.fetch_add(1, Ordering::Relaxed);
                warn!(
                    "handler dropped log entry for worker {}: {}",
                    entry.worker_id, forward.message
                );
                Ok(())
            }
        }
    }

    /// Notify the handler of a worker status change
    pub async fn notify_status(&self, notification: &WorkerStatusNotification) -> Result<()> {
        if self.mock_mode {
            info!(
                "[mock] worker status notification: {} -> {}",
                notification.worker_id, notification.status
            );
            return Ok(());
        }

        if !self.is_connected() {
            return Err(ClientError::NotConnected);
        }

        let url = format!("{}/v1/worker-status", self.base_url);
        let response = self.http.post(&url).json(notification).send().await?;
        let ack: WorkerStatusAck = self.handle_response(response).await?;

        if ack.status != AckStatus::Received {
            warn!("worker status notification not acknowledged: {}", ack.message);
        }
        Ok(())
    }

    /// Close the log stream for a specific worker
    ///
    /// Emits a summary line with the forwarded and errored entry counts.
    /// Closing an unknown worker is a no-op.
    pub async fn close_stream(&self, worker_id: &str) -> Result<()> {
        let stream = {
            let mut streams = self.streams.write().unwrap();
            streams.remove(worker_id)
        };

        let Some(stream) = stream else {
            return Ok(());
        };

        stream.cancel.cancel();

        let stats = stream.stats();
        if self.mock_mode {
            info!(
                "[mock] closed log stream for worker {} (forwarded: {}, errors: {})",
                worker_id, stats.log_count, stats.error_count
            );
        } else {
            info!(
                "closed log stream for worker {} (forwarded: {}, errors: {})",
                worker_id, stats.log_count, stats.error_count
            );
        }
        Ok(())
    }

    fn close_all_streams(&self) {
        let mut streams = self.streams.write().unwrap();
        for (worker_id, stream) in streams.drain() {
            stream.cancel.cancel();
            info!("closed log stream for worker {}", worker_id);
        }
    }

    /// Number of currently open worker streams
    pub fn active_stream_count(&self) -> usize {
        self.streams.read().unwrap().len()
    }

    /// Counters for a specific worker's stream, if one is open
    pub fn stream_stats(&self, worker_id: &str) -> Option<StreamStats> {
        self.stream_for(worker_id).map(|s| s.stats())
    }

    /// Task id the stream was opened with, if one is open
    pub fn stream_task_id(&self, worker_id: &str) -> Option<String> {
        self.stream_for(worker_id).map(|s| s.task_id.clone())
    }

    fn stream_for(&self, worker_id: &str) -> Option<Arc<WorkerStream>> {
        self.streams.read().unwrap().get(worker_id).cloned()
    }

    /// Handle a handler response and deserialize JSON
    async fn handle_response<T: DeserializeOwned>(&self, response: reqwest::Response) -> Result<T> {
        let status = response.status();

        if !status.is_success() {
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "unknown error".to_string());
            return Err(ClientError::api_error(status.as_u16(), error_text));
        }

        response
            .json()
            .await
            .map_err(|e| ClientError::ParseError(format!("failed to parse JSON response: {}", e)))
    }
}
