//! Log fabric
//!
//! Ingests log entries from worker pods, validates them, forwards them to the
//! handler through the egress client, and answers each entry with ack, retry
//! or drop. Sessions bind a worker to its ingest channel and carry the
//! per-session sequence counter.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use stagehand_client::{ClientError, HandlerClient};
use stagehand_core::domain::log::{
    LogEntry, LogLevel, LogResponse, LogSource, LoggingConfig, PodMetadata, WorkerLogEntry,
};
use stagehand_core::dto::logs::{RegistrationRequest, RegistrationResponse, RegistrationStatus};

/// Fabric tuning
#[derive(Debug, Clone)]
pub struct FabricConfig {
    /// Cap on sessions bound to one worker id
    pub max_sessions_per_worker: usize,
    /// Forwarding attempts beyond the first
    pub max_retries: u32,
    /// Delay between forwarding attempts
    pub retry_delay: Duration,
    /// Age past which the sweep drops a session
    pub stream_timeout: Duration,
    /// Cadence of the session sweep
    pub sweep_interval: Duration,
    /// Bound of the per-session ingest channel
    pub ingest_buffer: usize,
    /// Bound of the per-connection response channel
    pub response_buffer: usize,
}

impl Default for FabricConfig {
    fn default() -> Self {
        Self {
            max_sessions_per_worker: 5,
            max_retries: 3,
            retry_delay: Duration::from_secs(5),
            stream_timeout: Duration::from_secs(30 * 60),
            sweep_interval: Duration::from_secs(5 * 60),
            ingest_buffer: 1000,
            response_buffer: 100,
        }
    }
}

#[derive(Debug, Error)]
pub enum FabricError {
    #[error("invalid registration: {0}")]
    InvalidRegistration(String),
}

#[derive(Debug, Default)]
struct SessionState {
    last_active: Option<chrono::DateTime<chrono::Utc>>,
    log_count: i64,
    error_count: i64,
    dropped_count: i64,
    is_active: bool,
}

/// An active log streaming session
pub struct Session {
    pub session_id: String,
    pub worker_id: String,
    pub task_id: String,
    pub created_at: chrono::DateTime<chrono::Utc>,
    state: Mutex<SessionState>,
    ingest_tx: mpsc::Sender<LogEntry>,
    ingest_rx: Mutex<Option<mpsc::Receiver<LogEntry>>>,
}

impl Session {
    fn new(worker_id: String, task_id: String, ingest_buffer: usize) -> Self {
        let (ingest_tx, ingest_rx) = mpsc::channel(ingest_buffer);
        Self {
            session_id: format!("{}-{}", worker_id, uuid::Uuid::new_v4().simple()),
            worker_id,
            task_id,
            created_at: chrono::Utc::now(),
            state: Mutex::new(SessionState {
                last_active: Some(chrono::Utc::now()),
                is_active: true,
                ..Default::default()
            }),
            ingest_tx,
            ingest_rx: Mutex::new(Some(ingest_rx)),
        }
    }

    pub fn is_active(&self) -> bool {
        self.state.lock().unwrap().is_active
    }

    pub fn log_count(&self) -> i64 {
        self.state.lock().unwrap().log_count
    }

    pub fn error_count(&self) -> i64 {
        self.state.lock().unwrap().error_count
    }

    pub fn dropped_count(&self) -> i64 {
        self.state.lock().unwrap().dropped_count
    }

    /// Bounded sender feeding this session's processor
    ///
    /// A full channel backpressures the producing connection until drained.
    pub fn ingest_sender(&self) -> mpsc::Sender<LogEntry> {
        self.ingest_tx.clone()
    }

    /// Claims the ingest receiver for a processor task
    ///
    /// Returns `None` while another processor holds it.
    pub fn take_receiver(&self) -> Option<mpsc::Receiver<LogEntry>> {
        self.ingest_rx.lock().unwrap().take()
    }

    /// Returns the ingest receiver after a processor shuts down
    pub fn restore_receiver(&self, rx: mpsc::Receiver<LogEntry>) {
        *self.ingest_rx.lock().unwrap() = Some(rx);
    }

    fn touch(&self) {
        self.state.lock().unwrap().last_active = Some(chrono::Utc::now());
    }

    fn next_sequence(&self) -> i64 {
        let mut state = self.state.lock().unwrap();
        state.log_count += 1;
        state.log_count
    }

    fn record_error(&self) {
        self.state.lock().unwrap().error_count += 1;
    }

    fn record_drop(&self) {
        self.state.lock().unwrap().dropped_count += 1;
    }

    fn deactivate(&self) {
        self.state.lock().unwrap().is_active = false;
    }
}

/// Disposition of one inbound entry before processing
pub enum Triage {
    /// Entry rejected up front; respond without touching the session channel
    Rejected(LogResponse),
    /// Entry bound to a session and ready to process
    Accepted(Arc<Session>, LogEntry),
}

/// Ingress side of the log streaming surface
pub struct LogFabric {
    handler: Arc<HandlerClient>,
    namespace: String,
    config: FabricConfig,
    sessions: RwLock<HashMap<String, Arc<Session>>>,
    dropped_entries: AtomicI64,
}

impl LogFabric {
    pub fn new(handler: Arc<HandlerClient>, namespace: String, config: FabricConfig) -> Self {
        Self {
            handler,
            namespace,
            config,
            sessions: RwLock::new(HashMap::new()),
            dropped_entries: AtomicI64::new(0),
        }
    }

    pub fn config(&self) -> &FabricConfig {
        &self.config
    }

    /// Registers a worker and opens a session for it
    ///
    /// Idempotent for an active worker: re-registration returns the original
    /// session id with `already_registered`. A worker that has exhausted its
    /// session cap gets `server_full`.
    pub fn register(&self, req: &RegistrationRequest) -> Result<RegistrationResponse, FabricError> {
        if req.worker_id.is_empty() {
            return Err(FabricError::InvalidRegistration(
                "worker_id is required".to_string(),
            ));
        }
        if req.task_id.is_empty() {
            return Err(FabricError::InvalidRegistration(
                "task_id is required".to_string(),
            ));
        }

        debug!(
            "worker registration request: worker_id={}, task_id={}",
            req.worker_id, req.task_id
        );

        let mut sessions = self.sessions.write().unwrap();

        if let Some(existing) = sessions
            .values()
            .find(|s| s.worker_id == req.worker_id && s.is_active())
        {
            warn!("worker {} is already registered", req.worker_id);
            return Ok(RegistrationResponse {
                status: RegistrationStatus::AlreadyRegistered,
                message: format!("worker {} is already registered", req.worker_id),
                session_id: Some(existing.session_id.clone()),
                config: Some(LoggingConfig::default()),
            });
        }

        let session_count = sessions
            .values()
            .filter(|s| s.worker_id == req.worker_id)
            .count();
        if session_count >= self.config.max_sessions_per_worker {
            warn!(
                "worker {} has too many sessions: {}",
                req.worker_id, session_count
            );
            return Ok(RegistrationResponse {
                status: RegistrationStatus::ServerFull,
                message: format!("maximum sessions reached for worker {}", req.worker_id),
                session_id: None,
                config: None,
            });
        }

        let session = Arc::new(Session::new(
            req.worker_id.clone(),
            req.task_id.clone(),
            self.config.ingest_buffer,
        ));
        let session_id = session.session_id.clone();
        sessions.insert(session_id.clone(), session);

        info!(
            "worker registered: worker_id={}, session_id={}",
            req.worker_id, session_id
        );

        Ok(RegistrationResponse {
            status: RegistrationStatus::Success,
            message: format!("worker {} registered successfully", req.worker_id),
            session_id: Some(session_id),
            config: Some(LoggingConfig::default()),
        })
    }

    /// Finds the active session for a worker
    pub fn find_session(&self, worker_id: &str) -> Option<Arc<Session>> {
        self.sessions
            .read()
            .unwrap()
            .values()
            .find(|s| s.worker_id == worker_id && s.is_active())
            .cloned()
    }

    /// Validates and binds one inbound entry
    ///
    /// Entries missing any required field, and entries from unregistered
    /// workers, are rejected with a drop response carrying a diagnostic.
    pub fn triage(&self, bound: &mut Option<Arc<Session>>, entry: LogEntry) -> Triage {
        if let Some(diagnostic) = validate_entry(&entry) {
            self.dropped_entries.fetch_add(1, Ordering::Relaxed);
            if let Some(session) = bound {
                session.record_drop();
            }
            return Triage::Rejected(LogResponse::drop_entry(diagnostic));
        }

        let session = match bound {
            Some(session) => Arc::clone(session),
            None => match self.find_session(&entry.worker_id) {
                Some(session) => {
                    debug!("stream bound to session {}", session.session_id);
                    *bound = Some(Arc::clone(&session));
                    session
                }
                None => {
                    self.dropped_entries.fetch_add(1, Ordering::Relaxed);
                    return Triage::Rejected(LogResponse::drop_entry(format!(
                        "worker {} not registered",
                        entry.worker_id
                    )));
                }
            },
        };

        Triage::Accepted(session, entry)
    }

    /// Processes one validated entry: fill defaults, forward, acknowledge
    pub async fn process_entry(
        &self,
        session: &Arc<Session>,
        mut entry: LogEntry,
        cancel: &CancellationToken,
    ) -> LogResponse {
        session.touch();

        if entry.timestamp.is_none() {
            entry.timestamp = Some(chrono::Utc::now());
        }
        if entry.level.is_none() {
            entry.level = Some(LogLevel::Info);
        }
        if entry.source.is_none() {
            entry.source = Some(LogSource::Stdout);
        }

        let egress = self.to_egress(session, entry);
        match self.forward_with_retry(session, &egress, cancel).await {
            Ok(()) => LogResponse::ack(session.next_sequence()),
            Err(e) => {
                session.record_error();
                warn!(
                    "log entry for worker {} not forwarded after retries: {}",
                    session.worker_id, e
                );
                LogResponse::retry(format!("forwarding failed: {}", e))
            }
        }
    }

    /// Validates, binds and processes one entry in a single call
    pub async fn handle_entry(
        &self,
        bound: &mut Option<Arc<Session>>,
        entry: LogEntry,
        cancel: &CancellationToken,
    ) -> LogResponse {
        match self.triage(bound, entry) {
            Triage::Rejected(response) => response,
            Triage::Accepted(session, entry) => self.process_entry(&session, entry, cancel).await,
        }
    }

    /// Forwards to the handler, retrying on dependency failures
    async fn forward_with_retry(
        &self,
        session: &Session,
        entry: &WorkerLogEntry,
        cancel: &CancellationToken,
    ) -> Result<(), ClientError> {
        if self.handler.stream_stats(&session.worker_id).is_none() {
            match self
                .handler
                .start_stream(&session.worker_id, &session.task_id)
                .await
            {
                Ok(()) => debug!("started handler log stream for worker {}", session.worker_id),
                // Lost the race against another entry; the stream exists now.
                Err(ClientError::StreamAlreadyOpen(_)) => {}
                Err(e) => return Err(e),
            }
        }

        let mut last_err = None;
        for attempt in 0..=self.config.max_retries {
            if attempt > 0 {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(self.config.retry_delay) => {}
                }
            }

            match self.handler.forward(entry).await {
                Ok(()) => {
                    if attempt > 0 {
                        info!("log forward succeeded on attempt {}", attempt + 1);
                    }
                    return Ok(());
                }
                Err(e) => {
                    warn!("log forward attempt {} failed: {}", attempt + 1, e);
                    last_err = Some(e);
                }
            }
        }

        Err(last_err.unwrap_or(ClientError::NotConnected))
    }

    fn to_egress(&self, session: &Session, entry: LogEntry) -> WorkerLogEntry {
        WorkerLogEntry {
            worker_id: entry.worker_id,
            task_id: entry.task_id,
            timestamp: entry.timestamp.unwrap_or_else(chrono::Utc::now),
            level: entry.level.unwrap_or(LogLevel::Info),
            source: entry.source.unwrap_or(LogSource::Stdout),
            message: entry.message,
            pod_metadata: PodMetadata {
                pod_name: session.worker_id.clone(),
                namespace: self.namespace.clone(),
                created_at: session.created_at,
            },
            metadata: entry.metadata,
        }
    }

    /// Deactivates a session, typically when its connection goes away
    pub fn deactivate_session(&self, session_id: &str) {
        let sessions = self.sessions.read().unwrap();
        if let Some(session) = sessions.get(session_id) {
            session.deactivate();
            info!(
                "session deactivated: {} (logs: {}, errors: {}, dropped: {})",
                session_id,
                session.log_count(),
                session.error_count(),
                session.dropped_count()
            );
        }
    }

    /// Drops sessions that are inactive or older than the stream timeout
    ///
    /// Note the age check is on creation time, not last activity; a
    /// long-running healthy session ages out too. This mirrors the upstream
    /// contract and is intentionally left as-is.
    pub fn sweep_sessions(&self) -> usize {
        let cutoff = chrono::Utc::now()
            - chrono::Duration::from_std(self.config.stream_timeout)
                .unwrap_or_else(|_| chrono::Duration::seconds(0));

        let mut sessions = self.sessions.write().unwrap();
        let expired: Vec<String> = sessions
            .values()
            .filter(|session| !session.is_active() || session.created_at < cutoff)
            .map(|session| session.session_id.clone())
            .collect();

        for session_id in &expired {
            if let Some(session) = sessions.remove(session_id) {
                let state = session.state.lock().unwrap();
                debug!(
                    "dropping session {} (created {}, last active {:?})",
                    session_id, session.created_at, state.last_active
                );
            }
        }

        if !expired.is_empty() {
            info!("cleaned up {} inactive sessions", expired.len());
        }
        expired.len()
    }

    pub fn active_session_count(&self) -> usize {
        self.sessions
            .read()
            .unwrap()
            .values()
            .filter(|s| s.is_active())
            .count()
    }

    /// Entries rejected before reaching the handler
    pub fn dropped_entry_count(&self) -> i64 {
        self.dropped_entries.load(Ordering::Relaxed)
    }
}

/// Checks an entry for the required fields
///
/// Returns a diagnostic naming the first missing field, or `None` when the
/// entry is acceptable.
fn validate_entry(entry: &LogEntry) -> Option<String> {
    if entry.worker_id.is_empty() {
        return Some("worker_id is required".to_string());
    }
    if entry.task_id.is_empty() {
        return Some("task_id is required".to_string());
    }
    if entry.message.is_empty() {
        return Some("message is required".to_string());
    }
    None
}
