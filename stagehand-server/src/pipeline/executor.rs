//! Pipeline executor
//!
//! Groups a pipeline's stages into dependency levels, runs the stages of a
//! level in parallel and the levels in sequence, and emits a progress stream
//! back to the caller. A stage failure past its retry budget cancels the
//! pipeline, marks still-pending stages skipped, and closes the stream with
//! a terminal failure event.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use stagehand_core::domain::pipeline::{
    PipelineRequest, ProgressEvent, Stage, StageMetrics, StageStatus,
};
use stagehand_core::domain::worker::{ResourceLimits, WorkerSpec};
use stagehand_core::names;

use crate::config::WorkerSettings;
use crate::worker::{WorkerError, WorkerManager};

use super::PipelineRegistry;

/// Progress channel bound; intermediate events past this are dropped
const PROGRESS_BUFFER: usize = 100;

/// Errors from pipeline admission and execution
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("invalid pipeline request: {0}")]
    InvalidRequest(String),

    #[error("pipeline {0} is already running")]
    AlreadyRunning(String),

    #[error("circular dependency detected among stages {0:?}")]
    Cycle(Vec<String>),

    #[error("stage {stage_id}: {message}")]
    Stage { stage_id: String, message: String },

    #[error("pipeline canceled")]
    Canceled,
}

/// Mutable execution record for one stage, owned by its executor
#[derive(Debug, Clone)]
pub struct StageExecution {
    pub stage: Stage,
    pub status: StageStatus,
    pub worker_pod_names: Vec<String>,
    pub started_at: Option<chrono::DateTime<chrono::Utc>>,
    pub completed_at: Option<chrono::DateTime<chrono::Utc>>,
    pub retry_count: u32,
    pub last_error: Option<String>,
    pub metrics: Option<StageMetrics>,
}

impl StageExecution {
    fn new(stage: Stage) -> Self {
        Self {
            stage,
            status: StageStatus::Pending,
            worker_pod_names: Vec::new(),
            started_at: None,
            completed_at: None,
            retry_count: 0,
            last_error: None,
            metrics: None,
        }
    }
}

/// Executes one pipeline request
pub struct PipelineExecutor {
    manager: Arc<WorkerManager>,
    worker_settings: WorkerSettings,
    request: PipelineRequest,
    stages: Mutex<HashMap<String, StageExecution>>,
    levels: Vec<Vec<String>>,
    progress_tx: mpsc::Sender<ProgressEvent>,
    cancel: CancellationToken,
    registry: Arc<PipelineRegistry>,
    started_at: chrono::DateTime<chrono::Utc>,
}

impl PipelineExecutor {
    /// Admits a pipeline request and starts executing it
    ///
    /// Returns the progress stream and the pipeline's cancellation token.
    /// The stream always terminates with a `completed` or `failed`
    /// pipeline-level event and is closed exactly once. Cancelling the token
    /// collapses every in-flight stage and worker wait.
    pub fn start(
        manager: Arc<WorkerManager>,
        worker_settings: WorkerSettings,
        registry: Arc<PipelineRegistry>,
        parent: &CancellationToken,
        request: PipelineRequest,
    ) -> Result<(mpsc::Receiver<ProgressEvent>, CancellationToken), PipelineError> {
        if request.pipeline_id.is_empty() {
            return Err(PipelineError::InvalidRequest(
                "pipeline_id is required".to_string(),
            ));
        }
        if request.stages.is_empty() {
            return Err(PipelineError::InvalidRequest(
                "at least one stage is required".to_string(),
            ));
        }

        let levels = build_execution_order(&request.stages)?;

        if !registry.register(&request.pipeline_id) {
            return Err(PipelineError::AlreadyRunning(request.pipeline_id));
        }

        info!(
            "pipeline execution started: {} ({}, {} stages)",
            request.pipeline_id,
            request.name,
            request.stages.len()
        );
        for (index, level) in levels.iter().enumerate() {
            debug!("  level {} (parallel): {:?}", index + 1, level);
        }

        let (progress_tx, progress_rx) = mpsc::channel(PROGRESS_BUFFER);
        let cancel = parent.child_token();
        let stages = request
            .stages
            .iter()
            .map(|stage| (stage.id.clone(), StageExecution::new(stage.clone())))
            .collect();

        let executor = Arc::new(Self {
            manager,
            worker_settings,
            request,
            stages: Mutex::new(stages),
            levels,
            progress_tx,
            cancel: cancel.clone(),
            registry,
            started_at: chrono::Utc::now(),
        });

        tokio::spawn(executor.run());

        Ok((progress_rx, cancel))
    }

    async fn run(self: Arc<Self>) {
        self.send_required(ProgressEvent::pipeline(
            &self.request.pipeline_id,
            StageStatus::Pending,
            format!("pipeline {} started", self.request.name),
            0,
        ))
        .await;

        match self.run_levels().await {
            Ok(()) => {
                let duration = chrono::Utc::now() - self.started_at;
                self.send_required(ProgressEvent::pipeline(
                    &self.request.pipeline_id,
                    StageStatus::Completed,
                    format!("pipeline completed in {}s", duration.num_seconds()),
                    100,
                ))
                .await;
                info!(
                    "pipeline {} completed successfully",
                    self.request.pipeline_id
                );
            }
            Err(e) => self.handle_failure(&e).await,
        }

        self.registry.remove(&self.request.pipeline_id);
        debug!("pipeline executor removed: {}", self.request.pipeline_id);
    }

    async fn run_levels(self: &Arc<Self>) -> Result<(), PipelineError> {
        for (index, level) in self.levels.iter().enumerate() {
            info!("level {} starting: {:?}", index + 1, level);

            let mut handles = Vec::with_capacity(level.len());
            for stage_id in level {
                let executor = Arc::clone(self);
                let stage_id = stage_id.clone();
                handles.push(tokio::spawn(async move {
                    executor.execute_stage(&stage_id).await
                }));
            }

            let mut first_error = None;
            for handle in handles {
                let result = match handle.await {
                    Ok(result) => result,
                    Err(e) => Err(PipelineError::Stage {
                        stage_id: String::new(),
                        message: format!("stage task panicked: {}", e),
                    }),
                };
                if let Err(e) = result {
                    if first_error.is_none() {
                        first_error = Some(e);
                    }
                }
            }

            if let Some(e) = first_error {
                error!("level {} failed: {}", index + 1, e);
                // Fail fast: collapse the rest of the pipeline.
                self.cancel.cancel();
                return Err(e);
            }

            info!("level {} complete", index + 1);
        }
        Ok(())
    }

    /// Runs one stage to completion, re-entering on retry
    async fn execute_stage(&self, stage_id: &str) -> Result<(), PipelineError> {
        loop {
            let error = match self.attempt_stage(stage_id).await {
                Ok(()) => return Ok(()),
                Err(e) => e,
            };

            if self.cancel.is_cancelled() {
                return Err(PipelineError::Canceled);
            }

            if let Some((attempt, max_attempts, delay)) = self.arm_retry(stage_id) {
                info!("stage {} retrying ({}/{})", stage_id, attempt, max_attempts);
                self.send_stage_progress(
                    stage_id,
                    StageStatus::Retrying,
                    format!("retry {}/{}", attempt, max_attempts),
                    0,
                );

                tokio::select! {
                    _ = self.cancel.cancelled() => return Err(PipelineError::Canceled),
                    _ = tokio::time::sleep(delay) => {}
                }
                continue;
            }

            let stage_name = self.stage_name(stage_id);
            self.send_stage_progress(
                stage_id,
                StageStatus::Failed,
                format!("stage {} failed: {}", stage_name, error),
                0,
            );
            return Err(error);
        }
    }

    /// One attempt of a stage: synthesize specs, run workers, record outcome
    async fn attempt_stage(&self, stage_id: &str) -> Result<(), PipelineError> {
        let (stage, mut specs) = {
            let mut stages = self.stages.lock().unwrap();
            let Some(exec) = stages.get_mut(stage_id) else {
                return Err(PipelineError::Stage {
                    stage_id: stage_id.to_string(),
                    message: "unknown stage".to_string(),
                });
            };

            let stage = exec.stage.clone();
            let specs = self.build_worker_specs(&stage);
            exec.worker_pod_names = specs.iter().map(|s| s.name.clone()).collect();
            exec.status = StageStatus::Running;
            exec.started_at = Some(chrono::Utc::now());
            (stage, specs)
        };

        info!("stage execution started: {} ({})", stage.id, stage.name);
        self.send_stage_progress(
            stage_id,
            StageStatus::Running,
            format!("stage {} started", stage.name),
            0,
        );

        let result = if specs.len() == 1 {
            self.manager
                .run_worker(specs.remove(0), self.cancel.clone())
                .await
                .map(|_| ())
        } else {
            self.manager
                .run_batch(specs, self.cancel.clone())
                .await
                .map(|_| ())
        };

        let finished_at = chrono::Utc::now();
        match result {
            Ok(()) => {
                let duration_seconds = {
                    let mut stages = self.stages.lock().unwrap();
                    let Some(exec) = stages.get_mut(stage_id) else {
                        return Ok(());
                    };
                    exec.status = StageStatus::Completed;
                    exec.completed_at = Some(finished_at);
                    let duration = exec
                        .started_at
                        .map(|s| (finished_at - s).num_seconds())
                        .unwrap_or(0);
                    exec.metrics = Some(StageMetrics {
                        duration_seconds: duration,
                        successful_workers: stage.worker_count,
                        total_workers: stage.worker_count,
                    });
                    duration
                };

                self.send_stage_progress(
                    stage_id,
                    StageStatus::Completed,
                    format!("stage {} completed in {}s", stage.name, duration_seconds),
                    100,
                );
                info!("stage completed: {}", stage_id);
                Ok(())
            }
            Err(e) => {
                let canceled = matches!(e, WorkerError::Canceled { .. });
                {
                    let mut stages = self.stages.lock().unwrap();
                    if let Some(exec) = stages.get_mut(stage_id) {
                        exec.status = StageStatus::Failed;
                        exec.completed_at = Some(finished_at);
                        exec.last_error = Some(e.to_string());
                    }
                }

                if canceled {
                    Err(PipelineError::Canceled)
                } else {
                    error!("stage {} failed: {}", stage_id, e);
                    Err(PipelineError::Stage {
                        stage_id: stage_id.to_string(),
                        message: e.to_string(),
                    })
                }
            }
        }
    }

    /// Consumes one retry if the stage's policy still allows it
    fn arm_retry(&self, stage_id: &str) -> Option<(u32, u32, Duration)> {
        let mut stages = self.stages.lock().unwrap();
        let exec = stages.get_mut(stage_id)?;
        let policy = exec.stage.retry?;

        if exec.retry_count >= policy.max_attempts {
            return None;
        }

        exec.retry_count += 1;
        exec.status = StageStatus::Retrying;
        Some((
            exec.retry_count,
            policy.max_attempts,
            Duration::from_secs(policy.delay_seconds),
        ))
    }

    /// Marks pending stages skipped and closes the stream with a failure
    async fn handle_failure(&self, error: &PipelineError) {
        let skipped: Vec<String> = {
            let mut stages = self.stages.lock().unwrap();
            let mut skipped: Vec<String> = stages
                .iter_mut()
                .filter(|(_, exec)| exec.status == StageStatus::Pending)
                .map(|(id, exec)| {
                    exec.status = StageStatus::Skipped;
                    id.clone()
                })
                .collect();
            skipped.sort();
            skipped
        };

        for stage_id in &skipped {
            self.send_stage_progress(
                stage_id,
                StageStatus::Skipped,
                format!("stage {} skipped", stage_id),
                0,
            );
        }

        self.send_required(ProgressEvent::pipeline(
            &self.request.pipeline_id,
            StageStatus::Failed,
            format!("pipeline failed: {}", error),
            0,
        ))
        .await;

        error!("pipeline {} failed: {}", self.request.pipeline_id, error);
    }

    /// Worker specs for one stage, indexed 1..=worker_count
    fn build_worker_specs(&self, stage: &Stage) -> Vec<WorkerSpec> {
        let image = stage
            .image
            .clone()
            .filter(|image| !image.is_empty())
            .unwrap_or_else(|| self.worker_settings.image.clone());

        let mut labels: HashMap<String, String> = self.worker_settings.labels.clone();
        labels.insert(
            names::MANAGED_BY_LABEL.to_string(),
            names::MANAGED_BY_VALUE.to_string(),
        );
        labels.insert(
            names::PIPELINE_ID_LABEL.to_string(),
            names::sanitize_label_value(&self.request.pipeline_id),
        );
        labels.insert(
            names::STAGE_ID_LABEL.to_string(),
            names::sanitize_label_value(&stage.id),
        );
        labels.insert(
            names::STAGE_TYPE_LABEL.to_string(),
            names::sanitize_label_value(&stage.stage_type),
        );

        let mut stem = format!(
            "{}-{}-{}",
            names::POD_NAME_PREFIX,
            names::sanitize_pod_name(&self.request.pipeline_id),
            names::sanitize_pod_name(&stage.id)
        );
        names::truncate_on_boundary(&mut stem, 50);
        let stem = stem.trim_end_matches('-').to_string();

        (1..=stage.worker_count)
            .map(|index| WorkerSpec {
                name: format!("{}-{}", stem, index),
                image: image.clone(),
                command: stage.command.clone(),
                args: stage.args.clone(),
                labels: labels.clone(),
                resources: Some(ResourceLimits {
                    cpu_limit: Some(self.worker_settings.cpu_limit.clone()),
                    memory_limit: Some(self.worker_settings.memory_limit.clone()),
                    ..Default::default()
                }),
            })
            .collect()
    }

    fn stage_name(&self, stage_id: &str) -> String {
        self.stages
            .lock()
            .unwrap()
            .get(stage_id)
            .map(|exec| exec.stage.name.clone())
            .unwrap_or_else(|| stage_id.to_string())
    }

    /// Non-blocking send for intermediate events; a full channel drops them
    fn send_stage_progress(
        &self,
        stage_id: &str,
        status: StageStatus,
        message: String,
        percentage: i32,
    ) {
        let event = self.stage_event(stage_id, status, message, percentage);
        match self.progress_tx.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(event)) => warn!(
                "progress channel full, dropping {:?} event for stage {}",
                event.status, stage_id
            ),
            Err(TrySendError::Closed(_)) => debug!(
                "progress receiver gone for pipeline {}",
                self.request.pipeline_id
            ),
        }
    }

    /// Blocking send for the start and terminal envelopes; never dropped
    async fn send_required(&self, event: ProgressEvent) {
        if self.progress_tx.send(event).await.is_err() {
            debug!(
                "progress receiver gone for pipeline {}",
                self.request.pipeline_id
            );
        }
    }

    fn stage_event(
        &self,
        stage_id: &str,
        status: StageStatus,
        message: String,
        percentage: i32,
    ) -> ProgressEvent {
        let stages = self.stages.lock().unwrap();
        let exec = stages.get(stage_id);

        ProgressEvent {
            pipeline_id: self.request.pipeline_id.clone(),
            stage_id: Some(stage_id.to_string()),
            status,
            message,
            progress_percentage: percentage,
            timestamp: chrono::Utc::now(),
            worker_pod_names: exec.map(|e| e.worker_pod_names.clone()).unwrap_or_default(),
            metrics: exec.and_then(|e| e.metrics),
            started_at: exec.and_then(|e| e.started_at),
            completed_at: exec.and_then(|e| e.completed_at),
            error_message: exec.and_then(|e| e.last_error.clone()),
        }
    }
}

/// Groups stages into parallel levels by dependency order
///
/// Repeatedly collects every stage with no unmet dependency into a level.
/// An iteration that finds none while stages remain means the dependency
/// graph has a cycle.
pub fn build_execution_order(stages: &[Stage]) -> Result<Vec<Vec<String>>, PipelineError> {
    let mut in_degree: HashMap<&str, usize> = HashMap::new();
    for stage in stages {
        if stage.worker_count == 0 {
            return Err(PipelineError::InvalidRequest(format!(
                "stage {} has a zero worker count",
                stage.id
            )));
        }
        if in_degree.insert(stage.id.as_str(), stage.depends_on.len()).is_some() {
            return Err(PipelineError::InvalidRequest(format!(
                "duplicate stage id {}",
                stage.id
            )));
        }
    }

    let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();
    for stage in stages {
        for dep in &stage.depends_on {
            if !in_degree.contains_key(dep.as_str()) {
                return Err(PipelineError::InvalidRequest(format!(
                    "stage {} depends on unknown stage {}",
                    stage.id, dep
                )));
            }
            dependents
                .entry(dep.as_str())
                .or_default()
                .push(stage.id.as_str());
        }
    }

    let mut order = Vec::new();
    while !in_degree.is_empty() {
        let mut level: Vec<String> = in_degree
            .iter()
            .filter(|(_, degree)| **degree == 0)
            .map(|(id, _)| id.to_string())
            .collect();

        if level.is_empty() {
            let mut remaining: Vec<String> = in_degree.keys().map(|id| id.to_string()).collect();
            remaining.sort();
            return Err(PipelineError::Cycle(remaining));
        }
        level.sort();

        for stage_id in &level {
            in_degree.remove(stage_id.as_str());
            if let Some(children) = dependents.get(stage_id.as_str()) {
                for child in children {
                    if let Some(degree) = in_degree.get_mut(child) {
                        *degree -= 1;
                    }
                }
            }
        }

        order.push(level);
    }

    Ok(order)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::testing::FakeGateway;
    use crate::cluster::PodPhase;
    use crate::worker::ManagerConfig;
    use stagehand_core::domain::pipeline::RetryPolicy;

    fn worker_settings() -> WorkerSettings {
        WorkerSettings {
            image: "busybox:latest".to_string(),
            cpu_limit: "500m".to_string(),
            memory_limit: "128Mi".to_string(),
            labels: HashMap::new(),
        }
    }

    fn stage(id: &str, deps: &[&str]) -> Stage {
        Stage {
            id: id.to_string(),
            name: id.to_string(),
            stage_type: "build".to_string(),
            image: None,
            command: vec!["true".to_string()],
            args: Vec::new(),
            worker_count: 1,
            depends_on: deps.iter().map(|d| d.to_string()).collect(),
            retry: None,
        }
    }

    fn request(pipeline_id: &str, stages: Vec<Stage>) -> PipelineRequest {
        PipelineRequest {
            pipeline_id: pipeline_id.to_string(),
            name: format!("pipeline {}", pipeline_id),
            stages,
            repository: "acme/app".to_string(),
            commit_sha: "deadbeef".to_string(),
            triggered_by: "ci".to_string(),
            reason: "push".to_string(),
        }
    }

    fn setup() -> (Arc<FakeGateway>, Arc<WorkerManager>, Arc<PipelineRegistry>) {
        let gateway = Arc::new(FakeGateway::new());
        let manager = Arc::new(WorkerManager::new(
            Arc::clone(&gateway) as Arc<dyn crate::cluster::ClusterGateway>,
            ManagerConfig {
                poll_interval: Duration::from_millis(5),
                cleanup_timeout: Duration::from_secs(1),
            },
        ));
        (gateway, manager, Arc::new(PipelineRegistry::new()))
    }

    async fn collect(mut rx: mpsc::Receiver<ProgressEvent>) -> Vec<ProgressEvent> {
        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }
        events
    }

    fn stage_statuses(events: &[ProgressEvent], stage_id: &str) -> Vec<StageStatus> {
        events
            .iter()
            .filter(|e| e.stage_id.as_deref() == Some(stage_id))
            .map(|e| e.status)
            .collect()
    }

    #[test]
    fn test_execution_order_diamond() {
        let stages = vec![
            stage("a", &[]),
            stage("b", &[]),
            stage("c", &[]),
            stage("d", &["a", "b", "c"]),
        ];

        let levels = build_execution_order(&stages).unwrap();
        assert_eq!(levels, vec![vec!["a", "b", "c"], vec!["d"]]);
    }

    #[test]
    fn test_execution_order_chain() {
        let stages = vec![stage("build", &[]), stage("test", &["build"]), stage("deploy", &["test"])];

        let levels = build_execution_order(&stages).unwrap();
        assert_eq!(levels, vec![vec!["build"], vec!["test"], vec!["deploy"]]);
    }

    #[test]
    fn test_cross_level_edges_point_forward() {
        let stages = vec![
            stage("a", &[]),
            stage("b", &["a"]),
            stage("c", &["a"]),
            stage("d", &["b", "c"]),
            stage("e", &["a", "d"]),
        ];

        let levels = build_execution_order(&stages).unwrap();
        let level_of: HashMap<&str, usize> = levels
            .iter()
            .enumerate()
            .flat_map(|(i, level)| level.iter().map(move |id| (id.as_str(), i)))
            .collect();

        for s in &stages {
            for dep in &s.depends_on {
                assert!(level_of[dep.as_str()] < level_of[s.id.as_str()]);
            }
        }
    }

    #[test]
    fn test_cycle_detected() {
        let stages = vec![stage("a", &["b"]), stage("b", &["a"])];
        assert!(matches!(
            build_execution_order(&stages),
            Err(PipelineError::Cycle(_))
        ));
    }

    #[test]
    fn test_self_edge_is_a_cycle() {
        let stages = vec![stage("a", &["a"])];
        assert!(matches!(
            build_execution_order(&stages),
            Err(PipelineError::Cycle(_))
        ));
    }

    #[test]
    fn test_unknown_dependency_rejected() {
        let stages = vec![stage("a", &["ghost"])];
        assert!(matches!(
            build_execution_order(&stages),
            Err(PipelineError::InvalidRequest(_))
        ));
    }

    #[test]
    fn test_duplicate_stage_id_rejected() {
        let stages = vec![stage("a", &[]), stage("a", &[])];
        assert!(matches!(
            build_execution_order(&stages),
            Err(PipelineError::InvalidRequest(_))
        ));
    }

    #[test]
    fn test_zero_worker_count_rejected() {
        let mut bad = stage("a", &[]);
        bad.worker_count = 0;
        assert!(matches!(
            build_execution_order(&[bad]),
            Err(PipelineError::InvalidRequest(_))
        ));
    }

    #[tokio::test]
    async fn test_admission_rejects_empty_request() {
        let (_, manager, registry) = setup();
        let parent = CancellationToken::new();

        let err = PipelineExecutor::start(
            Arc::clone(&manager),
            worker_settings(),
            Arc::clone(&registry),
            &parent,
            request("", vec![stage("a", &[])]),
        )
        .unwrap_err();
        assert!(matches!(err, PipelineError::InvalidRequest(_)));

        let err = PipelineExecutor::start(
            manager,
            worker_settings(),
            Arc::clone(&registry),
            &parent,
            request("p-1", Vec::new()),
        )
        .unwrap_err();
        assert!(matches!(err, PipelineError::InvalidRequest(_)));
        assert_eq!(registry.running_count(), 0);
    }

    #[tokio::test]
    async fn test_single_stage_success_event_order() {
        let (gateway, manager, registry) = setup();
        let parent = CancellationToken::new();

        let (rx, _cancel) = PipelineExecutor::start(
            manager,
            worker_settings(),
            Arc::clone(&registry),
            &parent,
            request("p1", vec![stage("build", &[])]),
        )
        .unwrap();

        let events = collect(rx).await;

        // pipeline envelope, stage running, stage completed, pipeline completed
        assert_eq!(events[0].stage_id, None);
        assert_eq!(events[0].status, StageStatus::Pending);
        assert_eq!(
            stage_statuses(&events, "build"),
            vec![StageStatus::Running, StageStatus::Completed]
        );
        let last = events.last().unwrap();
        assert!(last.is_terminal());
        assert_eq!(last.status, StageStatus::Completed);
        assert_eq!(last.progress_percentage, 100);

        // the running event already names the pod the stage will spawn
        let running = events
            .iter()
            .find(|e| e.stage_id.as_deref() == Some("build"))
            .unwrap();
        assert_eq!(running.worker_pod_names, vec!["stagehand-p1-build-1"]);

        // completed stage event carries metrics
        let completed = events
            .iter()
            .find(|e| {
                e.stage_id.as_deref() == Some("build") && e.status == StageStatus::Completed
            })
            .unwrap();
        let metrics = completed.metrics.unwrap();
        assert_eq!(metrics.successful_workers, 1);
        assert_eq!(metrics.total_workers, 1);

        // no pods left behind
        assert_eq!(gateway.created(), vec!["stagehand-p1-build-1"]);
        assert_eq!(gateway.deleted(), vec!["stagehand-p1-build-1"]);
        assert!(!registry.is_running("p1"));
    }

    #[tokio::test]
    async fn test_parallel_level_then_join() {
        let (gateway, manager, registry) = setup();
        let parent = CancellationToken::new();

        let (rx, _cancel) = PipelineExecutor::start(
            manager,
            worker_settings(),
            registry,
            &parent,
            request(
                "p2",
                vec![
                    stage("a", &[]),
                    stage("b", &[]),
                    stage("c", &[]),
                    stage("d", &["a", "b", "c"]),
                ],
            ),
        )
        .unwrap();

        let events = collect(rx).await;

        // d starts only after the whole first level completed
        let d_running = events
            .iter()
            .position(|e| {
                e.stage_id.as_deref() == Some("d") && e.status == StageStatus::Running
            })
            .unwrap();
        for id in ["a", "b", "c"] {
            let completed = events
                .iter()
                .position(|e| {
                    e.stage_id.as_deref() == Some(id) && e.status == StageStatus::Completed
                })
                .unwrap();
            assert!(completed < d_running, "stage {} finished after d started", id);
        }

        assert!(events.last().unwrap().is_terminal());
        assert_eq!(gateway.created().len(), 4);
        assert_eq!(gateway.deleted().len(), 4);
    }

    #[tokio::test]
    async fn test_stage_failure_skips_dependents() {
        let (gateway, manager, registry) = setup();
        gateway.script("stagehand-p3-test-1", [PodPhase::Failed]);
        let parent = CancellationToken::new();

        let (rx, _cancel) = PipelineExecutor::start(
            manager,
            worker_settings(),
            registry,
            &parent,
            request(
                "p3",
                vec![stage("test", &[]), stage("deploy", &["test"])],
            ),
        )
        .unwrap();

        let events = collect(rx).await;

        assert_eq!(
            stage_statuses(&events, "test"),
            vec![StageStatus::Running, StageStatus::Failed]
        );
        assert_eq!(stage_statuses(&events, "deploy"), vec![StageStatus::Skipped]);

        let last = events.last().unwrap();
        assert_eq!(last.status, StageStatus::Failed);
        assert!(last.is_terminal());

        // deploy never created a pod; the failed pod was still cleaned up
        assert_eq!(gateway.created(), vec!["stagehand-p3-test-1"]);
        assert!(!gateway.pod_exists("stagehand-p3-test-1"));
    }

    #[tokio::test]
    async fn test_stage_retry_then_succeed() {
        let (gateway, manager, registry) = setup();
        gateway.script("stagehand-p4-build-1", [PodPhase::Failed]);
        let parent = CancellationToken::new();

        let mut retried = stage("build", &[]);
        retried.retry = Some(RetryPolicy {
            max_attempts: 2,
            delay_seconds: 0,
        });

        let (rx, _cancel) = PipelineExecutor::start(
            manager,
            worker_settings(),
            registry,
            &parent,
            request("p4", vec![retried]),
        )
        .unwrap();

        let events = collect(rx).await;

        assert_eq!(
            stage_statuses(&events, "build"),
            vec![
                StageStatus::Running,
                StageStatus::Retrying,
                StageStatus::Running,
                StageStatus::Completed,
            ]
        );
        assert!(events.last().unwrap().is_terminal());
        assert_eq!(events.last().unwrap().status, StageStatus::Completed);

        // one pod per attempt, each cleaned up
        assert_eq!(gateway.created().len(), 2);
        assert_eq!(gateway.deleted().len(), 2);
    }

    #[tokio::test]
    async fn test_retries_exhausted_fails_stage() {
        let (gateway, manager, registry) = setup();
        gateway.script(
            "stagehand-p5-build-1",
            [PodPhase::Failed, PodPhase::Failed, PodPhase::Failed],
        );
        let parent = CancellationToken::new();

        let mut retried = stage("build", &[]);
        retried.retry = Some(RetryPolicy {
            max_attempts: 2,
            delay_seconds: 0,
        });

        let (rx, _cancel) = PipelineExecutor::start(
            manager,
            worker_settings(),
            registry,
            &parent,
            request("p5", vec![retried]),
        )
        .unwrap();

        let events = collect(rx).await;

        // max_attempts retries means max_attempts + 1 pod creations
        assert_eq!(gateway.created().len(), 3);
        assert_eq!(gateway.deleted().len(), 3);
        assert_eq!(events.last().unwrap().status, StageStatus::Failed);

        let failed = events
            .iter()
            .find(|e| e.stage_id.as_deref() == Some("build") && e.status == StageStatus::Failed)
            .unwrap();
        assert!(failed.error_message.is_some());
    }

    #[tokio::test]
    async fn test_cancellation_collapses_pipeline() {
        let (gateway, manager, registry) = setup();
        gateway.hold("stagehand-p6-build-1");
        let parent = CancellationToken::new();

        let (rx, cancel) = PipelineExecutor::start(
            manager,
            worker_settings(),
            Arc::clone(&registry),
            &parent,
            request("p6", vec![stage("build", &[]), stage("deploy", &["build"])]),
        )
        .unwrap();

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            cancel.cancel();
        });

        let events = collect(rx).await;

        let last = events.last().unwrap();
        assert!(last.is_terminal());
        assert_eq!(last.status, StageStatus::Failed);

        // the held pod was still deleted and the id is reusable
        assert!(!gateway.pod_exists("stagehand-p6-build-1"));
        assert!(!registry.is_running("p6"));
    }

    #[tokio::test]
    async fn test_duplicate_pipeline_id_rejected_while_running() {
        let (gateway, manager, registry) = setup();
        gateway.hold("stagehand-p7-build-1");
        let parent = CancellationToken::new();

        let (rx, cancel) = PipelineExecutor::start(
            Arc::clone(&manager),
            worker_settings(),
            Arc::clone(&registry),
            &parent,
            request("p7", vec![stage("build", &[])]),
        )
        .unwrap();

        let err = PipelineExecutor::start(
            Arc::clone(&manager),
            worker_settings(),
            Arc::clone(&registry),
            &parent,
            request("p7", vec![stage("build", &[])]),
        )
        .unwrap_err();
        assert!(matches!(err, PipelineError::AlreadyRunning(_)));

        cancel.cancel();
        collect(rx).await;

        // after the first run terminated the id can be reused
        let (rx, _cancel) = PipelineExecutor::start(
            manager,
            worker_settings(),
            registry,
            &parent,
            request("p7", vec![stage("other", &[])]),
        )
        .unwrap();
        let events = collect(rx).await;
        assert_eq!(events.last().unwrap().status, StageStatus::Completed);
    }

    #[tokio::test]
    async fn test_worker_specs_carry_stage_labels() {
        let (_, manager, registry) = setup();
        let parent = CancellationToken::new();

        let mut wide = stage("fan", &[]);
        wide.worker_count = 3;

        let (rx, _cancel) = PipelineExecutor::start(
            manager,
            worker_settings(),
            registry,
            &parent,
            request("p8", vec![wide]),
        )
        .unwrap();

        let events = collect(rx).await;
        let running = events
            .iter()
            .find(|e| e.stage_id.as_deref() == Some("fan"))
            .unwrap();
        assert_eq!(
            running.worker_pod_names,
            vec![
                "stagehand-p8-fan-1",
                "stagehand-p8-fan-2",
                "stagehand-p8-fan-3"
            ]
        );
    }
}
