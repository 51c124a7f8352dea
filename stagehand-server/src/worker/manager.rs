//! Worker manager
//!
//! Drives a worker pod through its whole life: build the pod object, create
//! it, poll its phase to a terminal state, and delete it. The delete happens
//! on every exit path - success, failure, cancellation, or error after
//! creation - on an independent, timeout-bounded future so that a cancelled
//! caller never orphans a pod.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use stagehand_core::domain::worker::{WorkerOutcome, WorkerSpec};
use stagehand_core::names;

use crate::cluster::pod::{Container, ObjectMeta, Pod, PodSpec, ResourceRequirements};
use crate::cluster::{ClusterGateway, GatewayError, PodPhase};

/// Container name used inside every worker pod
const WORKER_CONTAINER_NAME: &str = "worker";
/// Annotation recording when the pod object was built
const CREATED_AT_ANNOTATION: &str = "stagehand.io/created-at";

/// Manager tuning
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Cadence of the pod phase poll
    pub poll_interval: Duration,
    /// Bound on the independent cleanup delete
    pub cleanup_timeout: Duration,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(2),
            cleanup_timeout: Duration::from_secs(30),
        }
    }
}

/// Errors from worker lifecycle operations
#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("no worker specs provided")]
    EmptyBatch,

    #[error("worker {name} creation failed: {source}")]
    Creation {
        name: String,
        #[source]
        source: GatewayError,
    },

    #[error("worker {name} failed: {reason}")]
    Failed { name: String, reason: String },

    #[error("worker {name} canceled")]
    Canceled { name: String },

    #[error(
        "batch partially failed: {}/{} workers failed: {}",
        .failed.len(),
        .outcomes.len(),
        .failed.join(", ")
    )]
    BatchFailed {
        failed: Vec<String>,
        outcomes: Vec<WorkerOutcome>,
    },

    #[error("failed to list worker pods: {0}")]
    List(#[source] GatewayError),
}

/// Aggregate result of a batch run, preserving per-worker outcomes
#[derive(Debug, Clone)]
pub struct BatchOutcome {
    pub outcomes: Vec<WorkerOutcome>,
}

impl BatchOutcome {
    pub fn succeeded(&self) -> usize {
        self.outcomes.iter().filter(|o| o.is_success()).count()
    }

    pub fn failed(&self) -> usize {
        self.outcomes.len() - self.succeeded()
    }
}

/// Manages the lifecycle of worker pods
pub struct WorkerManager {
    gateway: Arc<dyn ClusterGateway>,
    config: ManagerConfig,
}

impl WorkerManager {
    pub fn new(gateway: Arc<dyn ClusterGateway>, config: ManagerConfig) -> Self {
        info!(
            "worker manager initialized for namespace: {}",
            gateway.namespace()
        );
        Self { gateway, config }
    }

    /// Run a single worker to its terminal transition and clean it up
    pub async fn run_worker(
        &self,
        spec: WorkerSpec,
        cancel: CancellationToken,
    ) -> Result<WorkerOutcome, WorkerError> {
        let started_at = chrono::Utc::now();
        let name = spec.name.clone();

        info!("creating worker pod {} (image: {})", name, spec.image);
        let pod = self.build_pod(&spec);
        self.gateway
            .create_pod(pod)
            .await
            .map_err(|source| WorkerError::Creation {
                name: name.clone(),
                source,
            })?;

        let wait_result = self.wait_for_completion(&name, &cancel).await;

        // The delete must survive caller cancellation; run it on its own
        // bounded timeout rather than the caller's token.
        self.cleanup_pod(&name).await;

        let finished_at = chrono::Utc::now();
        match wait_result {
            Ok(()) => {
                info!(
                    "worker {} completed successfully in {:?}",
                    name,
                    (finished_at - started_at).to_std().unwrap_or_default()
                );
                Ok(WorkerOutcome::succeeded(name, started_at, finished_at))
            }
            Err(e) => {
                error!("worker {} did not complete: {}", name, e);
                Err(e)
            }
        }
    }

    /// Run N workers concurrently and aggregate their outcomes
    ///
    /// All workers start immediately and run independently; one failing does
    /// not stop the others. The batch fails if any worker failed, with the
    /// error enumerating which.
    pub async fn run_batch(
        self: &Arc<Self>,
        specs: Vec<WorkerSpec>,
        cancel: CancellationToken,
    ) -> Result<BatchOutcome, WorkerError> {
        if specs.is_empty() {
            return Err(WorkerError::EmptyBatch);
        }

        let total = specs.len();
        info!("starting batch of {} worker pods", total);
        let batch_started = std::time::Instant::now();

        let (tx, mut rx) = mpsc::channel(total);
        for spec in specs {
            let manager = Arc::clone(self);
            let cancel = cancel.clone();
            let tx = tx.clone();

            tokio::spawn(async move {
                let started_at = chrono::Utc::now();
                let name = spec.name.clone();
                let outcome = match manager.run_worker(spec, cancel).await {
                    Ok(outcome) => outcome,
                    Err(e) => {
                        WorkerOutcome::failed(name, started_at, chrono::Utc::now(), e.to_string())
                    }
                };
                let _ = tx.send(outcome).await;
            });
        }
        drop(tx);

        let mut outcomes = Vec::with_capacity(total);
        while let Some(outcome) = rx.recv().await {
            if outcome.is_success() {
                info!(
                    "  worker {} succeeded in {:?}",
                    outcome.name,
                    outcome.duration().to_std().unwrap_or_default()
                );
            } else {
                warn!(
                    "  worker {} failed in {:?}",
                    outcome.name,
                    outcome.duration().to_std().unwrap_or_default()
                );
            }
            outcomes.push(outcome);
        }

        let batch = BatchOutcome { outcomes };
        info!(
            "batch completed in {:?}: {} succeeded, {} failed",
            batch_started.elapsed(),
            batch.succeeded(),
            batch.failed()
        );

        if batch.failed() > 0 {
            let failed = batch
                .outcomes
                .iter()
                .filter(|o| !o.is_success())
                .map(|o| o.name.clone())
                .collect();
            return Err(WorkerError::BatchFailed {
                failed,
                outcomes: batch.outcomes,
            });
        }

        Ok(batch)
    }

    /// Worker pods owned by this system in phase pending or running
    pub async fn list_active(&self) -> Result<Vec<Pod>, WorkerError> {
        let pods = self
            .gateway
            .list_pods(&names::managed_by_selector())
            .await
            .map_err(WorkerError::List)?;

        let active: Vec<Pod> = pods
            .into_iter()
            .filter(|pod| pod.status.phase.is_active())
            .collect();

        debug!("found {} active worker pods", active.len());
        Ok(active)
    }

    /// Gracefully terminate up to `count` active worker pods, oldest first
    ///
    /// Pods are selected by the management label (and task id when given),
    /// sorted by creation time ascending, and deleted with default grace.
    /// Never force-kills. Returns the names actually issued.
    pub async fn terminate_oldest(
        &self,
        count: usize,
        task_id: Option<&str>,
    ) -> Result<Vec<String>, WorkerError> {
        if count == 0 {
            return Ok(Vec::new());
        }

        let mut selector = names::managed_by_selector();
        if let Some(task_id) = task_id {
            selector.push_str(&format!(
                ",{}={}",
                names::TASK_ID_LABEL,
                names::sanitize_label_value(task_id)
            ));
        }

        let mut pods: Vec<Pod> = self
            .gateway
            .list_pods(&selector)
            .await
            .map_err(WorkerError::List)?
            .into_iter()
            .filter(|pod| pod.status.phase.is_active())
            .collect();
        pods.sort_by_key(|pod| pod.metadata.creation_timestamp);

        let mut terminated = Vec::new();
        for pod in pods.into_iter().take(count) {
            let name = pod.metadata.name;
            match self.gateway.delete_pod(&name).await {
                Ok(()) => {
                    info!("terminated worker pod {}", name);
                    terminated.push(name);
                }
                Err(e) => warn!("failed to terminate pod {}: {}", name, e),
            }
        }

        Ok(terminated)
    }

    /// Builds the pod object for a worker spec
    fn build_pod(&self, spec: &WorkerSpec) -> Pod {
        let mut labels = spec.labels.clone();
        labels
            .entry(names::MANAGED_BY_LABEL.to_string())
            .or_insert_with(|| names::MANAGED_BY_VALUE.to_string());
        labels
            .entry(names::APP_LABEL.to_string())
            .or_insert_with(|| names::WORKER_APP_VALUE.to_string());

        let resources = spec.resources.as_ref().map(|bounds| {
            let mut requests = HashMap::new();
            let mut limits = HashMap::new();
            if let Some(cpu) = &bounds.cpu_request {
                requests.insert("cpu".to_string(), cpu.clone());
            }
            if let Some(memory) = &bounds.memory_request {
                requests.insert("memory".to_string(), memory.clone());
            }
            if let Some(cpu) = &bounds.cpu_limit {
                limits.insert("cpu".to_string(), cpu.clone());
            }
            if let Some(memory) = &bounds.memory_limit {
                limits.insert("memory".to_string(), memory.clone());
            }
            ResourceRequirements { requests, limits }
        });

        Pod {
            metadata: ObjectMeta {
                name: spec.name.clone(),
                namespace: self.gateway.namespace().to_string(),
                labels,
                annotations: HashMap::from([(
                    CREATED_AT_ANNOTATION.to_string(),
                    chrono::Utc::now().to_rfc3339(),
                )]),
                creation_timestamp: None,
            },
            spec: PodSpec {
                restart_policy: Some("Never".to_string()),
                containers: vec![Container {
                    name: WORKER_CONTAINER_NAME.to_string(),
                    image: spec.image.clone(),
                    command: spec.command.clone(),
                    args: spec.args.clone(),
                    resources,
                }],
                node_name: None,
            },
            status: Default::default(),
        }
    }

    /// Polls the pod phase until terminal, or until the caller goes away
    async fn wait_for_completion(
        &self,
        name: &str,
        cancel: &CancellationToken,
    ) -> Result<(), WorkerError> {
        debug!("waiting for pod {} to complete", name);
        let mut ticker = tokio::time::interval(self.config.poll_interval);
        let started = std::time::Instant::now();

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!(
                        "pod monitoring cancelled for {} after {:?}",
                        name,
                        started.elapsed()
                    );
                    return Err(WorkerError::Canceled {
                        name: name.to_string(),
                    });
                }
                _ = ticker.tick() => {
                    let pod = match self.gateway.get_pod(name).await {
                        Ok(pod) => pod,
                        Err(e) => {
                            warn!("error getting pod {}: {}", name, e);
                            continue;
                        }
                    };

                    match pod.status.phase {
                        PodPhase::Succeeded => {
                            debug!(
                                "pod {} completed successfully in {:?}",
                                name,
                                started.elapsed()
                            );
                            return Ok(());
                        }
                        PodPhase::Failed => {
                            let reason = failure_reason(&pod);
                            return Err(WorkerError::Failed {
                                name: name.to_string(),
                                reason,
                            });
                        }
                        PodPhase::Running | PodPhase::Pending => {
                            debug!(
                                "pod {} is {:?} (elapsed: {:?})",
                                name,
                                pod.status.phase,
                                started.elapsed()
                            );
                        }
                        PodPhase::Unknown => {
                            debug!("pod {} in unknown state", name);
                        }
                    }
                }
            }
        }
    }

    /// Deletes the pod on its own bounded timeout
    ///
    /// Cleanup errors are logged but never mask the primary outcome.
    async fn cleanup_pod(&self, name: &str) {
        debug!("cleaning up pod {}", name);
        match tokio::time::timeout(self.config.cleanup_timeout, self.gateway.delete_pod(name)).await
        {
            Ok(Ok(())) => {}
            Ok(Err(e)) if e.is_not_found() => {}
            Ok(Err(e)) => warn!("failed to clean up pod {}: {}", name, e),
            Err(_) => warn!(
                "cleanup of pod {} timed out after {:?}",
                name, self.config.cleanup_timeout
            ),
        }
    }
}

/// Synthesizes a failure reason from a terminal pod's status
///
/// Prefers the first non-zero terminated container, then a stuck waiting
/// container, then an unready pod condition.
pub fn failure_reason(pod: &Pod) -> String {
    for status in &pod.status.container_statuses {
        if let Some(terminated) = &status.state.terminated {
            if terminated.exit_code != 0 {
                return format!(
                    "container exited with code {}: {}",
                    terminated.exit_code, terminated.reason
                );
            }
        }
        if let Some(waiting) = &status.state.waiting {
            return format!("container waiting: {} - {}", waiting.reason, waiting.message);
        }
    }

    for condition in &pod.status.conditions {
        if condition.condition_type == "Ready" && condition.status == "False" {
            return format!("pod not ready: {}", condition.message);
        }
    }

    "unknown failure reason".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::pod::{
        ContainerState, ContainerStateWaiting, ContainerStatus, PodCondition, PodStatus,
    };
    use crate::cluster::testing::FakeGateway;

    fn test_manager(gateway: Arc<FakeGateway>) -> Arc<WorkerManager> {
        Arc::new(WorkerManager::new(
            gateway,
            ManagerConfig {
                poll_interval: Duration::from_millis(5),
                cleanup_timeout: Duration::from_secs(1),
            },
        ))
    }

    fn spec(name: &str) -> WorkerSpec {
        WorkerSpec {
            name: name.to_string(),
            image: "busybox:latest".to_string(),
            command: vec!["sh".to_string(), "-c".to_string()],
            args: vec!["true".to_string()],
            labels: HashMap::new(),
            resources: None,
        }
    }

    #[tokio::test]
    async fn test_successful_worker_is_cleaned_up() {
        let gateway = Arc::new(FakeGateway::new());
        let manager = test_manager(Arc::clone(&gateway));

        let outcome = manager
            .run_worker(spec("w-1"), CancellationToken::new())
            .await
            .unwrap();

        assert!(outcome.is_success());
        assert_eq!(gateway.created(), vec!["w-1"]);
        assert_eq!(gateway.deleted(), vec!["w-1"]);
        assert!(!gateway.pod_exists("w-1"));
    }

    #[tokio::test]
    async fn test_failed_worker_is_cleaned_up() {
        let gateway = Arc::new(FakeGateway::new());
        gateway.script("w-1", [PodPhase::Failed]);
        let manager = test_manager(Arc::clone(&gateway));

        let err = manager
            .run_worker(spec("w-1"), CancellationToken::new())
            .await
            .unwrap_err();

        match err {
            WorkerError::Failed { name, reason } => {
                assert_eq!(name, "w-1");
                assert!(reason.contains("exited with code 1"), "reason: {}", reason);
            }
            other => panic!("unexpected error: {:?}", other),
        }
        assert_eq!(gateway.deleted(), vec!["w-1"]);
        assert!(!gateway.pod_exists("w-1"));
    }

    #[tokio::test]
    async fn test_cancelled_worker_is_cleaned_up() {
        let gateway = Arc::new(FakeGateway::new());
        gateway.hold("w-1");
        let manager = test_manager(Arc::clone(&gateway));

        let cancel = CancellationToken::new();
        let trip = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            trip.cancel();
        });

        let err = manager.run_worker(spec("w-1"), cancel).await.unwrap_err();

        assert!(matches!(err, WorkerError::Canceled { .. }));
        assert_eq!(gateway.deleted(), vec!["w-1"]);
        assert!(!gateway.pod_exists("w-1"));
    }

    #[tokio::test]
    async fn test_batch_aggregates_outcomes() {
        let gateway = Arc::new(FakeGateway::new());
        gateway.script("w-2", [PodPhase::Failed]);
        let manager = test_manager(Arc::clone(&gateway));

        let err = manager
            .run_batch(vec![spec("w-1"), spec("w-2")], CancellationToken::new())
            .await
            .unwrap_err();

        match err {
            WorkerError::BatchFailed { failed, outcomes } => {
                assert_eq!(failed, vec!["w-2"]);
                assert_eq!(outcomes.len(), 2);
                assert_eq!(outcomes.iter().filter(|o| o.is_success()).count(), 1);
            }
            other => panic!("unexpected error: {:?}", other),
        }

        // both pods were cleaned up regardless of outcome
        assert!(!gateway.pod_exists("w-1"));
        assert!(!gateway.pod_exists("w-2"));
    }

    #[tokio::test]
    async fn test_batch_success() {
        let gateway = Arc::new(FakeGateway::new());
        let manager = test_manager(Arc::clone(&gateway));

        let batch = manager
            .run_batch(
                vec![spec("w-1"), spec("w-2"), spec("w-3")],
                CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(batch.succeeded(), 3);
        assert_eq!(batch.failed(), 0);
    }

    #[tokio::test]
    async fn test_empty_batch_rejected() {
        let gateway = Arc::new(FakeGateway::new());
        let manager = test_manager(gateway);

        let err = manager
            .run_batch(Vec::new(), CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, WorkerError::EmptyBatch));
    }

    #[tokio::test]
    async fn test_build_pod_applies_management_labels() {
        let gateway = Arc::new(FakeGateway::new());
        let manager = test_manager(gateway);

        let mut worker_spec = spec("w-1");
        worker_spec
            .labels
            .insert("task-id".to_string(), "t-1".to_string());
        let pod = manager.build_pod(&worker_spec);

        assert_eq!(pod.metadata.labels.get("managed-by").unwrap(), "stagehand");
        assert_eq!(pod.metadata.labels.get("app").unwrap(), "stagehand-worker");
        assert_eq!(pod.metadata.labels.get("task-id").unwrap(), "t-1");
        assert_eq!(pod.spec.restart_policy.as_deref(), Some("Never"));
        assert!(pod.metadata.annotations.contains_key("stagehand.io/created-at"));
    }

    #[tokio::test]
    async fn test_terminate_oldest_order_and_bound() {
        let gateway = Arc::new(FakeGateway::new());
        let base = chrono::Utc::now();
        for (i, name) in ["w-old", "w-mid", "w-new"].iter().enumerate() {
            let mut pod = Pod::default();
            pod.metadata.name = name.to_string();
            pod.metadata.labels =
                HashMap::from([("managed-by".to_string(), "stagehand".to_string())]);
            pod.metadata.creation_timestamp = Some(base + chrono::Duration::seconds(i as i64));
            pod.status.phase = PodPhase::Running;
            gateway.seed_pod(pod);
        }
        // terminal pods are not candidates
        let mut done = Pod::default();
        done.metadata.name = "w-done".to_string();
        done.metadata.labels = HashMap::from([("managed-by".to_string(), "stagehand".to_string())]);
        done.metadata.creation_timestamp = Some(base - chrono::Duration::seconds(60));
        done.status.phase = PodPhase::Succeeded;
        gateway.seed_pod(done);

        let manager = test_manager(Arc::clone(&gateway));
        let terminated = manager.terminate_oldest(2, None).await.unwrap();

        assert_eq!(terminated, vec!["w-old", "w-mid"]);
        assert!(gateway.pod_exists("w-new"));
        assert!(gateway.pod_exists("w-done"));
    }

    #[tokio::test]
    async fn test_list_active_filters_terminal_pods() {
        let gateway = Arc::new(FakeGateway::new());
        for (name, phase) in [
            ("w-run", PodPhase::Running),
            ("w-pend", PodPhase::Pending),
            ("w-done", PodPhase::Succeeded),
        ] {
            let mut pod = Pod::default();
            pod.metadata.name = name.to_string();
            pod.metadata.labels =
                HashMap::from([("managed-by".to_string(), "stagehand".to_string())]);
            pod.status.phase = phase;
            gateway.seed_pod(pod);
        }

        let manager = test_manager(gateway);
        let active = manager.list_active().await.unwrap();

        let mut names: Vec<&str> = active.iter().map(|p| p.metadata.name.as_str()).collect();
        names.sort();
        assert_eq!(names, vec!["w-pend", "w-run"]);
    }

    #[test]
    fn test_failure_reason_prefers_terminated_container() {
        let mut pod = Pod::default();
        pod.status = PodStatus {
            container_statuses: vec![ContainerStatus {
                name: "worker".to_string(),
                ready: false,
                state: ContainerState {
                    terminated: Some(crate::cluster::pod::ContainerStateTerminated {
                        exit_code: 137,
                        reason: "OOMKilled".to_string(),
                        ..Default::default()
                    }),
                    ..Default::default()
                },
            }],
            ..Default::default()
        };

        assert_eq!(
            failure_reason(&pod),
            "container exited with code 137: OOMKilled"
        );
    }

    #[test]
    fn test_failure_reason_waiting_container() {
        let mut pod = Pod::default();
        pod.status.container_statuses = vec![ContainerStatus {
            name: "worker".to_string(),
            ready: false,
            state: ContainerState {
                waiting: Some(ContainerStateWaiting {
                    reason: "ImagePullBackOff".to_string(),
                    message: "image not found".to_string(),
                }),
                ..Default::default()
            },
        }];

        assert_eq!(
            failure_reason(&pod),
            "container waiting: ImagePullBackOff - image not found"
        );
    }

    #[test]
    fn test_failure_reason_unready_condition() {
        let mut pod = Pod::default();
        pod.status.conditions = vec![PodCondition {
            condition_type: "Ready".to_string(),
            status: "False".to_string(),
            message: "containers not ready".to_string(),
        }];

        assert_eq!(failure_reason(&pod), "pod not ready: containers not ready");
    }

    #[test]
    fn test_failure_reason_unknown() {
        assert_eq!(failure_reason(&Pod::default()), "unknown failure reason");
    }
}
