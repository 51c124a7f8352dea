//! In-memory gateway for tests
//!
//! Pods reach their scripted terminal phase immediately on creation, so the
//! manager's poll loop observes a terminal transition on its first tick.
//! Unscripted pods succeed. `hold` keeps a pod in `Running` forever, which
//! is how cancellation paths are exercised.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::pod::{
    ContainerState, ContainerStateTerminated, ContainerStatus, Pod, PodPhase,
};
use super::{ClusterGateway, GatewayError, LogLine, LogStreamOptions};

#[derive(Default)]
pub struct FakeGateway {
    pods: Mutex<HashMap<String, Pod>>,
    scripts: Mutex<HashMap<String, VecDeque<PodPhase>>>,
    held: Mutex<Vec<String>>,
    created: Mutex<Vec<String>>,
    deleted: Mutex<Vec<String>>,
}

impl FakeGateway {
    pub fn new() -> Self {
        Self::default()
    }

    /// Scripts the terminal phase of the next creations of `name`, in order
    pub fn script(&self, name: &str, phases: impl IntoIterator<Item = PodPhase>) {
        self.scripts
            .lock()
            .unwrap()
            .entry(name.to_string())
            .or_default()
            .extend(phases);
    }

    /// Keeps every creation of `name` running until deleted
    pub fn hold(&self, name: &str) {
        self.held.lock().unwrap().push(name.to_string());
    }

    /// Seeds an existing pod without going through `create_pod`
    pub fn seed_pod(&self, pod: Pod) {
        self.pods
            .lock()
            .unwrap()
            .insert(pod.metadata.name.clone(), pod);
    }

    /// Every pod name passed to `create_pod`, in order, duplicates included
    pub fn created(&self) -> Vec<String> {
        self.created.lock().unwrap().clone()
    }

    /// Every pod name deleted, in order
    pub fn deleted(&self) -> Vec<String> {
        self.deleted.lock().unwrap().clone()
    }

    pub fn pod_exists(&self, name: &str) -> bool {
        self.pods.lock().unwrap().contains_key(name)
    }

    fn next_phase(&self, name: &str) -> PodPhase {
        if self.held.lock().unwrap().iter().any(|held| held == name) {
            return PodPhase::Running;
        }
        self.scripts
            .lock()
            .unwrap()
            .get_mut(name)
            .and_then(|phases| phases.pop_front())
            .unwrap_or(PodPhase::Succeeded)
    }
}

#[async_trait]
impl ClusterGateway for FakeGateway {
    async fn create_pod(&self, mut pod: Pod) -> Result<Pod, GatewayError> {
        let name = pod.metadata.name.clone();
        self.created.lock().unwrap().push(name.clone());

        let phase = self.next_phase(&name);
        pod.metadata.creation_timestamp = Some(chrono::Utc::now());
        pod.status.phase = phase;
        if phase == PodPhase::Failed {
            pod.status.container_statuses = vec![ContainerStatus {
                name: "worker".to_string(),
                ready: false,
                state: ContainerState {
                    terminated: Some(ContainerStateTerminated {
                        exit_code: 1,
                        reason: "Error".to_string(),
                        message: String::new(),
                        finished_at: Some(chrono::Utc::now()),
                    }),
                    ..Default::default()
                },
            }];
        }

        self.pods.lock().unwrap().insert(name, pod.clone());
        Ok(pod)
    }

    async fn get_pod(&self, name: &str) -> Result<Pod, GatewayError> {
        self.pods
            .lock()
            .unwrap()
            .get(name)
            .cloned()
            .ok_or_else(|| GatewayError::NotFound(name.to_string()))
    }

    async fn list_pods(&self, label_selector: &str) -> Result<Vec<Pod>, GatewayError> {
        let wanted: Vec<(&str, &str)> = label_selector
            .split(',')
            .filter(|part| !part.is_empty())
            .filter_map(|part| part.split_once('='))
            .collect();

        Ok(self
            .pods
            .lock()
            .unwrap()
            .values()
            .filter(|pod| {
                wanted
                    .iter()
                    .all(|(k, v)| pod.metadata.labels.get(*k).map(String::as_str) == Some(*v))
            })
            .cloned()
            .collect())
    }

    async fn delete_pod(&self, name: &str) -> Result<(), GatewayError> {
        let removed = self.pods.lock().unwrap().remove(name);
        if removed.is_none() {
            return Err(GatewayError::NotFound(name.to_string()));
        }
        self.deleted.lock().unwrap().push(name.to_string());
        Ok(())
    }

    async fn watch_pod(&self, name: &str) -> Result<mpsc::Receiver<Pod>, GatewayError> {
        let pod = self.get_pod(name).await?;
        let (tx, rx) = mpsc::channel(1);
        let _ = tx.send(pod).await;
        Ok(rx)
    }

    async fn stream_pod_logs(
        &self,
        name: &str,
        _options: LogStreamOptions,
    ) -> Result<(mpsc::Receiver<LogLine>, mpsc::Receiver<GatewayError>), GatewayError> {
        self.get_pod(name).await?;
        let (_log_tx, log_rx) = mpsc::channel(1);
        let (_err_tx, err_rx) = mpsc::channel(1);
        Ok((log_rx, err_rx))
    }

    async fn get_pod_logs(
        &self,
        name: &str,
        _options: LogStreamOptions,
    ) -> Result<String, GatewayError> {
        self.get_pod(name).await?;
        Ok(String::new())
    }

    fn namespace(&self) -> &str {
        "default"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pod(name: &str) -> Pod {
        let mut pod = Pod::default();
        pod.metadata.name = name.to_string();
        pod
    }

    #[tokio::test]
    async fn test_gateway_surface_via_trait() {
        let gateway: std::sync::Arc<dyn ClusterGateway> = std::sync::Arc::new(FakeGateway::new());

        let created = gateway.create_pod(pod("w-1")).await.unwrap();
        assert!(created.status.phase.is_terminal());

        let mut watch = gateway.watch_pod("w-1").await.unwrap();
        let observed = watch.recv().await.unwrap();
        assert_eq!(observed.metadata.name, "w-1");
        assert!(watch.recv().await.is_none());

        let (mut logs, mut errors) = gateway
            .stream_pod_logs("w-1", LogStreamOptions::default())
            .await
            .unwrap();
        assert!(logs.recv().await.is_none());
        assert!(errors.recv().await.is_none());

        let text = gateway
            .get_pod_logs("w-1", LogStreamOptions::default())
            .await
            .unwrap();
        assert!(text.is_empty());

        gateway.delete_pod("w-1").await.unwrap();
        assert!(gateway.get_pod("w-1").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_log_ops_require_existing_pod() {
        let gateway = FakeGateway::new();

        assert!(gateway.watch_pod("ghost").await.is_err());
        assert!(gateway
            .stream_pod_logs("ghost", LogStreamOptions::default())
            .await
            .is_err());
        assert!(gateway
            .get_pod_logs("ghost", LogStreamOptions::default())
            .await
            .is_err());
    }
}
