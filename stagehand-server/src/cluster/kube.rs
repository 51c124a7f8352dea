//! Cluster gateway over the Kubernetes REST API
//!
//! Authentication resolution order:
//!  1. In-cluster service-account identity (token and CA mounted into the pod)
//!  2. Kubeconfig file pointed to by `KUBECONFIG`, or `$HOME/.kube/config`
//!
//! All operations are scoped to the namespace bound at construction time.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use futures::StreamExt;
use reqwest::{Certificate, Client};
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use stagehand_core::domain::log::LogSource;

use super::pod::{Pod, WatchEvent};
use super::{ClusterGateway, GatewayError, LogLine, LogStreamOptions};

const SERVICE_ACCOUNT_DIR: &str = "/var/run/secrets/kubernetes.io/serviceaccount";
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(3);

/// Gateway to the cluster API for pod management
pub struct KubeGateway {
    http: Client,
    base_url: String,
    token: Option<String>,
    namespace: String,
    request_timeout: Duration,
}

/// Resolved connection parameters
struct ClusterAuth {
    server: String,
    token: Option<String>,
    ca_pem: Option<Vec<u8>>,
    insecure_skip_tls_verify: bool,
}

impl KubeGateway {
    /// Connect to the cluster, resolving credentials from the environment
    ///
    /// An empty namespace resolves to `default`.
    pub async fn connect(namespace: &str) -> Result<Self, GatewayError> {
        let auth = resolve_auth().await?;
        Self::from_auth(namespace, auth)
    }

    fn from_auth(namespace: &str, auth: ClusterAuth) -> Result<Self, GatewayError> {
        let namespace = if namespace.is_empty() {
            "default".to_string()
        } else {
            namespace.to_string()
        };

        let mut builder = Client::builder().connect_timeout(DEFAULT_CONNECT_TIMEOUT);

        if let Some(pem) = &auth.ca_pem {
            let cert = Certificate::from_pem(pem)
                .map_err(|e| GatewayError::Auth(format!("invalid cluster CA certificate: {}", e)))?;
            builder = builder.add_root_certificate(cert);
        }

        if auth.insecure_skip_tls_verify {
            warn!("cluster TLS verification disabled by kubeconfig");
            builder = builder.danger_accept_invalid_certs(true);
        }

        let http = builder
            .build()
            .map_err(|e| GatewayError::Auth(format!("failed to build cluster client: {}", e)))?;

        info!("cluster gateway initialized (namespace: {})", namespace);

        Ok(Self {
            http,
            base_url: auth.server.trim_end_matches('/').to_string(),
            token: auth.token,
            namespace,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        })
    }

    fn pods_url(&self) -> String {
        format!(
            "{}/api/v1/namespaces/{}/pods",
            self.base_url, self.namespace
        )
    }

    fn pod_url(&self, name: &str) -> String {
        format!("{}/{}", self.pods_url(), name)
    }

    fn request(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    /// Converts a non-success response into a gateway error
    async fn check_status(
        operation: &'static str,
        pod: &str,
        response: reqwest::Response,
    ) -> Result<reqwest::Response, GatewayError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(GatewayError::NotFound(pod.to_string()));
        }

        let message = response
            .text()
            .await
            .unwrap_or_else(|_| "unknown error".to_string());
        Err(GatewayError::Api {
            operation,
            pod: pod.to_string(),
            status: status.as_u16(),
            message,
        })
    }
}

#[async_trait]
impl ClusterGateway for KubeGateway {
    async fn create_pod(&self, pod: Pod) -> Result<Pod, GatewayError> {
        let name = pod.metadata.name.clone();
        let response = self
            .request(self.http.post(self.pods_url()))
            .timeout(self.request_timeout)
            .json(&pod)
            .send()
            .await
            .map_err(|e| GatewayError::Request {
                operation: "create pod",
                pod: name.clone(),
                source: e,
            })?;

        let response = Self::check_status("create pod", &name, response).await?;
        let created: Pod = response.json().await.map_err(|e| GatewayError::Decode {
            operation: "create pod",
            pod: name.clone(),
            message: e.to_string(),
        })?;

        debug!("created pod {}", created.metadata.name);
        Ok(created)
    }

    async fn get_pod(&self, name: &str) -> Result<Pod, GatewayError> {
        let response = self
            .request(self.http.get(self.pod_url(name)))
            .timeout(self.request_timeout)
            .send()
            .await
            .map_err(|e| GatewayError::Request {
                operation: "get pod",
                pod: name.to_string(),
                source: e,
            })?;

        let response = Self::check_status("get pod", name, response).await?;
        response.json().await.map_err(|e| GatewayError::Decode {
            operation: "get pod",
            pod: name.to_string(),
            message: e.to_string(),
        })
    }

    async fn list_pods(&self, label_selector: &str) -> Result<Vec<Pod>, GatewayError> {
        let mut request = self
            .request(self.http.get(self.pods_url()))
            .timeout(self.request_timeout);
        if !label_selector.is_empty() {
            request = request.query(&[("labelSelector", label_selector)]);
        }

        let response = request.send().await.map_err(|e| GatewayError::Request {
            operation: "list pods",
            pod: label_selector.to_string(),
            source: e,
        })?;

        let response = Self::check_status("list pods", label_selector, response).await?;
        let list: PodList = response.json().await.map_err(|e| GatewayError::Decode {
            operation: "list pods",
            pod: label_selector.to_string(),
            message: e.to_string(),
        })?;

        Ok(list.items)
    }

    async fn delete_pod(&self, name: &str) -> Result<(), GatewayError> {
        let response = self
            .request(self.http.delete(self.pod_url(name)))
            .timeout(self.request_timeout)
            .send()
            .await
            .map_err(|e| GatewayError::Request {
                operation: "delete pod",
                pod: name.to_string(),
                source: e,
            })?;

        Self::check_status("delete pod", name, response).await?;
        debug!("deleted pod {}", name);
        Ok(())
    }

    async fn watch_pod(&self, name: &str) -> Result<mpsc::Receiver<Pod>, GatewayError> {
        let response = self
            .request(self.http.get(self.pods_url()))
            .query(&[
                ("watch", "true".to_string()),
                ("fieldSelector", format!("metadata.name={}", name)),
            ])
            .send()
            .await
            .map_err(|e| GatewayError::Request {
                operation: "watch pod",
                pod: name.to_string(),
                source: e,
            })?;

        let response = Self::check_status("watch pod", name, response).await?;
        let (tx, rx) = mpsc::channel(16);
        let pod_name = name.to_string();

        tokio::spawn(async move {
            let mut body = response.bytes_stream();
            let mut lines = LineBuffer::default();

            'outer: while let Some(chunk) = body.next().await {
                let chunk = match chunk {
                    Ok(chunk) => chunk,
                    Err(e) => {
                        warn!("watch stream for pod {} failed: {}", pod_name, e);
                        break;
                    }
                };

                for line in lines.push(&chunk) {
                    let event: WatchEvent = match serde_json::from_str(&line) {
                        Ok(event) => event,
                        Err(e) => {
                            debug!("skipping unparseable watch event: {}", e);
                            continue;
                        }
                    };

                    debug!(
                        "pod {} watch event: {} ({:?})",
                        pod_name, event.event_type, event.object.status.phase
                    );
                    let terminal = event.object.status.phase.is_terminal();
                    if tx.send(event.object).await.is_err() {
                        break 'outer;
                    }
                    if terminal {
                        debug!("pod {} reached terminal phase, ending watch", pod_name);
                        break 'outer;
                    }
                }
            }
        });

        Ok(rx)
    }

    async fn stream_pod_logs(
        &self,
        name: &str,
        options: LogStreamOptions,
    ) -> Result<(mpsc::Receiver<LogLine>, mpsc::Receiver<GatewayError>), GatewayError> {
        let response = self
            .request(self.http.get(format!("{}/log", self.pod_url(name))))
            .query(&log_query(&options))
            .send()
            .await
            .map_err(|e| GatewayError::Request {
                operation: "stream pod logs",
                pod: name.to_string(),
                source: e,
            })?;

        let response = Self::check_status("stream pod logs", name, response).await?;

        let (log_tx, log_rx) = mpsc::channel(100);
        let (err_tx, err_rx) = mpsc::channel(1);
        let pod_name = name.to_string();

        tokio::spawn(async move {
            let mut body = response.bytes_stream();
            let mut lines = LineBuffer::default();

            debug!("log streaming started for pod {}", pod_name);

            'outer: while let Some(chunk) = body.next().await {
                let chunk = match chunk {
                    Ok(chunk) => chunk,
                    Err(e) => {
                        let _ = err_tx
                            .send(GatewayError::Request {
                                operation: "stream pod logs",
                                pod: pod_name.clone(),
                                source: e,
                            })
                            .await;
                        break;
                    }
                };

                for line in lines.push(&chunk) {
                    if line.is_empty() {
                        continue;
                    }

                    let mut entry = LogLine {
                        pod_name: pod_name.clone(),
                        container: options.container.clone(),
                        timestamp: chrono::Utc::now(),
                        message: line,
                        source: LogSource::Stdout,
                    };

                    if options.timestamps {
                        if let Some((ts, message)) = parse_timestamped_line(&entry.message) {
                            entry.timestamp = ts;
                            entry.message = message;
                        }
                    }

                    if log_tx.send(entry).await.is_err() {
                        break 'outer;
                    }
                }
            }

            debug!("log streaming finished for pod {}", pod_name);
        });

        Ok((log_rx, err_rx))
    }

    async fn get_pod_logs(
        &self,
        name: &str,
        options: LogStreamOptions,
    ) -> Result<String, GatewayError> {
        let mut options = options;
        options.follow = false;

        let response = self
            .request(self.http.get(format!("{}/log", self.pod_url(name))))
            .timeout(self.request_timeout)
            .query(&log_query(&options))
            .send()
            .await
            .map_err(|e| GatewayError::Request {
                operation: "get pod logs",
                pod: name.to_string(),
                source: e,
            })?;

        let response = Self::check_status("get pod logs", name, response).await?;
        response.text().await.map_err(|e| GatewayError::Decode {
            operation: "get pod logs",
            pod: name.to_string(),
            message: e.to_string(),
        })
    }

    fn namespace(&self) -> &str {
        &self.namespace
    }
}

#[derive(Debug, Default, Deserialize)]
struct PodList {
    #[serde(default)]
    items: Vec<Pod>,
}

/// Builds the query string for the pod log endpoint
fn log_query(options: &LogStreamOptions) -> Vec<(&'static str, String)> {
    let mut query = Vec::new();

    if options.follow {
        query.push(("follow", "true".to_string()));
    }
    if options.timestamps {
        query.push(("timestamps", "true".to_string()));
    }
    if let Some(tail) = options.tail_lines {
        query.push(("tailLines", tail.to_string()));
    }
    if let Some(since) = options.since_time {
        query.push(("sinceTime", since.to_rfc3339()));
    }
    if let Some(container) = &options.container {
        query.push(("container", container.clone()));
    }
    if options.previous {
        query.push(("previous", "true".to_string()));
    }

    query
}

/// Splits a timestamp-prefixed log line
///
/// The cluster prefixes each line with a fixed-width 30-character timestamp
/// followed by a single space. Lines that do not match keep their raw text.
fn parse_timestamped_line(line: &str) -> Option<(chrono::DateTime<chrono::Utc>, String)> {
    if line.len() < 30 || !line.is_char_boundary(30) {
        return None;
    }

    let timestamp = chrono::DateTime::parse_from_rfc3339(&line[..30]).ok()?;
    let message = line[30..].strip_prefix(' ').unwrap_or(&line[30..]);

    Some((timestamp.with_timezone(&chrono::Utc), message.to_string()))
}

/// Accumulates byte chunks and yields completed lines
#[derive(Default)]
struct LineBuffer {
    buf: Vec<u8>,
}

impl LineBuffer {
    fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buf.extend_from_slice(chunk);

        let mut lines = Vec::new();
        while let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
            let mut line: Vec<u8> = self.buf.drain(..=pos).collect();
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            lines.push(String::from_utf8_lossy(&line).into_owned());
        }
        lines
    }
}

/// Resolves cluster credentials for the current environment
async fn resolve_auth() -> Result<ClusterAuth, GatewayError> {
    let token_path = Path::new(SERVICE_ACCOUNT_DIR).join("token");

    if std::env::var("KUBERNETES_SERVICE_HOST").is_ok() && token_path.exists() {
        info!("using in-cluster service-account identity");
        return in_cluster_auth(&token_path).await;
    }

    let path = kubeconfig_path().ok_or_else(|| {
        GatewayError::Auth("no in-cluster identity and no kubeconfig found".to_string())
    })?;
    info!("using kubeconfig at {}", path.display());
    kubeconfig_auth(&path).await
}

async fn in_cluster_auth(token_path: &Path) -> Result<ClusterAuth, GatewayError> {
    let host = std::env::var("KUBERNETES_SERVICE_HOST")
        .map_err(|_| GatewayError::Auth("KUBERNETES_SERVICE_HOST not set".to_string()))?;
    let port = std::env::var("KUBERNETES_SERVICE_PORT").unwrap_or_else(|_| "443".to_string());

    let token = tokio::fs::read_to_string(token_path)
        .await
        .map_err(|e| GatewayError::Auth(format!("failed to read service-account token: {}", e)))?;
    let ca_pem = tokio::fs::read(Path::new(SERVICE_ACCOUNT_DIR).join("ca.crt"))
        .await
        .map_err(|e| GatewayError::Auth(format!("failed to read cluster CA: {}", e)))?;

    Ok(ClusterAuth {
        server: format!("https://{}:{}", host, port),
        token: Some(token.trim().to_string()),
        ca_pem: Some(ca_pem),
        insecure_skip_tls_verify: false,
    })
}

fn kubeconfig_path() -> Option<PathBuf> {
    if let Ok(path) = std::env::var("KUBECONFIG") {
        if !path.is_empty() {
            return Some(PathBuf::from(path));
        }
    }

    std::env::var("HOME")
        .ok()
        .map(|home| PathBuf::from(home).join(".kube").join("config"))
        .filter(|path| path.exists())
}

async fn kubeconfig_auth(path: &Path) -> Result<ClusterAuth, GatewayError> {
    let raw = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| GatewayError::Auth(format!("failed to read kubeconfig: {}", e)))?;
    let kubeconfig: Kubeconfig = serde_yaml::from_str(&raw)
        .map_err(|e| GatewayError::Auth(format!("failed to parse kubeconfig: {}", e)))?;

    let context_name = kubeconfig
        .current_context
        .clone()
        .or_else(|| kubeconfig.contexts.first().map(|c| c.name.clone()))
        .ok_or_else(|| GatewayError::Auth("kubeconfig has no contexts".to_string()))?;
    let context = kubeconfig
        .contexts
        .iter()
        .find(|c| c.name == context_name)
        .map(|c| &c.context)
        .ok_or_else(|| {
            GatewayError::Auth(format!("kubeconfig context {} not found", context_name))
        })?;

    let cluster = kubeconfig
        .clusters
        .iter()
        .find(|c| c.name == context.cluster)
        .map(|c| &c.cluster)
        .ok_or_else(|| {
            GatewayError::Auth(format!("kubeconfig cluster {} not found", context.cluster))
        })?;

    let ca_pem = match (&cluster.certificate_authority_data, &cluster.certificate_authority) {
        (Some(data), _) => Some(BASE64.decode(data).map_err(|e| {
            GatewayError::Auth(format!("invalid certificate-authority-data: {}", e))
        })?),
        (None, Some(ca_path)) => Some(tokio::fs::read(ca_path).await.map_err(|e| {
            GatewayError::Auth(format!("failed to read certificate authority: {}", e))
        })?),
        (None, None) => None,
    };

    let user = kubeconfig
        .users
        .iter()
        .find(|u| u.name == context.user)
        .map(|u| &u.user);

    let token = match user {
        Some(user) => match (&user.token, &user.token_file) {
            (Some(token), _) => Some(token.clone()),
            (None, Some(file)) => Some(
                tokio::fs::read_to_string(file)
                    .await
                    .map_err(|e| {
                        GatewayError::Auth(format!("failed to read token file: {}", e))
                    })?
                    .trim()
                    .to_string(),
            ),
            (None, None) => None,
        },
        None => None,
    };

    if token.is_none() {
        warn!("kubeconfig user carries no bearer token; proceeding unauthenticated");
    }

    Ok(ClusterAuth {
        server: cluster.server.clone(),
        token,
        ca_pem,
        insecure_skip_tls_verify: cluster.insecure_skip_tls_verify,
    })
}

// Minimal kubeconfig model; only the fields the auth ladder reads.

#[derive(Debug, Deserialize)]
struct Kubeconfig {
    #[serde(rename = "current-context")]
    current_context: Option<String>,
    #[serde(default)]
    clusters: Vec<NamedCluster>,
    #[serde(default)]
    contexts: Vec<NamedContext>,
    #[serde(default)]
    users: Vec<NamedUser>,
}

#[derive(Debug, Deserialize)]
struct NamedCluster {
    name: String,
    cluster: ClusterEntry,
}

#[derive(Debug, Deserialize)]
struct ClusterEntry {
    server: String,
    #[serde(rename = "certificate-authority-data")]
    certificate_authority_data: Option<String>,
    #[serde(rename = "certificate-authority")]
    certificate_authority: Option<String>,
    #[serde(rename = "insecure-skip-tls-verify", default)]
    insecure_skip_tls_verify: bool,
}

#[derive(Debug, Deserialize)]
struct NamedContext {
    name: String,
    context: ContextEntry,
}

#[derive(Debug, Deserialize)]
struct ContextEntry {
    cluster: String,
    user: String,
}

#[derive(Debug, Deserialize)]
struct NamedUser {
    name: String,
    user: UserEntry,
}

#[derive(Debug, Default, Deserialize)]
struct UserEntry {
    token: Option<String>,
    #[serde(rename = "token-file")]
    token_file: Option<String>,
}
