//! Server configuration
//!
//! Settings are layered: built-in defaults, then an optional YAML file, then
//! environment variables with the `STAGEHAND__` prefix (`__` separates
//! nesting, e.g. `STAGEHAND__SERVER__PORT=9191`).

use anyhow::{Context, Result};
use config::{Config as ConfigBuilder, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

use stagehand_core::names;

/// Complete application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    pub server: ServerSettings,
    pub kubernetes: KubernetesSettings,
    pub worker: WorkerSettings,
    pub logging: LoggingSettings,
}

/// RPC surface and handler egress configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSettings {
    /// Listening port
    pub port: u16,
    /// Dial target for egress logs and status notifications
    pub handler_host: String,
    /// Bypass the real handler; log egress locally
    pub mock_mode: bool,
}

/// Cluster configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KubernetesSettings {
    /// Namespace for all pod operations
    pub namespace: String,
    /// Identity the deployment binds pod-management rights to
    pub service_account: String,
}

/// Worker pod defaults
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerSettings {
    /// Image used when a stage does not name one
    pub image: String,
    pub cpu_limit: String,
    pub memory_limit: String,
    /// Additional static labels applied to every worker pod
    #[serde(default)]
    pub labels: HashMap<String, String>,
}

/// Logger tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingSettings {
    pub level: String,
    /// "text" or "json"
    pub format: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            server: ServerSettings {
                port: 9090,
                handler_host: "http://handler:8080".to_string(),
                // Default to mock mode so a fresh deployment never spams a
                // handler it was not pointed at.
                mock_mode: true,
            },
            kubernetes: KubernetesSettings {
                namespace: "default".to_string(),
                service_account: "stagehand".to_string(),
            },
            worker: WorkerSettings {
                image: "busybox:latest".to_string(),
                cpu_limit: "500m".to_string(),
                memory_limit: "128Mi".to_string(),
                labels: HashMap::new(),
            },
            logging: LoggingSettings {
                level: "info".to_string(),
                format: "text".to_string(),
            },
        }
    }
}

impl Settings {
    /// Load configuration from defaults, an optional YAML file, and the
    /// environment
    ///
    /// When `config_path` is given the file must exist; otherwise a few
    /// conventional locations are probed and silently skipped when absent.
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        let mut builder = ConfigBuilder::builder()
            .add_source(config::Config::try_from(&Settings::default())?);

        if let Some(path) = config_path {
            if !Path::new(path).exists() {
                anyhow::bail!("config file not found: {}", path);
            }
            builder = builder.add_source(File::new(path, FileFormat::Yaml));
        } else {
            let default_paths = [
                "config/stagehand.yaml",
                "stagehand.yaml",
                "/etc/stagehand/config.yaml",
            ];
            for path in &default_paths {
                if Path::new(path).exists() {
                    builder = builder.add_source(File::new(*path, FileFormat::Yaml));
                    break;
                }
            }
        }

        builder = builder.add_source(
            Environment::with_prefix("STAGEHAND")
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        let settings: Settings = builder
            .build()
            .context("failed to assemble configuration")?
            .try_deserialize()
            .context("failed to deserialize configuration")?;

        settings.validate()?;
        Ok(settings)
    }

    /// Validates the configuration
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            anyhow::bail!("server port cannot be 0");
        }

        if self.server.handler_host.is_empty() {
            anyhow::bail!("handler_host cannot be empty");
        }

        if self.kubernetes.namespace.is_empty() {
            anyhow::bail!("kubernetes namespace cannot be empty");
        }

        if self.worker.image.is_empty() {
            anyhow::bail!("worker image cannot be empty");
        }

        Ok(())
    }

    /// Bind address for the RPC listener
    pub fn bind_addr(&self) -> String {
        format!("0.0.0.0:{}", self.server.port)
    }

    /// Worker pod labels: static labels from configuration merged with
    /// request-specific ones, under the mandatory management pair
    pub fn worker_labels(
        &self,
        additional: HashMap<String, String>,
    ) -> HashMap<String, String> {
        let mut labels = HashMap::new();
        labels.insert(
            names::MANAGED_BY_LABEL.to_string(),
            names::MANAGED_BY_VALUE.to_string(),
        );

        for (k, v) in &self.worker.labels {
            labels.insert(k.clone(), v.clone());
        }

        for (k, v) in additional {
            labels.insert(k, v);
        }

        labels
    }
}
