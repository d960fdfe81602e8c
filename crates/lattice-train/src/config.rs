//! Deploy configuration loaded from `train.yaml`
//!
//! The kubeconfig resolution chain (highest priority first):
//! 1. Explicit `--kubeconfig` flag
//! 2. `LATTICE_KUBECONFIG` environment variable
//! 3. Fall back to kube default (in-cluster config, `KUBECONFIG`, `~/.kube/config`)

use std::path::{Path, PathBuf};
use std::time::Duration;

use lattice_common::{RetryBudget, DEFAULT_NAMESPACE};
use serde::{Deserialize, Serialize};

use crate::backend::TensorboardOptions;
use crate::compiler::DEFAULT_COMPILER_PATH;
use crate::error::{Result, TrainError};
use crate::topology::{CoordinatorTopology, TopologyPolicy, Unmanaged, DEFAULT_SCRIPT_PATH};
use crate::trainer::DeploySettings;

const LATTICE_KUBECONFIG_ENV: &str = "LATTICE_KUBECONFIG";

fn default_image_name() -> String {
    "lattice-train-job".to_string()
}

fn default_true() -> bool {
    true
}

fn default_context() -> PathBuf {
    PathBuf::from(".")
}

fn default_namespace() -> String {
    DEFAULT_NAMESPACE.to_string()
}

fn default_compiler_path() -> PathBuf {
    PathBuf::from(DEFAULT_COMPILER_PATH)
}

fn default_replicas() -> i32 {
    1
}

fn default_instances() -> u32 {
    1
}

fn default_script_path() -> PathBuf {
    PathBuf::from(DEFAULT_SCRIPT_PATH)
}

/// How the training image is produced
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BuilderKind {
    /// Build and push with the docker CLI
    #[default]
    Docker,
    /// The image already exists
    Prebuilt,
}

/// Where jobs are sent
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Kubeflow TFJob through the Kubernetes API
    #[default]
    Kubeflow,
    /// External deploy compiler
    Native,
}

/// Job shape
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum TopologyConfig {
    /// Single role
    Unmanaged {
        /// Replica count
        #[serde(default = "default_replicas")]
        replicas: i32,
    },
    /// Master + workers + parameter servers
    Coordinator {
        /// Worker replicas
        #[serde(default)]
        workers: i32,
        /// Parameter-server replicas
        #[serde(default, rename = "parameterServers")]
        parameter_servers: i32,
        /// Independent job instances
        #[serde(default = "default_instances")]
        instances: u32,
        /// Training script shipped to the master
        #[serde(default = "default_script_path", rename = "scriptPath")]
        script_path: PathBuf,
    },
}

impl Default for TopologyConfig {
    fn default() -> Self {
        Self::Unmanaged {
            replicas: default_replicas(),
        }
    }
}

/// Retry settings shared by the start watch and status polling
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryConfig {
    /// Attempts before giving up
    pub max_attempts: u32,
    /// Seconds between attempts
    pub delay_secs: u64,
    /// Seconds a single attempt may take
    pub request_timeout_secs: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        let budget = RetryBudget::default();
        Self {
            max_attempts: budget.max_attempts,
            delay_secs: budget.delay.as_secs(),
            request_timeout_secs: budget.request_timeout.as_secs(),
        }
    }
}

impl From<&RetryConfig> for RetryBudget {
    fn from(config: &RetryConfig) -> Self {
        RetryBudget::new(
            config.max_attempts,
            Duration::from_secs(config.delay_secs),
            Duration::from_secs(config.request_timeout_secs),
        )
    }
}

/// Contents of `train.yaml`
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrainConfig {
    /// Registry/repository the image is pushed to
    pub repository: String,
    /// Image and job base name
    #[serde(default = "default_image_name")]
    pub image_name: String,
    /// Fixed image tag; generated per deploy when absent
    #[serde(default)]
    pub image_tag: Option<String>,
    /// Push the image after building
    #[serde(default = "default_true")]
    pub publish: bool,
    /// Build context directory
    #[serde(default = "default_context")]
    pub context: PathBuf,
    /// Dockerfile relative to the context
    #[serde(default)]
    pub dockerfile: Option<PathBuf>,
    /// Base image build argument
    #[serde(default)]
    pub base_image: Option<String>,
    /// Image builder
    #[serde(default)]
    pub builder: BuilderKind,
    /// Job backend
    #[serde(default)]
    pub backend: BackendKind,
    /// Job shape
    #[serde(default)]
    pub topology: TopologyConfig,
    /// Notebook converted to the training script before deploying
    #[serde(default)]
    pub notebook: Option<PathBuf>,
    /// TensorBoard sidecar
    #[serde(default)]
    pub tensorboard: Option<TensorboardOptions>,
    /// Namespace used outside the cluster
    #[serde(default = "default_namespace")]
    pub namespace: String,
    /// Follow the primary container's logs
    #[serde(default = "default_true")]
    pub stream_logs: bool,
    /// External deploy compiler (native backend)
    #[serde(default = "default_compiler_path")]
    pub compiler_path: PathBuf,
    /// Start-watch and status-poll budget
    #[serde(default)]
    pub retry: RetryConfig,
}

impl TrainConfig {
    /// Parse a YAML document
    pub fn from_yaml(source: &str, yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml)
            .map_err(|e| TrainError::configuration(source, format!("invalid config: {}", e)))
    }

    /// Load and parse `path`
    pub fn load(path: &Path) -> Result<Self> {
        let source = path.display().to_string();
        let yaml = std::fs::read_to_string(path)
            .map_err(|e| TrainError::configuration(&source, format!("failed to read: {}", e)))?;
        Self::from_yaml(&source, &yaml)
    }

    /// Topology policy for this config
    pub fn topology(&self) -> Box<dyn TopologyPolicy> {
        match &self.topology {
            TopologyConfig::Unmanaged { replicas } => Box::new(Unmanaged::new(*replicas)),
            TopologyConfig::Coordinator {
                workers,
                parameter_servers,
                instances,
                script_path,
            } => Box::new(
                CoordinatorTopology::new(*workers, *parameter_servers)
                    .with_instances(*instances)
                    .with_script_path(script_path),
            ),
        }
    }

    /// Where the topology reads the training script from
    pub fn script_path(&self) -> PathBuf {
        match &self.topology {
            TopologyConfig::Coordinator { script_path, .. } => script_path.clone(),
            TopologyConfig::Unmanaged { .. } => default_script_path(),
        }
    }

    /// Retry budget for control-plane waits
    pub fn retry_budget(&self) -> RetryBudget {
        RetryBudget::from(&self.retry)
    }

    /// Deploy settings for the resolved `namespace`
    pub fn deploy_settings(&self, namespace: &str, stream_logs: bool) -> DeploySettings {
        DeploySettings {
            image_name: self.image_name.clone(),
            repository: self.repository.clone(),
            image_tag: self.image_tag.clone(),
            context: self.context.clone(),
            dockerfile: self.dockerfile.clone(),
            base_image: self.base_image.clone(),
            publish: self.publish,
            namespace: namespace.to_string(),
            stream_logs: self.stream_logs && stream_logs,
            notebook: self.notebook.clone(),
            script_path: self.script_path(),
            tensorboard: self.tensorboard.clone(),
        }
    }
}

/// Resolve the kubeconfig path: explicit flag, then `LATTICE_KUBECONFIG`, then `None`
pub fn resolve_kubeconfig(explicit: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit {
        return Some(path.to_path_buf());
    }

    if let Ok(path) = std::env::var(LATTICE_KUBECONFIG_ENV) {
        if !path.is_empty() {
            return Some(PathBuf::from(path));
        }
    }

    None
}
