//! Wiring from `train.yaml` to a running deploy
//!
//! [`ConfiguredDeploy`] defers building the [`Trainer`] (and its kube client)
//! until the control branch actually runs, so worker pods never touch the
//! API server. [`CommandTraining`] is the worker-side body: the user's
//! training command.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use lattice_common::kube_utils::create_client;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::backend::{JobBackend, KubeflowBackend, NativeBackend};
use crate::builder::{DockerCliBuilder, ImageBuilder, PrebuiltImage};
use crate::compiler::DeployCompiler;
use crate::config::{BackendKind, BuilderKind, TrainConfig};
use crate::control_plane::KubeControlPlane;
use crate::dispatcher::Trainable;
use crate::error::{Result, TrainError};
use crate::lifecycle::LifecycleManager;
use crate::strategy::BasicStrategy;
use crate::trainer::{Deploy, DeployReport, Trainer};

/// Runs the user's training command inside the worker pod
pub struct CommandTraining {
    command: Vec<String>,
}

impl CommandTraining {
    /// Training body running `command` (program followed by its arguments)
    pub fn new(command: Vec<String>) -> Self {
        Self { command }
    }
}

#[async_trait]
impl Trainable for CommandTraining {
    async fn train(&mut self) -> Result<()> {
        let (program, args) = self
            .command
            .split_first()
            .ok_or_else(|| TrainError::training("no training command given"))?;

        info!(program = %program, "starting training command");
        let status = Command::new(program).args(args).status().await?;
        if !status.success() {
            return Err(TrainError::training(format!(
                "{} exited with {}",
                program, status
            )));
        }
        Ok(())
    }
}

/// Control-side deployer assembled from config on first use
pub struct ConfiguredDeploy {
    config: TrainConfig,
    namespace: String,
    kubeconfig: Option<PathBuf>,
    stream_logs: bool,
    shutdown: CancellationToken,
}

impl ConfiguredDeploy {
    /// Deployer for `config`, submitting to `namespace`
    pub fn new(config: TrainConfig, namespace: impl Into<String>) -> Self {
        Self {
            config,
            namespace: namespace.into(),
            kubeconfig: None,
            stream_logs: true,
            shutdown: CancellationToken::new(),
        }
    }

    /// Explicit kubeconfig for the Kubeflow backend
    pub fn with_kubeconfig(mut self, kubeconfig: Option<PathBuf>) -> Self {
        self.kubeconfig = kubeconfig;
        self
    }

    /// Turn log streaming off regardless of config
    pub fn with_stream_logs(mut self, stream_logs: bool) -> Self {
        self.stream_logs = stream_logs;
        self
    }

    /// Interrupt token handed to the trainer
    pub fn with_shutdown(mut self, shutdown: CancellationToken) -> Self {
        self.shutdown = shutdown;
        self
    }

    fn image_builder(&self) -> Box<dyn ImageBuilder> {
        match self.config.builder {
            BuilderKind::Docker => Box::new(DockerCliBuilder::default()),
            BuilderKind::Prebuilt => Box::new(PrebuiltImage),
        }
    }

    async fn job_backend(&self) -> Result<Box<dyn JobBackend>> {
        match self.config.backend {
            BackendKind::Native => {
                let compiler = DeployCompiler::new(self.config.compiler_path.clone());
                compiler.ensure_present()?;
                Ok(Box::new(NativeBackend::new(compiler)))
            }
            BackendKind::Kubeflow => {
                let client = create_client(self.kubeconfig.as_deref()).await?;
                let manager = LifecycleManager::new(Arc::new(KubeControlPlane::new(client)))
                    .with_budget(self.config.retry_budget());
                Ok(Box::new(KubeflowBackend::new(manager)))
            }
        }
    }

    /// Assemble the trainer described by the config
    pub async fn trainer(&self) -> Result<Trainer> {
        let backend = self.job_backend().await?;
        let settings = self
            .config
            .deploy_settings(&self.namespace, self.stream_logs);
        let strategy = Box::new(BasicStrategy::new(self.config.topology()));

        Ok(
            Trainer::new(settings, strategy, self.image_builder(), backend)
                .with_shutdown(self.shutdown.clone()),
        )
    }
}

#[async_trait]
impl Deploy for ConfiguredDeploy {
    async fn deploy(&self) -> Result<DeployReport> {
        self.trainer().await?.deploy().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn native_config(compiler_path: &str) -> TrainConfig {
        let yaml = format!(
            "repository: registry.local\nbackend: native\ncompilerPath: {}\n",
            compiler_path
        );
        TrainConfig::from_yaml("t", &yaml).unwrap()
    }

    #[tokio::test]
    async fn native_backend_requires_compiler() {
        let deploy = ConfiguredDeploy::new(native_config("/nonexistent/mp-compiler"), "ml");
        let err = deploy.deploy().await.unwrap_err();
        assert!(matches!(err, TrainError::CompilerMissing { .. }));
    }

    #[tokio::test]
    async fn native_backend_builds_trainer_when_compiler_present() {
        let dir = tempfile::tempdir().unwrap();
        let binary = dir.path().join("mp-compiler");
        std::fs::write(&binary, "").unwrap();

        let deploy = ConfiguredDeploy::new(native_config(&binary.display().to_string()), "ml");
        assert!(deploy.trainer().await.is_ok());
    }

    #[tokio::test]
    async fn empty_command_is_training_error() {
        let mut training = CommandTraining::new(vec![]);
        assert!(matches!(
            training.train().await,
            Err(TrainError::Training(_))
        ));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn command_exit_status_decides_result() {
        let mut ok = CommandTraining::new(vec!["true".to_string()]);
        assert!(ok.train().await.is_ok());

        let mut failing = CommandTraining::new(vec!["false".to_string()]);
        let err = failing.train().await.unwrap_err();
        assert!(err.to_string().contains("false exited with"));
    }
}
