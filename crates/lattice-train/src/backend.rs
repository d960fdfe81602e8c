//! Job backends: where compiled jobs are sent and how they are supervised

use std::sync::Arc;

use async_trait::async_trait;
use lattice_common::{JobDescription, Sidecar, Volume, VolumeMount};
#[cfg(test)]
use mockall::automock;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::compiler::DeployCompiler;
use crate::control_plane::ControlPlane;
use crate::error::Result;
use crate::lifecycle::{JobOutcome, LifecycleManager, LifecyclePhase, SubmissionHandle};
use crate::strategy::{SidecarAttachment, SIDECAR_ROLE};

/// Port TensorBoard listens on
pub const TENSORBOARD_PORT: u16 = 6006;
/// Volume name of the TensorBoard log directory
pub const TENSORBOARD_VOLUME: &str = "tensorboard";

fn default_tensorboard_image() -> String {
    "tensorflow/tensorflow:latest".to_string()
}

/// TensorBoard sidecar settings
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TensorboardOptions {
    /// Directory the training code writes summaries to
    pub log_dir: String,
    /// Claim backing the log directory
    pub pvc_name: String,
    /// TensorBoard image
    #[serde(default = "default_tensorboard_image")]
    pub image: String,
}

/// Submits compiled jobs and supervises them to an outcome
#[cfg_attr(test, automock)]
#[async_trait]
pub trait JobBackend: Send + Sync {
    /// Short name for logs
    fn name(&self) -> &'static str;

    /// Sidecar this backend contributes for TensorBoard, if it supports one
    fn sidecar(&self, tensorboard: &TensorboardOptions) -> Option<SidecarAttachment>;

    /// Send one job to the cluster
    async fn submit(&self, job: &JobDescription, namespace: &str) -> Result<SubmissionHandle>;

    /// Follow a submitted job until it reaches an outcome
    async fn supervise(
        &self,
        handle: &mut SubmissionHandle,
        stream_logs: bool,
        cancel: &CancellationToken,
    ) -> Result<JobOutcome>;

    /// Send the deletion request for a submitted job without waiting for it to finish
    async fn cancel(&self, handle: &SubmissionHandle);

    /// Best-effort removal of the job's auxiliary objects
    async fn cleanup(&self, handle: &mut SubmissionHandle);
}

/// Kubeflow TFJob backend, driven by the lifecycle manager
pub struct KubeflowBackend<C: ?Sized> {
    manager: LifecycleManager<C>,
}

impl<C: ControlPlane + ?Sized + 'static> KubeflowBackend<C> {
    /// Backend submitting through `control_plane`
    pub fn new(manager: LifecycleManager<C>) -> Self {
        Self { manager }
    }

    /// Backend with default retry budgets
    pub fn with_control_plane(control_plane: Arc<C>) -> Self {
        Self::new(LifecycleManager::new(control_plane))
    }
}

/// TensorBoard sidecar on the primary role, log directory shared through a PVC
pub fn tensorboard_sidecar(options: &TensorboardOptions) -> SidecarAttachment {
    let mount = VolumeMount::new(TENSORBOARD_VOLUME, &options.log_dir);
    SidecarAttachment {
        sidecar: Sidecar {
            name: "tensorboard".to_string(),
            image: options.image.clone(),
            args: vec![
                "tensorboard".to_string(),
                format!("--logdir={}", options.log_dir),
                "--host=0.0.0.0".to_string(),
                format!("--port={}", TENSORBOARD_PORT),
            ],
            port: Some(TENSORBOARD_PORT),
            attach_to: SIDECAR_ROLE,
            volume_mounts: vec![mount.clone()],
        },
        volumes: vec![Volume::pvc(TENSORBOARD_VOLUME, &options.pvc_name)],
        mounts: vec![mount],
    }
}

#[async_trait]
impl<C: ControlPlane + ?Sized + 'static> JobBackend for KubeflowBackend<C> {
    fn name(&self) -> &'static str {
        "kubeflow"
    }

    fn sidecar(&self, tensorboard: &TensorboardOptions) -> Option<SidecarAttachment> {
        Some(tensorboard_sidecar(tensorboard))
    }

    async fn submit(&self, job: &JobDescription, namespace: &str) -> Result<SubmissionHandle> {
        self.manager.submit(job, namespace).await
    }

    async fn supervise(
        &self,
        handle: &mut SubmissionHandle,
        stream_logs: bool,
        cancel: &CancellationToken,
    ) -> Result<JobOutcome> {
        let mut stdout = tokio::io::stdout();
        let logs = if stream_logs { Some(&mut stdout) } else { None };
        self.manager.supervise(handle, logs, cancel).await
    }

    async fn cancel(&self, handle: &SubmissionHandle) {
        self.manager.cancel(handle).await;
    }

    async fn cleanup(&self, handle: &mut SubmissionHandle) {
        self.manager.cleanup(handle).await;
    }
}

/// Backend handing job descriptions to the external deploy compiler
pub struct NativeBackend {
    compiler: DeployCompiler,
}

impl NativeBackend {
    /// Backend using `compiler`
    pub fn new(compiler: DeployCompiler) -> Self {
        Self { compiler }
    }
}

#[async_trait]
impl JobBackend for NativeBackend {
    fn name(&self) -> &'static str {
        "native"
    }

    fn sidecar(&self, _tensorboard: &TensorboardOptions) -> Option<SidecarAttachment> {
        warn!("native backend does not support a tensorboard sidecar, skipping");
        None
    }

    async fn submit(&self, job: &JobDescription, namespace: &str) -> Result<SubmissionHandle> {
        let mut handle = SubmissionHandle::new(job, namespace);
        self.compiler.run(job).await?;
        handle.transition(LifecyclePhase::Submitted);
        Ok(handle)
    }

    async fn supervise(
        &self,
        handle: &mut SubmissionHandle,
        stream_logs: bool,
        _cancel: &CancellationToken,
    ) -> Result<JobOutcome> {
        if stream_logs {
            handle.transition(LifecyclePhase::Streaming);
            if let Err(e) = self.compiler.logs(handle.name()).await {
                warn!(job = %handle.name(), error = %e, "attaching to logs failed");
            }
        }
        info!(job = %handle.name(), "job deployed, status not observable from this backend");
        Ok(JobOutcome::Detached)
    }

    async fn cancel(&self, handle: &SubmissionHandle) {
        // The spawned compiler process outlives this one.
        self.compiler.cancel(handle.name());
    }

    async fn cleanup(&self, handle: &mut SubmissionHandle) {
        debug!(job = %handle.name(), "nothing to clean up, compiler owns the job's resources");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control_plane::MockControlPlane;
    use crate::error::TrainError;
    use lattice_common::{RetryBudget, RoleGroup, RoleKind};

    fn options() -> TensorboardOptions {
        TensorboardOptions {
            log_dir: "/logs".to_string(),
            pvc_name: "tb-claim".to_string(),
            image: default_tensorboard_image(),
        }
    }

    fn job() -> JobDescription {
        let mut job = JobDescription::new("mnist-abc", "abc");
        job.roles.push(RoleGroup::new(RoleKind::Master, 1, "img:abc"));
        job
    }

    #[test]
    fn tensorboard_sidecar_shares_log_volume() {
        let attachment = tensorboard_sidecar(&options());
        assert_eq!(attachment.sidecar.attach_to, RoleKind::Master);
        assert_eq!(attachment.sidecar.port, Some(6006));
        assert!(attachment.sidecar.args.contains(&"--logdir=/logs".to_string()));
        assert_eq!(attachment.volumes, vec![Volume::pvc("tensorboard", "tb-claim")]);
        assert_eq!(attachment.mounts[0].mount_path, "/logs");
        assert_eq!(attachment.sidecar.volume_mounts, attachment.mounts);
    }

    #[test]
    fn tensorboard_image_defaults() {
        let parsed: TensorboardOptions =
            serde_yaml::from_str("logDir: /logs\npvcName: tb-claim\n").unwrap();
        assert_eq!(parsed, options());
    }

    #[test]
    fn native_backend_skips_sidecar() {
        let backend = NativeBackend::new(DeployCompiler::default());
        assert!(backend.sidecar(&options()).is_none());
        assert_eq!(backend.name(), "native");
    }

    #[tokio::test]
    async fn kubeflow_backend_submits_through_control_plane() {
        let mut mock = MockControlPlane::new();
        mock.expect_create_config_map().times(0);
        mock.expect_create_job().times(1).returning(|_, _| Ok(()));

        let backend = KubeflowBackend::new(
            LifecycleManager::new(Arc::new(mock)).with_budget(RetryBudget::immediate(1)),
        );
        let handle = backend.submit(&job(), "ml").await.unwrap();
        assert_eq!(handle.name(), "mnist-abc");
        assert_eq!(handle.phase(), LifecyclePhase::Submitted);
        assert!(backend.sidecar(&options()).is_some());
    }

    #[tokio::test]
    async fn native_backend_without_compiler_fails_submission() {
        let dir = tempfile::tempdir().unwrap();
        let backend = NativeBackend::new(
            DeployCompiler::new("/nonexistent/mp-compiler").with_spec_dir(dir.path()),
        );
        let err = backend.submit(&job(), "ml").await.unwrap_err();
        assert!(matches!(err, TrainError::Compiler { .. }));
        assert!(dir.path().join("mnist-abc.json").exists());
    }

    #[tokio::test]
    async fn native_backend_is_detached() {
        let backend = NativeBackend::new(DeployCompiler::default());
        let mut handle = SubmissionHandle::new(&job(), "ml");
        let outcome = backend
            .supervise(&mut handle, false, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome, JobOutcome::Detached);
    }
}
