//! Control-side deploy pipeline
//!
//! convert notebook -> compile -> build image -> submit -> supervise
//!
//! The image is built exactly once, before anything is submitted. An
//! interrupt during supervision cancels every submitted instance, cleans up
//! best-effort and returns [`TrainError::Cancelled`].

use std::path::PathBuf;

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::backend::{JobBackend, TensorboardOptions};
use crate::builder::{image_ref, unique_tag, BuildRequest, ImageBuilder};
use crate::convert::NotebookConverter;
use crate::error::{Result, TrainError};
use crate::lifecycle::{JobOutcome, SubmissionHandle};
use crate::strategy::TrainingStrategy;
use crate::topology::JobIdentity;

/// Inputs of one deploy that are not policy objects
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeploySettings {
    /// Image (and job base) name
    pub image_name: String,
    /// Registry/repository prefix
    pub repository: String,
    /// Fixed tag; a unique one is generated per deploy when absent
    pub image_tag: Option<String>,
    /// Build context directory
    pub context: PathBuf,
    /// Dockerfile, relative to the context
    pub dockerfile: Option<PathBuf>,
    /// Base image build argument
    pub base_image: Option<String>,
    /// Push the image after building
    pub publish: bool,
    /// Namespace jobs are submitted to
    pub namespace: String,
    /// Follow the primary container's logs
    pub stream_logs: bool,
    /// Notebook converted to the training script before compiling
    pub notebook: Option<PathBuf>,
    /// Where the converted script is written
    pub script_path: PathBuf,
    /// TensorBoard sidecar, if the backend supports one
    pub tensorboard: Option<TensorboardOptions>,
}

/// What one deploy produced
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeployReport {
    /// Image the jobs run
    pub image: String,
    /// Outcome per job instance, in submission order
    pub jobs: Vec<(String, JobOutcome)>,
}

impl DeployReport {
    /// Failed if any instance failed, detached if any is detached, else completed
    pub fn outcome(&self) -> JobOutcome {
        let outcomes = self.jobs.iter().map(|(_, o)| *o);
        if outcomes.clone().any(|o| o == JobOutcome::Failed) {
            JobOutcome::Failed
        } else if outcomes.clone().any(|o| o == JobOutcome::Detached) {
            JobOutcome::Detached
        } else {
            JobOutcome::Completed
        }
    }
}

/// The control-side branch of the execution dispatcher
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Deploy: Send + Sync {
    /// Compile, build, submit and supervise
    async fn deploy(&self) -> Result<DeployReport>;
}

/// Composes the policy objects into one deploy
pub struct Trainer {
    settings: DeploySettings,
    strategy: Box<dyn TrainingStrategy>,
    builder: Box<dyn ImageBuilder>,
    backend: Box<dyn JobBackend>,
    converter: NotebookConverter,
    shutdown: CancellationToken,
}

impl Trainer {
    /// Trainer that is never interrupted until [`Trainer::with_shutdown`] is set
    pub fn new(
        settings: DeploySettings,
        strategy: Box<dyn TrainingStrategy>,
        builder: Box<dyn ImageBuilder>,
        backend: Box<dyn JobBackend>,
    ) -> Self {
        Self {
            settings,
            strategy,
            builder,
            backend,
            converter: NotebookConverter::default(),
            shutdown: CancellationToken::new(),
        }
    }

    /// Cancel supervision when `token` fires
    pub fn with_shutdown(mut self, token: CancellationToken) -> Self {
        self.shutdown = token;
        self
    }

    /// Use a specific notebook converter
    pub fn with_converter(mut self, converter: NotebookConverter) -> Self {
        self.converter = converter;
        self
    }

    fn cancelled(handles: &[SubmissionHandle], fallback: &str) -> TrainError {
        let job = if handles.is_empty() {
            fallback.to_string()
        } else {
            handles
                .iter()
                .map(|h| h.name().to_string())
                .collect::<Vec<_>>()
                .join(",")
        };
        TrainError::Cancelled { job }
    }

    async fn interrupt(&self, handles: &mut [SubmissionHandle]) -> TrainError {
        warn!(jobs = handles.len(), "interrupt received, cancelling submitted jobs");
        self.withdraw(handles).await;
        Self::cancelled(handles, "")
    }

    /// Delete each job, then its auxiliary objects. Returns once every
    /// delete request has been sent.
    async fn withdraw(&self, handles: &mut [SubmissionHandle]) {
        for handle in handles.iter() {
            self.backend.cancel(handle).await;
        }
        for handle in handles.iter_mut() {
            self.backend.cleanup(handle).await;
        }
    }

    async fn submit_all(
        &self,
        jobs: &[lattice_common::JobDescription],
    ) -> Result<Vec<SubmissionHandle>> {
        let mut handles = Vec::with_capacity(jobs.len());
        for job in jobs {
            match self.backend.submit(job, &self.settings.namespace).await {
                Ok(handle) => {
                    info!(job = %job.name, backend = self.backend.name(), "job submitted");
                    handles.push(handle);
                }
                Err(e) => {
                    if !handles.is_empty() {
                        warn!(submitted = handles.len(), "submission failed, withdrawing earlier instances");
                        self.withdraw(&mut handles).await;
                    }
                    return Err(e);
                }
            }
        }
        Ok(handles)
    }
}

#[async_trait]
impl Deploy for Trainer {
    async fn deploy(&self) -> Result<DeployReport> {
        let settings = &self.settings;
        let tag = settings.image_tag.clone().unwrap_or_else(unique_tag);
        let identity = JobIdentity::new(&settings.image_name, &tag);
        let image = image_ref(&settings.repository, &settings.image_name, &tag);
        info!(job = %identity.full_name(), image = %image, "deploying");

        if let Some(notebook) = &settings.notebook {
            self.converter
                .convert(notebook, &settings.script_path)
                .await?;
        }

        let sidecar = settings
            .tensorboard
            .as_ref()
            .and_then(|tb| self.backend.sidecar(tb));
        let compiled = self.strategy.compile(&identity, &image, sidecar.as_ref())?;

        let request = BuildRequest {
            context: settings.context.clone(),
            image: image.clone(),
            base_image: settings.base_image.clone(),
            dockerfile: settings.dockerfile.clone(),
            publish: settings.publish,
            env: compiled.build_env.clone(),
        };
        if let Err(e) = self.builder.build(&request).await {
            error!(image = %image, error = %e, "image build failed, nothing submitted");
            return Err(e);
        }

        if self.shutdown.is_cancelled() {
            return Err(Self::cancelled(&[], &identity.full_name()));
        }

        let mut handles = self.submit_all(&compiled.jobs).await?;

        let mut jobs = Vec::with_capacity(handles.len());
        let mut first_error = None;
        for index in 0..handles.len() {
            let supervised = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => None,
                result = self.backend.supervise(
                    &mut handles[index],
                    settings.stream_logs,
                    &self.shutdown,
                ) => Some(result),
            };
            let name = handles[index].name().to_string();
            match supervised {
                None => return Err(self.interrupt(&mut handles[index..]).await),
                Some(Ok(outcome)) => jobs.push((name, outcome)),
                Some(Err(e)) => {
                    warn!(job = %name, error = %e, "supervision did not reach an outcome");
                    if first_error.is_none() {
                        first_error = Some(e);
                    }
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(DeployReport { image, jobs }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MockJobBackend;
    use crate::builder::MockImageBuilder;
    use crate::strategy::BasicStrategy;
    use crate::topology::Unmanaged;
    use lattice_common::JobDescription;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    fn settings() -> DeploySettings {
        DeploySettings {
            image_name: "mnist".to_string(),
            repository: "registry.local".to_string(),
            image_tag: Some("t1".to_string()),
            context: PathBuf::from("."),
            dockerfile: None,
            base_image: None,
            publish: true,
            namespace: "ml".to_string(),
            stream_logs: false,
            notebook: None,
            script_path: PathBuf::from("/tmp/code.py"),
            tensorboard: None,
        }
    }

    fn trainer(builder: MockImageBuilder, backend: impl JobBackend + 'static) -> Trainer {
        Trainer::new(
            settings(),
            Box::new(BasicStrategy::new(Box::new(Unmanaged::default()))),
            Box::new(builder),
            Box::new(backend),
        )
    }

    #[tokio::test]
    async fn build_failure_submits_nothing() {
        let mut builder = MockImageBuilder::new();
        builder.expect_build().times(1).returning(|req| {
            Err(TrainError::Build {
                image: req.image.clone(),
                message: "exit 1".to_string(),
                stdout: String::new(),
                stderr: "no space left on device".to_string(),
            })
        });
        let mut backend = MockJobBackend::new();
        backend.expect_name().return_const("mock");
        backend.expect_submit().times(0);
        backend.expect_supervise().times(0);

        let err = trainer(builder, backend).deploy().await.unwrap_err();
        assert!(matches!(err, TrainError::Build { .. }));
    }

    #[tokio::test]
    async fn one_build_then_one_submit_per_instance() {
        let mut builder = MockImageBuilder::new();
        builder
            .expect_build()
            .times(1)
            .withf(|req| req.image == "registry.local/mnist:t1" && req.env.contains_key("LATTICE_TRAIN_RUNTIME"))
            .returning(|_| Ok(()));
        let mut backend = MockJobBackend::new();
        backend.expect_name().return_const("mock");
        backend
            .expect_submit()
            .times(1)
            .returning(|job, ns| Ok(SubmissionHandle::new(job, ns)));
        backend
            .expect_supervise()
            .times(1)
            .returning(|_, _, _| Ok(JobOutcome::Completed));

        let report = trainer(builder, backend).deploy().await.unwrap();
        assert_eq!(report.image, "registry.local/mnist:t1");
        assert_eq!(
            report.jobs,
            vec![("mnist-t1".to_string(), JobOutcome::Completed)]
        );
        assert_eq!(report.outcome(), JobOutcome::Completed);
    }

    #[tokio::test]
    async fn compile_errors_stop_before_build() {
        let mut builder = MockImageBuilder::new();
        builder.expect_build().times(0);
        let backend = MockJobBackend::new();

        let trainer = Trainer::new(
            settings(),
            Box::new(BasicStrategy::new(Box::new(Unmanaged::new(-1)))),
            Box::new(builder),
            Box::new(backend),
        );
        let err = trainer.deploy().await.unwrap_err();
        assert!(matches!(err, TrainError::Configuration { .. }));
    }

    #[tokio::test]
    async fn conversion_failure_stops_before_build() {
        let mut builder = MockImageBuilder::new();
        builder.expect_build().times(0);
        let mut backend = MockJobBackend::new();
        backend.expect_submit().times(0);

        let mut settings = settings();
        settings.notebook = Some(PathBuf::from("mnist.ipynb"));
        let trainer = Trainer::new(
            settings,
            Box::new(BasicStrategy::new(Box::new(Unmanaged::default()))),
            Box::new(builder),
            Box::new(backend),
        )
        .with_converter(NotebookConverter::with_binary("/nonexistent/jupyter"));

        let err = trainer.deploy().await.unwrap_err();
        assert!(matches!(err, TrainError::Conversion { .. }));
    }

    #[tokio::test]
    async fn interrupt_before_submission_submits_nothing() {
        let token = CancellationToken::new();
        let trigger = token.clone();
        let mut builder = MockImageBuilder::new();
        builder.expect_build().times(1).returning(move |_| {
            trigger.cancel();
            Ok(())
        });
        let mut backend = MockJobBackend::new();
        backend.expect_submit().times(0);

        let err = trainer(builder, backend)
            .with_shutdown(token)
            .deploy()
            .await
            .unwrap_err();
        assert_eq!(err.exit_code(), 130);
    }

    /// Backend whose jobs never finish; counts cancel and cleanup calls
    #[derive(Default)]
    struct HangingBackend {
        cancels: Arc<AtomicUsize>,
        cleanups: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl JobBackend for HangingBackend {
        fn name(&self) -> &'static str {
            "hanging"
        }

        fn sidecar(&self, _: &TensorboardOptions) -> Option<crate::strategy::SidecarAttachment> {
            None
        }

        async fn submit(&self, job: &JobDescription, namespace: &str) -> Result<SubmissionHandle> {
            Ok(SubmissionHandle::new(job, namespace))
        }

        async fn supervise(
            &self,
            _: &mut SubmissionHandle,
            _: bool,
            _: &CancellationToken,
        ) -> Result<JobOutcome> {
            futures::future::pending().await
        }

        async fn cancel(&self, _: &SubmissionHandle) {
            self.cancels.fetch_add(1, Ordering::SeqCst);
        }

        async fn cleanup(&self, _: &mut SubmissionHandle) {
            self.cleanups.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn interrupt_during_supervision_cancels_and_cleans_up() {
        let backend = HangingBackend::default();
        let cancels = backend.cancels.clone();
        let cleanups = backend.cleanups.clone();
        let mut builder = MockImageBuilder::new();
        builder.expect_build().returning(|_| Ok(()));

        let token = CancellationToken::new();
        let trigger = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let err = trainer(builder, backend)
            .with_shutdown(token)
            .deploy()
            .await
            .unwrap_err();
        match err {
            TrainError::Cancelled { job } => assert_eq!(job, "mnist-t1"),
            other => panic!("expected cancelled, got {:?}", other),
        }
        assert_eq!(cancels.load(Ordering::SeqCst), 1);
        assert_eq!(cleanups.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn interrupt_sends_job_delete_before_returning() {
        use crate::backend::KubeflowBackend;
        use crate::control_plane::{ClusterEvent, MockControlPlane};
        use crate::lifecycle::LifecycleManager;
        use futures::StreamExt;
        use lattice_common::RetryBudget;

        let deletes = Arc::new(AtomicUsize::new(0));
        let seen = deletes.clone();
        let mut control_plane = MockControlPlane::new();
        control_plane.expect_create_config_map().times(0);
        control_plane.expect_create_job().times(1).returning(|_, _| Ok(()));
        control_plane
            .expect_watch_events()
            .returning(|_, _, _| {
                Ok(futures::stream::pending::<lattice_common::Result<ClusterEvent>>().boxed())
            });
        control_plane
            .expect_delete_job()
            .times(1)
            .withf(|ns, name| ns == "ml" && name == "mnist-t1")
            .returning(move |_, _| {
                seen.fetch_add(1, Ordering::SeqCst);
                Ok(())
            });
        let backend = KubeflowBackend::new(
            LifecycleManager::new(Arc::new(control_plane)).with_budget(RetryBudget::immediate(1)),
        );

        let mut builder = MockImageBuilder::new();
        builder.expect_build().returning(|_| Ok(()));

        let token = CancellationToken::new();
        let trigger = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let err = trainer(builder, backend)
            .with_shutdown(token)
            .deploy()
            .await
            .unwrap_err();
        assert_eq!(err.exit_code(), 130);
        assert_eq!(deletes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failed_instance_submission_withdraws_earlier_instances() {
        use crate::topology::CoordinatorTopology;
        use mockall::Sequence;

        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("code.py");
        std::fs::write(&script, "train()").unwrap();

        let mut builder = MockImageBuilder::new();
        builder.expect_build().times(1).returning(|_| Ok(()));

        let mut seq = Sequence::new();
        let mut backend = MockJobBackend::new();
        backend.expect_name().return_const("mock");
        backend
            .expect_submit()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|job, ns| Ok(SubmissionHandle::new(job, ns)));
        backend
            .expect_submit()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|job, _| {
                Err(TrainError::submission(
                    &job.name,
                    lattice_common::Error::control_plane("create_job", "already exists"),
                ))
            });
        backend
            .expect_cancel()
            .times(1)
            .in_sequence(&mut seq)
            .withf(|handle| handle.name() == "mnist-t1-0")
            .return_const(());
        backend
            .expect_cleanup()
            .times(1)
            .in_sequence(&mut seq)
            .withf(|handle| handle.name() == "mnist-t1-0")
            .return_const(());
        backend.expect_supervise().times(0);

        let topology = CoordinatorTopology::new(1, 0)
            .with_instances(2)
            .with_script_path(&script);
        let trainer = Trainer::new(
            settings(),
            Box::new(BasicStrategy::new(Box::new(topology))),
            Box::new(builder),
            Box::new(backend),
        );

        let err = trainer.deploy().await.unwrap_err();
        assert!(matches!(err, TrainError::Submission { .. }));
    }

    #[test]
    fn report_outcome_aggregates_instances() {
        let report = DeployReport {
            image: "i".to_string(),
            jobs: vec![
                ("a".to_string(), JobOutcome::Completed),
                ("b".to_string(), JobOutcome::Failed),
            ],
        };
        assert_eq!(report.outcome(), JobOutcome::Failed);
    }
}
