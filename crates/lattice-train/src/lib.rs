//! lattice-train: deploy training code as a distributed Kubeflow job
//!
//! The same program runs on both sides. On a workstation it compiles a job
//! topology, builds one image and submits and supervises every job instance.
//! Inside a worker pod it runs the training command instead.

pub mod backend;
pub mod builder;
pub mod compiler;
pub mod config;
pub mod context;
pub mod control_plane;
pub mod convert;
pub mod dispatcher;
pub mod error;
pub mod launch;
pub mod lifecycle;
pub mod strategy;
pub mod topology;
pub mod trainer;

pub use backend::{JobBackend, KubeflowBackend, NativeBackend, TensorboardOptions};
pub use config::{resolve_kubeconfig, TrainConfig};
pub use context::ExecutionContext;
pub use control_plane::{ControlPlane, KubeControlPlane};
pub use dispatcher::{DispatchOutcome, ExecutionDispatcher, Trainable};
pub use error::{Result, TrainError};
pub use launch::{CommandTraining, ConfiguredDeploy};
pub use lifecycle::{JobOutcome, LifecycleManager, LifecyclePhase, SubmissionHandle};
pub use strategy::{BasicStrategy, TrainingStrategy};
pub use topology::{CoordinatorTopology, JobIdentity, TopologyPolicy, Unmanaged};
pub use trainer::{Deploy, DeployReport, DeploySettings, Trainer};

use std::path::PathBuf;

use clap::Parser;
use tokio_util::sync::CancellationToken;

/// Deploy a training command as a Kubeflow job, or run it inside the job
#[derive(Parser, Debug)]
#[command(name = "lattice-train")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Deploy configuration
    #[arg(short = 'f', long, default_value = "train.yaml")]
    pub config: PathBuf,

    /// Path to kubeconfig file
    #[arg(long)]
    pub kubeconfig: Option<PathBuf>,

    /// Do not follow the primary container's logs
    #[arg(long)]
    pub no_logs: bool,

    /// Training command run inside the worker pods
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    pub command: Vec<String>,
}

impl Cli {
    /// Dispatch once: deploy from outside the cluster, train inside it
    pub async fn run(self, shutdown: CancellationToken) -> Result<DispatchOutcome> {
        let config = TrainConfig::load(&self.config)?;
        let context = ExecutionContext::current(&config.namespace);

        let deployer = ConfiguredDeploy::new(config, context.namespace())
            .with_kubeconfig(resolve_kubeconfig(self.kubeconfig.as_deref()))
            .with_stream_logs(!self.no_logs)
            .with_shutdown(shutdown);

        let mut dispatcher =
            ExecutionDispatcher::new(CommandTraining::new(self.command), deployer, context);
        dispatcher.train().await
    }
}
