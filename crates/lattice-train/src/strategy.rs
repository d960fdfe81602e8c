//! Training strategy: decorates topology output for the worker-side entrypoint
//!
//! Pure transformation. Topology errors propagate unchanged.

use std::collections::BTreeMap;

use lattice_common::{JobDescription, RoleKind, Sidecar, Volume, VolumeMount};
use lattice_common::{JOB_NAME_ENV, ROLE_ENV, RUNTIME_ENV};
use tracing::debug;

use crate::error::{Result, TrainError};
use crate::topology::{JobIdentity, TopologyPolicy};

/// Primary role the observability sidecar attaches to
pub const SIDECAR_ROLE: RoleKind = RoleKind::Master;

/// A sidecar contributed by a backend, plus what the primary role needs for it
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SidecarAttachment {
    /// The auxiliary container
    pub sidecar: Sidecar,
    /// Pod volumes the sidecar needs
    pub volumes: Vec<Volume>,
    /// Mounts added to the primary training container
    pub mounts: Vec<VolumeMount>,
}

/// Final jobs plus the environment the image build is parameterized with
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CompiledTraining {
    /// One entry per job instance, validated
    pub jobs: Vec<JobDescription>,
    /// Environment baked into the image
    pub build_env: BTreeMap<String, String>,
}

/// Turns a topology into deployable jobs
pub trait TrainingStrategy: Send + Sync {
    /// Compile the final job descriptions
    fn compile(
        &self,
        identity: &JobIdentity,
        image: &str,
        sidecar: Option<&SidecarAttachment>,
    ) -> Result<CompiledTraining>;
}

/// Marks every container as the worker side and tells it its role
pub struct BasicStrategy {
    topology: Box<dyn TopologyPolicy>,
}

impl BasicStrategy {
    /// Wrap a topology policy
    pub fn new(topology: Box<dyn TopologyPolicy>) -> Self {
        Self { topology }
    }

    /// The wrapped topology
    pub fn topology(&self) -> &dyn TopologyPolicy {
        self.topology.as_ref()
    }
}

impl TrainingStrategy for BasicStrategy {
    fn compile(
        &self,
        identity: &JobIdentity,
        image: &str,
        sidecar: Option<&SidecarAttachment>,
    ) -> Result<CompiledTraining> {
        let mut jobs = self.topology.compile(identity, image)?;

        for job in &mut jobs {
            let job_name = job.name.clone();
            for role in &mut job.roles {
                let env = &mut role.container.env;
                env.insert(RUNTIME_ENV.to_string(), "1".to_string());
                env.insert(ROLE_ENV.to_string(), role.kind.as_str().to_string());
                env.insert(JOB_NAME_ENV.to_string(), job_name.clone());
            }

            if let Some(attachment) = sidecar {
                attach(job, attachment)?;
            }

            job.validate()
                .map_err(|e| TrainError::configuration(&job.name, e.to_string()))?;
            debug!(
                job = %job.name,
                topology = self.topology.name(),
                replicas = job.total_replicas(),
                "compiled job description"
            );
        }

        Ok(CompiledTraining {
            jobs,
            build_env: BTreeMap::from([(RUNTIME_ENV.to_string(), "1".to_string())]),
        })
    }
}

fn attach(job: &mut JobDescription, attachment: &SidecarAttachment) -> Result<()> {
    let kind = attachment.sidecar.attach_to;
    let name = job.name.clone();
    let role = job.role_mut(kind).ok_or_else(|| {
        TrainError::configuration(
            &name,
            format!(
                "sidecar '{}' needs role {} which the topology does not produce",
                attachment.sidecar.name, kind
            ),
        )
    })?;

    for volume in &attachment.volumes {
        if !role.volumes.iter().any(|v| v.name == volume.name) {
            role.volumes.push(volume.clone());
        }
    }
    role.container
        .volume_mounts
        .extend(attachment.mounts.iter().cloned());
    job.sidecars.push(attachment.sidecar.clone());
    Ok(())
}
