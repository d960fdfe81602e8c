//! Topology policies: the shape of a distributed job
//!
//! A topology answers "which roles, how many replicas of each, and which
//! volumes does the shape itself need". It never decides entrypoints or
//! environment; that is the training strategy's job.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use lattice_common::{
    ConfigArtifact, JobDescription, RoleGroup, RoleKind, Volume, VolumeMount,
};

use crate::error::{Result, TrainError};

/// Volume name the coordinator topology mounts the training code under
pub const CODE_VOLUME: &str = "code";
/// Mount path of the code volume in the primary container
pub const CODE_MOUNT_PATH: &str = "/code";
/// File name of the training script inside the code ConfigMap
pub const CODE_FILE: &str = "code.py";
/// Where notebook conversion writes the training script by default
pub const DEFAULT_SCRIPT_PATH: &str = "/tmp/code.py";

/// Base identity of one deploy: every compiled instance derives its name from it
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct JobIdentity {
    /// Base name (the image name)
    pub name: String,
    /// Unique tag for this deploy
    pub tag: String,
}

impl JobIdentity {
    /// Create an identity
    pub fn new(name: impl Into<String>, tag: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            tag: tag.into(),
        }
    }

    /// `{name}-{tag}`, unique per deploy
    pub fn full_name(&self) -> String {
        format!("{}-{}", self.name, self.tag)
    }
}

/// Produces the role groups and volumes of one or more job instances
pub trait TopologyPolicy: Send + Sync {
    /// Short name for logs
    fn name(&self) -> &'static str;

    /// Compile the job instances for `image`.
    ///
    /// Fails with [`TrainError::Configuration`] on negative replica counts or
    /// when a required artifact cannot be read.
    fn compile(&self, identity: &JobIdentity, image: &str) -> Result<Vec<JobDescription>>;
}

fn replica_count(job: &str, role: RoleKind, count: i32) -> Result<u32> {
    u32::try_from(count).map_err(|_| {
        TrainError::configuration(
            job,
            format!("replica count for {} must not be negative (got {})", role, count),
        )
    })
}

/// Single-role job: N replicas of the primary role, nothing else
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Unmanaged {
    replicas: i32,
}

impl Unmanaged {
    /// Single-role topology with `replicas` primaries
    pub fn new(replicas: i32) -> Self {
        Self { replicas }
    }
}

impl Default for Unmanaged {
    fn default() -> Self {
        Self::new(1)
    }
}

impl TopologyPolicy for Unmanaged {
    fn name(&self) -> &'static str {
        "unmanaged"
    }

    fn compile(&self, identity: &JobIdentity, image: &str) -> Result<Vec<JobDescription>> {
        let name = identity.full_name();
        let replicas = replica_count(&name, RoleKind::Master, self.replicas)?;
        if replicas == 0 {
            return Err(TrainError::configuration(
                &name,
                "single-role topology needs at least one replica",
            ));
        }
        let mut job = JobDescription::new(name, &identity.tag);
        job.roles.push(RoleGroup::new(RoleKind::Master, replicas, image));
        Ok(vec![job])
    }
}

/// Coordinator / worker / parameter-holder topology.
///
/// The training script is shipped as a ConfigMap named after each instance and
/// mounted at `/code` in the primary role only. `instances > 1` fans out into
/// independent jobs named `{identity}-{index}` sharing this shape.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CoordinatorTopology {
    workers: i32,
    parameter_servers: i32,
    instances: u32,
    script_path: PathBuf,
}

impl CoordinatorTopology {
    /// One instance with the given worker and parameter-holder counts
    pub fn new(workers: i32, parameter_servers: i32) -> Self {
        Self {
            workers,
            parameter_servers,
            instances: 1,
            script_path: PathBuf::from(DEFAULT_SCRIPT_PATH),
        }
    }

    /// Fan out into `instances` independent jobs
    pub fn with_instances(mut self, instances: u32) -> Self {
        self.instances = instances;
        self
    }

    /// Read the training script from `path`
    pub fn with_script_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.script_path = path.into();
        self
    }

    /// Path the training script is read from
    pub fn script_path(&self) -> &Path {
        &self.script_path
    }
}

impl TopologyPolicy for CoordinatorTopology {
    fn name(&self) -> &'static str {
        "coordinator"
    }

    fn compile(&self, identity: &JobIdentity, image: &str) -> Result<Vec<JobDescription>> {
        let base = identity.full_name();
        let workers = replica_count(&base, RoleKind::Worker, self.workers)?;
        let parameter_servers = replica_count(&base, RoleKind::Ps, self.parameter_servers)?;
        if self.instances == 0 {
            return Err(TrainError::configuration(
                &base,
                "instance count must be at least 1",
            ));
        }

        let code = std::fs::read_to_string(&self.script_path).map_err(|e| {
            TrainError::configuration(
                &base,
                format!(
                    "cannot read training script {}: {}",
                    self.script_path.display(),
                    e
                ),
            )
        })?;

        let jobs = (0..self.instances)
            .map(|index| {
                let name = format!("{}-{}", base, index);

                let mut master = RoleGroup::new(RoleKind::Master, 1, image);
                master.volumes.push(Volume::config_map(CODE_VOLUME, &name));
                master
                    .container
                    .volume_mounts
                    .push(VolumeMount::new(CODE_VOLUME, CODE_MOUNT_PATH));

                let mut job = JobDescription::new(&name, &identity.tag);
                job.artifacts.push(ConfigArtifact {
                    name: name.clone(),
                    data: BTreeMap::from([(CODE_FILE.to_string(), code.clone())]),
                });
                job.roles.push(master);
                if workers > 0 {
                    job.roles.push(RoleGroup::new(RoleKind::Worker, workers, image));
                }
                if parameter_servers > 0 {
                    job.roles
                        .push(RoleGroup::new(RoleKind::Ps, parameter_servers, image));
                }
                job
            })
            .collect();

        Ok(jobs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lattice_common::VolumeSource;
    use std::io::Write;

    fn script() -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "import tensorflow as tf\n").unwrap();
        file
    }

    fn identity() -> JobIdentity {
        JobIdentity::new("mnist", "abc123")
    }

    #[test]
    fn coordinator_scenario_one_master_three_workers_two_ps() {
        let file = script();
        let topology = CoordinatorTopology::new(3, 2).with_script_path(file.path());

        let jobs = topology.compile(&identity(), "img:tag").unwrap();
        assert_eq!(jobs.len(), 1);
        let job = &jobs[0];

        assert_eq!(job.roles.len(), 3);
        let counts: Vec<(RoleKind, u32)> =
            job.roles.iter().map(|r| (r.kind, r.replicas)).collect();
        assert_eq!(
            counts,
            vec![(RoleKind::Master, 1), (RoleKind::Worker, 3), (RoleKind::Ps, 2)]
        );
        assert!(job.roles.iter().all(|r| r.container.image == "img:tag"));

        let master = job.role(RoleKind::Master).unwrap();
        assert_eq!(master.container.volume_mounts[0].name, CODE_VOLUME);
        assert_eq!(master.container.volume_mounts[0].mount_path, "/code");
        assert_eq!(
            master.volumes[0].source,
            VolumeSource::ConfigMap {
                name: job.name.clone()
            }
        );
        assert!(job.role(RoleKind::Worker).unwrap().volumes.is_empty());
        assert!(job.validate().is_ok());
    }

    #[test]
    fn code_artifact_carries_script() {
        let file = script();
        let jobs = CoordinatorTopology::new(1, 1)
            .with_script_path(file.path())
            .compile(&identity(), "img:tag")
            .unwrap();
        let artifact = &jobs[0].artifacts[0];
        assert_eq!(artifact.name, jobs[0].name);
        assert_eq!(artifact.data[CODE_FILE], "import tensorflow as tf\n");
    }

    #[test]
    fn fan_out_suffixes_instance_index() {
        let file = script();
        let jobs = CoordinatorTopology::new(2, 1)
            .with_instances(3)
            .with_script_path(file.path())
            .compile(&identity(), "img:tag")
            .unwrap();
        let names: Vec<&str> = jobs.iter().map(|j| j.name.as_str()).collect();
        assert_eq!(
            names,
            vec!["mnist-abc123-0", "mnist-abc123-1", "mnist-abc123-2"]
        );
        for job in &jobs {
            assert_eq!(job.artifacts[0].name, job.name);
        }
    }

    #[test]
    fn negative_worker_count_is_configuration_error() {
        let file = script();
        let result = CoordinatorTopology::new(-1, 2)
            .with_script_path(file.path())
            .compile(&identity(), "img:tag");
        assert!(matches!(result, Err(TrainError::Configuration { .. })));
    }

    #[test]
    fn negative_parameter_server_count_is_configuration_error() {
        let file = script();
        let result = CoordinatorTopology::new(1, -5)
            .with_script_path(file.path())
            .compile(&identity(), "img:tag");
        assert!(matches!(result, Err(TrainError::Configuration { .. })));
    }

    #[test]
    fn negative_single_role_count_is_configuration_error() {
        let result = Unmanaged::new(-2).compile(&identity(), "img:tag");
        assert!(matches!(result, Err(TrainError::Configuration { .. })));
    }

    #[test]
    fn missing_script_is_configuration_error() {
        let result = CoordinatorTopology::new(1, 1)
            .with_script_path("/nonexistent/code.py")
            .compile(&identity(), "img:tag");
        match result {
            Err(TrainError::Configuration { message, .. }) => {
                assert!(message.contains("/nonexistent/code.py"))
            }
            other => panic!("expected configuration error, got {:?}", other),
        }
    }

    #[test]
    fn zero_count_roles_are_absent() {
        let file = script();
        let jobs = CoordinatorTopology::new(4, 0)
            .with_script_path(file.path())
            .compile(&identity(), "img:tag")
            .unwrap();
        assert_eq!(jobs[0].roles.len(), 2);
        assert!(jobs[0].role(RoleKind::Ps).is_none());
    }

    #[test]
    fn unmanaged_is_single_role() {
        let jobs = Unmanaged::new(2).compile(&identity(), "img:tag").unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].name, "mnist-abc123");
        assert_eq!(jobs[0].roles.len(), 1);
        assert_eq!(jobs[0].roles[0].replicas, 2);
        assert!(jobs[0].artifacts.is_empty());
    }
}
