//! Job description: the compiled, deployable shape of one distributed training run
//!
//! A `JobDescription` is produced by a topology policy, decorated by a training
//! strategy, and then handed unchanged to a backend for submission. Nothing
//! mutates it after [`JobDescription::validate`] succeeds.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::Error;

/// Role a replica group plays in the distributed job
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RoleKind {
    /// Primary/coordinator replica (chief)
    Master,
    /// Worker replicas
    Worker,
    /// Parameter-holder replicas
    Ps,
}

impl RoleKind {
    /// Lowercase name used in pod names and environment values
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Master => "master",
            Self::Worker => "worker",
            Self::Ps => "ps",
        }
    }
}

impl fmt::Display for RoleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where a volume's content comes from
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum VolumeSource {
    /// A ConfigMap materialized from one of the job's auxiliary artifacts
    ConfigMap {
        /// Name of the ConfigMap (equals the artifact name)
        name: String,
    },
    /// An existing PersistentVolumeClaim
    PersistentVolumeClaim {
        /// Claim name
        claim_name: String,
    },
}

/// A pod-level volume
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Volume {
    /// Volume name, referenced by mounts
    pub name: String,
    /// Content source
    pub source: VolumeSource,
}

impl Volume {
    /// Volume backed by a ConfigMap artifact
    pub fn config_map(name: impl Into<String>, config_map: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            source: VolumeSource::ConfigMap {
                name: config_map.into(),
            },
        }
    }

    /// Volume backed by a PersistentVolumeClaim
    pub fn pvc(name: impl Into<String>, claim_name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            source: VolumeSource::PersistentVolumeClaim {
                claim_name: claim_name.into(),
            },
        }
    }
}

/// A container-level mount of a pod volume
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VolumeMount {
    /// Name of the volume being mounted
    pub name: String,
    /// Path inside the container
    pub mount_path: String,
}

impl VolumeMount {
    /// Create a mount
    pub fn new(name: impl Into<String>, mount_path: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            mount_path: mount_path.into(),
        }
    }
}

/// Container run by every replica of a role
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Container {
    /// Image reference
    pub image: String,
    /// Environment variables
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
    /// Volume mounts
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub volume_mounts: Vec<VolumeMount>,
}

impl Container {
    /// Container running `image` with no env or mounts
    pub fn new(image: impl Into<String>) -> Self {
        Self {
            image: image.into(),
            ..Default::default()
        }
    }
}

/// A counted set of identical replicas playing one role
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoleGroup {
    /// Role played by every replica
    pub kind: RoleKind,
    /// Replica count
    pub replicas: u32,
    /// Main container
    pub container: Container,
    /// Pod volumes
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub volumes: Vec<Volume>,
}

impl RoleGroup {
    /// Role group with no volumes
    pub fn new(kind: RoleKind, replicas: u32, image: impl Into<String>) -> Self {
        Self {
            kind,
            replicas,
            container: Container::new(image),
            volumes: Vec::new(),
        }
    }
}

/// Named text blobs materialized as one ConfigMap before submission
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigArtifact {
    /// ConfigMap name
    pub name: String,
    /// File name -> content
    pub data: BTreeMap<String, String>,
}

/// Auxiliary container attached to one role (e.g., an observability UI)
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Sidecar {
    /// Container name
    pub name: String,
    /// Image reference
    pub image: String,
    /// Container arguments
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
    /// Exposed container port
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    /// Role whose pods receive the sidecar
    pub attach_to: RoleKind,
    /// Volume mounts (volumes must exist on the attached role)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub volume_mounts: Vec<VolumeMount>,
}

/// The in-memory representation of one deployable distributed job
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobDescription {
    /// Job name, unique per submission
    pub name: String,
    /// Disambiguating tag (also the image tag)
    pub tag: String,
    /// Replica groups in submission order
    pub roles: Vec<RoleGroup>,
    /// Config artifacts, created before the job is submitted
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub artifacts: Vec<ConfigArtifact>,
    /// Auxiliary containers
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sidecars: Vec<Sidecar>,
}

impl JobDescription {
    /// Empty job with the given identity
    pub fn new(name: impl Into<String>, tag: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            tag: tag.into(),
            roles: Vec::new(),
            artifacts: Vec::new(),
            sidecars: Vec::new(),
        }
    }

    /// Look up a role group by kind
    pub fn role(&self, kind: RoleKind) -> Option<&RoleGroup> {
        self.roles.iter().find(|r| r.kind == kind)
    }

    /// Mutable lookup of a role group by kind
    pub fn role_mut(&mut self, kind: RoleKind) -> Option<&mut RoleGroup> {
        self.roles.iter_mut().find(|r| r.kind == kind)
    }

    /// Total replicas across all roles
    pub fn total_replicas(&self) -> u32 {
        self.roles.iter().map(|r| r.replicas).sum()
    }

    /// Names of all config artifacts
    pub fn artifact_names(&self) -> Vec<String> {
        self.artifacts.iter().map(|a| a.name.clone()).collect()
    }

    /// Check the structural invariants of a compiled job.
    ///
    /// - at least one role, each role kind at most once
    /// - every mount (container or sidecar) references a volume on its role
    /// - every ConfigMap volume references an artifact of this job
    /// - every sidecar attaches to a role that exists
    pub fn validate(&self) -> Result<(), Error> {
        if self.name.is_empty() {
            return Err(Error::validation_for_field(
                "<unnamed>",
                "name",
                "job name must not be empty",
            ));
        }
        if self.roles.is_empty() {
            return Err(Error::validation_for_field(
                &self.name,
                "roles",
                "job has no roles",
            ));
        }

        let artifacts: BTreeSet<&str> = self.artifacts.iter().map(|a| a.name.as_str()).collect();
        let mut kinds = BTreeSet::new();

        for (i, role) in self.roles.iter().enumerate() {
            if !kinds.insert(role.kind) {
                return Err(Error::validation_for_field(
                    &self.name,
                    format!("roles[{}].kind", i),
                    format!("role {} appears more than once", role.kind),
                ));
            }

            let volumes: BTreeSet<&str> = role.volumes.iter().map(|v| v.name.as_str()).collect();
            for mount in &role.container.volume_mounts {
                if !volumes.contains(mount.name.as_str()) {
                    return Err(Error::validation_for_field(
                        &self.name,
                        format!("roles[{}].container.volumeMounts", i),
                        format!("mount '{}' has no matching volume", mount.name),
                    ));
                }
            }

            for volume in &role.volumes {
                if let VolumeSource::ConfigMap { name } = &volume.source {
                    if !artifacts.contains(name.as_str()) {
                        return Err(Error::validation_for_field(
                            &self.name,
                            format!("roles[{}].volumes", i),
                            format!(
                                "volume '{}' references config artifact '{}' which the job does not define",
                                volume.name, name
                            ),
                        ));
                    }
                }
            }
        }

        for sidecar in &self.sidecars {
            let role = self.role(sidecar.attach_to).ok_or_else(|| {
                Error::validation_for_field(
                    &self.name,
                    "sidecars",
                    format!(
                        "sidecar '{}' attaches to missing role {}",
                        sidecar.name, sidecar.attach_to
                    ),
                )
            })?;
            for mount in &sidecar.volume_mounts {
                if !role.volumes.iter().any(|v| v.name == mount.name) {
                    return Err(Error::validation_for_field(
                        &self.name,
                        "sidecars",
                        format!(
                            "sidecar '{}' mounts '{}' which role {} does not define",
                            sidecar.name, mount.name, sidecar.attach_to
                        ),
                    ));
                }
            }
        }

        Ok(())
    }
}
