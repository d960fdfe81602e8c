//! Common types for lattice-train: job model, errors, retry and kube utilities

#![deny(missing_docs)]

pub mod error;
pub mod job;
pub mod kube_utils;
pub mod retry;
pub mod telemetry;

pub use error::Error;
pub use job::{
    ConfigArtifact, Container, JobDescription, RoleGroup, RoleKind, Sidecar, Volume,
    VolumeMount, VolumeSource,
};
pub use retry::{retry_fixed, Exhausted, RetryBudget};

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Namespace used when the process is not running inside a cluster
pub const DEFAULT_NAMESPACE: &str = "default";

/// Standard Kubernetes label for the managing tool
pub const LABEL_MANAGED_BY: &str = "app.kubernetes.io/managed-by";

/// Value for managed-by label
pub const LABEL_MANAGED_BY_LATTICE: &str = "lattice-train";

/// Standard Kubernetes label for the resource name
pub const LABEL_NAME: &str = "app.kubernetes.io/name";

/// Environment variable marking a process as the in-cluster training side
pub const RUNTIME_ENV: &str = "LATTICE_TRAIN_RUNTIME";

/// Environment variable carrying the role a worker-side process plays
pub const ROLE_ENV: &str = "LATTICE_TRAIN_ROLE";

/// Environment variable carrying the job name into every container
pub const JOB_NAME_ENV: &str = "LATTICE_TRAIN_JOB";
