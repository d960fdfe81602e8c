//! Kubeflow TFJob compiler for lattice-train jobs
//!
//! Compiles `JobDescription`s into TFJob resources and ConfigMaps, and
//! interprets TFJob status conditions. Pure compilation crate, no client code.

mod compiler;
mod status;
mod types;

pub use compiler::{
    compile_config_maps, compile_tfjob, pod_name, replica_type, TRAINING_CONTAINER,
};
pub use status::{ConditionState, JobCondition, TFJobStatus};
pub use types::{
    ReplicaSpec, TFJob, TFJobMetadata, TFJobSpec, TFJOB_GROUP, TFJOB_KIND, TFJOB_PLURAL,
    TFJOB_VERSION,
};
