//! Kubeflow TFJob serialization types
//!
//! Typed representation of `kubeflow.org/v1alpha2` TFJob resources.
//! Pod templates are carried as pre-serialized JSON.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// API group of the TFJob custom resource
pub const TFJOB_GROUP: &str = "kubeflow.org";
/// API version of the TFJob custom resource
pub const TFJOB_VERSION: &str = "v1alpha2";
/// Kind of the TFJob custom resource
pub const TFJOB_KIND: &str = "TFJob";
/// Plural resource name
pub const TFJOB_PLURAL: &str = "tfjobs";

/// Kubeflow TFJob resource (`kubeflow.org/v1alpha2` Kind: TFJob)
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TFJob {
    pub api_version: String,
    pub kind: String,
    pub metadata: TFJobMetadata,
    pub spec: TFJobSpec,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TFJobMetadata {
    pub name: String,
    pub namespace: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
}

/// TFJob spec
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TFJobSpec {
    /// Replica type ("Master", "Worker", "PS") -> replica spec
    pub tf_replica_specs: BTreeMap<String, ReplicaSpec>,
}

/// One replica type within a TFJob
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ReplicaSpec {
    pub replicas: u32,
    pub restart_policy: String,
    /// Pod template, passed through as JSON
    pub template: serde_json::Value,
}
