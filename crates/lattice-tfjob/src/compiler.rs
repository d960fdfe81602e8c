//! TFJob compilation from job descriptions
//!
//! Maps a `JobDescription` to a Kubeflow TFJob and the ConfigMaps its volumes
//! reference. Pure compilation: the caller validates the description first and
//! submits the output.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::ConfigMap;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use lattice_common::{
    JobDescription, RoleGroup, RoleKind, Sidecar, VolumeSource, LABEL_MANAGED_BY,
    LABEL_MANAGED_BY_LATTICE, LABEL_NAME,
};

use crate::types::{
    ReplicaSpec, TFJob, TFJobMetadata, TFJobSpec, TFJOB_GROUP, TFJOB_KIND, TFJOB_VERSION,
};

/// Name of the main training container in every replica pod
pub const TRAINING_CONTAINER: &str = "tensorflow";

/// TFJob replica type key for a role
pub fn replica_type(kind: RoleKind) -> &'static str {
    match kind {
        RoleKind::Master => "Master",
        RoleKind::Worker => "Worker",
        RoleKind::Ps => "PS",
    }
}

/// Name of the pod the TFJob operator creates for one replica
pub fn pod_name(job_name: &str, kind: RoleKind, index: u32) -> String {
    format!("{}-{}-{}", job_name, kind.as_str(), index)
}

fn labels(job_name: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        (
            LABEL_MANAGED_BY.to_string(),
            LABEL_MANAGED_BY_LATTICE.to_string(),
        ),
        (LABEL_NAME.to_string(), job_name.to_string()),
    ])
}

/// Compile a job description into a TFJob.
///
/// Roles with zero replicas are absent from the job and are skipped.
pub fn compile_tfjob(job: &JobDescription, namespace: &str) -> TFJob {
    let tf_replica_specs = job
        .roles
        .iter()
        .filter(|role| role.replicas > 0)
        .map(|role| {
            let sidecars: Vec<&Sidecar> = job
                .sidecars
                .iter()
                .filter(|s| s.attach_to == role.kind)
                .collect();
            (
                replica_type(role.kind).to_string(),
                ReplicaSpec {
                    replicas: role.replicas,
                    restart_policy: "Never".to_string(),
                    template: pod_template(&job.name, role, &sidecars),
                },
            )
        })
        .collect();

    TFJob {
        api_version: format!("{}/{}", TFJOB_GROUP, TFJOB_VERSION),
        kind: TFJOB_KIND.to_string(),
        metadata: TFJobMetadata {
            name: job.name.clone(),
            namespace: namespace.to_string(),
            labels: labels(&job.name),
        },
        spec: TFJobSpec { tf_replica_specs },
    }
}

/// Compile the job's config artifacts into ConfigMaps
pub fn compile_config_maps(job: &JobDescription, namespace: &str) -> Vec<ConfigMap> {
    job.artifacts
        .iter()
        .map(|artifact| ConfigMap {
            metadata: ObjectMeta {
                name: Some(artifact.name.clone()),
                namespace: Some(namespace.to_string()),
                labels: Some(labels(&job.name)),
                ..Default::default()
            },
            data: Some(artifact.data.clone()),
            ..Default::default()
        })
        .collect()
}

fn env_json(env: &BTreeMap<String, String>) -> serde_json::Value {
    env.iter()
        .map(|(name, value)| serde_json::json!({ "name": name, "value": value }))
        .collect()
}

fn pod_template(job_name: &str, role: &RoleGroup, sidecars: &[&Sidecar]) -> serde_json::Value {
    let mut main = serde_json::json!({
        "name": TRAINING_CONTAINER,
        "image": role.container.image,
    });
    if !role.container.env.is_empty() {
        main["env"] = env_json(&role.container.env);
    }
    if !role.container.volume_mounts.is_empty() {
        main["volumeMounts"] = serde_json::to_value(&role.container.volume_mounts)
            .unwrap_or_default();
    }

    let mut containers = vec![main];
    for sidecar in sidecars {
        let mut c = serde_json::json!({
            "name": sidecar.name,
            "image": sidecar.image,
        });
        if !sidecar.args.is_empty() {
            c["args"] = serde_json::json!(sidecar.args);
        }
        if let Some(port) = sidecar.port {
            c["ports"] = serde_json::json!([{ "containerPort": port }]);
        }
        if !sidecar.volume_mounts.is_empty() {
            c["volumeMounts"] = serde_json::to_value(&sidecar.volume_mounts).unwrap_or_default();
        }
        containers.push(c);
    }

    let mut spec = serde_json::json!({ "containers": containers });
    if !role.volumes.is_empty() {
        let volumes: Vec<serde_json::Value> = role
            .volumes
            .iter()
            .map(|v| match &v.source {
                VolumeSource::ConfigMap { name } => serde_json::json!({
                    "name": v.name,
                    "configMap": { "name": name }
                }),
                VolumeSource::PersistentVolumeClaim { claim_name } => serde_json::json!({
                    "name": v.name,
                    "persistentVolumeClaim": { "claimName": claim_name }
                }),
            })
            .collect();
        spec["volumes"] = serde_json::Value::Array(volumes);
    }

    let mut labels = labels(job_name);
    labels.insert("lattice-train/role".to_string(), role.kind.to_string());

    serde_json::json!({
        "metadata": { "labels": labels },
        "spec": spec
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use lattice_common::{ConfigArtifact, Volume, VolumeMount};

    fn distributed_job() -> JobDescription {
        let mut job = JobDescription::new("mnist-abc-0", "abc");
        let mut master = RoleGroup::new(RoleKind::Master, 1, "img:tag");
        master.volumes.push(Volume::config_map("code", "mnist-abc-0"));
        master
            .container
            .volume_mounts
            .push(VolumeMount::new("code", "/code"));
        master
            .container
            .env
            .insert("LATTICE_TRAIN_ROLE".to_string(), "master".to_string());
        job.roles.push(master);
        job.roles.push(RoleGroup::new(RoleKind::Worker, 3, "img:tag"));
        job.roles.push(RoleGroup::new(RoleKind::Ps, 2, "img:tag"));
        job.artifacts.push(ConfigArtifact {
            name: "mnist-abc-0".to_string(),
            data: BTreeMap::from([("code.py".to_string(), "train()".to_string())]),
        });
        job
    }

    #[test]
    fn compiles_replica_specs_per_role() {
        let tfjob = compile_tfjob(&distributed_job(), "ml");

        assert_eq!(tfjob.api_version, "kubeflow.org/v1alpha2");
        assert_eq!(tfjob.kind, "TFJob");
        assert_eq!(tfjob.metadata.name, "mnist-abc-0");
        assert_eq!(tfjob.metadata.namespace, "ml");

        let specs = &tfjob.spec.tf_replica_specs;
        assert_eq!(specs.len(), 3);
        assert_eq!(specs["Master"].replicas, 1);
        assert_eq!(specs["Worker"].replicas, 3);
        assert_eq!(specs["PS"].replicas, 2);
        assert_eq!(specs["Worker"].restart_policy, "Never");
    }

    #[test]
    fn code_volume_only_on_master() {
        let tfjob = compile_tfjob(&distributed_job(), "ml");
        let master = &tfjob.spec.tf_replica_specs["Master"].template;
        assert_eq!(master["spec"]["volumes"][0]["name"], "code");
        assert_eq!(
            master["spec"]["volumes"][0]["configMap"]["name"],
            "mnist-abc-0"
        );
        assert_eq!(
            master["spec"]["containers"][0]["volumeMounts"][0]["mountPath"],
            "/code"
        );
        assert_eq!(master["spec"]["containers"][0]["env"][0]["value"], "master");

        let worker = &tfjob.spec.tf_replica_specs["Worker"].template;
        assert!(worker["spec"].get("volumes").is_none());
        assert!(worker["spec"]["containers"][0].get("volumeMounts").is_none());
    }

    #[test]
    fn zero_replica_roles_are_absent() {
        let mut job = distributed_job();
        job.roles[2].replicas = 0;
        let tfjob = compile_tfjob(&job, "ml");
        assert!(!tfjob.spec.tf_replica_specs.contains_key("PS"));
    }

    #[test]
    fn sidecar_lands_next_to_training_container() {
        let mut job = distributed_job();
        job.roles[0].volumes.push(Volume::pvc("tensorboard", "tb-logs"));
        job.sidecars.push(Sidecar {
            name: "tensorboard".to_string(),
            image: "tensorflow/tensorflow:latest".to_string(),
            args: vec!["tensorboard".to_string(), "--logdir=/logs".to_string()],
            port: Some(6006),
            attach_to: RoleKind::Master,
            volume_mounts: vec![VolumeMount::new("tensorboard", "/logs")],
        });

        let tfjob = compile_tfjob(&job, "ml");
        let containers = &tfjob.spec.tf_replica_specs["Master"].template["spec"]["containers"];
        assert_eq!(containers.as_array().unwrap().len(), 2);
        assert_eq!(containers[0]["name"], TRAINING_CONTAINER);
        assert_eq!(containers[1]["name"], "tensorboard");
        assert_eq!(containers[1]["ports"][0]["containerPort"], 6006);
        let volumes = &tfjob.spec.tf_replica_specs["Master"].template["spec"]["volumes"];
        assert_eq!(volumes[1]["persistentVolumeClaim"]["claimName"], "tb-logs");

        let worker = &tfjob.spec.tf_replica_specs["Worker"].template["spec"]["containers"];
        assert_eq!(worker.as_array().unwrap().len(), 1);
    }

    #[test]
    fn config_maps_match_artifacts() {
        let cms = compile_config_maps(&distributed_job(), "ml");
        assert_eq!(cms.len(), 1);
        assert_eq!(cms[0].metadata.name.as_deref(), Some("mnist-abc-0"));
        assert_eq!(cms[0].metadata.namespace.as_deref(), Some("ml"));
        assert_eq!(
            cms[0].data.as_ref().unwrap().get("code.py").map(String::as_str),
            Some("train()")
        );
    }

    #[test]
    fn primary_pod_naming() {
        assert_eq!(pod_name("mnist-abc-0", RoleKind::Master, 0), "mnist-abc-0-master-0");
    }

    #[test]
    fn labels_mark_managed_resources() {
        let tfjob = compile_tfjob(&distributed_job(), "ml");
        assert_eq!(
            tfjob.metadata.labels.get(LABEL_MANAGED_BY).map(String::as_str),
            Some("lattice-train")
        );
    }
}
