//! Control-plane seam
//!
//! Everything the lifecycle manager needs from the cluster API sits behind the
//! [`ControlPlane`] trait so the state machine can be tested against mocks.
//! [`KubeControlPlane`] is the kube-rs implementation.

use std::time::Duration;

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::{AsyncReadExt, StreamExt};
use k8s_openapi::api::core::v1::{ConfigMap, Event, Pod};
use kube::api::{Api, DeleteParams, DynamicObject, LogParams, PostParams};
use kube::discovery::ApiResource;
use kube::runtime::watcher;
use kube::Client;
#[cfg(test)]
use mockall::automock;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use lattice_common::{Error, Result};
use lattice_tfjob::{TFJob, TFJobStatus, TFJOB_GROUP, TFJOB_KIND, TFJOB_PLURAL, TFJOB_VERSION};

/// Event type of a normal (non-warning) event
pub const EVENT_NORMAL: &str = "Normal";
/// Event reason the kubelet emits once a container has started
pub const REASON_STARTED: &str = "Started";

/// The fields of a cluster event the lifecycle manager looks at
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ClusterEvent {
    /// `Normal` or `Warning`
    pub event_type: String,
    /// Machine-readable reason, e.g. `Started`, `Pulling`, `BackOff`
    pub reason: String,
    /// Name of the involved object
    pub object_name: String,
}

impl ClusterEvent {
    /// Build an event from its parts
    pub fn new(
        event_type: impl Into<String>,
        reason: impl Into<String>,
        object_name: impl Into<String>,
    ) -> Self {
        Self {
            event_type: event_type.into(),
            reason: reason.into(),
            object_name: object_name.into(),
        }
    }

    /// Whether this is the "container started" signal for `pod`
    pub fn is_started(&self, pod: &str) -> bool {
        self.event_type == EVENT_NORMAL && self.reason == REASON_STARTED && self.object_name == pod
    }
}

impl From<&Event> for ClusterEvent {
    fn from(event: &Event) -> Self {
        Self {
            event_type: event.type_.clone().unwrap_or_default(),
            reason: event.reason.clone().unwrap_or_default(),
            object_name: event.involved_object.name.clone().unwrap_or_default(),
        }
    }
}

/// Stream of namespace events; an `Err` item ends the current watch attempt
pub type EventStream = BoxStream<'static, Result<ClusterEvent>>;

/// A follow-mode log connection read in bounded chunks
#[async_trait]
pub trait LogStream: Send {
    /// Next chunk of at most the chunk size given at open time; `None` at end of stream
    async fn next_chunk(&mut self) -> Result<Option<Vec<u8>>>;

    /// Release the underlying connection. Further reads return `None`.
    fn release(&mut self);
}

/// Cluster API operations used by the lifecycle manager
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ControlPlane: Send + Sync {
    /// Create a ConfigMap; fails if one with the same name exists
    async fn create_config_map(&self, namespace: &str, config_map: &ConfigMap) -> Result<()>;

    /// Read a ConfigMap back
    async fn read_config_map(&self, namespace: &str, name: &str) -> Result<ConfigMap>;

    /// Delete a ConfigMap
    async fn delete_config_map(&self, namespace: &str, name: &str) -> Result<()>;

    /// Create the job custom resource; fails if the name is taken
    async fn create_job(&self, namespace: &str, job: &TFJob) -> Result<()>;

    /// Read the job's status conditions
    async fn get_job_status(&self, namespace: &str, name: &str) -> Result<TFJobStatus>;

    /// Delete the job custom resource
    async fn delete_job(&self, namespace: &str, name: &str) -> Result<()>;

    /// Watch events involving `object_name` in `namespace`
    async fn watch_events(
        &self,
        namespace: &str,
        object_name: &str,
        timeout: Duration,
    ) -> Result<EventStream>;

    /// Open a follow-mode log stream for `pod`, read in chunks of at most `chunk_size` bytes
    async fn pod_logs(
        &self,
        namespace: &str,
        pod: &str,
        chunk_size: usize,
    ) -> Result<Box<dyn LogStream>>;
}

/// ApiResource for the TFJob custom resource
pub fn tfjob_api_resource() -> ApiResource {
    ApiResource {
        group: TFJOB_GROUP.to_string(),
        version: TFJOB_VERSION.to_string(),
        api_version: format!("{}/{}", TFJOB_GROUP, TFJOB_VERSION),
        kind: TFJOB_KIND.to_string(),
        plural: TFJOB_PLURAL.to_string(),
    }
}

/// kube-rs implementation of [`ControlPlane`]
#[derive(Clone)]
pub struct KubeControlPlane {
    client: Client,
}

impl KubeControlPlane {
    /// Wrap a kube client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn tfjobs(&self, namespace: &str) -> Api<DynamicObject> {
        Api::namespaced_with(self.client.clone(), namespace, &tfjob_api_resource())
    }

    fn config_maps(&self, namespace: &str) -> Api<ConfigMap> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

#[async_trait]
impl ControlPlane for KubeControlPlane {
    async fn create_config_map(&self, namespace: &str, config_map: &ConfigMap) -> Result<()> {
        self.config_maps(namespace)
            .create(&PostParams::default(), config_map)
            .await?;
        Ok(())
    }

    async fn read_config_map(&self, namespace: &str, name: &str) -> Result<ConfigMap> {
        Ok(self.config_maps(namespace).get(name).await?)
    }

    async fn delete_config_map(&self, namespace: &str, name: &str) -> Result<()> {
        self.config_maps(namespace)
            .delete(name, &DeleteParams::default())
            .await?;
        Ok(())
    }

    async fn create_job(&self, namespace: &str, job: &TFJob) -> Result<()> {
        let obj: DynamicObject = serde_json::from_value(serde_json::to_value(job)?)
            .map_err(|e| Error::serialization_for_kind(TFJOB_KIND, e.to_string()))?;
        self.tfjobs(namespace)
            .create(&PostParams::default(), &obj)
            .await?;
        debug!(job = %job.metadata.name, namespace = %namespace, "created tfjob");
        Ok(())
    }

    async fn get_job_status(&self, namespace: &str, name: &str) -> Result<TFJobStatus> {
        let obj = self.tfjobs(namespace).get(name).await?;
        TFJobStatus::from_value(obj.data.get("status"))
            .map_err(|e| Error::serialization_for_kind(TFJOB_KIND, e.to_string()))
    }

    async fn delete_job(&self, namespace: &str, name: &str) -> Result<()> {
        self.tfjobs(namespace)
            .delete(name, &DeleteParams::background())
            .await?;
        Ok(())
    }

    async fn watch_events(
        &self,
        namespace: &str,
        object_name: &str,
        timeout: Duration,
    ) -> Result<EventStream> {
        let api: Api<Event> = Api::namespaced(self.client.clone(), namespace);
        let config = watcher::Config::default()
            .fields(&format!("involvedObject.name={}", object_name))
            .timeout(timeout.as_secs().clamp(1, u32::MAX as u64) as u32);

        let stream = watcher::watcher(api, config).filter_map(|event| async move {
            match event {
                Ok(watcher::Event::Apply(ev)) | Ok(watcher::Event::InitApply(ev)) => {
                    Some(Ok(ClusterEvent::from(&ev)))
                }
                Ok(_) => None,
                Err(e) => Some(Err(Error::control_plane("watch_events", e.to_string()))),
            }
        });
        Ok(stream.boxed())
    }

    async fn pod_logs(
        &self,
        namespace: &str,
        pod: &str,
        chunk_size: usize,
    ) -> Result<Box<dyn LogStream>> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        Ok(Box::new(KubeLogStream::open(api, pod.to_string(), chunk_size)))
    }
}

/// Pod log stream read by a background task that owns the connection.
///
/// Releasing (or dropping) the stream aborts the task, which drops the
/// connection.
pub struct KubeLogStream {
    chunks: mpsc::Receiver<Result<Vec<u8>>>,
    reader: Option<JoinHandle<()>>,
}

impl KubeLogStream {
    fn open(api: Api<Pod>, pod: String, chunk_size: usize) -> Self {
        let (tx, rx) = mpsc::channel(16);
        let reader = tokio::spawn(async move {
            let params = LogParams {
                follow: true,
                ..LogParams::default()
            };
            let mut logs = match api.log_stream(&pod, &params).await {
                Ok(logs) => Box::pin(logs),
                Err(e) => {
                    let _ = tx.send(Err(e.into())).await;
                    return;
                }
            };
            let mut buf = vec![0u8; chunk_size.max(1)];
            loop {
                match logs.read(&mut buf).await {
                    Ok(0) => return,
                    Ok(n) => {
                        trace!(pod = %pod, bytes = n, "log chunk");
                        if tx.send(Ok(buf[..n].to_vec())).await.is_err() {
                            return;
                        }
                    }
                    Err(e) => {
                        let _ = tx
                            .send(Err(Error::control_plane("pod_logs", e.to_string())))
                            .await;
                        return;
                    }
                }
            }
        });
        Self {
            chunks: rx,
            reader: Some(reader),
        }
    }
}

#[async_trait]
impl LogStream for KubeLogStream {
    async fn next_chunk(&mut self) -> Result<Option<Vec<u8>>> {
        if self.reader.is_none() {
            return Ok(None);
        }
        match self.chunks.recv().await {
            Some(Ok(chunk)) => Ok(Some(chunk)),
            Some(Err(e)) => Err(e),
            None => Ok(None),
        }
    }

    fn release(&mut self) {
        if let Some(reader) = self.reader.take() {
            reader.abort();
            self.chunks.close();
        }
    }
}

impl Drop for KubeLogStream {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn started_signal_matches_type_reason_and_pod() {
        let pod = "mnist-abc-0-master-0";
        assert!(ClusterEvent::new("Normal", "Started", pod).is_started(pod));
        assert!(!ClusterEvent::new("Warning", "Started", pod).is_started(pod));
        assert!(!ClusterEvent::new("Normal", "Pulling", pod).is_started(pod));
        assert!(!ClusterEvent::new("Normal", "Started", "other-pod").is_started(pod));
    }

    #[test]
    fn cluster_event_from_kube_event() {
        let mut event = Event::default();
        event.type_ = Some("Normal".to_string());
        event.reason = Some("Started".to_string());
        event.involved_object.name = Some("p".to_string());
        assert!(ClusterEvent::from(&event).is_started("p"));
        assert_eq!(ClusterEvent::from(&Event::default()), ClusterEvent::default());
    }

    #[test]
    fn tfjob_resource_coordinates() {
        let ar = tfjob_api_resource();
        assert_eq!(ar.api_version, "kubeflow.org/v1alpha2");
        assert_eq!(ar.plural, "tfjobs");
        assert_eq!(ar.kind, "TFJob");
    }
}
