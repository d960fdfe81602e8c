//! Cluster lifecycle manager
//!
//! Drives one submitted job through
//! `Created -> Submitted -> AwaitingStart -> Streaming -> Completed|Failed -> CleanedUp`.
//!
//! Ordering guarantees:
//! - every ConfigMap exists before the TFJob is created
//! - the start watch finishes before the log stream is opened
//! - cleanup runs after a terminal or ambiguous outcome, never after a start
//!   timeout (resources stay for inspection)
//!
//! Waits on the control plane run under a [`RetryBudget`], so a job whose
//! container never starts ends in [`TrainError::StartTimeout`] instead of
//! blocking forever.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::StreamExt;
use lattice_common::{retry_fixed, JobDescription, RetryBudget, RoleKind};
use lattice_tfjob::{compile_config_maps, compile_tfjob, pod_name, ConditionState};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::control_plane::{ControlPlane, LogStream};
use crate::error::{Result, TrainError};

/// Upper bound on one log chunk
pub const MAX_STREAM_BYTES: usize = 1024;

/// How long an interrupt waits for the control plane to take the delete request
pub const CANCEL_TIMEOUT: Duration = Duration::from_secs(5);

/// Where a submitted job is in its lifecycle
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LifecyclePhase {
    /// Compiled, nothing sent yet
    Created,
    /// ConfigMaps and TFJob accepted by the control plane
    Submitted,
    /// Waiting for the primary container to start
    AwaitingStart,
    /// Following the primary container's logs
    Streaming,
    /// Terminal success
    Completed,
    /// Terminal failure, or the container never started
    Failed,
    /// Status polling gave up without a terminal condition
    Ambiguous,
    /// ConfigMaps deleted
    CleanedUp,
}

impl fmt::Display for LifecyclePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Created => "Created",
            Self::Submitted => "Submitted",
            Self::AwaitingStart => "AwaitingStart",
            Self::Streaming => "Streaming",
            Self::Completed => "Completed",
            Self::Failed => "Failed",
            Self::Ambiguous => "Ambiguous",
            Self::CleanedUp => "CleanedUp",
        };
        f.write_str(s)
    }
}

/// Final outcome of a supervised job
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JobOutcome {
    /// The job reported success
    Completed,
    /// The job reported failure
    Failed,
    /// Deployed, but the backend cannot observe the result
    Detached,
}

impl fmt::Display for JobOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
            Self::Detached => write!(f, "detached"),
        }
    }
}

/// Key for every watch, log, poll and cleanup call on one submitted job
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SubmissionHandle {
    name: String,
    namespace: String,
    created_at: DateTime<Utc>,
    artifacts: Vec<String>,
    primary_pod: String,
    phase: LifecyclePhase,
}

impl SubmissionHandle {
    /// Handle for a job about to be submitted
    pub fn new(job: &JobDescription, namespace: impl Into<String>) -> Self {
        Self {
            name: job.name.clone(),
            namespace: namespace.into(),
            created_at: Utc::now(),
            artifacts: job.artifact_names(),
            primary_pod: pod_name(&job.name, RoleKind::Master, 0),
            phase: LifecyclePhase::Created,
        }
    }

    /// Job name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Namespace the job lives in
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// When the handle was created
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// ConfigMaps owned by the job
    pub fn artifacts(&self) -> &[String] {
        &self.artifacts
    }

    /// Pod whose start event and logs are followed
    pub fn primary_pod(&self) -> &str {
        &self.primary_pod
    }

    /// Current phase
    pub fn phase(&self) -> LifecyclePhase {
        self.phase
    }

    pub(crate) fn transition(&mut self, to: LifecyclePhase) {
        info!(job = %self.name, from = %self.phase, to = %to, "lifecycle transition");
        self.phase = to;
    }
}

/// Why one status poll did not produce an outcome
enum PollMiss {
    Pending,
    Transport(lattice_common::Error),
}

impl fmt::Display for PollMiss {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "no terminal condition yet"),
            Self::Transport(e) => write!(f, "{}", e),
        }
    }
}

/// Releases a log stream exactly once, on whichever path leaves the read loop
struct LogStreamGuard {
    stream: Box<dyn LogStream>,
    released: bool,
}

impl LogStreamGuard {
    fn new(stream: Box<dyn LogStream>) -> Self {
        Self {
            stream,
            released: false,
        }
    }

    async fn next_chunk(&mut self) -> lattice_common::Result<Option<Vec<u8>>> {
        self.stream.next_chunk().await
    }

    fn release(&mut self) {
        if !self.released {
            self.released = true;
            self.stream.release();
        }
    }
}

impl Drop for LogStreamGuard {
    fn drop(&mut self) {
        self.release();
    }
}

/// Submits jobs and supervises them until a terminal state
pub struct LifecycleManager<C: ?Sized> {
    control_plane: Arc<C>,
    start_budget: RetryBudget,
    poll_budget: RetryBudget,
    chunk_size: usize,
}

impl<C: ControlPlane + ?Sized + 'static> LifecycleManager<C> {
    /// Manager with the default budgets for both waits
    pub fn new(control_plane: Arc<C>) -> Self {
        Self {
            control_plane,
            start_budget: RetryBudget::default(),
            poll_budget: RetryBudget::default(),
            chunk_size: MAX_STREAM_BYTES,
        }
    }

    /// Use `budget` for both the start watch and status polling
    pub fn with_budget(mut self, budget: RetryBudget) -> Self {
        self.start_budget = budget.clone();
        self.poll_budget = budget;
        self
    }

    /// Materialize the job's ConfigMaps, then create the TFJob.
    ///
    /// A ConfigMap failure stops before the TFJob is attempted. A TFJob
    /// failure deletes the ConfigMaps this call created. Both surface as
    /// [`TrainError::Submission`]; a name collision with a live job is one.
    pub async fn submit(&self, job: &JobDescription, namespace: &str) -> Result<SubmissionHandle> {
        job.validate()
            .map_err(|e| TrainError::configuration(&job.name, e.to_string()))?;

        let mut handle = SubmissionHandle::new(job, namespace);
        let mut created: Vec<String> = Vec::new();

        for config_map in compile_config_maps(job, namespace) {
            let name = config_map.metadata.name.clone().unwrap_or_default();
            if let Err(e) = self
                .control_plane
                .create_config_map(namespace, &config_map)
                .await
            {
                if e.is_conflict() {
                    warn!(job = %job.name, config_map = %name, "configmap exists, a job with this name is still live");
                }
                self.rollback(&job.name, namespace, &created).await;
                return Err(TrainError::submission(&job.name, e));
            }
            created.push(name.clone());

            match self.control_plane.read_config_map(namespace, &name).await {
                Ok(read) => {
                    let keys: Vec<&String> = read
                        .data
                        .as_ref()
                        .map(|d| d.keys().collect())
                        .unwrap_or_default();
                    debug!(job = %job.name, config_map = %name, ?keys, "created configmap");
                }
                Err(e) => {
                    warn!(job = %job.name, config_map = %name, error = %e, "failed to read back configmap")
                }
            }
        }

        let tfjob = compile_tfjob(job, namespace);
        if let Err(e) = self.control_plane.create_job(namespace, &tfjob).await {
            self.rollback(&job.name, namespace, &created).await;
            return Err(TrainError::submission(&job.name, e));
        }

        handle.transition(LifecyclePhase::Submitted);
        Ok(handle)
    }

    async fn rollback(&self, job: &str, namespace: &str, created: &[String]) {
        for name in created {
            if let Err(e) = self.control_plane.delete_config_map(namespace, name).await {
                warn!(job = %job, config_map = %name, error = %e, "failed to roll back configmap");
            }
        }
    }

    /// Wait for the primary container's "started" event.
    ///
    /// Each attempt opens a fresh watch bounded by the request timeout; a
    /// watch that errors or ends without the event counts as a failed attempt.
    pub async fn await_start(&self, handle: &mut SubmissionHandle) -> Result<()> {
        handle.transition(LifecyclePhase::AwaitingStart);

        let control_plane = &*self.control_plane;
        let namespace = handle.namespace.as_str();
        let pod = handle.primary_pod.as_str();
        let watch_timeout = self.start_budget.request_timeout;

        let result = retry_fixed(&self.start_budget, "await_start", |attempt| async move {
            debug!(pod = %pod, attempt, "watching events");
            let mut events = control_plane
                .watch_events(namespace, pod, watch_timeout)
                .await?;
            while let Some(event) = events.next().await {
                let event = event?;
                debug!(pod = %pod, event_type = %event.event_type, reason = %event.reason, "event");
                if event.is_started(pod) {
                    return Ok(());
                }
            }
            Err(lattice_common::Error::control_plane(
                "watch_events",
                "watch ended before the container started",
            ))
        })
        .await;

        match result {
            Ok(()) => {
                info!(job = %handle.name, pod = %handle.primary_pod, "primary container started");
                Ok(())
            }
            Err(exhausted) => {
                handle.transition(LifecyclePhase::Failed);
                Err(TrainError::StartTimeout {
                    job: handle.name.clone(),
                    pod: handle.primary_pod.clone(),
                    attempts: exhausted.attempts,
                    last_error: exhausted.last_error,
                })
            }
        }
    }

    /// Copy the primary pod's logs to `out` in chunks of at most [`MAX_STREAM_BYTES`].
    ///
    /// Stops at end of stream or when `cancel` fires. The connection is
    /// released exactly once on every exit path, errors included.
    pub async fn stream_logs<W>(
        &self,
        handle: &mut SubmissionHandle,
        out: &mut W,
        cancel: &CancellationToken,
    ) -> Result<u64>
    where
        W: AsyncWrite + Unpin + Send,
    {
        handle.transition(LifecyclePhase::Streaming);
        let stream = self
            .control_plane
            .pod_logs(&handle.namespace, &handle.primary_pod, self.chunk_size)
            .await?;
        let mut guard = LogStreamGuard::new(stream);

        let mut total = 0u64;
        loop {
            let chunk = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    debug!(pod = %handle.primary_pod, "log streaming cancelled");
                    break;
                }
                chunk = guard.next_chunk() => chunk?,
            };
            match chunk {
                Some(bytes) => {
                    out.write_all(&bytes).await?;
                    total += bytes.len() as u64;
                }
                None => break,
            }
        }
        out.flush().await?;
        guard.release();
        Ok(total)
    }

    /// Poll the TFJob status until the authoritative condition is terminal.
    ///
    /// Exhausting the budget yields [`TrainError::StatusPollAmbiguous`], never
    /// success or failure.
    pub async fn poll_completion(&self, handle: &mut SubmissionHandle) -> Result<JobOutcome> {
        let control_plane = &*self.control_plane;
        let namespace = handle.namespace.as_str();
        let name = handle.name.as_str();

        let result = retry_fixed(&self.poll_budget, "poll_status", |_| async move {
            let status = control_plane
                .get_job_status(namespace, name)
                .await
                .map_err(PollMiss::Transport)?;
            match status.state() {
                ConditionState::Succeeded => Ok(JobOutcome::Completed),
                ConditionState::Failed => Ok(JobOutcome::Failed),
                ConditionState::Running => Err(PollMiss::Pending),
            }
        })
        .await;

        match result {
            Ok(JobOutcome::Failed) => {
                handle.transition(LifecyclePhase::Failed);
                Ok(JobOutcome::Failed)
            }
            Ok(outcome) => {
                handle.transition(LifecyclePhase::Completed);
                Ok(outcome)
            }
            Err(exhausted) => {
                handle.transition(LifecyclePhase::Ambiguous);
                Err(TrainError::StatusPollAmbiguous {
                    job: handle.name.clone(),
                    attempts: exhausted.attempts,
                    last_error: exhausted.last_error,
                })
            }
        }
    }

    /// Delete the job's ConfigMaps. Failures are logged, never returned.
    pub async fn cleanup(&self, handle: &mut SubmissionHandle) {
        for name in &handle.artifacts {
            if let Err(e) = self
                .control_plane
                .delete_config_map(&handle.namespace, name)
                .await
            {
                let err = TrainError::Cleanup {
                    job: handle.name.clone(),
                    resource: format!("configmap/{}", name),
                    message: e.to_string(),
                };
                warn!(error = %err, "cleanup failed");
            }
        }
        handle.transition(LifecyclePhase::CleanedUp);
    }

    /// Send the TFJob delete request.
    ///
    /// Returns once the control plane accepted (or rejected) the request, or
    /// after [`CANCEL_TIMEOUT`]; it never waits for the job to disappear.
    pub async fn cancel(&self, handle: &SubmissionHandle) {
        info!(job = %handle.name, "requesting job deletion");
        let request = self.control_plane.delete_job(&handle.namespace, &handle.name);
        match tokio::time::timeout(CANCEL_TIMEOUT, request).await {
            Ok(Ok(())) => debug!(job = %handle.name, "job deletion accepted"),
            Ok(Err(e)) => warn!(job = %handle.name, error = %e, "cancel request failed"),
            Err(_) => warn!(job = %handle.name, "cancel request timed out"),
        }
    }

    /// Run a submitted job to its end: start watch, optional log stream, status poll, cleanup.
    ///
    /// A start timeout returns immediately and leaves the job in place. A log
    /// stream failure is logged and polling continues.
    pub async fn supervise<W>(
        &self,
        handle: &mut SubmissionHandle,
        logs: Option<&mut W>,
        cancel: &CancellationToken,
    ) -> Result<JobOutcome>
    where
        W: AsyncWrite + Unpin + Send,
    {
        self.await_start(handle).await?;

        if let Some(out) = logs {
            match self.stream_logs(handle, out, cancel).await {
                Ok(bytes) => debug!(job = %handle.name, bytes, "log stream ended"),
                Err(e) => warn!(job = %handle.name, error = %e, "log stream failed"),
            }
        }

        let outcome = self.poll_completion(handle).await;
        match &outcome {
            Ok(o) => info!(job = %handle.name, outcome = %o, "job finished"),
            Err(e) => warn!(job = %handle.name, error = %e, "job outcome unknown"),
        }
        self.cleanup(handle).await;
        outcome
    }
}
