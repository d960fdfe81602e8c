//! Execution dispatcher
//!
//! Wraps the user's training object and reroutes exactly one operation,
//! `train`. Outside the worker pod the first call deploys; inside it the first
//! call runs the user's logic. Either way the branch is taken once per
//! dispatcher and every later call is a no-op. Everything else on the wrapped
//! object is reached through `Deref` unchanged.

use std::ops::{Deref, DerefMut};

use async_trait::async_trait;
use tracing::{debug, info};

use crate::context::ExecutionContext;
use crate::error::Result;
use crate::lifecycle::JobOutcome;
use crate::trainer::{Deploy, DeployReport};

/// User training logic, run on the worker side
#[async_trait]
pub trait Trainable: Send {
    /// Run the training body once
    async fn train(&mut self) -> Result<()>;
}

/// Dispatcher state over the `train` operation
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DispatchState {
    /// `train` has not been called
    Uninitialized,
    /// A branch was taken; further calls do nothing
    Dispatched,
}

/// What a call to [`ExecutionDispatcher::train`] did
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Control side: the job was deployed and supervised
    Deployed(DeployReport),
    /// Worker side: the user's logic ran
    Trained,
    /// A previous call already dispatched
    AlreadyDispatched,
}

impl DispatchOutcome {
    /// Process exit code: a failed job exits 1, everything else 0
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Deployed(report) if report.outcome() == JobOutcome::Failed => 1,
            _ => 0,
        }
    }
}

/// Two-state guard in front of a training object
pub struct ExecutionDispatcher<T, D> {
    inner: T,
    deployer: D,
    in_worker_pod: bool,
    state: DispatchState,
}

impl<T: Trainable, D: Deploy> ExecutionDispatcher<T, D> {
    /// Wrap `inner`; the branch is fixed by `context` now
    pub fn new(inner: T, deployer: D, context: &ExecutionContext) -> Self {
        Self {
            inner,
            deployer,
            in_worker_pod: context.in_worker_pod(),
            state: DispatchState::Uninitialized,
        }
    }

    /// Current state
    pub fn state(&self) -> DispatchState {
        self.state
    }

    /// Deploy (control side) or run the training logic (worker side), once.
    ///
    /// The state flips to `Dispatched` before the branch runs, so a failed
    /// branch is not retried by a second call either.
    pub async fn train(&mut self) -> Result<DispatchOutcome> {
        if self.state == DispatchState::Dispatched {
            debug!("train already dispatched, ignoring");
            return Ok(DispatchOutcome::AlreadyDispatched);
        }
        self.state = DispatchState::Dispatched;

        if self.in_worker_pod {
            info!("running training logic in worker pod");
            self.inner.train().await?;
            Ok(DispatchOutcome::Trained)
        } else {
            info!("deploying from control side");
            Ok(DispatchOutcome::Deployed(self.deployer.deploy().await?))
        }
    }

    /// Unwrap the training object
    pub fn into_inner(self) -> T {
        self.inner
    }
}

impl<T, D> Deref for ExecutionDispatcher<T, D> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.inner
    }
}

impl<T, D> DerefMut for ExecutionDispatcher<T, D> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.inner
    }
}
