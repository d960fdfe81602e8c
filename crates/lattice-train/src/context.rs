//! Process-wide execution context
//!
//! Decides whether this process is the control side (a workstation or CI job
//! that submits and supervises) or the worker side (a replica pod running the
//! training logic). Read once from the environment and never changed.

use once_cell::sync::OnceCell;

use lattice_common::kube_utils;
use lattice_common::RUNTIME_ENV;

static CURRENT: OnceCell<ExecutionContext> = OnceCell::new();

/// Where the current process runs
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExecutionContext {
    in_worker_pod: bool,
    namespace: String,
}

impl ExecutionContext {
    /// Build a context explicitly
    pub fn new(in_worker_pod: bool, namespace: impl Into<String>) -> Self {
        Self {
            in_worker_pod,
            namespace: namespace.into(),
        }
    }

    /// Control-side context in `namespace`
    pub fn control(namespace: impl Into<String>) -> Self {
        Self::new(false, namespace)
    }

    /// Worker-side context in `namespace`
    pub fn worker(namespace: impl Into<String>) -> Self {
        Self::new(true, namespace)
    }

    /// Read the context from the environment
    pub fn from_env(fallback_namespace: &str) -> Self {
        Self {
            in_worker_pod: runtime_flag(std::env::var(RUNTIME_ENV).ok().as_deref()),
            namespace: kube_utils::resolve_namespace(fallback_namespace),
        }
    }

    /// The process-wide context, read from the environment on first use.
    ///
    /// `fallback_namespace` only matters on the first call.
    pub fn current(fallback_namespace: &str) -> &'static ExecutionContext {
        CURRENT.get_or_init(|| Self::from_env(fallback_namespace))
    }

    /// Whether this process runs inside a target worker pod
    pub fn in_worker_pod(&self) -> bool {
        self.in_worker_pod
    }

    /// Namespace jobs are submitted to
    pub fn namespace(&self) -> &str {
        &self.namespace
    }
}

fn runtime_flag(value: Option<&str>) -> bool {
    matches!(
        value.map(|v| v.trim().to_ascii_lowercase()).as_deref(),
        Some("1" | "true" | "yes")
    )
}
