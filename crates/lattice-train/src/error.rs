//! Deploy pipeline error types

use std::path::PathBuf;

/// Result type for the deploy pipeline
pub type Result<T> = std::result::Result<T, TrainError>;

/// Errors surfaced by compiling, building, submitting and supervising a job
#[derive(Debug, thiserror::Error)]
pub enum TrainError {
    /// Malformed topology/strategy input; fix the configuration and retry
    #[error("configuration error for '{job}': {message}")]
    Configuration { job: String, message: String },

    /// Image build or publish failed; nothing was submitted
    #[error("image build failed for {image}: {message}")]
    Build {
        image: String,
        message: String,
        stdout: String,
        stderr: String,
    },

    /// Config-object or custom-resource creation was rejected
    #[error("submission of '{job}' failed: {source}")]
    Submission {
        job: String,
        source: lattice_common::Error,
    },

    /// The primary container never reported started within the retry budget
    #[error("pod '{pod}' of job '{job}' did not start after {attempts} attempts{}", fmt_last(.last_error))]
    StartTimeout {
        job: String,
        pod: String,
        attempts: u32,
        last_error: Option<String>,
    },

    /// Status polling ran out of attempts without a terminal condition
    #[error("status of job '{job}' unknown after {attempts} polls{}", fmt_last(.last_error))]
    StatusPollAmbiguous {
        job: String,
        attempts: u32,
        last_error: Option<String>,
    },

    /// Best-effort cleanup failed; logged, never returned by supervision
    #[error("cleanup of {resource} for job '{job}' failed: {message}")]
    Cleanup {
        job: String,
        resource: String,
        message: String,
    },

    /// Notebook-to-script conversion exited non-zero
    #[error("notebook conversion of {notebook} failed: {message}")]
    Conversion {
        notebook: PathBuf,
        message: String,
        stdout: String,
        stderr: String,
    },

    /// The external deploy compiler binary is not installed
    #[error("deploy compiler not found at {path}")]
    CompilerMissing { path: PathBuf },

    /// The external deploy compiler failed
    #[error("deploy compiler {mode} failed: {message}")]
    Compiler { mode: String, message: String },

    /// An interrupt arrived while the job was being supervised
    #[error("deploy of '{job}' cancelled by interrupt")]
    Cancelled { job: String },

    /// The user's training logic failed on the worker side
    #[error("training failed: {0}")]
    Training(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("{0}")]
    Common(#[from] lattice_common::Error),
}

fn fmt_last(last: &Option<String>) -> String {
    last.as_ref()
        .map(|e| format!(" (last error: {})", e))
        .unwrap_or_default()
}

impl TrainError {
    /// Create a configuration error
    pub fn configuration(job: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Configuration {
            job: job.into(),
            message: message.into(),
        }
    }

    /// Create a submission error wrapping the control plane failure
    pub fn submission(job: impl Into<String>, source: lattice_common::Error) -> Self {
        Self::Submission {
            job: job.into(),
            source,
        }
    }

    /// Create a training error for failed worker-side logic
    pub fn training(message: impl Into<String>) -> Self {
        Self::Training(message.into())
    }

    /// The job this error concerns, when known
    pub fn job(&self) -> Option<&str> {
        match self {
            Self::Configuration { job, .. }
            | Self::Submission { job, .. }
            | Self::StartTimeout { job, .. }
            | Self::StatusPollAmbiguous { job, .. }
            | Self::Cleanup { job, .. }
            | Self::Cancelled { job } => Some(job),
            Self::Common(e) => e.job(),
            _ => None,
        }
    }

    /// Process exit code for this error
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::StatusPollAmbiguous { .. } => 2,
            Self::Cancelled { .. } => 130,
            _ => 1,
        }
    }
}
