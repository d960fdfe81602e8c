//! External deploy compiler client
//!
//! The compiler is a local executable that takes a serialized job description
//! file and deploys, deletes or attaches to the job it describes.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use lattice_common::JobDescription;
use tokio::process::Command;
use tracing::{info, warn};

use crate::error::{Result, TrainError};

/// Where the compiler is installed by default
pub const DEFAULT_COMPILER_PATH: &str = "/usr/local/bin/mp-compiler";
/// Directory job description files are written to
pub const SPEC_DIR: &str = ".lattice-train";

/// What the compiler is asked to do with a job description
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CompilerMode {
    /// Deploy the job
    Run,
    /// Delete the job
    Cancel,
    /// Attach to the running job's logs without deploying
    Logs,
}

impl CompilerMode {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Run => "run",
            Self::Cancel => "cancel",
            Self::Logs => "logs",
        }
    }

    fn flags(&self) -> &'static [&'static str] {
        match self {
            Self::Run => &[],
            Self::Cancel => &["--delete"],
            Self::Logs => &["--deploy=false", "--attach=true"],
        }
    }
}

/// Client for the external deploy compiler binary
#[derive(Clone, Debug)]
pub struct DeployCompiler {
    binary: PathBuf,
    spec_dir: PathBuf,
}

impl Default for DeployCompiler {
    fn default() -> Self {
        Self::new(DEFAULT_COMPILER_PATH)
    }
}

impl DeployCompiler {
    /// Compiler at `binary`, writing specs under `.lattice-train/`
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
            spec_dir: PathBuf::from(SPEC_DIR),
        }
    }

    /// Write job description files under `dir` instead
    pub fn with_spec_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.spec_dir = dir.into();
        self
    }

    /// Path of the compiler binary
    pub fn binary(&self) -> &Path {
        &self.binary
    }

    /// Fail with [`TrainError::CompilerMissing`] unless the binary exists.
    ///
    /// Run once by the entry point before any deploy that needs the compiler.
    pub fn ensure_present(&self) -> Result<()> {
        if self.binary.is_file() {
            Ok(())
        } else {
            Err(TrainError::CompilerMissing {
                path: self.binary.clone(),
            })
        }
    }

    /// Path of the description file for `job`
    pub fn spec_path(&self, job: &str) -> PathBuf {
        self.spec_dir.join(format!("{}.json", job))
    }

    /// Serialize `job` to its description file
    pub async fn write_spec(&self, job: &JobDescription) -> Result<PathBuf> {
        tokio::fs::create_dir_all(&self.spec_dir).await?;
        let path = self.spec_path(&job.name);
        let body = serde_json::to_vec_pretty(job)?;
        tokio::fs::write(&path, body).await?;
        Ok(path)
    }

    /// Arguments for one invocation
    pub fn args(spec: &Path, mode: CompilerMode) -> Vec<String> {
        let mut args = vec!["-f".to_string(), spec.display().to_string()];
        args.extend(mode.flags().iter().map(|f| f.to_string()));
        args
    }

    async fn invoke(&self, job: &str, mode: CompilerMode) -> Result<()> {
        let spec = self.spec_path(job);
        let status = Command::new(&self.binary)
            .args(Self::args(&spec, mode))
            .status()
            .await
            .map_err(|e| TrainError::Compiler {
                mode: mode.as_str().to_string(),
                message: format!("failed to run {}: {}", self.binary.display(), e),
            })?;
        if !status.success() {
            return Err(TrainError::Compiler {
                mode: mode.as_str().to_string(),
                message: format!("{} exited with {}", self.binary.display(), status),
            });
        }
        Ok(())
    }

    /// Write the description and deploy it
    pub async fn run(&self, job: &JobDescription) -> Result<()> {
        let spec = self.write_spec(job).await?;
        info!(job = %job.name, spec = %spec.display(), "launching deploy compiler");
        self.invoke(&job.name, CompilerMode::Run).await
    }

    /// Attach to the deployed job's logs until it exits
    pub async fn logs(&self, job: &str) -> Result<()> {
        self.invoke(job, CompilerMode::Logs).await
    }

    /// Ask the compiler to delete the job without waiting for it
    pub fn cancel(&self, job: &str) {
        let spec = self.spec_path(job);
        let spawned = Command::new(&self.binary)
            .args(Self::args(&spec, CompilerMode::Cancel))
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn();
        match spawned {
            Ok(_) => info!(job = %job, "cancel requested"),
            Err(e) => warn!(job = %job, error = %e, "failed to request cancel"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lattice_common::{RoleGroup, RoleKind};

    #[test]
    fn mode_flags() {
        let spec = Path::new(".lattice-train/mnist.json");
        assert_eq!(
            DeployCompiler::args(spec, CompilerMode::Run),
            vec!["-f", ".lattice-train/mnist.json"]
        );
        assert_eq!(
            DeployCompiler::args(spec, CompilerMode::Cancel),
            vec!["-f", ".lattice-train/mnist.json", "--delete"]
        );
        assert_eq!(
            DeployCompiler::args(spec, CompilerMode::Logs),
            vec!["-f", ".lattice-train/mnist.json", "--deploy=false", "--attach=true"]
        );
    }

    #[test]
    fn missing_binary_is_reported() {
        let compiler = DeployCompiler::new("/nonexistent/mp-compiler");
        match compiler.ensure_present() {
            Err(TrainError::CompilerMissing { path }) => {
                assert_eq!(path, PathBuf::from("/nonexistent/mp-compiler"))
            }
            other => panic!("expected CompilerMissing, got {:?}", other),
        }
    }

    #[test]
    fn present_binary_passes() {
        let file = tempfile::NamedTempFile::new().unwrap();
        assert!(DeployCompiler::new(file.path()).ensure_present().is_ok());
    }

    #[tokio::test]
    async fn writes_description_as_json() {
        let dir = tempfile::tempdir().unwrap();
        let compiler = DeployCompiler::default().with_spec_dir(dir.path().join("specs"));

        let mut job = JobDescription::new("mnist-abc", "abc");
        job.roles.push(RoleGroup::new(RoleKind::Master, 1, "img:abc"));

        let path = compiler.write_spec(&job).await.unwrap();
        assert_eq!(path, dir.path().join("specs").join("mnist-abc.json"));

        let written: JobDescription =
            serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        assert_eq!(written, job);
    }

    #[tokio::test]
    async fn run_without_binary_is_compiler_error() {
        let dir = tempfile::tempdir().unwrap();
        let compiler = DeployCompiler::new("/nonexistent/mp-compiler").with_spec_dir(dir.path());
        let mut job = JobDescription::new("mnist-abc", "abc");
        job.roles.push(RoleGroup::new(RoleKind::Master, 1, "img:abc"));

        let err = compiler.run(&job).await.unwrap_err();
        assert!(matches!(err, TrainError::Compiler { .. }));
    }
}
