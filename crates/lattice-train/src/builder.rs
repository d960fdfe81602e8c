//! Image build dispatch
//!
//! The deploy pipeline only sees [`ImageBuilder::build`], which returns once
//! the image is available at its reference or fails. Any failure aborts the
//! deploy before anything is submitted.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Output;

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use tokio::process::Command;
use tracing::{debug, info};

use crate::error::{Result, TrainError};

/// Length of generated image tags
pub const TAG_LEN: usize = 10;

/// Image reference `{repository}/{name}:{tag}`; an empty repository is omitted
pub fn image_ref(repository: &str, name: &str, tag: &str) -> String {
    let repository = repository.trim_end_matches('/');
    if repository.is_empty() {
        format!("{}:{}", name, tag)
    } else {
        format!("{}/{}:{}", repository, name, tag)
    }
}

/// Short random tag, unique per deploy
pub fn unique_tag() -> String {
    uuid::Uuid::new_v4().simple().to_string()[..TAG_LEN].to_string()
}

/// Everything needed to build and publish one image
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BuildRequest {
    /// Build context directory
    pub context: PathBuf,
    /// Target image reference
    pub image: String,
    /// Base image passed as the `BASE_IMAGE` build argument
    pub base_image: Option<String>,
    /// Dockerfile path, relative to the context when not absolute
    pub dockerfile: Option<PathBuf>,
    /// Push after building
    pub publish: bool,
    /// Build arguments baked into the image
    pub env: BTreeMap<String, String>,
}

/// Builds and publishes container images
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ImageBuilder: Send + Sync {
    /// Build (and publish, if requested) the image; returns once it is available
    async fn build(&self, request: &BuildRequest) -> Result<()>;
}

/// Builds with the local `docker` CLI
#[derive(Clone, Debug)]
pub struct DockerCliBuilder {
    binary: String,
}

impl Default for DockerCliBuilder {
    fn default() -> Self {
        Self {
            binary: "docker".to_string(),
        }
    }
}

impl DockerCliBuilder {
    /// Use a specific docker-compatible binary (e.g. `podman`)
    pub fn with_binary(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    async fn run(&self, args: &[String], image: &str, step: &str) -> Result<()> {
        debug!(binary = %self.binary, ?args, "running {}", step);
        let output = Command::new(&self.binary)
            .args(args)
            .output()
            .await
            .map_err(|e| TrainError::Build {
                image: image.to_string(),
                message: format!("failed to run {} {}: {}", self.binary, step, e),
                stdout: String::new(),
                stderr: String::new(),
            })?;
        check_output(&output, image, step)
    }
}

fn check_output(output: &Output, image: &str, step: &str) -> Result<()> {
    if output.status.success() {
        return Ok(());
    }
    Err(TrainError::Build {
        image: image.to_string(),
        message: format!("{} exited with {}", step, output.status),
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
    })
}

/// Arguments for `docker build`
pub fn build_args(request: &BuildRequest) -> Vec<String> {
    let mut args = vec!["build".to_string(), "-t".to_string(), request.image.clone()];
    if let Some(dockerfile) = &request.dockerfile {
        args.push("-f".to_string());
        args.push(request.context.join(dockerfile).display().to_string());
    }
    if let Some(base) = &request.base_image {
        args.push("--build-arg".to_string());
        args.push(format!("BASE_IMAGE={}", base));
    }
    for (key, value) in &request.env {
        args.push("--build-arg".to_string());
        args.push(format!("{}={}", key, value));
    }
    args.push(request.context.display().to_string());
    args
}

#[async_trait]
impl ImageBuilder for DockerCliBuilder {
    async fn build(&self, request: &BuildRequest) -> Result<()> {
        info!(image = %request.image, context = %request.context.display(), "building image");
        self.run(&build_args(request), &request.image, "build")
            .await?;

        if request.publish {
            info!(image = %request.image, "pushing image");
            self.run(
                &["push".to_string(), request.image.clone()],
                &request.image,
                "push",
            )
            .await?;
        }
        Ok(())
    }
}

/// The image already exists; nothing to build
#[derive(Clone, Copy, Debug, Default)]
pub struct PrebuiltImage;

#[async_trait]
impl ImageBuilder for PrebuiltImage {
    async fn build(&self, request: &BuildRequest) -> Result<()> {
        info!(image = %request.image, "using prebuilt image");
        Ok(())
    }
}
