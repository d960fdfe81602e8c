//! Shared Kubernetes utilities using kube-rs
//!
//! Client construction with explicit timeouts and namespace resolution for
//! processes that may run either on a workstation or inside a pod.

use std::path::Path;
use std::time::Duration;

use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Config};
use tracing::debug;

use crate::Error;

/// Default connection timeout for kube clients
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
/// Default read timeout for kube clients
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(30);

/// Environment variable the kubelet sets in every pod
pub const KUBERNETES_SERVICE_HOST_ENV: &str = "KUBERNETES_SERVICE_HOST";
/// Service account namespace file mounted into pods
pub const SERVICE_ACCOUNT_NAMESPACE_PATH: &str =
    "/var/run/secrets/kubernetes.io/serviceaccount/namespace";

/// Create a kube client from optional kubeconfig path with default timeouts
pub async fn create_client(kubeconfig: Option<&Path>) -> Result<Client, Error> {
    create_client_with_timeout(kubeconfig, DEFAULT_CONNECT_TIMEOUT, DEFAULT_READ_TIMEOUT).await
}

/// Create a kube client from optional kubeconfig path with custom timeouts
///
/// Without an explicit kubeconfig the config is inferred: in-cluster service
/// account first, then `KUBECONFIG` / `~/.kube/config`.
pub async fn create_client_with_timeout(
    kubeconfig: Option<&Path>,
    connect_timeout: Duration,
    read_timeout: Duration,
) -> Result<Client, Error> {
    let mut config = match kubeconfig {
        Some(path) => {
            let kubeconfig = Kubeconfig::read_from(path).map_err(|e| {
                Error::internal_with_context(
                    "create_client",
                    format!("failed to read kubeconfig {}: {}", path.display(), e),
                )
            })?;
            Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
                .await
                .map_err(|e| {
                    Error::internal_with_context(
                        "create_client",
                        format!("failed to load kubeconfig: {}", e),
                    )
                })?
        }
        None => Config::infer().await.map_err(|e| {
            Error::internal_with_context("create_client", format!("failed to infer config: {}", e))
        })?,
    };

    config.connect_timeout = Some(connect_timeout);
    config.read_timeout = Some(read_timeout);
    Client::try_from(config).map_err(|e| {
        Error::internal_with_context("create_client", format!("failed to create client: {}", e))
    })
}

/// Whether the current process runs inside a Kubernetes pod
pub fn is_running_in_cluster() -> bool {
    std::env::var_os(KUBERNETES_SERVICE_HOST_ENV).is_some()
        && Path::new(SERVICE_ACCOUNT_NAMESPACE_PATH).exists()
}

/// Resolve the namespace to operate in.
///
/// Inside a pod the namespace comes from the service account mount;
/// everywhere else `fallback` is used.
pub fn resolve_namespace(fallback: &str) -> String {
    if is_running_in_cluster() {
        match read_namespace_file(Path::new(SERVICE_ACCOUNT_NAMESPACE_PATH)) {
            Ok(ns) => return ns,
            Err(e) => debug!(error = %e, fallback = %fallback, "could not read pod namespace"),
        }
    }
    fallback.to_string()
}

/// Read a namespace from a service-account style file (trimmed, non-empty)
pub fn read_namespace_file(path: &Path) -> Result<String, Error> {
    let raw = std::fs::read_to_string(path).map_err(|e| {
        Error::internal_with_context(
            "namespace",
            format!("failed to read {}: {}", path.display(), e),
        )
    })?;
    let ns = raw.trim();
    if ns.is_empty() {
        return Err(Error::internal_with_context(
            "namespace",
            format!("{} is empty", path.display()),
        ));
    }
    Ok(ns.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn namespace_file_is_trimmed() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "  ml-team  ").unwrap();
        assert_eq!(read_namespace_file(file.path()).unwrap(), "ml-team");
    }

    #[test]
    fn empty_namespace_file_is_rejected() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let err = read_namespace_file(file.path()).unwrap_err();
        assert!(err.to_string().contains("is empty"));
    }

    #[test]
    fn missing_namespace_file_is_an_error() {
        let err = read_namespace_file(Path::new("/nonexistent/namespace")).unwrap_err();
        assert!(err.to_string().contains("failed to read"));
    }

    #[tokio::test]
    async fn missing_kubeconfig_fails_with_context() {
        let err = create_client(Some(Path::new("/nonexistent/kubeconfig")))
            .await
            .err()
            .expect("expected create_client to fail");
        assert!(err.to_string().contains("create_client"));
    }
}
