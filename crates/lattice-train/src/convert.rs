//! Notebook to script conversion through `jupyter nbconvert`

use std::path::{Path, PathBuf};

use tokio::process::Command;
use tracing::info;

use crate::error::{Result, TrainError};

/// Converts a notebook into the training script the topology ships
#[derive(Clone, Debug)]
pub struct NotebookConverter {
    binary: String,
}

impl Default for NotebookConverter {
    fn default() -> Self {
        Self {
            binary: "jupyter".to_string(),
        }
    }
}

impl NotebookConverter {
    /// Use a specific `jupyter` binary
    pub fn with_binary(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    /// Arguments passed to the converter
    pub fn args(notebook: &Path, output: &Path) -> Vec<String> {
        vec![
            "nbconvert".to_string(),
            "--to".to_string(),
            "script".to_string(),
            notebook.display().to_string(),
            "--output".to_string(),
            output.display().to_string(),
        ]
    }

    /// Convert `notebook` to a script at `output`; a non-zero exit is fatal
    pub async fn convert(&self, notebook: &Path, output: &Path) -> Result<PathBuf> {
        info!(notebook = %notebook.display(), output = %output.display(), "converting notebook");
        let result = Command::new(&self.binary)
            .args(Self::args(notebook, output))
            .output()
            .await
            .map_err(|e| TrainError::Conversion {
                notebook: notebook.to_path_buf(),
                message: format!("failed to run {}: {}", self.binary, e),
                stdout: String::new(),
                stderr: String::new(),
            })?;

        if !result.status.success() {
            return Err(TrainError::Conversion {
                notebook: notebook.to_path_buf(),
                message: format!("nbconvert exited with {}", result.status),
                stdout: String::from_utf8_lossy(&result.stdout).into_owned(),
                stderr: String::from_utf8_lossy(&result.stderr).into_owned(),
            });
        }
        Ok(output.to_path_buf())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn args_target_script_output() {
        let args = NotebookConverter::args(Path::new("/app/mnist.ipynb"), Path::new("/tmp/code.py"));
        assert_eq!(
            args,
            vec!["nbconvert", "--to", "script", "/app/mnist.ipynb", "--output", "/tmp/code.py"]
        );
    }

    #[tokio::test]
    async fn missing_converter_is_conversion_error() {
        let converter = NotebookConverter::with_binary("/nonexistent/jupyter");
        let err = converter
            .convert(Path::new("nb.ipynb"), Path::new("/tmp/out.py"))
            .await
            .unwrap_err();
        assert!(matches!(err, TrainError::Conversion { .. }));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn non_zero_exit_is_conversion_error() {
        let converter = NotebookConverter::with_binary("false");
        let err = converter
            .convert(Path::new("nb.ipynb"), Path::new("/tmp/out.py"))
            .await
            .unwrap_err();
        match err {
            TrainError::Conversion { message, .. } => assert!(message.contains("exited")),
            other => panic!("expected conversion error, got {:?}", other),
        }
    }
}
