use anyhow::{Context, Result};
use async_trait::async_trait;
use std::path::PathBuf;
use tokio::process::Command;
use tracing::instrument;

use super::{AnalysisOutput, AnalysisRequest, DATASET_ENV, SandboxExecutor, Workspace, run_process};

/// Runs analysis code with a host interpreter inside a throwaway directory.
///
/// No isolation beyond the working directory; use the docker backend for untrusted runs.
#[derive(Debug, Clone)]
pub struct LocalPythonRunner {
    python_binary: String,
    workspace_root: PathBuf,
}

impl LocalPythonRunner {
    pub fn new(python_binary: impl Into<String>, workspace_root: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(&workspace_root).with_context(|| {
            format!("failed to create workspace root {}", workspace_root.display())
        })?;
        Ok(Self {
            python_binary: python_binary.into(),
            workspace_root,
        })
    }
}

#[async_trait]
impl SandboxExecutor for LocalPythonRunner {
    #[instrument(skip(self, request), fields(python = %self.python_binary))]
    async fn execute(&self, request: AnalysisRequest) -> Result<AnalysisOutput> {
        let workspace = Workspace::prepare(&self.workspace_root, &request)?;

        let mut cmd = Command::new(&self.python_binary);
        cmd.arg(workspace.script())
            .current_dir(workspace.dir())
            .env("MPLBACKEND", "Agg");
        if let Some(dataset) = workspace.dataset() {
            cmd.env(DATASET_ENV, workspace.dir().join(dataset));
        }

        run_process(cmd, request.timeout, "local").await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn missing_interpreter_is_an_error() {
        let root = tempfile::tempdir().unwrap();
        let runner =
            LocalPythonRunner::new("cove-no-such-python", root.path().to_path_buf()).unwrap();
        let result = runner
            .execute(AnalysisRequest::new("print(1)").with_timeout(Duration::from_secs(5)))
            .await;
        assert!(result.is_err());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn shell_interpreter_reports_output_and_dataset_path() {
        let root = tempfile::tempdir().unwrap();
        let source = root.path().join("ref.json");
        std::fs::write(&source, "{}").unwrap();
        let runner = LocalPythonRunner::new("sh", root.path().join("runs")).unwrap();
        let output = runner
            .execute(
                AnalysisRequest::new("echo \"$COVE_DATASET\"")
                    .with_dataset(Some(crate::dataset::DatasetHandle::new(&source))),
            )
            .await
            .unwrap();
        assert!(output.success());
        assert!(output.stdout.trim().ends_with("data/ref.json"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn long_runs_are_killed() {
        let root = tempfile::tempdir().unwrap();
        let runner = LocalPythonRunner::new("sh", root.path().to_path_buf()).unwrap();
        let output = runner
            .execute(AnalysisRequest::new("sleep 5").with_timeout(Duration::from_millis(100)))
            .await
            .unwrap();
        assert!(output.timed_out);
        assert!(!output.success());
    }
}
