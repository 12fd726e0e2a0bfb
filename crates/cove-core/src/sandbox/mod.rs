//! Isolated execution of analysis code produced during verification.
//!
//! Every run gets a fresh workspace directory holding the script and a copy of
//! the reference dataset. The dataset location is exported as `COVE_DATASET`.

pub mod docker;
pub mod local;

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use std::path::{Component, Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::time;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::{SandboxBackend, SandboxConfig};
use crate::dataset::DatasetHandle;
use crate::error::CoveError;

pub use docker::{DockerSandboxConfig, DockerSandboxRunner};
pub use local::LocalPythonRunner;

pub const DATASET_ENV: &str = "COVE_DATASET";
const SCRIPT_NAME: &str = "analysis.py";
const DATA_DIR: &str = "data";

#[derive(Debug, Clone)]
pub struct AnalysisRequest {
    pub code: String,
    pub dataset: Option<DatasetHandle>,
    pub timeout: Duration,
}

impl AnalysisRequest {
    pub fn new(code: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            dataset: None,
            timeout: Duration::from_secs(60),
        }
    }

    pub fn with_dataset(mut self, dataset: Option<DatasetHandle>) -> Self {
        self.dataset = dataset;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn validate(&self) -> Result<()> {
        if self.code.trim().is_empty() {
            return Err(anyhow!("analysis code must not be empty"));
        }
        if let Some(dataset) = &self.dataset {
            ensure_relpath(&dataset.name)
                .with_context(|| format!("dataset name '{}' must be relative", dataset.name))?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct AnalysisOutput {
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
    pub duration: Duration,
}

impl AnalysisOutput {
    pub fn success(&self) -> bool {
        !self.timed_out && self.exit_code == Some(0)
    }

    /// Text fed back to the model, capped at `limit` characters per stream.
    pub fn observation(&self, limit: usize) -> String {
        let mut out = String::new();
        if self.timed_out {
            out.push_str(&format!(
                "Execution timed out after {:.1}s.\n",
                self.duration.as_secs_f64()
            ));
        }
        let stdout = self.stdout.trim();
        if !stdout.is_empty() {
            out.push_str(&truncate(stdout, limit));
            out.push('\n');
        }
        let stderr = self.stderr.trim();
        if !stderr.is_empty() {
            out.push_str("stderr:\n");
            out.push_str(&truncate(stderr, limit));
            out.push('\n');
        }
        if !self.success() && !self.timed_out {
            out.push_str(&format!(
                "exit code: {}\n",
                self.exit_code
                    .map(|code| code.to_string())
                    .unwrap_or_else(|| "killed".to_string())
            ));
        }
        if out.is_empty() {
            out.push_str("(no output)");
        }
        out.trim_end().to_string()
    }
}

fn truncate(text: &str, limit: usize) -> String {
    if text.chars().count() <= limit {
        return text.to_string();
    }
    let kept: String = text.chars().take(limit).collect();
    format!("{kept}\n... [truncated]")
}

#[async_trait]
pub trait SandboxExecutor: Send + Sync {
    async fn execute(&self, request: AnalysisRequest) -> Result<AnalysisOutput>;
}

/// Build the configured backend.
pub fn build_executor(config: &SandboxConfig) -> Result<Arc<dyn SandboxExecutor>, CoveError> {
    let executor: Arc<dyn SandboxExecutor> = match config.backend {
        SandboxBackend::Local => Arc::new(LocalPythonRunner::new(
            config.python_binary.clone(),
            default_workspace_root(),
        )?),
        SandboxBackend::Docker => Arc::new(DockerSandboxRunner::new(DockerSandboxConfig {
            image: config.image.clone(),
            ..DockerSandboxConfig::default()
        })?),
    };
    Ok(executor)
}

pub(crate) fn default_workspace_root() -> PathBuf {
    std::env::temp_dir().join("cove_sandbox")
}

/// Per-run directory, removed on drop.
pub(crate) struct Workspace {
    dir: PathBuf,
    script: PathBuf,
    dataset: Option<PathBuf>,
}

impl Workspace {
    pub(crate) fn prepare(root: &Path, request: &AnalysisRequest) -> Result<Self> {
        request.validate()?;
        let dir = root.join(Uuid::new_v4().to_string());
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("failed to create sandbox workspace {}", dir.display()))?;
        let mut workspace = Self {
            script: PathBuf::from(SCRIPT_NAME),
            dataset: None,
            dir,
        };

        write_file(&workspace.dir, SCRIPT_NAME, request.code.as_bytes())?;
        if let Some(dataset) = &request.dataset {
            let rel = Path::new(DATA_DIR).join(&dataset.name);
            let target = workspace.dir.join(&rel);
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent).with_context(|| {
                    format!("failed to create parent directory {}", parent.display())
                })?;
            }
            std::fs::copy(&dataset.path, &target).with_context(|| {
                format!("failed to copy dataset {} into sandbox", dataset.path.display())
            })?;
            workspace.dataset = Some(rel);
        }
        Ok(workspace)
    }

    pub(crate) fn dir(&self) -> &Path {
        &self.dir
    }

    /// Script path relative to the workspace.
    pub(crate) fn script(&self) -> &Path {
        &self.script
    }

    /// Dataset path relative to the workspace.
    pub(crate) fn dataset(&self) -> Option<&Path> {
        self.dataset.as_deref()
    }
}

impl Drop for Workspace {
    fn drop(&mut self) {
        if self.dir.exists()
            && let Err(err) = std::fs::remove_dir_all(&self.dir)
        {
            warn!(
                path = %self.dir.display(),
                error = %err,
                "failed to clean sandbox workspace"
            );
        }
    }
}

static SANDBOX_FAILURE_STREAK: AtomicUsize = AtomicUsize::new(0);

/// Spawn `cmd`, drain both pipes, and kill it once `timeout` elapses.
pub(crate) async fn run_process(
    mut cmd: Command,
    timeout: Duration,
    backend: &'static str,
) -> Result<AnalysisOutput> {
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let start = Instant::now();
    let mut child = cmd
        .spawn()
        .with_context(|| format!("failed to spawn {backend} sandbox process"))?;
    let stdout_task = tokio::spawn(read_pipe(child.stdout.take()));
    let stderr_task = tokio::spawn(read_pipe(child.stderr.take()));

    let (timed_out, status): (bool, ExitStatus) = match time::timeout(timeout, child.wait()).await
    {
        Ok(wait_outcome) => (
            false,
            wait_outcome.context("failed to wait for sandbox process")?,
        ),
        Err(_elapsed) => {
            warn!(backend, "sandbox execution timed out; terminating process");
            if let Err(err) = child.kill().await {
                warn!(error = %err, "failed to kill sandbox process after timeout");
            }
            let status = child
                .wait()
                .await
                .context("failed to obtain exit status after timeout")?;
            (true, status)
        }
    };

    let stdout_bytes = stdout_task
        .await
        .context("failed to join stdout collection task")??;
    let stderr_bytes = stderr_task
        .await
        .context("failed to join stderr collection task")??;

    let output = AnalysisOutput {
        exit_code: status.code(),
        stdout: String::from_utf8_lossy(&stdout_bytes).into_owned(),
        stderr: String::from_utf8_lossy(&stderr_bytes).into_owned(),
        timed_out,
        duration: start.elapsed(),
    };
    record_outcome(backend, &output);
    Ok(output)
}

fn record_outcome(backend: &'static str, output: &AnalysisOutput) {
    let success = output.success();
    let failure_streak = if success {
        SANDBOX_FAILURE_STREAK.swap(0, Ordering::Relaxed);
        0
    } else {
        let streak = SANDBOX_FAILURE_STREAK.fetch_add(1, Ordering::Relaxed) + 1;
        if streak >= 5 {
            error!(streak, "sandbox consecutive failure streak exceeded threshold");
        }
        streak
    };

    let status_label = if output.timed_out {
        "timeout"
    } else if success {
        "success"
    } else {
        "failure"
    };

    info!(
        target: "telemetry.sandbox",
        backend,
        status = status_label,
        exit_code = output.exit_code,
        duration_ms = output.duration.as_millis() as u64,
        failure_streak,
        "sandbox execution finished"
    );
}

fn ensure_relpath(path: &str) -> Result<PathBuf> {
    let pb = PathBuf::from(path);
    if pb.is_absolute() {
        return Err(anyhow!("path may not be absolute"));
    }
    if pb.components().any(|c| matches!(c, Component::ParentDir)) {
        return Err(anyhow!("path may not contain parent components (..)"));
    }
    Ok(pb)
}

fn write_file(base: &Path, rel: &str, contents: &[u8]) -> Result<()> {
    let full = base.join(ensure_relpath(rel)?);
    if let Some(parent) = full.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create parent directory {}", parent.display()))?;
    }
    std::fs::write(&full, contents)
        .with_context(|| format!("failed to write file {}", full.display()))?;
    Ok(())
}

async fn read_pipe<R>(pipe: Option<R>) -> Result<Vec<u8>>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let mut buffer = Vec::new();
    if let Some(mut reader) = pipe {
        reader
            .read_to_end(&mut buffer)
            .await
            .context("failed to drain sandbox pipe")?;
    }
    Ok(buffer)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn observation_reports_streams_and_exit_code() {
        let output = AnalysisOutput {
            exit_code: Some(1),
            stdout: "rows: 12\n".into(),
            stderr: "KeyError: 'views'\n".into(),
            timed_out: false,
            duration: Duration::from_millis(40),
        };
        assert_eq!(
            output.observation(100),
            "rows: 12\nstderr:\nKeyError: 'views'\nexit code: 1"
        );
    }

    #[test]
    fn observation_truncates_long_output() {
        let output = AnalysisOutput {
            exit_code: Some(0),
            stdout: "x".repeat(50),
            stderr: String::new(),
            timed_out: false,
            duration: Duration::ZERO,
        };
        let text = output.observation(10);
        assert!(text.starts_with("xxxxxxxxxx\n"));
        assert!(text.ends_with("[truncated]"));
    }

    #[test]
    fn workspace_copies_dataset_and_cleans_up() {
        let root = tempfile::tempdir().unwrap();
        let source = root.path().join("reference.json");
        std::fs::write(&source, "{}").unwrap();
        let request = AnalysisRequest::new("print(1)")
            .with_dataset(Some(DatasetHandle::new(&source)));

        let dir = {
            let workspace = Workspace::prepare(&root.path().join("runs"), &request).unwrap();
            let dataset = workspace.dir().join(workspace.dataset().unwrap());
            assert_eq!(std::fs::read_to_string(dataset).unwrap(), "{}");
            assert!(workspace.dir().join(workspace.script()).exists());
            workspace.dir().to_path_buf()
        };
        assert!(!dir.exists());
    }

    #[test]
    fn empty_code_is_rejected() {
        let root = tempfile::tempdir().unwrap();
        assert!(Workspace::prepare(root.path(), &AnalysisRequest::new("  ")).is_err());
    }
}
