use anyhow::{Context, Result};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::process::Command;
use tracing::{debug, instrument};

use super::{
    AnalysisOutput, AnalysisRequest, DATASET_ENV, SandboxExecutor, Workspace,
    default_workspace_root, run_process,
};

const CONTAINER_WORKSPACE: &str = "/workspace";
const PIDS_LIMIT: u32 = 256;

#[derive(Debug, Clone)]
pub enum DockerRuntimeUser {
    CurrentUser,
    Explicit(String),
}

#[derive(Debug, Clone)]
pub struct DockerSandboxConfig {
    pub image: String,
    pub docker_binary: String,
    pub workspace_root: PathBuf,
    pub memory_limit: Option<String>,
    pub cpus: Option<String>,
    pub tmpfs_size: String,
    pub env: Vec<(String, String)>,
    pub python_binary: String,
    pub user: DockerRuntimeUser,
}

impl Default for DockerSandboxConfig {
    fn default() -> Self {
        Self {
            image: "cove-python-sandbox:latest".to_string(),
            docker_binary: "docker".to_string(),
            workspace_root: default_workspace_root(),
            memory_limit: Some("2g".to_string()),
            cpus: Some("2".to_string()),
            tmpfs_size: "512m".to_string(),
            env: vec![("MPLBACKEND".to_string(), "Agg".to_string())],
            python_binary: "python".to_string(),
            user: DockerRuntimeUser::CurrentUser,
        }
    }
}

/// Runs analysis code in a network-less, read-only container.
#[derive(Debug)]
pub struct DockerSandboxRunner {
    config: DockerSandboxConfig,
    uid_gid: Option<String>,
}

impl DockerSandboxRunner {
    pub fn new(config: DockerSandboxConfig) -> Result<Self> {
        std::fs::create_dir_all(&config.workspace_root).with_context(|| {
            format!(
                "failed to create workspace root {}",
                config.workspace_root.display()
            )
        })?;

        let uid_gid = match &config.user {
            DockerRuntimeUser::CurrentUser => current_uid_gid(),
            DockerRuntimeUser::Explicit(user) => Some(user.clone()),
        };

        Ok(Self { config, uid_gid })
    }
}

#[async_trait]
impl SandboxExecutor for DockerSandboxRunner {
    #[instrument(skip(self, request), fields(image = %self.config.image))]
    async fn execute(&self, request: AnalysisRequest) -> Result<AnalysisOutput> {
        let workspace = Workspace::prepare(&self.config.workspace_root, &request)?;
        let args = build_docker_args(&self.config, &workspace, self.uid_gid.as_deref());
        debug!(args = ?args, "prepared docker invocation");

        let mut cmd = Command::new(&self.config.docker_binary);
        cmd.args(&args);
        run_process(cmd, request.timeout, "docker").await
    }
}

fn container_path(rel: &Path) -> String {
    format!("{CONTAINER_WORKSPACE}/{}", rel.display())
}

/// Flat `docker run` argument list.
#[derive(Default)]
struct RunArgs(Vec<String>);

impl RunArgs {
    fn word(&mut self, word: impl Into<String>) -> &mut Self {
        self.0.push(word.into());
        self
    }

    fn flag(&mut self, name: &str, value: impl Into<String>) -> &mut Self {
        self.word(name).word(value)
    }
}

fn build_docker_args(
    config: &DockerSandboxConfig,
    workspace: &Workspace,
    uid_gid: Option<&str>,
) -> Vec<String> {
    let mut run = RunArgs::default();
    run.word("run").word("--rm").flag("--network", "none");

    // isolation
    run.flag("--security-opt", "no-new-privileges")
        .flag("--cap-drop", "ALL")
        .word("--read-only")
        .flag("--pids-limit", PIDS_LIMIT.to_string())
        .flag("--tmpfs", format!("/tmp:exec,mode=1777,size={}", config.tmpfs_size));
    if let Some(memory) = &config.memory_limit {
        run.flag("--memory", memory.as_str());
    }
    if let Some(cpus) = &config.cpus {
        run.flag("--cpus", cpus.as_str());
    }

    run.flag(
        "-v",
        format!("{}:{CONTAINER_WORKSPACE}:rw", workspace.dir().display()),
    )
    .flag("-w", CONTAINER_WORKSPACE);
    for (key, value) in &config.env {
        run.flag("--env", format!("{key}={value}"));
    }
    if let Some(dataset) = workspace.dataset() {
        run.flag("--env", format!("{DATASET_ENV}={}", container_path(dataset)));
    }
    if let Some(user) = uid_gid {
        run.flag("--user", user);
    }

    run.word(config.image.as_str())
        .word(config.python_binary.as_str())
        .word(container_path(workspace.script()));
    run.0
}

fn current_uid_gid() -> Option<String> {
    #[cfg(unix)]
    unsafe {
        Some(format!("{}:{}", libc::geteuid(), libc::getegid()))
    }
    #[cfg(not(unix))]
    {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::DatasetHandle;

    #[test]
    fn build_args_isolates_container_and_exports_dataset() {
        let root = tempfile::tempdir().unwrap();
        let source = root.path().join("channels.json");
        std::fs::write(&source, "[]").unwrap();
        let config = DockerSandboxConfig {
            image: "test-image:latest".to_string(),
            user: DockerRuntimeUser::Explicit("1000:1000".to_string()),
            workspace_root: root.path().join("runs"),
            ..DockerSandboxConfig::default()
        };
        let request =
            AnalysisRequest::new("print('hello')").with_dataset(Some(DatasetHandle::new(&source)));
        let workspace = Workspace::prepare(&config.workspace_root, &request).unwrap();

        let args = build_docker_args(&config, &workspace, Some("1000:1000"));

        assert!(args.contains(&"--read-only".to_string()));
        assert!(args.windows(2).any(|w| w == ["--network", "none"]));
        assert!(args.windows(2).any(|w| w == ["--user", "1000:1000"]));
        assert!(args.contains(&"COVE_DATASET=/workspace/data/channels.json".to_string()));
        assert!(args.ends_with(&[
            "test-image:latest".to_string(),
            "python".to_string(),
            "/workspace/analysis.py".to_string(),
        ]));
    }
}
