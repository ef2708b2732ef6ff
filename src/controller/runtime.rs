use std::collections::HashMap;
use std::path::PathBuf;

use anyhow::Result;
use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};

/// Everything needed to create one sandbox container.
#[derive(Debug, Clone)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    pub hostname: String,
    pub env: Vec<String>,
    pub labels: HashMap<String, String>,
    pub workspace: PathBuf,
    /// Container ports published to OS-assigned host ports.
    pub published_ports: Vec<u16>,
    pub memory_bytes: i64,
    pub cpu_shares: i64,
    pub pids_limit: i64,
}

#[derive(Debug, Clone, Default)]
pub struct ExecRequest {
    pub cmd: Vec<String>,
    pub user: Option<String>,
    pub working_dir: Option<String>,
    pub env: Vec<String>,
    /// Written to the process's stdin, which is then closed.
    pub stdin: Option<Vec<u8>>,
}

impl ExecRequest {
    pub fn new<S: Into<String>>(cmd: impl IntoIterator<Item = S>) -> Self {
        Self {
            cmd: cmd.into_iter().map(Into::into).collect(),
            ..Default::default()
        }
    }

    pub fn shell(script: &str) -> Self {
        Self::new(["sh", "-c", script])
    }

    pub fn user(mut self, user: &str) -> Self {
        self.user = Some(user.to_string());
        self
    }

    pub fn working_dir(mut self, dir: &str) -> Self {
        self.working_dir = Some(dir.to_string());
        self
    }

    pub fn env(mut self, entry: impl Into<String>) -> Self {
        self.env.push(entry.into());
        self
    }

    pub fn stdin(mut self, data: &[u8]) -> Self {
        self.stdin = Some(data.to_vec());
        self
    }
}

#[derive(Debug, Clone, Default)]
pub struct ExecOutput {
    pub exit_code: i64,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    pub fn stdout_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }
}

#[derive(Debug, Clone, Default)]
pub struct ContainerInspect {
    pub id: String,
    pub running: bool,
    /// container port -> host port, for published tcp ports.
    pub ports: HashMap<u16, u16>,
}

/// Raw counters from a one-shot stats read.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StatsSample {
    pub cpu_total: u64,
    pub precpu_total: u64,
    pub system_total: u64,
    pub presystem_total: u64,
    pub online_cpus: u64,
    pub memory_usage: u64,
    pub memory_limit: u64,
    pub rx_bytes: u64,
    pub tx_bytes: u64,
}

/// Hijacked byte stream of an interactive exec. `output` carries whatever the
/// runtime writes, framed or raw; see `demux`.
pub struct ExecStream {
    pub exec_id: String,
    pub output: Box<dyn AsyncRead + Send + Unpin>,
    pub input: Box<dyn AsyncWrite + Send + Unpin>,
}

/// The container runtime operations the orchestration layer depends on.
/// Absent containers are `Ok(None)` from inspect and a no-op from stop/remove.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    async fn image_exists(&self, image: &str) -> Result<bool>;
    async fn build_image(&self, image: &str, dockerfile: &str) -> Result<()>;
    async fn create_container(&self, spec: &ContainerSpec) -> Result<String>;
    async fn start_container(&self, id: &str) -> Result<()>;
    async fn stop_container(&self, id: &str) -> Result<()>;
    async fn remove_container(&self, id: &str) -> Result<()>;
    async fn inspect_container(&self, id: &str) -> Result<Option<ContainerInspect>>;
    async fn exec(&self, id: &str, request: ExecRequest) -> Result<ExecOutput>;
    async fn exec_interactive(&self, id: &str, request: ExecRequest) -> Result<ExecStream>;
    async fn resize_exec(&self, exec_id: &str, cols: u16, rows: u16) -> Result<()>;
    async fn stats(&self, id: &str) -> Result<StatsSample>;
    async fn logs_tail(&self, id: &str, lines: usize) -> Result<Vec<String>>;
}
