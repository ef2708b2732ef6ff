use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Result};
use serde::Deserialize;

const DEFAULT_PUBLIC_HOST: &str = "localhost";

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    pub server: ServerConfig,
    pub docker: DockerConfig,
    pub limits: LimitsConfig,
    pub workspace_root: PathBuf,
    pub ports: PortMonitorConfig,
    pub file_sync: FileSyncConfig,
    pub reaper: ReaperConfig,
    pub socket: SocketConfig,
    pub store: StoreConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Host name used when building preview URLs and SSH info.
    pub public_host: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DockerConfig {
    pub socket: String,
    pub image: String,
    pub api_timeout_secs: u64,
    pub exec_timeout_secs: u64,
    pub build_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    pub max_containers: usize,
    pub max_sessions_per_container: usize,
    pub memory_bytes: i64,
    pub cpu: f64,
    pub pids_limit: i64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PortMonitorConfig {
    pub monitored: Vec<u16>,
    pub check_interval_ms: u64,
    pub startup_grace_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FileSyncConfig {
    pub interval_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ReaperConfig {
    pub interval_secs: u64,
    pub container_idle_secs: i64,
    pub session_orphan_secs: i64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SocketConfig {
    pub ping_interval_secs: u64,
    pub banner_fallback_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub url: String,
    pub timeout_secs: u64,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            docker: DockerConfig::default(),
            limits: LimitsConfig::default(),
            workspace_root: PathBuf::from("/tmp"),
            ports: PortMonitorConfig::default(),
            file_sync: FileSyncConfig::default(),
            reaper: ReaperConfig::default(),
            socket: SocketConfig::default(),
            store: StoreConfig::default(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3001,
            public_host: DEFAULT_PUBLIC_HOST.to_string(),
        }
    }
}

impl Default for DockerConfig {
    fn default() -> Self {
        Self {
            socket: "/var/run/docker.sock".to_string(),
            image: "project-sandbox:latest".to_string(),
            api_timeout_secs: 30,
            exec_timeout_secs: 15,
            build_timeout_secs: 900,
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_containers: 10,
            max_sessions_per_container: 5,
            memory_bytes: 1024 * 1024 * 1024,
            cpu: 1.0,
            pids_limit: 512,
        }
    }
}

impl Default for PortMonitorConfig {
    fn default() -> Self {
        Self {
            monitored: vec![3000, 3001, 4000, 5000, 8000, 8080, 8888, 9000],
            check_interval_ms: 2000,
            startup_grace_ms: 3000,
        }
    }
}

impl Default for FileSyncConfig {
    fn default() -> Self {
        Self { interval_ms: 1000 }
    }
}

impl Default for ReaperConfig {
    fn default() -> Self {
        Self {
            interval_secs: 5 * 60,
            container_idle_secs: 30 * 60,
            session_orphan_secs: 60 * 60,
        }
    }
}

impl Default for SocketConfig {
    fn default() -> Self {
        Self {
            ping_interval_secs: 30,
            banner_fallback_ms: 2000,
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost:8000/api/store".to_string(),
            timeout_secs: 30,
        }
    }
}

impl SandboxConfig {
    pub fn load_from_path(path: &Path) -> Result<Self> {
        let data = fs::read_to_string(path)
            .map_err(|e| anyhow!("Failed to read config at {}: {}", path.display(), e))?;
        let config: SandboxConfig = serde_json::from_str(&data)
            .map_err(|e| anyhow!("Failed to parse config JSON at {}: {}", path.display(), e))?;
        Ok(config)
    }

    /// Load the config file if present, fall back to defaults otherwise, then
    /// apply environment overrides and validate.
    pub fn load(path: Option<PathBuf>) -> Result<(Self, Option<PathBuf>)> {
        let path = path.unwrap_or_else(resolve_config_path);
        let (mut config, loaded_from) = if path.exists() {
            (Self::load_from_path(&path)?, Some(path))
        } else {
            (Self::default(), None)
        };
        config.apply_env_overrides();
        config.normalize();
        config.validate()?;
        Ok((config, loaded_from))
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(image) = std::env::var("SANDBOX_IMAGE") {
            self.docker.image = image;
        }
        if let Some(cpu) = env_parse::<f64>("SANDBOX_CPU_LIMIT") {
            self.limits.cpu = cpu;
        }
        if let Some(memory) = env_parse::<i64>("SANDBOX_MEMORY_LIMIT") {
            self.limits.memory_bytes = memory;
        }
        if let Ok(host) = std::env::var("CODEPOD_HOST") {
            self.server.host = host;
        }
        if let Some(port) = env_parse::<u16>("CODEPOD_PORT") {
            self.server.port = port;
        }
        if let Ok(url) = std::env::var("PROJECT_STORE_URL") {
            self.store.url = url;
        }
    }

    fn normalize(&mut self) {
        self.server.public_host = self.server.public_host.trim().to_string();
        if self.server.public_host.is_empty() {
            self.server.public_host = DEFAULT_PUBLIC_HOST.to_string();
        }
        self.store.url = self.store.url.trim().trim_end_matches('/').to_string();
        self.ports.monitored.sort_unstable();
        self.ports.monitored.dedup();
    }

    pub fn validate(&self) -> Result<()> {
        if self.limits.max_containers == 0 {
            return Err(anyhow!("limits.max_containers must be at least 1"));
        }
        if self.limits.max_sessions_per_container == 0 {
            return Err(anyhow!("limits.max_sessions_per_container must be at least 1"));
        }
        if self.limits.cpu <= 0.0 {
            return Err(anyhow!("limits.cpu must be positive"));
        }
        if self.limits.memory_bytes <= 0 {
            return Err(anyhow!("limits.memory_bytes must be positive"));
        }
        if self.ports.monitored.is_empty() {
            return Err(anyhow!("ports.monitored must list at least one port"));
        }
        if self.ports.monitored.contains(&22) {
            return Err(anyhow!("ports.monitored must not include the SSH port"));
        }
        if self.ports.check_interval_ms == 0
            || self.file_sync.interval_ms == 0
            || self.reaper.interval_secs == 0
            || self.socket.ping_interval_secs == 0
        {
            return Err(anyhow!("polling intervals must be non-zero"));
        }
        if self.reaper.session_orphan_secs <= self.reaper.container_idle_secs {
            return Err(anyhow!(
                "reaper.session_orphan_secs must exceed reaper.container_idle_secs"
            ));
        }
        Ok(())
    }

    pub fn api_timeout(&self) -> Duration {
        Duration::from_secs(self.docker.api_timeout_secs)
    }

    pub fn exec_timeout(&self) -> Duration {
        Duration::from_secs(self.docker.exec_timeout_secs)
    }

    pub fn build_timeout(&self) -> Duration {
        Duration::from_secs(self.docker.build_timeout_secs)
    }

    pub fn workspace_path(&self, project_id: &str) -> PathBuf {
        self.workspace_root.join(format!("sandbox-{}", project_id))
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

pub fn resolve_config_path() -> PathBuf {
    if let Ok(path) = std::env::var("CODEPOD_CONFIG_PATH") {
        return expand_path(path);
    }

    default_config_path()
}

fn expand_path(input: String) -> PathBuf {
    if let Some(stripped) = input.strip_prefix("~/") {
        if let Some(home) = home_dir() {
            return home.join(stripped);
        }
    }
    PathBuf::from(input)
}

fn default_config_path() -> PathBuf {
    home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".codepod")
        .join("codepod.json")
}

fn home_dir() -> Option<PathBuf> {
    std::env::var_os("HOME").map(PathBuf::from)
}
