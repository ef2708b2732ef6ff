use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerState {
    Provisioning,
    Running,
    Stopping,
    Stopped,
}

impl ContainerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContainerState::Provisioning => "provisioning",
            ContainerState::Running => "running",
            ContainerState::Stopping => "stopping",
            ContainerState::Stopped => "stopped",
        }
    }
}

/// Public view of a registered sandbox container, returned by the control plane.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerSummary {
    pub project_id: String,
    pub container_id: String,
    pub name: String,
    pub state: ContainerState,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub sessions: usize,
    pub uptime_secs: i64,
    pub ssh_port: Option<u16>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SshInfo {
    pub host: String,
    pub port: u16,
    pub username: String,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MemoryUsage {
    pub usage_mb: u64,
    pub limit_mb: u64,
    pub percent: u64,
}

#[derive(Debug, Clone, Default, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NetworkTotals {
    pub rx_bytes: u64,
    pub tx_bytes: u64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerStats {
    pub cpu: f64,
    pub memory: MemoryUsage,
    pub network: NetworkTotals,
    pub sessions: usize,
}

/// A dev server port currently listening inside a sandbox.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ActivePort {
    pub container_port: u16,
    pub host_port: Option<u16>,
    pub url: Option<String>,
    pub status: &'static str,
}
