use once_cell::sync::Lazy;
use regex::Regex;
use thiserror::Error;

pub mod constants;
pub mod container;
pub mod events;
pub mod message;
pub mod process;
pub mod state_helpers;

pub use container::{
    ActivePort, ContainerState, ContainerStats, ContainerSummary, MemoryUsage, NetworkTotals,
    SshInfo,
};
pub use events::{EntryKind, FileChange, FileChanges, SandboxEvent};
pub use message::{ClientMessage, ServerMessage};
pub use process::ProcessRecord;

// Sandbox errors
#[derive(Error, Debug)]
pub enum SandboxError {
    #[error("Provisioning failed: {0}")]
    Provisioning(String),
    #[error("Capacity exceeded: {0}")]
    Capacity(String),
    #[error("Session stream error: {0}")]
    SessionStream(String),
    #[error("Port probe failed: {0}")]
    PortProbe(String),
    #[error("Reconciliation failed: {0}")]
    Reconciliation(String),
    #[error("Protocol error: {0}")]
    ConnectionProtocol(String),
    #[error("Transport error: {0}")]
    Transport(String),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Container runtime error: {0}")]
    Runtime(#[from] anyhow::Error),
}

impl SandboxError {
    /// Stable identifier sent to clients in `error` envelopes.
    pub fn code(&self) -> &'static str {
        match self {
            SandboxError::Provisioning(_) => "provisioning_failed",
            SandboxError::Capacity(_) => "capacity_exceeded",
            SandboxError::SessionStream(_) => "session_stream",
            SandboxError::PortProbe(_) => "port_probe",
            SandboxError::Reconciliation(_) => "reconciliation",
            SandboxError::ConnectionProtocol(_) => "protocol_error",
            SandboxError::Transport(_) => "transport",
            SandboxError::NotFound(_) => "not_found",
            SandboxError::Runtime(_) => "runtime_error",
        }
    }
}

pub type SandboxResult<T> = std::result::Result<T, SandboxError>;

static PROJECT_ID: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9_-]{0,63}$").unwrap());

/// Project ids become container names and workspace directories, so only a
/// narrow alphabet is accepted.
pub fn validate_project_id(project_id: &str) -> SandboxResult<()> {
    if PROJECT_ID.is_match(project_id) {
        Ok(())
    } else {
        Err(SandboxError::ConnectionProtocol(format!(
            "invalid projectId {:?}",
            project_id
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_project_id_alphabet() {
        assert!(validate_project_id("my-app_2").is_ok());
        assert!(validate_project_id(&"a".repeat(64)).is_ok());
        assert!(validate_project_id(&"a".repeat(65)).is_err());
        assert!(validate_project_id("-leading").is_err());
        assert!(validate_project_id("../etc").is_err());
        assert!(validate_project_id("").is_err());
    }
}
