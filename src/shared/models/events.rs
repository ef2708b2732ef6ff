use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    File,
    Folder,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileChange {
    pub path: String,
    #[serde(rename = "type")]
    pub kind: EntryKind,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FileChanges {
    pub added: Vec<FileChange>,
    pub modified: Vec<FileChange>,
    pub deleted: Vec<FileChange>,
}

impl FileChanges {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.modified.is_empty() && self.deleted.is_empty()
    }
}

/// Everything the orchestration layer announces to connected clients. The
/// serialized form is the wire envelope broadcast to a project's sockets.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum SandboxEvent {
    #[serde(rename = "container:created", rename_all = "camelCase")]
    ContainerCreated {
        project_id: String,
        container_id: String,
        timestamp: DateTime<Utc>,
    },
    #[serde(rename = "container:stopped", rename_all = "camelCase")]
    ContainerStopped {
        project_id: String,
        timestamp: DateTime<Utc>,
    },
    #[serde(rename = "port:detected", rename_all = "camelCase")]
    PortDetected {
        project_id: String,
        container_port: u16,
        host_port: Option<u16>,
        url: Option<String>,
        timestamp: DateTime<Utc>,
    },
    #[serde(rename = "port:stopped", rename_all = "camelCase")]
    PortStopped {
        project_id: String,
        container_port: u16,
        timestamp: DateTime<Utc>,
    },
    #[serde(rename = "files:changed", rename_all = "camelCase")]
    FilesChanged {
        project_id: String,
        changes: FileChanges,
        timestamp: DateTime<Utc>,
    },
    #[serde(rename = "process:killed", rename_all = "camelCase")]
    ProcessKilled {
        project_id: String,
        pid: u32,
        timestamp: DateTime<Utc>,
    },
}

impl SandboxEvent {
    pub fn project_id(&self) -> &str {
        match self {
            SandboxEvent::ContainerCreated { project_id, .. }
            | SandboxEvent::ContainerStopped { project_id, .. }
            | SandboxEvent::PortDetected { project_id, .. }
            | SandboxEvent::PortStopped { project_id, .. }
            | SandboxEvent::FilesChanged { project_id, .. }
            | SandboxEvent::ProcessKilled { project_id, .. } => project_id,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            SandboxEvent::ContainerCreated { .. } => "container:created",
            SandboxEvent::ContainerStopped { .. } => "container:stopped",
            SandboxEvent::PortDetected { .. } => "port:detected",
            SandboxEvent::PortStopped { .. } => "port:stopped",
            SandboxEvent::FilesChanged { .. } => "files:changed",
            SandboxEvent::ProcessKilled { .. } => "process:killed",
        }
    }
}
