use std::sync::Arc;

use chrono::Utc;
use tracing::info;

use super::event_bus::EventBus;
use super::registry::ContainerRegistry;
use super::runtime::{ContainerRuntime, ExecRequest};
use crate::shared::models::constants::SANDBOX_USER;
use crate::shared::models::{ProcessRecord, SandboxError, SandboxEvent, SandboxResult};

/// Parse `ps aux` output, keeping the sandbox user's processes and dropping
/// the listing command itself.
pub fn parse_process_list(output: &str) -> Vec<ProcessRecord> {
    output
        .lines()
        .skip(1)
        .filter_map(|line| {
            let parts: Vec<&str> = line.split_whitespace().collect();
            if parts.len() < 11 {
                return None;
            }
            let pid = parts[1].parse::<u32>().ok()?;
            let command = parts[10..].join(" ");
            if parts[0] != SANDBOX_USER || command.contains("ps aux") {
                return None;
            }
            Some(ProcessRecord {
                pid,
                user: parts[0].to_string(),
                cpu: parts[2].to_string(),
                memory: parts[3].to_string(),
                command,
                status: "running",
            })
        })
        .collect()
}

pub struct ProcessInspector {
    runtime: Arc<dyn ContainerRuntime>,
    registry: Arc<ContainerRegistry>,
    events: EventBus,
}

impl ProcessInspector {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        registry: Arc<ContainerRegistry>,
        events: EventBus,
    ) -> Self {
        Self {
            runtime,
            registry,
            events,
        }
    }

    async fn container_for(&self, project_id: &str) -> SandboxResult<String> {
        self.registry
            .container_id(project_id)
            .await
            .ok_or_else(|| SandboxError::NotFound(format!("container for {}", project_id)))
    }

    pub async fn list(&self, project_id: &str) -> SandboxResult<Vec<ProcessRecord>> {
        let container_id = self.container_for(project_id).await?;
        let output = self
            .runtime
            .exec(&container_id, ExecRequest::new(["ps", "aux"]).user(SANDBOX_USER))
            .await?;
        Ok(parse_process_list(&output.stdout_lossy()))
    }

    /// SIGTERM only; a process that ignores it keeps running.
    pub async fn kill(&self, project_id: &str, pid: u32) -> SandboxResult<()> {
        let container_id = self.container_for(project_id).await?;
        let pid_arg = pid.to_string();
        let output = self
            .runtime
            .exec(
                &container_id,
                ExecRequest::new(["kill", "-TERM", pid_arg.as_str()]).user(SANDBOX_USER),
            )
            .await?;
        if !output.success() {
            return Err(SandboxError::NotFound(format!(
                "process {} in {}: {}",
                pid,
                project_id,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        info!("Sent SIGTERM to process {} in project {}", pid, project_id);
        self.events.publish(SandboxEvent::ProcessKilled {
            project_id: project_id.to_string(),
            pid,
            timestamp: Utc::now(),
        });
        Ok(())
    }
}
