use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{error, info};

use super::provisioner::SandboxProvisioner;
use super::registry::ContainerRegistry;
use super::session_manager::TerminalSessionManager;
use crate::shared::SandboxConfig;

#[derive(Debug, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub stopped_containers: Vec<String>,
    pub closed_sessions: Vec<String>,
}

pub struct IdleReaper {
    registry: Arc<ContainerRegistry>,
    provisioner: Arc<SandboxProvisioner>,
    sessions: Arc<TerminalSessionManager>,
    interval: Duration,
    container_idle: chrono::Duration,
    session_orphan: chrono::Duration,
}

impl IdleReaper {
    pub fn new(
        registry: Arc<ContainerRegistry>,
        provisioner: Arc<SandboxProvisioner>,
        sessions: Arc<TerminalSessionManager>,
        config: &SandboxConfig,
    ) -> Self {
        Self {
            registry,
            provisioner,
            sessions,
            interval: Duration::from_secs(config.reaper.interval_secs),
            container_idle: chrono::Duration::seconds(config.reaper.container_idle_secs),
            session_orphan: chrono::Duration::seconds(config.reaper.session_orphan_secs),
        }
    }

    pub fn spawn(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                self.sweep(Utc::now()).await;
            }
        })
    }

    /// One pass: idle containers without sessions are stopped; sessions past
    /// the orphan threshold are closed wherever they live.
    pub async fn sweep(&self, now: DateTime<Utc>) -> SweepReport {
        let mut report = SweepReport::default();

        for container in self.registry.snapshot().await {
            for (session_id, entry) in &container.sessions {
                if now - entry.last_activity > self.session_orphan {
                    info!(
                        "Closing orphaned session {} in project {}",
                        session_id, container.project_id
                    );
                    self.sessions
                        .close_session(&container.project_id, session_id)
                        .await;
                    report.closed_sessions.push(session_id.clone());
                }
            }

            if container.sessions.is_empty() && now - container.last_activity > self.container_idle {
                info!(
                    "Stopping idle container for project {} (idle since {})",
                    container.project_id, container.last_activity
                );
                match self.provisioner.stop(&container.project_id).await {
                    Ok(_) => report.stopped_containers.push(container.project_id.clone()),
                    Err(e) => error!("Idle stop of {} failed: {}", container.project_id, e),
                }
            }
        }
        report
    }
}
