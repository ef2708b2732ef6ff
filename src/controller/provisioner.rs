use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use super::event_bus::EventBus;
use super::file_sync::FileSyncReconciler;
use super::port_monitor::PortMonitor;
use super::registry::{ContainerRegistry, SandboxContainer, SlotReservation};
use super::runtime::{ContainerRuntime, ContainerSpec, StatsSample};
use super::workspace::{self, workspace_path};
use crate::shared::models::constants::{
    CONTAINER_NAME_PREFIX, LABEL_CREATED_BY, LABEL_PROJECT_ID, LABEL_SERVICE, SANDBOX_HOME,
    SANDBOX_HOSTNAME, SANDBOX_USER, SSH_CONTAINER_PORT,
};
use crate::shared::models::{
    ContainerState, ContainerStats, ContainerSummary, EntryKind, MemoryUsage, NetworkTotals,
    SandboxError, SandboxEvent, SandboxResult, SshInfo,
};
use crate::shared::store::{ProjectStore, TreeNode};
use crate::shared::SandboxConfig;

pub const SANDBOX_DOCKERFILE: &str = include_str!("assets/sandbox.Dockerfile");

const SSH_CHECK_DELAY: Duration = Duration::from_secs(5);
const SSH_FAILURE_LOG_LINES: usize = 20;

pub fn compute_stats(sample: &StatsSample, sessions: usize) -> ContainerStats {
    let cpu_delta = sample.cpu_total.saturating_sub(sample.precpu_total) as f64;
    let system_delta = sample.system_total.saturating_sub(sample.presystem_total) as f64;
    let cpu = if system_delta > 0.0 {
        let percent = cpu_delta / system_delta * sample.online_cpus.max(1) as f64 * 100.0;
        (percent * 100.0).round() / 100.0
    } else {
        0.0
    };

    const MIB: f64 = 1024.0 * 1024.0;
    let percent = if sample.memory_limit > 0 {
        (sample.memory_usage as f64 / sample.memory_limit as f64 * 100.0).round() as u64
    } else {
        0
    };

    ContainerStats {
        cpu,
        memory: MemoryUsage {
            usage_mb: (sample.memory_usage as f64 / MIB).round() as u64,
            limit_mb: (sample.memory_limit as f64 / MIB).round() as u64,
            percent,
        },
        network: NetworkTotals {
            rx_bytes: sample.rx_bytes,
            tx_bytes: sample.tx_bytes,
        },
        sessions,
    }
}

fn provisioning(context: &str, err: impl std::fmt::Display) -> SandboxError {
    SandboxError::Provisioning(format!("{}: {}", context, err))
}

/// Creates, reuses and tears down one sandbox container per project.
pub struct SandboxProvisioner {
    runtime: Arc<dyn ContainerRuntime>,
    registry: Arc<ContainerRegistry>,
    store: Arc<dyn ProjectStore>,
    events: EventBus,
    config: Arc<SandboxConfig>,
    port_monitor: Arc<PortMonitor>,
    file_sync: Arc<FileSyncReconciler>,
    pending_watchers: Mutex<HashMap<String, JoinHandle<()>>>,
}

impl SandboxProvisioner {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        registry: Arc<ContainerRegistry>,
        store: Arc<dyn ProjectStore>,
        events: EventBus,
        config: Arc<SandboxConfig>,
        port_monitor: Arc<PortMonitor>,
        file_sync: Arc<FileSyncReconciler>,
    ) -> Self {
        Self {
            runtime,
            registry,
            store,
            events,
            config,
            port_monitor,
            file_sync,
            pending_watchers: Mutex::new(HashMap::new()),
        }
    }

    pub fn container_name(project_id: &str) -> String {
        format!("{}{}", CONTAINER_NAME_PREFIX, project_id)
    }

    /// Build the sandbox image unless it already exists. Failure here is fatal
    /// to startup.
    pub async fn ensure_image(&self) -> SandboxResult<()> {
        let image = &self.config.docker.image;
        if self
            .runtime
            .image_exists(image)
            .await
            .map_err(|e| provisioning("image check", e))?
        {
            info!("Sandbox image {} present", image);
            return Ok(());
        }
        info!("Sandbox image {} missing, building", image);
        self.runtime
            .build_image(image, SANDBOX_DOCKERFILE)
            .await
            .map_err(|e| provisioning("image build", e))
    }

    pub async fn create_or_reuse(self: &Arc<Self>, project_id: &str) -> SandboxResult<SandboxContainer> {
        let lock = self.registry.creation_lock(project_id).await;
        let result = {
            let _creating = lock.lock().await;
            self.create_or_reuse_locked(project_id).await
        };
        drop(lock);
        self.registry.release_creation_lock(project_id).await;
        result
    }

    async fn create_or_reuse_locked(self: &Arc<Self>, project_id: &str) -> SandboxResult<SandboxContainer> {
        if let Some(existing) = self.registry.get(project_id).await {
            match self.runtime.inspect_container(&existing.container_id).await? {
                Some(inspect) if inspect.running => {
                    self.registry.touch(project_id).await;
                    return self.registered(project_id).await;
                }
                Some(_) => {
                    info!("Restarting stopped container for project {}", project_id);
                    self.runtime
                        .start_container(&existing.container_id)
                        .await
                        .map_err(|e| provisioning("restart", e))?;
                    self.registry.set_state(project_id, ContainerState::Running).await;
                    self.registry.touch(project_id).await;
                    if !self.port_monitor.is_running(project_id).await {
                        self.schedule_watchers(project_id, &existing.container_id).await;
                    }
                    return self.registered(project_id).await;
                }
                None => {
                    warn!(
                        "Container {} for project {} vanished, provisioning fresh",
                        existing.container_id, project_id
                    );
                    self.stop_watchers(project_id).await;
                    for entry in existing.sessions.values() {
                        entry.session.kill().await;
                    }
                    self.registry.remove(project_id).await;
                }
            }
        }

        let reservation = self.registry.reserve_slot().await?;
        self.provision(project_id, reservation).await
    }

    async fn registered(&self, project_id: &str) -> SandboxResult<SandboxContainer> {
        self.registry
            .get(project_id)
            .await
            .ok_or_else(|| SandboxError::NotFound(format!("container for {}", project_id)))
    }

    async fn provision(
        self: &Arc<Self>,
        project_id: &str,
        reservation: SlotReservation,
    ) -> SandboxResult<SandboxContainer> {
        let name = Self::container_name(project_id);
        info!("Provisioning container {} for project {}", name, project_id);

        // A leftover from a previous run would block the name
        self.runtime
            .remove_container(&name)
            .await
            .map_err(|e| provisioning("stale container cleanup", e))?;

        // Seeding writes on the host. A workspace left by an earlier run may
        // hold links its sandbox planted, so start from an empty directory.
        let workspace = self.config.workspace_path(project_id);
        remove_workspace(&workspace).await;
        self.prepare_workspace(&workspace).await?;
        self.seed_workspace(project_id, &workspace).await;

        let spec = self.container_spec(project_id, &workspace);
        let container_id = match self.runtime.create_container(&spec).await {
            Ok(id) => id,
            Err(e) => {
                remove_workspace(&workspace).await;
                return Err(provisioning("create", e));
            }
        };

        let now = Utc::now();
        self.registry
            .register(
                SandboxContainer {
                    project_id: project_id.to_string(),
                    container_id: container_id.clone(),
                    name,
                    state: ContainerState::Provisioning,
                    created_at: now,
                    last_activity: now,
                    workspace: workspace.clone(),
                    ssh_port: None,
                    sessions: HashMap::new(),
                },
                reservation,
            )
            .await;

        if let Err(e) = self.runtime.start_container(&container_id).await {
            self.registry.remove(project_id).await;
            let _ = self.runtime.remove_container(&container_id).await;
            remove_workspace(&workspace).await;
            return Err(provisioning("start", e));
        }

        let ssh_port = match self.runtime.inspect_container(&container_id).await {
            Ok(Some(inspect)) => inspect.ports.get(&SSH_CONTAINER_PORT).copied(),
            Ok(None) => None,
            Err(e) => {
                warn!("Could not inspect {} for SSH port: {}", container_id, e);
                None
            }
        };
        self.registry.set_ssh_port(project_id, ssh_port).await;
        self.registry.set_state(project_id, ContainerState::Running).await;
        let record = self.registered(project_id).await?;

        self.events.publish(SandboxEvent::ContainerCreated {
            project_id: project_id.to_string(),
            container_id: container_id.clone(),
            timestamp: now,
        });
        info!(
            "Container {} running for project {} (ssh port {:?})",
            container_id, project_id, ssh_port
        );

        self.schedule_watchers(project_id, &container_id).await;
        if let Some(port) = ssh_port {
            self.schedule_ssh_check(project_id, &container_id, port);
        }
        Ok(record)
    }

    async fn prepare_workspace(&self, workspace: &Path) -> SandboxResult<()> {
        tokio::fs::create_dir_all(workspace)
            .await
            .map_err(|e| provisioning("workspace", e))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            // The sandbox user does not share a uid with this process
            tokio::fs::set_permissions(workspace, std::fs::Permissions::from_mode(0o777))
                .await
                .map_err(|e| provisioning("workspace permissions", e))?;
        }
        Ok(())
    }

    /// Copy the stored project into the workspace depth-first, folders
    /// before their contents. Entries that fail are skipped.
    async fn seed_workspace(&self, project_id: &str, workspace: &Path) {
        let tree = match self.store.list_tree(project_id).await {
            Ok(tree) => tree,
            Err(e) => {
                warn!("Could not list project {} for seeding: {}", project_id, e);
                return;
            }
        };

        let mut pending: Vec<TreeNode> = tree.into_iter().rev().collect();
        let mut files = 0usize;
        while let Some(node) = pending.pop() {
            match self.seed_entry(project_id, workspace, &node).await {
                Ok(written) => files += usize::from(written),
                Err(e) => {
                    warn!("Skipping {} while seeding {}: {}", node.path, project_id, e);
                    continue;
                }
            }
            pending.extend(node.children.into_iter().rev());
        }
        info!("Seeded {} files into workspace for project {}", files, project_id);
    }

    /// Returns whether a file was written.
    async fn seed_entry(&self, project_id: &str, workspace: &Path, node: &TreeNode) -> SandboxResult<bool> {
        let target = workspace_path(workspace, &node.path).ok_or_else(|| {
            SandboxError::Provisioning(format!("unsafe path {:?}", node.path))
        })?;
        let io = |e: std::io::Error| provisioning(&target.display().to_string(), e);
        match node.kind {
            EntryKind::Folder => {
                tokio::fs::create_dir_all(&target).await.map_err(io)?;
                Ok(false)
            }
            EntryKind::File => {
                let content = self.store.read(project_id, &node.path).await?;
                if let Some(parent) = target.parent() {
                    tokio::fs::create_dir_all(parent).await.map_err(io)?;
                }
                tokio::fs::write(&target, content).await.map_err(io)?;
                Ok(true)
            }
        }
    }

    fn container_spec(&self, project_id: &str, workspace: &Path) -> ContainerSpec {
        let labels = HashMap::from([
            (LABEL_PROJECT_ID.to_string(), project_id.to_string()),
            (LABEL_SERVICE.to_string(), "sandbox".to_string()),
            (LABEL_CREATED_BY.to_string(), "container-service".to_string()),
        ]);
        let env = vec![
            "TERM=xterm-256color".to_string(),
            "NODE_ENV=development".to_string(),
            format!("PROJECT_ID={}", project_id),
            "SHELL=/bin/bash".to_string(),
            format!("HOME={}", SANDBOX_HOME),
            format!("USER={}", SANDBOX_USER),
        ];
        let mut published_ports = vec![SSH_CONTAINER_PORT];
        published_ports.extend(self.port_monitor.candidates());

        ContainerSpec {
            name: Self::container_name(project_id),
            image: self.config.docker.image.clone(),
            hostname: SANDBOX_HOSTNAME.to_string(),
            env,
            labels,
            workspace: workspace.to_path_buf(),
            published_ports,
            memory_bytes: self.config.limits.memory_bytes,
            cpu_shares: (self.config.limits.cpu * 1024.0).round() as i64,
            pids_limit: self.config.limits.pids_limit,
        }
    }

    /// Start the port monitor and file sync after the startup grace period,
    /// provided the same container is still registered.
    async fn schedule_watchers(self: &Arc<Self>, project_id: &str, container_id: &str) {
        let provisioner = Arc::clone(self);
        let project = project_id.to_string();
        let container = container_id.to_string();
        let grace = Duration::from_millis(self.config.ports.startup_grace_ms);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            if provisioner.registry.container_id(&project).await.as_deref() != Some(&container) {
                return;
            }
            provisioner.port_monitor.start(&project, &container).await;
            provisioner.file_sync.start(&project, &container).await;
        });
        if let Some(previous) = self
            .pending_watchers
            .lock()
            .await
            .insert(project_id.to_string(), handle)
        {
            previous.abort();
        }
    }

    async fn stop_watchers(&self, project_id: &str) {
        if let Some(pending) = self.pending_watchers.lock().await.remove(project_id) {
            pending.abort();
        }
        self.port_monitor.stop(project_id).await;
        self.file_sync.stop(project_id).await;
    }

    fn schedule_ssh_check(&self, project_id: &str, container_id: &str, host_port: u16) {
        let runtime = self.runtime.clone();
        let project = project_id.to_string();
        let container = container_id.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(SSH_CHECK_DELAY).await;
            let connect = tokio::net::TcpStream::connect(("127.0.0.1", host_port));
            match tokio::time::timeout(Duration::from_secs(3), connect).await {
                Ok(Ok(_)) => info!("SSH reachable for project {} on port {}", project, host_port),
                _ => {
                    warn!("SSH not reachable for project {} on port {}", project, host_port);
                    match runtime.logs_tail(&container, SSH_FAILURE_LOG_LINES).await {
                        Ok(lines) => {
                            for line in lines {
                                warn!("[{}] {}", project, line);
                            }
                        }
                        Err(e) => warn!("Could not read logs for {}: {}", container, e),
                    }
                }
            }
        });
    }

    /// Tear down everything for a project. Returns false when nothing was
    /// registered.
    pub async fn stop(&self, project_id: &str) -> SandboxResult<bool> {
        let lock = self.registry.creation_lock(project_id).await;
        let stopped = {
            let _guard = lock.lock().await;
            self.stop_locked(project_id).await
        };
        drop(lock);
        self.registry.release_creation_lock(project_id).await;
        stopped
    }

    async fn stop_locked(&self, project_id: &str) -> SandboxResult<bool> {
        let Some(container) = self.registry.get(project_id).await else {
            return Ok(false);
        };
        info!("Stopping container {} for project {}", container.name, project_id);
        self.registry.set_state(project_id, ContainerState::Stopping).await;
        self.stop_watchers(project_id).await;

        for session_id in container.sessions.keys() {
            if let Some(session) = self.registry.remove_session(project_id, session_id).await {
                session.kill().await;
            }
        }

        if let Err(e) = self.runtime.stop_container(&container.container_id).await {
            warn!("Stop of {} failed, forcing removal: {}", container.container_id, e);
        }
        if let Err(e) = self.runtime.remove_container(&container.container_id).await {
            error!("Failed to remove container {}: {}", container.container_id, e);
        }
        remove_workspace(&container.workspace).await;

        self.registry.set_state(project_id, ContainerState::Stopped).await;
        self.registry.remove(project_id).await;
        self.events.publish(SandboxEvent::ContainerStopped {
            project_id: project_id.to_string(),
            timestamp: Utc::now(),
        });
        info!("Container for project {} stopped", project_id);
        Ok(true)
    }

    /// Stop every registered container concurrently.
    pub async fn shutdown(&self) {
        let projects = self.registry.project_ids().await;
        info!("Stopping {} containers", projects.len());
        let stops = projects.iter().map(|project_id| async move {
            if let Err(e) = self.stop(project_id).await {
                error!("Error stopping container {}: {}", project_id, e);
            }
        });
        futures::future::join_all(stops).await;
    }

    pub async fn status(&self, project_id: &str) -> Option<ContainerSummary> {
        self.registry
            .get(project_id)
            .await
            .map(|c| c.summary(Utc::now()))
    }

    pub async fn stats(&self, project_id: &str) -> SandboxResult<ContainerStats> {
        let container = self.registered(project_id).await?;
        let sample = self.runtime.stats(&container.container_id).await?;
        Ok(compute_stats(&sample, container.sessions.len()))
    }

    pub async fn ssh_info(&self, project_id: &str) -> SandboxResult<SshInfo> {
        let container = self.registered(project_id).await?;
        let port = container
            .ssh_port
            .ok_or_else(|| SandboxError::NotFound(format!("SSH port for {}", project_id)))?;
        Ok(SshInfo {
            host: self.config.server.public_host.clone(),
            port,
            username: SANDBOX_USER.to_string(),
        })
    }

    /// Write client-supplied content into a running sandbox's workspace.
    pub async fn write_workspace_file(
        &self,
        project_id: &str,
        relative: &str,
        content: &[u8],
    ) -> SandboxResult<()> {
        let container = self.registered(project_id).await?;
        workspace::write_file(self.runtime.as_ref(), &container.container_id, relative, content).await?;
        self.registry.touch(project_id).await;
        Ok(())
    }
}

async fn remove_workspace(workspace: &Path) {
    match tokio::fs::remove_dir_all(workspace).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!("Failed to remove workspace {}: {}", workspace.display(), e),
    }
}
