pub mod demux;
pub mod docker_manager;
pub mod event_bus;
pub mod file_sync;
pub mod idle_reaper;
pub mod port_monitor;
pub mod process_inspector;
pub mod provisioner;
pub mod registry;
pub mod runtime;
pub mod session_manager;
pub mod workspace;

#[cfg(test)]
pub mod testing;

use std::sync::Arc;

use crate::shared::store::ProjectStore;
use crate::shared::SandboxConfig;

pub use docker_manager::DockerRuntime;
pub use event_bus::EventBus;
pub use runtime::ContainerRuntime;

/// Every orchestration component, wired once at startup and shared by the
/// HTTP and socket layers.
#[derive(Clone)]
pub struct SandboxServices {
    pub config: Arc<SandboxConfig>,
    pub events: EventBus,
    pub registry: Arc<registry::ContainerRegistry>,
    pub port_monitor: Arc<port_monitor::PortMonitor>,
    pub provisioner: Arc<provisioner::SandboxProvisioner>,
    pub sessions: Arc<session_manager::TerminalSessionManager>,
    pub processes: Arc<process_inspector::ProcessInspector>,
    pub reaper: Arc<idle_reaper::IdleReaper>,
}

impl SandboxServices {
    pub fn new(
        config: Arc<SandboxConfig>,
        runtime: Arc<dyn ContainerRuntime>,
        store: Arc<dyn ProjectStore>,
    ) -> Self {
        let events = EventBus::new();
        let registry = Arc::new(registry::ContainerRegistry::new(config.limits.max_containers));
        let port_monitor = Arc::new(port_monitor::PortMonitor::new(
            runtime.clone(),
            events.clone(),
            &config,
        ));
        let file_sync = Arc::new(file_sync::FileSyncReconciler::new(
            runtime.clone(),
            store.clone(),
            events.clone(),
            &config,
        ));
        let provisioner = Arc::new(provisioner::SandboxProvisioner::new(
            runtime.clone(),
            registry.clone(),
            store,
            events.clone(),
            config.clone(),
            port_monitor.clone(),
            file_sync,
        ));
        let sessions = Arc::new(session_manager::TerminalSessionManager::new(
            provisioner.clone(),
            registry.clone(),
            runtime.clone(),
            config.limits.max_sessions_per_container,
        ));
        let processes = Arc::new(process_inspector::ProcessInspector::new(
            runtime,
            registry.clone(),
            events.clone(),
        ));
        let reaper = Arc::new(idle_reaper::IdleReaper::new(
            registry.clone(),
            provisioner.clone(),
            sessions.clone(),
            &config,
        ));

        Self {
            config,
            events,
            registry,
            port_monitor,
            provisioner,
            sessions,
            processes,
            reaper,
        }
    }
}
