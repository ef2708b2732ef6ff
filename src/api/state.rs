use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;

use crate::api::ws::connection_manager::ConnectionManager;
use crate::controller::SandboxServices;

/// Shared by every HTTP handler and socket task.
pub struct AppState {
    pub services: SandboxServices,
    pub connections: Arc<ConnectionManager>,
}

impl AppState {
    pub fn new(services: SandboxServices) -> Self {
        Self {
            services,
            connections: Arc::new(ConnectionManager::new()),
        }
    }

    /// Start the socket heartbeat and the event fan-out. Both run until the
    /// runtime shuts down.
    pub fn spawn_background(&self) -> Vec<JoinHandle<()>> {
        let ping = Duration::from_secs(self.services.config.socket.ping_interval_secs);
        vec![
            self.connections.clone().spawn_heartbeat(ping),
            self.connections
                .clone()
                .spawn_event_forwarder(&self.services.events),
        ]
    }
}
