use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, RwLock};
use tracing::warn;

use super::session_manager::TerminalSession;
use crate::shared::models::state_helpers::can_transition_to;
use crate::shared::models::{ContainerState, ContainerSummary, SandboxError, SandboxResult};

#[derive(Clone)]
pub struct SessionEntry {
    pub session: Arc<TerminalSession>,
    pub last_activity: DateTime<Utc>,
}

#[derive(Clone)]
pub struct SandboxContainer {
    pub project_id: String,
    pub container_id: String,
    pub name: String,
    pub state: ContainerState,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub workspace: PathBuf,
    pub ssh_port: Option<u16>,
    pub sessions: HashMap<String, SessionEntry>,
}

impl SandboxContainer {
    pub fn summary(&self, now: DateTime<Utc>) -> ContainerSummary {
        ContainerSummary {
            project_id: self.project_id.clone(),
            container_id: self.container_id.clone(),
            name: self.name.clone(),
            state: self.state,
            created_at: self.created_at,
            last_activity: self.last_activity,
            sessions: self.sessions.len(),
            uptime_secs: (now - self.created_at).num_seconds().max(0),
            ssh_port: self.ssh_port,
        }
    }
}

/// A claimed slot toward the global container cap. Released on drop unless
/// consumed by [`ContainerRegistry::register`].
pub struct SlotReservation {
    reserved: Arc<AtomicUsize>,
}

impl Drop for SlotReservation {
    fn drop(&mut self) {
        self.reserved.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Owner of every container and session record, keyed by project.
pub struct ContainerRegistry {
    containers: RwLock<HashMap<String, SandboxContainer>>,
    reserved: Arc<AtomicUsize>,
    creation_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    max_containers: usize,
}

impl ContainerRegistry {
    pub fn new(max_containers: usize) -> Self {
        Self {
            containers: RwLock::new(HashMap::new()),
            reserved: Arc::new(AtomicUsize::new(0)),
            creation_locks: Mutex::new(HashMap::new()),
            max_containers,
        }
    }

    /// Per-project lock serializing container creation. Holding it marks a
    /// creation as in flight.
    pub async fn creation_lock(&self, project_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.creation_locks.lock().await;
        locks
            .entry(project_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Forget a project's creation lock once no caller holds it.
    pub async fn release_creation_lock(&self, project_id: &str) {
        let mut locks = self.creation_locks.lock().await;
        if locks
            .get(project_id)
            .is_some_and(|lock| Arc::strong_count(lock) == 1)
        {
            locks.remove(project_id);
        }
    }

    pub async fn reserve_slot(&self) -> SandboxResult<SlotReservation> {
        // Write lock so concurrent reservations see each other
        let containers = self.containers.write().await;
        let in_use = containers.len() + self.reserved.load(Ordering::SeqCst);
        if in_use >= self.max_containers {
            return Err(SandboxError::Capacity(format!(
                "Maximum containers reached ({})",
                self.max_containers
            )));
        }
        self.reserved.fetch_add(1, Ordering::SeqCst);
        Ok(SlotReservation {
            reserved: self.reserved.clone(),
        })
    }

    pub async fn register(&self, container: SandboxContainer, reservation: SlotReservation) {
        let mut containers = self.containers.write().await;
        containers.insert(container.project_id.clone(), container);
        drop(reservation);
    }

    pub async fn get(&self, project_id: &str) -> Option<SandboxContainer> {
        self.containers.read().await.get(project_id).cloned()
    }

    pub async fn container_id(&self, project_id: &str) -> Option<String> {
        self.containers
            .read()
            .await
            .get(project_id)
            .map(|c| c.container_id.clone())
    }

    pub async fn remove(&self, project_id: &str) -> Option<SandboxContainer> {
        self.containers.write().await.remove(project_id)
    }

    pub async fn set_ssh_port(&self, project_id: &str, port: Option<u16>) {
        if let Some(container) = self.containers.write().await.get_mut(project_id) {
            container.ssh_port = port;
        }
    }

    pub async fn touch(&self, project_id: &str) {
        if let Some(container) = self.containers.write().await.get_mut(project_id) {
            container.last_activity = Utc::now();
        }
    }

    /// Apply a lifecycle transition; illegal transitions are refused.
    pub async fn set_state(&self, project_id: &str, state: ContainerState) -> bool {
        let mut containers = self.containers.write().await;
        let Some(container) = containers.get_mut(project_id) else {
            return false;
        };
        if container.state == state {
            return true;
        }
        if !can_transition_to(container.state, state) {
            warn!(
                "Refusing {} -> {} for project {}",
                container.state.as_str(),
                state.as_str(),
                project_id
            );
            return false;
        }
        container.state = state;
        true
    }

    /// Attach a session, enforcing the per-container cap under the lock.
    pub async fn add_session(
        &self,
        project_id: &str,
        session: Arc<TerminalSession>,
        max_sessions: usize,
    ) -> SandboxResult<usize> {
        let mut containers = self.containers.write().await;
        let container = containers
            .get_mut(project_id)
            .ok_or_else(|| SandboxError::NotFound(format!("container for {}", project_id)))?;
        if container.sessions.len() >= max_sessions {
            return Err(SandboxError::Capacity(format!(
                "Maximum sessions reached ({})",
                max_sessions
            )));
        }
        let now = Utc::now();
        container.sessions.insert(
            session.session_id.clone(),
            SessionEntry {
                session,
                last_activity: now,
            },
        );
        container.last_activity = now;
        Ok(container.sessions.len())
    }

    pub async fn remove_session(
        &self,
        project_id: &str,
        session_id: &str,
    ) -> Option<Arc<TerminalSession>> {
        let mut containers = self.containers.write().await;
        let container = containers.get_mut(project_id)?;
        let entry = container.sessions.remove(session_id)?;
        container.last_activity = Utc::now();
        Some(entry.session)
    }

    pub async fn touch_session(&self, project_id: &str, session_id: &str) {
        let mut containers = self.containers.write().await;
        if let Some(container) = containers.get_mut(project_id) {
            let now = Utc::now();
            container.last_activity = now;
            if let Some(entry) = container.sessions.get_mut(session_id) {
                entry.last_activity = now;
            }
        }
    }

    pub async fn session(&self, project_id: &str, session_id: &str) -> Option<Arc<TerminalSession>> {
        self.containers
            .read()
            .await
            .get(project_id)
            .and_then(|c| c.sessions.get(session_id))
            .map(|e| e.session.clone())
    }

    pub async fn session_count(&self, project_id: &str) -> usize {
        self.containers
            .read()
            .await
            .get(project_id)
            .map(|c| c.sessions.len())
            .unwrap_or(0)
    }

    pub async fn snapshot(&self) -> Vec<SandboxContainer> {
        self.containers.read().await.values().cloned().collect()
    }

    pub async fn project_ids(&self) -> Vec<String> {
        self.containers.read().await.keys().cloned().collect()
    }

    pub async fn summaries(&self) -> Vec<ContainerSummary> {
        let now = Utc::now();
        let mut summaries: Vec<_> = self
            .containers
            .read()
            .await
            .values()
            .map(|c| c.summary(now))
            .collect();
        summaries.sort_by(|a, b| a.project_id.cmp(&b.project_id));
        summaries
    }

    pub async fn len(&self) -> usize {
        self.containers.read().await.len()
    }

    #[cfg(test)]
    pub async fn creation_lock_count(&self) -> usize {
        self.creation_locks.lock().await.len()
    }

    #[cfg(test)]
    pub async fn set_last_activity(&self, project_id: &str, at: DateTime<Utc>) {
        if let Some(container) = self.containers.write().await.get_mut(project_id) {
            container.last_activity = at;
        }
    }
}
