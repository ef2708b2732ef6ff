use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, RwLock};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::controller::EventBus;
use crate::shared::models::constants::CLOSE_GOING_AWAY;

/// Frames queued for a connection's writer task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    Text(String),
    Ping,
    Close { code: u16, reason: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelKind {
    Terminal,
    Watcher,
}

impl ChannelKind {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "terminal" => Some(ChannelKind::Terminal),
            "watcher" => Some(ChannelKind::Watcher),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ChannelKind::Terminal => "terminal",
            ChannelKind::Watcher => "watcher",
        }
    }
}

struct ConnectionRecord {
    project_id: String,
    kind: ChannelKind,
    tx: mpsc::UnboundedSender<Outbound>,
    alive: AtomicBool,
    closed: CancellationToken,
}

#[derive(Default)]
struct Indices {
    connections: HashMap<String, ConnectionRecord>,
    by_project: HashMap<String, HashSet<String>>,
}

impl Indices {
    /// Removing a record cancels its token, which ends the connection's tasks.
    fn remove(&mut self, connection_id: &str) -> Option<ConnectionRecord> {
        let record = self.connections.remove(connection_id)?;
        record.closed.cancel();
        if let Some(ids) = self.by_project.get_mut(&record.project_id) {
            ids.remove(connection_id);
            if ids.is_empty() {
                self.by_project.remove(&record.project_id);
            }
        }
        Some(record)
    }
}

pub struct Registration {
    pub connection_id: String,
    pub outbound: mpsc::UnboundedReceiver<Outbound>,
    /// Cancelled once the connection is removed, for whatever reason.
    pub closed: CancellationToken,
}

/// Single owner of live socket connections, indexed by id and by project.
#[derive(Default)]
pub struct ConnectionManager {
    inner: RwLock<Indices>,
}

impl ConnectionManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self, project_id: &str, kind: ChannelKind) -> Registration {
        let connection_id = Uuid::new_v4().to_string();
        let (tx, rx) = mpsc::unbounded_channel();
        let closed = CancellationToken::new();
        let mut inner = self.inner.write().await;
        inner.connections.insert(
            connection_id.clone(),
            ConnectionRecord {
                project_id: project_id.to_string(),
                kind,
                tx,
                alive: AtomicBool::new(true),
                closed: closed.clone(),
            },
        );
        inner
            .by_project
            .entry(project_id.to_string())
            .or_default()
            .insert(connection_id.clone());
        info!(
            "Registered {} connection {} for project {}",
            kind.as_str(),
            connection_id,
            project_id
        );
        Registration {
            connection_id,
            outbound: rx,
            closed,
        }
    }

    /// Dropping the record drops its sender, which ends the writer task.
    pub async fn deregister(&self, connection_id: &str) -> bool {
        let removed = self.inner.write().await.remove(connection_id);
        if let Some(record) = &removed {
            debug!(
                "Deregistered {} connection {}",
                record.kind.as_str(),
                connection_id
            );
        }
        removed.is_some()
    }

    pub async fn mark_alive(&self, connection_id: &str) {
        if let Some(record) = self.inner.read().await.connections.get(connection_id) {
            record.alive.store(true, Ordering::SeqCst);
        }
    }

    pub async fn send(&self, connection_id: &str, message: Outbound) -> bool {
        let delivered = match self.inner.read().await.connections.get(connection_id) {
            Some(record) => record.tx.send(message).is_ok(),
            None => return false,
        };
        if !delivered {
            self.deregister(connection_id).await;
        }
        delivered
    }

    /// Send to every connection of a project except `exclude`. Returns how
    /// many connections accepted the message.
    pub async fn broadcast(&self, project_id: &str, text: &str, exclude: Option<&str>) -> usize {
        let mut failed = Vec::new();
        let mut delivered = 0;
        {
            let inner = self.inner.read().await;
            let Some(ids) = inner.by_project.get(project_id) else {
                return 0;
            };
            for id in ids {
                if Some(id.as_str()) == exclude {
                    continue;
                }
                let Some(record) = inner.connections.get(id) else {
                    continue;
                };
                if record.tx.send(Outbound::Text(text.to_string())).is_ok() {
                    delivered += 1;
                } else {
                    failed.push(id.clone());
                }
            }
        }
        for id in failed {
            warn!("Broadcast to {} failed, dropping connection", id);
            self.deregister(&id).await;
        }
        delivered
    }

    /// One heartbeat round: connections that never answered the previous
    /// ping are closed and removed, the rest are pinged again.
    pub async fn health_check(&self) -> Vec<String> {
        let mut dead = Vec::new();
        {
            let inner = self.inner.read().await;
            for (id, record) in &inner.connections {
                if !record.alive.swap(false, Ordering::SeqCst) {
                    dead.push(id.clone());
                } else if record.tx.send(Outbound::Ping).is_err() {
                    dead.push(id.clone());
                }
            }
        }

        if !dead.is_empty() {
            let mut inner = self.inner.write().await;
            for id in &dead {
                if let Some(record) = inner.remove(id) {
                    warn!(
                        "Connection {} for project {} missed its ping, terminating",
                        id, record.project_id
                    );
                    let _ = record.tx.send(Outbound::Close {
                        code: CLOSE_GOING_AWAY,
                        reason: "ping timeout".to_string(),
                    });
                }
            }
        }
        dead
    }

    pub fn spawn_heartbeat(self: Arc<Self>, interval: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                self.health_check().await;
            }
        })
    }

    /// Forward every orchestration event to the sockets of its project.
    pub fn spawn_event_forwarder(self: Arc<Self>, events: &EventBus) -> JoinHandle<()> {
        let mut rx = events.subscribe();
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => match serde_json::to_string(&event) {
                        Ok(text) => {
                            self.broadcast(event.project_id(), &text, None).await;
                        }
                        Err(e) => warn!("Could not serialize {}: {}", event.name(), e),
                    },
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!("Event forwarder lagged, {} events dropped", skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }

    pub async fn project_connections(&self, project_id: &str) -> usize {
        self.inner
            .read()
            .await
            .by_project
            .get(project_id)
            .map(|ids| ids.len())
            .unwrap_or(0)
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.connections.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    use crate::shared::models::SandboxEvent;

    #[tokio::test]
    async fn test_unanswered_ping_terminates_connection() {
        let manager = ConnectionManager::new();
        let Registration {
            connection_id: id,
            outbound: mut rx,
            closed,
        } = manager.register("p1", ChannelKind::Terminal).await;

        assert!(manager.health_check().await.is_empty());
        assert_eq!(rx.recv().await, Some(Outbound::Ping));
        assert!(!closed.is_cancelled());

        let dead = manager.health_check().await;
        assert_eq!(dead, vec![id]);
        assert!(closed.is_cancelled());
        assert!(matches!(rx.recv().await, Some(Outbound::Close { code: 1001, .. })));
        assert_eq!(manager.project_connections("p1").await, 0);
        assert_eq!(rx.recv().await, None);
    }

    #[tokio::test]
    async fn test_deregister_and_failed_send_cancel_the_token() {
        let manager = ConnectionManager::new();
        let first = manager.register("p1", ChannelKind::Watcher).await;
        assert!(manager.deregister(&first.connection_id).await);
        assert!(first.closed.is_cancelled());
        assert!(!manager.send(&first.connection_id, Outbound::Ping).await);

        let second = manager.register("p1", ChannelKind::Terminal).await;
        drop(second.outbound);
        assert!(!manager.send(&second.connection_id, Outbound::Ping).await);
        assert!(second.closed.is_cancelled());
    }

    #[tokio::test]
    async fn test_pong_keeps_connection_alive() {
        let manager = ConnectionManager::new();
        let registration = manager.register("p1", ChannelKind::Watcher).await;
        for _ in 0..3 {
            assert!(manager.health_check().await.is_empty());
            manager.mark_alive(&registration.connection_id).await;
        }
        assert_eq!(manager.len().await, 1);
    }

    #[tokio::test]
    async fn test_broadcast_excludes_sender_and_drops_failures() {
        let manager = ConnectionManager::new();
        let mut a = manager.register("p1", ChannelKind::Watcher).await;
        let mut b = manager.register("p1", ChannelKind::Watcher).await;
        let c = manager.register("p1", ChannelKind::Terminal).await;
        let mut other = manager.register("p2", ChannelKind::Watcher).await;
        drop(c.outbound);

        let delivered = manager.broadcast("p1", "hello", Some(&a.connection_id)).await;
        assert_eq!(delivered, 1);
        assert_eq!(b.outbound.recv().await, Some(Outbound::Text("hello".to_string())));
        assert!(a.outbound.try_recv().is_err());
        assert!(other.outbound.try_recv().is_err());
        assert!(c.closed.is_cancelled());
        assert_eq!(manager.project_connections("p1").await, 2);
    }

    #[tokio::test]
    async fn test_events_reach_project_sockets() {
        let manager = Arc::new(ConnectionManager::new());
        let events = EventBus::new();
        let mut registration = manager.register("p1", ChannelKind::Terminal).await;
        let _forwarder = manager.clone().spawn_event_forwarder(&events);

        events.publish(SandboxEvent::ContainerStopped {
            project_id: "p1".to_string(),
            timestamp: Utc::now(),
        });
        let Some(Outbound::Text(text)) = registration.outbound.recv().await else {
            panic!("expected a text frame");
        };
        let value: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["type"], "container:stopped");
        assert_eq!(value["projectId"], "p1");
    }
}
