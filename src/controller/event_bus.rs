use tokio::sync::broadcast;
use tracing::trace;

use crate::shared::models::SandboxEvent;

const EVENT_CAPACITY: usize = 1024;

/// Typed fan-out of orchestration events to the connection layer.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<SandboxEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CAPACITY);
        Self { tx }
    }

    pub fn publish(&self, event: SandboxEvent) {
        trace!("event {} for {}", event.name(), event.project_id());
        // No subscribers is fine; nobody is watching yet
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SandboxEvent> {
        self.tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[tokio::test]
    async fn test_subscribers_receive_in_order() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        bus.publish(SandboxEvent::PortStopped {
            project_id: "p1".into(),
            container_port: 3000,
            timestamp: Utc::now(),
        });
        bus.publish(SandboxEvent::ProcessKilled {
            project_id: "p1".into(),
            pid: 42,
            timestamp: Utc::now(),
        });
        assert_eq!(rx.recv().await.unwrap().name(), "port:stopped");
        assert_eq!(rx.recv().await.unwrap().name(), "process:killed");
    }

    #[test]
    fn test_publish_without_subscribers() {
        EventBus::new().publish(SandboxEvent::ContainerStopped {
            project_id: "p1".into(),
            timestamp: Utc::now(),
        });
    }
}
