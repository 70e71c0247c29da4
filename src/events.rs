//! Per-resource publish channel.
//!
//! Lifecycle operations publish log lines and state changes keyed by the
//! resource id. Publishing never fails: with no subscriber the event is
//! dropped.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde::Serialize;
use tokio::sync::broadcast;
use uuid::Uuid;

const CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ResourceEvent {
    Log { line: String },
    StateChanged { from: String, to: String },
    Failed { message: String },
}

#[derive(Clone, Default)]
pub struct EventBus {
    channels: Arc<Mutex<HashMap<Uuid, broadcast::Sender<ResourceEvent>>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, id: Uuid) -> broadcast::Receiver<ResourceEvent> {
        let mut channels = self.channels.lock().unwrap_or_else(|e| e.into_inner());
        channels
            .entry(id)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe()
    }

    pub fn publish(&self, id: Uuid, event: ResourceEvent) {
        let mut channels = self.channels.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(sender) = channels.get(&id) {
            if sender.send(event).is_err() {
                // every receiver is gone
                channels.remove(&id);
            }
        }
    }

    pub fn log(&self, id: Uuid, line: impl Into<String>) {
        let line = line.into();
        tracing::info!(resource = %id, "{}", line);
        self.publish(id, ResourceEvent::Log { line });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_subscriber_receives_in_order() {
        let bus = EventBus::new();
        let id = Uuid::new_v4();
        let mut rx = bus.subscribe(id);

        bus.log(id, "pulling image");
        bus.publish(
            id,
            ResourceEvent::StateChanged {
                from: "pending".to_string(),
                to: "deploying".to_string(),
            },
        );

        assert_eq!(
            rx.recv().await.unwrap(),
            ResourceEvent::Log {
                line: "pulling image".to_string()
            }
        );
        assert!(matches!(
            rx.recv().await.unwrap(),
            ResourceEvent::StateChanged { .. }
        ));
    }

    #[test]
    fn test_publish_without_subscribers_is_fine() {
        let bus = EventBus::new();
        bus.log(Uuid::new_v4(), "nobody listening");
    }

    #[tokio::test]
    async fn test_events_are_scoped_by_id() {
        let bus = EventBus::new();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let mut rx_a = bus.subscribe(a);
        bus.log(b, "for b");
        bus.log(a, "for a");
        assert_eq!(
            rx_a.recv().await.unwrap(),
            ResourceEvent::Log {
                line: "for a".to_string()
            }
        );
    }

    #[test]
    fn test_event_serialization() {
        let json = serde_json::to_value(ResourceEvent::Failed {
            message: "quota".to_string(),
        })
        .unwrap();
        assert_eq!(json, serde_json::json!({ "type": "failed", "message": "quota" }));
    }
}
