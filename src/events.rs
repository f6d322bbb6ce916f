// Copyright 2025 StrongDM Inc
// SPDX-License-Identifier: Apache-2.0

//! Event broadcasting for structured logging.
//!
//! This module provides an EventBus that broadcasts store events to
//! subscribers. Events originate from the binary protocol handler and the
//! HTTP registry endpoints; the server itself subscribes once at startup
//! and logs each event via `tracing`.

use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};

use serde::Serialize;

/// Store events that can be broadcast to SSE subscribers.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StoreEvent {
    /// A new context was created.
    ContextCreated {
        context_id: String,
        session_id: String,
        client_tag: String,
        created_at: u64,
    },
    /// A turn was appended to a context.
    TurnAppended {
        context_id: String,
        turn_id: String,
        parent_turn_id: String,
        depth: u32,
        #[serde(skip_serializing_if = "Option::is_none")]
        declared_type_id: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        declared_type_version: Option<u32>,
    },
    /// A binary protocol client connected.
    ClientConnected {
        session_id: String,
        client_tag: String,
    },
    /// A binary protocol client disconnected.
    ClientDisconnected {
        session_id: String,
        client_tag: String,
        contexts: Vec<String>,
    },
}

impl StoreEvent {
    /// Convert event to SSE format: (event_type, json_data).
    pub fn to_sse(&self) -> (&'static str, String) {
        let event_type = match self {
            StoreEvent::ContextCreated { .. } => "context_created",
            StoreEvent::TurnAppended { .. } => "turn_appended",
            StoreEvent::ClientConnected { .. } => "client_connected",
            StoreEvent::ClientDisconnected { .. } => "client_disconnected",
        };

        // Serialize without the type tag (frontend expects flat structure)
        let data = match self {
            StoreEvent::ContextCreated {
                context_id,
                session_id,
                client_tag,
                created_at,
            } => serde_json::json!({
                "context_id": context_id,
                "session_id": session_id,
                "client_tag": client_tag,
                "created_at": created_at,
            }),
            StoreEvent::TurnAppended {
                context_id,
                turn_id,
                parent_turn_id,
                depth,
                declared_type_id,
                declared_type_version,
            } => {
                let mut obj = serde_json::json!({
                    "context_id": context_id,
                    "turn_id": turn_id,
                    "parent_turn_id": parent_turn_id,
                    "depth": depth,
                });
                if let Some(id) = declared_type_id {
                    obj["declared_type_id"] = serde_json::Value::String(id.clone());
                }
                if let Some(ver) = declared_type_version {
                    obj["declared_type_version"] = serde_json::json!(ver);
                }
                obj
            }
            StoreEvent::ClientConnected {
                session_id,
                client_tag,
            } => serde_json::json!({
                "session_id": session_id,
                "client_tag": client_tag,
            }),
            StoreEvent::ClientDisconnected {
                session_id,
                client_tag,
                contexts,
            } => serde_json::json!({
                "session_id": session_id,
                "client_tag": client_tag,
                "contexts": contexts,
            }),
        };

        (event_type, data.to_string())
    }
}

/// A subscriber to the event bus.
pub struct EventSubscriber {
    rx: Receiver<StoreEvent>,
}

impl EventSubscriber {
    /// Receive the next event, blocking until available.
    pub fn recv(&self) -> Option<StoreEvent> {
        self.rx.recv().ok()
    }

    /// Try to receive an event without blocking.
    pub fn try_recv(&self) -> Option<StoreEvent> {
        self.rx.try_recv().ok()
    }

    /// Receive with timeout.
    pub fn recv_timeout(&self, timeout: std::time::Duration) -> Option<StoreEvent> {
        self.rx.recv_timeout(timeout).ok()
    }
}

/// Thread-safe event bus for broadcasting store events to SSE subscribers.
pub struct EventBus {
    subscribers: Arc<Mutex<Vec<Sender<StoreEvent>>>>,
}

impl EventBus {
    /// Create a new event bus.
    pub fn new() -> Self {
        Self {
            subscribers: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Subscribe to events. Returns a subscriber that receives all future events.
    pub fn subscribe(&self) -> EventSubscriber {
        let (tx, rx) = mpsc::channel();
        let mut subs = self.subscribers.lock().unwrap();
        subs.push(tx);
        EventSubscriber { rx }
    }

    /// Publish an event to all subscribers.
    /// Disconnected subscribers are automatically removed.
    pub fn publish(&self, event: StoreEvent) {
        let mut subs = self.subscribers.lock().unwrap();
        // Send to all, remove disconnected
        subs.retain(|tx| tx.send(event.clone()).is_ok());
    }

    /// Get the current number of subscribers.
    pub fn subscriber_count(&self) -> usize {
        let subs = self.subscribers.lock().unwrap();
        subs.len()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_event_bus_basic() {
        let bus = EventBus::new();
        let sub = bus.subscribe();

        bus.publish(StoreEvent::ClientConnected {
            session_id: "123".to_string(),
            client_tag: "test".to_string(),
        });

        let event = sub.recv_timeout(Duration::from_millis(100));
        assert!(event.is_some());
        match event.unwrap() {
            StoreEvent::ClientConnected { session_id, .. } => {
                assert_eq!(session_id, "123");
            }
            _ => panic!("wrong event type"),
        }
    }

    #[test]
    fn test_event_bus_multiple_subscribers() {
        let bus = EventBus::new();
        let sub1 = bus.subscribe();
        let sub2 = bus.subscribe();

        bus.publish(StoreEvent::ContextCreated {
            context_id: "1".to_string(),
            session_id: "2".to_string(),
            client_tag: "tag".to_string(),
            created_at: 12345,
        });

        assert!(sub1.recv_timeout(Duration::from_millis(100)).is_some());
        assert!(sub2.recv_timeout(Duration::from_millis(100)).is_some());
    }

    #[test]
    fn test_turn_appended_event_to_sse() {
        let event = StoreEvent::TurnAppended {
            context_id: "12".to_string(),
            turn_id: "5".to_string(),
            parent_turn_id: "4".to_string(),
            depth: 1,
            declared_type_id: Some("cxdb.Message".to_string()),
            declared_type_version: Some(1),
        };

        let (event_type, data) = event.to_sse();
        assert_eq!(event_type, "turn_appended");
        assert!(data.contains("\"context_id\":\"12\""));
        assert!(data.contains("\"turn_id\":\"5\""));
    }

    #[test]
    fn test_subscriber_cleanup() {
        let bus = EventBus::new();

        {
            let _sub = bus.subscribe();
            assert_eq!(bus.subscriber_count(), 1);
        }
        // Subscriber dropped, but won't be cleaned up until next publish

        bus.publish(StoreEvent::ClientConnected {
            session_id: "1".to_string(),
            client_tag: "test".to_string(),
        });

        // Now the dead subscriber should be removed
        assert_eq!(bus.subscriber_count(), 0);
    }
}
