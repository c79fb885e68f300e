//! Domain events and the publish seam between producers and the dispatcher.

use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use strum::{Display, EnumString};

/// Event types a subscription can listen for.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum EventType {
    ToolCompleted,
    ToolFailed,
    ServerConnected,
    ServerDisconnected,
    ResourceChanged,
    PromptSuggested,
}

/// Something that happened inside the bridge. Never persisted.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DomainEvent {
    pub event_type: EventType,
    pub payload: Map<String, Value>,
    pub timestamp: DateTime<Utc>,
}

impl DomainEvent {
    pub fn new(event_type: EventType, payload: Map<String, Value>) -> Self {
        Self {
            event_type,
            payload,
            timestamp: Utc::now(),
        }
    }

    pub(crate) fn server(event_type: EventType, server_id: &str, error: Option<&str>) -> Self {
        let mut payload = Map::new();
        payload.insert("server".into(), Value::String(server_id.to_string()));
        if let Some(error) = error {
            payload.insert("error".into(), Value::String(error.to_string()));
        }
        let mut event = Self::new(event_type, payload);
        let timestamp = event.timestamp.to_rfc3339();
        event.payload.insert("timestamp".into(), Value::String(timestamp));
        event
    }
}

/// Publish function exposed by the dispatcher.
///
/// Implementations must not block the caller on delivery.
pub trait EventSink: Send + Sync {
    fn publish(&self, event: DomainEvent);
}

/// Sink that drops every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl EventSink for NullSink {
    fn publish(&self, _event: DomainEvent) {}
}

/// Sink that keeps events in memory, for inspection.
#[derive(Debug, Default)]
pub struct RecordingSink {
    events: Mutex<Vec<DomainEvent>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Events published so far, oldest first.
    pub fn events(&self) -> Vec<DomainEvent> {
        self.events
            .lock()
            .map(|events| events.clone())
            .unwrap_or_default()
    }

    /// Event types published so far, oldest first.
    pub fn types(&self) -> Vec<EventType> {
        self.events().iter().map(|e| e.event_type).collect()
    }
}

impl EventSink for RecordingSink {
    fn publish(&self, event: DomainEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event);
        }
    }
}
