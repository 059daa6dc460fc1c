//! Event types carried over the bus.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;

/// Raw message as delivered by a transport.
#[derive(Debug, Clone)]
pub struct BusMessage {
    pub topic: String,
    pub payload: Bytes,
}

/// Domain payload of an event.
///
/// Upstream publishers only promise a JSON value. Objects carrying an `id`
/// are recognised as entity changes; everything else is kept verbatim so
/// newer event shapes pass through untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EventPayload {
    /// Object identified by an `id` key.
    Entity {
        id: Value,
        #[serde(flatten)]
        fields: Map<String, Value>,
    },
    /// Object without an identifying key.
    Fields(Map<String, Value>),
    /// Any non-object JSON value.
    Other(Value),
}

impl EventPayload {
    pub fn from_slice(bytes: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(bytes)
    }

    /// Identifying key, when the payload has one.
    pub fn key(&self) -> Option<&Value> {
        match self {
            EventPayload::Entity { id, .. } => Some(id),
            _ => None,
        }
    }

    /// Plain JSON form, as originally published.
    pub fn to_value(&self) -> Value {
        match self {
            EventPayload::Entity { id, fields } => {
                let mut object = fields.clone();
                object.insert("id".to_string(), id.clone());
                Value::Object(object)
            }
            EventPayload::Fields(fields) => Value::Object(fields.clone()),
            EventPayload::Other(value) => value.clone(),
        }
    }
}

impl From<Value> for EventPayload {
    fn from(value: Value) -> Self {
        match value {
            Value::Object(mut object) => match object.remove("id") {
                Some(id) => EventPayload::Entity { id, fields: object },
                None => EventPayload::Fields(object),
            },
            other => EventPayload::Other(other),
        }
    }
}

/// One inbound notification, shared by every consumer of its topic.
#[derive(Debug, Clone)]
pub struct BusEvent {
    pub topic: Arc<str>,
    pub payload: Arc<EventPayload>,
    pub received_at: DateTime<Utc>,
}

impl BusEvent {
    pub fn new(topic: impl Into<Arc<str>>, payload: EventPayload) -> Self {
        Self {
            topic: topic.into(),
            payload: Arc::new(payload),
            received_at: Utc::now(),
        }
    }
}
