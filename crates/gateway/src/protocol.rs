//! Stream protocol types.
//!
//! Defines the SSE frames sent to clients and the JSON bodies accepted on
//! the HTTP endpoints.

use axum::response::sse::Event;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

/// Header carrying the reservation token on register/unregister requests.
pub const STREAM_TOKEN_HEADER: &str = "x-stream-token";

// ============================================================================
// Server → Client frames
// ============================================================================

/// One frame on an event stream.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamFrame {
    /// Result for an operation: data `{"id": ..., "payload": ...}`.
    Next { id: String, payload: Value },
    /// The operation ended. Empty data; the SSE `id` field names the operation.
    Complete { id: String },
}

impl StreamFrame {
    pub fn id(&self) -> &str {
        match self {
            StreamFrame::Next { id, .. } | StreamFrame::Complete { id } => id,
        }
    }

    pub fn to_event(&self) -> Event {
        match self {
            StreamFrame::Next { id, payload } => Event::default()
                .event("next")
                .data(json!({ "id": id, "payload": payload }).to_string()),
            StreamFrame::Complete { id } => Event::default().event("complete").id(id).data(""),
        }
    }
}

/// Stream-established signal.
pub fn connected_event() -> Event {
    Event::default().comment("connected")
}

/// Heartbeat.
pub fn ping_event() -> Event {
    Event::default().comment("ping")
}

/// In-band error payload for a single operation.
pub fn subscription_error(message: impl Into<String>) -> Value {
    json!({
        "data": null,
        "errors": [{
            "message": message.into(),
            "extensions": { "code": "SUBSCRIPTION_ERROR" },
        }]
    })
}

// ============================================================================
// Client → Server requests
// ============================================================================

/// `POST /stream` body.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationRequest {
    pub query: String,
    #[serde(default)]
    pub variables: Option<Map<String, Value>>,
    #[serde(default)]
    pub operation_name: Option<String>,
    #[serde(default)]
    pub extensions: OperationExtensions,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationExtensions {
    #[serde(default)]
    pub operation_id: Option<String>,
}

/// `GET /stream` query string.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct StreamQuery {
    pub token: Option<String>,
}

/// `DELETE /stream` query string.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnregisterQuery {
    pub operation_id: Option<String>,
}

/// `POST /publish` body.
#[derive(Debug, Clone, Deserialize)]
pub struct PublishRequest {
    pub event: String,
    #[serde(default)]
    pub args: Map<String, Value>,
    pub payload: Value,
}

#[derive(Debug, Clone, Serialize)]
pub struct PublishResponse {
    pub topics: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub connections: usize,
    pub subscriptions: usize,
    pub topics: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_operation_request_parsing() {
        let request: OperationRequest = serde_json::from_str(
            r#"{"query":"subscription { a }","variables":{"id":1},"operationName":"A","extensions":{"operationId":"op-1"}}"#,
        )
        .unwrap();
        assert_eq!(request.operation_name.as_deref(), Some("A"));
        assert_eq!(request.extensions.operation_id.as_deref(), Some("op-1"));
        assert_eq!(request.variables.unwrap()["id"], 1);

        let minimal: OperationRequest =
            serde_json::from_str(r#"{"query":"subscription { a }","variables":null}"#).unwrap();
        assert!(minimal.variables.is_none());
        assert!(minimal.extensions.operation_id.is_none());
    }

    #[test]
    fn test_subscription_error_shape() {
        let payload = subscription_error("engine unreachable");
        assert_eq!(payload["data"], Value::Null);
        assert_eq!(payload["errors"][0]["extensions"]["code"], "SUBSCRIPTION_ERROR");
    }

    #[test]
    fn test_frame_ids() {
        let next = StreamFrame::Next {
            id: "a".into(),
            payload: json!({}),
        };
        assert_eq!(next.id(), "a");
        assert_eq!(StreamFrame::Complete { id: "b".into() }.id(), "b");
    }
}
