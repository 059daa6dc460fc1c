//! Gateway error types.
//!
//! Protocol errors are answered with a GraphQL-style body:
//! `{"errors":[{"message": ..., "extensions": {"code": ...}}]}`.

use crate::channel::ChannelError;
use crate::document::DocumentError;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

/// Gateway error type.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// Request carried no reservation token.
    #[error("Missing stream token")]
    MissingToken,

    /// Token was never issued, or its connection has closed.
    #[error("Unknown stream token")]
    UnknownToken,

    /// Body or query string could not be decoded.
    #[error("Malformed request: {0}")]
    MalformedRequest(String),

    #[error("Invalid operation id: {0}")]
    InvalidOperationId(String),

    #[error(transparent)]
    InvalidDocument(#[from] DocumentError),

    #[error(transparent)]
    Channel(#[from] ChannelError),

    #[error("Subscription limit of {0} reached for this token")]
    SubscriptionLimit(usize),

    #[error("Operation {0} is already registered")]
    DuplicateOperation(String),

    #[error("A stream is already open for this token")]
    AlreadyStreaming,

    /// Event bus failure.
    #[error("Event bus error: {0}")]
    EventBus(#[from] event_bus::Error),

    /// Internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl GatewayError {
    pub fn status(&self) -> StatusCode {
        match self {
            GatewayError::MissingToken => StatusCode::UNAUTHORIZED,
            GatewayError::UnknownToken => StatusCode::NOT_FOUND,
            GatewayError::MalformedRequest(_)
            | GatewayError::InvalidOperationId(_)
            | GatewayError::InvalidDocument(_)
            | GatewayError::Channel(_)
            | GatewayError::SubscriptionLimit(_) => StatusCode::BAD_REQUEST,
            GatewayError::DuplicateOperation(_) | GatewayError::AlreadyStreaming => {
                StatusCode::CONFLICT
            }
            GatewayError::EventBus(_) => StatusCode::BAD_GATEWAY,
            GatewayError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Machine-readable code placed under `extensions.code`.
    pub fn code(&self) -> &'static str {
        match self {
            GatewayError::MissingToken => "MISSING_TOKEN",
            GatewayError::UnknownToken => "UNKNOWN_TOKEN",
            GatewayError::MalformedRequest(_) => "BAD_REQUEST",
            GatewayError::InvalidOperationId(_) => "INVALID_OPERATION_ID",
            GatewayError::InvalidDocument(_) => "GRAPHQL_VALIDATION_FAILED",
            GatewayError::Channel(ChannelError::TooManyArguments { .. }) => "TOO_MANY_ARGUMENTS",
            GatewayError::Channel(ChannelError::InvalidEventName(_)) => "INVALID_EVENT_NAME",
            GatewayError::SubscriptionLimit(_) => "SUBSCRIPTION_LIMIT",
            GatewayError::DuplicateOperation(_) => "DUPLICATE_OPERATION",
            GatewayError::AlreadyStreaming => "STREAM_ALREADY_OPEN",
            GatewayError::EventBus(_) => "EVENT_BUS_UNAVAILABLE",
            GatewayError::Internal(_) => "INTERNAL_SERVER_ERROR",
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = json!({
            "errors": [{
                "message": self.to_string(),
                "extensions": { "code": self.code() },
            }]
        });
        (status, Json(body)).into_response()
    }
}

/// Result type for gateway operations.
pub type Result<T> = std::result::Result<T, GatewayError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(GatewayError::MissingToken.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(GatewayError::UnknownToken.status(), StatusCode::NOT_FOUND);
        assert_eq!(
            GatewayError::Channel(ChannelError::TooManyArguments {
                event_name: "itemChanged".into(),
                count: 2
            })
            .status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            GatewayError::DuplicateOperation("a".into()).status(),
            StatusCode::CONFLICT
        );
        assert_eq!(GatewayError::AlreadyStreaming.status(), StatusCode::CONFLICT);
        assert_eq!(
            GatewayError::SubscriptionLimit(1).status(),
            StatusCode::BAD_REQUEST
        );
    }
}
