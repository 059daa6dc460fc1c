//! GraphQL subscription gateway streaming event-driven results over SSE.
//!
//! Clients reserve a token, register subscription operations against it
//! and then open a long-lived event stream. Each operation is parsed into
//! an event name plus at most one argument, mapped onto an event bus topic,
//! and re-executed against the execution engine whenever an event arrives.
//!
//! ## Architecture
//!
//! ```text
//! Event bus topic  itemChanged.7
//!         ↓
//! SubscriptionManager (one bus handler per topic, refcounted)
//!         ↓  per-subscription queue + worker
//! ExecutionProxy (signed root value → execution engine)
//!         ↓
//! Connection frame channel → SSE stream
//! ```

pub mod channel;
pub mod config;
pub mod connection;
pub mod document;
pub mod error;
pub mod manager;
pub mod protocol;
pub mod publisher;
pub mod stream_server;

#[cfg(test)]
mod test_support;

pub use channel::{ChannelError, ChannelRouter, ParsedTopic};
pub use config::{AllowedOrigins, GatewayConfig};
pub use connection::{Connection, ConnectionConfig, ConnectionRegistry, ConnectionState};
pub use document::{parse_subscription, DocumentError, ParsedSubscription};
pub use error::{GatewayError, Result};
pub use manager::{
    ManagerConfig, OperationSink, Subscription, SubscriptionManager, SubscriptionRequest,
};
pub use protocol::StreamFrame;
pub use publisher::EventPublisher;
pub use stream_server::{create_router, AppState};
