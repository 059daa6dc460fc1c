//! Transport abstraction under the event bus.
//!
//! A transport hands out one live connection at a time as a control half
//! ([`TransportSink`]) and a message half ([`MessageStream`]). The stream
//! ending means the connection dropped; the bus then reopens and replays its
//! subscriptions, so `subscribe`/`unsubscribe` must be idempotent.

use crate::error::{Error, Result};
use crate::event::BusMessage;
use crate::memory::MemoryTransport;
use crate::nats::NatsTransport;
use crate::redis::RedisTransport;
use async_trait::async_trait;
use bytes::Bytes;
use futures::Stream;
use std::pin::Pin;
use std::sync::Arc;

/// Messages received on one transport connection.
pub type MessageStream = Pin<Box<dyn Stream<Item = BusMessage> + Send>>;

/// Subscription control for one transport connection.
#[async_trait]
pub trait TransportSink: Send {
    async fn subscribe(&mut self, topic: &str) -> Result<()>;

    async fn unsubscribe(&mut self, topic: &str) -> Result<()>;
}

/// A publish/subscribe backend.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Short label for logs and metrics.
    fn name(&self) -> &'static str;

    /// Open a new subscriber connection.
    async fn open(&self) -> Result<(Box<dyn TransportSink>, MessageStream)>;

    /// Publish a serialized payload to a topic.
    async fn publish(&self, topic: &str, payload: Bytes) -> Result<()>;
}

/// Build a transport from a URL.
///
/// Supported schemes: `redis://`, `rediss://`, `nats://`, and `memory://`
/// (in-process, single instance only).
pub async fn transport_from_url(url: &str) -> Result<Arc<dyn Transport>> {
    if url.starts_with("redis://") || url.starts_with("rediss://") {
        Ok(Arc::new(RedisTransport::new(url)?))
    } else if url.starts_with("nats://") {
        Ok(Arc::new(NatsTransport::connect(url).await?))
    } else if url.starts_with("memory://") {
        Ok(Arc::new(MemoryTransport::new()))
    } else {
        Err(Error::UnsupportedUrl(url.to_string()))
    }
}
