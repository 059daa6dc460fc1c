//! Redis pub/sub transport.

use crate::error::Result;
use crate::event::BusMessage;
use crate::transport::{MessageStream, Transport, TransportSink};
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use redis::aio::{MultiplexedConnection, PubSubSink};
use redis::AsyncCommands;
use tokio::sync::Mutex;
use tracing::{debug, info};

/// Redis-backed transport.
///
/// Subscriptions run over a dedicated pub/sub connection per [`open`] call;
/// publishing reuses one multiplexed connection, re-established lazily after
/// an error.
///
/// [`open`]: Transport::open
pub struct RedisTransport {
    client: redis::Client,
    publisher: Mutex<Option<MultiplexedConnection>>,
}

impl RedisTransport {
    /// Create a transport. No connection is made until first use.
    pub fn new(redis_url: &str) -> Result<Self> {
        let client = redis::Client::open(redis_url)?;
        Ok(Self {
            client,
            publisher: Mutex::new(None),
        })
    }

    async fn publisher(&self) -> Result<MultiplexedConnection> {
        let mut slot = self.publisher.lock().await;
        if let Some(conn) = slot.as_ref() {
            return Ok(conn.clone());
        }
        let conn = self.client.get_multiplexed_async_connection().await?;
        *slot = Some(conn.clone());
        Ok(conn)
    }
}

struct RedisSink {
    sink: PubSubSink,
}

#[async_trait]
impl TransportSink for RedisSink {
    async fn subscribe(&mut self, topic: &str) -> Result<()> {
        self.sink.subscribe(topic).await?;
        debug!("Redis SUBSCRIBE {}", topic);
        Ok(())
    }

    async fn unsubscribe(&mut self, topic: &str) -> Result<()> {
        self.sink.unsubscribe(topic).await?;
        debug!("Redis UNSUBSCRIBE {}", topic);
        Ok(())
    }
}

#[async_trait]
impl Transport for RedisTransport {
    fn name(&self) -> &'static str {
        "redis"
    }

    async fn open(&self) -> Result<(Box<dyn TransportSink>, MessageStream)> {
        let pubsub = self.client.get_async_pubsub().await?;
        let (sink, stream) = pubsub.split();
        info!("Opened Redis pub/sub connection");

        let messages = stream.map(|msg| BusMessage {
            topic: msg.get_channel_name().to_string(),
            payload: Bytes::copy_from_slice(msg.get_payload_bytes()),
        });

        Ok((Box::new(RedisSink { sink }), Box::pin(messages)))
    }

    async fn publish(&self, topic: &str, payload: Bytes) -> Result<()> {
        let mut conn = self.publisher().await?;
        let result: redis::RedisResult<()> = conn.publish(topic, &payload[..]).await;
        if let Err(e) = result {
            // Force a fresh connection on the next publish.
            *self.publisher.lock().await = None;
            return Err(e.into());
        }
        Ok(())
    }
}
