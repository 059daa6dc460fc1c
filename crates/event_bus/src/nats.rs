//! NATS core transport.
//!
//! async-nats reconnects and replays subscriptions on its own, so the
//! message stream of a NATS connection only ends when its sink is dropped.
//!
//! Topics are mapped to subjects token by token. `*`, `>`, `%` and
//! whitespace are percent-encoded and an empty token becomes `%`, so a
//! topic never subscribes to a wildcard. Other publishers on the same
//! server must apply the same mapping.

use crate::error::{Error, Result};
use crate::event::BusMessage;
use crate::transport::{MessageStream, Transport, TransportSink};
use async_nats::Client;
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use std::collections::HashMap;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, info};

pub struct NatsTransport {
    client: Client,
}

impl NatsTransport {
    /// Connect to a NATS server.
    pub async fn connect(url: &str) -> Result<Self> {
        info!("Connecting to NATS at {}", url);
        let client = async_nats::connect(url)
            .await
            .map_err(|e| Error::Nats(e.to_string()))?;
        Ok(Self { client })
    }
}

/// One forwarding task per subscribed subject feeds the shared stream.
struct NatsSink {
    client: Client,
    tx: mpsc::UnboundedSender<BusMessage>,
    subjects: HashMap<String, JoinHandle<()>>,
}

#[async_trait]
impl TransportSink for NatsSink {
    async fn subscribe(&mut self, topic: &str) -> Result<()> {
        if self.subjects.contains_key(topic) {
            return Ok(());
        }

        let mut subscriber = self
            .client
            .subscribe(subject_for(topic))
            .await
            .map_err(|e| Error::Nats(e.to_string()))?;

        let tx = self.tx.clone();
        let subscribed = topic.to_string();
        let forward = tokio::spawn(async move {
            while let Some(msg) = subscriber.next().await {
                let message = BusMessage {
                    topic: subscribed.clone(),
                    payload: msg.payload,
                };
                if tx.send(message).is_err() {
                    break;
                }
            }
        });

        self.subjects.insert(topic.to_string(), forward);
        debug!("NATS subscribed to {}", topic);
        Ok(())
    }

    async fn unsubscribe(&mut self, topic: &str) -> Result<()> {
        // Dropping the subscriber inside the task unsubscribes on the server.
        if let Some(forward) = self.subjects.remove(topic) {
            forward.abort();
            debug!("NATS unsubscribed from {}", topic);
        }
        Ok(())
    }
}

impl Drop for NatsSink {
    fn drop(&mut self) {
        for (_, forward) in self.subjects.drain() {
            forward.abort();
        }
    }
}

#[async_trait]
impl Transport for NatsTransport {
    fn name(&self) -> &'static str {
        "nats"
    }

    async fn open(&self) -> Result<(Box<dyn TransportSink>, MessageStream)> {
        let (tx, rx) = mpsc::unbounded_channel();
        let sink = NatsSink {
            client: self.client.clone(),
            tx,
            subjects: HashMap::new(),
        };
        Ok((Box::new(sink), Box::pin(UnboundedReceiverStream::new(rx))))
    }

    async fn publish(&self, topic: &str, payload: Bytes) -> Result<()> {
        self.client
            .publish(subject_for(topic), payload)
            .await
            .map_err(|e| Error::Nats(e.to_string()))?;
        Ok(())
    }
}

/// Map a topic to a literal NATS subject.
pub fn subject_for(topic: &str) -> String {
    let tokens: Vec<String> = topic.split('.').map(encode_token).collect();
    tokens.join(".")
}

fn encode_token(token: &str) -> String {
    if token.is_empty() {
        return "%".to_string();
    }
    let mut encoded = String::with_capacity(token.len());
    for c in token.chars() {
        if matches!(c, '*' | '>' | '%') || c.is_whitespace() || c.is_control() {
            let mut buf = [0u8; 4];
            for byte in c.encode_utf8(&mut buf).bytes() {
                encoded.push_str(&format!("%{:02X}", byte));
            }
        } else {
            encoded.push(c);
        }
    }
    encoded
}
