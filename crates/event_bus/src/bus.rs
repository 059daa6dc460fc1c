//! Reconnecting event bus with local fan-out.
//!
//! Many local consumers may watch one topic; only the first causes a
//! transport subscribe and only the last leaving causes an unsubscribe.
//! Delivery is best effort: events published while the transport is down
//! are lost, and after reconnecting every watched topic is re-subscribed
//! without involving the consumers.

use crate::error::Result;
use crate::event::{BusEvent, BusMessage, EventPayload};
use crate::transport::{MessageStream, Transport, TransportSink};
use bytes::Bytes;
use common::{retry, BackoffConfig, KeyedLocks};
use dashmap::DashMap;
use futures::StreamExt;
use metrics::{counter, gauge};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Identifies one registered consumer.
pub type HandlerId = u64;

/// Receives events for the topics it was registered on.
///
/// `deliver` is called from the bus dispatch path and must not block.
pub trait EventConsumer: Send + Sync {
    fn deliver(&self, event: BusEvent);

    /// The bus is shutting down; no more events will arrive.
    fn complete(&self) {}
}

/// Adapts a bounded channel into a consumer. Events are dropped when the
/// channel is full.
pub struct ChannelConsumer {
    tx: mpsc::Sender<BusEvent>,
}

impl ChannelConsumer {
    pub fn new(tx: mpsc::Sender<BusEvent>) -> Self {
        Self { tx }
    }
}

impl EventConsumer for ChannelConsumer {
    fn deliver(&self, event: BusEvent) {
        if let Err(e) = self.tx.try_send(event) {
            debug!("Channel consumer dropped event: {}", e);
        }
    }
}

/// Event bus configuration.
#[derive(Debug, Clone, Default)]
pub struct EventBusConfig {
    /// Backoff between reconnection attempts after the transport drops.
    pub reconnect: BackoffConfig,
}

/// Cheaply cloneable handle to a shared event bus.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

struct BusInner {
    transport: Arc<dyn Transport>,
    config: EventBusConfig,
    /// topic -> local consumers. Entries exist only while non-empty.
    handlers: DashMap<String, HashMap<HandlerId, Arc<dyn EventConsumer>>>,
    topic_locks: KeyedLocks<String>,
    sink: tokio::sync::Mutex<Option<Box<dyn TransportSink>>>,
    supervisor: Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
    lifecycle: tokio::sync::Mutex<()>,
    next_handler_id: AtomicU64,
    connected: AtomicBool,
}

impl EventBus {
    pub fn new(transport: Arc<dyn Transport>, config: EventBusConfig) -> Self {
        Self {
            inner: Arc::new(BusInner {
                transport,
                config,
                handlers: DashMap::new(),
                topic_locks: KeyedLocks::new(),
                sink: tokio::sync::Mutex::new(None),
                supervisor: Mutex::new(None),
                lifecycle: tokio::sync::Mutex::new(()),
                next_handler_id: AtomicU64::new(1),
                connected: AtomicBool::new(false),
            }),
        }
    }

    /// Open the transport and start the reconnect supervisor.
    ///
    /// Idempotent. The first connection attempt is made inline so that an
    /// unreachable bus at startup surfaces as an error.
    pub async fn connect(&self) -> Result<()> {
        let _lifecycle = self.inner.lifecycle.lock().await;
        if self.supervisor_running() {
            return Ok(());
        }

        info!("Connecting event bus ({})", self.inner.transport.name());
        let (sink, stream) = self.inner.transport.open().await?;
        self.inner.install(sink).await;

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(run_supervisor(self.inner.clone(), stream, cancel.clone()));
        if let Ok(mut supervisor) = self.inner.supervisor.lock() {
            *supervisor = Some((cancel, handle));
        }

        info!("Event bus connected");
        Ok(())
    }

    /// Stop the supervisor, close the transport connection and complete
    /// every registered consumer. Idempotent.
    pub async fn disconnect(&self) {
        let _lifecycle = self.inner.lifecycle.lock().await;

        let supervisor = self
            .inner
            .supervisor
            .lock()
            .ok()
            .and_then(|mut supervisor| supervisor.take());
        if let Some((cancel, handle)) = supervisor {
            cancel.cancel();
            if let Err(e) = handle.await {
                warn!("Event bus supervisor ended abnormally: {}", e);
            }
        }

        *self.inner.sink.lock().await = None;
        self.inner.connected.store(false, Ordering::SeqCst);

        let topics: Vec<String> = self
            .inner
            .handlers
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        let mut consumers = Vec::new();
        for topic in topics {
            if let Some((_, handlers)) = self.inner.handlers.remove(&topic) {
                consumers.extend(handlers.into_values());
            }
        }
        gauge!("event_bus_topics").set(0.0);

        let count = consumers.len();
        for consumer in consumers {
            consumer.complete();
        }
        info!("Event bus disconnected, completed {} consumers", count);
    }

    /// Register `consumer` for `topic`.
    ///
    /// Transport errors are logged rather than returned: the topic stays
    /// registered and is subscribed again on the next reconnect.
    pub async fn subscribe(&self, topic: &str, consumer: Arc<dyn EventConsumer>) -> HandlerId {
        let key = topic.to_string();
        let _guard = self.inner.topic_locks.lock(&key).await;

        let id = self.inner.next_handler_id.fetch_add(1, Ordering::Relaxed);
        let first = {
            let mut handlers = self.inner.handlers.entry(key).or_default();
            let first = handlers.is_empty();
            handlers.insert(id, consumer);
            first
        };

        if first {
            self.inner.upstream_subscribe(topic).await;
            gauge!("event_bus_topics").set(self.inner.handlers.len() as f64);
        }
        debug!("Registered handler {} on {} (first: {})", id, topic, first);
        id
    }

    /// Remove a consumer. Returns whether it was registered.
    pub async fn unsubscribe(&self, topic: &str, handler: HandlerId) -> bool {
        let key = topic.to_string();
        let _guard = self.inner.topic_locks.lock(&key).await;

        let mut removed = false;
        let mut now_empty = false;
        if let Some(mut handlers) = self.inner.handlers.get_mut(topic) {
            removed = handlers.remove(&handler).is_some();
            now_empty = handlers.is_empty();
        }

        if now_empty {
            self.inner.handlers.remove_if(topic, |_, h| h.is_empty());
            self.inner.upstream_unsubscribe(topic).await;
            gauge!("event_bus_topics").set(self.inner.handlers.len() as f64);
        }
        debug!("Unregistered handler {} from {} (removed: {})", handler, topic, removed);
        removed
    }

    /// Serialize `payload` as JSON and publish it.
    pub async fn publish<T: Serialize + ?Sized>(&self, topic: &str, payload: &T) -> Result<()> {
        let bytes = serde_json::to_vec(payload)?;
        self.publish_raw(topic, Bytes::from(bytes)).await
    }

    /// Publish pre-serialized bytes.
    pub async fn publish_raw(&self, topic: &str, payload: Bytes) -> Result<()> {
        match self.inner.transport.publish(topic, payload).await {
            Ok(()) => {
                counter!("event_bus_published_total").increment(1);
                Ok(())
            }
            Err(e) => {
                counter!("event_bus_errors_total", "error_type" => "publish").increment(1);
                warn!("Failed to publish to {}: {}", topic, e);
                Err(e)
            }
        }
    }

    /// Whether a transport connection is currently live.
    pub fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::SeqCst)
    }

    /// Number of topics with at least one local consumer.
    pub fn topic_count(&self) -> usize {
        self.inner.handlers.len()
    }

    /// Number of local consumers on `topic`.
    pub fn handler_count(&self, topic: &str) -> usize {
        self.inner.handlers.get(topic).map(|h| h.len()).unwrap_or(0)
    }

    fn supervisor_running(&self) -> bool {
        self.inner
            .supervisor
            .lock()
            .map(|supervisor| supervisor.is_some())
            .unwrap_or(false)
    }
}

impl BusInner {
    /// Make `sink` the live connection and replay every watched topic on it.
    async fn install(&self, mut sink: Box<dyn TransportSink>) {
        let mut slot = self.sink.lock().await;
        let topics: Vec<String> = self.handlers.iter().map(|e| e.key().clone()).collect();
        for topic in &topics {
            if let Err(e) = sink.subscribe(topic).await {
                counter!("event_bus_errors_total", "error_type" => "subscribe").increment(1);
                warn!("Failed to re-subscribe to {}: {}", topic, e);
            }
        }
        *slot = Some(sink);
        self.connected.store(true, Ordering::SeqCst);
        if !topics.is_empty() {
            info!("Subscribed {} topics on new connection", topics.len());
        }
    }

    async fn upstream_subscribe(&self, topic: &str) {
        let mut slot = self.sink.lock().await;
        match slot.as_mut() {
            Some(sink) => {
                if let Err(e) = sink.subscribe(topic).await {
                    counter!("event_bus_errors_total", "error_type" => "subscribe").increment(1);
                    warn!("Subscribe to {} failed, will retry on reconnect: {}", topic, e);
                }
            }
            None => debug!("Bus offline, {} will be subscribed on reconnect", topic),
        }
    }

    async fn upstream_unsubscribe(&self, topic: &str) {
        let mut slot = self.sink.lock().await;
        if let Some(sink) = slot.as_mut() {
            if let Err(e) = sink.unsubscribe(topic).await {
                counter!("event_bus_errors_total", "error_type" => "unsubscribe").increment(1);
                warn!("Unsubscribe from {} failed: {}", topic, e);
            }
        }
    }

    fn dispatch(&self, message: BusMessage) {
        counter!("event_bus_received_total").increment(1);

        let consumers: Vec<Arc<dyn EventConsumer>> = match self.handlers.get(&message.topic) {
            Some(handlers) => handlers.values().cloned().collect(),
            None => {
                debug!("No local consumers for {}", message.topic);
                return;
            }
        };

        let payload = match EventPayload::from_slice(&message.payload) {
            Ok(payload) => payload,
            Err(e) => {
                counter!("event_bus_errors_total", "error_type" => "decode").increment(1);
                warn!("Dropping undecodable event on {}: {}", message.topic, e);
                return;
            }
        };

        let event = BusEvent::new(message.topic, payload);
        for consumer in consumers {
            consumer.deliver(event.clone());
        }
    }
}

/// Pump messages from the live connection and reconnect whenever it drops.
async fn run_supervisor(inner: Arc<BusInner>, stream: MessageStream, cancel: CancellationToken) {
    let mut stream = stream;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = pump(&inner, &mut stream) => {}
        }

        inner.connected.store(false, Ordering::SeqCst);
        *inner.sink.lock().await = None;
        counter!("event_bus_disconnects_total").increment(1);
        warn!(
            "Event bus connection ({}) dropped, reconnecting",
            inner.transport.name()
        );

        let transport = inner.transport.clone();
        let reopened = retry(&inner.config.reconnect, &cancel, "Event bus reconnect", |_| {
            let transport = transport.clone();
            async move { transport.open().await }
        })
        .await;

        match reopened {
            Ok((sink, new_stream)) => {
                inner.install(sink).await;
                stream = new_stream;
                counter!("event_bus_reconnects_total").increment(1);
                info!("Event bus reconnected");
            }
            Err(common::Error::Cancelled) => return,
            Err(e) => {
                error!("Event bus reconnection abandoned: {}", e);
                return;
            }
        }
    }
}

async fn pump(inner: &BusInner, stream: &mut MessageStream) {
    while let Some(message) = stream.next().await {
        inner.dispatch(message);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryTransport;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    fn fast_config() -> EventBusConfig {
        EventBusConfig {
            reconnect: BackoffConfig {
                initial_delay: Duration::from_millis(5),
                max_delay: Duration::from_millis(20),
                max_attempts: None,
            },
        }
    }

    async fn connected_bus() -> (EventBus, MemoryTransport) {
        let transport = MemoryTransport::new();
        let bus = EventBus::new(Arc::new(transport.clone()), fast_config());
        bus.connect().await.unwrap();
        (bus, transport)
    }

    async fn eventually<F: Fn() -> bool>(check: F) {
        for _ in 0..400 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not met in time");
    }

    #[derive(Default)]
    struct Completions(AtomicUsize);

    impl EventConsumer for Completions {
        fn deliver(&self, _event: BusEvent) {}

        fn complete(&self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn test_local_fan_out_shares_one_upstream_subscription() {
        let (bus, transport) = connected_bus().await;
        let (tx_a, mut rx_a) = mpsc::channel(8);
        let (tx_b, mut rx_b) = mpsc::channel(8);

        let a = bus
            .subscribe("post.42", Arc::new(ChannelConsumer::new(tx_a)))
            .await;
        let b = bus
            .subscribe("post.42", Arc::new(ChannelConsumer::new(tx_b)))
            .await;
        assert_eq!(transport.subscribe_calls("post.42"), 1);
        assert_eq!(bus.handler_count("post.42"), 2);

        bus.publish("post.42", &json!({"id": 42})).await.unwrap();
        let event_a = rx_a.recv().await.unwrap();
        let event_b = rx_b.recv().await.unwrap();
        assert_eq!(&*event_a.topic, "post.42");
        assert_eq!(event_b.payload.key(), Some(&json!(42)));

        assert!(bus.unsubscribe("post.42", a).await);
        assert_eq!(transport.unsubscribe_calls("post.42"), 0);
        assert!(bus.unsubscribe("post.42", b).await);
        assert_eq!(transport.unsubscribe_calls("post.42"), 1);
        assert!(!bus.unsubscribe("post.42", b).await);
        assert_eq!(transport.unsubscribe_calls("post.42"), 1);
        assert_eq!(bus.topic_count(), 0);
    }

    #[tokio::test]
    async fn test_events_only_reach_their_topic() {
        let (bus, _transport) = connected_bus().await;
        let (tx_a, mut rx_a) = mpsc::channel(8);
        let (tx_b, mut rx_b) = mpsc::channel(8);
        bus.subscribe("a", Arc::new(ChannelConsumer::new(tx_a))).await;
        bus.subscribe("b", Arc::new(ChannelConsumer::new(tx_b))).await;

        bus.publish("a", &json!({"n": 1})).await.unwrap();

        assert!(rx_a.recv().await.is_some());
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(rx_b.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_wildcard_characters_are_literal() {
        let (bus, _transport) = connected_bus().await;
        let (tx_wild, mut rx_wild) = mpsc::channel(8);
        let (tx_item, mut rx_item) = mpsc::channel(8);
        bus.subscribe("itemChanged.>", Arc::new(ChannelConsumer::new(tx_wild)))
            .await;
        bus.subscribe("itemChanged.42", Arc::new(ChannelConsumer::new(tx_item)))
            .await;

        bus.publish("itemChanged.42", &json!({"id": 42})).await.unwrap();

        let event = rx_item.recv().await.unwrap();
        assert_eq!(&*event.topic, "itemChanged.42");
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(rx_item.try_recv().is_err());
        assert!(rx_wild.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_resubscribes_after_transport_drop() {
        let (bus, transport) = connected_bus().await;
        let (tx, mut rx) = mpsc::channel(8);
        bus.subscribe("itemChanged", Arc::new(ChannelConsumer::new(tx)))
            .await;

        transport.fail_next_opens(2);
        transport.drop_connections();
        eventually(|| transport.open_count() == 2 && transport.is_subscribed("itemChanged")).await;
        assert!(bus.is_connected());
        assert_eq!(transport.subscribe_calls("itemChanged"), 2);

        bus.publish("itemChanged", &json!({"id": 1})).await.unwrap();
        let event = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.payload.key(), Some(&json!(1)));
    }

    #[tokio::test]
    async fn test_disconnect_completes_consumers_and_is_idempotent() {
        let (bus, _transport) = connected_bus().await;
        let consumer = Arc::new(Completions::default());
        bus.subscribe("a", consumer.clone()).await;
        bus.subscribe("b", consumer.clone()).await;

        bus.disconnect().await;
        bus.disconnect().await;

        assert_eq!(consumer.0.load(Ordering::SeqCst), 2);
        assert_eq!(bus.topic_count(), 0);
        assert!(!bus.is_connected());
    }

    #[tokio::test]
    async fn test_connect_is_idempotent_and_reports_startup_failure() {
        let transport = MemoryTransport::new();
        transport.fail_next_opens(1);
        let bus = EventBus::new(Arc::new(transport.clone()), fast_config());

        assert!(bus.connect().await.is_err());
        bus.connect().await.unwrap();
        bus.connect().await.unwrap();
        assert_eq!(transport.open_count(), 1);
    }

    #[tokio::test]
    async fn test_subscribe_while_offline_is_replayed_on_connect() {
        let transport = MemoryTransport::new();
        let bus = EventBus::new(Arc::new(transport.clone()), fast_config());
        let (tx, _rx) = mpsc::channel(1);
        bus.subscribe("late", Arc::new(ChannelConsumer::new(tx))).await;
        assert_eq!(transport.subscribe_calls("late"), 0);

        bus.connect().await.unwrap();
        assert_eq!(transport.subscribe_calls("late"), 1);
    }

    #[tokio::test]
    async fn test_undecodable_payload_is_dropped() {
        let (bus, _transport) = connected_bus().await;
        let (tx, mut rx) = mpsc::channel(8);
        bus.subscribe("a", Arc::new(ChannelConsumer::new(tx))).await;

        bus.publish_raw("a", Bytes::from_static(b"{not json"))
            .await
            .unwrap();
        bus.publish("a", &json!({"ok": true})).await.unwrap();

        let event = rx.recv().await.unwrap();
        assert_eq!(event.payload.to_value(), json!({"ok": true}));
    }
}
