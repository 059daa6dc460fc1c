//! Subscription lifecycle manager.
//!
//! Owns the subscription table and the per-topic reference counts. The
//! first subscription on a topic registers one consumer with the event bus;
//! the last one leaving unregisters it. Every subscription has its own
//! bounded queue and worker task, so results for one subscription arrive in
//! event order while a slow or failing execution never holds up others on
//! the same topic.

use crate::channel::ChannelRouter;
use crate::document::parse_subscription;
use crate::error::Result;
use crate::protocol::{subscription_error, StreamFrame};
use chrono::{DateTime, Utc};
use common::KeyedLocks;
use dashmap::DashMap;
use event_bus::{BusEvent, EventBus, EventConsumer, HandlerId};
use execution::{ExecutionOutcome, ExecutionProxy, SubscriptionExecution};
use metrics::{counter, gauge};
use serde_json::{Map, Value};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Message sent to clients when the engine cannot be reached.
const EXECUTION_FAILED_MESSAGE: &str = "Failed to execute subscription";

#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Pending events buffered per subscription.
    pub queue_size: usize,
    /// Close a subscription after this many consecutive execution failures.
    /// Zero disables.
    pub max_consecutive_failures: u32,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            queue_size: 64,
            max_consecutive_failures: 0,
        }
    }
}

/// Output side of one operation on a connection's stream.
///
/// After `complete` every further `next` is dropped.
#[derive(Clone)]
pub struct OperationSink {
    operation_id: Arc<str>,
    frames: mpsc::Sender<StreamFrame>,
    completed: Arc<Mutex<bool>>,
}

impl OperationSink {
    pub fn new(operation_id: impl Into<Arc<str>>, frames: mpsc::Sender<StreamFrame>) -> Self {
        Self {
            operation_id: operation_id.into(),
            frames,
            completed: Arc::new(Mutex::new(false)),
        }
    }

    pub fn operation_id(&self) -> &str {
        &self.operation_id
    }

    pub fn is_completed(&self) -> bool {
        *self.completed.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Queue a `next` frame. Returns whether it was queued.
    pub fn next(&self, payload: Value) -> bool {
        let completed = self.completed.lock().unwrap_or_else(|p| p.into_inner());
        if *completed {
            debug!("Dropping result for completed operation {}", self.operation_id);
            return false;
        }

        let frame = StreamFrame::Next {
            id: self.operation_id.to_string(),
            payload,
        };
        match self.frames.try_send(frame) {
            Ok(()) => {
                counter!("gateway_frames_sent_total", "frame" => "next").increment(1);
                true
            }
            Err(TrySendError::Full(_)) => {
                counter!("gateway_frames_dropped_total").increment(1);
                warn!(
                    "Stream buffer full, dropping frame for operation {}",
                    self.operation_id
                );
                false
            }
            Err(TrySendError::Closed(_)) => {
                debug!("Stream closed, dropping frame for {}", self.operation_id);
                false
            }
        }
    }

    /// Queue the terminal `complete` frame. Returns false if already completed.
    pub fn complete(&self) -> bool {
        {
            let mut completed = self.completed.lock().unwrap_or_else(|p| p.into_inner());
            if *completed {
                return false;
            }
            *completed = true;
        }

        let frame = StreamFrame::Complete {
            id: self.operation_id.to_string(),
        };
        match self.frames.try_send(frame) {
            Ok(()) => counter!("gateway_frames_sent_total", "frame" => "complete").increment(1),
            Err(TrySendError::Full(frame)) => {
                // Must not be lost; wait for room off the caller's path.
                let frames = self.frames.clone();
                tokio::spawn(async move {
                    let _ = frames.send(frame).await;
                });
            }
            Err(TrySendError::Closed(_)) => {
                debug!("Stream closed before complete for {}", self.operation_id)
            }
        }
        true
    }
}

/// What a client asked to subscribe to.
#[derive(Debug, Clone, Default)]
pub struct SubscriptionRequest {
    pub query: String,
    pub variables: Map<String, Value>,
    pub operation_name: Option<String>,
    /// Forwarded to the execution engine.
    pub headers: HashMap<String, String>,
}

/// A registered subscription.
#[derive(Debug, Clone)]
pub struct Subscription {
    pub id: String,
    pub connection_id: String,
    pub operation_id: String,
    pub event_name: String,
    pub arguments: Map<String, Value>,
    pub topic: String,
    pub query: String,
    pub variables: Map<String, Value>,
    pub operation_name: Option<String>,
    pub created_at: DateTime<Utc>,
}

struct ActiveSubscription {
    info: Arc<Subscription>,
    sink: OperationSink,
    queue: mpsc::Sender<BusEvent>,
    cancel: CancellationToken,
}

struct TopicEntry {
    handler: HandlerId,
    subscribers: HashSet<String>,
}

/// Cheaply cloneable handle to the subscription table.
#[derive(Clone)]
pub struct SubscriptionManager {
    inner: Arc<ManagerInner>,
}

struct ManagerInner {
    bus: EventBus,
    proxy: ExecutionProxy,
    router: ChannelRouter,
    config: ManagerConfig,
    subscriptions: DashMap<String, ActiveSubscription>,
    topics: DashMap<String, TopicEntry>,
    topic_locks: KeyedLocks<String>,
}

impl SubscriptionManager {
    pub fn new(
        bus: EventBus,
        proxy: ExecutionProxy,
        router: ChannelRouter,
        config: ManagerConfig,
    ) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                bus,
                proxy,
                router,
                config,
                subscriptions: DashMap::new(),
                topics: DashMap::new(),
                topic_locks: KeyedLocks::new(),
            }),
        }
    }

    /// Validate `request`, derive its topic and start delivering events to
    /// `sink`. Nothing is registered when validation fails.
    pub async fn create(
        &self,
        connection_id: &str,
        request: SubscriptionRequest,
        sink: OperationSink,
    ) -> Result<Arc<Subscription>> {
        self.inner.create(connection_id, request, sink).await
    }

    /// Remove a subscription and send `complete` to its sink. Returns false
    /// if the id is unknown.
    pub async fn remove(&self, id: &str) -> bool {
        self.inner.remove(id).await
    }

    /// Queue `event` for every subscription watching `topic`.
    pub fn on_event(&self, topic: &str, event: BusEvent) {
        self.inner.on_event(topic, event)
    }

    /// Remove every subscription. Returns how many were removed.
    pub async fn shutdown(&self) -> usize {
        let ids: Vec<String> = self
            .inner
            .subscriptions
            .iter()
            .map(|entry| entry.key().clone())
            .collect();

        let mut removed = 0;
        for id in ids {
            if self.inner.remove(&id).await {
                removed += 1;
            }
        }
        info!("Subscription manager shut down, removed {} subscriptions", removed);
        removed
    }

    pub fn get(&self, id: &str) -> Option<Arc<Subscription>> {
        self.inner.subscriptions.get(id).map(|s| s.info.clone())
    }

    /// Number of subscriptions watching `topic`.
    pub fn topic_ref_count(&self, topic: &str) -> usize {
        self.inner
            .topics
            .get(topic)
            .map(|entry| entry.subscribers.len())
            .unwrap_or(0)
    }

    pub fn subscription_count(&self) -> usize {
        self.inner.subscriptions.len()
    }

    pub fn topic_count(&self) -> usize {
        self.inner.topics.len()
    }

    pub fn router(&self) -> &ChannelRouter {
        &self.inner.router
    }
}

impl ManagerInner {
    async fn create(
        self: &Arc<Self>,
        connection_id: &str,
        request: SubscriptionRequest,
        sink: OperationSink,
    ) -> Result<Arc<Subscription>> {
        let parsed = parse_subscription(
            &request.query,
            &request.variables,
            request.operation_name.as_deref(),
        )?;
        let topic = self.router.build(&parsed.event_name, &parsed.arguments)?;

        let info = Arc::new(Subscription {
            id: Uuid::new_v4().simple().to_string(),
            connection_id: connection_id.to_string(),
            operation_id: sink.operation_id().to_string(),
            event_name: parsed.event_name,
            arguments: parsed.arguments,
            topic: topic.clone(),
            query: request.query,
            variables: request.variables,
            operation_name: request.operation_name,
            created_at: Utc::now(),
        });
        let execution = SubscriptionExecution {
            subscription_id: info.id.clone(),
            event_name: info.event_name.clone(),
            query: info.query.clone(),
            variables: info.variables.clone(),
            operation_name: info.operation_name.clone(),
            headers: request.headers,
        };

        let (queue, events) = mpsc::channel(self.config.queue_size.max(1));
        let cancel = CancellationToken::new();

        {
            let _guard = self.topic_locks.lock(&topic).await;

            self.subscriptions.insert(
                info.id.clone(),
                ActiveSubscription {
                    info: info.clone(),
                    sink: sink.clone(),
                    queue,
                    cancel: cancel.clone(),
                },
            );

            let mut watched = false;
            if let Some(mut entry) = self.topics.get_mut(&topic) {
                entry.subscribers.insert(info.id.clone());
                watched = true;
            }
            if !watched {
                let consumer = Arc::new(TopicConsumer {
                    topic: topic.clone(),
                    manager: Arc::downgrade(self),
                });
                let handler = self.bus.subscribe(&topic, consumer).await;
                self.topics.insert(
                    topic.clone(),
                    TopicEntry {
                        handler,
                        subscribers: HashSet::from([info.id.clone()]),
                    },
                );
                info!("Watching topic {}", topic);
            }
        }

        let worker = Worker {
            info: info.clone(),
            execution,
            sink,
            events,
            cancel,
            proxy: self.proxy.clone(),
            manager: Arc::downgrade(self),
            max_failures: self.config.max_consecutive_failures,
        };
        tokio::spawn(worker.run());

        counter!("gateway_subscriptions_created_total").increment(1);
        self.update_gauges();
        debug!(
            "Subscription {} ({}) on {} for connection {}",
            info.id, info.operation_id, topic, connection_id
        );
        Ok(info)
    }

    async fn remove(&self, id: &str) -> bool {
        let Some((_, active)) = self.subscriptions.remove(id) else {
            return false;
        };
        active.cancel.cancel();

        let topic = active.info.topic.as_str();
        {
            let _guard = self.topic_locks.lock(&active.info.topic).await;

            let mut released = None;
            if let Some(mut entry) = self.topics.get_mut(topic) {
                entry.subscribers.remove(id);
                if entry.subscribers.is_empty() {
                    released = Some(entry.handler);
                }
            }
            if let Some(handler) = released {
                self.topics.remove(topic);
                self.bus.unsubscribe(topic, handler).await;
                info!("Released topic {}", topic);
            }
        }

        active.sink.complete();
        counter!("gateway_subscriptions_removed_total").increment(1);
        self.update_gauges();
        debug!("Removed subscription {} ({})", id, active.info.operation_id);
        true
    }

    async fn remove_topic(&self, topic: &str) {
        let ids: Vec<String> = self
            .topics
            .get(topic)
            .map(|entry| entry.subscribers.iter().cloned().collect())
            .unwrap_or_default();
        for id in ids {
            self.remove(&id).await;
        }
    }

    fn on_event(&self, topic: &str, event: BusEvent) {
        let ids: Vec<String> = match self.topics.get(topic) {
            Some(entry) => entry.subscribers.iter().cloned().collect(),
            None => {
                debug!("No subscriptions for {}", topic);
                return;
            }
        };

        counter!("gateway_events_received_total").increment(1);
        for id in ids {
            let Some(queue) = self.subscriptions.get(&id).map(|s| s.queue.clone()) else {
                continue;
            };
            match queue.try_send(event.clone()) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    counter!("gateway_events_dropped_total").increment(1);
                    warn!("Queue full for subscription {}, dropping event on {}", id, topic);
                }
                Err(TrySendError::Closed(_)) => {
                    debug!("Subscription {} stopped, skipping event", id);
                }
            }
        }
    }

    fn update_gauges(&self) {
        gauge!("gateway_active_subscriptions").set(self.subscriptions.len() as f64);
        gauge!("gateway_active_topics").set(self.topics.len() as f64);
    }
}

/// Bus consumer for one topic, forwarding into the manager.
struct TopicConsumer {
    topic: String,
    manager: Weak<ManagerInner>,
}

impl EventConsumer for TopicConsumer {
    fn deliver(&self, event: BusEvent) {
        if let Some(manager) = self.manager.upgrade() {
            manager.on_event(&self.topic, event);
        }
    }

    fn complete(&self) {
        if let Some(manager) = self.manager.upgrade() {
            let topic = self.topic.clone();
            tokio::spawn(async move {
                manager.remove_topic(&topic).await;
            });
        }
    }
}

struct Worker {
    info: Arc<Subscription>,
    execution: SubscriptionExecution,
    sink: OperationSink,
    events: mpsc::Receiver<BusEvent>,
    cancel: CancellationToken,
    proxy: ExecutionProxy,
    manager: Weak<ManagerInner>,
    max_failures: u32,
}

impl Worker {
    async fn run(mut self) {
        let mut failures = 0u32;

        loop {
            let event = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                event = self.events.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
            };

            let outcome = self.proxy.execute(&self.execution, &event).await;
            if self.cancel.is_cancelled() {
                debug!("Discarding result for removed subscription {}", self.info.id);
                break;
            }

            match outcome {
                ExecutionOutcome::Next(result) => {
                    failures = 0;
                    match serde_json::to_value(&result) {
                        Ok(payload) => {
                            self.sink.next(payload);
                        }
                        Err(e) => warn!("Failed to encode result for {}: {}", self.info.id, e),
                    }
                }
                ExecutionOutcome::Filtered => failures = 0,
                ExecutionOutcome::Failed(e) => {
                    failures += 1;
                    debug!(
                        "Execution failure {} for {}: {}",
                        failures, self.info.id, e
                    );
                    self.sink.next(subscription_error(EXECUTION_FAILED_MESSAGE));

                    if self.max_failures > 0 && failures >= self.max_failures {
                        warn!(
                            "Closing subscription {} after {} consecutive failures",
                            self.info.id, failures
                        );
                        counter!("gateway_subscriptions_failed_total").increment(1);
                        if let Some(manager) = self.manager.upgrade() {
                            manager.remove(&self.info.id).await;
                        }
                        break;
                    }
                }
            }
        }

        debug!("Worker for subscription {} stopped", self.info.id);
    }
}
