//! Client connections and the reservation token registry.
//!
//! A connection starts `Reserved` when its token is issued, becomes
//! `Streaming` once the client opens the event stream, and ends as
//! `Disconnected` (client left, idle, shutdown) or `Error` (the stream
//! could not be written). Closing a connection removes every subscription
//! it owns and invalidates its token.

use crate::error::{GatewayError, Result};
use crate::manager::{OperationSink, Subscription, SubscriptionManager, SubscriptionRequest};
use crate::protocol::StreamFrame;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use metrics::{counter, gauge};
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Longest accepted operation id.
const MAX_OPERATION_ID_LEN: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Reserved,
    Streaming,
    Error,
}

#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    pub max_subscriptions: usize,
    /// Frames buffered per connection before results are dropped.
    pub stream_buffer_size: usize,
    /// How long a token may stay unused before it expires.
    pub reservation_timeout: Duration,
    /// How long a stream may stay open with no operations.
    pub idle_timeout: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            max_subscriptions: 32,
            stream_buffer_size: 256,
            reservation_timeout: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(300),
        }
    }
}

/// One client session.
pub struct Connection {
    id: String,
    token: String,
    state: Mutex<ConnectionState>,
    created_at: DateTime<Utc>,
    /// Milliseconds since the epoch of the last operation change.
    last_activity: AtomicI64,
    /// operation id -> subscription id
    operations: tokio::sync::Mutex<HashMap<String, String>>,
    operation_count: AtomicUsize,
    frames: mpsc::Sender<StreamFrame>,
    pending_frames: Mutex<Option<mpsc::Receiver<StreamFrame>>>,
    cancel: CancellationToken,
}

impl Connection {
    fn new(buffer: usize) -> Self {
        let (frames, pending) = mpsc::channel(buffer.max(1));
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().simple().to_string(),
            token: Uuid::new_v4().simple().to_string(),
            state: Mutex::new(ConnectionState::Reserved),
            created_at: now,
            last_activity: AtomicI64::new(now.timestamp_millis()),
            operations: tokio::sync::Mutex::new(HashMap::new()),
            operation_count: AtomicUsize::new(0),
            frames,
            pending_frames: Mutex::new(Some(pending)),
            cancel: CancellationToken::new(),
        }
    }

    /// Identifier safe to log, unlike the token.
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn operation_count(&self) -> usize {
        self.operation_count.load(Ordering::SeqCst)
    }

    /// Cancelled when the connection is closed.
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    fn set_state(&self, state: ConnectionState) {
        *self.state.lock().unwrap_or_else(|p| p.into_inner()) = state;
    }

    fn is_open(&self) -> bool {
        matches!(
            self.state(),
            ConnectionState::Reserved | ConnectionState::Streaming
        )
    }

    fn touch(&self) {
        self.last_activity
            .store(Utc::now().timestamp_millis(), Ordering::SeqCst);
    }

    fn idle_for(&self, now: DateTime<Utc>) -> Duration {
        let idle_ms = now.timestamp_millis() - self.last_activity.load(Ordering::SeqCst);
        Duration::from_millis(idle_ms.max(0) as u64)
    }
}

/// All live connections, keyed by reservation token.
pub struct ConnectionRegistry {
    connections: DashMap<String, Arc<Connection>>,
    manager: SubscriptionManager,
    config: ConnectionConfig,
}

impl ConnectionRegistry {
    pub fn new(manager: SubscriptionManager, config: ConnectionConfig) -> Self {
        Self {
            connections: DashMap::new(),
            manager,
            config,
        }
    }

    /// Issue a new token.
    pub fn reserve(&self) -> Arc<Connection> {
        let connection = Arc::new(Connection::new(self.config.stream_buffer_size));
        self.connections
            .insert(connection.token.clone(), connection.clone());

        counter!("gateway_reservations_total").increment(1);
        gauge!("gateway_active_connections").set(self.connections.len() as f64);
        debug!("Reserved connection {}", connection.id);
        connection
    }

    pub fn get(&self, token: &str) -> Option<Arc<Connection>> {
        self.connections.get(token).map(|c| c.clone())
    }

    pub fn count(&self) -> usize {
        self.connections.len()
    }

    /// Register an operation on the connection identified by `token`.
    pub async fn register_operation(
        &self,
        token: &str,
        operation_id: &str,
        request: SubscriptionRequest,
    ) -> Result<Arc<Subscription>> {
        let connection = self.get(token).ok_or(GatewayError::UnknownToken)?;
        validate_operation_id(operation_id)?;

        let mut operations = connection.operations.lock().await;
        if !connection.is_open() {
            return Err(GatewayError::UnknownToken);
        }
        self.prune(&connection, &mut operations);
        if operations.contains_key(operation_id) {
            return Err(GatewayError::DuplicateOperation(operation_id.to_string()));
        }
        if operations.len() >= self.config.max_subscriptions {
            return Err(GatewayError::SubscriptionLimit(self.config.max_subscriptions));
        }

        let sink = OperationSink::new(operation_id, connection.frames.clone());
        let subscription = self.manager.create(&connection.id, request, sink).await?;

        operations.insert(operation_id.to_string(), subscription.id.clone());
        connection
            .operation_count
            .store(operations.len(), Ordering::SeqCst);
        connection.touch();

        debug!(
            "Connection {} registered operation {} on {}",
            connection.id, operation_id, subscription.topic
        );
        Ok(subscription)
    }

    /// Stop one operation. The client receives `complete`. Returns false if
    /// the operation was not registered.
    pub async fn unregister_operation(&self, token: &str, operation_id: &str) -> Result<bool> {
        let connection = self.get(token).ok_or(GatewayError::UnknownToken)?;

        let subscription_id = {
            let mut operations = connection.operations.lock().await;
            let removed = operations.remove(operation_id);
            connection
                .operation_count
                .store(operations.len(), Ordering::SeqCst);
            removed
        };
        connection.touch();

        match subscription_id {
            Some(id) => {
                self.manager.remove(&id).await;
                debug!(
                    "Connection {} unregistered operation {}",
                    connection.id, operation_id
                );
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Move the connection to `Streaming` and hand out its frame receiver.
    pub fn open_stream(
        &self,
        token: &str,
    ) -> Result<(Arc<Connection>, mpsc::Receiver<StreamFrame>)> {
        let connection = self.get(token).ok_or(GatewayError::UnknownToken)?;

        let mut state = connection.state.lock().unwrap_or_else(|p| p.into_inner());
        match *state {
            ConnectionState::Reserved => {}
            ConnectionState::Streaming => return Err(GatewayError::AlreadyStreaming),
            ConnectionState::Disconnected | ConnectionState::Error => {
                return Err(GatewayError::UnknownToken)
            }
        }
        let frames = connection
            .pending_frames
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .take()
            .ok_or(GatewayError::AlreadyStreaming)?;
        *state = ConnectionState::Streaming;
        drop(state);

        connection.touch();
        counter!("gateway_streams_opened_total").increment(1);
        info!("Connection {} streaming", connection.id);
        Ok((connection, frames))
    }

    /// Close a connection, removing its subscriptions. Idempotent.
    pub async fn close(&self, token: &str, final_state: ConnectionState) -> bool {
        let Some((_, connection)) = self.connections.remove(token) else {
            return false;
        };
        connection.set_state(final_state);
        connection.cancel.cancel();

        let subscriptions: Vec<String> = {
            let mut operations = connection.operations.lock().await;
            connection.operation_count.store(0, Ordering::SeqCst);
            operations.drain().map(|(_, id)| id).collect()
        };
        for id in &subscriptions {
            self.manager.remove(id).await;
        }

        counter!("gateway_connections_closed_total").increment(1);
        gauge!("gateway_active_connections").set(self.connections.len() as f64);
        info!(
            "Connection {} closed ({:?}), removed {} subscriptions",
            connection.id,
            final_state,
            subscriptions.len()
        );
        true
    }

    /// Close every connection.
    pub async fn close_all(&self) -> usize {
        let tokens: Vec<String> = self
            .connections
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        let mut closed = 0;
        for token in tokens {
            if self.close(&token, ConnectionState::Disconnected).await {
                closed += 1;
            }
        }
        closed
    }

    /// Close reservations never streamed within the reservation timeout and
    /// streams that have had no operations for the idle timeout.
    pub async fn expire(&self, now: DateTime<Utc>) -> usize {
        let connections: Vec<Arc<Connection>> = self
            .connections
            .iter()
            .map(|entry| entry.value().clone())
            .collect();

        let mut closed = 0;
        for connection in connections {
            let state = connection.state();
            let stale = match state {
                ConnectionState::Reserved => {
                    let age = (now - connection.created_at).to_std().unwrap_or_default();
                    age > self.config.reservation_timeout
                }
                ConnectionState::Streaming => {
                    let mut operations = connection.operations.lock().await;
                    self.prune(&connection, &mut operations);
                    operations.is_empty()
                        && connection.idle_for(now) > self.config.idle_timeout
                }
                _ => false,
            };

            if stale && self.close(&connection.token, ConnectionState::Disconnected).await {
                counter!("gateway_connections_expired_total").increment(1);
                warn!("Expired {:?} connection {}", state, connection.id);
                closed += 1;
            }
        }
        closed
    }

    /// Drop operations whose subscription the manager already removed, e.g.
    /// after repeated execution failures or an event bus shutdown.
    fn prune(&self, connection: &Connection, operations: &mut HashMap<String, String>) {
        let before = operations.len();
        operations.retain(|_, subscription_id| self.manager.get(subscription_id).is_some());
        if operations.len() != before {
            connection
                .operation_count
                .store(operations.len(), Ordering::SeqCst);
            connection.touch();
        }
    }

    fn janitor_period(&self) -> Duration {
        (self.config.reservation_timeout.min(self.config.idle_timeout) / 4)
            .clamp(Duration::from_millis(100), Duration::from_secs(5))
    }

    /// Run [`ConnectionRegistry::expire`] periodically until cancelled.
    pub fn spawn_janitor(self: Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let period = self.janitor_period();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        self.expire(Utc::now()).await;
                    }
                }
            }
            debug!("Connection janitor stopped");
        })
    }
}

fn validate_operation_id(operation_id: &str) -> Result<()> {
    if operation_id.is_empty() {
        return Err(GatewayError::InvalidOperationId("must not be empty".into()));
    }
    if operation_id.len() > MAX_OPERATION_ID_LEN {
        return Err(GatewayError::InvalidOperationId(format!(
            "longer than {} bytes",
            MAX_OPERATION_ID_LEN
        )));
    }
    if operation_id.chars().any(char::is_control) {
        return Err(GatewayError::InvalidOperationId(
            "contains control characters".into(),
        ));
    }
    Ok(())
}
