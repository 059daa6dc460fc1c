//! Reconnecting stream client.

use crate::error::{Error, Result};
use crate::sse::{self, SseDecoder, SseItem};
use common::{Backoff, BackoffConfig};
use futures::StreamExt;
use metrics::counter;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const STREAM_TOKEN_HEADER: &str = "x-stream-token";

#[derive(Debug, Clone)]
pub struct StreamClientConfig {
    /// Gateway origin, e.g. `http://localhost:4000`.
    pub base_url: String,
    /// Sent with every request, e.g. `authorization`.
    pub headers: HashMap<String, String>,
    pub reconnect: BackoffConfig,
    /// Timeout for reserve and register requests.
    pub request_timeout: Duration,
    /// The stream is considered dead after this long without any bytes,
    /// heartbeats included.
    pub stream_timeout: Duration,
}

impl Default for StreamClientConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:4000".to_string(),
            headers: HashMap::new(),
            reconnect: BackoffConfig {
                initial_delay: Duration::from_millis(500),
                max_delay: Duration::from_secs(30),
                max_attempts: Some(10),
            },
            request_timeout: Duration::from_secs(10),
            stream_timeout: Duration::from_secs(45),
        }
    }
}

/// A subscription operation the client keeps registered.
#[derive(Debug, Clone)]
pub struct Operation {
    pub id: String,
    pub query: String,
    pub variables: Map<String, Value>,
    pub operation_name: Option<String>,
}

impl Operation {
    pub fn new(id: impl Into<String>, query: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            query: query.into(),
            variables: Map::new(),
            operation_name: None,
        }
    }

    pub fn with_variables(mut self, variables: Map<String, Value>) -> Self {
        self.variables = variables;
        self
    }

    pub fn with_operation_name(mut self, name: impl Into<String>) -> Self {
        self.operation_name = Some(name.into());
        self
    }
}

/// What [`StreamClient::run`] reports.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    /// A stream is open and every operation is registered.
    Connected,
    Next { id: String, payload: Value },
    /// The server ended the operation; it will not be registered again.
    Complete { id: String },
    /// The gateway refused the operation; it has been dropped.
    Rejected { id: String, error: String },
    Reconnecting { attempt: u32, delay: Duration },
}

#[derive(Deserialize)]
struct NextFrame {
    id: String,
    payload: Value,
}

enum SessionEnd {
    /// The event receiver went away.
    Stopped,
}

pub struct StreamClient {
    config: StreamClientConfig,
    http: reqwest::Client,
    operations: Mutex<Vec<Operation>>,
    /// Token of the current session once reserved.
    token: Mutex<Option<String>>,
}

impl StreamClient {
    pub fn new(config: StreamClientConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(config.request_timeout)
            .build()?;
        Ok(Self {
            config,
            http,
            operations: Mutex::new(Vec::new()),
            token: Mutex::new(None),
        })
    }

    /// Add or replace an operation. During a live session it is registered
    /// right away, otherwise on the next handshake.
    pub async fn add_operation(&self, operation: Operation) -> Result<()> {
        {
            let mut operations = self.operations.lock().unwrap_or_else(|p| p.into_inner());
            operations.retain(|op| op.id != operation.id);
            operations.push(operation.clone());
        }

        let Some(token) = self.current_token() else {
            return Ok(());
        };
        match self.register(&token, &operation).await {
            Err(e) if e.is_rejection() => {
                self.forget(&operation.id);
                Err(e)
            }
            other => other,
        }
    }

    /// Stop an operation. Returns false if it was not known locally.
    pub async fn remove_operation(&self, id: &str) -> Result<bool> {
        if !self.forget(id) {
            return Ok(false);
        }
        if let Some(token) = self.current_token() {
            let response = self
                .request(self.http.delete(self.stream_url()))
                .header(STREAM_TOKEN_HEADER, &token)
                .query(&[("operationId", id)])
                .send()
                .await?;
            check_status(response).await?;
        }
        Ok(true)
    }

    /// Ids of the operations that will be registered on the next handshake.
    pub fn operation_ids(&self) -> Vec<String> {
        self.operations
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .iter()
            .map(|op| op.id.clone())
            .collect()
    }

    /// Keep a stream open until `shutdown` fires, reconnecting with a fresh
    /// handshake whenever it breaks. Fails once the reconnect budget is spent.
    pub async fn run(
        &self,
        events: mpsc::Sender<ClientEvent>,
        shutdown: CancellationToken,
    ) -> Result<()> {
        let mut backoff = Backoff::new(self.config.reconnect.clone());

        loop {
            let result = tokio::select! {
                _ = shutdown.cancelled() => Ok(SessionEnd::Stopped),
                result = self.session(&events, &mut backoff) => result,
            };
            self.set_token(None);

            let error = match result {
                Ok(SessionEnd::Stopped) => return Ok(()),
                Err(e) => e,
            };
            counter!("stream_client_disconnects_total").increment(1);

            let Some(delay) = backoff.next_delay() else {
                return Err(common::Error::RetriesExhausted {
                    attempts: backoff.attempts() + 1,
                    last_error: error.to_string(),
                }
                .into());
            };
            warn!("Stream failed: {}, reconnecting in {:?}", error, delay);

            let attempt = backoff.attempts();
            if events
                .send(ClientEvent::Reconnecting { attempt, delay })
                .await
                .is_err()
            {
                return Ok(());
            }
            tokio::select! {
                _ = shutdown.cancelled() => return Ok(()),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    /// One full handshake followed by reading the stream until it breaks.
    async fn session(
        &self,
        events: &mpsc::Sender<ClientEvent>,
        backoff: &mut Backoff,
    ) -> Result<SessionEnd> {
        let token = self.reserve().await?;
        self.set_token(Some(token.clone()));

        let operations = self
            .operations
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone();
        for operation in operations {
            match self.register(&token, &operation).await {
                Ok(()) => {}
                Err(e) if e.is_rejection() => {
                    warn!("Operation {} rejected: {}", operation.id, e);
                    self.forget(&operation.id);
                    let rejected = ClientEvent::Rejected {
                        id: operation.id,
                        error: e.to_string(),
                    };
                    if events.send(rejected).await.is_err() {
                        return Ok(SessionEnd::Stopped);
                    }
                }
                Err(e) => return Err(e),
            }
        }

        let response = self
            .request(self.http.get(self.stream_url()))
            .header(reqwest::header::ACCEPT, "text/event-stream")
            .query(&[("token", token.as_str())])
            .send()
            .await?;
        let response = check_status(response).await?;
        self.pump(response, events, backoff).await
    }

    async fn pump(
        &self,
        response: reqwest::Response,
        events: &mpsc::Sender<ClientEvent>,
        backoff: &mut Backoff,
    ) -> Result<SessionEnd> {
        let mut decoder = SseDecoder::new();
        let lines = sse::lines(response.bytes_stream());
        tokio::pin!(lines);

        loop {
            let line = match tokio::time::timeout(self.config.stream_timeout, lines.next()).await {
                Err(_) => return Err(Error::StreamTimeout(self.config.stream_timeout)),
                Ok(None) => return Err(Error::StreamEnded),
                Ok(Some(line)) => line?,
            };

            let Some(item) = decoder.push_line(&line) else {
                continue;
            };
            let Some(event) = self.interpret(item, backoff) else {
                continue;
            };
            if events.send(event).await.is_err() {
                return Ok(SessionEnd::Stopped);
            }
        }
    }

    fn interpret(&self, item: SseItem, backoff: &mut Backoff) -> Option<ClientEvent> {
        let event = match item {
            SseItem::Comment(comment) if comment == "connected" => {
                backoff.reset();
                counter!("stream_client_connections_total").increment(1);
                info!("Stream established");
                return Some(ClientEvent::Connected);
            }
            SseItem::Comment(_) => return None,
            SseItem::Event(event) => event,
        };

        match event.event.as_deref() {
            Some("next") => match serde_json::from_str::<NextFrame>(&event.data) {
                Ok(frame) => {
                    counter!("stream_client_frames_total").increment(1);
                    Some(ClientEvent::Next {
                        id: frame.id,
                        payload: frame.payload,
                    })
                }
                Err(e) => {
                    warn!("Dropping malformed next frame: {}", e);
                    None
                }
            },
            Some("complete") => {
                let id = event.id.unwrap_or_default();
                self.forget(&id);
                debug!("Operation {} completed by server", id);
                Some(ClientEvent::Complete { id })
            }
            other => {
                debug!("Ignoring SSE event {:?}", other);
                None
            }
        }
    }

    async fn reserve(&self) -> Result<String> {
        let response = self
            .request(self.http.put(self.stream_url()))
            .timeout(self.config.request_timeout)
            .send()
            .await?;
        let token = check_status(response).await?.text().await?;
        Ok(token.trim().to_string())
    }

    async fn register(&self, token: &str, operation: &Operation) -> Result<()> {
        let body = json!({
            "query": operation.query,
            "variables": operation.variables,
            "operationName": operation.operation_name,
            "extensions": { "operationId": operation.id },
        });
        let response = self
            .request(self.http.post(self.stream_url()))
            .timeout(self.config.request_timeout)
            .header(STREAM_TOKEN_HEADER, token)
            .json(&body)
            .send()
            .await?;

        match check_status(response).await {
            // Registered concurrently by add_operation.
            Err(Error::Status { status: 409, .. }) => Ok(()),
            other => other.map(|_| ()),
        }
    }

    fn request(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        self.config
            .headers
            .iter()
            .fold(builder, |builder, (name, value)| builder.header(name, value))
    }

    fn stream_url(&self) -> String {
        format!("{}/stream", self.config.base_url.trim_end_matches('/'))
    }

    fn current_token(&self) -> Option<String> {
        self.token.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    fn set_token(&self, token: Option<String>) {
        *self.token.lock().unwrap_or_else(|p| p.into_inner()) = token;
    }

    fn forget(&self, id: &str) -> bool {
        let mut operations = self.operations.lock().unwrap_or_else(|p| p.into_inner());
        let before = operations.len();
        operations.retain(|op| op.id != id);
        operations.len() != before
    }
}

async fn check_status(response: reqwest::Response) -> Result<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(Error::Status {
        status: status.as_u16(),
        body,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use event_bus::{EventBus, EventBusConfig, MemoryTransport};
    use execution::{
        ExecutionEngine, ExecutionProxy, ExecutionRequest, ExecutionResult, RootValueSigner,
    };
    use gateway::{
        create_router, AllowedOrigins, AppState, ChannelRouter, ConnectionConfig,
        ConnectionRegistry, ManagerConfig, SubscriptionManager,
    };
    use std::sync::Arc;
    use tokio::net::TcpListener;

    /// Answers with the event payload under its event name.
    struct EchoEngine;

    #[async_trait]
    impl ExecutionEngine for EchoEngine {
        fn name(&self) -> &'static str {
            "echo"
        }

        async fn execute(&self, request: &ExecutionRequest) -> execution::Result<ExecutionResult> {
            let mut data = request.root_value.as_object().cloned().unwrap_or_default();
            for key in ["subscriptionId", "issuedAt", "signature"] {
                data.remove(key);
            }
            Ok(ExecutionResult::data(Value::Object(data)))
        }

        async fn health_check(&self) -> execution::Result<()> {
            Ok(())
        }
    }

    struct Gateway {
        base_url: String,
        state: Arc<AppState>,
        bus: EventBus,
    }

    async fn gateway() -> Gateway {
        let bus = EventBus::new(Arc::new(MemoryTransport::new()), EventBusConfig::default());
        bus.connect().await.unwrap();

        let signer = RootValueSigner::new(
            "stream-client-test-secret",
            Duration::from_secs(1),
            Duration::from_secs(30),
        )
        .unwrap();
        let manager = SubscriptionManager::new(
            bus.clone(),
            ExecutionProxy::new(Arc::new(EchoEngine), signer),
            ChannelRouter::new(""),
            ManagerConfig::default(),
        );
        let state = Arc::new(AppState {
            registry: Arc::new(ConnectionRegistry::new(
                manager.clone(),
                ConnectionConfig::default(),
            )),
            manager,
            publisher: None,
            heartbeat_interval: Duration::from_secs(15),
        });

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = create_router(state.clone(), &AllowedOrigins::Any);
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Gateway {
            base_url: format!("http://{addr}"),
            state,
            bus,
        }
    }

    fn config(base_url: &str) -> StreamClientConfig {
        StreamClientConfig {
            base_url: base_url.to_string(),
            reconnect: BackoffConfig {
                initial_delay: Duration::from_millis(10),
                max_delay: Duration::from_millis(50),
                max_attempts: Some(3),
            },
            request_timeout: Duration::from_secs(2),
            ..Default::default()
        }
    }

    async fn next_event(rx: &mut mpsc::Receiver<ClientEvent>) -> ClientEvent {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for client event")
            .expect("client event channel closed")
    }

    async fn wait_for<F: Fn(&ClientEvent) -> bool>(
        rx: &mut mpsc::Receiver<ClientEvent>,
        matches: F,
    ) -> ClientEvent {
        loop {
            let event = next_event(rx).await;
            if matches(&event) {
                return event;
            }
        }
    }

    fn start(
        client: Arc<StreamClient>,
    ) -> (
        mpsc::Receiver<ClientEvent>,
        CancellationToken,
        tokio::task::JoinHandle<Result<()>>,
    ) {
        let (tx, rx) = mpsc::channel(64);
        let shutdown = CancellationToken::new();
        let token = shutdown.clone();
        let handle = tokio::spawn(async move { client.run(tx, token).await });
        (rx, shutdown, handle)
    }

    #[tokio::test]
    async fn test_receives_results_for_registered_operations() {
        let gateway = gateway().await;
        let client = Arc::new(StreamClient::new(config(&gateway.base_url)).unwrap());
        client
            .add_operation(Operation::new(
                "op-1",
                "subscription { itemChanged(id: \"7\") { title } }",
            ))
            .await
            .unwrap();

        let (mut rx, shutdown, handle) = start(client.clone());
        assert_eq!(next_event(&mut rx).await, ClientEvent::Connected);

        gateway
            .bus
            .publish("itemChanged.7", &json!({"title": "hello"}))
            .await
            .unwrap();
        match next_event(&mut rx).await {
            ClientEvent::Next { id, payload } => {
                assert_eq!(id, "op-1");
                assert_eq!(payload["data"]["itemChanged"]["title"], "hello");
            }
            other => panic!("unexpected event: {other:?}"),
        }

        // Registered live on the open session.
        client
            .add_operation(Operation::new("op-2", "subscription { itemChanged { title } }"))
            .await
            .unwrap();
        assert_eq!(gateway.state.manager.subscription_count(), 2);

        assert!(client.remove_operation("op-1").await.unwrap());
        assert_eq!(
            wait_for(&mut rx, |e| matches!(e, ClientEvent::Complete { .. })).await,
            ClientEvent::Complete { id: "op-1".into() }
        );

        shutdown.cancel();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_reconnects_and_reregisters_after_silent_stream() {
        let gateway = gateway().await;
        let client = Arc::new(
            StreamClient::new(StreamClientConfig {
                stream_timeout: Duration::from_millis(200),
                ..config(&gateway.base_url)
            })
            .unwrap(),
        );
        client
            .add_operation(Operation::new("op-1", "subscription { itemChanged { title } }"))
            .await
            .unwrap();

        let (mut rx, shutdown, handle) = start(client.clone());
        assert_eq!(next_event(&mut rx).await, ClientEvent::Connected);
        assert!(matches!(
            next_event(&mut rx).await,
            ClientEvent::Reconnecting { attempt: 1, .. }
        ));
        assert_eq!(next_event(&mut rx).await, ClientEvent::Connected);

        gateway
            .bus
            .publish("itemChanged", &json!({"title": "again"}))
            .await
            .unwrap();
        let event = wait_for(&mut rx, |e| matches!(e, ClientEvent::Next { .. })).await;
        assert!(matches!(event, ClientEvent::Next { ref id, .. } if id == "op-1"));

        shutdown.cancel();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_completed_operations_are_not_reregistered() {
        let gateway = gateway().await;
        let client = Arc::new(StreamClient::new(config(&gateway.base_url)).unwrap());
        client
            .add_operation(Operation::new("op-1", "subscription { itemChanged { title } }"))
            .await
            .unwrap();

        let (mut rx, shutdown, handle) = start(client.clone());
        assert_eq!(next_event(&mut rx).await, ClientEvent::Connected);

        gateway.state.shutdown().await;
        assert_eq!(
            wait_for(&mut rx, |e| matches!(e, ClientEvent::Complete { .. })).await,
            ClientEvent::Complete { id: "op-1".into() }
        );
        wait_for(&mut rx, |e| *e == ClientEvent::Connected).await;
        assert!(client.operation_ids().is_empty());
        assert_eq!(gateway.state.manager.subscription_count(), 0);

        shutdown.cancel();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_rejected_operation_is_dropped() {
        let gateway = gateway().await;
        let client = Arc::new(StreamClient::new(config(&gateway.base_url)).unwrap());
        client
            .add_operation(Operation::new("bad", "query { item { id } }"))
            .await
            .unwrap();

        let (mut rx, shutdown, handle) = start(client.clone());
        assert!(matches!(
            next_event(&mut rx).await,
            ClientEvent::Rejected { ref id, .. } if id == "bad"
        ));
        assert_eq!(next_event(&mut rx).await, ClientEvent::Connected);
        assert!(client.operation_ids().is_empty());

        shutdown.cancel();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_gives_up_after_max_attempts() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let client = Arc::new(StreamClient::new(config(&format!("http://{addr}"))).unwrap());
        let (mut rx, _shutdown, handle) = start(client);

        for expected in 1..=3 {
            assert!(matches!(
                next_event(&mut rx).await,
                ClientEvent::Reconnecting { attempt, .. } if attempt == expected
            ));
        }
        let err = tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap()
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Reconnect(common::Error::RetriesExhausted { attempts: 4, .. })
        ));
    }

    #[test]
    fn test_rejection_classification() {
        let status = |status| Error::Status {
            status,
            body: String::new(),
        };
        assert!(status(400).is_rejection());
        assert!(!status(404).is_rejection());
        assert!(!status(409).is_rejection());
        assert!(!status(502).is_rejection());
        assert!(!Error::StreamEnded.is_rejection());
    }
}
