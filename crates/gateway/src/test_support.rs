//! Shared fixtures for gateway tests.

use crate::channel::ChannelRouter;
use crate::manager::{ManagerConfig, SubscriptionManager};
use crate::protocol::StreamFrame;
use async_trait::async_trait;
use common::BackoffConfig;
use event_bus::{EventBus, EventBusConfig, MemoryTransport};
use execution::{
    ExecutionEngine, ExecutionProxy, ExecutionRequest, ExecutionResult, RootValueSigner,
};
use serde_json::{Map, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

type Script = dyn Fn(&ExecutionRequest) -> execution::Result<ExecutionResult> + Send + Sync;

/// Execution engine answering from a closure.
pub(crate) struct ScriptedEngine {
    script: Box<Script>,
    delay: Option<Duration>,
    calls: AtomicUsize,
}

impl ScriptedEngine {
    pub(crate) fn new<F>(script: F) -> Self
    where
        F: Fn(&ExecutionRequest) -> execution::Result<ExecutionResult> + Send + Sync + 'static,
    {
        Self {
            script: Box::new(script),
            delay: None,
            calls: AtomicUsize::new(0),
        }
    }

    /// Project the event payload back as `{ [eventName]: payload }`.
    pub(crate) fn echo() -> Self {
        Self::new(|request| {
            let mut data = Map::new();
            if let Value::Object(root) = &request.root_value {
                for (key, value) in root {
                    if !matches!(key.as_str(), "subscriptionId" | "issuedAt" | "signature") {
                        data.insert(key.clone(), value.clone());
                    }
                }
            }
            Ok(ExecutionResult::data(Value::Object(data)))
        })
    }

    pub(crate) fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub(crate) fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ExecutionEngine for ScriptedEngine {
    fn name(&self) -> &'static str {
        "scripted"
    }

    async fn execute(&self, request: &ExecutionRequest) -> execution::Result<ExecutionResult> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        (self.script)(request)
    }

    async fn health_check(&self) -> execution::Result<()> {
        Ok(())
    }
}

pub(crate) struct Harness {
    pub manager: SubscriptionManager,
    pub bus: EventBus,
    pub transport: MemoryTransport,
    pub engine: Arc<ScriptedEngine>,
}

pub(crate) fn signer() -> RootValueSigner {
    RootValueSigner::new(
        "gateway-test-secret",
        Duration::from_secs(1),
        Duration::from_secs(30),
    )
    .unwrap()
}

pub(crate) async fn harness(engine: ScriptedEngine, config: ManagerConfig) -> Harness {
    let transport = MemoryTransport::new();
    let bus = EventBus::new(
        Arc::new(transport.clone()),
        EventBusConfig {
            reconnect: BackoffConfig {
                initial_delay: Duration::from_millis(5),
                max_delay: Duration::from_millis(20),
                max_attempts: None,
            },
        },
    );
    bus.connect().await.unwrap();

    let engine = Arc::new(engine);
    let proxy = ExecutionProxy::new(engine.clone(), signer());
    let manager = SubscriptionManager::new(bus.clone(), proxy, ChannelRouter::new(""), config);

    Harness {
        manager,
        bus,
        transport,
        engine,
    }
}

pub(crate) async fn next_frame(rx: &mut mpsc::Receiver<StreamFrame>) -> StreamFrame {
    tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("timed out waiting for frame")
        .expect("frame channel closed")
}

pub(crate) async fn assert_no_frame(rx: &mut mpsc::Receiver<StreamFrame>) {
    tokio::time::sleep(Duration::from_millis(50)).await;
    if let Ok(frame) = rx.try_recv() {
        panic!("unexpected frame: {frame:?}");
    }
}

pub(crate) async fn eventually<F: Fn() -> bool>(check: F) {
    for _ in 0..400 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not met in time");
}
