//! In-process transport.
//!
//! Serves single-instance deployments (`memory://`) and tests. It records
//! every subscribe/unsubscribe call it receives and can drop its live
//! connections or refuse new ones to exercise reconnection.

use crate::error::{Error, Result};
use crate::event::BusMessage;
use crate::transport::{MessageStream, Transport, TransportSink};
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::debug;

#[derive(Clone, Default)]
pub struct MemoryTransport {
    inner: Arc<MemoryInner>,
}

#[derive(Default)]
struct MemoryInner {
    sessions: Mutex<Vec<Arc<MemorySession>>>,
    subscribe_calls: DashMap<String, usize>,
    unsubscribe_calls: DashMap<String, usize>,
    opens: AtomicUsize,
    failing_opens: AtomicUsize,
    published: AtomicUsize,
}

struct MemorySession {
    topics: Mutex<HashSet<String>>,
    tx: Mutex<Option<mpsc::UnboundedSender<BusMessage>>>,
}

impl MemorySession {
    fn is_alive(&self) -> bool {
        self.tx
            .lock()
            .map(|tx| tx.as_ref().is_some_and(|tx| !tx.is_closed()))
            .unwrap_or(false)
    }
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop every live connection; their message streams end.
    pub fn drop_connections(&self) {
        let sessions: Vec<Arc<MemorySession>> = match self.inner.sessions.lock() {
            Ok(mut sessions) => sessions.drain(..).collect(),
            Err(_) => return,
        };
        for session in sessions {
            if let Ok(mut tx) = session.tx.lock() {
                tx.take();
            }
        }
        debug!("Memory transport dropped all connections");
    }

    /// Make the next `count` calls to `open` fail.
    pub fn fail_next_opens(&self, count: usize) {
        self.inner.failing_opens.store(count, Ordering::SeqCst);
    }

    /// Subscribe calls received for `topic` across all connections.
    pub fn subscribe_calls(&self, topic: &str) -> usize {
        self.inner
            .subscribe_calls
            .get(topic)
            .map(|c| *c)
            .unwrap_or(0)
    }

    /// Unsubscribe calls received for `topic` across all connections.
    pub fn unsubscribe_calls(&self, topic: &str) -> usize {
        self.inner
            .unsubscribe_calls
            .get(topic)
            .map(|c| *c)
            .unwrap_or(0)
    }

    /// Number of successful `open` calls.
    pub fn open_count(&self) -> usize {
        self.inner.opens.load(Ordering::SeqCst)
    }

    /// Number of messages published.
    pub fn published_count(&self) -> usize {
        self.inner.published.load(Ordering::SeqCst)
    }

    /// Whether any live connection is subscribed to `topic`.
    pub fn is_subscribed(&self, topic: &str) -> bool {
        let Ok(sessions) = self.inner.sessions.lock() else {
            return false;
        };
        sessions.iter().any(|session| {
            session.is_alive()
                && session
                    .topics
                    .lock()
                    .map(|topics| topics.contains(topic))
                    .unwrap_or(false)
        })
    }
}

struct MemorySink {
    session: Arc<MemorySession>,
    inner: Arc<MemoryInner>,
}

#[async_trait]
impl TransportSink for MemorySink {
    async fn subscribe(&mut self, topic: &str) -> Result<()> {
        *self
            .inner
            .subscribe_calls
            .entry(topic.to_string())
            .or_default() += 1;
        if let Ok(mut topics) = self.session.topics.lock() {
            topics.insert(topic.to_string());
        }
        Ok(())
    }

    async fn unsubscribe(&mut self, topic: &str) -> Result<()> {
        *self
            .inner
            .unsubscribe_calls
            .entry(topic.to_string())
            .or_default() += 1;
        if let Ok(mut topics) = self.session.topics.lock() {
            topics.remove(topic);
        }
        Ok(())
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn open(&self) -> Result<(Box<dyn TransportSink>, MessageStream)> {
        let failing = self.inner.failing_opens.load(Ordering::SeqCst);
        if failing > 0 {
            self.inner.failing_opens.store(failing - 1, Ordering::SeqCst);
            return Err(Error::Unavailable("memory transport refused connection".into()));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let session = Arc::new(MemorySession {
            topics: Mutex::new(HashSet::new()),
            tx: Mutex::new(Some(tx)),
        });

        if let Ok(mut sessions) = self.inner.sessions.lock() {
            sessions.retain(|s| s.is_alive());
            sessions.push(session.clone());
        }
        self.inner.opens.fetch_add(1, Ordering::SeqCst);

        let sink = MemorySink {
            session,
            inner: self.inner.clone(),
        };
        Ok((Box::new(sink), Box::pin(UnboundedReceiverStream::new(rx))))
    }

    async fn publish(&self, topic: &str, payload: Bytes) -> Result<()> {
        self.inner.published.fetch_add(1, Ordering::SeqCst);

        let sessions: Vec<Arc<MemorySession>> = match self.inner.sessions.lock() {
            Ok(sessions) => sessions.clone(),
            Err(_) => return Err(Error::Unavailable("memory transport poisoned".into())),
        };

        for session in sessions {
            let subscribed = session
                .topics
                .lock()
                .map(|topics| topics.contains(topic))
                .unwrap_or(false);
            if !subscribed {
                continue;
            }
            if let Ok(tx) = session.tx.lock() {
                if let Some(tx) = tx.as_ref() {
                    let _ = tx.send(BusMessage {
                        topic: topic.to_string(),
                        payload: payload.clone(),
                    });
                }
            }
        }
        Ok(())
    }
}
