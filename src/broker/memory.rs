//! In-process broker.
//!
//! Records every message instead of sending it. Used by `snapshot --dry-run`
//! and by tests, which can also make it refuse connections, slow it down or
//! fail specific topics.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use super::{BrokerConnection, Connector, OutboundMessage, PublishSession};
use crate::error::{ConnectError, PublishError};

#[derive(Clone, Default)]
pub struct MemoryBroker {
    state: Arc<State>,
}

#[derive(Default)]
struct State {
    up: AtomicBool,
    connects: AtomicUsize,
    refuse_connections: AtomicBool,
    refuse_sessions: AtomicBool,
    sessions_opened: AtomicUsize,
    sessions_closed: AtomicUsize,
    connect_delay_ms: AtomicU64,
    send_delay_ms: AtomicU64,
    failing_topics: Mutex<HashSet<String>>,
    messages: Mutex<Vec<OutboundMessage>>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn refuse_connections(&self, refuse: bool) {
        self.state.refuse_connections.store(refuse, Ordering::SeqCst);
    }

    pub fn refuse_sessions(&self, refuse: bool) {
        self.state.refuse_sessions.store(refuse, Ordering::SeqCst);
    }

    /// Makes each connect take `delay`, like a slow broker handshake.
    pub fn delay_connects(&self, delay: Duration) {
        store_millis(&self.state.connect_delay_ms, delay);
    }

    /// Makes each send take `delay`.
    pub fn delay_sends(&self, delay: Duration) {
        store_millis(&self.state.send_delay_ms, delay);
    }

    /// Makes every publish to `topic` fail.
    pub fn fail_topic(&self, topic: impl Into<String>) {
        lock(&self.state.failing_topics).insert(topic.into());
    }

    /// Simulates the transport going away under an open connection.
    pub fn drop_connection(&self) {
        self.state.up.store(false, Ordering::SeqCst);
    }

    /// Number of successful connects.
    pub fn connect_count(&self) -> usize {
        self.state.connects.load(Ordering::SeqCst)
    }

    pub fn sessions_opened(&self) -> usize {
        self.state.sessions_opened.load(Ordering::SeqCst)
    }

    /// Sessions opened but not yet terminated.
    pub fn open_sessions(&self) -> usize {
        self.sessions_opened() - self.state.sessions_closed.load(Ordering::SeqCst)
    }

    /// Messages accepted so far, in send order.
    pub fn messages(&self) -> Vec<OutboundMessage> {
        lock(&self.state.messages).clone()
    }
}

fn store_millis(slot: &AtomicU64, delay: Duration) {
    let millis = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
    slot.store(millis, Ordering::SeqCst);
}

async fn pause(slot: &AtomicU64) {
    match slot.load(Ordering::SeqCst) {
        0 => tokio::task::yield_now().await,
        millis => tokio::time::sleep(Duration::from_millis(millis)).await,
    }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[async_trait]
impl Connector for MemoryBroker {
    async fn connect(&self) -> Result<Arc<dyn BrokerConnection>, ConnectError> {
        pause(&self.state.connect_delay_ms).await;
        if self.state.refuse_connections.load(Ordering::SeqCst) {
            return Err(ConnectError::Transport("connection refused".to_string()));
        }
        self.state.connects.fetch_add(1, Ordering::SeqCst);
        self.state.up.store(true, Ordering::SeqCst);
        Ok(Arc::new(MemoryConnection {
            state: Arc::clone(&self.state),
        }))
    }
}

struct MemoryConnection {
    state: Arc<State>,
}

#[async_trait]
impl BrokerConnection for MemoryConnection {
    fn is_connected(&self) -> bool {
        self.state.up.load(Ordering::SeqCst)
    }

    async fn open_session(&self) -> Result<Box<dyn PublishSession>, PublishError> {
        if self.state.refuse_sessions.load(Ordering::SeqCst) {
            return Err(PublishError::Session("publisher rejected".to_string()));
        }
        self.state.sessions_opened.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MemorySession {
            state: Arc::clone(&self.state),
        }))
    }

    async fn close(&self) {
        self.state.up.store(false, Ordering::SeqCst);
    }
}

struct MemorySession {
    state: Arc<State>,
}

#[async_trait]
impl PublishSession for MemorySession {
    async fn publish(&mut self, message: &OutboundMessage) -> Result<(), PublishError> {
        pause(&self.state.send_delay_ms).await;
        if lock(&self.state.failing_topics).contains(&message.topic) {
            return Err(PublishError::Send {
                topic: message.topic.clone(),
                reason: "simulated transport error".to_string(),
            });
        }
        debug!(
            topic = %message.topic,
            bytes = message.payload.len(),
            "Message captured by in-memory broker"
        );
        lock(&self.state.messages).push(message.clone());
        Ok(())
    }

    async fn terminate(self: Box<Self>) {
        self.state.sessions_closed.fetch_add(1, Ordering::SeqCst);
    }
}
