//! Pub/sub transport abstraction
//!
//! The bridge only needs connect/publish/subscribe/close. Two implementations are
//! provided: an in-process broker and a NATS client (see `nats.rs`).

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info};

use super::nats::NatsTransport;
use super::subject::matches;
use crate::models::{HubError, HubResult};

/// Header carrying the correlation id
pub const CORRELATION_HEADER: &str = "Correlation-Id";

/// A message as it travels over the transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportMessage {
    pub subject: String,
    pub headers: BTreeMap<String, String>,
    pub payload: Vec<u8>,
}

impl TransportMessage {
    pub fn new(subject: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            subject: subject.into(),
            headers: BTreeMap::new(),
            payload,
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// Case-insensitive header lookup
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// Receiving end of a transport subscription
#[derive(Debug)]
pub struct TransportSubscription {
    pub sid: u64,
    pub receiver: mpsc::UnboundedReceiver<TransportMessage>,
}

/// Generic pub/sub transport
#[async_trait]
pub trait Transport: Send + Sync {
    async fn connect(&self) -> HubResult<()>;

    async fn publish(&self, message: TransportMessage) -> HubResult<()>;

    /// Subscribe to a wildcard pattern; messages arrive in publish order per subject
    async fn subscribe(&self, pattern: &str) -> HubResult<TransportSubscription>;

    async fn unsubscribe(&self, sid: u64) -> HubResult<()>;

    /// Drop the connection and every subscription; safe to call repeatedly
    async fn close(&self) -> HubResult<()>;

    fn is_connected(&self) -> bool;
}

/// Build a transport from a bus URL (`memory://` or `nats://host:port`)
pub fn transport_from_url(
    url: &str,
    client_name: &str,
    connect_timeout: Duration,
) -> HubResult<Arc<dyn Transport>> {
    if url.starts_with("memory://") {
        info!("Using in-process message bus");
        Ok(Arc::new(InMemoryBroker::new().transport()))
    } else if let Some(address) = url.strip_prefix("nats://") {
        info!("Using NATS message bus at {}", address);
        Ok(Arc::new(NatsTransport::new(address, client_name, connect_timeout)))
    } else {
        Err(HubError::ConfigError(format!("Unsupported bus URL: {}", url)))
    }
}

struct BrokerSubscriber {
    sid: u64,
    owner: u64,
    pattern: String,
    sender: mpsc::UnboundedSender<TransportMessage>,
}

/// In-process broker shared by any number of transports.
///
/// Several transports attached to one broker behave like separate processes
/// connected to the same bus.
pub struct InMemoryBroker {
    subscribers: RwLock<Vec<BrokerSubscriber>>,
    next_id: AtomicU64,
    messages_delivered: AtomicU64,
}

impl InMemoryBroker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            subscribers: RwLock::new(Vec::new()),
            next_id: AtomicU64::new(1),
            messages_delivered: AtomicU64::new(0),
        })
    }

    /// Attach a new, initially disconnected transport
    pub fn transport(self: &Arc<Self>) -> InMemoryTransport {
        InMemoryTransport {
            broker: Arc::clone(self),
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            connected: AtomicBool::new(false),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().len()
    }

    pub fn messages_delivered(&self) -> u64 {
        self.messages_delivered.load(Ordering::Relaxed)
    }

    fn deliver(&self, message: &TransportMessage) -> usize {
        let mut delivered = 0;
        let mut closed = Vec::new();
        {
            let subscribers = self.subscribers.read();
            for sub in subscribers.iter() {
                if !matches(&sub.pattern, &message.subject) {
                    continue;
                }
                if sub.sender.send(message.clone()).is_ok() {
                    delivered += 1;
                } else {
                    closed.push(sub.sid);
                }
            }
        }

        if !closed.is_empty() {
            self.subscribers.write().retain(|s| !closed.contains(&s.sid));
        }
        self.messages_delivered
            .fetch_add(delivered as u64, Ordering::Relaxed);
        delivered
    }

    fn add(&self, owner: u64, pattern: &str) -> TransportSubscription {
        let (sender, receiver) = mpsc::unbounded_channel();
        let sid = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.subscribers.write().push(BrokerSubscriber {
            sid,
            owner,
            pattern: pattern.to_string(),
            sender,
        });
        TransportSubscription { sid, receiver }
    }

    fn remove(&self, sid: u64) {
        self.subscribers.write().retain(|s| s.sid != sid);
    }

    fn remove_owner(&self, owner: u64) {
        self.subscribers.write().retain(|s| s.owner != owner);
    }
}

/// One client's connection to an [`InMemoryBroker`]
pub struct InMemoryTransport {
    broker: Arc<InMemoryBroker>,
    id: u64,
    connected: AtomicBool,
}

impl InMemoryTransport {
    fn ensure_connected(&self) -> HubResult<()> {
        if self.connected.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(HubError::NotConnected)
        }
    }
}

#[async_trait]
impl Transport for InMemoryTransport {
    async fn connect(&self) -> HubResult<()> {
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn publish(&self, message: TransportMessage) -> HubResult<()> {
        self.ensure_connected()?;
        let receivers = self.broker.deliver(&message);
        debug!(subject = %message.subject, receivers, "Message delivered in-process");
        Ok(())
    }

    async fn subscribe(&self, pattern: &str) -> HubResult<TransportSubscription> {
        self.ensure_connected()?;
        Ok(self.broker.add(self.id, pattern))
    }

    async fn unsubscribe(&self, sid: u64) -> HubResult<()> {
        self.broker.remove(sid);
        Ok(())
    }

    async fn close(&self) -> HubResult<()> {
        self.connected.store(false, Ordering::SeqCst);
        self.broker.remove_owner(self.id);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

impl std::fmt::Debug for InMemoryTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryTransport")
            .field("id", &self.id)
            .field("connected", &self.is_connected())
            .finish()
    }
}
