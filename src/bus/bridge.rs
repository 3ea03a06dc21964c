//! Event bridge between the hub and the message bus
//!
//! Outbound subjects are qualified with the node's namespace and payloads are
//! wrapped in an [`Envelope`]. Each subscription is drained by its own task so
//! per-subject order is preserved and a failing handler only loses its own message.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::FutureExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::router::SubjectRouter;
use super::subject::{qualify, validate_pattern, validate_subject, WILDCARD_TAIL};
use super::transport::{Transport, TransportMessage, CORRELATION_HEADER};
use crate::metrics;
use crate::models::{HubError, HubResult};

/// Identity of a bridge subscription
pub type SubscriptionId = u64;

/// Key marking a JSON object as a bridge envelope, valued with [`ENVELOPE_VERSION`]
pub const ENVELOPE_MARKER: &str = "mesh_envelope";

pub const ENVELOPE_VERSION: u8 = 1;

/// Wire wrapper for every payload the bridge publishes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "mesh_envelope")]
    pub version: u8,
    pub payload: Value,
    pub correlation_id: Option<String>,
    pub origin: String,
}

impl Envelope {
    /// Split a decoded message into an envelope, or hand it back when it is raw JSON
    fn from_value(value: Value) -> Result<Self, Value> {
        let marked = value.get(ENVELOPE_MARKER).and_then(Value::as_u64)
            == Some(u64::from(ENVELOPE_VERSION));
        if !marked {
            return Err(value);
        }
        serde_json::from_value(value.clone()).map_err(|_| value)
    }
}

/// Correlation ids travel as a header value, so control characters are refused
pub fn validate_correlation_id(id: &str) -> HubResult<()> {
    if id.is_empty() {
        return Err(HubError::Validation("correlation id is empty".to_string()));
    }
    if id.chars().any(char::is_control) {
        return Err(HubError::Validation(
            "correlation id contains control characters".to_string(),
        ));
    }
    Ok(())
}

/// A decoded inbound message
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BusEvent {
    pub subject: String,
    pub payload: Value,
    pub correlation_id: Option<String>,
    pub origin: Option<String>,
    pub received_at: DateTime<Utc>,
}

impl BusEvent {
    fn decode(message: TransportMessage) -> HubResult<Self> {
        let value: Value = serde_json::from_slice(&message.payload)?;
        let header_id = message.header(CORRELATION_HEADER).map(str::to_string);

        let (payload, envelope_id, origin) = match Envelope::from_value(value) {
            Ok(envelope) => (
                envelope.payload,
                envelope.correlation_id,
                Some(envelope.origin),
            ),
            Err(raw) => (raw, None, None),
        };

        Ok(Self {
            subject: message.subject,
            payload,
            correlation_id: header_id.or(envelope_id),
            origin,
            received_at: Utc::now(),
        })
    }
}

/// Asynchronous subscriber callback
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, event: BusEvent) -> anyhow::Result<()>;
}

/// Adapter turning an async closure into an [`EventHandler`]
pub struct HandlerFn<F>(F);

#[async_trait]
impl<F, Fut> EventHandler for HandlerFn<F>
where
    F: Fn(BusEvent) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    async fn handle(&self, event: BusEvent) -> anyhow::Result<()> {
        (self.0)(event).await
    }
}

/// Wrap an async closure as a shareable handler
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn EventHandler>
where
    F: Fn(BusEvent) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    Arc::new(HandlerFn(f))
}

struct ActiveSubscription {
    pattern: String,
    sid: u64,
    pump: JoinHandle<()>,
}

/// Namespaced publish/subscribe over a [`Transport`]
pub struct EventBridge {
    transport: Arc<dyn Transport>,
    namespace: String,
    origin: String,
    router: Arc<SubjectRouter>,
    subscriptions: Mutex<HashMap<SubscriptionId, ActiveSubscription>>,
    next_id: AtomicU64,
}

impl EventBridge {
    pub fn new(
        transport: Arc<dyn Transport>,
        namespace: impl Into<String>,
        origin: impl Into<String>,
    ) -> Self {
        Self {
            transport,
            namespace: namespace.into(),
            origin: origin.into(),
            router: Arc::new(SubjectRouter::new()),
            subscriptions: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Use a router shared with other components
    pub fn with_router(mut self, router: Arc<SubjectRouter>) -> Self {
        self.router = router;
        self
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn origin(&self) -> &str {
        &self.origin
    }

    pub fn router(&self) -> &Arc<SubjectRouter> {
        &self.router
    }

    pub fn is_connected(&self) -> bool {
        self.transport.is_connected()
    }

    pub fn subscription_count(&self) -> usize {
        self.subscriptions.lock().len()
    }

    /// Prefix `subject` with this node's namespace when missing
    pub fn qualify(&self, subject: &str) -> String {
        qualify(&self.namespace, subject)
    }

    pub async fn connect(&self) -> HubResult<()> {
        self.transport.connect().await?;
        info!(namespace = %self.namespace, "Event bridge connected");
        Ok(())
    }

    /// Cancel every subscription and close the transport; safe to call repeatedly
    pub async fn disconnect(&self) -> HubResult<()> {
        let active: Vec<(SubscriptionId, ActiveSubscription)> =
            self.subscriptions.lock().drain().collect();

        for (id, subscription) in active {
            self.stop_subscription(id, subscription).await;
        }

        let was_connected = self.transport.is_connected();
        self.transport.close().await?;
        if was_connected {
            info!(namespace = %self.namespace, "Event bridge disconnected");
        }
        Ok(())
    }

    /// Publish `payload` under `subject`; returns the qualified subject
    pub async fn publish(
        &self,
        subject: &str,
        payload: Value,
        correlation_id: Option<&str>,
    ) -> HubResult<String> {
        if !self.transport.is_connected() {
            return Err(HubError::NotConnected);
        }

        let subject = self.qualify(subject);
        validate_subject(&subject)?;
        if let Some(id) = correlation_id {
            validate_correlation_id(id)?;
        }

        let envelope = Envelope {
            version: ENVELOPE_VERSION,
            payload,
            correlation_id: correlation_id.map(str::to_string),
            origin: self.origin.clone(),
        };
        let mut message = TransportMessage::new(subject.clone(), serde_json::to_vec(&envelope)?);
        if let Some(id) = correlation_id {
            message = message.with_header(CORRELATION_HEADER, id);
        }

        self.transport.publish(message).await?;
        metrics::record_bus_publish();
        debug!(subject = %subject, correlation_id = ?correlation_id, "Published");
        Ok(subject)
    }

    /// Subscribe `handler` to every subject matching `pattern`
    pub async fn subscribe(
        &self,
        pattern: &str,
        handler: Arc<dyn EventHandler>,
    ) -> HubResult<SubscriptionId> {
        if !self.transport.is_connected() {
            return Err(HubError::NotConnected);
        }

        let pattern = self.qualify(pattern);
        validate_pattern(&pattern)?;

        let subscription = self.transport.subscribe(&pattern).await?;
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let pump = tokio::spawn(pump_messages(
            id,
            pattern.clone(),
            subscription.receiver,
            handler,
        ));

        self.subscriptions.lock().insert(
            id,
            ActiveSubscription {
                pattern: pattern.clone(),
                sid: subscription.sid,
                pump,
            },
        );
        debug!(subscription = id, pattern = %pattern, "Subscribed");
        Ok(id)
    }

    /// Cancel one subscription; returns false when it was unknown
    pub async fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let removed = self.subscriptions.lock().remove(&id);
        match removed {
            Some(subscription) => {
                self.stop_subscription(id, subscription).await;
                true
            }
            None => false,
        }
    }

    /// Feed every event under this namespace to the router
    pub async fn attach_router(&self) -> HubResult<SubscriptionId> {
        let router = Arc::clone(&self.router);
        let handler = handler_fn(move |event: BusEvent| {
            router.route(&event.subject, &event.payload);
            async { anyhow::Ok(()) }
        });
        self.subscribe(WILDCARD_TAIL, handler).await
    }

    async fn stop_subscription(&self, id: SubscriptionId, subscription: ActiveSubscription) {
        subscription.pump.abort();
        if let Err(e) = subscription.pump.await {
            if !e.is_cancelled() {
                warn!(subscription = id, "Subscription task failed: {}", e);
            }
        }
        if let Err(e) = self.transport.unsubscribe(subscription.sid).await {
            debug!(subscription = id, "Unsubscribe after close: {}", e);
        }
        debug!(subscription = id, pattern = %subscription.pattern, "Unsubscribed");
    }
}

impl std::fmt::Debug for EventBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBridge")
            .field("namespace", &self.namespace)
            .field("origin", &self.origin)
            .field("connected", &self.is_connected())
            .field("subscriptions", &self.subscription_count())
            .finish()
    }
}

async fn pump_messages(
    id: SubscriptionId,
    pattern: String,
    mut receiver: mpsc::UnboundedReceiver<TransportMessage>,
    handler: Arc<dyn EventHandler>,
) {
    while let Some(message) = receiver.recv().await {
        let event = match BusEvent::decode(message) {
            Ok(event) => event,
            Err(e) => {
                warn!(subscription = id, pattern = %pattern, "Dropping undecodable message: {}", e);
                continue;
            }
        };

        let subject = event.subject.clone();
        match AssertUnwindSafe(handler.handle(event)).catch_unwind().await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                metrics::record_handler_error();
                warn!(subscription = id, subject = %subject, error = %e, "Subscriber failed");
            }
            Err(_) => {
                metrics::record_handler_error();
                error!(subscription = id, subject = %subject, "Subscriber panicked");
            }
        }
    }
    debug!(subscription = id, pattern = %pattern, "Subscription stream ended");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::InMemoryBroker;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;
    use tokio::time::timeout;

    fn bridge_on(broker: &Arc<InMemoryBroker>, origin: &str) -> EventBridge {
        EventBridge::new(Arc::new(broker.transport()), "hub", origin)
    }

    fn collector() -> (Arc<dyn EventHandler>, mpsc::UnboundedReceiver<BusEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handler = handler_fn(move |event: BusEvent| {
            let tx = tx.clone();
            async move {
                let _ = tx.send(event);
                anyhow::Ok(())
            }
        });
        (handler, rx)
    }

    async fn next(rx: &mut mpsc::UnboundedReceiver<BusEvent>) -> BusEvent {
        timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("timeout")
            .expect("stream closed")
    }

    #[tokio::test]
    async fn test_not_connected_errors() {
        let broker = InMemoryBroker::new();
        let bridge = bridge_on(&broker, "a");
        let (handler, _rx) = collector();

        assert!(matches!(
            bridge.publish("x", json!({}), None).await,
            Err(HubError::NotConnected)
        ));
        assert!(matches!(
            bridge.subscribe("x.>", handler).await,
            Err(HubError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn test_round_trip_preserves_payload_and_correlation() {
        let broker = InMemoryBroker::new();
        let publisher = bridge_on(&broker, "hub-a");
        let subscriber = bridge_on(&broker, "hub-b");
        publisher.connect().await.unwrap();
        subscriber.connect().await.unwrap();

        let (handler, mut rx) = collector();
        subscriber.subscribe("events.*", handler).await.unwrap();

        let payload = json!({"nested": {"list": [1, 2, 3]}, "flag": true});
        let subject = publisher
            .publish("events.created", payload.clone(), Some("corr-1"))
            .await
            .unwrap();
        assert_eq!(subject, "hub.events.created");

        let event = next(&mut rx).await;
        assert_eq!(event.subject, "hub.events.created");
        assert_eq!(event.payload, payload);
        assert_eq!(event.correlation_id.as_deref(), Some("corr-1"));
        assert_eq!(event.origin.as_deref(), Some("hub-a"));
    }

    #[tokio::test]
    async fn test_raw_json_from_foreign_producer() {
        let broker = InMemoryBroker::new();
        let bridge = bridge_on(&broker, "hub-a");
        bridge.connect().await.unwrap();
        let (handler, mut rx) = collector();
        bridge.subscribe("presence.*", handler).await.unwrap();

        let foreign = broker.transport();
        foreign.connect().await.unwrap();
        foreign
            .publish(TransportMessage::new(
                "hub.presence.alpha",
                br#"{"project_slug":"alpha"}"#.to_vec(),
            ))
            .await
            .unwrap();
        foreign
            .publish(TransportMessage::new("hub.presence.beta", b"not json".to_vec()))
            .await
            .unwrap();
        foreign
            .publish(TransportMessage::new("hub.presence.gamma", b"{}".to_vec()))
            .await
            .unwrap();

        let event = next(&mut rx).await;
        assert_eq!(event.payload, json!({"project_slug": "alpha"}));
        assert!(event.origin.is_none());
        // The undecodable message is skipped, the stream keeps going
        assert_eq!(next(&mut rx).await.subject, "hub.presence.gamma");
    }

    #[tokio::test]
    async fn test_failing_handler_keeps_subscription_alive() {
        let broker = InMemoryBroker::new();
        let bridge = bridge_on(&broker, "a");
        bridge.connect().await.unwrap();

        let calls = Arc::new(AtomicUsize::new(0));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let counter = Arc::clone(&calls);
        let handler = handler_fn(move |event: BusEvent| {
            let n = counter.fetch_add(1, Ordering::SeqCst);
            let tx = tx.clone();
            async move {
                match n {
                    0 => anyhow::bail!("first message fails"),
                    1 => panic!("second message panics"),
                    _ => {
                        let _ = tx.send(event);
                        Ok(())
                    }
                }
            }
        });
        bridge.subscribe("jobs", handler).await.unwrap();

        for i in 0..3 {
            bridge.publish("jobs", json!({"n": i}), None).await.unwrap();
        }

        let event = next(&mut rx).await;
        assert_eq!(event.payload, json!({"n": 2}));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_unsubscribe_and_idempotent_disconnect() {
        let broker = InMemoryBroker::new();
        let bridge = bridge_on(&broker, "a");
        bridge.connect().await.unwrap();

        let (first, _rx1) = collector();
        let (second, _rx2) = collector();
        let id = bridge.subscribe("x.>", first).await.unwrap();
        bridge.subscribe("y.>", second).await.unwrap();
        assert_eq!(bridge.subscription_count(), 2);

        assert!(bridge.unsubscribe(id).await);
        assert!(!bridge.unsubscribe(id).await);
        assert_eq!(broker.subscriber_count(), 1);

        bridge.disconnect().await.unwrap();
        bridge.disconnect().await.unwrap();
        assert_eq!(bridge.subscription_count(), 0);
        assert_eq!(broker.subscriber_count(), 0);
        assert!(!bridge.is_connected());
    }

    #[tokio::test]
    async fn test_attach_router_dispatches_namespace_traffic() {
        let broker = InMemoryBroker::new();
        let bridge = bridge_on(&broker, "a");
        bridge.connect().await.unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel::<String>();
        bridge.router().add_rule(
            "hub.global.>",
            Arc::new(move |subject: &str, _: &Value| -> anyhow::Result<()> {
                let _ = tx.send(subject.to_string());
                Ok(())
            }),
        );
        bridge.attach_router().await.unwrap();

        bridge.publish("local.noise", json!(1), None).await.unwrap();
        bridge.publish("global.presence", json!(2), None).await.unwrap();

        let routed = timeout(Duration::from_secs(1), rx.recv()).await.unwrap();
        assert_eq!(routed.as_deref(), Some("hub.global.presence"));
    }

    #[test]
    fn test_envelope_detection() {
        let envelope =
            json!({"mesh_envelope": 1, "payload": {"a": 1}, "correlation_id": null, "origin": "x"});
        assert!(Envelope::from_value(envelope).is_ok());

        let unknown_version = json!({"mesh_envelope": 2, "payload": 1, "origin": "x"});
        assert!(Envelope::from_value(unknown_version).is_err());
        assert!(Envelope::from_value(json!([1, 2])).is_err());
    }

    #[tokio::test]
    async fn test_foreign_payload_shaped_like_envelope_is_not_unwrapped() {
        let broker = InMemoryBroker::new();
        let bridge = bridge_on(&broker, "hub-a");
        bridge.connect().await.unwrap();
        let (handler, mut rx) = collector();
        bridge.subscribe("jobs.*", handler).await.unwrap();

        let foreign = broker.transport();
        foreign.connect().await.unwrap();
        let body = json!({"payload": {"job": 7}, "origin": "scheduler"});
        foreign
            .publish(TransportMessage::new(
                "hub.jobs.queued",
                serde_json::to_vec(&body).unwrap(),
            ))
            .await
            .unwrap();

        let event = next(&mut rx).await;
        assert_eq!(event.payload, body);
        assert!(event.origin.is_none());
    }

    #[tokio::test]
    async fn test_publish_rejects_control_characters_in_correlation_id() {
        let broker = InMemoryBroker::new();
        let bridge = bridge_on(&broker, "a");
        bridge.connect().await.unwrap();
        let (handler, mut rx) = collector();
        bridge.subscribe("x", handler).await.unwrap();

        for id in ["a\r\nX-Evil: 1", "line\nbreak", "nul\0", ""] {
            let err = bridge.publish("x", json!({}), Some(id)).await.unwrap_err();
            assert!(matches!(err, HubError::Validation(_)), "accepted {:?}", id);
        }

        bridge.publish("x", json!({}), Some("req-42")).await.unwrap();
        let event = next(&mut rx).await;
        assert_eq!(event.correlation_id.as_deref(), Some("req-42"));
    }
}
