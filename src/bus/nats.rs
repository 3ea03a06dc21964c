//! NATS transport backed by `async-nats`
//!
//! The client reconnects on its own and restores its subscriptions; while it is
//! reconnecting `is_connected()` is false and publishes fail with `NotConnected`.

use async_nats::connection::State;
use async_nats::{Client, ConnectOptions, Event, HeaderMap};
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::transport::{Transport, TransportMessage, TransportSubscription};
use crate::models::{HubError, HubResult};

/// NATS transport
pub struct NatsTransport {
    address: String,
    client_name: String,
    connect_timeout: Duration,
    client: Mutex<Option<Client>>,
    /// Forwarding task per subscription; dropping its `Subscriber` unsubscribes
    forwarders: Mutex<HashMap<u64, JoinHandle<()>>>,
    next_sid: AtomicU64,
}

impl NatsTransport {
    /// Create a disconnected client for `host:port`
    pub fn new(address: &str, client_name: &str, connect_timeout: Duration) -> Self {
        Self {
            address: address.trim_end_matches('/').to_string(),
            client_name: client_name.to_string(),
            connect_timeout,
            client: Mutex::new(None),
            forwarders: Mutex::new(HashMap::new()),
            next_sid: AtomicU64::new(1),
        }
    }

    fn connected_client(&self) -> HubResult<Client> {
        let client = self.client.lock().clone().ok_or(HubError::NotConnected)?;
        if matches!(client.connection_state(), State::Connected) {
            Ok(client)
        } else {
            Err(HubError::NotConnected)
        }
    }
}

fn transport_error(e: impl std::fmt::Display) -> HubError {
    HubError::Transport(e.to_string())
}

#[async_trait]
impl Transport for NatsTransport {
    async fn connect(&self) -> HubResult<()> {
        if self.client.lock().is_some() {
            return Ok(());
        }

        let address = self.address.clone();
        let options = ConnectOptions::new()
            .name(&self.client_name)
            .connection_timeout(self.connect_timeout)
            .event_callback(move |event| {
                let address = address.clone();
                async move {
                    match event {
                        Event::Connected => info!(server = %address, "NATS connected"),
                        Event::Disconnected => warn!(server = %address, "NATS connection lost"),
                        other => debug!(server = %address, event = ?other, "NATS event"),
                    }
                }
            });

        let url = format!("nats://{}", self.address);
        let client = tokio::time::timeout(self.connect_timeout, options.connect(url.as_str()))
            .await
            .map_err(|_| {
                HubError::Transport(format!(
                    "timed out connecting to {} after {:?}",
                    self.address, self.connect_timeout
                ))
            })?
            .map_err(transport_error)?;

        *self.client.lock() = Some(client);
        Ok(())
    }

    async fn publish(&self, message: TransportMessage) -> HubResult<()> {
        let client = self.connected_client()?;
        let payload = Bytes::from(message.payload);

        if message.headers.is_empty() {
            client.publish(message.subject, payload).await
        } else {
            let headers = header_map(&message.headers);
            client
                .publish_with_headers(message.subject, headers, payload)
                .await
        }
        .map_err(transport_error)
    }

    async fn subscribe(&self, pattern: &str) -> HubResult<TransportSubscription> {
        let client = self.connected_client()?;
        let mut subscriber = client
            .subscribe(pattern.to_string())
            .await
            .map_err(transport_error)?;

        let sid = self.next_sid.fetch_add(1, Ordering::Relaxed);
        let (sender, receiver) = mpsc::unbounded_channel();
        let forwarder = tokio::spawn(async move {
            while let Some(message) = subscriber.next().await {
                if sender.send(into_transport_message(message)).is_err() {
                    break;
                }
            }
        });

        self.forwarders.lock().insert(sid, forwarder);
        debug!(sid, pattern = %pattern, "NATS subscription opened");
        Ok(TransportSubscription { sid, receiver })
    }

    async fn unsubscribe(&self, sid: u64) -> HubResult<()> {
        let forwarder = self.forwarders.lock().remove(&sid);
        if let Some(forwarder) = forwarder {
            stop_forwarder(forwarder).await;
        }
        Ok(())
    }

    async fn close(&self) -> HubResult<()> {
        let forwarders: Vec<JoinHandle<()>> =
            self.forwarders.lock().drain().map(|(_, h)| h).collect();
        for forwarder in forwarders {
            stop_forwarder(forwarder).await;
        }

        let client = self.client.lock().take();
        if let Some(client) = client {
            if let Err(e) = client.flush().await {
                debug!("NATS flush on close failed: {}", e);
            }
            info!(server = %self.address, "NATS connection closed");
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.client
            .lock()
            .as_ref()
            .is_some_and(|c| matches!(c.connection_state(), State::Connected))
    }
}

impl std::fmt::Debug for NatsTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NatsTransport")
            .field("address", &self.address)
            .field("connected", &self.is_connected())
            .finish()
    }
}

async fn stop_forwarder(forwarder: JoinHandle<()>) {
    forwarder.abort();
    if let Err(e) = forwarder.await {
        if !e.is_cancelled() {
            warn!("NATS subscription task failed: {}", e);
        }
    }
}

fn header_map(headers: &BTreeMap<String, String>) -> HeaderMap {
    let mut map = HeaderMap::new();
    for (name, value) in headers {
        map.insert(name.as_str(), value.as_str());
    }
    map
}

fn into_transport_message(message: async_nats::Message) -> TransportMessage {
    let mut headers = BTreeMap::new();
    if let Some(map) = &message.headers {
        for (name, values) in map.iter() {
            if let Some(value) = values.first() {
                headers.insert(name.to_string(), value.to_string());
            }
        }
    }

    TransportMessage {
        subject: message.subject.to_string(),
        headers,
        payload: message.payload.to_vec(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::CORRELATION_HEADER;
    use tokio::net::TcpListener;

    #[test]
    fn test_header_map_carries_correlation_id() {
        let mut headers = BTreeMap::new();
        headers.insert(CORRELATION_HEADER.to_string(), "abc-123".to_string());

        let map = header_map(&headers);
        assert_eq!(
            map.get(CORRELATION_HEADER).map(|v| v.to_string()),
            Some("abc-123".to_string())
        );
    }

    #[tokio::test]
    async fn test_publish_before_connect_is_not_connected() {
        let transport = NatsTransport::new("127.0.0.1:4222", "test", Duration::from_secs(1));
        let err = transport
            .publish(TransportMessage::new("hub.x", b"{}".to_vec()))
            .await
            .unwrap_err();
        assert!(matches!(err, HubError::NotConnected));
        assert!(!transport.is_connected());
        assert!(transport.close().await.is_ok());
    }

    #[tokio::test]
    async fn test_refused_connection_is_a_transport_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        drop(listener);

        let transport = NatsTransport::new(&address, "test", Duration::from_secs(2));
        let err = transport.connect().await.unwrap_err();
        assert!(err.is_transport(), "unexpected error: {:?}", err);
        assert!(!transport.is_connected());
    }

    #[tokio::test]
    async fn test_connect_timeout_when_server_silent() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        let _server = tokio::spawn(async move {
            let (_socket, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(10)).await;
        });

        let transport = NatsTransport::new(&address, "test", Duration::from_millis(200));
        let err = transport.connect().await.unwrap_err();
        assert!(err.is_transport(), "unexpected error: {:?}", err);
    }
}
