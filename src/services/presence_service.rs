//! Presence service for peer discovery between hubs
//!
//! Publishes this hub's presence and metrics on the bus, registers peers from
//! their announcements and prunes peers that went quiet.

use chrono::Utc;
use parking_lot::Mutex;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::bus::{handler_fn, subject::subjects, BusEvent, EventBridge, SubscriptionId};
use crate::config::Settings;
use crate::metrics;
use crate::models::{
    HeartbeatMessage, HubError, HubRegistryEntry, HubResult, MetricsSnapshot,
    PresenceAnnouncement,
};
use crate::runtime::BackgroundTasks;
use crate::store::RecordStore;

/// Presence service configuration
#[derive(Debug, Clone)]
pub struct PresenceConfig {
    /// This hub's ID
    pub hub_id: String,
    pub name: String,
    pub version: String,
    pub hostname: String,
    pub project_path: String,
    /// Project announced to the catalog; empty disables the per-project heartbeat
    pub project_slug: String,
    pub public_url: String,
    pub heartbeat_interval: Duration,
    pub metrics_interval: Duration,
    pub pruning_interval: Duration,
    /// Silence after which a peer is pruned
    pub peer_stale_timeout: Duration,
}

impl PresenceConfig {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            hub_id: settings.hub.hub_id.clone(),
            name: settings.hub.name.clone(),
            version: crate::VERSION.to_string(),
            hostname: settings.hub.hostname.clone(),
            project_path: settings.hub.project_path.clone(),
            project_slug: settings.hub.project_slug.clone(),
            public_url: settings.hub.public_url.clone(),
            heartbeat_interval: settings.presence.heartbeat_interval(),
            metrics_interval: settings.presence.metrics_interval(),
            pruning_interval: settings.presence.pruning_interval(),
            peer_stale_timeout: settings.presence.peer_stale_timeout(),
        }
    }
}

/// Effect of one peer announcement on the registry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerUpdate {
    /// Our own announcement echoed back by the bus
    IgnoredSelf,
    Registered,
    Refreshed,
}

/// Presence service
pub struct PresenceService {
    config: PresenceConfig,
    store: RecordStore,
    bridge: Arc<EventBridge>,
    started_at: Instant,
    tasks: BackgroundTasks,
    subscription: Mutex<Option<SubscriptionId>>,
    running: AtomicBool,
}

impl PresenceService {
    pub fn new(config: PresenceConfig, store: RecordStore, bridge: Arc<EventBridge>) -> Self {
        Self {
            config,
            store,
            bridge,
            started_at: Instant::now(),
            tasks: BackgroundTasks::new(),
            subscription: Mutex::new(None),
            running: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &PresenceConfig {
        &self.config
    }

    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// This hub's presence payload
    pub fn announcement(&self) -> PresenceAnnouncement {
        PresenceAnnouncement {
            hub_id: self.config.hub_id.clone(),
            name: self.config.name.clone(),
            version: self.config.version.clone(),
            hostname: self.config.hostname.clone(),
            project_path: self.config.project_path.clone(),
            timestamp: Utc::now(),
        }
    }

    // ========================================================================
    // Outbound
    // ========================================================================

    /// Publish self-presence and, when configured, the catalog heartbeat.
    ///
    /// A heartbeat the catalog would reject fails the call before anything is sent.
    pub async fn publish_presence(&self) -> HubResult<()> {
        let heartbeat = if self.config.project_slug.is_empty() {
            None
        } else {
            let heartbeat = HeartbeatMessage::new(&self.config.project_slug, &self.config.public_url);
            heartbeat.validate()?;
            Some(heartbeat)
        };

        let namespace = self.bridge.namespace();
        let announcement = serde_json::to_value(self.announcement())?;
        self.bridge
            .publish(&subjects::global_presence(namespace), announcement, None)
            .await?;

        if let Some(heartbeat) = heartbeat {
            self.bridge
                .publish(
                    &subjects::project_presence(namespace, &heartbeat.normalized_slug()),
                    serde_json::to_value(&heartbeat)?,
                    None,
                )
                .await?;
        }

        metrics::record_presence_published();
        debug!(hub_id = %self.config.hub_id, "Presence published");
        Ok(())
    }

    /// Publish aggregate counts for this hub
    pub async fn publish_metrics(&self) -> HubResult<MetricsSnapshot> {
        let snapshot = MetricsSnapshot {
            hub_id: self.config.hub_id.clone(),
            project_count: self.store.count_projects()?,
            service_count: self.store.count_services()?,
            uptime_seconds: self.uptime().as_secs_f64(),
            timestamp: Utc::now(),
        };

        let subject = subjects::global_metrics(self.bridge.namespace(), &self.config.hub_id);
        self.bridge
            .publish(&subject, serde_json::to_value(&snapshot)?, None)
            .await?;
        Ok(snapshot)
    }

    // ========================================================================
    // Inbound
    // ========================================================================

    /// Register or refresh the peer behind `payload`
    pub fn handle_peer_presence(&self, payload: &Value) -> HubResult<PeerUpdate> {
        let announcement: PresenceAnnouncement = serde_json::from_value(payload.clone())
            .map_err(|e| HubError::Validation(format!("malformed presence: {}", e)))?;
        announcement.validate()?;

        if announcement.hub_id == self.config.hub_id {
            return Ok(PeerUpdate::IgnoredSelf);
        }

        let now = Utc::now();
        let mut update = PeerUpdate::Refreshed;
        let entry = self.store.update_hub(&announcement.hub_id, |existing| match existing {
            Some(mut entry) => {
                entry.refresh(&announcement, now);
                entry
            }
            None => {
                update = PeerUpdate::Registered;
                HubRegistryEntry::from_announcement(&announcement, now)
            }
        })?;

        if update == PeerUpdate::Registered {
            info!(peer = %entry.id, name = %entry.name, "Peer hub registered");
            self.refresh_peer_gauge();
        }
        Ok(update)
    }

    /// Delete peers silent for longer than the stale timeout
    pub fn prune_stale_peers(&self) -> HubResult<Vec<String>> {
        self.prune_stale_peers_at(Utc::now())
    }

    pub(crate) fn prune_stale_peers_at(
        &self,
        now: chrono::DateTime<Utc>,
    ) -> HubResult<Vec<String>> {
        let threshold = chrono::Duration::from_std(self.config.peer_stale_timeout)
            .map_err(|e| HubError::ConfigError(format!("Invalid peer timeout: {}", e)))?;
        let removed = self.store.delete_stale_hubs(threshold, now)?;

        for peer in &removed {
            info!(peer = %peer, "Stale peer hub pruned");
        }
        if !removed.is_empty() {
            self.refresh_peer_gauge();
        }
        Ok(removed)
    }

    pub fn peers(&self) -> HubResult<Vec<HubRegistryEntry>> {
        self.store.list_hubs()
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Subscribe to peer presence, announce once and spawn the three loops.
    ///
    /// Calling it on a running service does nothing.
    pub async fn start(self: &Arc<Self>) -> HubResult<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            warn!(hub_id = %self.config.hub_id, "Presence service already started");
            return Ok(());
        }

        let weak = Arc::downgrade(self);
        let handler = handler_fn(move |event: BusEvent| {
            let outcome = match weak.upgrade() {
                Some(service) => service.handle_peer_presence(&event.payload).map(|_| ()),
                None => Ok(()),
            };
            async move { outcome.map_err(anyhow::Error::from) }
        });
        let pattern = subjects::global_presence(self.bridge.namespace());
        let id = match self.bridge.subscribe(&pattern, handler).await {
            Ok(id) => id,
            Err(e) => {
                self.running.store(false, Ordering::SeqCst);
                return Err(e);
            }
        };
        *self.subscription.lock() = Some(id);

        if let Err(e) = self.publish_presence().await {
            warn!("Initial presence announcement failed: {}", e);
        }

        let service = Arc::clone(self);
        self.tasks
            .spawn_periodic("presence-heartbeat", self.config.heartbeat_interval, move || {
                let service = Arc::clone(&service);
                async move { service.publish_presence().await }
            });

        let service = Arc::clone(self);
        self.tasks
            .spawn_periodic("presence-metrics", self.config.metrics_interval, move || {
                let service = Arc::clone(&service);
                async move { service.publish_metrics().await.map(|_| ()) }
            });

        let service = Arc::clone(self);
        self.tasks
            .spawn_periodic("presence-pruning", self.config.pruning_interval, move || {
                let service = Arc::clone(&service);
                async move { service.prune_stale_peers().map(|_| ()) }
            });

        info!(
            hub_id = %self.config.hub_id,
            heartbeat = ?self.config.heartbeat_interval,
            "Presence service started"
        );
        Ok(())
    }

    /// Cancel the loops and the peer subscription; safe to call repeatedly
    pub async fn stop(&self) {
        self.tasks.shutdown().await;
        let subscription = self.subscription.lock().take();
        if let Some(id) = subscription {
            self.bridge.unsubscribe(id).await;
            info!(hub_id = %self.config.hub_id, "Presence service stopped");
        }
        self.running.store(false, Ordering::SeqCst);
    }

    pub fn active_tasks(&self) -> usize {
        self.tasks.active_count()
    }

    fn refresh_peer_gauge(&self) {
        match self.store.count_hubs() {
            Ok(count) => metrics::set_peers_known(count as i64),
            Err(e) => warn!("Failed to count peers: {}", e),
        }
    }
}

impl std::fmt::Debug for PresenceService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PresenceService")
            .field("hub_id", &self.config.hub_id)
            .field("tasks", &self.tasks)
            .finish()
    }
}
