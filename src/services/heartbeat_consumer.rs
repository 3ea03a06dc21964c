//! Catalog-side consumer of per-project heartbeats
//!
//! Heartbeats never raise: malformed, inconsistent and unknown ones are
//! counted and logged, valid ones mark the project ONLINE. A periodic sweep
//! flips quiet projects back to OFFLINE.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::bus::{handler_fn, subject::subjects, BusEvent, EventBridge, SubscriptionId};
use crate::config::CatalogSettings;
use crate::metrics;
use crate::models::{HeartbeatMessage, HubError, HubResult, ProjectCatalogEntry};
use crate::runtime::BackgroundTasks;
use crate::store::RecordStore;

/// Heartbeat consumer configuration
#[derive(Debug, Clone)]
pub struct HeartbeatConsumerConfig {
    /// Silence after which an ONLINE project goes OFFLINE
    pub stale_threshold: Duration,
    pub sweep_interval: Duration,
}

impl HeartbeatConsumerConfig {
    pub fn from_settings(settings: &CatalogSettings) -> Self {
        Self {
            stale_threshold: settings.stale_threshold(),
            sweep_interval: settings.sweep_interval(),
        }
    }
}

/// What happened to one heartbeat
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatOutcome {
    /// Project marked ONLINE
    Applied,
    /// Not JSON or missing fields; state untouched
    Malformed,
    /// Schema violation such as a namespace/slug mismatch
    Rejected,
    /// Valid, but no such project in the catalog
    UnknownProject,
}

impl HeartbeatOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            HeartbeatOutcome::Applied => "applied",
            HeartbeatOutcome::Malformed => "malformed",
            HeartbeatOutcome::Rejected => "rejected",
            HeartbeatOutcome::UnknownProject => "unknown_project",
        }
    }
}

/// Heartbeat consumer
pub struct HeartbeatConsumer {
    config: HeartbeatConsumerConfig,
    store: RecordStore,
    bridge: Arc<EventBridge>,
    tasks: BackgroundTasks,
    subscription: Mutex<Option<SubscriptionId>>,
    running: AtomicBool,
}

impl HeartbeatConsumer {
    pub fn new(
        config: HeartbeatConsumerConfig,
        store: RecordStore,
        bridge: Arc<EventBridge>,
    ) -> Self {
        Self {
            config,
            store,
            bridge,
            tasks: BackgroundTasks::new(),
            subscription: Mutex::new(None),
            running: AtomicBool::new(false),
        }
    }

    /// Add a project to the catalog, keeping its liveness if already known
    pub fn register_project(&self, entry: ProjectCatalogEntry) -> HubResult<ProjectCatalogEntry> {
        let stored = self.store.register_project(entry)?;
        debug!(project = %stored.slug, "Project registered in catalog");
        Ok(stored)
    }

    pub fn projects(&self) -> HubResult<Vec<ProjectCatalogEntry>> {
        self.store.list_projects()
    }

    /// Handle raw message bytes
    pub fn handle_raw(&self, bytes: &[u8]) -> HubResult<HeartbeatOutcome> {
        match serde_json::from_slice::<Value>(bytes) {
            Ok(payload) => self.handle_payload(&payload),
            Err(_) => Ok(self.finish(HeartbeatOutcome::Malformed)),
        }
    }

    /// Handle a decoded heartbeat payload.
    ///
    /// Only storage failures surface as errors.
    pub fn handle_payload(&self, payload: &Value) -> HubResult<HeartbeatOutcome> {
        let heartbeat: HeartbeatMessage = match serde_json::from_value(payload.clone()) {
            Ok(heartbeat) => heartbeat,
            Err(e) => {
                debug!("Dropping malformed heartbeat: {}", e);
                return Ok(self.finish(HeartbeatOutcome::Malformed));
            }
        };

        if let Err(e) = heartbeat.validate() {
            warn!(project = %heartbeat.project_slug, "Heartbeat rejected: {}", e);
            return Ok(self.finish(HeartbeatOutcome::Rejected));
        }

        self.apply(&heartbeat)
    }

    /// Mark the heartbeat's project ONLINE
    pub fn apply(&self, heartbeat: &HeartbeatMessage) -> HubResult<HeartbeatOutcome> {
        let slug = heartbeat.normalized_slug();
        let outcome = match self.store.mark_project_online(&slug, Utc::now())? {
            Some(entry) => {
                debug!(project = %entry.slug, "Project heartbeat applied");
                HeartbeatOutcome::Applied
            }
            None => {
                info!(project = %slug, "Heartbeat for unregistered project ignored");
                HeartbeatOutcome::UnknownProject
            }
        };
        Ok(self.finish(outcome))
    }

    /// Flip projects quiet for longer than the threshold to OFFLINE
    pub fn sweep_stale(&self) -> HubResult<usize> {
        self.sweep_stale_at(Utc::now())
    }

    pub fn sweep_stale_at(&self, now: DateTime<Utc>) -> HubResult<usize> {
        let threshold = chrono::Duration::from_std(self.config.stale_threshold)
            .map_err(|e| HubError::ConfigError(format!("Invalid stale threshold: {}", e)))?;
        let changed = self.store.mark_stale_projects_offline(threshold, now)?;

        for slug in &changed {
            info!(project = %slug, "Project went OFFLINE");
        }
        Ok(changed.len())
    }

    /// Subscribe to `<ns>.presence.*` and spawn the stale sweep; a second call is a no-op
    pub async fn start(self: &Arc<Self>) -> HubResult<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            warn!("Heartbeat consumer already started");
            return Ok(());
        }

        let weak = Arc::downgrade(self);
        let handler = handler_fn(move |event: BusEvent| {
            let outcome = match weak.upgrade() {
                Some(consumer) => consumer.handle_payload(&event.payload).map(|_| ()),
                None => Ok(()),
            };
            async move { outcome.map_err(anyhow::Error::from) }
        });
        let pattern = subjects::project_presence_pattern(self.bridge.namespace());
        let id = match self.bridge.subscribe(&pattern, handler).await {
            Ok(id) => id,
            Err(e) => {
                self.running.store(false, Ordering::SeqCst);
                return Err(e);
            }
        };
        *self.subscription.lock() = Some(id);

        let consumer = Arc::clone(self);
        self.tasks
            .spawn_periodic("catalog-sweep", self.config.sweep_interval, move || {
                let consumer = Arc::clone(&consumer);
                async move { consumer.sweep_stale().map(|_| ()) }
            });

        info!(pattern = %pattern, "Heartbeat consumer started");
        Ok(())
    }

    /// Unsubscribe and cancel the sweep; safe to call repeatedly
    pub async fn stop(&self) {
        self.tasks.shutdown().await;
        let subscription = self.subscription.lock().take();
        if let Some(id) = subscription {
            self.bridge.unsubscribe(id).await;
            info!("Heartbeat consumer stopped");
        }
        self.running.store(false, Ordering::SeqCst);
    }

    pub fn active_tasks(&self) -> usize {
        self.tasks.active_count()
    }

    fn finish(&self, outcome: HeartbeatOutcome) -> HeartbeatOutcome {
        metrics::record_heartbeat(outcome.as_str());
        outcome
    }
}

impl std::fmt::Debug for HeartbeatConsumer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HeartbeatConsumer")
            .field("config", &self.config)
            .field("tasks", &self.tasks)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{InMemoryBroker, Transport, TransportMessage};
    use crate::models::ProjectStatus;
    use crate::store::RocksStore;
    use serde_json::json;
    use tempfile::TempDir;

    async fn consumer(broker: &Arc<InMemoryBroker>) -> (TempDir, Arc<HeartbeatConsumer>) {
        let dir = TempDir::new().unwrap();
        let store = RecordStore::new(RocksStore::open(dir.path()).unwrap());
        let bridge = Arc::new(EventBridge::new(Arc::new(broker.transport()), "hub", "catalog"));
        bridge.connect().await.unwrap();
        let config = HeartbeatConsumerConfig {
            stale_threshold: Duration::from_secs(120),
            sweep_interval: Duration::from_secs(60),
        };
        (dir, Arc::new(HeartbeatConsumer::new(config, store, bridge)))
    }

    fn heartbeat(slug: &str, namespace: &str) -> Value {
        json!({
            "project_slug": slug,
            "mesh_namespace": namespace,
            "timestamp": Utc::now().to_rfc3339(),
            "hub_url": "http://localhost:8000",
        })
    }

    fn status(c: &HeartbeatConsumer, slug: &str) -> ProjectStatus {
        c.store.get_project(slug).unwrap().unwrap().status
    }

    #[tokio::test]
    async fn test_mixed_case_slug_marks_online() {
        let broker = InMemoryBroker::new();
        let (_dir, c) = consumer(&broker).await;
        c.register_project(ProjectCatalogEntry::new("commandcenter", "Command Center", "http://cc"))
            .unwrap();

        let outcome = c
            .handle_payload(&heartbeat("CommandCenter", "commandcenter"))
            .unwrap();
        assert_eq!(outcome, HeartbeatOutcome::Applied);
        assert_eq!(status(&c, "commandcenter"), ProjectStatus::Online);
    }

    #[tokio::test]
    async fn test_namespace_mismatch_leaves_status() {
        let broker = InMemoryBroker::new();
        let (_dir, c) = consumer(&broker).await;
        c.register_project(ProjectCatalogEntry::new("alpha", "Alpha", "http://alpha"))
            .unwrap();

        let outcome = c.handle_payload(&heartbeat("alpha", "beta")).unwrap();
        assert_eq!(outcome, HeartbeatOutcome::Rejected);

        let entry = c.store.get_project("alpha").unwrap().unwrap();
        assert_eq!(entry.status, ProjectStatus::Offline);
        assert!(entry.last_heartbeat_at.is_none());
    }

    #[tokio::test]
    async fn test_malformed_and_unknown_heartbeats() {
        let broker = InMemoryBroker::new();
        let (_dir, c) = consumer(&broker).await;

        assert_eq!(c.handle_raw(b"{not json").unwrap(), HeartbeatOutcome::Malformed);
        assert_eq!(
            c.handle_payload(&json!({"project_slug": "alpha"})).unwrap(),
            HeartbeatOutcome::Malformed
        );
        assert_eq!(
            c.handle_payload(&heartbeat("ghost", "ghost")).unwrap(),
            HeartbeatOutcome::UnknownProject
        );
        assert!(c.projects().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_timestamp_without_offset_is_applied() {
        let broker = InMemoryBroker::new();
        let (_dir, c) = consumer(&broker).await;
        c.register_project(ProjectCatalogEntry::new("alpha", "Alpha", "http://alpha"))
            .unwrap();

        let payload = json!({
            "project_slug": "alpha",
            "mesh_namespace": "alpha",
            "timestamp": "2026-01-01T00:00:00.123456",
            "hub_url": "http://localhost:8000",
        });
        assert_eq!(c.handle_payload(&payload).unwrap(), HeartbeatOutcome::Applied);
        assert_eq!(status(&c, "alpha"), ProjectStatus::Online);
    }

    #[tokio::test]
    async fn test_second_start_is_a_no_op() {
        let broker = InMemoryBroker::new();
        let (_dir, c) = consumer(&broker).await;

        c.start().await.unwrap();
        c.start().await.unwrap();
        assert_eq!(c.active_tasks(), 1);
        assert_eq!(c.bridge.subscription_count(), 1);

        c.stop().await;
        c.start().await.unwrap();
        assert_eq!(c.active_tasks(), 1);
        assert_eq!(c.bridge.subscription_count(), 1);
        c.stop().await;
    }

    #[tokio::test]
    async fn test_stale_sweep_flips_only_quiet_online_projects() {
        let broker = InMemoryBroker::new();
        let (_dir, c) = consumer(&broker).await;
        for slug in ["alpha", "beta", "never"] {
            c.register_project(ProjectCatalogEntry::new(slug, slug, "http://x"))
                .unwrap();
        }
        c.handle_payload(&heartbeat("alpha", "alpha")).unwrap();
        c.handle_payload(&heartbeat("beta", "beta")).unwrap();

        // Backdate alpha's last heartbeat past the threshold
        c.store
            .mark_project_online("alpha", Utc::now() - chrono::Duration::seconds(600))
            .unwrap();

        assert_eq!(c.sweep_stale_at(Utc::now()).unwrap(), 1);
        assert_eq!(status(&c, "alpha"), ProjectStatus::Offline);
        assert_eq!(status(&c, "beta"), ProjectStatus::Online);
        assert_eq!(status(&c, "never"), ProjectStatus::Offline);

        assert_eq!(c.sweep_stale_at(Utc::now()).unwrap(), 0);
    }

    #[tokio::test]
    async fn test_subscription_applies_foreign_heartbeats() {
        let broker = InMemoryBroker::new();
        let (_dir, c) = consumer(&broker).await;
        c.register_project(ProjectCatalogEntry::new("alpha", "Alpha", "http://alpha"))
            .unwrap();
        c.start().await.unwrap();
        assert_eq!(c.active_tasks(), 1);

        let project = broker.transport();
        project.connect().await.unwrap();
        let body = serde_json::to_vec(&heartbeat("alpha", "alpha")).unwrap();
        project
            .publish(TransportMessage::new("hub.presence.alpha", body))
            .await
            .unwrap();

        let mut online = false;
        for _ in 0..50 {
            if status(&c, "alpha") == ProjectStatus::Online {
                online = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(online);

        c.stop().await;
        c.stop().await;
        assert_eq!(c.active_tasks(), 0);
        assert_eq!(c.bridge.subscription_count(), 0);
    }
}
