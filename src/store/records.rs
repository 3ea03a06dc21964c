//! Registry, catalog and health-history storage operations
//!
//! Every logical mutation is committed as a single `WriteBatch`. Read-modify-write
//! operations additionally hold `write_lock` so a sweep and a heartbeat for the same
//! row cannot interleave.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rocksdb::WriteBatch;
use serde::de::DeserializeOwned;
use std::sync::Arc;

use super::rocks::{RocksStore, CF_HEALTH_RESULTS, CF_HUBS, CF_PROJECTS, CF_SERVICES};
use crate::models::{
    HealthCheckResult, HubError, HubRegistryEntry, HubResult, ProjectCatalogEntry, ProjectStatus,
    ServiceRecord,
};

/// Record store providing CRUD for hubs, projects, services and check history
#[derive(Clone, Debug)]
pub struct RecordStore {
    rocks: RocksStore,
    write_lock: Arc<Mutex<()>>,
}

impl RecordStore {
    /// Create a new record store
    pub fn new(rocks: RocksStore) -> Self {
        Self {
            rocks,
            write_lock: Arc::new(Mutex::new(())),
        }
    }

    /// Get a reference to the underlying RocksStore
    pub fn rocks(&self) -> &RocksStore {
        &self.rocks
    }

    pub fn ping(&self) -> HubResult<()> {
        self.rocks.ping()
    }

    // ========================================================================
    // Peer hub registry
    // ========================================================================

    pub fn get_hub(&self, id: &str) -> HubResult<Option<HubRegistryEntry>> {
        self.get_json(CF_HUBS, id.as_bytes())
    }

    /// Insert or replace a peer row
    pub fn upsert_hub(&self, entry: &HubRegistryEntry) -> HubResult<()> {
        let mut batch = WriteBatch::default();
        batch.put_cf(self.rocks.cf(CF_HUBS)?, entry.id.as_bytes(), serde_json::to_vec(entry)?);
        self.commit(batch)
    }

    /// Apply `update` to the current row (if any) and store the result atomically
    pub fn update_hub<F>(&self, id: &str, update: F) -> HubResult<HubRegistryEntry>
    where
        F: FnOnce(Option<HubRegistryEntry>) -> HubRegistryEntry,
    {
        let _guard = self.write_lock.lock();
        let entry = update(self.get_hub(id)?);
        self.upsert_hub(&entry)?;
        Ok(entry)
    }

    pub fn list_hubs(&self) -> HubResult<Vec<HubRegistryEntry>> {
        self.list_json(CF_HUBS)
    }

    pub fn count_hubs(&self) -> HubResult<u64> {
        self.count(CF_HUBS)
    }

    /// Delete every peer whose `last_seen` is older than `threshold`; returns their ids
    pub fn delete_stale_hubs(
        &self,
        threshold: chrono::Duration,
        now: DateTime<Utc>,
    ) -> HubResult<Vec<String>> {
        let _guard = self.write_lock.lock();
        let cf = self.rocks.cf(CF_HUBS)?;

        let mut batch = WriteBatch::default();
        let mut removed = Vec::new();
        for entry in self.list_hubs()? {
            if entry.is_stale(threshold, now) {
                batch.delete_cf(cf, entry.id.as_bytes());
                removed.push(entry.id);
            }
        }

        if !removed.is_empty() {
            self.commit(batch)?;
        }
        Ok(removed)
    }

    // ========================================================================
    // Project catalog
    // ========================================================================

    /// Register a project, keeping liveness state if it already exists
    pub fn register_project(&self, entry: ProjectCatalogEntry) -> HubResult<ProjectCatalogEntry> {
        let _guard = self.write_lock.lock();
        let stored = match self.get_project(&entry.slug)? {
            Some(existing) => ProjectCatalogEntry {
                status: existing.status,
                last_heartbeat_at: existing.last_heartbeat_at,
                ..entry
            },
            None => entry,
        };
        self.put_project(&stored)?;
        Ok(stored)
    }

    pub fn get_project(&self, slug: &str) -> HubResult<Option<ProjectCatalogEntry>> {
        self.get_json(CF_PROJECTS, slug.as_bytes())
    }

    pub fn list_projects(&self) -> HubResult<Vec<ProjectCatalogEntry>> {
        self.list_json(CF_PROJECTS)
    }

    pub fn count_projects(&self) -> HubResult<u64> {
        self.count(CF_PROJECTS)
    }

    /// Mark a project ONLINE; `None` when the slug is not registered
    pub fn mark_project_online(
        &self,
        slug: &str,
        now: DateTime<Utc>,
    ) -> HubResult<Option<ProjectCatalogEntry>> {
        let _guard = self.write_lock.lock();
        let Some(mut entry) = self.get_project(slug)? else {
            return Ok(None);
        };
        entry.mark_online(now);
        self.put_project(&entry)?;
        Ok(Some(entry))
    }

    /// Flip quiet ONLINE projects to OFFLINE; returns the changed slugs
    pub fn mark_stale_projects_offline(
        &self,
        threshold: chrono::Duration,
        now: DateTime<Utc>,
    ) -> HubResult<Vec<String>> {
        let _guard = self.write_lock.lock();
        let cf = self.rocks.cf(CF_PROJECTS)?;

        let mut batch = WriteBatch::default();
        let mut changed = Vec::new();
        for mut entry in self.list_projects()? {
            if entry.is_stale(threshold, now) {
                entry.status = ProjectStatus::Offline;
                batch.put_cf(cf, entry.slug.as_bytes(), serde_json::to_vec(&entry)?);
                changed.push(entry.slug);
            }
        }

        if !changed.is_empty() {
            self.commit(batch)?;
        }
        Ok(changed)
    }

    fn put_project(&self, entry: &ProjectCatalogEntry) -> HubResult<()> {
        let mut batch = WriteBatch::default();
        batch.put_cf(
            self.rocks.cf(CF_PROJECTS)?,
            entry.slug.as_bytes(),
            serde_json::to_vec(entry)?,
        );
        self.commit(batch)
    }

    // ========================================================================
    // Services and check history
    // ========================================================================

    pub fn put_service(&self, service: &ServiceRecord) -> HubResult<()> {
        let mut batch = WriteBatch::default();
        batch.put_cf(
            self.rocks.cf(CF_SERVICES)?,
            service.id.as_bytes(),
            serde_json::to_vec(service)?,
        );
        self.commit(batch)
    }

    /// Insert or reconfigure a service, keeping its observed status
    pub fn register_service(&self, service: ServiceRecord) -> HubResult<ServiceRecord> {
        let _guard = self.write_lock.lock();
        let stored = match self.get_service(&service.id)? {
            Some(existing) => ServiceRecord {
                status: existing.status,
                consecutive_failures: existing.consecutive_failures,
                last_checked_at: existing.last_checked_at,
                ..service
            },
            None => service,
        };
        self.put_service(&stored)?;
        Ok(stored)
    }

    pub fn get_service(&self, id: &str) -> HubResult<Option<ServiceRecord>> {
        self.get_json(CF_SERVICES, id.as_bytes())
    }

    pub fn list_services(&self) -> HubResult<Vec<ServiceRecord>> {
        self.list_json(CF_SERVICES)
    }

    pub fn count_services(&self) -> HubResult<u64> {
        self.count(CF_SERVICES)
    }

    /// Append a check result and fold it into the service row in one commit
    pub fn record_check(&self, result: &HealthCheckResult) -> HubResult<ServiceRecord> {
        let _guard = self.write_lock.lock();
        let mut service = self
            .get_service(&result.service_id)?
            .ok_or_else(|| HubError::not_found("service", &result.service_id))?;
        service.apply_result(result);

        let mut batch = WriteBatch::default();
        batch.put_cf(
            self.rocks.cf(CF_SERVICES)?,
            service.id.as_bytes(),
            serde_json::to_vec(&service)?,
        );
        batch.put_cf(
            self.rocks.cf(CF_HEALTH_RESULTS)?,
            result_key(result).as_bytes(),
            serde_json::to_vec(result)?,
        );
        self.commit(batch)?;
        Ok(service)
    }

    /// History for one service, oldest first
    pub fn list_results(&self, service_id: &str) -> HubResult<Vec<HealthCheckResult>> {
        Ok(self
            .list_json::<HealthCheckResult>(CF_HEALTH_RESULTS)?
            .into_iter()
            .filter(|r| r.service_id == service_id)
            .collect())
    }

    pub fn count_results(&self) -> HubResult<u64> {
        self.count(CF_HEALTH_RESULTS)
    }

    /// Delete history rows checked before `cutoff`; returns how many were removed
    pub fn purge_results_before(&self, cutoff: DateTime<Utc>) -> HubResult<usize> {
        let cf = self.rocks.cf(CF_HEALTH_RESULTS)?;
        let cutoff_prefix = format!("{:020}", cutoff.timestamp_millis().max(0));

        let mut batch = WriteBatch::default();
        let mut removed = 0usize;
        for item in self.rocks.db().iterator_cf(cf, rocksdb::IteratorMode::Start) {
            let (key, _) = item?;
            // Keys sort by their zero-padded millisecond prefix
            if key.len() < 20 || &key[..20] >= cutoff_prefix.as_bytes() {
                break;
            }
            batch.delete_cf(cf, &key);
            removed += 1;
        }

        if removed > 0 {
            self.commit(batch)?;
        }
        Ok(removed)
    }

    // ========================================================================
    // Helper methods
    // ========================================================================

    fn commit(&self, batch: WriteBatch) -> HubResult<()> {
        self.rocks
            .db()
            .write(batch)
            .map_err(|e| HubError::DatabaseError(e.to_string()))
    }

    fn get_json<T: DeserializeOwned>(&self, cf_name: &str, key: &[u8]) -> HubResult<Option<T>> {
        let cf = self.rocks.cf(cf_name)?;
        match self.rocks.db().get_cf(cf, key) {
            Ok(Some(value)) => Ok(Some(serde_json::from_slice(&value)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(HubError::DatabaseError(e.to_string())),
        }
    }

    fn list_json<T: DeserializeOwned>(&self, cf_name: &str) -> HubResult<Vec<T>> {
        let cf = self.rocks.cf(cf_name)?;
        let mut items = Vec::new();
        for item in self.rocks.db().iterator_cf(cf, rocksdb::IteratorMode::Start) {
            let (_, value) = item.map_err(|e| HubError::DatabaseError(e.to_string()))?;
            items.push(serde_json::from_slice(&value)?);
        }
        Ok(items)
    }

    fn count(&self, cf_name: &str) -> HubResult<u64> {
        let cf = self.rocks.cf(cf_name)?;
        let mut count = 0u64;
        for item in self.rocks.db().iterator_cf(cf, rocksdb::IteratorMode::Start) {
            item.map_err(|e| HubError::DatabaseError(e.to_string()))?;
            count += 1;
        }
        Ok(count)
    }
}

fn result_key(result: &HealthCheckResult) -> String {
    format!(
        "{:020}:{}:{}",
        result.checked_at.timestamp_millis().max(0),
        result.service_id,
        uuid::Uuid::new_v4()
    )
}
