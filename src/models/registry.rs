//! Peer registry rows and the announcements that feed them

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{HubError, HubResult};

/// A peer hub known through presence announcements
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HubRegistryEntry {
    pub id: String,
    pub name: String,
    pub version: String,
    pub hostname: String,
    pub project_path: String,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

impl HubRegistryEntry {
    /// Build a fresh entry from an announcement seen at `now`
    pub fn from_announcement(announcement: &PresenceAnnouncement, now: DateTime<Utc>) -> Self {
        Self {
            id: announcement.hub_id.clone(),
            name: announcement.name.clone(),
            version: announcement.version.clone(),
            hostname: announcement.hostname.clone(),
            project_path: announcement.project_path.clone(),
            first_seen: now,
            last_seen: now,
        }
    }

    /// Refresh from a later announcement, keeping `first_seen`
    pub fn refresh(&mut self, announcement: &PresenceAnnouncement, now: DateTime<Utc>) {
        self.name = announcement.name.clone();
        self.version = announcement.version.clone();
        self.hostname = announcement.hostname.clone();
        self.project_path = announcement.project_path.clone();
        self.last_seen = now;
    }

    /// Whether `last_seen` is older than `threshold` at `now`
    pub fn is_stale(&self, threshold: chrono::Duration, now: DateTime<Utc>) -> bool {
        now.signed_duration_since(self.last_seen) > threshold
    }
}

/// Payload published on `<ns>.global.presence`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresenceAnnouncement {
    pub hub_id: String,
    pub name: String,
    pub version: String,
    pub hostname: String,
    pub project_path: String,
    pub timestamp: DateTime<Utc>,
}

impl PresenceAnnouncement {
    pub fn validate(&self) -> HubResult<()> {
        if self.hub_id.trim().is_empty() {
            return Err(HubError::Validation("hub_id must not be empty".to_string()));
        }
        if self.name.trim().is_empty() {
            return Err(HubError::Validation("name must not be empty".to_string()));
        }
        Ok(())
    }
}

/// Payload published on `<ns>.global.metrics.<hub_id>`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub hub_id: String,
    pub project_count: u64,
    pub service_count: u64,
    pub uptime_seconds: f64,
    pub timestamp: DateTime<Utc>,
}
