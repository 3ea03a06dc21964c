//! Project catalog rows tracked by the catalog role

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Liveness of a catalogued project
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ProjectStatus {
    Online,
    Offline,
}

impl Default for ProjectStatus {
    fn default() -> Self {
        ProjectStatus::Offline
    }
}

impl std::fmt::Display for ProjectStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProjectStatus::Online => write!(f, "ONLINE"),
            ProjectStatus::Offline => write!(f, "OFFLINE"),
        }
    }
}

/// A project registered in the catalog
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectCatalogEntry {
    /// Unique, lower-case slug
    pub slug: String,
    pub name: String,
    pub hub_url: String,
    pub mesh_namespace: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub status: ProjectStatus,
    pub last_heartbeat_at: Option<DateTime<Utc>>,
}

impl ProjectCatalogEntry {
    /// Create an OFFLINE entry; the slug is stored lower-cased
    pub fn new(slug: impl Into<String>, name: impl Into<String>, hub_url: impl Into<String>) -> Self {
        let slug = slug.into().to_lowercase();
        Self {
            mesh_namespace: slug.clone(),
            slug,
            name: name.into(),
            hub_url: hub_url.into(),
            tags: Vec::new(),
            status: ProjectStatus::Offline,
            last_heartbeat_at: None,
        }
    }

    pub fn with_tags(mut self, tags: Vec<String>) -> Self {
        self.tags = tags;
        self
    }

    pub fn mark_online(&mut self, now: DateTime<Utc>) {
        self.status = ProjectStatus::Online;
        self.last_heartbeat_at = Some(now);
    }

    /// Whether an ONLINE entry has gone quiet for longer than `threshold`
    pub fn is_stale(&self, threshold: chrono::Duration, now: DateTime<Utc>) -> bool {
        match (self.status, self.last_heartbeat_at) {
            (ProjectStatus::Online, Some(last)) => now.signed_duration_since(last) > threshold,
            (ProjectStatus::Online, None) => true,
            (ProjectStatus::Offline, _) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_entry_is_offline_and_lowercase() {
        let entry = ProjectCatalogEntry::new("Alpha", "Alpha", "http://alpha:8000");
        assert_eq!(entry.slug, "alpha");
        assert_eq!(entry.mesh_namespace, "alpha");
        assert_eq!(entry.status, ProjectStatus::Offline);
        assert!(entry.last_heartbeat_at.is_none());
    }

    #[test]
    fn test_status_wire_format() {
        let json = serde_json::to_string(&ProjectStatus::Online).unwrap();
        assert_eq!(json, "\"ONLINE\"");
    }

    #[test]
    fn test_offline_entries_are_never_stale() {
        let entry = ProjectCatalogEntry::new("alpha", "Alpha", "http://alpha:8000");
        assert!(!entry.is_stale(chrono::Duration::zero(), Utc::now()));
    }
}
