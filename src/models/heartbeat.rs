//! Per-project heartbeat wire schema

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

use super::{HubError, HubResult};

/// Heartbeat published on `<ns>.presence.<project_slug>`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeartbeatMessage {
    pub project_slug: String,
    pub mesh_namespace: String,
    #[serde(deserialize_with = "utc_or_naive")]
    pub timestamp: DateTime<Utc>,
    pub hub_url: String,
}

impl HeartbeatMessage {
    /// Heartbeat for `project_slug` whose namespace is the slug itself
    pub fn new(project_slug: impl Into<String>, hub_url: impl Into<String>) -> Self {
        let project_slug = project_slug.into();
        Self {
            mesh_namespace: project_slug.to_lowercase(),
            project_slug,
            timestamp: Utc::now(),
            hub_url: hub_url.into(),
        }
    }

    /// Lower-cased slug used for catalog lookups
    pub fn normalized_slug(&self) -> String {
        self.project_slug.trim().to_lowercase()
    }

    /// Schema checks beyond field presence
    pub fn validate(&self) -> HubResult<()> {
        let slug = self.normalized_slug();
        if slug.is_empty() {
            return Err(HubError::Validation("project_slug must not be empty".to_string()));
        }
        if !slug
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(HubError::Validation(format!(
                "project_slug '{}' contains invalid characters",
                self.project_slug
            )));
        }
        if self.mesh_namespace.trim().to_lowercase() != slug {
            return Err(HubError::Validation(format!(
                "mesh_namespace '{}' does not match project_slug '{}'",
                self.mesh_namespace, self.project_slug
            )));
        }
        if !(self.hub_url.starts_with("http://") || self.hub_url.starts_with("https://")) {
            return Err(HubError::Validation(format!(
                "hub_url '{}' is not an http(s) URL",
                self.hub_url
            )));
        }
        Ok(())
    }
}

/// RFC 3339 timestamps, or ISO-8601 without an offset read as UTC
fn utc_or_naive<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    if let Ok(ts) = DateTime::parse_from_rfc3339(&raw) {
        return Ok(ts.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(&raw, "%Y-%m-%dT%H:%M:%S%.f")
        .map(|naive| naive.and_utc())
        .map_err(|e| serde::de::Error::custom(format!("invalid timestamp '{}': {}", raw, e)))
}
