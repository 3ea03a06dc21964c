//! Hub configuration settings

use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::models::{HeartbeatMessage, HubError, HubResult, ProbeTarget};

/// Main hub configuration
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub hub: HubSettings,
    pub server: ServerSettings,
    pub database: DatabaseSettings,
    pub bus: BusSettings,
    pub presence: PresenceSettings,
    pub catalog: CatalogSettings,
    pub health: HealthSettings,
    pub metrics: MetricsSettings,
}

/// Hub identity settings
#[derive(Debug, Clone, Deserialize)]
pub struct HubSettings {
    /// Which background services this process runs
    pub role: HubRole,
    /// Unique hub identifier (UUID)
    pub hub_id: String,
    /// Human readable name announced to peers
    pub name: String,
    #[serde(default = "default_hostname")]
    pub hostname: String,
    #[serde(default = "default_project_path")]
    pub project_path: String,
    /// Slug of the project this hub serves, used for catalog heartbeats
    pub project_slug: String,
    /// Public URL for this hub
    pub public_url: String,
}

fn default_hostname() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string())
}

fn default_project_path() -> String {
    std::env::current_dir()
        .map(|p| p.display().to_string())
        .unwrap_or_else(|_| ".".to_string())
}

/// Process role
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HubRole {
    /// Presence + health monitoring
    Hub,
    /// Project heartbeat consumer
    Catalog,
    /// Both of the above in one process
    Combined,
}

impl Default for HubRole {
    fn default() -> Self {
        HubRole::Hub
    }
}

impl HubRole {
    pub fn runs_hub(&self) -> bool {
        matches!(self, HubRole::Hub | HubRole::Combined)
    }

    pub fn runs_catalog(&self) -> bool {
        matches!(self, HubRole::Catalog | HubRole::Combined)
    }
}

/// Server settings
#[derive(Debug, Clone, Deserialize)]
pub struct ServerSettings {
    /// HTTP server host
    #[serde(default = "default_host")]
    pub host: String,
    /// HTTP server port
    #[serde(default = "default_http_port")]
    pub http_port: u16,
    /// Number of worker threads
    #[serde(default = "default_workers")]
    pub workers: usize,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_http_port() -> u16 {
    8080
}

fn default_workers() -> usize {
    num_cpus::get()
}

/// Database settings
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseSettings {
    /// RocksDB data directory
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
    /// Enable compression
    #[serde(default = "default_true")]
    pub compression: bool,
    /// Cache size in MB
    #[serde(default = "default_cache_size")]
    pub cache_size_mb: usize,
}

fn default_data_dir() -> String {
    "./data".to_string()
}

fn default_cache_size() -> usize {
    64
}

fn default_true() -> bool {
    true
}

/// Message bus settings
#[derive(Debug, Clone, Deserialize)]
pub struct BusSettings {
    /// `memory://` for an in-process broker, `nats://host:port` for a NATS server
    #[serde(default = "default_bus_url")]
    pub url: String,
    /// Subject prefix prepended to every outbound subject
    #[serde(default = "default_namespace")]
    pub namespace: String,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_sec: u64,
    /// Events kept for `bus.subscribe` RPC calls
    #[serde(default = "default_event_log_capacity")]
    pub event_log_capacity: usize,
}

fn default_bus_url() -> String {
    "memory://".to_string()
}

fn default_namespace() -> String {
    "hub".to_string()
}

fn default_connect_timeout() -> u64 {
    5
}

fn default_event_log_capacity() -> usize {
    256
}

/// Presence loop settings
#[derive(Debug, Clone, Deserialize)]
pub struct PresenceSettings {
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_sec: u64,
    #[serde(default = "default_metrics_interval")]
    pub metrics_interval_sec: u64,
    #[serde(default = "default_pruning_interval")]
    pub pruning_interval_sec: u64,
    /// Peers silent for longer than this are pruned
    #[serde(default = "default_peer_stale_timeout")]
    pub peer_stale_timeout_sec: u64,
}

fn default_heartbeat_interval() -> u64 {
    30
}

fn default_metrics_interval() -> u64 {
    60
}

fn default_pruning_interval() -> u64 {
    60
}

fn default_peer_stale_timeout() -> u64 {
    90
}

/// A project seeded into the catalog at startup
#[derive(Debug, Clone, Deserialize)]
pub struct CatalogProjectSettings {
    pub slug: String,
    pub name: String,
    pub hub_url: String,
    #[serde(default)]
    pub tags: Vec<String>,
}

/// Catalog role settings
#[derive(Debug, Clone, Deserialize)]
pub struct CatalogSettings {
    /// Projects silent for longer than this go OFFLINE
    #[serde(default = "default_project_stale_threshold")]
    pub stale_threshold_sec: u64,
    #[serde(default = "default_catalog_sweep_interval")]
    pub sweep_interval_sec: u64,
    #[serde(default)]
    pub projects: Vec<CatalogProjectSettings>,
}

fn default_project_stale_threshold() -> u64 {
    120
}

fn default_catalog_sweep_interval() -> u64 {
    60
}

/// Circuit breaker settings
#[derive(Debug, Clone, Deserialize)]
pub struct CircuitBreakerSettings {
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(default = "default_recovery_timeout")]
    pub recovery_timeout_sec: u64,
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_recovery_timeout() -> u64 {
    60
}

impl Default for CircuitBreakerSettings {
    fn default() -> Self {
        CircuitBreakerSettings {
            failure_threshold: default_failure_threshold(),
            recovery_timeout_sec: default_recovery_timeout(),
        }
    }
}

/// Rate limit settings for manually triggered checks
#[derive(Debug, Clone, Deserialize)]
pub struct RateLimitSettings {
    #[serde(default = "default_rate_window")]
    pub window_sec: u64,
    #[serde(default = "default_rate_max_calls")]
    pub max_calls: usize,
}

fn default_rate_window() -> u64 {
    60
}

fn default_rate_max_calls() -> usize {
    10
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        RateLimitSettings {
            window_sec: default_rate_window(),
            max_calls: default_rate_max_calls(),
        }
    }
}

/// A service seeded into the store at startup
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceSettings {
    pub id: String,
    pub project_id: String,
    pub name: String,
    pub target: ProbeTarget,
    #[serde(default = "default_health_threshold")]
    pub health_threshold: u32,
}

fn default_health_threshold() -> u32 {
    1
}

/// Health checker settings
#[derive(Debug, Clone, Deserialize)]
pub struct HealthSettings {
    #[serde(default = "default_check_interval")]
    pub check_interval_sec: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// First backoff delay; doubles per attempt
    #[serde(default = "default_backoff_base")]
    pub backoff_base_sec: f64,
    #[serde(default = "default_probe_timeout")]
    pub probe_timeout_sec: u64,
    /// Max idle keep-alive connections per probed host
    #[serde(default = "default_http_pool_size")]
    pub http_pool_size: usize,
    #[serde(default = "default_retention_days")]
    pub retention_days: u64,
    #[serde(default = "default_retention_sweep_interval")]
    pub retention_sweep_interval_sec: u64,
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerSettings,
    #[serde(default)]
    pub rate_limit: RateLimitSettings,
    #[serde(default)]
    pub services: Vec<ServiceSettings>,
}

fn default_check_interval() -> u64 {
    60
}

fn default_max_retries() -> u32 {
    3
}

fn default_backoff_base() -> f64 {
    1.0
}

fn default_probe_timeout() -> u64 {
    10
}

fn default_http_pool_size() -> usize {
    20
}

fn default_retention_days() -> u64 {
    7
}

fn default_retention_sweep_interval() -> u64 {
    3600
}

/// Metrics settings
#[derive(Debug, Clone, Deserialize)]
pub struct MetricsSettings {
    /// Enable Prometheus metrics
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Metrics endpoint path
    #[serde(default = "default_metrics_path")]
    pub path: String,
}

fn default_metrics_path() -> String {
    "/metrics".to_string()
}

impl PresenceSettings {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_sec)
    }

    pub fn metrics_interval(&self) -> Duration {
        Duration::from_secs(self.metrics_interval_sec)
    }

    pub fn pruning_interval(&self) -> Duration {
        Duration::from_secs(self.pruning_interval_sec)
    }

    pub fn peer_stale_timeout(&self) -> Duration {
        Duration::from_secs(self.peer_stale_timeout_sec)
    }
}

impl CatalogSettings {
    pub fn stale_threshold(&self) -> Duration {
        Duration::from_secs(self.stale_threshold_sec)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_sec)
    }
}

impl HealthSettings {
    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_sec)
    }

    pub fn backoff_base(&self) -> Duration {
        Duration::from_secs_f64(self.backoff_base_sec.max(0.0))
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_sec)
    }

    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_days * 24 * 60 * 60)
    }

    pub fn retention_sweep_interval(&self) -> Duration {
        Duration::from_secs(self.retention_sweep_interval_sec)
    }
}

impl Settings {
    /// Load settings from file and environment
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from("config")
    }

    /// Load settings from a specific config file path (without extension)
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let config_path = path.as_ref();

        let builder = Config::builder()
            // Start with default values
            .set_default("hub.role", "hub")?
            .set_default("hub.hub_id", uuid::Uuid::new_v4().to_string())?
            .set_default("hub.name", "mesh-hub")?
            .set_default("hub.project_slug", "mesh-hub")?
            .set_default("hub.public_url", "http://localhost:8080")?
            .set_default("server.host", "0.0.0.0")?
            .set_default("server.http_port", 8080)?
            .set_default("server.workers", num_cpus::get() as i64)?
            .set_default("database.data_dir", "./data")?
            .set_default("database.compression", true)?
            .set_default("database.cache_size_mb", 64)?
            .set_default("bus.url", "memory://")?
            .set_default("bus.namespace", "hub")?
            .set_default("bus.connect_timeout_sec", 5)?
            .set_default("bus.event_log_capacity", 256)?
            .set_default("presence.heartbeat_interval_sec", 30)?
            .set_default("presence.metrics_interval_sec", 60)?
            .set_default("presence.pruning_interval_sec", 60)?
            .set_default("presence.peer_stale_timeout_sec", 90)?
            .set_default("catalog.stale_threshold_sec", 120)?
            .set_default("catalog.sweep_interval_sec", 60)?
            .set_default("health.check_interval_sec", 60)?
            .set_default("health.max_retries", 3)?
            .set_default("health.backoff_base_sec", 1.0)?
            .set_default("health.probe_timeout_sec", 10)?
            .set_default("health.http_pool_size", 20)?
            .set_default("health.retention_days", 7)?
            .set_default("health.retention_sweep_interval_sec", 3600)?
            .set_default("metrics.enabled", true)?
            .set_default("metrics.path", "/metrics")?
            // Add config file if it exists
            .add_source(File::with_name(config_path.to_str().unwrap_or("config")).required(false))
            // Add environment variables with prefix MESH_HUB_
            .add_source(Environment::with_prefix("MESH_HUB").separator("__"));

        builder.build()?.try_deserialize()
    }

    /// Reject settings the services cannot run with
    pub fn validate(&self) -> HubResult<()> {
        let ns = &self.bus.namespace;
        if ns.is_empty() || ns.split('.').any(|t| t.is_empty() || t == "*" || t == ">") {
            return Err(HubError::ConfigError(format!(
                "bus.namespace '{}' must be a non-empty literal subject",
                ns
            )));
        }
        if !(self.bus.url.starts_with("memory://") || self.bus.url.starts_with("nats://")) {
            return Err(HubError::ConfigError(format!(
                "bus.url '{}' must use memory:// or nats://",
                self.bus.url
            )));
        }
        if self.health.circuit_breaker.failure_threshold == 0 {
            return Err(HubError::ConfigError(
                "health.circuit_breaker.failure_threshold must be at least 1".to_string(),
            ));
        }
        if self.health.rate_limit.max_calls == 0 || self.health.rate_limit.window_sec == 0 {
            return Err(HubError::ConfigError(
                "health.rate_limit needs a non-zero window and max_calls".to_string(),
            ));
        }
        if !self.hub.project_slug.is_empty() {
            HeartbeatMessage::new(&self.hub.project_slug, &self.hub.public_url)
                .validate()
                .map_err(|e| HubError::ConfigError(format!("hub.project_slug: {}", e)))?;
        }
        let intervals = [
            ("presence.heartbeat_interval_sec", self.presence.heartbeat_interval_sec),
            ("presence.metrics_interval_sec", self.presence.metrics_interval_sec),
            ("presence.pruning_interval_sec", self.presence.pruning_interval_sec),
            ("catalog.sweep_interval_sec", self.catalog.sweep_interval_sec),
            ("health.check_interval_sec", self.health.check_interval_sec),
            ("health.retention_sweep_interval_sec", self.health.retention_sweep_interval_sec),
        ];
        if let Some((name, _)) = intervals.iter().find(|(_, v)| *v == 0) {
            return Err(HubError::ConfigError(format!("{} must be non-zero", name)));
        }
        Ok(())
    }
}

impl Default for Settings {
    fn default() -> Self {
        Settings::load().unwrap_or_else(|_| {
            // Provide minimal defaults if config loading fails
            Settings {
                hub: HubSettings {
                    role: HubRole::Hub,
                    hub_id: uuid::Uuid::new_v4().to_string(),
                    name: "mesh-hub".to_string(),
                    hostname: default_hostname(),
                    project_path: default_project_path(),
                    project_slug: "mesh-hub".to_string(),
                    public_url: "http://localhost:8080".to_string(),
                },
                server: ServerSettings {
                    host: default_host(),
                    http_port: default_http_port(),
                    workers: default_workers(),
                },
                database: DatabaseSettings {
                    data_dir: default_data_dir(),
                    compression: true,
                    cache_size_mb: default_cache_size(),
                },
                bus: BusSettings {
                    url: default_bus_url(),
                    namespace: default_namespace(),
                    connect_timeout_sec: default_connect_timeout(),
                    event_log_capacity: default_event_log_capacity(),
                },
                presence: PresenceSettings {
                    heartbeat_interval_sec: default_heartbeat_interval(),
                    metrics_interval_sec: default_metrics_interval(),
                    pruning_interval_sec: default_pruning_interval(),
                    peer_stale_timeout_sec: default_peer_stale_timeout(),
                },
                catalog: CatalogSettings {
                    stale_threshold_sec: default_project_stale_threshold(),
                    sweep_interval_sec: default_catalog_sweep_interval(),
                    projects: Vec::new(),
                },
                health: HealthSettings {
                    check_interval_sec: default_check_interval(),
                    max_retries: default_max_retries(),
                    backoff_base_sec: default_backoff_base(),
                    probe_timeout_sec: default_probe_timeout(),
                    http_pool_size: default_http_pool_size(),
                    retention_days: default_retention_days(),
                    retention_sweep_interval_sec: default_retention_sweep_interval(),
                    circuit_breaker: CircuitBreakerSettings::default(),
                    rate_limit: RateLimitSettings::default(),
                    services: Vec::new(),
                },
                metrics: MetricsSettings {
                    enabled: true,
                    path: default_metrics_path(),
                },
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_settings() {
        let settings = Settings::default();
        assert_eq!(settings.server.http_port, 8080);
        assert_eq!(settings.bus.namespace, "hub");
        assert_eq!(settings.health.circuit_breaker.failure_threshold, 5);
        assert_eq!(settings.presence.peer_stale_timeout_sec, 90);
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_wildcard_namespace() {
        let mut settings = Settings::default();
        settings.bus.namespace = "hub.*".to_string();
        assert!(matches!(settings.validate(), Err(HubError::ConfigError(_))));
    }

    #[test]
    fn test_validate_rejects_unknown_bus_scheme() {
        let mut settings = Settings::default();
        settings.bus.url = "amqp://localhost".to_string();
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_bad_project_slug() {
        let mut settings = Settings::default();
        settings.hub.project_slug = "my project".to_string();
        assert!(matches!(settings.validate(), Err(HubError::ConfigError(_))));

        settings.hub.project_slug = "alpha".to_string();
        settings.hub.public_url = "alpha:8000".to_string();
        assert!(settings.validate().is_err());

        // An empty slug turns the catalog heartbeat off
        settings.hub.project_slug = String::new();
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_role_flags() {
        assert!(HubRole::Combined.runs_hub() && HubRole::Combined.runs_catalog());
        assert!(!HubRole::Catalog.runs_hub());
        assert!(!HubRole::Hub.runs_catalog());
    }
}
