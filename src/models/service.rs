//! Monitored services and their health history

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Health status of a service or of a single check
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ServiceStatus {
    Up,
    Down,
    Unknown,
}

impl Default for ServiceStatus {
    fn default() -> Self {
        ServiceStatus::Unknown
    }
}

impl std::fmt::Display for ServiceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServiceStatus::Up => write!(f, "UP"),
            ServiceStatus::Down => write!(f, "DOWN"),
            ServiceStatus::Unknown => write!(f, "UNKNOWN"),
        }
    }
}

/// Where and how a service is probed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum ProbeTarget {
    /// HTTP GET; healthy on `expected_status` or any 2xx
    Http {
        url: String,
        #[serde(default)]
        expected_status: Option<u16>,
    },
    /// Plain TCP connect
    Tcp { host: String, port: u16 },
}

impl ProbeTarget {
    pub fn http(url: impl Into<String>) -> Self {
        ProbeTarget::Http {
            url: url.into(),
            expected_status: None,
        }
    }

    pub fn tcp(host: impl Into<String>, port: u16) -> Self {
        ProbeTarget::Tcp {
            host: host.into(),
            port,
        }
    }
}

impl std::fmt::Display for ProbeTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProbeTarget::Http { url, .. } => write!(f, "GET {}", url),
            ProbeTarget::Tcp { host, port } => write!(f, "tcp://{}:{}", host, port),
        }
    }
}

/// A service whose health is monitored
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceRecord {
    pub id: String,
    pub project_id: String,
    pub name: String,
    pub target: ProbeTarget,
    /// Consecutive failed checks before the status flips to DOWN
    pub health_threshold: u32,
    #[serde(default)]
    pub status: ServiceStatus,
    #[serde(default)]
    pub consecutive_failures: u32,
    #[serde(default)]
    pub last_checked_at: Option<DateTime<Utc>>,
}

impl ServiceRecord {
    pub fn new(
        id: impl Into<String>,
        project_id: impl Into<String>,
        name: impl Into<String>,
        target: ProbeTarget,
    ) -> Self {
        Self {
            id: id.into(),
            project_id: project_id.into(),
            name: name.into(),
            target,
            health_threshold: 1,
            status: ServiceStatus::Unknown,
            consecutive_failures: 0,
            last_checked_at: None,
        }
    }

    pub fn with_health_threshold(mut self, threshold: u32) -> Self {
        self.health_threshold = threshold.max(1);
        self
    }

    /// Fold a check result into the record's status
    pub fn apply_result(&mut self, result: &HealthCheckResult) {
        self.last_checked_at = Some(result.checked_at);
        match result.status {
            ServiceStatus::Up => {
                self.status = ServiceStatus::Up;
                self.consecutive_failures = 0;
            }
            ServiceStatus::Down => {
                self.consecutive_failures = self.consecutive_failures.saturating_add(1);
                if self.consecutive_failures >= self.health_threshold.max(1) {
                    self.status = ServiceStatus::Down;
                }
            }
            ServiceStatus::Unknown => {}
        }
    }
}

/// Outcome of one health check, appended to the history
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthCheckResult {
    pub service_id: String,
    pub status: ServiceStatus,
    pub latency_ms: Option<f64>,
    pub checked_at: DateTime<Utc>,
    #[serde(default)]
    pub attempts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl HealthCheckResult {
    pub fn up(service_id: impl Into<String>, latency_ms: f64, attempts: u32) -> Self {
        Self {
            service_id: service_id.into(),
            status: ServiceStatus::Up,
            latency_ms: Some(latency_ms),
            checked_at: Utc::now(),
            attempts,
            error: None,
        }
    }

    pub fn down(service_id: impl Into<String>, attempts: u32, error: impl Into<String>) -> Self {
        Self {
            service_id: service_id.into(),
            status: ServiceStatus::Down,
            latency_ms: None,
            checked_at: Utc::now(),
            attempts,
            error: Some(error.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_probe_target_wire_format() {
        let target: ProbeTarget =
            serde_json::from_str(r#"{"kind":"http","url":"http://svc/health"}"#).unwrap();
        assert_eq!(target, ProbeTarget::http("http://svc/health"));

        let tcp: ProbeTarget =
            serde_json::from_str(r#"{"kind":"tcp","host":"db","port":5432}"#).unwrap();
        assert_eq!(tcp.to_string(), "tcp://db:5432");
    }

    #[test]
    fn test_threshold_delays_down() {
        let mut service = ServiceRecord::new("svc-1", "alpha", "api", ProbeTarget::http("http://x"))
            .with_health_threshold(2);

        service.apply_result(&HealthCheckResult::down("svc-1", 1, "refused"));
        assert_eq!(service.status, ServiceStatus::Unknown);
        assert_eq!(service.consecutive_failures, 1);

        service.apply_result(&HealthCheckResult::down("svc-1", 1, "refused"));
        assert_eq!(service.status, ServiceStatus::Down);

        service.apply_result(&HealthCheckResult::up("svc-1", 3.5, 1));
        assert_eq!(service.status, ServiceStatus::Up);
        assert_eq!(service.consecutive_failures, 0);
    }
}
