//! Health checking of monitored services
//!
//! Each check goes through the circuit breaker and a bounded retry loop with
//! exponential backoff, then persists the result and announces it on the bus.

use chrono::Utc;
use futures::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::probe::Probe;
use crate::bus::{subject::subjects, EventBridge};
use crate::config::HealthSettings;
use crate::metrics;
use crate::models::{HealthCheckResult, HubError, HubResult, ServiceRecord, ServiceStatus};
use crate::resilience::{CircuitBreaker, RateLimiter};
use crate::runtime::BackgroundTasks;
use crate::store::RecordStore;

/// Health checker configuration
#[derive(Debug, Clone)]
pub struct HealthCheckerConfig {
    pub check_interval: Duration,
    /// Total probe attempts per check
    pub max_retries: u32,
    pub backoff_base: Duration,
    pub retention: Duration,
    pub retention_sweep_interval: Duration,
}

impl HealthCheckerConfig {
    pub fn from_settings(settings: &HealthSettings) -> Self {
        Self {
            check_interval: settings.check_interval(),
            max_retries: settings.max_retries.max(1),
            backoff_base: settings.backoff_base(),
            retention: settings.retention(),
            retention_sweep_interval: settings.retention_sweep_interval(),
        }
    }
}

/// Health checker owning the sweep and retention loops
pub struct HealthChecker {
    store: RecordStore,
    breaker: Arc<CircuitBreaker>,
    limiter: Arc<RateLimiter>,
    probe: Arc<dyn Probe>,
    bridge: Option<Arc<EventBridge>>,
    config: HealthCheckerConfig,
    tasks: BackgroundTasks,
}

impl HealthChecker {
    pub fn new(
        store: RecordStore,
        breaker: Arc<CircuitBreaker>,
        limiter: Arc<RateLimiter>,
        probe: Arc<dyn Probe>,
        config: HealthCheckerConfig,
    ) -> Self {
        Self {
            store,
            breaker,
            limiter,
            probe,
            bridge: None,
            config,
            tasks: BackgroundTasks::new(),
        }
    }

    /// Publish every result on `<ns>.health.<service_id>`
    pub fn with_bridge(mut self, bridge: Arc<EventBridge>) -> Self {
        self.bridge = Some(bridge);
        self
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    pub fn config(&self) -> &HealthCheckerConfig {
        &self.config
    }

    /// Probe one service, persist the outcome and return it.
    ///
    /// Probe failures never surface as errors; they end up as a DOWN result.
    pub async fn check_service_health(
        &self,
        service: &ServiceRecord,
        max_retries: u32,
    ) -> HealthCheckResult {
        let result = self.probe_with_retry(service, max_retries.max(1)).await;
        metrics::record_probe(result.status);

        match self.store.record_check(&result) {
            Ok(updated) => debug!(
                service = %service.id,
                status = %updated.status,
                attempts = result.attempts,
                "Health check recorded"
            ),
            Err(e) => warn!(service = %service.id, "Failed to store health result: {}", e),
        }

        self.announce(&result).await;
        result
    }

    /// Manually triggered check, subject to the per-service rate limit
    pub async fn check_service_now(&self, service_id: &str) -> HubResult<HealthCheckResult> {
        let service = self
            .store
            .get_service(service_id)?
            .ok_or_else(|| HubError::not_found("service", service_id))?;

        if !self.limiter.is_allowed(service_id) {
            return Err(HubError::RateLimitExceeded(format!(
                "too many manual checks for service {}",
                service_id
            )));
        }

        Ok(self
            .check_service_health(&service, self.config.max_retries)
            .await)
    }

    /// Check every registered service concurrently
    pub async fn sweep(&self) -> HubResult<Vec<HealthCheckResult>> {
        let services = self.store.list_services()?;
        let checks = services
            .iter()
            .map(|service| self.check_service_health(service, self.config.max_retries));
        let results = join_all(checks).await;

        let down = results
            .iter()
            .filter(|r| r.status == ServiceStatus::Down)
            .count();
        info!(checked = results.len(), down, "Health sweep finished");
        Ok(results)
    }

    /// Delete history older than the retention window; returns the count
    pub fn purge_history(&self) -> HubResult<usize> {
        let retention = chrono::Duration::from_std(self.config.retention)
            .map_err(|e| HubError::ConfigError(format!("Invalid retention window: {}", e)))?;
        let removed = self.store.purge_results_before(Utc::now() - retention)?;
        if removed > 0 {
            info!(removed, "Purged expired health results");
        }
        self.limiter.purge_idle();
        Ok(removed)
    }

    /// Spawn the sweep and retention loops
    pub fn start(self: &Arc<Self>) {
        let checker = Arc::clone(self);
        self.tasks
            .spawn_periodic("health-sweep", self.config.check_interval, move || {
                let checker = Arc::clone(&checker);
                async move { checker.sweep().await.map(|_| ()) }
            });

        let checker = Arc::clone(self);
        self.tasks.spawn_periodic(
            "health-retention",
            self.config.retention_sweep_interval,
            move || {
                let checker = Arc::clone(&checker);
                async move { checker.purge_history().map(|_| ()) }
            },
        );

        info!(
            interval = ?self.config.check_interval,
            retries = self.config.max_retries,
            "Health checker started"
        );
    }

    /// Cancel both loops and wait for them; safe to call repeatedly
    pub async fn stop(&self) {
        self.tasks.shutdown().await;
    }

    pub fn active_tasks(&self) -> usize {
        self.tasks.active_count()
    }

    async fn probe_with_retry(&self, service: &ServiceRecord, budget: u32) -> HealthCheckResult {
        let mut attempts = 0u32;
        let mut last_error = String::from("circuit open");

        for attempt in 0..budget {
            if self.breaker.is_open(&service.id) {
                if attempt > 0 {
                    last_error = format!("circuit opened after retry: {}", last_error);
                }
                debug!(service = %service.id, "Circuit open, skipping probe");
                break;
            }

            attempts += 1;
            match self.probe.probe(&service.target).await {
                Ok(latency) => {
                    self.breaker.record_success(&service.id);
                    return HealthCheckResult::up(
                        &service.id,
                        latency.as_secs_f64() * 1000.0,
                        attempts,
                    );
                }
                Err(e) => {
                    self.breaker.record_failure(&service.id);
                    debug!(service = %service.id, attempt = attempts, "Probe failed: {}", e);
                    last_error = e.to_string();
                }
            }

            if attempt + 1 < budget {
                let delay = self.config.backoff_base.mul_f64(2f64.powi(attempt as i32));
                tokio::time::sleep(delay).await;
            }
        }

        HealthCheckResult::down(&service.id, attempts, last_error)
    }

    async fn announce(&self, result: &HealthCheckResult) {
        let Some(bridge) = &self.bridge else {
            return;
        };
        if !bridge.is_connected() {
            return;
        }

        let payload = match serde_json::to_value(result) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(service = %result.service_id, "Failed to encode health result: {}", e);
                return;
            }
        };
        let subject = subjects::health_result(bridge.namespace(), &result.service_id);
        if let Err(e) = bridge.publish(&subject, payload, None).await {
            warn!(service = %result.service_id, "Failed to publish health result: {}", e);
        }
    }
}

impl std::fmt::Debug for HealthChecker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HealthChecker")
            .field("config", &self.config)
            .field("tasks", &self.tasks)
            .finish()
    }
}
