//! Per-target circuit breaker gating health probes
//!
//! ```text
//!   CLOSED --(failure_threshold consecutive failures)--> OPEN
//!   OPEN   --(recovery_timeout elapsed, one caller)----> HALF_OPEN
//!   HALF_OPEN --success--> CLOSED
//!   HALF_OPEN --failure--> OPEN (window restarts)
//! ```
//!
//! Only one trial is let through per recovery window. If its outcome is never
//! recorded the claim lapses after another `recovery_timeout`.

use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::config::CircuitBreakerSettings;
use crate::metrics;

/// Circuit breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half-open"),
        }
    }
}

/// Circuit breaker configuration
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures before the circuit opens
    pub failure_threshold: u32,
    /// Time an open circuit rejects calls before allowing a trial
    pub recovery_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(60),
        }
    }
}

impl CircuitBreakerConfig {
    pub fn from_settings(settings: &CircuitBreakerSettings) -> Self {
        Self {
            failure_threshold: settings.failure_threshold.max(1),
            recovery_timeout: Duration::from_secs(settings.recovery_timeout_sec),
        }
    }
}

#[derive(Debug)]
struct TargetCircuit {
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    trial_started_at: Option<Instant>,
}

impl TargetCircuit {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            opened_at: None,
            trial_started_at: None,
        }
    }

    fn open(&mut self, now: Instant) {
        self.state = CircuitState::Open;
        self.opened_at = Some(now);
        self.trial_started_at = None;
    }
}

/// Point-in-time view of one circuit
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CircuitSnapshot {
    pub key: String,
    pub state: CircuitState,
    pub consecutive_failures: u32,
}

/// Circuit breakers for every probed target, keyed by target id
pub struct CircuitBreaker {
    circuits: RwLock<HashMap<String, TargetCircuit>>,
    config: CircuitBreakerConfig,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            circuits: RwLock::new(HashMap::new()),
            config,
        }
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Whether calls to `key` must fail fast.
    ///
    /// Once the recovery timeout has elapsed the first caller claims the trial
    /// and gets `false`; concurrent callers keep seeing `true`.
    pub fn is_open(&self, key: &str) -> bool {
        self.is_open_at(key, Instant::now())
    }

    pub(crate) fn is_open_at(&self, key: &str, now: Instant) -> bool {
        {
            let circuits = self.circuits.read();
            match circuits.get(key) {
                None => return false,
                Some(c) if c.state == CircuitState::Closed => return false,
                Some(_) => {}
            }
        }

        let mut circuits = self.circuits.write();
        let Some(circuit) = circuits.get_mut(key) else {
            return false;
        };

        match circuit.state {
            CircuitState::Closed => false,
            CircuitState::Open => {
                let opened_at = circuit.opened_at.unwrap_or(now);
                if now.saturating_duration_since(opened_at) >= self.config.recovery_timeout {
                    info!(target_key = key, "Circuit half-open, allowing trial probe");
                    circuit.state = CircuitState::HalfOpen;
                    circuit.trial_started_at = Some(now);
                    false
                } else {
                    true
                }
            }
            CircuitState::HalfOpen => {
                let claimed_at = circuit.trial_started_at.unwrap_or(now);
                if now.saturating_duration_since(claimed_at) >= self.config.recovery_timeout {
                    // The previous trial never reported back
                    circuit.trial_started_at = Some(now);
                    false
                } else {
                    true
                }
            }
        }
    }

    /// Any success fully closes the circuit
    pub fn record_success(&self, key: &str) {
        let mut circuits = self.circuits.write();
        if let Some(circuit) = circuits.get_mut(key) {
            if circuit.state != CircuitState::Closed {
                info!(target_key = key, "Circuit closed after successful probe");
            }
            *circuit = TargetCircuit::new();
        }
    }

    pub fn record_failure(&self, key: &str) {
        self.record_failure_at(key, Instant::now());
    }

    pub(crate) fn record_failure_at(&self, key: &str, now: Instant) {
        let mut circuits = self.circuits.write();
        let circuit = circuits
            .entry(key.to_string())
            .or_insert_with(TargetCircuit::new);
        circuit.consecutive_failures = circuit.consecutive_failures.saturating_add(1);

        match circuit.state {
            CircuitState::Closed => {
                if circuit.consecutive_failures >= self.config.failure_threshold {
                    warn!(
                        target_key = key,
                        failures = circuit.consecutive_failures,
                        "Circuit opened"
                    );
                    circuit.open(now);
                    metrics::record_circuit_opened();
                } else {
                    debug!(
                        target_key = key,
                        failures = circuit.consecutive_failures,
                        "Failure recorded"
                    );
                }
            }
            CircuitState::HalfOpen => {
                warn!(target_key = key, "Trial probe failed, circuit re-opened");
                circuit.open(now);
                metrics::record_circuit_opened();
            }
            CircuitState::Open => {
                circuit.opened_at = Some(now);
            }
        }
    }

    pub fn state(&self, key: &str) -> CircuitState {
        self.circuits
            .read()
            .get(key)
            .map(|c| c.state)
            .unwrap_or(CircuitState::Closed)
    }

    /// Every tracked circuit, sorted by key
    pub fn snapshot(&self) -> Vec<CircuitSnapshot> {
        let mut snapshot: Vec<CircuitSnapshot> = self
            .circuits
            .read()
            .iter()
            .map(|(key, c)| CircuitSnapshot {
                key: key.clone(),
                state: c.state,
                consecutive_failures: c.consecutive_failures,
            })
            .collect();
        snapshot.sort_by(|a, b| a.key.cmp(&b.key));
        snapshot
    }

    pub fn open_count(&self) -> usize {
        self.circuits
            .read()
            .values()
            .filter(|c| c.state != CircuitState::Closed)
            .count()
    }

    /// Forget everything known about `key`
    pub fn reset(&self, key: &str) {
        self.circuits.write().remove(key);
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("config", &self.config)
            .field("circuits", &self.snapshot())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker(threshold: u32, recovery_secs: u64) -> CircuitBreaker {
        CircuitBreaker::new(CircuitBreakerConfig {
            failure_threshold: threshold,
            recovery_timeout: Duration::from_secs(recovery_secs),
        })
    }

    #[test]
    fn test_opens_after_threshold() {
        let cb = breaker(3, 60);
        cb.record_failure("svc");
        cb.record_failure("svc");
        assert!(!cb.is_open("svc"));

        cb.record_failure("svc");
        assert!(cb.is_open("svc"));
        assert_eq!(cb.state("svc"), CircuitState::Open);
        assert_eq!(cb.open_count(), 1);
    }

    #[test]
    fn test_success_resets_counter() {
        let cb = breaker(3, 60);
        cb.record_failure("svc");
        cb.record_failure("svc");
        cb.record_success("svc");
        cb.record_failure("svc");

        assert!(!cb.is_open("svc"));
        assert_eq!(cb.snapshot()[0].consecutive_failures, 1);
    }

    #[test]
    fn test_keys_are_independent() {
        let cb = breaker(1, 60);
        cb.record_failure("a");
        assert!(cb.is_open("a"));
        assert!(!cb.is_open("b"));
    }

    #[test]
    fn test_single_trial_after_recovery_timeout() {
        let cb = breaker(2, 30);
        let start = Instant::now();
        cb.record_failure_at("svc", start);
        cb.record_failure_at("svc", start);

        assert!(cb.is_open_at("svc", start + Duration::from_secs(29)));

        let recovered = start + Duration::from_secs(30);
        assert!(!cb.is_open_at("svc", recovered));
        assert_eq!(cb.state("svc"), CircuitState::HalfOpen);
        // A second concurrent caller is still rejected
        assert!(cb.is_open_at("svc", recovered));

        cb.record_success("svc");
        assert_eq!(cb.state("svc"), CircuitState::Closed);
        assert!(!cb.is_open_at("svc", recovered));
    }

    #[test]
    fn test_failed_trial_restarts_window() {
        let cb = breaker(1, 30);
        let start = Instant::now();
        cb.record_failure_at("svc", start);

        let trial = start + Duration::from_secs(30);
        assert!(!cb.is_open_at("svc", trial));
        cb.record_failure_at("svc", trial);

        assert_eq!(cb.state("svc"), CircuitState::Open);
        assert!(cb.is_open_at("svc", trial + Duration::from_secs(29)));
        assert!(!cb.is_open_at("svc", trial + Duration::from_secs(30)));
    }

    #[test]
    fn test_unreported_trial_lapses() {
        let cb = breaker(1, 10);
        let start = Instant::now();
        cb.record_failure_at("svc", start);

        assert!(!cb.is_open_at("svc", start + Duration::from_secs(10)));
        assert!(cb.is_open_at("svc", start + Duration::from_secs(15)));
        assert!(!cb.is_open_at("svc", start + Duration::from_secs(20)));
    }

    #[test]
    fn test_reset_forgets_target() {
        let cb = breaker(1, 60);
        cb.record_failure("svc");
        cb.reset("svc");
        assert!(!cb.is_open("svc"));
        assert!(cb.snapshot().is_empty());
    }
}
