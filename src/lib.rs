//! Mesh Hub - Federation core for multi-instance Hub deployments
//!
//! A Rust-based hub core providing:
//! - Peer discovery and metrics over a pub/sub bus (presence)
//! - A project catalog kept live by heartbeats
//! - Service health checks behind a circuit breaker and rate limiter
//! - Subject routing and a JSON-RPC gateway over the bus

pub mod api;
pub mod bus;
pub mod config;
pub mod health;
pub mod metrics;
pub mod models;
pub mod resilience;
pub mod runtime;
pub mod services;
pub mod store;

// Re-export commonly used types
pub use bus::{EventBridge, InMemoryBroker, SubjectRouter, Transport};
pub use config::Settings;
pub use health::HealthChecker;
pub use models::{HubError, HubResult};
pub use resilience::{CircuitBreaker, RateLimiter};
pub use services::{HeartbeatConsumer, PresenceService};
pub use store::{RecordStore, RocksStore};

/// Version of the mesh-hub
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
