//! Health check endpoints

use actix_web::{get, web, HttpResponse};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;

use crate::bus::EventBridge;
use crate::store::RecordStore;

/// Health check response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub hub_id: String,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uptime_seconds: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub checks: Option<ReadinessChecks>,
}

/// Dependency reachability reported by `/ready`
#[derive(Debug, Clone, Copy, Serialize)]
pub struct ReadinessChecks {
    pub bus: bool,
    pub store: bool,
}

impl HealthResponse {
    pub fn new(status: &str, hub_id: &str, version: &str) -> Self {
        Self {
            status: status.to_string(),
            version: version.to_string(),
            hub_id: hub_id.to_string(),
            timestamp: Utc::now(),
            uptime_seconds: None,
            checks: None,
        }
    }

    pub fn healthy(hub_id: &str, version: &str) -> Self {
        Self::new("healthy", hub_id, version)
    }

    pub fn with_uptime(mut self, uptime: f64) -> Self {
        self.uptime_seconds = Some(uptime);
        self
    }
}

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub hub_id: String,
    pub version: String,
    pub start_time: DateTime<Utc>,
    pub store: RecordStore,
    pub bridge: Arc<EventBridge>,
}

impl AppState {
    pub fn new(hub_id: impl Into<String>, store: RecordStore, bridge: Arc<EventBridge>) -> Self {
        Self {
            hub_id: hub_id.into(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            start_time: Utc::now(),
            store,
            bridge,
        }
    }

    pub fn uptime_seconds(&self) -> f64 {
        let duration = Utc::now().signed_duration_since(self.start_time);
        duration.num_milliseconds() as f64 / 1000.0
    }

    pub fn readiness(&self) -> ReadinessChecks {
        ReadinessChecks {
            bus: self.bridge.is_connected(),
            store: self.store.ping().is_ok(),
        }
    }
}

/// Health check endpoint
#[get("/health")]
pub async fn health_check(state: web::Data<AppState>) -> HttpResponse {
    let response = HealthResponse::healthy(&state.hub_id, &state.version)
        .with_uptime(state.uptime_seconds());

    HttpResponse::Ok().json(response)
}

/// Readiness check endpoint; 503 until the bus and the store are reachable
#[get("/ready")]
pub async fn readiness_check(state: web::Data<AppState>) -> HttpResponse {
    let checks = state.readiness();
    let ready = checks.bus && checks.store;

    let mut response = HealthResponse::new(
        if ready { "ready" } else { "not_ready" },
        &state.hub_id,
        &state.version,
    );
    response.checks = Some(checks);

    if ready {
        HttpResponse::Ok().json(response)
    } else {
        HttpResponse::ServiceUnavailable().json(response)
    }
}

/// Liveness check endpoint
#[get("/live")]
pub async fn liveness_check() -> HttpResponse {
    HttpResponse::Ok().json(serde_json::json!({
        "status": "alive"
    }))
}

/// Configure health routes
pub fn configure_health_routes(cfg: &mut web::ServiceConfig) {
    cfg.service(health_check)
        .service(readiness_check)
        .service(liveness_check);
}
