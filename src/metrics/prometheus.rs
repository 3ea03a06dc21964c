//! Prometheus metrics integration

use actix_web::HttpResponse;
use once_cell::sync::Lazy;
use prometheus::{
    opts, register_int_counter, register_int_counter_vec, register_int_gauge, Encoder,
    IntCounter, IntCounterVec, IntGauge, TextEncoder,
};

use crate::models::ServiceStatus;

// Define metrics
static BUS_MESSAGES_PUBLISHED: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(opts!(
        "bus_messages_published_total",
        "Total number of messages published on the bus"
    ))
    .expect("Failed to create bus messages counter")
});

static BUS_HANDLER_ERRORS: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(opts!(
        "bus_handler_errors_total",
        "Total number of failed or panicked bus handlers"
    ))
    .expect("Failed to create handler errors counter")
});

static HEALTH_PROBES: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        opts!("health_probes_total", "Health checks by resulting status"),
        &["status"]
    )
    .expect("Failed to create health probes counter")
});

static CIRCUITS_OPENED: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(opts!(
        "circuit_breaker_opened_total",
        "Total number of circuit breaker trips"
    ))
    .expect("Failed to create circuit breaker counter")
});

static HEARTBEATS: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        opts!("catalog_heartbeats_total", "Project heartbeats by outcome"),
        &["outcome"]
    )
    .expect("Failed to create heartbeats counter")
});

static PEERS_KNOWN: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!(opts!("hub_peers_known", "Number of peer hubs in the registry"))
        .expect("Failed to create peers gauge")
});

static PRESENCE_PUBLISHED: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(opts!(
        "hub_presence_published_total",
        "Total number of presence announcements sent"
    ))
    .expect("Failed to create presence counter")
});

/// Initialize all metrics
pub fn init_metrics() {
    // Force lazy initialization
    Lazy::force(&BUS_MESSAGES_PUBLISHED);
    Lazy::force(&BUS_HANDLER_ERRORS);
    Lazy::force(&HEALTH_PROBES);
    Lazy::force(&CIRCUITS_OPENED);
    Lazy::force(&HEARTBEATS);
    Lazy::force(&PEERS_KNOWN);
    Lazy::force(&PRESENCE_PUBLISHED);
}

/// Record a message published through the bridge
pub fn record_bus_publish() {
    BUS_MESSAGES_PUBLISHED.inc();
}

/// Record a handler that failed or panicked
pub fn record_handler_error() {
    BUS_HANDLER_ERRORS.inc();
}

/// Record a finished health check
pub fn record_probe(status: ServiceStatus) {
    HEALTH_PROBES
        .with_label_values(&[&status.to_string().to_lowercase()])
        .inc();
}

pub fn record_circuit_opened() {
    CIRCUITS_OPENED.inc();
}

/// Record a heartbeat by outcome label (`applied`, `malformed`, ...)
pub fn record_heartbeat(outcome: &str) {
    HEARTBEATS.with_label_values(&[outcome]).inc();
}

pub fn set_peers_known(count: i64) {
    PEERS_KNOWN.set(count);
}

pub fn record_presence_published() {
    PRESENCE_PUBLISHED.inc();
}

/// Prometheus metrics endpoint, mounted at the configured path
pub async fn metrics_endpoint() -> HttpResponse {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();

    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        return HttpResponse::InternalServerError().body(format!("Failed to encode metrics: {}", e));
    }

    HttpResponse::Ok()
        .content_type("text/plain; version=0.0.4; charset=utf-8")
        .body(buffer)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_initialization() {
        init_metrics();

        record_bus_publish();
        record_probe(ServiceStatus::Up);
        record_heartbeat("applied");
        set_peers_known(3);

        assert!(BUS_MESSAGES_PUBLISHED.get() >= 1);
        assert!(HEALTH_PROBES.with_label_values(&["up"]).get() >= 1);
        assert_eq!(PEERS_KNOWN.get(), 3);
    }

    #[actix_rt::test]
    async fn test_metrics_endpoint_renders_text() {
        init_metrics();
        record_presence_published();

        let response = metrics_endpoint().await;
        assert!(response.status().is_success());
    }
}
