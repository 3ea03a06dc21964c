//! Mesh Hub - Main Entry Point
//!
//! Connects to the message bus, starts the background services for the
//! configured role and serves the HTTP surface.

use actix_web::{middleware, web, App, HttpServer};
use anyhow::Context;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_actix_web::TracingLogger;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use mesh_hub::api::{configure_routes, ApiState, AppState, GatewayInfo, RpcGateway};
use mesh_hub::bus::{transport_from_url, EventBridge};
use mesh_hub::config::Settings;
use mesh_hub::health::{HealthChecker, HealthCheckerConfig, NetworkProbe};
use mesh_hub::metrics::{init_metrics, metrics_endpoint};
use mesh_hub::models::{ProjectCatalogEntry, ServiceRecord};
use mesh_hub::resilience::{CircuitBreaker, CircuitBreakerConfig, RateLimiter, RateLimiterConfig};
use mesh_hub::services::{
    HeartbeatConsumer, HeartbeatConsumerConfig, PresenceConfig, PresenceService,
};
use mesh_hub::store::{RecordStore, RocksStore};

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging with RUST_LOG environment variable support
    // Default: info level for mesh_hub, warn for everything else
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("warn,mesh_hub=info"));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(true)
                .with_thread_ids(true)
                .with_file(true)
                .with_line_number(true),
        )
        .init();

    // Load configuration
    let settings = Settings::load().unwrap_or_else(|e| {
        warn!("Failed to load config: {}, using defaults", e);
        Settings::default()
    });
    settings.validate().context("Invalid configuration")?;

    info!(
        "Starting Mesh Hub v{} ({})",
        mesh_hub::VERSION,
        settings.hub.hub_id
    );
    info!("Role: {:?}", settings.hub.role);
    info!("HTTP: {}:{}", settings.server.host, settings.server.http_port);
    info!("Bus: {} (namespace {})", settings.bus.url, settings.bus.namespace);

    // Initialize metrics
    init_metrics();

    // Initialize database
    let rocks_store = RocksStore::open_with_opts(
        &settings.database.data_dir,
        settings.database.cache_size_mb,
        settings.database.compression,
    )
    .context("Failed to open database")?;
    info!("Database initialized at: {}", settings.database.data_dir);

    let store = RecordStore::new(rocks_store);
    seed_store(&store, &settings)?;

    // Connect the bus; failing here is fatal
    let transport = transport_from_url(
        &settings.bus.url,
        &settings.hub.name,
        Duration::from_secs(settings.bus.connect_timeout_sec),
    )?;
    let bridge = Arc::new(EventBridge::new(
        transport,
        settings.bus.namespace.clone(),
        settings.hub.hub_id.clone(),
    ));
    bridge
        .connect()
        .await
        .context("Failed to connect to the message bus")?;
    bridge.attach_router().await?;

    let breaker = Arc::new(CircuitBreaker::new(CircuitBreakerConfig::from_settings(
        &settings.health.circuit_breaker,
    )));
    let gateway = Arc::new(RpcGateway::new(
        GatewayInfo::from_settings(&settings),
        Arc::clone(&bridge),
        store.clone(),
        Arc::clone(&breaker),
    ));

    // Role-specific background services
    let mut presence = None;
    let mut checker = None;
    let mut consumer = None;

    if settings.hub.role.runs_hub() {
        let service = Arc::new(PresenceService::new(
            PresenceConfig::from_settings(&settings),
            store.clone(),
            Arc::clone(&bridge),
        ));
        service.start().await?;
        presence = Some(service);

        let probe = NetworkProbe::new(settings.health.http_pool_size, settings.health.probe_timeout())?;
        let limiter = Arc::new(RateLimiter::new(RateLimiterConfig::from_settings(
            &settings.health.rate_limit,
        )));
        let health = Arc::new(
            HealthChecker::new(
                store.clone(),
                Arc::clone(&breaker),
                limiter,
                Arc::new(probe),
                HealthCheckerConfig::from_settings(&settings.health),
            )
            .with_bridge(Arc::clone(&bridge)),
        );
        health.start();
        checker = Some(health);
    }

    if settings.hub.role.runs_catalog() {
        let service = Arc::new(HeartbeatConsumer::new(
            HeartbeatConsumerConfig::from_settings(&settings.catalog),
            store.clone(),
            Arc::clone(&bridge),
        ));
        service.start().await?;
        consumer = Some(service);
    }

    // Create application state for HTTP server
    let app_state = AppState::new(&settings.hub.hub_id, store.clone(), Arc::clone(&bridge));
    let api_state = ApiState::new(store.clone(), checker.clone());
    let gateway_data = web::Data::from(Arc::clone(&gateway));
    let metrics_enabled = settings.metrics.enabled;
    let metrics_path = settings.metrics.path.clone();

    // Start HTTP server
    let http_addr = format!("{}:{}", settings.server.host, settings.server.http_port);
    info!("Starting HTTP server on {}", http_addr);

    let server = HttpServer::new(move || {
        let app = App::new()
            // Add shared state
            .app_data(web::Data::new(app_state.clone()))
            .app_data(web::Data::new(api_state.clone()))
            .app_data(gateway_data.clone())
            // Add middleware
            .wrap(TracingLogger::default())
            .wrap(middleware::Compress::default())
            // Add routes
            .configure(configure_routes);

        if metrics_enabled {
            app.route(&metrics_path, web::get().to(metrics_endpoint))
        } else {
            app
        }
    })
    .workers(settings.server.workers)
    .bind(&http_addr)
    .with_context(|| format!("Failed to bind {}", http_addr))?
    .run();

    let served = server.await;

    info!("HTTP server stopped, shutting down services");
    if let Some(service) = &presence {
        service.stop().await;
    }
    if let Some(health) = &checker {
        health.stop().await;
    }
    if let Some(service) = &consumer {
        service.stop().await;
    }
    if let Err(e) = bridge.disconnect().await {
        warn!("Bus disconnect failed: {}", e);
    }

    served.context("HTTP server error")
}

/// Register the projects and services listed in the configuration
fn seed_store(store: &RecordStore, settings: &Settings) -> anyhow::Result<()> {
    for project in &settings.catalog.projects {
        let entry = ProjectCatalogEntry::new(&project.slug, &project.name, &project.hub_url)
            .with_tags(project.tags.clone());
        store
            .register_project(entry)
            .with_context(|| format!("Failed to register project {}", project.slug))?;
    }

    for service in &settings.health.services {
        let record = ServiceRecord::new(
            &service.id,
            &service.project_id,
            &service.name,
            service.target.clone(),
        )
        .with_health_threshold(service.health_threshold);
        store
            .register_service(record)
            .with_context(|| format!("Failed to register service {}", service.id))?;
    }

    info!(
        projects = settings.catalog.projects.len(),
        services = settings.health.services.len(),
        "Configuration seeded"
    );
    Ok(())
}
