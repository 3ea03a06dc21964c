//! REST API endpoints using Actix-Web

use actix_web::{web, HttpResponse, Result};
use serde::Deserialize;
use std::sync::Arc;

use crate::api::responses::{ApiResponse, ListResponse};
use crate::health::HealthChecker;
use crate::models::{HubError, ProjectStatus};
use crate::store::RecordStore;

use super::health::configure_health_routes;
use super::rpc::configure_rpc_routes;

/// Shared application state
#[derive(Clone)]
pub struct ApiState {
    pub store: RecordStore,
    /// Present only on nodes running health checks
    pub checker: Option<Arc<HealthChecker>>,
}

impl ApiState {
    pub fn new(store: RecordStore, checker: Option<Arc<HealthChecker>>) -> Self {
        Self { store, checker }
    }
}

/// Configure all HTTP routes
pub fn configure_routes(cfg: &mut web::ServiceConfig) {
    // Health endpoints at root
    configure_health_routes(cfg);

    configure_rpc_routes(cfg);

    // API v1 routes
    cfg.service(web::scope("/api/v1").configure(configure_v1_routes));
}

/// Configure API v1 routes
fn configure_v1_routes(cfg: &mut web::ServiceConfig) {
    cfg.route("/peers", web::get().to(list_peers))
        .route("/catalog", web::get().to(list_catalog))
        .service(
            web::scope("/services")
                .route("", web::get().to(list_services))
                .route("/{id}/history", web::get().to(service_history))
                .route("/{id}/check", web::post().to(trigger_check)),
        );
}

// ============================================================================
// Query Parameters
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    #[serde(default = "default_limit")]
    pub limit: usize,
}

fn default_limit() -> usize {
    20
}

#[derive(Debug, Deserialize)]
pub struct CatalogQuery {
    pub status: Option<ProjectStatus>,
}

fn api_error(e: HubError) -> actix_web::Error {
    actix_web::error::InternalError::from_response(e.to_string(), HttpResponse::from(e)).into()
}

// ============================================================================
// Registry Handlers
// ============================================================================

async fn list_peers(state: web::Data<ApiState>) -> Result<HttpResponse, actix_web::Error> {
    let hubs = state.store.list_hubs().map_err(api_error)?;
    Ok(HttpResponse::Ok().json(ListResponse::new(hubs)))
}

async fn list_catalog(
    state: web::Data<ApiState>,
    query: web::Query<CatalogQuery>,
) -> Result<HttpResponse, actix_web::Error> {
    let mut projects = state.store.list_projects().map_err(api_error)?;
    if let Some(status) = query.status {
        projects.retain(|p| p.status == status);
    }
    Ok(HttpResponse::Ok().json(ListResponse::new(projects)))
}

// ============================================================================
// Service Handlers
// ============================================================================

async fn list_services(state: web::Data<ApiState>) -> Result<HttpResponse, actix_web::Error> {
    let services = state.store.list_services().map_err(api_error)?;
    Ok(HttpResponse::Ok().json(ListResponse::new(services)))
}

/// Most recent check results of one service, oldest first
async fn service_history(
    state: web::Data<ApiState>,
    path: web::Path<String>,
    query: web::Query<HistoryQuery>,
) -> Result<HttpResponse, actix_web::Error> {
    let id = path.into_inner();
    if state.store.get_service(&id).map_err(api_error)?.is_none() {
        return Err(api_error(HubError::not_found("service", id)));
    }

    let mut results = state.store.list_results(&id).map_err(api_error)?;
    let skip = results.len().saturating_sub(query.limit);
    results.drain(..skip);
    Ok(HttpResponse::Ok().json(ListResponse::new(results)))
}

async fn trigger_check(
    state: web::Data<ApiState>,
    path: web::Path<String>,
) -> Result<HttpResponse, actix_web::Error> {
    let checker = match &state.checker {
        Some(checker) => checker,
        None => {
            return Ok(HttpResponse::ServiceUnavailable().json(ApiResponse::<()>::error(
                "Health checking is not enabled on this node",
            )))
        }
    };

    let result = checker
        .check_service_now(&path.into_inner())
        .await
        .map_err(api_error)?;
    Ok(HttpResponse::Ok().json(ApiResponse::success(result)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::health::{HealthCheckerConfig, Probe};
    use crate::models::{
        HealthCheckResult, HubResult, ProbeTarget, ProjectCatalogEntry, ServiceRecord,
    };
    use crate::resilience::{
        CircuitBreaker, CircuitBreakerConfig, RateLimiter, RateLimiterConfig,
    };
    use crate::store::RocksStore;
    use actix_web::{test, App};
    use async_trait::async_trait;
    use chrono::Utc;
    use serde_json::Value;
    use std::time::Duration;
    use tempfile::TempDir;

    struct AlwaysUp;

    #[async_trait]
    impl Probe for AlwaysUp {
        async fn probe(&self, _target: &ProbeTarget) -> HubResult<Duration> {
            Ok(Duration::from_millis(5))
        }
    }

    fn checker(store: &RecordStore, max_calls: usize) -> Arc<HealthChecker> {
        let breaker = Arc::new(CircuitBreaker::new(CircuitBreakerConfig {
            failure_threshold: 3,
            recovery_timeout: Duration::from_secs(60),
        }));
        let limiter = Arc::new(RateLimiter::new(RateLimiterConfig {
            window: Duration::from_secs(60),
            max_calls,
        }));
        let config = HealthCheckerConfig {
            check_interval: Duration::from_secs(60),
            max_retries: 1,
            backoff_base: Duration::from_millis(1),
            retention: Duration::from_secs(3600),
            retention_sweep_interval: Duration::from_secs(3600),
        };
        Arc::new(HealthChecker::new(
            store.clone(),
            breaker,
            limiter,
            Arc::new(AlwaysUp),
            config,
        ))
    }

    fn seeded_store(dir: &TempDir) -> RecordStore {
        let store = RecordStore::new(RocksStore::open(dir.path()).unwrap());
        store
            .register_service(ServiceRecord::new(
                "svc-a",
                "alpha",
                "API",
                ProbeTarget::tcp("127.0.0.1", 9),
            ))
            .unwrap();
        store
            .register_project(ProjectCatalogEntry::new("alpha", "Alpha", "http://alpha"))
            .unwrap();
        store
    }

    #[actix_rt::test]
    async fn test_read_only_listings() {
        let dir = TempDir::new().unwrap();
        let store = seeded_store(&dir);
        let base = Utc::now();
        for (i, latency) in [1.0, 2.0, 3.0].into_iter().enumerate() {
            let mut result = HealthCheckResult::up("svc-a", latency, 1);
            result.checked_at = base + chrono::Duration::milliseconds(i as i64 * 10);
            store.record_check(&result).unwrap();
        }

        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(ApiState::new(store, None)))
                .service(web::scope("/api/v1").configure(configure_v1_routes)),
        )
        .await;

        let req = test::TestRequest::get().uri("/api/v1/services").to_request();
        let body: Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["total"], 1);
        assert_eq!(body["items"][0]["status"], "UP");

        let req = test::TestRequest::get()
            .uri("/api/v1/services/svc-a/history?limit=2")
            .to_request();
        let body: Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["total"], 2);
        assert_eq!(body["items"][1]["latency_ms"], 3.0);

        let req = test::TestRequest::get()
            .uri("/api/v1/services/missing/history")
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), 404);

        let req = test::TestRequest::get()
            .uri("/api/v1/catalog?status=OFFLINE")
            .to_request();
        let body: Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["items"][0]["slug"], "alpha");

        let req = test::TestRequest::get().uri("/api/v1/peers").to_request();
        let body: Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["total"], 0);
    }

    #[actix_rt::test]
    async fn test_manual_check_is_rate_limited() {
        let dir = TempDir::new().unwrap();
        let store = seeded_store(&dir);
        let checker = checker(&store, 1);

        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(ApiState::new(store, Some(checker))))
                .service(web::scope("/api/v1").configure(configure_v1_routes)),
        )
        .await;

        let req = test::TestRequest::post()
            .uri("/api/v1/services/svc-a/check")
            .to_request();
        let body: Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["success"], true);
        assert_eq!(body["data"]["status"], "UP");

        let req = test::TestRequest::post()
            .uri("/api/v1/services/svc-a/check")
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), 429);

        let req = test::TestRequest::post()
            .uri("/api/v1/services/nope/check")
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), 404);
    }

    #[actix_rt::test]
    async fn test_manual_check_without_checker() {
        let dir = TempDir::new().unwrap();
        let store = seeded_store(&dir);
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(ApiState::new(store, None)))
                .service(web::scope("/api/v1").configure(configure_v1_routes)),
        )
        .await;

        let req = test::TestRequest::post()
            .uri("/api/v1/services/svc-a/check")
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), 503);
    }
}
