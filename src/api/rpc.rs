//! JSON-RPC 2.0 gateway over the event bridge
//!
//! External tools publish through `bus.publish` and read recently observed
//! traffic through `bus.subscribe`. Only single requests are accepted.

use actix_web::{web, HttpResponse};
use chrono::{DateTime, Utc};
use futures::FutureExt;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::VecDeque;
use std::panic::AssertUnwindSafe;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::bus::{matches, subject::validate_pattern, validate_correlation_id, EventBridge, RuleId};
use crate::config::{HubRole, Settings};
use crate::models::{HubError, ServiceStatus};
use crate::resilience::{CircuitBreaker, CircuitSnapshot, CircuitState};
use crate::store::RecordStore;

pub const JSONRPC_VERSION: &str = "2.0";

pub const PARSE_ERROR: i32 = -32700;
pub const INVALID_REQUEST: i32 = -32600;
pub const METHOD_NOT_FOUND: i32 = -32601;
pub const INVALID_PARAMS: i32 = -32602;
pub const INTERNAL_ERROR: i32 = -32603;

/// Default number of events returned by `bus.subscribe`
pub const DEFAULT_EVENT_LIMIT: usize = 10;

// ============================================================================
// Wire types
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RpcError {
    pub code: i32,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl RpcError {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    pub fn parse_error(detail: impl Into<String>) -> Self {
        Self::new(PARSE_ERROR, "Parse error").with_data(Value::String(detail.into()))
    }

    pub fn invalid_request(detail: impl Into<String>) -> Self {
        Self::new(INVALID_REQUEST, "Invalid Request").with_data(Value::String(detail.into()))
    }

    pub fn method_not_found(method: &str) -> Self {
        Self::new(METHOD_NOT_FOUND, format!("Method not found: {}", method))
            .with_data(json!({ "valid_methods": RpcMethod::names() }))
    }

    pub fn invalid_params(detail: impl Into<String>) -> Self {
        Self::new(INVALID_PARAMS, "Invalid params").with_data(Value::String(detail.into()))
    }

    pub fn internal(detail: impl Into<String>) -> Self {
        Self::new(INTERNAL_ERROR, "Internal error").with_data(Value::String(detail.into()))
    }
}

impl From<HubError> for RpcError {
    fn from(error: HubError) -> Self {
        let message = error.to_string();
        match error {
            HubError::Validation(_) | HubError::SerializationError(_) => {
                RpcError::invalid_params(message)
            }
            HubError::UnknownTarget { kind, id } if kind == "method" => {
                RpcError::method_not_found(&id)
            }
            _ => RpcError::internal(message),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RpcResponse {
    pub jsonrpc: &'static str,
    pub id: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
}

impl RpcResponse {
    pub fn success(id: Value, result: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION,
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn failure(id: Value, error: RpcError) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION,
            id,
            result: None,
            error: Some(error),
        }
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }
}

/// A validated single request
#[derive(Debug, Clone, PartialEq)]
pub struct RpcRequest {
    pub id: Value,
    pub method: String,
    pub params: Value,
}

impl RpcRequest {
    /// Validate the envelope; on failure returns the id to answer with
    pub fn from_value(value: Value) -> Result<Self, (Value, RpcError)> {
        let mut map = match value {
            Value::Object(map) => map,
            Value::Array(_) => {
                return Err((
                    Value::Null,
                    RpcError::invalid_request("batch requests are not supported"),
                ))
            }
            _ => {
                return Err((
                    Value::Null,
                    RpcError::invalid_request("request must be an object"),
                ))
            }
        };

        let id = match map.remove("id") {
            None => Value::Null,
            Some(id @ (Value::Null | Value::String(_) | Value::Number(_))) => id,
            Some(_) => {
                return Err((
                    Value::Null,
                    RpcError::invalid_request("id must be a string, number or null"),
                ))
            }
        };

        if map.get("jsonrpc").and_then(Value::as_str) != Some(JSONRPC_VERSION) {
            return Err((id, RpcError::invalid_request("jsonrpc must be \"2.0\"")));
        }

        let method = match map.remove("method") {
            Some(Value::String(method)) => method,
            _ => return Err((id, RpcError::invalid_request("method must be a string"))),
        };

        let params = match map.remove("params") {
            None | Some(Value::Null) => Value::Null,
            Some(params @ (Value::Object(_) | Value::Array(_))) => params,
            Some(_) => {
                return Err((
                    id,
                    RpcError::invalid_request("params must be an object or an array"),
                ))
            }
        };

        Ok(Self { id, method, params })
    }
}

// ============================================================================
// Methods
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RpcMethod {
    BusPublish,
    BusSubscribe,
    HubInfo,
    HubHealth,
}

impl RpcMethod {
    pub const ALL: [RpcMethod; 4] = [
        RpcMethod::BusPublish,
        RpcMethod::BusSubscribe,
        RpcMethod::HubInfo,
        RpcMethod::HubHealth,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            RpcMethod::BusPublish => "bus.publish",
            RpcMethod::BusSubscribe => "bus.subscribe",
            RpcMethod::HubInfo => "hub.info",
            RpcMethod::HubHealth => "hub.health",
        }
    }

    pub fn names() -> Vec<&'static str> {
        Self::ALL.iter().map(RpcMethod::name).collect()
    }

    pub fn describe(&self) -> MethodDescription {
        let (params, description) = match self {
            RpcMethod::BusPublish => (
                json!({"topic": "string", "payload": "any", "correlation_id": "string?"}),
                "Publish a payload under the node namespace",
            ),
            RpcMethod::BusSubscribe => (
                json!({"subject": "string", "limit": "integer?"}),
                "Recently observed events matching a subject pattern",
            ),
            RpcMethod::HubInfo => (json!({}), "Static hub metadata"),
            RpcMethod::HubHealth => (
                json!({}),
                "Aggregate health from bus and store connectivity",
            ),
        };
        MethodDescription {
            name: self.name(),
            params,
            description,
        }
    }
}

impl FromStr for RpcMethod {
    type Err = HubError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .copied()
            .find(|m| m.name() == s)
            .ok_or_else(|| HubError::unknown_target("method", s))
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MethodDescription {
    pub name: &'static str,
    pub params: Value,
    pub description: &'static str,
}

#[derive(Debug, Deserialize)]
struct PublishParams {
    topic: String,
    #[serde(default)]
    payload: Value,
    #[serde(default)]
    correlation_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SubscribeParams {
    subject: String,
    #[serde(default)]
    limit: Option<usize>,
}

fn parse_params<T: DeserializeOwned>(params: Value) -> Result<T, RpcError> {
    serde_json::from_value(params).map_err(|e| RpcError::invalid_params(e.to_string()))
}

// ============================================================================
// Event log
// ============================================================================

/// An event seen on the bus by this node
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ObservedEvent {
    pub subject: String,
    pub payload: Value,
    pub observed_at: DateTime<Utc>,
}

/// Fixed-capacity log of recent bus traffic; the oldest entry is evicted first
#[derive(Debug)]
pub struct RecentEvents {
    capacity: usize,
    events: Mutex<VecDeque<ObservedEvent>>,
}

impl RecentEvents {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            events: Mutex::new(VecDeque::with_capacity(capacity)),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn push(&self, subject: &str, payload: &Value) {
        let mut events = self.events.lock();
        if events.len() == self.capacity {
            events.pop_front();
        }
        events.push_back(ObservedEvent {
            subject: subject.to_string(),
            payload: payload.clone(),
            observed_at: Utc::now(),
        });
    }

    /// Up to `limit` most recent events matching `pattern`, oldest first
    pub fn matching(&self, pattern: &str, limit: usize) -> Vec<ObservedEvent> {
        let events = self.events.lock();
        let mut found: Vec<ObservedEvent> = events
            .iter()
            .rev()
            .filter(|e| matches(pattern, &e.subject))
            .take(limit)
            .cloned()
            .collect();
        found.reverse();
        found
    }
}

// ============================================================================
// Gateway
// ============================================================================

/// Static identity reported by `hub.info`
#[derive(Debug, Clone)]
pub struct GatewayInfo {
    pub hub_id: String,
    pub name: String,
    pub version: String,
    pub role: HubRole,
    pub event_log_capacity: usize,
}

impl GatewayInfo {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            hub_id: settings.hub.hub_id.clone(),
            name: settings.hub.name.clone(),
            version: crate::VERSION.to_string(),
            role: settings.hub.role,
            event_log_capacity: settings.bus.event_log_capacity,
        }
    }
}

pub struct RpcGateway {
    info: GatewayInfo,
    bridge: Arc<EventBridge>,
    store: RecordStore,
    breaker: Arc<CircuitBreaker>,
    events: Arc<RecentEvents>,
    rule: RuleId,
    started: Instant,
}

impl RpcGateway {
    /// Create the gateway and register its event-log rule on the bridge's router.
    ///
    /// The log only fills once the bridge router is attached to the bus.
    pub fn new(
        info: GatewayInfo,
        bridge: Arc<EventBridge>,
        store: RecordStore,
        breaker: Arc<CircuitBreaker>,
    ) -> Self {
        let events = Arc::new(RecentEvents::new(info.event_log_capacity));
        let sink = Arc::clone(&events);
        let rule = bridge.router().add_rule(
            crate::bus::subject::WILDCARD_TAIL,
            Arc::new(move |subject: &str, payload: &Value| -> anyhow::Result<()> {
                sink.push(subject, payload);
                Ok(())
            }),
        );

        Self {
            info,
            bridge,
            store,
            breaker,
            events,
            rule,
            started: Instant::now(),
        }
    }

    pub fn events(&self) -> &RecentEvents {
        &self.events
    }

    pub fn methods(&self) -> Vec<MethodDescription> {
        RpcMethod::ALL.iter().map(RpcMethod::describe).collect()
    }

    /// Handle a raw request body
    pub async fn handle_bytes(&self, body: &[u8]) -> RpcResponse {
        match serde_json::from_slice::<Value>(body) {
            Ok(value) => self.handle_value(value).await,
            Err(e) => RpcResponse::failure(Value::Null, RpcError::parse_error(e.to_string())),
        }
    }

    /// Handle a decoded request; never fails, errors become error objects
    pub async fn handle_value(&self, value: Value) -> RpcResponse {
        let request = match RpcRequest::from_value(value) {
            Ok(request) => request,
            Err((id, error)) => return RpcResponse::failure(id, error),
        };

        let method = match request.method.parse::<RpcMethod>() {
            Ok(method) => method,
            Err(e) => {
                debug!(method = %request.method, "Unknown RPC method");
                return RpcResponse::failure(request.id, e.into());
            }
        };

        match AssertUnwindSafe(self.dispatch(method, request.params))
            .catch_unwind()
            .await
        {
            Ok(Ok(result)) => RpcResponse::success(request.id, result),
            Ok(Err(e)) => {
                warn!(method = method.name(), code = e.code, "RPC call failed: {}", e.message);
                RpcResponse::failure(request.id, e)
            }
            Err(_) => {
                error!(method = method.name(), "RPC handler panicked");
                RpcResponse::failure(request.id, RpcError::internal("handler panicked"))
            }
        }
    }

    pub async fn dispatch(&self, method: RpcMethod, params: Value) -> Result<Value, RpcError> {
        match method {
            RpcMethod::BusPublish => self.bus_publish(parse_params(params)?).await,
            RpcMethod::BusSubscribe => self.bus_subscribe(parse_params(params)?),
            RpcMethod::HubInfo => Ok(self.hub_info()),
            RpcMethod::HubHealth => Ok(self.hub_health()),
        }
    }

    async fn bus_publish(&self, params: PublishParams) -> Result<Value, RpcError> {
        if params.topic.trim().is_empty() {
            return Err(RpcError::invalid_params("topic must not be empty"));
        }
        let correlation_id = params
            .correlation_id
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        validate_correlation_id(&correlation_id)?;

        let subject = self
            .bridge
            .publish(&params.topic, params.payload, Some(&correlation_id))
            .await?;

        Ok(json!({
            "published": true,
            "subject": subject,
            "correlation_id": correlation_id,
        }))
    }

    fn bus_subscribe(&self, params: SubscribeParams) -> Result<Value, RpcError> {
        let pattern = self.bridge.qualify(&params.subject);
        validate_pattern(&pattern)?;

        let limit = params
            .limit
            .unwrap_or(DEFAULT_EVENT_LIMIT)
            .clamp(1, self.events.capacity());
        let events = self.events.matching(&pattern, limit);

        Ok(json!({
            "subject": pattern,
            "count": events.len(),
            "events": events,
        }))
    }

    fn hub_info(&self) -> Value {
        json!({
            "hub_id": self.info.hub_id,
            "name": self.info.name,
            "version": self.info.version,
            "role": self.info.role,
            "namespace": self.bridge.namespace(),
            "uptime_seconds": self.started.elapsed().as_secs_f64(),
            "methods": RpcMethod::names(),
        })
    }

    fn hub_health(&self) -> Value {
        let bus = self.bridge.is_connected();
        let store = self.store.ping().is_ok();
        let status = aggregate_status(&[bus, store]);

        let mut counts = Map::new();
        for status in [ServiceStatus::Up, ServiceStatus::Down, ServiceStatus::Unknown] {
            counts.insert(status.to_string(), json!(0));
        }
        if store {
            match self.store.list_services() {
                Ok(services) => {
                    for service in services {
                        if let Some(Value::Number(n)) = counts.get_mut(&service.status.to_string())
                        {
                            *n = (n.as_u64().unwrap_or(0) + 1).into();
                        }
                    }
                }
                Err(e) => warn!("Failed to list services for health: {}", e),
            }
        }

        let open_circuits: Vec<CircuitSnapshot> = self
            .breaker
            .snapshot()
            .into_iter()
            .filter(|c| c.state != CircuitState::Closed)
            .collect();

        json!({
            "status": status,
            "dependencies": { "bus": bus, "store": store },
            "services": counts,
            "open_circuits": open_circuits,
            "timestamp": Utc::now(),
        })
    }
}

/// healthy when every dependency is up, unhealthy when none is, degraded otherwise
pub fn aggregate_status(dependencies: &[bool]) -> &'static str {
    let up = dependencies.iter().filter(|d| **d).count();
    if up == dependencies.len() {
        "healthy"
    } else if up == 0 {
        "unhealthy"
    } else {
        "degraded"
    }
}

impl Drop for RpcGateway {
    fn drop(&mut self) {
        self.bridge.router().remove_rule(self.rule);
    }
}

impl std::fmt::Debug for RpcGateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcGateway")
            .field("hub_id", &self.info.hub_id)
            .field("events", &self.events.len())
            .finish()
    }
}

// ============================================================================
// HTTP handlers
// ============================================================================

/// POST /rpc
pub async fn rpc_endpoint(gateway: web::Data<RpcGateway>, body: web::Bytes) -> HttpResponse {
    HttpResponse::Ok().json(gateway.handle_bytes(&body).await)
}

/// GET /rpc
pub async fn rpc_methods(gateway: web::Data<RpcGateway>) -> HttpResponse {
    HttpResponse::Ok().json(json!({
        "jsonrpc": JSONRPC_VERSION,
        "methods": gateway.methods(),
    }))
}

pub fn configure_rpc_routes(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::resource("/rpc")
            .route(web::post().to(rpc_endpoint))
            .route(web::get().to(rpc_methods)),
    );
}
