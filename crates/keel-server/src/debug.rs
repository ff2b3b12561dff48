//! Debug endpoints: process info, registered routes and effective config.

use axum::{extract::State, routing::get, Json, Router};
use chrono::{DateTime, Utc};
use keel_config::ConfigStore;
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;

use crate::shutdown::ShutdownCoordinator;

const REDACTED: &str = "[redacted]";

/// A route registered through the application builder
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RouteInfo {
    /// HTTP methods, or `*` when the route was added as a method router
    pub methods: Vec<String>,
    /// Route template
    pub path: String,
}

impl RouteInfo {
    /// Create a route entry
    pub fn new(methods: &[&str], path: impl Into<String>) -> Self {
        Self {
            methods: methods.iter().map(|m| (*m).to_string()).collect(),
            path: path.into(),
        }
    }
}

/// Process information returned by `{prefix}/info`
#[derive(Debug, Clone, Serialize)]
pub struct DebugInfo {
    /// Service name
    pub service: String,
    /// Service version
    pub version: String,
    /// Deployment environment
    pub environment: String,
    /// Seconds since the server was built
    pub uptime_seconds: u64,
    /// Process id
    pub pid: u32,
    /// RFC 3339 start time
    pub started_at: String,
    /// Current shutdown phase
    pub shutdown_phase: String,
    /// Requests currently being served
    pub in_flight_requests: u64,
}

/// Shared state behind the debug endpoints
#[derive(Debug, Clone)]
pub struct DebugState {
    config: Arc<ConfigStore>,
    coordinator: Arc<ShutdownCoordinator>,
    routes: Arc<Vec<RouteInfo>>,
    started: Instant,
    started_at: DateTime<Utc>,
}

impl DebugState {
    /// Create the debug state
    #[must_use]
    pub fn new(
        config: Arc<ConfigStore>,
        coordinator: Arc<ShutdownCoordinator>,
        routes: Vec<RouteInfo>,
    ) -> Self {
        Self {
            config,
            coordinator,
            routes: Arc::new(routes),
            started: Instant::now(),
            started_at: Utc::now(),
        }
    }

    /// Snapshot of process information
    #[must_use]
    pub fn info(&self) -> DebugInfo {
        let config = self.config.current();
        DebugInfo {
            service: config.service.name.clone(),
            version: config.service.version.clone(),
            environment: config.service.environment.to_string(),
            uptime_seconds: self.started.elapsed().as_secs(),
            pid: std::process::id(),
            started_at: self.started_at.to_rfc3339(),
            shutdown_phase: self.coordinator.current_phase().to_string(),
            in_flight_requests: self.coordinator.in_flight_count(),
        }
    }

    /// Effective configuration with secrets redacted
    #[must_use]
    pub fn redacted_config(&self) -> serde_json::Value {
        let mut config = (*self.config.current()).clone();
        if config.observability.tracing.otlp_endpoint.is_some() {
            config.observability.tracing.otlp_endpoint = Some(REDACTED.to_string());
        }
        serde_json::to_value(config).unwrap_or(serde_json::Value::Null)
    }
}

async fn info_handler(State(state): State<DebugState>) -> Json<DebugInfo> {
    Json(state.info())
}

async fn routes_handler(State(state): State<DebugState>) -> Json<Vec<RouteInfo>> {
    Json(state.routes.as_ref().clone())
}

async fn config_handler(State(state): State<DebugState>) -> Json<serde_json::Value> {
    Json(state.redacted_config())
}

/// Router with the debug endpoints under `prefix`
pub fn routes(prefix: &str, state: DebugState) -> Router {
    let prefix = prefix.trim_end_matches('/');
    Router::new()
        .route(&format!("{prefix}/info"), get(info_handler))
        .route(&format!("{prefix}/routes"), get(routes_handler))
        .route(&format!("{prefix}/config"), get(config_handler))
        .with_state(state)
}
