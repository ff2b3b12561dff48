//! Endpoints the framework mounts next to application routes.

use axum::{
    extract::State,
    http::header,
    response::IntoResponse,
    routing::get,
    Router,
};
use keel_config::ServiceConfig;
use keel_telemetry::Metrics;
use std::sync::Arc;
use tracing::debug;

use crate::debug::{self, DebugState};
use crate::health::{self, HealthChecker};

/// Prometheus text exposition content type
pub const METRICS_CONTENT_TYPE: &str = "text/plain; version=0.0.4";

/// Metrics scrape endpoint
pub async fn metrics_endpoint(State(metrics): State<Metrics>) -> impl IntoResponse {
    ([(header::CONTENT_TYPE, METRICS_CONTENT_TYPE)], metrics.gather())
}

/// Router serving the metrics endpoint at `path`
pub fn metrics_routes(path: &str, metrics: Metrics) -> Router {
    Router::new()
        .route(path, get(metrics_endpoint))
        .with_state(metrics)
}

/// Whether the debug endpoints should be mounted for this configuration
#[must_use]
pub fn debug_enabled(config: &ServiceConfig) -> bool {
    config.debug.enabled
        && (!config.service.environment.is_production() || config.debug.allow_in_production)
}

/// Paths of the framework endpoints [`framework_routes`] mounts
#[must_use]
pub fn reserved_paths(config: &ServiceConfig, metrics_mounted: bool) -> Vec<String> {
    let mut paths = Vec::new();
    if config.health.enabled {
        paths.push(config.health.liveness_path.clone());
        paths.push(config.health.readiness_path.clone());
    }
    if metrics_mounted && config.observability.metrics.enabled {
        paths.push(config.observability.metrics.path.clone());
    }
    if debug_enabled(config) {
        let prefix = config.debug.prefix.trim_end_matches('/');
        for endpoint in ["info", "routes", "config"] {
            paths.push(format!("{prefix}/{endpoint}"));
        }
    }
    paths
}

/// Health, metrics and debug endpoints as configured
pub fn framework_routes(
    config: &ServiceConfig,
    health: Arc<HealthChecker>,
    metrics: Option<Metrics>,
    debug: DebugState,
) -> Router {
    let mut router = Router::new();

    if config.health.enabled {
        router = router.merge(health::routes(health));
    }

    if let Some(metrics) = metrics.filter(|_| config.observability.metrics.enabled) {
        router = router.merge(metrics_routes(&config.observability.metrics.path, metrics));
    }

    if debug_enabled(config) {
        debug!(prefix = %config.debug.prefix, "Mounting debug endpoints");
        router = router.merge(debug::routes(&config.debug.prefix, debug));
    }

    router
}
