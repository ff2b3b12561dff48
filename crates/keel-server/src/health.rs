//! Liveness and readiness checks.
//!
//! Applications register [`HealthCheck`]s into a liveness set and a
//! readiness set. Every check in a set runs concurrently and each one is
//! bounded by the configured check timeout, so one hung dependency cannot
//! stall the probe. Readiness also fails once shutdown has begun.

use async_trait::async_trait;
use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use futures::future::join_all;
use keel_config::HealthConfig;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Health status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// Fully healthy
    Healthy,
    /// Degraded but operational
    Degraded,
    /// Unhealthy
    Unhealthy,
    /// Unknown status
    Unknown,
}

impl HealthStatus {
    /// Check if status represents a serving state
    #[must_use]
    pub fn is_healthy(&self) -> bool {
        matches!(self, Self::Healthy | Self::Degraded)
    }

    /// HTTP status code for this health status
    #[must_use]
    pub fn http_status(&self) -> StatusCode {
        if self.is_healthy() {
            StatusCode::OK
        } else {
            StatusCode::SERVICE_UNAVAILABLE
        }
    }
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Healthy => write!(f, "healthy"),
            Self::Degraded => write!(f, "degraded"),
            Self::Unhealthy => write!(f, "unhealthy"),
            Self::Unknown => write!(f, "unknown"),
        }
    }
}

/// Result of one check
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentHealth {
    /// Check name
    pub name: String,
    /// Check status
    pub status: HealthStatus,
    /// Time taken for the check
    pub check_duration_ms: u64,
    /// Error message if unhealthy
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ComponentHealth {
    /// Create a healthy component
    #[must_use]
    pub fn healthy(name: impl Into<String>, duration: Duration) -> Self {
        Self {
            name: name.into(),
            status: HealthStatus::Healthy,
            check_duration_ms: duration_ms(duration),
            error: None,
        }
    }

    /// Create an unhealthy component
    #[must_use]
    pub fn unhealthy(name: impl Into<String>, error: impl Into<String>, duration: Duration) -> Self {
        Self {
            name: name.into(),
            status: HealthStatus::Unhealthy,
            check_duration_ms: duration_ms(duration),
            error: Some(error.into()),
        }
    }
}

/// Aggregated health response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    /// Overall status
    pub status: HealthStatus,
    /// Service version
    pub version: String,
    /// Process uptime in seconds
    pub uptime_seconds: u64,
    /// Per-check results
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub components: Vec<ComponentHealth>,
    /// Percentage of passing checks (0-100)
    pub health_score: u8,
    /// RFC 3339 timestamp
    pub timestamp: String,
}

impl HealthResponse {
    /// Build a response from check results. An empty set is healthy.
    #[must_use]
    pub fn from_components(
        version: impl Into<String>,
        uptime: Duration,
        components: Vec<ComponentHealth>,
    ) -> Self {
        let healthy = components.iter().filter(|c| c.status.is_healthy()).count();
        let status = if healthy == components.len() {
            HealthStatus::Healthy
        } else {
            HealthStatus::Unhealthy
        };
        #[allow(clippy::cast_possible_truncation)]
        let health_score = if components.is_empty() {
            100
        } else {
            ((healthy * 100) / components.len()) as u8
        };

        Self {
            status,
            version: version.into(),
            uptime_seconds: uptime.as_secs(),
            components,
            health_score,
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }

    /// Build an unhealthy response with a single reason
    #[must_use]
    pub fn unavailable(version: impl Into<String>, uptime: Duration, reason: &str) -> Self {
        let mut response = Self::from_components(
            version,
            uptime,
            vec![ComponentHealth::unhealthy("server", reason, Duration::ZERO)],
        );
        response.health_score = 0;
        response
    }
}

impl IntoResponse for HealthResponse {
    fn into_response(self) -> Response {
        (self.status.http_status(), Json(self)).into_response()
    }
}

/// A named dependency check
#[async_trait]
pub trait HealthCheck: Send + Sync {
    /// Name reported in the health response
    fn name(&self) -> &str;

    /// Run the check
    async fn check(&self) -> Result<(), String>;
}

/// [`HealthCheck`] backed by an async closure
pub struct FnCheck<F> {
    name: String,
    check: F,
}

impl<F> std::fmt::Debug for FnCheck<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FnCheck").field("name", &self.name).finish()
    }
}

#[async_trait]
impl<F, Fut> HealthCheck for FnCheck<F>
where
    F: Fn() -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), String>> + Send + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn check(&self) -> Result<(), String> {
        (self.check)().await
    }
}

/// Wrap an async closure as a [`HealthCheck`]
pub fn check_fn<F, Fut>(name: impl Into<String>, check: F) -> FnCheck<F>
where
    F: Fn() -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), String>> + Send + 'static,
{
    FnCheck {
        name: name.into(),
        check,
    }
}

/// Runs the registered liveness and readiness checks
pub struct HealthChecker {
    config: HealthConfig,
    version: String,
    liveness: Vec<Arc<dyn HealthCheck>>,
    readiness: Vec<Arc<dyn HealthCheck>>,
    started_at: Instant,
    shutting_down: AtomicBool,
}

impl std::fmt::Debug for HealthChecker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HealthChecker")
            .field("liveness", &self.liveness.len())
            .field("readiness", &self.readiness.len())
            .field("shutting_down", &self.is_shutting_down())
            .finish_non_exhaustive()
    }
}

impl HealthChecker {
    /// Create a health checker with no checks
    #[must_use]
    pub fn new(config: HealthConfig, version: impl Into<String>) -> Self {
        Self {
            config,
            version: version.into(),
            liveness: Vec::new(),
            readiness: Vec::new(),
            started_at: Instant::now(),
            shutting_down: AtomicBool::new(false),
        }
    }

    /// Add a liveness check
    pub fn add_liveness(&mut self, check: impl HealthCheck + 'static) {
        self.liveness.push(Arc::new(check));
    }

    /// Add a readiness check
    pub fn add_readiness(&mut self, check: impl HealthCheck + 'static) {
        self.readiness.push(Arc::new(check));
    }

    /// Get uptime
    #[must_use]
    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// Mark shutdown as in progress; readiness fails from now on
    pub fn mark_shutting_down(&self) {
        if !self.shutting_down.swap(true, Ordering::SeqCst) {
            info!("Health checker marked as shutting down");
        }
    }

    /// Check if shutting down
    #[must_use]
    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    /// Run all liveness checks
    pub async fn check_liveness(&self) -> HealthResponse {
        let components = self.run_checks(&self.liveness).await;
        HealthResponse::from_components(&self.version, self.uptime(), components)
    }

    /// Run all readiness checks
    pub async fn check_readiness(&self) -> HealthResponse {
        if self.is_shutting_down() {
            return HealthResponse::unavailable(&self.version, self.uptime(), "shutting down");
        }
        let components = self.run_checks(&self.readiness).await;
        HealthResponse::from_components(&self.version, self.uptime(), components)
    }

    async fn run_checks(&self, checks: &[Arc<dyn HealthCheck>]) -> Vec<ComponentHealth> {
        let limit = self.config.check_timeout;
        join_all(checks.iter().map(|check| async move {
            let started = Instant::now();
            match tokio::time::timeout(limit, check.check()).await {
                Ok(Ok(())) => ComponentHealth::healthy(check.name(), started.elapsed()),
                Ok(Err(e)) => {
                    warn!(check = check.name(), error = %e, "Health check failed");
                    ComponentHealth::unhealthy(check.name(), e, started.elapsed())
                }
                Err(_) => {
                    let message = format!("timed out after {}ms", limit.as_millis());
                    warn!(check = check.name(), "Health check timed out");
                    ComponentHealth::unhealthy(check.name(), message, started.elapsed())
                }
            }
        }))
        .await
    }
}

/// Liveness endpoint handler
pub async fn liveness_handler(State(checker): State<Arc<HealthChecker>>) -> HealthResponse {
    let response = checker.check_liveness().await;
    debug!(status = %response.status, "Liveness probe");
    response
}

/// Readiness endpoint handler
pub async fn readiness_handler(State(checker): State<Arc<HealthChecker>>) -> HealthResponse {
    let response = checker.check_readiness().await;
    debug!(status = %response.status, "Readiness probe");
    response
}

/// Router with the liveness and readiness endpoints on their configured paths
pub fn routes(checker: Arc<HealthChecker>) -> Router {
    let liveness_path = checker.config.liveness_path.clone();
    let readiness_path = checker.config.readiness_path.clone();
    Router::new()
        .route(&liveness_path, get(liveness_handler))
        .route(&readiness_path, get(readiness_handler))
        .with_state(checker)
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
