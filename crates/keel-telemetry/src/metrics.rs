//! Prometheus metrics for the HTTP surface and the service lifecycle.

use keel_config::{ServiceConfig, DEFAULT_LATENCY_BUCKETS};
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry,
    TextEncoder,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

use crate::error::Result;

/// Response size buckets in bytes
const SIZE_BUCKETS: &[f64] = &[
    128.0, 512.0, 1024.0, 4096.0, 16384.0, 65536.0, 262_144.0, 1_048_576.0, 4_194_304.0,
];

/// Metrics configuration
#[derive(Debug, Clone)]
pub struct MetricsConfig {
    /// Metric name prefix
    pub namespace: Option<String>,
    /// Latency histogram buckets in seconds
    pub latency_buckets: Vec<f64>,
    /// Value of the `version` label on `service_info`
    pub service_version: String,
    /// Value of the `environment` label on `service_info`
    pub environment: String,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            namespace: None,
            latency_buckets: DEFAULT_LATENCY_BUCKETS.to_vec(),
            service_version: env!("CARGO_PKG_VERSION").to_string(),
            environment: "development".to_string(),
        }
    }
}

impl MetricsConfig {
    /// Derive metrics settings from a service configuration
    #[must_use]
    pub fn from_service_config(config: &ServiceConfig) -> Self {
        Self {
            namespace: config.observability.metrics.namespace.clone(),
            latency_buckets: config.observability.metrics.buckets.clone(),
            service_version: config.service.version.clone(),
            environment: config.service.environment.to_string(),
        }
    }
}

/// Prometheus-backed metrics shared by the recorder and the lifecycle
#[derive(Clone)]
pub struct Metrics {
    inner: Arc<MetricsInner>,
}

struct MetricsInner {
    registry: Registry,
    http_requests_total: IntCounterVec,
    http_request_duration_seconds: HistogramVec,
    http_requests_in_flight: IntGauge,
    http_response_size_bytes: HistogramVec,
    lifecycle_hook_failures_total: IntCounterVec,
    reloads_total: IntCounterVec,
}

impl std::fmt::Debug for Metrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Metrics")
            .field("in_flight", &self.in_flight())
            .finish_non_exhaustive()
    }
}

impl Metrics {
    /// Create a registry with the standard collectors registered
    ///
    /// # Errors
    /// Returns error if a collector cannot be registered
    pub fn new(config: &MetricsConfig) -> Result<Self> {
        let registry = Registry::new_custom(config.namespace.clone(), None)?;

        let http_requests_total = IntCounterVec::new(
            Opts::new("http_requests_total", "Total HTTP requests by route and status"),
            &["method", "route", "status"],
        )?;
        let http_request_duration_seconds = HistogramVec::new(
            HistogramOpts::new(
                "http_request_duration_seconds",
                "HTTP request latency in seconds",
            )
            .buckets(config.latency_buckets.clone()),
            &["method", "route", "status"],
        )?;
        let http_requests_in_flight = IntGauge::new(
            "http_requests_in_flight",
            "HTTP requests currently being served",
        )?;
        let http_response_size_bytes = HistogramVec::new(
            HistogramOpts::new("http_response_size_bytes", "HTTP response body size")
                .buckets(SIZE_BUCKETS.to_vec()),
            &["method", "route"],
        )?;
        let service_info = IntGaugeVec::new(
            Opts::new("service_info", "Service build information"),
            &["version", "environment"],
        )?;
        let lifecycle_hook_failures_total = IntCounterVec::new(
            Opts::new(
                "lifecycle_hook_failures_total",
                "Lifecycle hooks that failed or timed out, by phase",
            ),
            &["phase"],
        )?;
        let reloads_total = IntCounterVec::new(
            Opts::new("reloads_total", "Configuration reloads by outcome"),
            &["outcome"],
        )?;

        registry.register(Box::new(http_requests_total.clone()))?;
        registry.register(Box::new(http_request_duration_seconds.clone()))?;
        registry.register(Box::new(http_requests_in_flight.clone()))?;
        registry.register(Box::new(http_response_size_bytes.clone()))?;
        registry.register(Box::new(service_info.clone()))?;
        registry.register(Box::new(lifecycle_hook_failures_total.clone()))?;
        registry.register(Box::new(reloads_total.clone()))?;

        service_info
            .with_label_values(&[config.service_version.as_str(), config.environment.as_str()])
            .set(1);

        Ok(Self {
            inner: Arc::new(MetricsInner {
                registry,
                http_requests_total,
                http_request_duration_seconds,
                http_requests_in_flight,
                http_response_size_bytes,
                lifecycle_hook_failures_total,
                reloads_total,
            }),
        })
    }

    /// Record a completed request
    pub fn record_request(
        &self,
        method: &str,
        route: &str,
        status: u16,
        duration: Duration,
        response_bytes: Option<u64>,
    ) {
        let status = status.to_string();
        let labels = [method, route, status.as_str()];
        self.inner
            .http_requests_total
            .with_label_values(&labels)
            .inc();
        self.inner
            .http_request_duration_seconds
            .with_label_values(&labels)
            .observe(duration.as_secs_f64());
        if let Some(bytes) = response_bytes {
            #[allow(clippy::cast_precision_loss)]
            self.inner
                .http_response_size_bytes
                .with_label_values(&[method, route])
                .observe(bytes as f64);
        }
    }

    /// Increment the in-flight gauge
    pub fn inc_in_flight(&self) {
        self.inner.http_requests_in_flight.inc();
    }

    /// Decrement the in-flight gauge
    pub fn dec_in_flight(&self) {
        self.inner.http_requests_in_flight.dec();
    }

    /// Current in-flight request count
    #[must_use]
    pub fn in_flight(&self) -> i64 {
        self.inner.http_requests_in_flight.get()
    }

    /// Count a failed lifecycle hook
    pub fn inc_hook_failure(&self, phase: &str) {
        self.inner
            .lifecycle_hook_failures_total
            .with_label_values(&[phase])
            .inc();
    }

    /// Count a reload by outcome (`success` / `failure`)
    pub fn inc_reload(&self, outcome: &str) {
        self.inner.reloads_total.with_label_values(&[outcome]).inc();
    }

    /// Total requests recorded for a label set
    #[must_use]
    pub fn request_count(&self, method: &str, route: &str, status: u16) -> u64 {
        let status = status.to_string();
        self.inner
            .http_requests_total
            .with_label_values(&[method, route, status.as_str()])
            .get()
    }

    /// Registry for application-defined collectors
    #[must_use]
    pub fn registry(&self) -> &Registry {
        &self.inner.registry
    }

    /// Render all metrics in the Prometheus text exposition format
    #[must_use]
    pub fn gather(&self) -> String {
        let encoder = TextEncoder::new();
        let families = self.inner.registry.gather();
        let mut buffer = Vec::new();
        if let Err(e) = encoder.encode(&families, &mut buffer) {
            warn!(error = %e, "Failed to encode metrics");
            return String::new();
        }
        String::from_utf8(buffer).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_request_updates_counter_and_histogram() {
        let metrics = Metrics::new(&MetricsConfig::default()).unwrap();
        metrics.record_request("GET", "/users/:id", 200, Duration::from_millis(12), Some(512));
        metrics.record_request("GET", "/users/:id", 200, Duration::from_millis(8), None);

        assert_eq!(metrics.request_count("GET", "/users/:id", 200), 2);
        let text = metrics.gather();
        assert!(text.contains("http_request_duration_seconds_count"));
        assert!(text.contains("route=\"/users/:id\""));
        assert!(text.contains("http_response_size_bytes_count{method=\"GET\",route=\"/users/:id\"} 1"));
    }

    #[test]
    fn test_in_flight_gauge() {
        let metrics = Metrics::new(&MetricsConfig::default()).unwrap();
        metrics.inc_in_flight();
        metrics.inc_in_flight();
        metrics.dec_in_flight();
        assert_eq!(metrics.in_flight(), 1);
    }

    #[test]
    fn test_namespace_prefixes_metric_names() {
        let config = MetricsConfig {
            namespace: Some("orders".to_string()),
            ..Default::default()
        };
        let metrics = Metrics::new(&config).unwrap();
        metrics.inc_reload("success");
        let text = metrics.gather();
        assert!(text.contains("orders_reloads_total{outcome=\"success\"} 1"));
        assert!(text.contains("orders_service_info"));
    }

    #[test]
    fn test_lifecycle_failure_counter() {
        let metrics = Metrics::new(&MetricsConfig::default()).unwrap();
        metrics.inc_hook_failure("shutdown");
        assert!(metrics
            .gather()
            .contains("lifecycle_hook_failures_total{phase=\"shutdown\"} 1"));
    }
}
