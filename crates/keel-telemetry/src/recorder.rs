//! Request observability recorder.
//!
//! The recorder is called twice per request: once when the request enters
//! the middleware stack and once when the response (or failure) comes back.
//! Between the two calls, all request-scoped state lives in a
//! [`RequestRecord`] owned by the in-flight future.
//!
//! For each request that is not excluded it:
//! - opens a server span parented on incoming trace context
//! - tracks the in-flight gauge
//! - records count, latency and response size under the *route template*
//! - emits a single structured access log event
//!
//! Raw paths never become metric labels. Requests that did not match a
//! route are recorded under [`UNMATCHED_ROUTE`].

use axum::extract::{ConnectInfo, MatchedPath};
use http::{Extensions, HeaderMap, Method, Request, StatusCode};
use keel_config::ServiceConfig;
use opentelemetry::propagation::TextMapPropagator as _;
use regex::Regex;
use std::collections::HashSet;
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tracing::{debug, error, field, info, info_span, warn, Span};
use tracing_opentelemetry::OpenTelemetrySpanExt;

use crate::error::{Result, TelemetryError};
use crate::metrics::Metrics;
use crate::propagation::{self, HeaderExtractor};

/// Route label used when no route template matched
pub const UNMATCHED_ROUTE: &str = "<unmatched>";

/// Request id header, set by the request-id middleware
pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Response header carrying the trace id
pub const TRACE_ID_HEADER: &str = "x-trace-id";

/// Decides which paths the recorder ignores
#[derive(Debug, Clone, Default)]
pub struct PathFilter {
    exact: HashSet<String>,
    prefixes: Vec<String>,
    patterns: Vec<Regex>,
}

impl PathFilter {
    /// Create an empty filter (nothing excluded)
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the filter from configured exclusions plus, when enabled, the
    /// framework's own endpoints.
    pub fn from_service_config(config: &ServiceConfig) -> Result<Self> {
        let exclusions = &config.observability.exclusions;
        let mut filter = Self::new();

        if exclusions.framework_endpoints {
            let (exact, prefixes) = config.framework_paths();
            for path in exact {
                filter = filter.exclude_path(path);
            }
            for prefix in prefixes {
                filter = filter.exclude_prefix(prefix);
            }
        }
        for path in &exclusions.paths {
            filter = filter.exclude_path(path.clone());
        }
        for prefix in &exclusions.prefixes {
            filter = filter.exclude_prefix(prefix.clone());
        }
        for pattern in &exclusions.patterns {
            filter = filter.exclude_pattern(pattern)?;
        }
        Ok(filter)
    }

    /// Exclude an exact path
    #[must_use]
    pub fn exclude_path(mut self, path: impl Into<String>) -> Self {
        self.exact.insert(path.into());
        self
    }

    /// Exclude every path starting with `prefix`
    #[must_use]
    pub fn exclude_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefixes.push(prefix.into());
        self
    }

    /// Exclude every path matching `pattern`
    pub fn exclude_pattern(mut self, pattern: &str) -> Result<Self> {
        let regex = Regex::new(pattern).map_err(|source| TelemetryError::Pattern {
            pattern: pattern.to_string(),
            source,
        })?;
        self.patterns.push(regex);
        Ok(self)
    }

    /// Whether the path is excluded
    #[must_use]
    pub fn is_excluded(&self, path: &str) -> bool {
        self.exact.contains(path)
            || self.prefixes.iter().any(|p| path.starts_with(p.as_str()))
            || self.patterns.iter().any(|r| r.is_match(path))
    }
}

/// Recorder behaviour
#[derive(Debug, Clone)]
pub struct RecorderConfig {
    /// Emit access log events
    pub access_log: bool,
    /// Only log 4xx, 5xx and slow requests
    pub errors_only: bool,
    /// Requests slower than this are logged at warn level
    pub slow_threshold: Option<Duration>,
    /// Extract parent trace context and expose trace ids
    pub tracing_enabled: bool,
}

impl Default for RecorderConfig {
    fn default() -> Self {
        Self {
            access_log: true,
            errors_only: false,
            slow_threshold: Some(Duration::from_secs(1)),
            tracing_enabled: false,
        }
    }
}

impl RecorderConfig {
    /// Derive recorder settings from a service configuration
    #[must_use]
    pub fn from_service_config(config: &ServiceConfig) -> Self {
        let access_log = &config.observability.access_log;
        Self {
            access_log: access_log.enabled,
            errors_only: access_log.errors_only,
            slow_threshold: access_log.slow_threshold,
            tracing_enabled: config.observability.tracing.enabled,
        }
    }
}

/// Decrements the in-flight gauge when dropped, including on cancellation
struct InFlight(Metrics);

impl InFlight {
    fn start(metrics: &Metrics) -> Self {
        metrics.inc_in_flight();
        Self(metrics.clone())
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.dec_in_flight();
    }
}

/// Request-scoped state carried from request start to request end
pub struct RequestRecord {
    method: &'static str,
    route: String,
    path: String,
    started: Instant,
    span: Span,
    request_id: Option<String>,
    client_ip: Option<String>,
    user_agent: Option<String>,
    _in_flight: Option<InFlight>,
}

impl std::fmt::Debug for RequestRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestRecord")
            .field("method", &self.method)
            .field("route", &self.route)
            .field("path", &self.path)
            .field("request_id", &self.request_id)
            .finish_non_exhaustive()
    }
}

impl RequestRecord {
    /// Bounded method label
    #[must_use]
    pub fn method(&self) -> &'static str {
        self.method
    }

    /// Route template label
    #[must_use]
    pub fn route(&self) -> &str {
        &self.route
    }

    /// Server span for this request
    #[must_use]
    pub fn span(&self) -> &Span {
        &self.span
    }

    /// Hex trace id, when an OpenTelemetry context is attached
    #[must_use]
    pub fn trace_id(&self) -> Option<String> {
        propagation::trace_id(&self.span)
    }

    /// Time since the request started
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }
}

/// Fan-out recorder for spans, metrics and access logs
#[derive(Debug, Clone)]
pub struct ObservabilityRecorder {
    metrics: Option<Metrics>,
    filter: PathFilter,
    config: RecorderConfig,
}

impl ObservabilityRecorder {
    /// Create a recorder
    #[must_use]
    pub fn new(config: RecorderConfig, filter: PathFilter, metrics: Option<Metrics>) -> Self {
        Self {
            metrics,
            filter,
            config,
        }
    }

    /// Create a recorder from a service configuration
    pub fn from_service_config(config: &ServiceConfig, metrics: Option<Metrics>) -> Result<Self> {
        Ok(Self::new(
            RecorderConfig::from_service_config(config),
            PathFilter::from_service_config(config)?,
            metrics,
        ))
    }

    /// Metrics backing this recorder
    #[must_use]
    pub fn metrics(&self) -> Option<&Metrics> {
        self.metrics.as_ref()
    }

    /// Path filter in use
    #[must_use]
    pub fn filter(&self) -> &PathFilter {
        &self.filter
    }

    /// Begin recording a request. Returns `None` for excluded paths.
    pub fn on_request_start<B>(&self, request: &Request<B>) -> Option<RequestRecord> {
        let path = request.uri().path();
        if self.filter.is_excluded(path) {
            return None;
        }

        let method = method_label(request.method());
        let route = request
            .extensions()
            .get::<MatchedPath>()
            .map_or_else(|| UNMATCHED_ROUTE.to_string(), |m| m.as_str().to_string());
        let headers = request.headers();
        let request_id = header_str(headers, REQUEST_ID_HEADER).map(str::to_string);
        let span_name = format!("{method} {route}");

        let span = info_span!(
            "http.request",
            otel.name = %span_name,
            otel.kind = "server",
            http.request.method = method,
            http.route = %route,
            url.path = %path,
            request_id = field::display(request_id.as_deref().unwrap_or("")),
            http.response.status_code = field::Empty,
            otel.status_code = field::Empty,
        );

        if self.config.tracing_enabled {
            let parent = opentelemetry::global::get_text_map_propagator(|propagator| {
                propagator.extract(&HeaderExtractor(headers))
            });
            span.set_parent(parent);
        }

        Some(RequestRecord {
            method,
            route,
            path: path.to_string(),
            started: Instant::now(),
            span,
            request_id,
            client_ip: client_ip(headers, request.extensions()),
            user_agent: header_str(headers, http::header::USER_AGENT.as_str()).map(str::to_string),
            _in_flight: self.metrics.as_ref().map(InFlight::start),
        })
    }

    /// Finish recording a request with the response status
    pub fn on_request_end(
        &self,
        record: RequestRecord,
        status: StatusCode,
        response_bytes: Option<u64>,
    ) {
        let duration = record.started.elapsed();
        let code = status.as_u16();

        record.span.record("http.response.status_code", code);
        if status.is_server_error() {
            record.span.record("otel.status_code", "ERROR");
        }

        if let Some(metrics) = &self.metrics {
            metrics.record_request(record.method, &record.route, code, duration, response_bytes);
        }

        self.access_log(&record, status, duration, response_bytes);
    }

    /// Finish recording a request whose handler failed without a response
    pub fn on_request_failed(&self, record: RequestRecord, reason: &str) {
        record
            .span
            .in_scope(|| debug!(reason = reason, "Request failed before producing a response"));
        self.on_request_end(record, StatusCode::INTERNAL_SERVER_ERROR, None);
    }

    fn access_log(
        &self,
        record: &RequestRecord,
        status: StatusCode,
        duration: Duration,
        response_bytes: Option<u64>,
    ) {
        if !self.config.access_log {
            return;
        }

        let slow = self
            .config
            .slow_threshold
            .is_some_and(|threshold| duration >= threshold);
        let is_error = status.is_client_error() || status.is_server_error();
        if self.config.errors_only && !is_error && !slow {
            return;
        }

        let duration_ms = duration.as_secs_f64() * 1000.0;
        let client_ip = record.client_ip.as_deref().unwrap_or("-");
        let user_agent = record.user_agent.as_deref().unwrap_or("-");
        let request_id = record.request_id.as_deref().unwrap_or("-");
        let status = status.as_u16();

        record.span.in_scope(|| {
            if status >= 500 {
                error!(
                    target: "keel::access",
                    method = record.method,
                    route = %record.route,
                    path = %record.path,
                    status,
                    duration_ms,
                    response_bytes,
                    client_ip,
                    user_agent,
                    request_id,
                    "request failed"
                );
            } else if status >= 400 || slow {
                warn!(
                    target: "keel::access",
                    method = record.method,
                    route = %record.route,
                    path = %record.path,
                    status,
                    duration_ms,
                    response_bytes,
                    client_ip,
                    user_agent,
                    request_id,
                    slow,
                    "request completed"
                );
            } else {
                info!(
                    target: "keel::access",
                    method = record.method,
                    route = %record.route,
                    path = %record.path,
                    status,
                    duration_ms,
                    response_bytes,
                    client_ip,
                    user_agent,
                    request_id,
                    "request completed"
                );
            }
        });
    }
}

/// Map arbitrary methods onto a bounded label set
#[must_use]
pub fn method_label(method: &Method) -> &'static str {
    match method.as_str() {
        "GET" => "GET",
        "HEAD" => "HEAD",
        "POST" => "POST",
        "PUT" => "PUT",
        "DELETE" => "DELETE",
        "CONNECT" => "CONNECT",
        "OPTIONS" => "OPTIONS",
        "TRACE" => "TRACE",
        "PATCH" => "PATCH",
        _ => "OTHER",
    }
}

/// Best-effort client address: forwarding headers first, then the socket peer
#[must_use]
pub fn client_ip(headers: &HeaderMap, extensions: &Extensions) -> Option<String> {
    header_str(headers, "x-forwarded-for")
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .or_else(|| header_str(headers, "x-real-ip"))
        .map(str::to_string)
        .or_else(|| {
            extensions
                .get::<ConnectInfo<SocketAddr>>()
                .map(|ConnectInfo(addr)| addr.ip().to_string())
        })
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}
