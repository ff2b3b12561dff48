//! Chained-option construction of a [`ServiceConfig`].
//!
//! ```
//! use keel_config::{Environment, ServiceConfig};
//! use std::time::Duration;
//!
//! let config = ServiceConfig::builder("orders")
//!     .with_version("1.4.2")
//!     .with_environment(Environment::Staging)
//!     .with_port(9000)
//!     .with_shutdown_timeout(Duration::from_secs(10))
//!     .with_excluded_prefix("/internal/")
//!     .build()
//!     .unwrap();
//!
//! assert_eq!(config.server.port, 9000);
//! ```

use std::time::Duration;

use crate::config::ServiceConfig;
use crate::endpoints::{DebugConfig, HealthConfig};
use crate::error::Result;
use crate::observability::{AccessLogSettings, LogFormat, MetricsSettings, TracingSettings};
use crate::service::Environment;

impl ServiceConfig {
    /// Start building a configuration for the named service
    #[must_use]
    pub fn builder(name: impl Into<String>) -> ConfigBuilder {
        ConfigBuilder::new(name)
    }
}

/// Builder applying options on top of the defaults
#[derive(Debug, Clone)]
pub struct ConfigBuilder {
    config: ServiceConfig,
}

impl ConfigBuilder {
    /// Create a builder for the named service
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        let mut config = ServiceConfig::default();
        config.service.name = name.into();
        Self { config }
    }

    /// Start from an existing configuration
    #[must_use]
    pub fn from_config(config: ServiceConfig) -> Self {
        Self { config }
    }

    /// Set the service version
    #[must_use]
    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.config.service.version = version.into();
        self
    }

    /// Set the deployment environment
    #[must_use]
    pub fn with_environment(mut self, environment: Environment) -> Self {
        self.config.service.environment = environment;
        self
    }

    /// Set the bind host
    #[must_use]
    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.config.server.host = host.into();
        self
    }

    /// Set the bind port
    #[must_use]
    pub fn with_port(mut self, port: u16) -> Self {
        self.config.server.port = port;
        self
    }

    /// Set the per-request timeout
    #[must_use]
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.config.server.request_timeout = timeout;
        self
    }

    /// Set the shutdown budget
    #[must_use]
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.config.server.shutdown_timeout = timeout;
        self
    }

    /// Set the maximum request body size
    #[must_use]
    pub fn with_max_body_bytes(mut self, bytes: usize) -> Self {
        self.config.server.max_body_bytes = bytes;
        self
    }

    /// Set the log filter directive
    #[must_use]
    pub fn with_log_level(mut self, level: impl Into<String>) -> Self {
        self.config.observability.logging.level = level.into();
        self
    }

    /// Force a log format
    #[must_use]
    pub fn with_log_format(mut self, format: LogFormat) -> Self {
        self.config.observability.logging.format = Some(format);
        self
    }

    /// Replace the tracing settings
    #[must_use]
    pub fn with_tracing(mut self, tracing: TracingSettings) -> Self {
        self.config.observability.tracing = tracing;
        self
    }

    /// Enable tracing with the given sampling ratio
    #[must_use]
    pub fn with_sampling_rate(mut self, rate: f64) -> Self {
        self.config.observability.tracing.enabled = true;
        self.config.observability.tracing.sampling_rate = rate;
        self
    }

    /// Export spans to an OTLP collector
    #[must_use]
    pub fn with_otlp_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.config.observability.tracing.enabled = true;
        self.config.observability.tracing.otlp_endpoint = Some(endpoint.into());
        self
    }

    /// Replace the metrics settings
    #[must_use]
    pub fn with_metrics(mut self, metrics: MetricsSettings) -> Self {
        self.config.observability.metrics = metrics;
        self
    }

    /// Disable metrics recording and the exposition endpoint
    #[must_use]
    pub fn without_metrics(mut self) -> Self {
        self.config.observability.metrics.enabled = false;
        self
    }

    /// Replace the access log settings
    #[must_use]
    pub fn with_access_log(mut self, access_log: AccessLogSettings) -> Self {
        self.config.observability.access_log = access_log;
        self
    }

    /// Exclude an exact path from observability
    #[must_use]
    pub fn with_excluded_path(mut self, path: impl Into<String>) -> Self {
        self.config.observability.exclusions.paths.push(path.into());
        self
    }

    /// Exclude every path starting with the prefix
    #[must_use]
    pub fn with_excluded_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.config
            .observability
            .exclusions
            .prefixes
            .push(prefix.into());
        self
    }

    /// Exclude every path matching the regular expression
    #[must_use]
    pub fn with_excluded_pattern(mut self, pattern: impl Into<String>) -> Self {
        self.config
            .observability
            .exclusions
            .patterns
            .push(pattern.into());
        self
    }

    /// Replace the health endpoint settings
    #[must_use]
    pub fn with_health(mut self, health: HealthConfig) -> Self {
        self.config.health = health;
        self
    }

    /// Set the per-check health timeout
    #[must_use]
    pub fn with_health_timeout(mut self, timeout: Duration) -> Self {
        self.config.health.check_timeout = timeout;
        self
    }

    /// Replace the debug endpoint settings
    #[must_use]
    pub fn with_debug(mut self, debug: DebugConfig) -> Self {
        self.config.debug = debug;
        self
    }

    /// Enable the debug endpoints
    #[must_use]
    pub fn with_debug_endpoints(mut self) -> Self {
        self.config.debug.enabled = true;
        self
    }

    /// Validate and return the configuration
    pub fn build(self) -> Result<ServiceConfig> {
        self.config.validate()?;
        Ok(self.config)
    }

    /// Return the configuration without validating it
    #[must_use]
    pub fn build_unchecked(self) -> ServiceConfig {
        self.config
    }
}
