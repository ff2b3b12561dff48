//! Structured logging setup.

use keel_config::{LogFormat, ServiceConfig};
use tracing::Subscriber;
use tracing_subscriber::{
    fmt, layer::SubscriberExt, registry::LookupSpan, util::SubscriberInitExt, EnvFilter, Layer,
};

use crate::error::{Result, TelemetryError};

/// Logging configuration
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    /// Filter directive used when `RUST_LOG` is unset
    pub level: String,
    /// Output format
    pub format: LogFormat,
    /// Include the event target
    pub with_target: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
            with_target: true,
        }
    }
}

impl LoggingConfig {
    /// Create a new logging configuration
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Derive logging settings from a service configuration
    #[must_use]
    pub fn from_service_config(config: &ServiceConfig) -> Self {
        Self {
            level: config.observability.logging.level.clone(),
            format: config.log_format(),
            with_target: true,
        }
    }

    /// Set the level directive
    #[must_use]
    pub fn with_level(mut self, level: impl Into<String>) -> Self {
        self.level = level.into();
        self
    }

    /// Set the output format
    #[must_use]
    pub fn with_format(mut self, format: LogFormat) -> Self {
        self.format = format;
        self
    }
}

/// Build the env filter, preferring `RUST_LOG` over the configured level
#[must_use]
pub fn env_filter(config: &LoggingConfig) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level))
}

/// Build the formatting layer for the configured output format
#[must_use]
pub fn fmt_layer<S>(config: &LoggingConfig) -> Box<dyn Layer<S> + Send + Sync + 'static>
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    match config.format {
        LogFormat::Json => fmt::layer()
            .json()
            .with_current_span(true)
            .with_span_list(false)
            .with_target(config.with_target)
            .boxed(),
        LogFormat::Pretty => fmt::layer()
            .pretty()
            .with_target(config.with_target)
            .boxed(),
        LogFormat::Compact => fmt::layer()
            .compact()
            .with_target(config.with_target)
            .boxed(),
    }
}

/// Install a logging-only global subscriber
///
/// # Errors
/// Returns error if a global subscriber is already installed
pub fn init_logging(config: &LoggingConfig) -> Result<()> {
    tracing_subscriber::registry()
        .with(env_filter(config))
        .with(fmt_layer(config))
        .try_init()
        .map_err(|e| TelemetryError::Init(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_config::Environment;

    #[test]
    fn test_from_service_config_uses_environment_default() {
        let mut config = ServiceConfig::default();
        config.service.environment = Environment::Production;
        config.observability.logging.level = "warn,keel=debug".to_string();

        let logging = LoggingConfig::from_service_config(&config);
        assert_eq!(logging.format, LogFormat::Json);
        assert_eq!(logging.level, "warn,keel=debug");
    }

    #[test]
    fn test_builder() {
        let logging = LoggingConfig::new()
            .with_level("debug")
            .with_format(LogFormat::Compact);
        assert_eq!(logging.level, "debug");
        assert_eq!(logging.format, LogFormat::Compact);
    }
}
