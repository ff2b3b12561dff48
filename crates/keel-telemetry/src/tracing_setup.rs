//! Distributed tracing setup with OpenTelemetry.
//!
//! Provides tracing infrastructure for:
//! - Server spans per request, parented on incoming W3C trace context
//! - Lifecycle hook spans
//! - OTLP export support (behind the `otlp` feature)

use keel_config::ServiceConfig;
use opentelemetry::trace::TracerProvider as _;
use opentelemetry::KeyValue;
use opentelemetry_sdk::{
    propagation::TraceContextPropagator,
    trace::{Config, RandomIdGenerator, Sampler, TracerProvider},
    Resource,
};
use std::collections::HashMap;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::error::{Result, TelemetryError};
use crate::logging::{env_filter, fmt_layer, LoggingConfig};

/// Tracing configuration
#[derive(Debug, Clone)]
pub struct TracingConfig {
    /// Enable OpenTelemetry span export
    pub enabled: bool,
    /// Service name
    pub service_name: String,
    /// Service version
    pub service_version: String,
    /// Environment (development, staging, production)
    pub environment: String,
    /// OTLP endpoint (if using OTLP exporter)
    pub otlp_endpoint: Option<String>,
    /// Sampling rate (0.0 - 1.0)
    pub sampling_rate: f64,
    /// Additional resource attributes
    pub attributes: HashMap<String, String>,
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            service_name: "keel-service".to_string(),
            service_version: env!("CARGO_PKG_VERSION").to_string(),
            environment: "development".to_string(),
            otlp_endpoint: None,
            sampling_rate: 1.0,
            attributes: HashMap::new(),
        }
    }
}

impl TracingConfig {
    /// Create a new tracing configuration
    #[must_use]
    pub fn new(service_name: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            ..Default::default()
        }
    }

    /// Derive tracing settings from a service configuration
    #[must_use]
    pub fn from_service_config(config: &ServiceConfig) -> Self {
        let tracing = &config.observability.tracing;
        Self {
            enabled: tracing.enabled,
            service_name: config.service.name.clone(),
            service_version: config.service.version.clone(),
            environment: config.service.environment.to_string(),
            otlp_endpoint: tracing.otlp_endpoint.clone(),
            sampling_rate: tracing.sampling_rate.clamp(0.0, 1.0),
            attributes: HashMap::new(),
        }
    }

    /// Set the environment
    #[must_use]
    pub fn with_environment(mut self, env: impl Into<String>) -> Self {
        self.environment = env.into();
        self
    }

    /// Set the OTLP endpoint
    #[must_use]
    pub fn with_otlp_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.otlp_endpoint = Some(endpoint.into());
        self
    }

    /// Set the sampling rate
    #[must_use]
    pub fn with_sampling_rate(mut self, rate: f64) -> Self {
        self.sampling_rate = rate.clamp(0.0, 1.0);
        self
    }

    /// Add a resource attribute
    #[must_use]
    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    fn sampler(&self) -> Sampler {
        let root = if self.sampling_rate >= 1.0 {
            Sampler::AlwaysOn
        } else if self.sampling_rate <= 0.0 {
            Sampler::AlwaysOff
        } else {
            Sampler::TraceIdRatioBased(self.sampling_rate)
        };
        Sampler::ParentBased(Box::new(root))
    }

    fn resource(&self) -> Resource {
        let mut attributes = vec![
            KeyValue::new("service.name", self.service_name.clone()),
            KeyValue::new("service.version", self.service_version.clone()),
            KeyValue::new("deployment.environment", self.environment.clone()),
        ];
        attributes.extend(
            self.attributes
                .iter()
                .map(|(k, v)| KeyValue::new(k.clone(), v.clone())),
        );
        Resource::new(attributes)
    }
}

/// Keeps the tracer provider alive; flush it with [`TracingGuard::shutdown`]
#[derive(Default)]
pub struct TracingGuard {
    provider: Option<TracerProvider>,
}

impl std::fmt::Debug for TracingGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TracingGuard")
            .field("active", &self.is_active())
            .finish()
    }
}

impl TracingGuard {
    /// Whether an OpenTelemetry provider is installed
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.provider.is_some()
    }

    /// Flush remaining spans and release the provider
    pub fn shutdown(mut self) {
        shutdown_tracing(self.provider.take());
    }
}

/// Initialize logging plus OpenTelemetry tracing
///
/// # Errors
/// Returns error if tracing cannot be initialized
pub fn init_tracing(config: &TracingConfig, logging: &LoggingConfig) -> Result<TracingGuard> {
    if !config.enabled {
        crate::logging::init_logging(logging)?;
        return Ok(TracingGuard::default());
    }

    let provider = build_provider(config)?;
    let tracer = provider.tracer(config.service_name.clone());

    opentelemetry::global::set_text_map_propagator(TraceContextPropagator::new());

    let otel_layer = tracing_opentelemetry::layer().with_tracer(tracer);

    tracing_subscriber::registry()
        .with(env_filter(logging))
        .with(fmt_layer(logging))
        .with(otel_layer)
        .try_init()
        .map_err(|e| TelemetryError::Init(e.to_string()))?;

    info!(
        service = %config.service_name,
        environment = %config.environment,
        sampling_rate = config.sampling_rate,
        otlp = config.otlp_endpoint.is_some(),
        "Tracing initialized"
    );

    Ok(TracingGuard {
        provider: Some(provider),
    })
}

fn build_provider(config: &TracingConfig) -> Result<TracerProvider> {
    let tracer_config = Config::default()
        .with_sampler(config.sampler())
        .with_id_generator(RandomIdGenerator::default())
        .with_resource(config.resource());

    if let Some(endpoint) = &config.otlp_endpoint {
        return build_otlp_provider(endpoint, tracer_config);
    }

    Ok(TracerProvider::builder().with_config(tracer_config).build())
}

#[cfg(feature = "otlp")]
fn build_otlp_provider(endpoint: &str, tracer_config: Config) -> Result<TracerProvider> {
    use opentelemetry_otlp::WithExportConfig;

    opentelemetry_otlp::new_pipeline()
        .tracing()
        .with_exporter(
            opentelemetry_otlp::new_exporter()
                .tonic()
                .with_endpoint(endpoint),
        )
        .with_trace_config(tracer_config)
        .install_batch(opentelemetry_sdk::runtime::Tokio)
        .map_err(|e| TelemetryError::OtlpConfig(e.to_string()))
}

#[cfg(not(feature = "otlp"))]
fn build_otlp_provider(endpoint: &str, tracer_config: Config) -> Result<TracerProvider> {
    warn!(
        endpoint = endpoint,
        "OTLP endpoint configured but the `otlp` feature is disabled; spans will not be exported"
    );
    Ok(TracerProvider::builder().with_config(tracer_config).build())
}

/// Flush remaining spans and drop the provider
pub fn shutdown_tracing(provider: Option<TracerProvider>) {
    if let Some(provider) = provider {
        for result in provider.force_flush() {
            if let Err(e) = result {
                warn!(error = %e, "Failed to flush spans");
            }
        }
        drop(provider);
        info!("Tracing shutdown complete");
    }
}

/// Create a span for a lifecycle hook invocation
#[macro_export]
macro_rules! hook_span {
    ($phase:expr, $index:expr) => {
        tracing::info_span!(
            "lifecycle.hook",
            phase = %$phase,
            hook = $index,
            otel.kind = "internal"
        )
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_builder() {
        let config = TracingConfig::new("test-service")
            .with_environment("test")
            .with_sampling_rate(0.5)
            .with_attribute("custom", "value");

        assert_eq!(config.service_name, "test-service");
        assert_eq!(config.environment, "test");
        assert!((config.sampling_rate - 0.5).abs() < f64::EPSILON);
        assert_eq!(config.attributes.get("custom"), Some(&"value".to_string()));
    }

    #[test]
    fn test_sampling_rate_clamping() {
        let config = TracingConfig::new("test").with_sampling_rate(1.5);
        assert!((config.sampling_rate - 1.0).abs() < f64::EPSILON);

        let config = TracingConfig::new("test").with_sampling_rate(-0.5);
        assert!(config.sampling_rate.abs() < f64::EPSILON);
    }

    #[test]
    fn test_from_service_config() {
        let service = ServiceConfig::builder("checkout")
            .with_version("3.1.0")
            .with_otlp_endpoint("http://collector:4317")
            .build()
            .unwrap();

        let config = TracingConfig::from_service_config(&service);
        assert!(config.enabled);
        assert_eq!(config.service_name, "checkout");
        assert_eq!(config.service_version, "3.1.0");
        assert_eq!(config.otlp_endpoint.as_deref(), Some("http://collector:4317"));
    }

    #[test]
    fn test_resource_includes_custom_attributes() {
        let config = TracingConfig::new("svc").with_attribute("team", "payments");
        let resource = config.resource();
        assert_eq!(resource.len(), 4);
    }

    #[test]
    fn test_guard_default_is_inactive() {
        let guard = TracingGuard::default();
        assert!(!guard.is_active());
        guard.shutdown();
    }
}
