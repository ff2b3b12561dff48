//! # Keel Telemetry
//!
//! Observability for Keel services.
//!
//! This crate provides:
//! - Structured logging (JSON, pretty or compact)
//! - Distributed tracing with OpenTelemetry and W3C trace context
//! - Prometheus metrics for the HTTP surface and the lifecycle
//! - The request observability recorder and its tower layer

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod error;
pub mod layer;
pub mod logging;
pub mod metrics;
pub mod propagation;
pub mod recorder;
pub mod tracing_setup;

pub use error::{Result, TelemetryError};
pub use layer::{ObservabilityLayer, ObservabilityService};
pub use logging::{init_logging, LoggingConfig};
pub use metrics::{Metrics, MetricsConfig};
pub use propagation::{current_trace_id, trace_id, HeaderExtractor};
pub use recorder::{
    client_ip, method_label, ObservabilityRecorder, PathFilter, RecorderConfig, RequestRecord,
    REQUEST_ID_HEADER, TRACE_ID_HEADER, UNMATCHED_ROUTE,
};
pub use tracing_setup::{init_tracing, shutdown_tracing, TracingConfig, TracingGuard};

use keel_config::ServiceConfig;

/// Handle to process-wide telemetry; flush it before exiting
#[derive(Debug, Default)]
pub struct TelemetryGuard {
    tracing: TracingGuard,
}

impl TelemetryGuard {
    /// Whether spans are exported through OpenTelemetry
    #[must_use]
    pub fn tracing_active(&self) -> bool {
        self.tracing.is_active()
    }

    /// Flush buffered telemetry
    pub fn shutdown(self) {
        self.tracing.shutdown();
    }
}

/// Install the global subscriber (logging plus optional tracing) for a service
///
/// # Errors
/// Returns error if a subscriber is already installed or the exporter cannot
/// be built
pub fn init_telemetry(config: &ServiceConfig) -> Result<TelemetryGuard> {
    let logging = LoggingConfig::from_service_config(config);
    let tracing = TracingConfig::from_service_config(config);
    Ok(TelemetryGuard {
        tracing: init_tracing(&tracing, &logging)?,
    })
}
