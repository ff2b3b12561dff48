//! Telemetry error types.

/// Result type for telemetry operations.
pub type Result<T> = std::result::Result<T, TelemetryError>;

/// Telemetry initialization error
#[derive(Debug, thiserror::Error)]
pub enum TelemetryError {
    /// A global subscriber could not be installed
    #[error("Failed to initialize tracing subscriber: {0}")]
    Init(String),

    /// OTLP exporter configuration error
    #[error("OTLP configuration error: {0}")]
    OtlpConfig(String),

    /// Prometheus collector registration failed
    #[error("Metrics registration failed: {0}")]
    Metrics(#[from] prometheus::Error),

    /// An exclusion pattern is not a valid regular expression
    #[error("Invalid exclusion pattern '{pattern}': {source}")]
    Pattern {
        /// The offending pattern
        pattern: String,
        /// Regex compiler error
        #[source]
        source: regex::Error,
    },
}
