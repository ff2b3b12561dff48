//! Logging, tracing, metrics and access-log settings.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use validator::Validate;

/// Default histogram buckets for request latency, in seconds
pub const DEFAULT_LATENCY_BUCKETS: &[f64] = &[
    0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
];

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// One JSON object per line
    Json,
    /// Multi-line human readable output
    Pretty,
    /// Single-line human readable output
    Compact,
}

impl fmt::Display for LogFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Json => write!(f, "json"),
            Self::Pretty => write!(f, "pretty"),
            Self::Compact => write!(f, "compact"),
        }
    }
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "json" => Ok(Self::Json),
            "pretty" => Ok(Self::Pretty),
            "compact" | "text" => Ok(Self::Compact),
            other => Err(format!("unknown log format '{other}'")),
        }
    }
}

/// Logging settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate)]
#[serde(default, deny_unknown_fields)]
pub struct LoggingSettings {
    /// Filter directive used when `RUST_LOG` is unset
    #[validate(length(min = 1, message = "log level must not be empty"))]
    pub level: String,
    /// Output format. `None` picks json in production and pretty elsewhere.
    pub format: Option<LogFormat>,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: None,
        }
    }
}

/// Distributed tracing settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(default, deny_unknown_fields)]
pub struct TracingSettings {
    /// Export spans through OpenTelemetry
    pub enabled: bool,
    /// Head sampling ratio
    #[validate(range(min = 0.0, max = 1.0, message = "sampling_rate must be within [0, 1]"))]
    pub sampling_rate: f64,
    /// OTLP collector endpoint
    pub otlp_endpoint: Option<String>,
}

impl Default for TracingSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            sampling_rate: 1.0,
            otlp_endpoint: None,
        }
    }
}

/// Prometheus metrics settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MetricsSettings {
    /// Record and expose metrics
    pub enabled: bool,
    /// Exposition endpoint
    pub path: String,
    /// Optional metric name prefix
    pub namespace: Option<String>,
    /// Latency histogram buckets (seconds, ascending)
    pub buckets: Vec<f64>,
}

impl Default for MetricsSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            path: "/metrics".to_string(),
            namespace: None,
            buckets: DEFAULT_LATENCY_BUCKETS.to_vec(),
        }
    }
}

/// Paths the observability recorder ignores
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ExclusionSettings {
    /// Exclude the metrics, health and debug endpoints
    pub framework_endpoints: bool,
    /// Exact paths
    pub paths: Vec<String>,
    /// Path prefixes
    pub prefixes: Vec<String>,
    /// Regular expressions matched against the request path
    pub patterns: Vec<String>,
}

impl Default for ExclusionSettings {
    fn default() -> Self {
        Self {
            framework_endpoints: true,
            paths: Vec::new(),
            prefixes: Vec::new(),
            patterns: Vec::new(),
        }
    }
}

/// Structured access log settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AccessLogSettings {
    /// Emit one event per request
    pub enabled: bool,
    /// Only log client errors, server errors and slow requests
    pub errors_only: bool,
    /// Requests slower than this are logged at warn level
    #[serde(with = "humantime_serde")]
    pub slow_threshold: Option<Duration>,
}

impl Default for AccessLogSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            errors_only: false,
            slow_threshold: Some(Duration::from_secs(1)),
        }
    }
}

/// Observability settings
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize, Validate)]
#[serde(default, deny_unknown_fields)]
pub struct ObservabilityConfig {
    /// Logging
    #[validate(nested)]
    pub logging: LoggingSettings,
    /// Tracing
    #[validate(nested)]
    pub tracing: TracingSettings,
    /// Metrics
    pub metrics: MetricsSettings,
    /// Recorder exclusions
    pub exclusions: ExclusionSettings,
    /// Access log
    pub access_log: AccessLogSettings,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_format_parse() {
        assert_eq!("JSON".parse::<LogFormat>(), Ok(LogFormat::Json));
        assert_eq!("text".parse::<LogFormat>(), Ok(LogFormat::Compact));
        assert!("xml".parse::<LogFormat>().is_err());
    }

    #[test]
    fn test_default_buckets_ascending() {
        let settings = MetricsSettings::default();
        assert!(settings.buckets.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn test_access_log_threshold_parses_humantime() {
        let settings: AccessLogSettings =
            serde_yaml::from_str("slow_threshold: 250ms\nerrors_only: true").unwrap();
        assert_eq!(settings.slow_threshold, Some(Duration::from_millis(250)));
        assert!(settings.errors_only);
        assert!(settings.enabled);
    }
}
