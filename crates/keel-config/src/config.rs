//! The assembled service configuration and its validation rules.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::net::{SocketAddr, ToSocketAddrs};
use validator::{Validate, ValidationErrors, ValidationErrorsKind};

use crate::endpoints::{DebugConfig, HealthConfig};
use crate::error::{ConfigError, Result};
use crate::observability::{LogFormat, ObservabilityConfig};
use crate::server::ServerConfig;
use crate::service::ServiceInfo;

/// Complete configuration for a Keel service
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize, Validate)]
#[serde(default, deny_unknown_fields)]
pub struct ServiceConfig {
    /// Service identity
    #[validate(nested)]
    pub service: ServiceInfo,
    /// HTTP listener
    #[validate(nested)]
    pub server: ServerConfig,
    /// Logging, tracing, metrics
    #[validate(nested)]
    pub observability: ObservabilityConfig,
    /// Health endpoints
    pub health: HealthConfig,
    /// Debug endpoints
    pub debug: DebugConfig,
}

impl ServiceConfig {
    /// Validate the configuration, reporting every problem found.
    pub fn validate(&self) -> Result<()> {
        let mut problems = Vec::new();

        if let Err(errors) = Validate::validate(self) {
            flatten_errors(&errors, "", &mut problems);
        }

        // Range checks pass NaN through.
        if !self.observability.tracing.sampling_rate.is_finite() {
            problems.push("observability.tracing.sampling_rate must be a finite number".to_string());
        }

        if self.server.shutdown_timeout.is_zero() {
            problems.push("server.shutdown_timeout must be non-zero".to_string());
        }
        if self.server.request_timeout.is_zero() {
            problems.push("server.request_timeout must be non-zero".to_string());
        }

        let metrics = &self.observability.metrics;
        if metrics.enabled {
            check_path("observability.metrics.path", &metrics.path, &mut problems);
        }
        if metrics.buckets.is_empty() {
            problems.push("observability.metrics.buckets must not be empty".to_string());
        } else if !metrics.buckets.windows(2).all(|w| w[0] < w[1]) {
            problems.push("observability.metrics.buckets must be strictly ascending".to_string());
        }
        if let Some(ns) = &metrics.namespace {
            if ns.is_empty() || !ns.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
                problems.push(format!(
                    "observability.metrics.namespace '{ns}' must be non-empty [a-zA-Z0-9_]"
                ));
            }
        }

        for pattern in &self.observability.exclusions.patterns {
            if let Err(e) = Regex::new(pattern) {
                problems.push(format!(
                    "observability.exclusions.patterns: invalid regex '{pattern}': {e}"
                ));
            }
        }

        if self.health.enabled {
            check_path("health.liveness_path", &self.health.liveness_path, &mut problems);
            check_path("health.readiness_path", &self.health.readiness_path, &mut problems);
            if self.health.liveness_path == self.health.readiness_path {
                problems.push(
                    "health.liveness_path and health.readiness_path must differ".to_string(),
                );
            }
            if self.health.check_timeout.is_zero() {
                problems.push("health.check_timeout must be non-zero".to_string());
            }
        }

        if self.debug.enabled {
            check_path("debug.prefix", &self.debug.prefix, &mut problems);
            if self.debug.prefix == "/" {
                problems.push("debug.prefix must not be the root path".to_string());
            }
            if self.service.environment.is_production() && !self.debug.allow_in_production {
                problems.push(
                    "debug endpoints are enabled in production; set debug.allow_in_production to confirm"
                        .to_string(),
                );
            }
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Validation(problems))
        }
    }

    /// Resolve the listener address.
    pub fn socket_addr(&self) -> Result<SocketAddr> {
        let address = self.server.bind_address();
        address
            .to_socket_addrs()
            .map_err(|e| ConfigError::Validation(vec![format!("cannot resolve {address}: {e}")]))?
            .next()
            .ok_or_else(|| ConfigError::Validation(vec![format!("{address} resolved to nothing")]))
    }

    /// Effective log format, falling back on the environment default
    #[must_use]
    pub fn log_format(&self) -> LogFormat {
        self.observability.logging.format.unwrap_or(
            if self.service.environment.is_production() {
                LogFormat::Json
            } else {
                LogFormat::Pretty
            },
        )
    }

    /// Paths owned by the framework itself (metrics, health, debug prefix)
    #[must_use]
    pub fn framework_paths(&self) -> (Vec<String>, Vec<String>) {
        let mut exact = Vec::new();
        let mut prefixes = Vec::new();
        if self.observability.metrics.enabled {
            exact.push(self.observability.metrics.path.clone());
        }
        if self.health.enabled {
            exact.push(self.health.liveness_path.clone());
            exact.push(self.health.readiness_path.clone());
        }
        if self.debug.enabled {
            prefixes.push(format!("{}/", self.debug.prefix.trim_end_matches('/')));
        }
        (exact, prefixes)
    }
}

fn check_path(field: &str, path: &str, problems: &mut Vec<String>) {
    if !path.starts_with('/') {
        problems.push(format!("{field} '{path}' must start with '/'"));
    }
}

fn flatten_errors(errors: &ValidationErrors, prefix: &str, out: &mut Vec<String>) {
    for (field, kind) in errors.errors() {
        let path = if prefix.is_empty() {
            field.to_string()
        } else {
            format!("{prefix}.{field}")
        };
        match kind {
            ValidationErrorsKind::Field(field_errors) => {
                for error in field_errors {
                    let message = error
                        .message
                        .clone()
                        .unwrap_or_else(|| Cow::Owned(format!("failed '{}' check", error.code)));
                    out.push(format!("{path}: {message}"));
                }
            }
            ValidationErrorsKind::Struct(nested) => flatten_errors(nested, &path, out),
            ValidationErrorsKind::List(items) => {
                for (index, nested) in items {
                    flatten_errors(nested, &format!("{path}[{index}]"), out);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::Environment;
    use std::time::Duration;

    #[test]
    fn test_default_config_is_valid() {
        ServiceConfig::default().validate().unwrap();
    }

    #[test]
    fn test_validation_collects_every_problem() {
        let mut config = ServiceConfig::default();
        config.service.name = String::new();
        config.server.port = 0;
        config.observability.tracing.sampling_rate = 1.5;
        config.observability.exclusions.patterns = vec!["([".to_string()];
        config.health.readiness_path = config.health.liveness_path.clone();

        let err = config.validate().unwrap_err();
        let problems = err.problems();
        assert!(problems.iter().any(|p| p.starts_with("service.name")));
        assert!(problems.iter().any(|p| p.starts_with("server.port")));
        assert!(problems.iter().any(|p| p.contains("sampling_rate")));
        assert!(problems.iter().any(|p| p.contains("invalid regex")));
        assert!(problems.iter().any(|p| p.contains("must differ")));
        assert!(problems.len() >= 5);
    }

    #[test]
    fn test_non_finite_sampling_rate_rejected() {
        let mut config = ServiceConfig::default();
        config
            .apply_overrides_from([("KEEL_SAMPLING_RATE", "NaN")])
            .unwrap();
        assert!(config.observability.tracing.sampling_rate.is_nan());

        let err = config.validate().unwrap_err();
        assert!(err
            .problems()
            .iter()
            .any(|p| p.contains("sampling_rate must be a finite number")));

        config.observability.tracing.sampling_rate = f64::INFINITY;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_debug_in_production_requires_opt_in() {
        let mut config = ServiceConfig::default();
        config.service.environment = Environment::Production;
        config.debug.enabled = true;
        assert!(config.validate().is_err());

        config.debug.allow_in_production = true;
        config.validate().unwrap();
    }

    #[test]
    fn test_unsorted_buckets_rejected() {
        let mut config = ServiceConfig::default();
        config.observability.metrics.buckets = vec![0.5, 0.1];
        let err = config.validate().unwrap_err();
        assert!(err.problems()[0].contains("ascending"));
    }

    #[test]
    fn test_zero_shutdown_timeout_rejected() {
        let mut config = ServiceConfig::default();
        config.server.shutdown_timeout = Duration::ZERO;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_log_format_follows_environment() {
        let mut config = ServiceConfig::default();
        assert_eq!(config.log_format(), LogFormat::Pretty);
        config.service.environment = Environment::Production;
        assert_eq!(config.log_format(), LogFormat::Json);
        config.observability.logging.format = Some(LogFormat::Compact);
        assert_eq!(config.log_format(), LogFormat::Compact);
    }

    #[test]
    fn test_framework_paths() {
        let mut config = ServiceConfig::default();
        config.debug.enabled = true;
        let (exact, prefixes) = config.framework_paths();
        assert_eq!(exact, vec!["/metrics", "/healthz", "/readyz"]);
        assert_eq!(prefixes, vec!["/debug/"]);
    }

    #[test]
    fn test_socket_addr() {
        let mut config = ServiceConfig::default();
        config.server.host = "127.0.0.1".to_string();
        config.server.port = 9000;
        assert_eq!(config.socket_addr().unwrap().port(), 9000);
    }
}
