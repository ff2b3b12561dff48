//! Loading configuration from files and the environment.

use std::path::Path;
use tracing::{debug, info};

use crate::config::ServiceConfig;
use crate::error::{ConfigError, Result};
use crate::observability::LogFormat;
use crate::service::Environment;

/// Prefix shared by every environment override
pub const ENV_PREFIX: &str = "KEEL_";

impl ServiceConfig {
    /// Parse a configuration file. The format is chosen by extension.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;

        let extension = path
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_ascii_lowercase);

        let config = match extension.as_deref() {
            Some("yaml" | "yml") => {
                serde_yaml::from_str(&contents).map_err(|source| ConfigError::Yaml {
                    path: path.to_path_buf(),
                    source,
                })?
            }
            Some("toml") => toml::from_str(&contents).map_err(|source| ConfigError::Toml {
                path: path.to_path_buf(),
                source,
            })?,
            _ => return Err(ConfigError::UnsupportedFormat(path.to_path_buf())),
        };

        debug!(path = %path.display(), "Parsed configuration file");
        Ok(config)
    }

    /// Apply `KEEL_*` overrides from the process environment
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        self.apply_overrides_from(std::env::vars())
    }

    /// Apply `KEEL_*` overrides from the given key/value pairs.
    ///
    /// Keys without the prefix and unknown keys are ignored.
    pub fn apply_overrides_from<I, K, V>(&mut self, vars: I) -> Result<()>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        for (key, value) in vars {
            let (key, value) = (key.as_ref(), value.as_ref());
            let Some(name) = key.strip_prefix(ENV_PREFIX) else {
                continue;
            };

            match name {
                "SERVICE_NAME" => self.service.name = value.to_string(),
                "SERVICE_VERSION" => self.service.version = value.to_string(),
                "ENV" => {
                    self.service.environment = value
                        .parse::<Environment>()
                        .map_err(|reason| ConfigError::env_override(key, value, reason))?;
                }
                "HOST" => self.server.host = value.to_string(),
                "PORT" => {
                    self.server.port = value
                        .parse()
                        .map_err(|e| ConfigError::env_override(key, value, format!("{e}")))?;
                }
                "LOG_LEVEL" => self.observability.logging.level = value.to_string(),
                "LOG_FORMAT" => {
                    self.observability.logging.format = Some(
                        value
                            .parse::<LogFormat>()
                            .map_err(|reason| ConfigError::env_override(key, value, reason))?,
                    );
                }
                "OTLP_ENDPOINT" => {
                    self.observability.tracing.enabled = true;
                    self.observability.tracing.otlp_endpoint = Some(value.to_string());
                }
                "TRACING" => self.observability.tracing.enabled = parse_bool(key, value)?,
                "SAMPLING_RATE" => {
                    self.observability.tracing.sampling_rate = value
                        .parse()
                        .map_err(|e| ConfigError::env_override(key, value, format!("{e}")))?;
                }
                "METRICS" => self.observability.metrics.enabled = parse_bool(key, value)?,
                "DEBUG" => self.debug.enabled = parse_bool(key, value)?,
                _ => continue,
            }
            debug!(key = key, "Applied environment override");
        }
        Ok(())
    }
}

fn parse_bool(key: &str, value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::env_override(key, value, "expected a boolean")),
    }
}

/// Load configuration from an optional file plus environment overrides, then validate.
pub fn load_config(path: Option<&Path>) -> Result<ServiceConfig> {
    let mut config = match path {
        Some(path) => ServiceConfig::from_file(path)?,
        None => ServiceConfig::default(),
    };
    config.apply_env_overrides()?;
    config.validate()?;

    info!(
        service = %config.service.name,
        environment = %config.service.environment,
        source = path.map_or_else(|| "defaults".to_string(), |p| p.display().to_string()),
        "Configuration loaded"
    );
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::time::Duration;

    fn write_temp(suffix: &str, contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::Builder::new().suffix(suffix).tempfile().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_from_yaml_file() {
        let file = write_temp(
            ".yaml",
            r"
service:
  name: billing
  environment: staging
server:
  port: 9443
  shutdown_timeout: 12s
observability:
  exclusions:
    prefixes: ['/static/']
",
        );
        let config = ServiceConfig::from_file(file.path()).unwrap();
        assert_eq!(config.service.name, "billing");
        assert_eq!(config.service.environment, Environment::Staging);
        assert_eq!(config.server.port, 9443);
        assert_eq!(config.server.shutdown_timeout, Duration::from_secs(12));
        assert_eq!(config.server.host, "0.0.0.0");
        assert_eq!(config.observability.exclusions.prefixes, vec!["/static/"]);
    }

    #[test]
    fn test_from_toml_file() {
        let file = write_temp(
            ".toml",
            r#"
[service]
name = "search"

[health]
readiness_path = "/ready"
check_timeout = "750ms"
"#,
        );
        let config = ServiceConfig::from_file(file.path()).unwrap();
        assert_eq!(config.service.name, "search");
        assert_eq!(config.health.readiness_path, "/ready");
        assert_eq!(config.health.check_timeout, Duration::from_millis(750));
    }

    #[test]
    fn test_unknown_field_rejected() {
        let file = write_temp(".yaml", "server:\n  prot: 80\n");
        assert!(matches!(
            ServiceConfig::from_file(file.path()),
            Err(ConfigError::Yaml { .. })
        ));
    }

    #[test]
    fn test_unsupported_extension() {
        let file = write_temp(".ini", "name=x");
        assert!(matches!(
            ServiceConfig::from_file(file.path()),
            Err(ConfigError::UnsupportedFormat(_))
        ));
    }

    #[test]
    fn test_env_overrides() {
        let mut config = ServiceConfig::default();
        config
            .apply_overrides_from([
                ("KEEL_PORT", "7000"),
                ("KEEL_ENV", "prod"),
                ("KEEL_LOG_FORMAT", "compact"),
                ("KEEL_OTLP_ENDPOINT", "http://collector:4317"),
                ("KEEL_DEBUG", "off"),
                ("PATH", "/usr/bin"),
                ("KEEL_UNKNOWN", "ignored"),
            ])
            .unwrap();

        assert_eq!(config.server.port, 7000);
        assert_eq!(config.service.environment, Environment::Production);
        assert_eq!(config.observability.logging.format, Some(LogFormat::Compact));
        assert!(config.observability.tracing.enabled);
        assert_eq!(
            config.observability.tracing.otlp_endpoint.as_deref(),
            Some("http://collector:4317")
        );
        assert!(!config.debug.enabled);
    }

    #[test]
    fn test_env_override_rejects_bad_value() {
        let mut config = ServiceConfig::default();
        let err = config
            .apply_overrides_from([("KEEL_PORT", "http")])
            .unwrap_err();
        assert!(matches!(err, ConfigError::EnvOverride { ref key, .. } if key == "KEEL_PORT"));

        let err = config
            .apply_overrides_from([("KEEL_METRICS", "maybe")])
            .unwrap_err();
        assert!(err.to_string().contains("boolean"));
    }
}
