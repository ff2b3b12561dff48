//! Configuration error types.

use std::path::PathBuf;

/// Result type for configuration operations.
pub type Result<T> = std::result::Result<T, ConfigError>;

/// Configuration error type.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Configuration file could not be read.
    #[error("Failed to read config file {path}: {source}")]
    Io {
        /// Path that was being read
        path: PathBuf,
        /// Underlying I/O error
        #[source]
        source: std::io::Error,
    },

    /// Configuration file has an extension we cannot parse.
    #[error("Unsupported config format for {0}: expected .yaml, .yml or .toml")]
    UnsupportedFormat(PathBuf),

    /// YAML parse error.
    #[error("Invalid YAML in {path}: {source}")]
    Yaml {
        /// Path of the offending file
        path: PathBuf,
        /// Parser error
        #[source]
        source: serde_yaml::Error,
    },

    /// TOML parse error.
    #[error("Invalid TOML in {path}: {source}")]
    Toml {
        /// Path of the offending file
        path: PathBuf,
        /// Parser error
        #[source]
        source: toml::de::Error,
    },

    /// An environment override could not be applied.
    #[error("Invalid value for {key}={value:?}: {reason}")]
    EnvOverride {
        /// Environment variable name
        key: String,
        /// Raw value
        value: String,
        /// Why it was rejected
        reason: String,
    },

    /// One or more validation problems. All problems are reported together.
    #[error("Invalid configuration: {}", .0.join("; "))]
    Validation(Vec<String>),
}

impl ConfigError {
    /// Create an environment override error.
    pub fn env_override(
        key: impl Into<String>,
        value: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self::EnvOverride {
            key: key.into(),
            value: value.into(),
            reason: reason.into(),
        }
    }

    /// Validation problems, if this is a validation error.
    #[must_use]
    pub fn problems(&self) -> &[String] {
        match self {
            Self::Validation(problems) => problems,
            _ => &[],
        }
    }
}
