//! Service identity.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use validator::Validate;

/// Deployment environment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    /// Local development
    #[default]
    Development,
    /// Pre-production
    Staging,
    /// Production
    Production,
}

impl Environment {
    /// Whether this is a production deployment
    #[must_use]
    pub fn is_production(&self) -> bool {
        matches!(self, Self::Production)
    }

    /// Canonical lowercase name
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Development => "development",
            Self::Staging => "staging",
            Self::Production => "production",
        }
    }
}

impl fmt::Display for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Environment {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "development" | "dev" | "local" => Ok(Self::Development),
            "staging" | "stage" => Ok(Self::Staging),
            "production" | "prod" => Ok(Self::Production),
            other => Err(format!(
                "unknown environment '{other}' (expected development, staging or production)"
            )),
        }
    }
}

/// Identity of the running service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate)]
#[serde(default, deny_unknown_fields)]
pub struct ServiceInfo {
    /// Service name, used for telemetry resources and log fields
    #[validate(length(min = 1, max = 128, message = "service name must be 1-128 characters"))]
    pub name: String,
    /// Service version
    #[validate(length(min = 1, message = "service version must not be empty"))]
    pub version: String,
    /// Deployment environment
    pub environment: Environment,
}

impl Default for ServiceInfo {
    fn default() -> Self {
        Self {
            name: "keel-service".to_string(),
            version: "0.0.0".to_string(),
            environment: Environment::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_environment_parse_aliases() {
        assert_eq!("prod".parse::<Environment>(), Ok(Environment::Production));
        assert_eq!("Staging".parse::<Environment>(), Ok(Environment::Staging));
        assert_eq!(" dev ".parse::<Environment>(), Ok(Environment::Development));
        assert!("qa".parse::<Environment>().is_err());
    }

    #[test]
    fn test_environment_display_round_trips_serde_name() {
        let json = serde_json::to_string(&Environment::Production).unwrap();
        assert_eq!(json, format!("\"{}\"", Environment::Production));
        assert!(Environment::Production.is_production());
        assert!(!Environment::Staging.is_production());
    }
}
