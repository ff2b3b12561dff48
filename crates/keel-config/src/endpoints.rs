//! Health and debug endpoint settings.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Health endpoint configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HealthConfig {
    /// Register the liveness and readiness endpoints
    pub enabled: bool,
    /// Liveness endpoint path
    pub liveness_path: String,
    /// Readiness endpoint path
    pub readiness_path: String,
    /// Timeout applied to each individual check
    #[serde(with = "humantime_serde")]
    pub check_timeout: Duration,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            liveness_path: "/healthz".to_string(),
            readiness_path: "/readyz".to_string(),
            check_timeout: Duration::from_secs(5),
        }
    }
}

/// Debug endpoint configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DebugConfig {
    /// Register the debug endpoints
    pub enabled: bool,
    /// Prefix for all debug endpoints
    pub prefix: String,
    /// Permit debug endpoints when the environment is production
    pub allow_in_production: bool,
}

impl Default for DebugConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            prefix: "/debug".to_string(),
            allow_in_production: false,
        }
    }
}
