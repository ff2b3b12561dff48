//! HTTP listener settings.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use validator::Validate;

/// HTTP server configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate)]
#[serde(default, deny_unknown_fields)]
pub struct ServerConfig {
    /// Bind host
    #[validate(length(min = 1, message = "server host must not be empty"))]
    pub host: String,
    /// Bind port
    #[validate(range(min = 1, message = "server port must be non-zero"))]
    pub port: u16,
    /// Per-request timeout applied to every route
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,
    /// Budget for shutdown hooks and connection draining
    #[serde(with = "humantime_serde")]
    pub shutdown_timeout: Duration,
    /// Maximum accepted request body size in bytes
    #[validate(range(min = 1, message = "max_body_bytes must be non-zero"))]
    pub max_body_bytes: usize,
    /// Time allowed for a client to send request headers
    #[serde(with = "humantime_serde")]
    pub read_header_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            request_timeout: Duration::from_secs(30),
            shutdown_timeout: Duration::from_secs(30),
            max_body_bytes: 2 * 1024 * 1024,
            read_header_timeout: Duration::from_secs(10),
        }
    }
}

impl ServerConfig {
    /// Socket address string in `host:port` form
    #[must_use]
    pub fn bind_address(&self) -> String {
        if self.host.contains(':') && !self.host.starts_with('[') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bind_address_brackets_ipv6() {
        let mut config = ServerConfig::default();
        assert_eq!(config.bind_address(), "0.0.0.0:8080");

        config.host = "::1".to_string();
        assert_eq!(config.bind_address(), "[::1]:8080");
    }
}
