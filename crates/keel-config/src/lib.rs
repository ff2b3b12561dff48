//! # Keel Config
//!
//! Configuration management for Keel services.
//!
//! This crate provides:
//! - Typed configuration sections with serde defaults
//! - Chained-option construction via [`ConfigBuilder`]
//! - YAML / TOML file loading with `KEEL_*` environment overrides
//! - Validation that reports every problem at once
//! - A lock-free live store for reloads

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod builder;
pub mod config;
pub mod endpoints;
pub mod error;
pub mod loader;
pub mod observability;
pub mod server;
pub mod service;
pub mod store;

pub use builder::ConfigBuilder;
pub use config::ServiceConfig;
pub use endpoints::{DebugConfig, HealthConfig};
pub use error::{ConfigError, Result};
pub use loader::{load_config, ENV_PREFIX};
pub use observability::{
    AccessLogSettings, ExclusionSettings, LogFormat, LoggingSettings, MetricsSettings,
    ObservabilityConfig, TracingSettings, DEFAULT_LATENCY_BUCKETS,
};
pub use server::ServerConfig;
pub use service::{Environment, ServiceInfo};
pub use store::ConfigStore;
