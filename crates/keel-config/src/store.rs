//! Live configuration that can be swapped on reload.

use arc_swap::ArcSwap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::config::ServiceConfig;
use crate::error::Result;

/// Holds the current configuration. Readers never block.
#[derive(Debug)]
pub struct ConfigStore {
    current: ArcSwap<ServiceConfig>,
    source: Option<PathBuf>,
}

impl ConfigStore {
    /// Create a store holding a configuration that has no backing file
    #[must_use]
    pub fn new(config: ServiceConfig) -> Self {
        Self {
            current: ArcSwap::from_pointee(config),
            source: None,
        }
    }

    /// Create a store that remembers which file the configuration came from
    #[must_use]
    pub fn with_source(config: ServiceConfig, path: impl Into<PathBuf>) -> Self {
        Self {
            current: ArcSwap::from_pointee(config),
            source: Some(path.into()),
        }
    }

    /// Snapshot of the current configuration
    #[must_use]
    pub fn current(&self) -> Arc<ServiceConfig> {
        self.current.load_full()
    }

    /// File the configuration was loaded from, if any
    #[must_use]
    pub fn source_path(&self) -> Option<&Path> {
        self.source.as_deref()
    }

    /// Replace the configuration. Invalid configurations are rejected and
    /// the previous one stays in place.
    pub fn replace(&self, config: ServiceConfig) -> Result<Arc<ServiceConfig>> {
        if let Err(e) = config.validate() {
            warn!(error = %e, "Rejected configuration update");
            return Err(e);
        }
        let config = Arc::new(config);
        self.current.store(Arc::clone(&config));
        info!(service = %config.service.name, "Configuration replaced");
        Ok(config)
    }

    /// Re-read the source file (plus environment overrides) and swap it in.
    ///
    /// Without a source file the current configuration is returned unchanged.
    pub fn reload_from_source(&self) -> Result<Arc<ServiceConfig>> {
        let Some(path) = &self.source else {
            debug!("No configuration source file, keeping current configuration");
            return Ok(self.current());
        };

        let mut config = ServiceConfig::from_file(path)?;
        config.apply_env_overrides()?;
        self.replace(config)
    }
}
