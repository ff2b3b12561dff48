//! # Keel Server
//!
//! Application framework layer over axum.
//!
//! This crate provides:
//! - [`App`] builder wiring routes, health checks and lifecycle hooks
//! - Start, ready, shutdown, stop and reload hooks
//! - Graceful shutdown with request draining and signal handling
//! - Health, readiness, metrics and debug endpoints
//! - Validating request extractors and a uniform JSON error type
//!
//! ```no_run
//! use keel_config::ServiceConfig;
//! use keel_server::App;
//!
//! # async fn run() -> keel_server::Result<()> {
//! let config = ServiceConfig::builder("orders").build()?;
//! App::builder(config)
//!     .get("/orders/:id", || async { "order" })
//!     .on_shutdown(|_| async { Ok::<_, std::io::Error>(()) })
//!     .build()?
//!     .run()
//!     .await
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod app;
pub mod debug;
pub mod error;
pub mod extractors;
pub mod health;
pub mod lifecycle;
pub mod routes;
pub mod server;
pub mod shutdown;

pub use app::{App, AppBuilder, AppHandle};
pub use debug::{DebugInfo, DebugState, RouteInfo};
pub use error::{ApiError, BoxError, ErrorBody, Result, ServerError};
pub use extractors::{PeerAddr, RequestContext, ValidatedJson, ValidatedPath, ValidatedQuery};
pub use health::{
    check_fn, ComponentHealth, FnCheck, HealthCheck, HealthChecker, HealthResponse, HealthStatus,
};
pub use lifecycle::{HookContext, HookPhase, Lifecycle, ShutdownReport};
pub use shutdown::{
    drain_layer, DrainLayer, RequestGuard, ShutdownConfig, ShutdownCoordinator, ShutdownEvent,
    ShutdownPhase, Signal, Signals,
};
