//! Graceful shutdown coordination.
//!
//! The coordinator owns the shutdown phase and the in-flight request count.
//! Once shutdown is triggered it:
//! - waits `pre_drain_delay` so load balancers observe failing readiness
//! - enters [`ShutdownPhase::Draining`], after which [`DrainLayer`] rejects
//!   new requests with 503
//! - waits for in-flight requests up to `graceful_timeout`
//! - force-closes after `drain_timeout` and aborts registered background tasks

use axum::{
    body::Body,
    http::{header, HeaderValue, Request, Response, StatusCode},
    response::IntoResponse,
};
use keel_config::ServiceConfig;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::time::{sleep, timeout};
use tower::{Layer, Service};
use tracing::{debug, info, warn};

use crate::error::ApiError;

/// Graceful shutdown configuration
#[derive(Debug, Clone)]
pub struct ShutdownConfig {
    /// Maximum time to wait for in-flight requests to complete
    pub graceful_timeout: Duration,
    /// Time to wait before forcefully closing connections
    pub drain_timeout: Duration,
    /// Interval to log shutdown progress
    pub progress_interval: Duration,
    /// Whether to reject new requests while draining
    pub reject_new_requests: bool,
    /// Time to wait after signaling shutdown before starting drain
    pub pre_drain_delay: Duration,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            graceful_timeout: Duration::from_secs(30),
            drain_timeout: Duration::from_secs(5),
            progress_interval: Duration::from_secs(1),
            reject_new_requests: true,
            pre_drain_delay: Duration::ZERO,
        }
    }
}

impl ShutdownConfig {
    /// Create a new shutdown configuration
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Derive the graceful timeout from a service configuration.
    ///
    /// The drain timeout is zero: when the graceful timeout runs out the
    /// server closes remaining connections itself, so the coordinator does
    /// not wait past the shutdown budget.
    #[must_use]
    pub fn from_service_config(config: &ServiceConfig) -> Self {
        Self {
            graceful_timeout: config.server.shutdown_timeout,
            drain_timeout: Duration::ZERO,
            ..Self::default()
        }
    }

    /// Set the graceful timeout
    #[must_use]
    pub fn with_graceful_timeout(mut self, timeout: Duration) -> Self {
        self.graceful_timeout = timeout;
        self
    }

    /// Set the drain timeout
    #[must_use]
    pub fn with_drain_timeout(mut self, timeout: Duration) -> Self {
        self.drain_timeout = timeout;
        self
    }

    /// Set the delay between shutdown being triggered and draining
    #[must_use]
    pub fn with_pre_drain_delay(mut self, delay: Duration) -> Self {
        self.pre_drain_delay = delay;
        self
    }

    /// Set whether to reject new requests while draining
    #[must_use]
    pub fn with_reject_new_requests(mut self, reject: bool) -> Self {
        self.reject_new_requests = reject;
        self
    }
}

/// Shutdown phase
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownPhase {
    /// Normal operation
    Running,
    /// Shutdown initiated, draining connections
    Draining,
    /// Force closing remaining connections
    ForceClose,
    /// Shutdown complete
    Complete,
}

impl ShutdownPhase {
    /// Lowercase name of the phase
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Draining => "draining",
            Self::ForceClose => "force_close",
            Self::Complete => "complete",
        }
    }
}

impl std::fmt::Display for ShutdownPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Shutdown event
#[derive(Debug, Clone)]
pub enum ShutdownEvent {
    /// Shutdown initiated
    Initiated {
        /// The reason for shutdown
        reason: String,
    },
    /// Phase changed
    PhaseChanged {
        /// The new shutdown phase
        phase: ShutdownPhase,
    },
    /// Request drain progress
    DrainProgress {
        /// Number of remaining in-flight requests
        remaining: u64,
    },
    /// Shutdown complete
    Complete,
}

/// Shutdown coordinator for managing graceful shutdown
#[derive(Debug)]
pub struct ShutdownCoordinator {
    config: ShutdownConfig,
    phase: watch::Sender<ShutdownPhase>,
    shutdown_triggered: AtomicBool,
    in_flight_requests: AtomicU64,
    events: broadcast::Sender<ShutdownEvent>,
    background_tasks: tokio::sync::Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl ShutdownCoordinator {
    /// Create a new shutdown coordinator
    #[must_use]
    pub fn new(config: ShutdownConfig) -> Self {
        let (phase, _) = watch::channel(ShutdownPhase::Running);
        let (events, _) = broadcast::channel(16);

        Self {
            config,
            phase,
            shutdown_triggered: AtomicBool::new(false),
            in_flight_requests: AtomicU64::new(0),
            events,
            background_tasks: tokio::sync::Mutex::new(Vec::new()),
        }
    }

    /// Create with default configuration
    #[must_use]
    pub fn with_defaults() -> Self {
        Self::new(ShutdownConfig::default())
    }

    /// Configuration in use
    #[must_use]
    pub fn config(&self) -> &ShutdownConfig {
        &self.config
    }

    /// Check if shutdown has been triggered
    #[must_use]
    pub fn is_shutting_down(&self) -> bool {
        self.shutdown_triggered.load(Ordering::SeqCst)
    }

    /// Get current shutdown phase
    #[must_use]
    pub fn current_phase(&self) -> ShutdownPhase {
        *self.phase.borrow()
    }

    /// Get the number of in-flight requests
    #[must_use]
    pub fn in_flight_count(&self) -> u64 {
        self.in_flight_requests.load(Ordering::SeqCst)
    }

    /// Subscribe to phase changes
    #[must_use]
    pub fn subscribe_phase(&self) -> watch::Receiver<ShutdownPhase> {
        self.phase.subscribe()
    }

    /// Subscribe to shutdown events
    #[must_use]
    pub fn subscribe_events(&self) -> broadcast::Receiver<ShutdownEvent> {
        self.events.subscribe()
    }

    /// Future that resolves once draining has begun
    pub fn shutdown_signal(&self) -> impl Future<Output = ()> + Send + 'static {
        let mut phase = self.phase.subscribe();
        async move {
            let _ = phase.wait_for(|p| *p != ShutdownPhase::Running).await;
        }
    }

    /// Register a request start
    pub fn request_start(&self) {
        self.in_flight_requests.fetch_add(1, Ordering::SeqCst);
    }

    /// Register a request completion
    pub fn request_complete(&self) {
        let prev = self.in_flight_requests.fetch_sub(1, Ordering::SeqCst);
        debug!(in_flight = prev.saturating_sub(1), "Request completed");
    }

    /// Register a background task to abort at the end of shutdown
    pub async fn register_task(&self, handle: tokio::task::JoinHandle<()>) {
        self.background_tasks.lock().await.push(handle);
    }

    /// Number of registered background tasks
    pub async fn task_count(&self) -> usize {
        self.background_tasks.lock().await.len()
    }

    /// Should accept new requests?
    #[must_use]
    pub fn should_accept_requests(&self) -> bool {
        !self.config.reject_new_requests || self.current_phase() == ShutdownPhase::Running
    }

    /// Trigger shutdown with a reason. Only the first call does anything.
    pub async fn trigger_shutdown(&self, reason: &str) {
        if self
            .shutdown_triggered
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!(reason = %reason, "Shutdown already triggered");
            return;
        }

        info!(reason = %reason, "Initiating graceful shutdown");
        let _ = self.events.send(ShutdownEvent::Initiated {
            reason: reason.to_string(),
        });

        if !self.config.pre_drain_delay.is_zero() {
            debug!(
                delay_ms = self.config.pre_drain_delay.as_millis(),
                "Pre-drain delay"
            );
            sleep(self.config.pre_drain_delay).await;
        }

        self.set_phase(ShutdownPhase::Draining);

        if timeout(self.config.graceful_timeout, self.wait_for_drain())
            .await
            .is_ok()
        {
            info!("All in-flight requests completed");
        } else {
            warn!(
                remaining = self.in_flight_count(),
                "Graceful timeout exceeded, forcing shutdown"
            );
            self.set_phase(ShutdownPhase::ForceClose);
            sleep(self.config.drain_timeout).await;
        }

        self.cancel_background_tasks().await;

        self.set_phase(ShutdownPhase::Complete);
        let _ = self.events.send(ShutdownEvent::Complete);
        info!("Request drain complete");
    }

    fn set_phase(&self, phase: ShutdownPhase) {
        info!(phase = %phase, "Shutdown phase changed");
        self.phase.send_replace(phase);
        let _ = self.events.send(ShutdownEvent::PhaseChanged { phase });
    }

    async fn wait_for_drain(&self) {
        let mut last_logged = std::time::Instant::now();

        loop {
            let count = self.in_flight_count();
            if count == 0 {
                break;
            }

            if last_logged.elapsed() >= self.config.progress_interval {
                info!(remaining = count, "Waiting for in-flight requests");
                let _ = self
                    .events
                    .send(ShutdownEvent::DrainProgress { remaining: count });
                last_logged = std::time::Instant::now();
            }

            sleep(Duration::from_millis(20)).await;
        }
    }

    async fn cancel_background_tasks(&self) {
        let mut tasks = self.background_tasks.lock().await;
        if !tasks.is_empty() {
            info!(count = tasks.len(), "Cancelling background tasks");
            for handle in tasks.drain(..) {
                handle.abort();
            }
        }
    }
}

/// Request guard that tracks request lifecycle
#[derive(Debug)]
pub struct RequestGuard {
    coordinator: Arc<ShutdownCoordinator>,
}

impl RequestGuard {
    /// Start tracking a request; `None` when new requests are rejected
    #[must_use]
    pub fn new(coordinator: Arc<ShutdownCoordinator>) -> Option<Self> {
        if !coordinator.should_accept_requests() {
            return None;
        }
        coordinator.request_start();
        Some(Self { coordinator })
    }
}

impl Drop for RequestGuard {
    fn drop(&mut self) {
        self.coordinator.request_complete();
    }
}

/// Layer that tracks in-flight requests and rejects new ones while draining
#[derive(Debug, Clone)]
pub struct DrainLayer {
    coordinator: Arc<ShutdownCoordinator>,
}

impl DrainLayer {
    /// Create a drain layer bound to a coordinator
    #[must_use]
    pub fn new(coordinator: Arc<ShutdownCoordinator>) -> Self {
        Self { coordinator }
    }
}

/// Build a [`DrainLayer`]
#[must_use]
pub fn drain_layer(coordinator: Arc<ShutdownCoordinator>) -> DrainLayer {
    DrainLayer::new(coordinator)
}

impl<S> Layer<S> for DrainLayer {
    type Service = DrainService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        DrainService {
            inner,
            coordinator: Arc::clone(&self.coordinator),
        }
    }
}

/// Drain middleware service.
#[derive(Debug, Clone)]
pub struct DrainService<S> {
    inner: S,
    coordinator: Arc<ShutdownCoordinator>,
}

impl<S, ReqBody> Service<Request<ReqBody>> for DrainService<S>
where
    S: Service<Request<ReqBody>, Response = Response<Body>> + Clone + Send + 'static,
    S::Future: Send + 'static,
    ReqBody: Send + 'static,
{
    type Response = Response<Body>;
    type Error = S::Error;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, request: Request<ReqBody>) -> Self::Future {
        let Some(guard) = RequestGuard::new(Arc::clone(&self.coordinator)) else {
            return Box::pin(async { Ok(shutting_down_response()) });
        };

        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);
        Box::pin(async move {
            let response = inner.call(request).await;
            drop(guard);
            response
        })
    }
}

fn shutting_down_response() -> Response<Body> {
    let mut response = ApiError::new(
        StatusCode::SERVICE_UNAVAILABLE,
        "shutting_down",
        "Server is shutting down",
    )
    .into_response();
    response
        .headers_mut()
        .insert(header::CONNECTION, HeaderValue::from_static("close"));
    response
}

/// Process signal relevant to the server
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    /// SIGTERM
    Terminate,
    /// SIGINT or Ctrl+C
    Interrupt,
    /// SIGQUIT
    Quit,
    /// SIGHUP, used to request a configuration reload
    Hangup,
}

impl Signal {
    /// Whether the signal requests shutdown
    #[must_use]
    pub fn is_shutdown(&self) -> bool {
        !matches!(self, Self::Hangup)
    }

    /// Conventional signal name
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Terminate => "SIGTERM",
            Self::Interrupt => "SIGINT",
            Self::Quit => "SIGQUIT",
            Self::Hangup => "SIGHUP",
        }
    }
}

impl std::fmt::Display for Signal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Installed signal handlers. Keep one alive for the life of the server so
/// no signal is missed between receives.
#[derive(Debug)]
pub struct Signals {
    #[cfg(unix)]
    terminate: tokio::signal::unix::Signal,
    #[cfg(unix)]
    interrupt: tokio::signal::unix::Signal,
    #[cfg(unix)]
    quit: tokio::signal::unix::Signal,
    #[cfg(unix)]
    hangup: tokio::signal::unix::Signal,
}

impl Signals {
    /// Install handlers for TERM, INT, QUIT and HUP
    ///
    /// # Errors
    /// Returns error if a handler cannot be installed
    #[cfg(unix)]
    pub fn new() -> std::io::Result<Self> {
        use tokio::signal::unix::{signal, SignalKind};

        Ok(Self {
            terminate: signal(SignalKind::terminate())?,
            interrupt: signal(SignalKind::interrupt())?,
            quit: signal(SignalKind::quit())?,
            hangup: signal(SignalKind::hangup())?,
        })
    }

    /// Install the Ctrl+C handler
    #[cfg(not(unix))]
    pub fn new() -> std::io::Result<Self> {
        Ok(Self {})
    }

    /// Wait for the next signal
    #[cfg(unix)]
    pub async fn recv(&mut self) -> Signal {
        let received = tokio::select! {
            _ = self.terminate.recv() => Signal::Terminate,
            _ = self.interrupt.recv() => Signal::Interrupt,
            _ = self.quit.recv() => Signal::Quit,
            _ = self.hangup.recv() => Signal::Hangup,
        };
        info!(signal = %received, "Received signal");
        received
    }

    /// Wait for the next signal
    #[cfg(not(unix))]
    pub async fn recv(&mut self) -> Signal {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Ctrl+C handler failed");
            std::future::pending::<()>().await;
        }
        info!(signal = %Signal::Interrupt, "Received signal");
        Signal::Interrupt
    }
}

/// Wait for any handled signal
///
/// # Errors
/// Returns error if signal handlers cannot be installed
pub async fn wait_for_signal() -> std::io::Result<Signal> {
    let mut signals = Signals::new()?;
    Ok(signals.recv().await)
}

/// Resolve on the first terminate, interrupt or quit signal, ignoring SIGHUP
///
/// # Errors
/// Returns error if signal handlers cannot be installed
pub async fn shutdown_signal() -> std::io::Result<Signal> {
    let mut signals = Signals::new()?;
    loop {
        let signal = signals.recv().await;
        if signal.is_shutdown() {
            return Ok(signal);
        }
        debug!(signal = %signal, "Ignoring non-shutdown signal");
    }
}
