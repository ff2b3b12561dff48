//! Lifecycle hooks.
//!
//! | Phase | Order | On failure |
//! |---|---|---|
//! | start | registration order, sequential | abort startup |
//! | ready | concurrent, after the listener is bound | logged |
//! | shutdown | reverse registration order, shared time budget | logged, later hooks still run |
//! | stop | registration order, after the server stopped | logged |
//! | reload | registration order, serialized across reloads | returned |

use futures::future::BoxFuture;
use keel_config::ServiceConfig;
use keel_telemetry::{hook_span, Metrics};
use parking_lot::Mutex;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn, Instrument};

use crate::error::{BoxError, Result, ServerError};

type HookFuture = BoxFuture<'static, std::result::Result<(), BoxError>>;
type Hook = Arc<dyn Fn(HookContext) -> HookFuture + Send + Sync>;

/// Context handed to every hook
#[derive(Debug, Clone)]
pub struct HookContext {
    /// Configuration in effect (the new one, for reload hooks)
    pub config: Arc<ServiceConfig>,
    /// Point in time by which a shutdown hook should have finished
    pub deadline: Option<Instant>,
}

impl HookContext {
    /// Context without a deadline
    #[must_use]
    pub fn new(config: Arc<ServiceConfig>) -> Self {
        Self {
            config,
            deadline: None,
        }
    }

    /// Set the deadline
    #[must_use]
    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Time left before the deadline
    #[must_use]
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }
}

/// Lifecycle phase
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HookPhase {
    /// Before the listener is bound
    Start,
    /// After the listener is bound
    Ready,
    /// While the server drains
    Shutdown,
    /// After the server stopped
    Stop,
    /// After a configuration reload
    Reload,
}

impl HookPhase {
    /// Metric label for the phase
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Ready => "ready",
            Self::Shutdown => "shutdown",
            Self::Stop => "stop",
            Self::Reload => "reload",
        }
    }
}

impl std::fmt::Display for HookPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of running the shutdown hooks
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ShutdownReport {
    /// Hooks invoked
    pub ran: usize,
    /// Hooks that returned an error
    pub failed: usize,
    /// Hooks cut off by the budget
    pub timed_out: usize,
}

impl ShutdownReport {
    /// Whether every hook completed successfully
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.failed == 0 && self.timed_out == 0
    }
}

/// Registry of lifecycle hooks
pub struct Lifecycle {
    start: Mutex<Vec<Hook>>,
    ready: Mutex<Vec<Hook>>,
    shutdown: Mutex<Vec<Hook>>,
    stop: Mutex<Vec<Hook>>,
    reload: Mutex<Vec<Hook>>,
    frozen: AtomicBool,
    reload_lock: tokio::sync::Mutex<()>,
    metrics: Option<Metrics>,
}

impl std::fmt::Debug for Lifecycle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lifecycle")
            .field("start", &self.start.lock().len())
            .field("ready", &self.ready.lock().len())
            .field("shutdown", &self.shutdown.lock().len())
            .field("stop", &self.stop.lock().len())
            .field("reload", &self.reload.lock().len())
            .field("frozen", &self.is_frozen())
            .finish_non_exhaustive()
    }
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new(None)
    }
}

impl Lifecycle {
    /// Create an empty registry
    #[must_use]
    pub fn new(metrics: Option<Metrics>) -> Self {
        Self {
            start: Mutex::new(Vec::new()),
            ready: Mutex::new(Vec::new()),
            shutdown: Mutex::new(Vec::new()),
            stop: Mutex::new(Vec::new()),
            reload: Mutex::new(Vec::new()),
            frozen: AtomicBool::new(false),
            reload_lock: tokio::sync::Mutex::new(()),
            metrics,
        }
    }

    /// Count hook failures and reloads in `metrics`
    #[must_use]
    pub fn with_metrics(mut self, metrics: Metrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Register a start hook
    pub fn on_start<F, Fut, E>(&self, hook: F) -> Result<()>
    where
        F: Fn(HookContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<(), E>> + Send + 'static,
        E: Into<BoxError>,
    {
        if self.is_frozen() {
            return Err(ServerError::LifecycleFrozen);
        }
        self.start.lock().push(into_hook(hook));
        Ok(())
    }

    /// Register a ready hook
    pub fn on_ready<F, Fut, E>(&self, hook: F)
    where
        F: Fn(HookContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<(), E>> + Send + 'static,
        E: Into<BoxError>,
    {
        self.ready.lock().push(into_hook(hook));
    }

    /// Register a shutdown hook
    pub fn on_shutdown<F, Fut, E>(&self, hook: F)
    where
        F: Fn(HookContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<(), E>> + Send + 'static,
        E: Into<BoxError>,
    {
        self.shutdown.lock().push(into_hook(hook));
    }

    /// Register a stop hook
    pub fn on_stop<F, Fut, E>(&self, hook: F)
    where
        F: Fn(HookContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<(), E>> + Send + 'static,
        E: Into<BoxError>,
    {
        self.stop.lock().push(into_hook(hook));
    }

    /// Register a reload hook
    pub fn on_reload<F, Fut, E>(&self, hook: F)
    where
        F: Fn(HookContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<(), E>> + Send + 'static,
        E: Into<BoxError>,
    {
        self.reload.lock().push(into_hook(hook));
    }

    /// Reject further start hooks
    pub fn freeze(&self) {
        self.frozen.store(true, Ordering::SeqCst);
    }

    /// Whether the registry is frozen
    #[must_use]
    pub fn is_frozen(&self) -> bool {
        self.frozen.load(Ordering::SeqCst)
    }

    /// Number of hooks registered for a phase
    #[must_use]
    pub fn hook_count(&self, phase: HookPhase) -> usize {
        self.hooks(phase).len()
    }

    fn hooks(&self, phase: HookPhase) -> Vec<Hook> {
        match phase {
            HookPhase::Start => self.start.lock().clone(),
            HookPhase::Ready => self.ready.lock().clone(),
            HookPhase::Shutdown => self.shutdown.lock().clone(),
            HookPhase::Stop => self.stop.lock().clone(),
            HookPhase::Reload => self.reload.lock().clone(),
        }
    }

    fn record_failure(&self, phase: HookPhase) {
        if let Some(metrics) = &self.metrics {
            metrics.inc_hook_failure(phase.as_str());
        }
    }

    /// Run start hooks in order. The first failure is returned and the
    /// remaining hooks are skipped.
    pub async fn run_start(&self, config: Arc<ServiceConfig>) -> Result<()> {
        let hooks = self.hooks(HookPhase::Start);
        debug!(count = hooks.len(), "Running start hooks");

        for (index, hook) in hooks.iter().enumerate() {
            let context = HookContext::new(Arc::clone(&config));
            if let Err(source) = hook(context)
                .instrument(hook_span!(HookPhase::Start, index))
                .await
            {
                error!(hook = index, error = %source, "Start hook failed");
                self.record_failure(HookPhase::Start);
                return Err(ServerError::StartHook { index, source });
            }
        }
        Ok(())
    }

    /// Spawn ready hooks concurrently. Errors are logged, never returned.
    pub fn run_ready(&self, config: &Arc<ServiceConfig>) -> Vec<tokio::task::JoinHandle<()>> {
        let hooks = self.hooks(HookPhase::Ready);
        hooks
            .into_iter()
            .enumerate()
            .map(|(index, hook)| {
                let context = HookContext::new(Arc::clone(config));
                let metrics = self.metrics.clone();
                tokio::spawn(
                    async move {
                        if let Err(e) = hook(context).await {
                            warn!(hook = index, error = %e, "Ready hook failed");
                            if let Some(metrics) = metrics {
                                metrics.inc_hook_failure(HookPhase::Ready.as_str());
                            }
                        }
                    }
                    .instrument(hook_span!(HookPhase::Ready, index)),
                )
            })
            .collect()
    }

    /// Run shutdown hooks newest-first within a total `budget`. Each hook
    /// gets whatever budget is left; a failing or slow hook does not stop
    /// the ones after it.
    pub async fn run_shutdown(&self, config: Arc<ServiceConfig>, budget: Duration) -> ShutdownReport {
        let hooks = self.hooks(HookPhase::Shutdown);
        let deadline = Instant::now() + budget;
        let mut report = ShutdownReport::default();

        for (index, hook) in hooks.iter().enumerate().rev() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let context = HookContext::new(Arc::clone(&config)).with_deadline(deadline);
            report.ran += 1;

            let outcome = tokio::time::timeout(remaining, hook(context))
                .instrument(hook_span!(HookPhase::Shutdown, index))
                .await;
            match outcome {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    warn!(hook = index, error = %e, "Shutdown hook failed");
                    report.failed += 1;
                    self.record_failure(HookPhase::Shutdown);
                }
                Err(_) => {
                    warn!(hook = index, "Shutdown hook exceeded the shutdown budget");
                    report.timed_out += 1;
                    self.record_failure(HookPhase::Shutdown);
                }
            }
        }

        info!(
            ran = report.ran,
            failed = report.failed,
            timed_out = report.timed_out,
            "Shutdown hooks finished"
        );
        report
    }

    /// Run stop hooks in order, logging failures
    pub async fn run_stop(&self, config: Arc<ServiceConfig>) {
        for (index, hook) in self.hooks(HookPhase::Stop).iter().enumerate() {
            let context = HookContext::new(Arc::clone(&config));
            if let Err(e) = hook(context)
                .instrument(hook_span!(HookPhase::Stop, index))
                .await
            {
                warn!(hook = index, error = %e, "Stop hook failed");
                self.record_failure(HookPhase::Stop);
            }
        }
    }

    /// Apply a new configuration to the reload hooks
    pub async fn reload(&self, config: Arc<ServiceConfig>) -> Result<()> {
        self.reload_with(|| Ok(config)).await.map(|_| ())
    }

    /// Load a configuration and run the reload hooks against it while
    /// holding the reload lock. Concurrent reloads run one after another.
    pub async fn reload_with<F>(&self, load: F) -> Result<Arc<ServiceConfig>>
    where
        F: FnOnce() -> Result<Arc<ServiceConfig>>,
    {
        let _serialized = self.reload_lock.lock().await;

        let outcome = self.apply_reload(load).await;
        let label = if outcome.is_ok() { "success" } else { "failure" };
        if let Some(metrics) = &self.metrics {
            metrics.inc_reload(label);
        }
        match &outcome {
            Ok(_) => info!("Reload complete"),
            Err(e) => error!(error = %e, "Reload failed"),
        }
        outcome
    }

    async fn apply_reload<F>(&self, load: F) -> Result<Arc<ServiceConfig>>
    where
        F: FnOnce() -> Result<Arc<ServiceConfig>>,
    {
        let config = load()?;
        for (index, hook) in self.hooks(HookPhase::Reload).iter().enumerate() {
            let context = HookContext::new(Arc::clone(&config));
            hook(context)
                .instrument(hook_span!(HookPhase::Reload, index))
                .await
                .map_err(|source| {
                    self.record_failure(HookPhase::Reload);
                    ServerError::ReloadHook { index, source }
                })?;
        }
        Ok(config)
    }
}

fn into_hook<F, Fut, E>(hook: F) -> Hook
where
    F: Fn(HookContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = std::result::Result<(), E>> + Send + 'static,
    E: Into<BoxError>,
{
    Arc::new(move |context| -> HookFuture {
        let future = hook(context);
        Box::pin(async move { future.await.map_err(Into::into) })
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_telemetry::MetricsConfig;
    use std::sync::atomic::AtomicUsize;

    type Log = Arc<Mutex<Vec<String>>>;

    fn config() -> Arc<ServiceConfig> {
        Arc::new(ServiceConfig::default())
    }

    fn recording(log: &Log, name: &'static str) -> impl Fn(HookContext) -> HookFuture + Send + Sync {
        let log = Arc::clone(log);
        move |_| -> HookFuture {
            let log = Arc::clone(&log);
            Box::pin(async move {
                log.lock().push(name.to_string());
                Ok(())
            })
        }
    }

    #[tokio::test]
    async fn test_start_hooks_run_in_order() {
        let lifecycle = Lifecycle::default();
        let log: Log = Arc::default();
        lifecycle.on_start(recording(&log, "a")).unwrap();
        lifecycle.on_start(recording(&log, "b")).unwrap();

        lifecycle.run_start(config()).await.unwrap();
        assert_eq!(*log.lock(), vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_start_failure_aborts_remaining() {
        let metrics = Metrics::new(&MetricsConfig::default()).unwrap();
        let lifecycle = Lifecycle::new(Some(metrics.clone()));
        let log: Log = Arc::default();
        lifecycle.on_start(recording(&log, "a")).unwrap();
        lifecycle
            .on_start(|_| async { Err::<(), _>("migration failed") })
            .unwrap();
        lifecycle.on_start(recording(&log, "c")).unwrap();

        let error = lifecycle.run_start(config()).await.unwrap_err();
        assert!(matches!(error, ServerError::StartHook { index: 1, .. }));
        assert_eq!(*log.lock(), vec!["a"]);
        assert!(metrics
            .gather()
            .contains("lifecycle_hook_failures_total{phase=\"start\"} 1"));
    }

    #[tokio::test]
    async fn test_frozen_rejects_start_hooks_only() {
        let lifecycle = Lifecycle::default();
        lifecycle.freeze();

        let result = lifecycle.on_start(|_| async { Ok::<(), BoxError>(()) });
        assert!(matches!(result, Err(ServerError::LifecycleFrozen)));

        lifecycle.on_shutdown(|_| async { Ok::<(), BoxError>(()) });
        lifecycle.on_stop(|_| async { Ok::<(), BoxError>(()) });
        lifecycle.on_reload(|_| async { Ok::<(), BoxError>(()) });
        assert_eq!(lifecycle.hook_count(HookPhase::Start), 0);
        assert_eq!(lifecycle.hook_count(HookPhase::Shutdown), 1);
        assert_eq!(lifecycle.hook_count(HookPhase::Reload), 1);
    }

    #[tokio::test]
    async fn test_shutdown_hooks_run_lifo() {
        let lifecycle = Lifecycle::default();
        let log: Log = Arc::default();
        lifecycle.on_shutdown(recording(&log, "db"));
        lifecycle.on_shutdown(recording(&log, "cache"));
        lifecycle.on_shutdown(recording(&log, "consumer"));

        let report = lifecycle.run_shutdown(config(), Duration::from_secs(1)).await;
        assert_eq!(*log.lock(), vec!["consumer", "cache", "db"]);
        assert_eq!(report.ran, 3);
        assert!(report.is_clean());
    }

    #[tokio::test]
    async fn test_shutdown_failures_do_not_stop_later_hooks() {
        let lifecycle = Lifecycle::default();
        let log: Log = Arc::default();
        lifecycle.on_shutdown(recording(&log, "first"));
        lifecycle.on_shutdown(|_| async { Err::<(), _>("flush failed") });
        lifecycle.on_shutdown(|_| async {
            tokio::time::sleep(Duration::from_secs(10)).await;
            Ok::<(), BoxError>(())
        });

        let report = lifecycle
            .run_shutdown(config(), Duration::from_millis(100))
            .await;
        assert_eq!(
            report,
            ShutdownReport {
                ran: 3,
                failed: 1,
                timed_out: 1
            }
        );
        assert_eq!(*log.lock(), vec!["first"]);
    }

    #[tokio::test]
    async fn test_shutdown_hooks_see_deadline() {
        let lifecycle = Lifecycle::default();
        let seen = Arc::new(Mutex::new(None));
        let sink = Arc::clone(&seen);
        lifecycle.on_shutdown(move |ctx: HookContext| {
            *sink.lock() = ctx.remaining();
            async { Ok::<(), BoxError>(()) }
        });

        lifecycle.run_shutdown(config(), Duration::from_secs(5)).await;
        let remaining = seen.lock().unwrap();
        assert!(remaining > Duration::from_secs(4));
        assert!(remaining <= Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_ready_errors_are_not_fatal() {
        let lifecycle = Lifecycle::default();
        let ran = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&ran);
        lifecycle.on_ready(|_| async { Err::<(), _>("warmup failed") });
        lifecycle.on_ready(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Ok::<(), BoxError>(()) }
        });

        for handle in lifecycle.run_ready(&config()) {
            handle.await.unwrap();
        }
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_stop_hooks_run_in_order() {
        let lifecycle = Lifecycle::default();
        let log: Log = Arc::default();
        lifecycle.on_stop(recording(&log, "one"));
        lifecycle.on_stop(|_| async { Err::<(), _>("ignored") });
        lifecycle.on_stop(recording(&log, "three"));

        lifecycle.run_stop(config()).await;
        assert_eq!(*log.lock(), vec!["one", "three"]);
    }

    #[tokio::test]
    async fn test_reload_hooks_receive_new_config() {
        let metrics = Metrics::new(&MetricsConfig::default()).unwrap();
        let lifecycle = Lifecycle::new(Some(metrics.clone()));
        let seen = Arc::new(Mutex::new(String::new()));
        let sink = Arc::clone(&seen);
        lifecycle.on_reload(move |ctx: HookContext| {
            sink.lock().clone_from(&ctx.config.observability.logging.level);
            async { Ok::<(), BoxError>(()) }
        });

        let mut updated = ServiceConfig::default();
        updated.observability.logging.level = "debug".to_string();
        lifecycle.reload(Arc::new(updated)).await.unwrap();

        assert_eq!(*seen.lock(), "debug");
        assert!(metrics
            .gather()
            .contains("reloads_total{outcome=\"success\"} 1"));
    }

    #[tokio::test]
    async fn test_reload_failure_is_returned() {
        let metrics = Metrics::new(&MetricsConfig::default()).unwrap();
        let lifecycle = Lifecycle::new(Some(metrics.clone()));
        lifecycle.on_reload(|_| async { Err::<(), _>("bad pool size") });

        let error = lifecycle.reload(config()).await.unwrap_err();
        assert!(matches!(error, ServerError::ReloadHook { index: 0, .. }));
        assert!(metrics
            .gather()
            .contains("reloads_total{outcome=\"failure\"} 1"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_reloads_are_serialized() {
        let lifecycle = Arc::new(Lifecycle::default());
        let active = Arc::new(AtomicUsize::new(0));
        let overlapped = Arc::new(AtomicBool::new(false));

        let (a, o) = (Arc::clone(&active), Arc::clone(&overlapped));
        lifecycle.on_reload(move |_| {
            let (active, overlapped) = (Arc::clone(&a), Arc::clone(&o));
            async move {
                if active.fetch_add(1, Ordering::SeqCst) > 0 {
                    overlapped.store(true, Ordering::SeqCst);
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
                active.fetch_sub(1, Ordering::SeqCst);
                Ok::<(), BoxError>(())
            }
        });

        let tasks: Vec<_> = (0..4)
            .map(|_| {
                let lifecycle = Arc::clone(&lifecycle);
                tokio::spawn(async move { lifecycle.reload(config()).await })
            })
            .collect();
        for task in tasks {
            task.await.unwrap().unwrap();
        }
        assert!(!overlapped.load(Ordering::SeqCst));
    }
}
