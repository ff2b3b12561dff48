//! Serving an [`App`]: startup, signal handling, reload and graceful
//! shutdown.

use std::future::IntoFuture;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::app::{App, Shared};
use crate::error::{Result, ServerError};
use crate::shutdown::{Signal, Signals};

/// Why the control loop stopped
enum Stop {
    Signal(Signal),
    Requested,
    ServerExited(std::io::Result<()>),
}

impl Stop {
    fn reason(&self) -> &'static str {
        match self {
            Self::Signal(signal) => signal.as_str(),
            Self::Requested => "shutdown requested",
            Self::ServerExited(_) => "server exited",
        }
    }
}

impl App {
    /// Run start hooks, bind the configured address and serve until shutdown
    ///
    /// # Errors
    /// Returns error if a start hook fails, the address cannot be bound or
    /// the server fails while serving
    pub async fn run(self) -> Result<()> {
        self.start().await?;

        let addr = self.shared.store.current().socket_addr()?;
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| ServerError::Bind {
                address: addr.to_string(),
                source,
            })?;

        self.serve(listener).await
    }

    /// Like [`App::run`] but serves on an already bound listener
    ///
    /// # Errors
    /// Returns error if a start hook fails or the server fails while serving
    pub async fn run_with_listener(self, listener: TcpListener) -> Result<()> {
        self.start().await?;
        self.serve(listener).await
    }

    async fn start(&self) -> Result<()> {
        self.shared.lifecycle.freeze();
        self.shared
            .lifecycle
            .run_start(self.shared.store.current())
            .await
    }

    async fn serve(self, listener: TcpListener) -> Result<()> {
        let Self {
            router,
            shared,
            telemetry,
        } = self;
        let config = shared.store.current();
        let local_addr = listener.local_addr().map_err(ServerError::Serve)?;

        let (stop_tx, stop_rx) = oneshot::channel::<()>();
        let mut server: JoinHandle<std::io::Result<()>> = tokio::spawn(
            axum::serve(
                listener,
                router.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .with_graceful_shutdown(async move {
                let _ = stop_rx.await;
            })
            .into_future(),
        );

        info!(
            service = %config.service.name,
            version = %config.service.version,
            address = %local_addr,
            "Server listening"
        );

        for handle in shared.lifecycle.run_ready(&config) {
            shared.coordinator.register_task(handle).await;
        }

        let stop = control_loop(&shared, &mut server).await?;
        info!(reason = stop.reason(), "Shutting down");
        let started = Instant::now();
        let budget = shared.store.current().server.shutdown_timeout;

        shared.health.mark_shutting_down();
        let drain = {
            let coordinator = Arc::clone(&shared.coordinator);
            let reason = stop.reason();
            tokio::spawn(async move { coordinator.trigger_shutdown(reason).await })
        };

        let report = shared
            .lifecycle
            .run_shutdown(shared.store.current(), budget)
            .await;
        if !report.is_clean() {
            warn!(
                failed = report.failed,
                timed_out = report.timed_out,
                "Some shutdown hooks did not complete"
            );
        }

        let _ = stop_tx.send(());
        let served = match stop {
            Stop::ServerExited(outcome) => outcome,
            Stop::Signal(_) | Stop::Requested => {
                await_server(server, budget.saturating_sub(started.elapsed())).await
            }
        };

        await_drain(drain, budget.saturating_sub(started.elapsed())).await;

        shared.lifecycle.run_stop(shared.store.current()).await;

        if let Some(guard) = telemetry {
            guard.shutdown();
        }
        info!(elapsed_ms = started.elapsed().as_millis(), "Server stopped");

        served.map_err(ServerError::Serve)
    }
}

/// Wait for a shutdown trigger, handling reloads in the meantime
async fn control_loop(
    shared: &Arc<Shared>,
    server: &mut JoinHandle<std::io::Result<()>>,
) -> Result<Stop> {
    let mut signals = Signals::new().map_err(ServerError::Serve)?;

    loop {
        tokio::select! {
            signal = signals.recv() => {
                if signal.is_shutdown() {
                    return Ok(Stop::Signal(signal));
                }
                let shared = Arc::clone(shared);
                tokio::spawn(async move {
                    // Reload failures are logged by the lifecycle.
                    let _ = shared.reload().await;
                });
            }
            () = shared.shutdown.notified() => return Ok(Stop::Requested),
            joined = &mut *server => {
                let outcome = joined.unwrap_or_else(|e| Err(std::io::Error::other(e)));
                if let Err(e) = &outcome {
                    error!(error = %e, "Server exited unexpectedly");
                }
                return Ok(Stop::ServerExited(outcome));
            }
        }
    }
}

/// Wait for the coordinator to finish draining, giving up after `limit`
async fn await_drain(mut drain: JoinHandle<()>, limit: Duration) {
    match tokio::time::timeout(limit, &mut drain).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!(error = %e, "Drain task failed"),
        Err(_) => {
            warn!(limit_ms = limit.as_millis(), "Drain still running after the shutdown timeout");
            drain.abort();
        }
    }
}

/// Wait for open connections to finish, aborting the server after `limit`
async fn await_server(
    mut server: JoinHandle<std::io::Result<()>>,
    limit: Duration,
) -> std::io::Result<()> {
    match tokio::time::timeout(limit, &mut server).await {
        Ok(Ok(outcome)) => outcome,
        Ok(Err(e)) => Err(std::io::Error::other(e)),
        Err(_) => {
            warn!(
                limit_ms = limit.as_millis(),
                "Connections still open after the shutdown timeout, closing"
            );
            server.abort();
            debug!("Server task aborted");
            Ok(())
        }
    }
}
