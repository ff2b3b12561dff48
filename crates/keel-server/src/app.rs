//! Application builder and assembled application.

use axum::{
    handler::Handler,
    response::{IntoResponse, Response},
    routing::{self, MethodRouter},
    Extension, Router,
};
use keel_config::{ConfigStore, ServiceConfig};
use keel_telemetry::{Metrics, MetricsConfig, ObservabilityLayer, ObservabilityRecorder, TelemetryGuard};
use std::any::Any;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Notify;
use tower_http::{
    catch_panic::CatchPanicLayer,
    limit::RequestBodyLimitLayer,
    request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer},
    timeout::TimeoutLayer,
};
use tracing::{debug, error};

use crate::debug::{DebugState, RouteInfo};
use crate::error::{ApiError, BoxError, Result, ServerError};
use crate::health::{HealthCheck, HealthChecker};
use crate::lifecycle::Lifecycle;
use crate::routes;
use crate::shutdown::{drain_layer, ShutdownConfig, ShutdownCoordinator};

type RouterFn = Box<dyn FnOnce(Router) -> Router + Send>;

/// State shared between a running [`App`] and its [`AppHandle`]s
pub(crate) struct Shared {
    pub(crate) store: Arc<ConfigStore>,
    pub(crate) lifecycle: Lifecycle,
    pub(crate) coordinator: Arc<ShutdownCoordinator>,
    pub(crate) health: Arc<HealthChecker>,
    pub(crate) shutdown: Notify,
}

impl Shared {
    /// Re-read the configuration source, when there is one, and run the
    /// reload hooks against the result
    pub(crate) async fn reload(&self) -> Result<Arc<ServiceConfig>> {
        let store = Arc::clone(&self.store);
        self.lifecycle
            .reload_with(move || store.reload_from_source().map_err(ServerError::from))
            .await
    }
}

/// Builder for an [`App`]
pub struct AppBuilder {
    config: ServiceConfig,
    config_source: Option<PathBuf>,
    router: Router,
    routes: Vec<RouteInfo>,
    extensions: Vec<RouterFn>,
    health: HealthChecker,
    lifecycle: Lifecycle,
    metrics: Option<Metrics>,
    shutdown: Option<ShutdownConfig>,
    telemetry: Option<TelemetryGuard>,
    error: Option<ServerError>,
}

impl std::fmt::Debug for AppBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppBuilder")
            .field("service", &self.config.service.name)
            .field("routes", &self.routes)
            .field("lifecycle", &self.lifecycle)
            .finish_non_exhaustive()
    }
}

macro_rules! method_helper {
    ($name:ident, $method:literal) => {
        #[doc = concat!("Route `", $method, "` requests on `path` to `handler`")]
        #[must_use]
        pub fn $name<H, T>(mut self, path: &str, handler: H) -> Self
        where
            H: Handler<T, ()>,
            T: 'static,
        {
            self.routes.push(RouteInfo::new(&[$method], path));
            self.router = self.router.route(path, routing::$name(handler));
            self
        }
    };
}

impl AppBuilder {
    fn new(config: ServiceConfig) -> Self {
        let health = HealthChecker::new(config.health.clone(), config.service.version.clone());
        Self {
            config,
            config_source: None,
            router: Router::new(),
            routes: Vec::new(),
            extensions: Vec::new(),
            health,
            lifecycle: Lifecycle::default(),
            metrics: None,
            shutdown: None,
            telemetry: None,
            error: None,
        }
    }

    /// Add a method router on `path`. It is listed with method `*` on the
    /// debug routes endpoint.
    #[must_use]
    pub fn route(mut self, path: &str, method_router: MethodRouter) -> Self {
        self.routes.push(RouteInfo::new(&["*"], path));
        self.router = self.router.route(path, method_router);
        self
    }

    method_helper!(get, "GET");
    method_helper!(post, "POST");
    method_helper!(put, "PUT");
    method_helper!(patch, "PATCH");
    method_helper!(delete, "DELETE");

    /// Merge another router. Its routes are served but not listed on the
    /// debug routes endpoint.
    #[must_use]
    pub fn merge(mut self, router: Router) -> Self {
        self.router = self.router.merge(router);
        self
    }

    /// Nest a router under `prefix`
    #[must_use]
    pub fn nest(mut self, prefix: &str, router: Router) -> Self {
        self.routes.push(RouteInfo::new(
            &["*"],
            format!("{}/*", prefix.trim_end_matches('/')),
        ));
        self.router = self.router.nest(prefix, router);
        self
    }

    /// Make `value` available to handlers through [`Extension`]
    #[must_use]
    pub fn extension<T>(mut self, value: T) -> Self
    where
        T: Clone + Send + Sync + 'static,
    {
        self.extensions
            .push(Box::new(move |router: Router| router.layer(Extension(value))));
        self
    }

    /// Add a liveness check
    #[must_use]
    pub fn liveness_check(mut self, check: impl HealthCheck + 'static) -> Self {
        self.health.add_liveness(check);
        self
    }

    /// Add a readiness check
    #[must_use]
    pub fn readiness_check(mut self, check: impl HealthCheck + 'static) -> Self {
        self.health.add_readiness(check);
        self
    }

    /// Run `hook` before the listener is bound. A failure aborts startup.
    #[must_use]
    pub fn on_start<F, Fut, E>(mut self, hook: F) -> Self
    where
        F: Fn(crate::HookContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<(), E>> + Send + 'static,
        E: Into<BoxError>,
    {
        if let Err(e) = self.lifecycle.on_start(hook) {
            self.error.get_or_insert(e);
        }
        self
    }

    /// Run `hook` once the server is accepting connections
    #[must_use]
    pub fn on_ready<F, Fut, E>(self, hook: F) -> Self
    where
        F: Fn(crate::HookContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<(), E>> + Send + 'static,
        E: Into<BoxError>,
    {
        self.lifecycle.on_ready(hook);
        self
    }

    /// Run `hook` when shutdown begins, newest first
    #[must_use]
    pub fn on_shutdown<F, Fut, E>(self, hook: F) -> Self
    where
        F: Fn(crate::HookContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<(), E>> + Send + 'static,
        E: Into<BoxError>,
    {
        self.lifecycle.on_shutdown(hook);
        self
    }

    /// Run `hook` after the server has stopped
    #[must_use]
    pub fn on_stop<F, Fut, E>(self, hook: F) -> Self
    where
        F: Fn(crate::HookContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<(), E>> + Send + 'static,
        E: Into<BoxError>,
    {
        self.lifecycle.on_stop(hook);
        self
    }

    /// Run `hook` with the new configuration on every reload
    #[must_use]
    pub fn on_reload<F, Fut, E>(self, hook: F) -> Self
    where
        F: Fn(crate::HookContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<(), E>> + Send + 'static,
        E: Into<BoxError>,
    {
        self.lifecycle.on_reload(hook);
        self
    }

    /// Use `metrics` instead of a registry created from the configuration
    #[must_use]
    pub fn metrics(mut self, metrics: Metrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// File the configuration was loaded from; SIGHUP re-reads it
    #[must_use]
    pub fn config_source(mut self, path: impl Into<PathBuf>) -> Self {
        self.config_source = Some(path.into());
        self
    }

    /// Override the shutdown settings derived from the configuration
    #[must_use]
    pub fn shutdown_config(mut self, config: ShutdownConfig) -> Self {
        self.shutdown = Some(config);
        self
    }

    /// Flush `guard` once the server has stopped
    #[must_use]
    pub fn telemetry(mut self, guard: TelemetryGuard) -> Self {
        self.telemetry = Some(guard);
        self
    }

    /// Validate the configuration and assemble the application
    ///
    /// # Errors
    /// Returns error if the configuration is invalid, the metrics registry
    /// cannot be created, a hook could not be registered, or a route
    /// collides with a framework endpoint
    pub fn build(self) -> Result<App> {
        if let Some(e) = self.error {
            return Err(e);
        }
        self.config.validate()?;

        let metrics = match self.metrics {
            Some(metrics) => Some(metrics),
            None if self.config.observability.metrics.enabled => Some(Metrics::new(
                &MetricsConfig::from_service_config(&self.config),
            )?),
            None => None,
        };
        let lifecycle = match &metrics {
            Some(metrics) => self.lifecycle.with_metrics(metrics.clone()),
            None => self.lifecycle,
        };

        let shutdown = self
            .shutdown
            .unwrap_or_else(|| ShutdownConfig::from_service_config(&self.config));
        let coordinator = Arc::new(ShutdownCoordinator::new(shutdown));
        let recorder = ObservabilityRecorder::from_service_config(&self.config, metrics.clone())?;

        let reserved = routes::reserved_paths(&self.config, metrics.is_some());
        if let Some(route) = self.routes.iter().find(|r| reserved.contains(&r.path)) {
            return Err(ServerError::RouteConflict {
                path: route.path.clone(),
            });
        }

        let config = self.config;
        let store = Arc::new(match self.config_source {
            Some(path) => ConfigStore::with_source(config.clone(), path),
            None => ConfigStore::new(config.clone()),
        });
        let health = Arc::new(self.health);

        let debug = DebugState::new(Arc::clone(&store), Arc::clone(&coordinator), self.routes);
        let framework = routes::framework_routes(&config, Arc::clone(&health), metrics, debug);

        let application = self
            .extensions
            .into_iter()
            .fold(self.router, |router, apply| apply(router))
            .layer(RequestBodyLimitLayer::new(config.server.max_body_bytes))
            .layer(TimeoutLayer::new(config.server.request_timeout))
            .layer(drain_layer(Arc::clone(&coordinator)));

        let router = application
            .merge(framework)
            .layer(ObservabilityLayer::new(recorder))
            .layer(PropagateRequestIdLayer::x_request_id())
            .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
            .layer(CatchPanicLayer::custom(panic_response));

        debug!(service = %config.service.name, "Application assembled");

        Ok(App {
            router,
            shared: Arc::new(Shared {
                store,
                lifecycle,
                coordinator,
                health,
                shutdown: Notify::new(),
            }),
            telemetry: self.telemetry,
        })
    }
}

fn panic_response(panic: Box<dyn Any + Send + 'static>) -> Response {
    let detail = panic
        .downcast_ref::<String>()
        .map(String::as_str)
        .or_else(|| panic.downcast_ref::<&str>().copied())
        .unwrap_or("unknown panic");
    error!(panic = %detail, "Handler panicked");
    ApiError::internal("Internal server error").into_response()
}

/// An assembled service: router, lifecycle, health and shutdown state
pub struct App {
    pub(crate) router: Router,
    pub(crate) shared: Arc<Shared>,
    pub(crate) telemetry: Option<TelemetryGuard>,
}

impl std::fmt::Debug for App {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("App")
            .field("service", &self.shared.store.current().service.name)
            .field("lifecycle", &self.shared.lifecycle)
            .finish_non_exhaustive()
    }
}

impl App {
    /// Start building an application for `config`
    #[must_use]
    pub fn builder(config: ServiceConfig) -> AppBuilder {
        AppBuilder::new(config)
    }

    /// The assembled router with every framework layer and endpoint
    #[must_use]
    pub fn router(&self) -> Router {
        self.router.clone()
    }

    /// Configuration currently in effect
    #[must_use]
    pub fn config(&self) -> Arc<ServiceConfig> {
        self.shared.store.current()
    }

    /// Hook registry. Shutdown, stop and reload hooks may still be added
    /// after the server has started.
    #[must_use]
    pub fn lifecycle(&self) -> &Lifecycle {
        &self.shared.lifecycle
    }

    /// Health checker behind the liveness and readiness endpoints
    #[must_use]
    pub fn health(&self) -> Arc<HealthChecker> {
        Arc::clone(&self.shared.health)
    }

    /// Handle for controlling the application while it runs
    #[must_use]
    pub fn handle(&self) -> AppHandle {
        AppHandle {
            shared: Arc::clone(&self.shared),
        }
    }
}

/// Programmatic control over a running [`App`]
#[derive(Clone)]
pub struct AppHandle {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for AppHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppHandle")
            .field("phase", &self.shared.coordinator.current_phase())
            .finish_non_exhaustive()
    }
}

impl AppHandle {
    /// Begin graceful shutdown, as SIGTERM would
    pub fn shutdown(&self) {
        self.shared.shutdown.notify_one();
    }

    /// Reload the configuration and run the reload hooks, as SIGHUP would
    ///
    /// # Errors
    /// Returns error if the configuration source is invalid or a reload
    /// hook fails
    pub async fn reload(&self) -> Result<Arc<ServiceConfig>> {
        self.shared.reload().await
    }

    /// Shutdown coordinator of the application
    #[must_use]
    pub fn coordinator(&self) -> Arc<ShutdownCoordinator> {
        Arc::clone(&self.shared.coordinator)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::health::check_fn;
    use axum::{
        body::Body,
        http::{Request, StatusCode},
    };
    use http_body_util::BodyExt;
    use keel_telemetry::REQUEST_ID_HEADER;
    use std::time::Duration;
    use tower::ServiceExt;

    fn config() -> ServiceConfig {
        ServiceConfig::builder("orders")
            .with_version("1.2.3")
            .with_debug_endpoints()
            .build()
            .unwrap()
    }

    async fn call(app: &App, uri: &str) -> (StatusCode, axum::http::HeaderMap, String) {
        let response = app
            .router()
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let headers = response.headers().clone();
        let body = response.into_body().collect().await.unwrap().to_bytes();
        (status, headers, String::from_utf8_lossy(&body).into_owned())
    }

    #[tokio::test]
    async fn test_routes_are_served_with_request_id() {
        let app = App::builder(config())
            .get("/orders/:id", || async { "order" })
            .build()
            .unwrap();

        let (status, headers, body) = call(&app, "/orders/1").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "order");
        assert!(headers.contains_key(REQUEST_ID_HEADER));
    }

    #[tokio::test]
    async fn test_debug_routes_list_builder_routes() {
        let app = App::builder(config())
            .get("/orders/:id", || async { "order" })
            .post("/orders", || async { "created" })
            .route("/status", routing::get(|| async { "ok" }))
            .nest("/admin", Router::new().route("/stats", routing::get(|| async { "" })))
            .build()
            .unwrap();

        let (status, _, body) = call(&app, "/debug/routes").await;
        assert_eq!(status, StatusCode::OK);
        let routes: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(routes[0]["path"], "/orders/:id");
        assert_eq!(routes[0]["methods"][0], "GET");
        assert_eq!(routes[1]["methods"][0], "POST");
        assert_eq!(routes[2]["methods"][0], "*");
        assert_eq!(routes[3]["path"], "/admin/*");
    }

    #[tokio::test]
    async fn test_extension_reaches_handlers() {
        #[derive(Clone)]
        struct Greeting(&'static str);

        let app = App::builder(config())
            .get("/hello", |Extension(g): Extension<Greeting>| async move { g.0 })
            .extension(Greeting("hi"))
            .build()
            .unwrap();

        let (status, _, body) = call(&app, "/hello").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "hi");
    }

    #[tokio::test]
    async fn test_panicking_handler_returns_500() {
        async fn boom() -> &'static str {
            panic!("kaboom")
        }

        let metrics = Metrics::new(&MetricsConfig::default()).unwrap();
        let app = App::builder(config())
            .get("/boom", boom)
            .metrics(metrics.clone())
            .build()
            .unwrap();

        let (status, _, body) = call(&app, "/boom").await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(body.contains("internal_error"));
        assert_eq!(metrics.request_count("GET", "/boom", 500), 1);
        assert_eq!(metrics.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_readiness_check_is_wired() {
        let app = App::builder(config())
            .readiness_check(check_fn("database", || async { Err("down".to_string()) }))
            .build()
            .unwrap();

        let (status, _, body) = call(&app, "/readyz").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert!(body.contains("database"));

        let (status, _, _) = call(&app, "/healthz").await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_slow_handler_times_out() {
        let config = ServiceConfig::builder("orders")
            .with_request_timeout(Duration::from_millis(20))
            .build()
            .unwrap();
        let app = App::builder(config)
            .get("/slow", || async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                "late"
            })
            .build()
            .unwrap();

        let (status, _, _) = call(&app, "/slow").await;
        assert_eq!(status, StatusCode::REQUEST_TIMEOUT);
    }

    #[tokio::test]
    async fn test_oversized_body_is_rejected() {
        let config = ServiceConfig::builder("orders")
            .with_max_body_bytes(16)
            .build()
            .unwrap();
        let app = App::builder(config)
            .post("/echo", |body: String| async move { body })
            .build()
            .unwrap();

        let response = app
            .router()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/echo")
                    .header("content-length", "64")
                    .body(Body::from("x".repeat(64)))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
    }

    #[tokio::test]
    async fn test_requests_are_recorded_by_route_template() {
        let metrics = Metrics::new(&MetricsConfig::default()).unwrap();
        let app = App::builder(config())
            .get("/orders/:id", || async { "order" })
            .metrics(metrics.clone())
            .build()
            .unwrap();

        call(&app, "/orders/1").await;
        call(&app, "/orders/2").await;
        call(&app, "/healthz").await;

        assert_eq!(metrics.request_count("GET", "/orders/:id", 200), 2);
        assert_eq!(metrics.request_count("GET", "/healthz", 200), 0);
    }

    #[tokio::test]
    async fn test_invalid_config_fails_build() {
        let mut config = ServiceConfig::default();
        config.server.port = 0;
        assert!(matches!(
            App::builder(config).build(),
            Err(ServerError::Config(_))
        ));
    }

    #[test]
    fn test_route_on_framework_path_fails_build() {
        for path in ["/metrics", "/healthz", "/readyz", "/debug/info"] {
            let result = App::builder(config()).get(path, || async { "mine" }).build();
            assert!(
                matches!(&result, Err(ServerError::RouteConflict { path: p }) if p == path),
                "{path} should conflict"
            );
        }
    }

    #[test]
    fn test_framework_path_free_when_endpoint_disabled() {
        let mut config = config();
        config.observability.metrics.enabled = false;
        config.debug.enabled = false;

        let app = App::builder(config)
            .get("/metrics", || async { "mine" })
            .get("/debug/info", || async { "mine" })
            .build();
        assert!(app.is_ok());
    }

    #[tokio::test]
    async fn test_draining_rejects_application_routes() {
        let app = App::builder(config())
            .get("/orders", || async { "orders" })
            .build()
            .unwrap();
        app.handle().coordinator().trigger_shutdown("test").await;

        let (status, headers, body) = call(&app, "/orders").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(headers["connection"], "close");
        assert!(body.contains("shutting_down"));
    }
}
