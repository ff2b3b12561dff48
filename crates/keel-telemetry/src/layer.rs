//! Tower middleware that drives the [`ObservabilityRecorder`].

use futures::FutureExt;
use http::{HeaderValue, Request, Response};
use http_body::Body;
use std::fmt::Display;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tower::{Layer, Service};
use tracing::Instrument;

use crate::recorder::{ObservabilityRecorder, TRACE_ID_HEADER};

/// Layer installing request observability around a service
#[derive(Debug, Clone)]
pub struct ObservabilityLayer {
    recorder: Arc<ObservabilityRecorder>,
}

impl ObservabilityLayer {
    /// Create a layer around a recorder
    #[must_use]
    pub fn new(recorder: ObservabilityRecorder) -> Self {
        Self {
            recorder: Arc::new(recorder),
        }
    }

    /// Recorder shared by every service this layer produces
    #[must_use]
    pub fn recorder(&self) -> &ObservabilityRecorder {
        &self.recorder
    }
}

impl<S> Layer<S> for ObservabilityLayer {
    type Service = ObservabilityService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        ObservabilityService {
            inner,
            recorder: Arc::clone(&self.recorder),
        }
    }
}

/// Observability middleware service.
#[derive(Debug, Clone)]
pub struct ObservabilityService<S> {
    inner: S,
    recorder: Arc<ObservabilityRecorder>,
}

impl<S, ReqBody, ResBody> Service<Request<ReqBody>> for ObservabilityService<S>
where
    S: Service<Request<ReqBody>, Response = Response<ResBody>> + Clone + Send + 'static,
    S::Future: Send + 'static,
    S::Error: Display,
    ReqBody: Send + 'static,
    ResBody: Body + Send + 'static,
{
    type Response = Response<ResBody>;
    type Error = S::Error;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, request: Request<ReqBody>) -> Self::Future {
        let recorder = Arc::clone(&self.recorder);
        // The readied service goes into the future; keep a fresh clone behind.
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);

        let Some(record) = recorder.on_request_start(&request) else {
            return Box::pin(inner.call(request));
        };
        let span = record.span().clone();

        Box::pin(
            async move {
                // Record panics as failed requests, then keep unwinding so an
                // outer catch-panic layer still builds the response.
                let outcome = AssertUnwindSafe(async move { inner.call(request).await })
                    .catch_unwind()
                    .await;
                let result = match outcome {
                    Ok(result) => result,
                    Err(panic) => {
                        recorder.on_request_failed(record, "handler panicked");
                        std::panic::resume_unwind(panic);
                    }
                };

                match result {
                    Ok(mut response) => {
                        if let Some(trace_id) = record.trace_id() {
                            if let Ok(value) = HeaderValue::from_str(&trace_id) {
                                response.headers_mut().insert(TRACE_ID_HEADER, value);
                            }
                        }
                        let bytes = response.body().size_hint().exact();
                        recorder.on_request_end(record, response.status(), bytes);
                        Ok(response)
                    }
                    Err(e) => {
                        recorder.on_request_failed(record, &e.to_string());
                        Err(e)
                    }
                }
            }
            .instrument(span),
        )
    }
}
