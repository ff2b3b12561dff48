//! Error types for the server crate.
//!
//! [`ServerError`] covers startup, serving and lifecycle failures.
//! [`ApiError`] is what handlers and extractors return to clients.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use keel_config::ConfigError;
use keel_telemetry::TelemetryError;
use serde::Serialize;
use std::collections::BTreeMap;
use validator::{ValidationErrors, ValidationErrorsKind};

/// Boxed error returned by lifecycle hooks and health checks
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Result type for server operations.
pub type Result<T> = std::result::Result<T, ServerError>;

/// Server error
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    /// Configuration could not be loaded or validated
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Telemetry could not be initialized
    #[error(transparent)]
    Telemetry(#[from] TelemetryError),

    /// The listener could not be bound
    #[error("Failed to bind {address}: {source}")]
    Bind {
        /// Requested address
        address: String,
        /// Underlying I/O error
        #[source]
        source: std::io::Error,
    },

    /// The HTTP server stopped with an error
    #[error("Server error: {0}")]
    Serve(#[source] std::io::Error),

    /// A start hook failed; the server was not started
    #[error("Start hook #{index} failed: {source}")]
    StartHook {
        /// Registration index of the hook
        index: usize,
        /// Hook error
        #[source]
        source: BoxError,
    },

    /// A reload hook failed
    #[error("Reload hook #{index} failed: {source}")]
    ReloadHook {
        /// Registration index of the hook
        index: usize,
        /// Hook error
        #[source]
        source: BoxError,
    },

    /// Start hooks cannot be registered once the server has started
    #[error("Lifecycle is frozen; start hooks can no longer be registered")]
    LifecycleFrozen,

    /// An application route uses a path served by a framework endpoint
    #[error("Route {path} conflicts with a framework endpoint")]
    RouteConflict {
        /// Conflicting route path
        path: String,
    },
}

/// Error body returned to clients
#[derive(Debug, Clone, Serialize)]
pub struct ErrorBody {
    /// Machine-readable code
    pub code: String,
    /// Human-readable message
    pub message: String,
    /// Per-field details, when available
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

#[derive(Serialize)]
struct ErrorEnvelope<'a> {
    error: &'a ErrorBody,
}

/// HTTP error returned from handlers and extractors
#[derive(Debug, Clone)]
pub struct ApiError {
    status: StatusCode,
    body: ErrorBody,
}

impl ApiError {
    /// Create an error with an explicit status and code
    pub fn new(status: StatusCode, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            status,
            body: ErrorBody {
                code: code.into(),
                message: message.into(),
                details: None,
            },
        }
    }

    /// Attach structured details
    #[must_use]
    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.body.details = Some(details);
        self
    }

    /// 400 Bad Request
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "bad_request", message)
    }

    /// 401 Unauthorized
    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, "unauthorized", message)
    }

    /// 404 Not Found
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, "not_found", message)
    }

    /// 415 Unsupported Media Type
    pub fn unsupported_media_type(message: impl Into<String>) -> Self {
        Self::new(
            StatusCode::UNSUPPORTED_MEDIA_TYPE,
            "unsupported_media_type",
            message,
        )
    }

    /// 422 Unprocessable Entity
    pub fn unprocessable(message: impl Into<String>) -> Self {
        Self::new(StatusCode::UNPROCESSABLE_ENTITY, "validation_failed", message)
    }

    /// 503 Service Unavailable
    pub fn service_unavailable(message: impl Into<String>) -> Self {
        Self::new(
            StatusCode::SERVICE_UNAVAILABLE,
            "service_unavailable",
            message,
        )
    }

    /// 500 Internal Server Error
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "internal_error", message)
    }

    /// 422 with one entry per invalid field
    pub fn from_validation(errors: &ValidationErrors) -> Self {
        let mut fields = BTreeMap::new();
        collect_field_errors(errors, "", &mut fields);
        Self::unprocessable("Request validation failed").with_details(serde_json::json!(fields))
    }

    /// HTTP status
    #[must_use]
    pub fn status(&self) -> StatusCode {
        self.status
    }

    /// Error code
    #[must_use]
    pub fn code(&self) -> &str {
        &self.body.code
    }

    /// Error message
    #[must_use]
    pub fn message(&self) -> &str {
        &self.body.message
    }

    /// Structured details
    #[must_use]
    pub fn details(&self) -> Option<&serde_json::Value> {
        self.body.details.as_ref()
    }
}

impl std::fmt::Display for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({}): {}", self.status, self.body.code, self.body.message)
    }
}

impl std::error::Error for ApiError {}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            tracing::error!(code = %self.body.code, message = %self.body.message, "Request failed");
        }
        (self.status, Json(ErrorEnvelope { error: &self.body })).into_response()
    }
}

fn collect_field_errors(
    errors: &ValidationErrors,
    prefix: &str,
    out: &mut BTreeMap<String, Vec<String>>,
) {
    for (field, kind) in errors.errors() {
        let path = if prefix.is_empty() {
            field.to_string()
        } else {
            format!("{prefix}.{field}")
        };
        match kind {
            ValidationErrorsKind::Field(list) => {
                let messages = out.entry(path).or_default();
                messages.extend(list.iter().map(|e| {
                    e.message
                        .as_ref()
                        .map_or_else(|| e.code.to_string(), ToString::to_string)
                }));
            }
            ValidationErrorsKind::Struct(nested) => collect_field_errors(nested, &path, out),
            ValidationErrorsKind::List(items) => {
                for (index, nested) in items {
                    collect_field_errors(nested, &format!("{path}[{index}]"), out);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::BodyExt;
    use validator::Validate;

    #[derive(Validate)]
    struct Signup {
        #[validate(length(min = 3, message = "too short"))]
        username: String,
        #[validate(range(min = 18))]
        age: u32,
    }

    async fn body_json(error: ApiError) -> serde_json::Value {
        let response = error.into_response();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_error_envelope() {
        let error = ApiError::not_found("Order 42 not found");
        assert_eq!(error.status(), StatusCode::NOT_FOUND);

        let json = body_json(error).await;
        assert_eq!(json["error"]["code"], "not_found");
        assert_eq!(json["error"]["message"], "Order 42 not found");
        assert!(json["error"].get("details").is_none());
    }

    #[tokio::test]
    async fn test_from_validation_lists_fields() {
        let signup = Signup {
            username: "ab".to_string(),
            age: 12,
        };
        let errors = signup.validate().unwrap_err();
        let error = ApiError::from_validation(&errors);
        assert_eq!(error.status(), StatusCode::UNPROCESSABLE_ENTITY);

        let json = body_json(error).await;
        assert_eq!(json["error"]["code"], "validation_failed");
        assert_eq!(json["error"]["details"]["username"][0], "too short");
        assert_eq!(json["error"]["details"]["age"][0], "range");
    }

    #[test]
    fn test_helper_statuses() {
        assert_eq!(ApiError::bad_request("x").status(), StatusCode::BAD_REQUEST);
        assert_eq!(ApiError::unauthorized("x").status(), StatusCode::UNAUTHORIZED);
        assert_eq!(
            ApiError::unsupported_media_type("x").status(),
            StatusCode::UNSUPPORTED_MEDIA_TYPE
        );
        assert_eq!(
            ApiError::service_unavailable("x").status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(ApiError::internal("x").code(), "internal_error");
    }

    #[test]
    fn test_server_error_display() {
        let error = ServerError::StartHook {
            index: 2,
            source: "database unreachable".into(),
        };
        assert_eq!(error.to_string(), "Start hook #2 failed: database unreachable");
    }
}
