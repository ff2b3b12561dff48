//! Request binding and validation extractors.
//!
//! `ValidatedJson`, `ValidatedQuery` and `ValidatedPath` deserialize with
//! axum's extractors and then run [`validator::Validate`]. Rejections are
//! mapped onto [`ApiError`] so every binding failure has the same JSON shape:
//!
//! | Failure | Status |
//! |---|---|
//! | missing or wrong `Content-Type` | 415 |
//! | malformed body or query string | 400 |
//! | validation rules | 422 |

use axum::{
    async_trait,
    extract::{
        rejection::{JsonRejection, PathRejection, QueryRejection},
        ConnectInfo, FromRequest, FromRequestParts, MatchedPath, Path, Query, Request,
    },
    http::{header, request::Parts},
    response::IntoResponse,
    Json,
};
use keel_telemetry::{client_ip, current_trace_id, REQUEST_ID_HEADER};
use serde::de::DeserializeOwned;
use std::net::SocketAddr;
use tracing::debug;
use validator::Validate;

use crate::error::ApiError;

/// JSON body that has been deserialized and validated
#[derive(Debug, Clone, Copy, Default)]
pub struct ValidatedJson<T>(pub T);

#[async_trait]
impl<T, S> FromRequest<S> for ValidatedJson<T>
where
    T: DeserializeOwned + Validate,
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let Json(value) = Json::<T>::from_request(req, state)
            .await
            .map_err(json_rejection)?;
        validate(value).map(Self)
    }
}

impl<T> IntoResponse for ValidatedJson<T>
where
    T: serde::Serialize,
{
    fn into_response(self) -> axum::response::Response {
        Json(self.0).into_response()
    }
}

/// Query string that has been deserialized and validated
#[derive(Debug, Clone, Copy, Default)]
pub struct ValidatedQuery<T>(pub T);

#[async_trait]
impl<T, S> FromRequestParts<S> for ValidatedQuery<T>
where
    T: DeserializeOwned + Validate,
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let Query(value) = Query::<T>::from_request_parts(parts, state)
            .await
            .map_err(|rejection: QueryRejection| {
                debug!(error = %rejection.body_text(), "Query rejected");
                ApiError::bad_request(rejection.body_text())
            })?;
        validate(value).map(Self)
    }
}

/// Path parameters that have been deserialized and validated
#[derive(Debug, Clone, Copy, Default)]
pub struct ValidatedPath<T>(pub T);

#[async_trait]
impl<T, S> FromRequestParts<S> for ValidatedPath<T>
where
    T: DeserializeOwned + Validate + Send,
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let Path(value) = Path::<T>::from_request_parts(parts, state)
            .await
            .map_err(path_rejection)?;
        validate(value).map(Self)
    }
}

fn validate<T: Validate>(value: T) -> Result<T, ApiError> {
    value.validate().map_err(|errors| {
        debug!(errors = %errors, "Validation failed");
        ApiError::from_validation(&errors)
    })?;
    Ok(value)
}

fn json_rejection(rejection: JsonRejection) -> ApiError {
    debug!(error = %rejection.body_text(), "JSON body rejected");
    match rejection {
        JsonRejection::MissingJsonContentType(_) => ApiError::unsupported_media_type(
            "Expected request with `Content-Type: application/json`",
        ),
        JsonRejection::JsonDataError(e) => ApiError::bad_request(e.body_text()),
        JsonRejection::JsonSyntaxError(e) => ApiError::bad_request(e.body_text()),
        other => ApiError::new(other.status(), "invalid_body", other.body_text()),
    }
}

fn path_rejection(rejection: PathRejection) -> ApiError {
    debug!(error = %rejection.body_text(), "Path parameters rejected");
    match rejection {
        PathRejection::FailedToDeserializePathParams(e) => ApiError::bad_request(e.body_text()),
        other => ApiError::new(other.status(), "invalid_path", other.body_text()),
    }
}

/// Request metadata available to every handler
#[derive(Debug, Clone)]
pub struct RequestContext {
    /// Request id from `x-request-id`, or a fresh UUID
    pub request_id: String,
    /// Client address
    pub client_ip: Option<String>,
    /// Matched route template
    pub route: Option<String>,
    /// `User-Agent` header
    pub user_agent: Option<String>,
    /// Trace id of the request span, when tracing is active
    pub trace_id: Option<String>,
}

#[async_trait]
impl<S> FromRequestParts<S> for RequestContext
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let request_id = parts
            .headers
            .get(REQUEST_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .filter(|v| !v.is_empty())
            .map_or_else(|| uuid::Uuid::new_v4().to_string(), String::from);

        Ok(Self {
            request_id,
            client_ip: client_ip(&parts.headers, &parts.extensions),
            route: parts
                .extensions
                .get::<MatchedPath>()
                .map(|m| m.as_str().to_string()),
            user_agent: parts
                .headers
                .get(header::USER_AGENT)
                .and_then(|v| v.to_str().ok())
                .map(String::from),
            trace_id: current_trace_id(),
        })
    }
}

/// Socket peer address, when the server was started with connect info
#[derive(Debug, Clone, Copy)]
pub struct PeerAddr(pub Option<SocketAddr>);

#[async_trait]
impl<S> FromRequestParts<S> for PeerAddr
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        Ok(Self(
            parts
                .extensions
                .get::<ConnectInfo<SocketAddr>>()
                .map(|ConnectInfo(addr)| *addr),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{
        body::Body,
        http::{Method, StatusCode},
        routing::{get, post},
        Router,
    };
    use http_body_util::BodyExt;
    use serde::{Deserialize, Serialize};
    use tower::ServiceExt;

    #[derive(Debug, Serialize, Deserialize, Validate)]
    struct CreateOrder {
        #[validate(length(min = 1, max = 64))]
        sku: String,
        #[validate(range(min = 1, max = 100))]
        quantity: u32,
    }

    #[derive(Debug, Deserialize, Validate)]
    struct Paging {
        #[validate(range(max = 500))]
        limit: u32,
    }

    #[derive(Debug, Deserialize, Validate)]
    struct OrderPath {
        #[validate(range(min = 1))]
        id: u64,
    }

    fn app() -> Router {
        Router::new()
            .route(
                "/orders",
                post(|ValidatedJson(order): ValidatedJson<CreateOrder>| async move {
                    ValidatedJson(order)
                })
                .get(|ValidatedQuery(paging): ValidatedQuery<Paging>| async move {
                    paging.limit.to_string()
                }),
            )
            .route(
                "/orders/:id",
                get(|ValidatedPath(path): ValidatedPath<OrderPath>| async move {
                    path.id.to_string()
                }),
            )
            .route(
                "/whoami",
                get(|ctx: RequestContext| async move {
                    format!("{}|{}", ctx.request_id, ctx.route.unwrap_or_default())
                }),
            )
    }

    async fn send(request: Request) -> (StatusCode, String) {
        let response = app().oneshot(request).await.unwrap();
        let status = response.status();
        let body = response.into_body().collect().await.unwrap().to_bytes();
        (status, String::from_utf8(body.to_vec()).unwrap())
    }

    fn json_post(body: &str) -> Request {
        Request::builder()
            .method(Method::POST)
            .uri("/orders")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn get_request(uri: &str) -> Request {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn test_valid_json_body() {
        let (status, body) = send(json_post(r#"{"sku":"A-1","quantity":2}"#)).await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.contains("\"quantity\":2"));
    }

    #[tokio::test]
    async fn test_missing_content_type_is_415() {
        let request = Request::builder()
            .method(Method::POST)
            .uri("/orders")
            .body(Body::from(r#"{"sku":"A-1","quantity":2}"#))
            .unwrap();
        let (status, body) = send(request).await;
        assert_eq!(status, StatusCode::UNSUPPORTED_MEDIA_TYPE);
        assert!(body.contains("unsupported_media_type"));
    }

    #[tokio::test]
    async fn test_malformed_json_is_400() {
        let (status, body) = send(json_post(r#"{"sku": "A-1","#)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body.contains("bad_request"));

        let (status, _) = send(json_post(r#"{"sku":"A-1","quantity":"two"}"#)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_invalid_json_is_422_with_fields() {
        let (status, body) = send(json_post(r#"{"sku":"","quantity":500}"#)).await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        let json: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(json["error"]["code"], "validation_failed");
        assert!(json["error"]["details"]["sku"].is_array());
        assert!(json["error"]["details"]["quantity"].is_array());
    }

    #[tokio::test]
    async fn test_query_binding() {
        let (status, body) = send(get_request("/orders?limit=50")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "50");

        let (status, _) = send(get_request("/orders?limit=abc")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = send(get_request("/orders?limit=1000")).await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    }

    #[tokio::test]
    async fn test_path_binding() {
        let (status, body) = send(get_request("/orders/7")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "7");

        let (status, _) = send(get_request("/orders/seven")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = send(get_request("/orders/0")).await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    }

    #[tokio::test]
    async fn test_request_context() {
        let request = Request::builder()
            .uri("/whoami")
            .header(REQUEST_ID_HEADER, "req-123")
            .body(Body::empty())
            .unwrap();
        let (_, body) = send(request).await;
        assert_eq!(body, "req-123|/whoami");

        let (_, body) = send(get_request("/whoami")).await;
        let (id, route) = body.split_once('|').unwrap();
        assert!(uuid::Uuid::parse_str(id).is_ok());
        assert_eq!(route, "/whoami");
    }
}
