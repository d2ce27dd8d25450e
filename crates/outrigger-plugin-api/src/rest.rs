//! REST binding for the dispatcher.
//!
//! A single fallback handler resolves `(verb, path)` against the live
//! endpoint table on every request, so endpoints added or removed at runtime
//! are served without rebuilding the router.

use crate::dispatch::Dispatcher;
use crate::endpoint::Action;
use crate::error::PluginError;
use crate::message::{MultiMap, Request, META_PATH, META_PROTOCOL};
use axum::body::Bytes;
use axum::extract::{Query, State};
use axum::http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{error, warn};

/// Error body returned by every REST surface.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// Error code
    pub error: String,

    /// Human-readable error message
    pub message: String,

    /// Timestamp
    pub timestamp: DateTime<Utc>,
}

impl ErrorResponse {
    pub fn new(error: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            message: message.into(),
            timestamp: Utc::now(),
        }
    }
}

/// REST rendering of a [`PluginError`].
#[derive(Debug)]
pub struct RestError(pub PluginError);

impl From<PluginError> for RestError {
    fn from(err: PluginError) -> Self {
        Self(err)
    }
}

impl IntoResponse for RestError {
    fn into_response(self) -> Response {
        let status =
            StatusCode::from_u16(self.0.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        if status.is_server_error() {
            error!(error = %self.0, "Endpoint call failed");
        }
        let body = Json(ErrorResponse::new(self.0.error_code(), self.0.to_string()));
        (status, body).into_response()
    }
}

/// Router whose fallback serves every endpoint known to `dispatcher`.
pub fn router(dispatcher: Arc<Dispatcher>) -> Router {
    Router::new().fallback(shim).with_state(dispatcher)
}

/// Converts wire headers into the multi-valued map endpoints receive.
pub fn headers_to_map(headers: &HeaderMap) -> MultiMap {
    let mut map = MultiMap::new();
    for (name, value) in headers {
        if let Ok(value) = value.to_str() {
            map.entry(name.as_str().to_string())
                .or_default()
                .push(value.to_string());
        }
    }
    map
}

async fn shim(
    State(dispatcher): State<Arc<Dispatcher>>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    Query(query): Query<Vec<(String, String)>>,
    body: Bytes,
) -> Result<Response, RestError> {
    let action = Action::from_http_method(&method)?;

    let mut parameters = MultiMap::new();
    for (name, value) in query {
        parameters.entry(name).or_default().push(value);
    }

    let request = Request {
        headers: headers_to_map(&headers),
        parameters,
        body: body.to_vec(),
        ..Request::default()
    }
    .with_metadata(META_PATH, uri.path())
    .with_metadata(META_PROTOCOL, "rest");

    let response = dispatcher.dispatch(action, uri.path(), request).await?;
    Ok(into_http(response))
}

/// Writes an endpoint response onto the wire: headers first, then the value.
pub fn into_http(response: crate::message::Response) -> Response {
    let mut out = Response::new(axum::body::Body::from(response.value));
    let wire = out.headers_mut();
    for (name, values) in response.headers {
        let Ok(name) = HeaderName::try_from(name.as_str()) else {
            warn!(header = %name, "Dropping invalid response header name");
            continue;
        };
        for value in values {
            match HeaderValue::try_from(value.as_str()) {
                Ok(value) => {
                    wire.append(name.clone(), value);
                }
                Err(_) => warn!(header = %name, "Dropping invalid response header value"),
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::StaticResolver;
    use crate::endpoint::Endpoint;
    use axum::body::Body;
    use tower::ServiceExt;

    fn app() -> Router {
        let endpoints = vec![
            Endpoint::new(Action::Read, "/hello/hello", |req: Request| async move {
                let name = req.parameter("name").unwrap_or("world").to_string();
                crate::message::Response::json(&serde_json::json!({ "message": format!("hello {name}") }))
            }),
            Endpoint::new(Action::Create, "/hello/echo", |req: Request| async move {
                Ok(crate::message::Response::from_bytes(req.body)
                    .with_header("x-echo", "1")
                    .with_header("x-echo", "2"))
            }),
        ];
        let resolver = StaticResolver::new(endpoints).unwrap();
        router(Arc::new(Dispatcher::new(Arc::new(resolver))))
    }

    #[tokio::test]
    async fn test_get_returns_json() {
        let response = app()
            .oneshot(
                axum::http::Request::builder()
                    .uri("/hello/hello?name=outrigger")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()["content-type"], "application/json");
        let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["message"], "hello outrigger");
    }

    #[tokio::test]
    async fn test_post_copies_headers_and_body() {
        let response = app()
            .oneshot(
                axum::http::Request::builder()
                    .method("POST")
                    .uri("/hello/echo")
                    .body(Body::from("payload"))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let echoed: Vec<_> = response.headers().get_all("x-echo").iter().collect();
        assert_eq!(echoed.len(), 2);
        let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&body[..], b"payload");
    }

    #[tokio::test]
    async fn test_unknown_route_is_404() {
        let response = app()
            .oneshot(
                axum::http::Request::builder()
                    .uri("/nope")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let error: ErrorResponse = serde_json::from_slice(&body).unwrap();
        assert_eq!(error.error, "not_found");
    }

    #[tokio::test]
    async fn test_unmapped_verb_is_rejected() {
        let response = app()
            .oneshot(
                axum::http::Request::builder()
                    .method("PATCH")
                    .uri("/hello/hello")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
    }
}
