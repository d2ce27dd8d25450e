//! REST adapter in front of a loader running the sample plugin.
#![cfg(unix)]

mod common;

use axum::body::Body;
use axum::http::{Request as HttpRequest, StatusCode};
use axum::Router;
use common::{install, loader_settings};
use http_body_util::BodyExt;
use outrigger_api::{ApiServer, OPENAPI_PATH};
use outrigger_core::config::{ApiConfig, LoaderConfig};
use outrigger_loader::Loader;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceExt;

async fn agent(dir: &std::path::Path) -> (Arc<Loader>, ApiServer) {
    install(dir, "alpha.plugin");
    let settings = LoaderConfig {
        load_unconfigured: true,
        ..loader_settings(dir)
    };
    let loader = Loader::new(&settings, Vec::new(), Vec::new(), None);
    loader.initialize(true).await.unwrap();

    let config = ApiConfig {
        jwt_secret: "scenario-secret".to_string(),
        ..ApiConfig::default()
    };
    let server = ApiServer::new(config, loader.clone());
    (loader, server)
}

async fn send(app: &Router, request: HttpRequest<Body>) -> (StatusCode, Value) {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, body)
}

fn get(uri: &str) -> HttpRequest<Body> {
    HttpRequest::builder().uri(uri).body(Body::empty()).unwrap()
}

#[tokio::test]
async fn test_rest_reaches_plugin_endpoints() {
    let dir = tempfile::tempdir().unwrap();
    let (loader, server) = agent(dir.path()).await;
    let app = server.router();

    let (status, body) = send(&app, get("/alpha/hello?name=rest")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["message"], "hello rest");

    let (status, body) = send(&app, get("/alpha/missing")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"], "not_found");

    let echo = HttpRequest::builder()
        .method("POST")
        .uri("/alpha/echo")
        .header("content-type", "application/json")
        .body(Body::from(r#"{"ping":true}"#))
        .unwrap();
    let (status, body) = send(&app, echo).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["ping"], true);

    loader.close_all(Duration::from_secs(5)).await;
}

#[tokio::test]
async fn test_auth_on_plugin_and_control_endpoints() {
    let dir = tempfile::tempdir().unwrap();
    let (loader, server) = agent(dir.path()).await;
    let app = server.router();

    let (status, _) = send(&app, get("/alpha/whoami")).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    let (status, _) = send(&app, get("/agent/plugins")).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (token, _) = server.authenticator().issue_token("operator", vec![]).unwrap();
    let authorized = |uri: &str| {
        HttpRequest::builder()
            .uri(uri)
            .header("authorization", format!("Bearer {token}"))
            .body(Body::empty())
            .unwrap()
    };

    let (status, body) = send(&app, authorized("/alpha/whoami")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["subject"], "operator");

    let (status, body) = send(&app, authorized("/agent/plugins")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body[0]["name"], "alpha");

    loader.close_all(Duration::from_secs(5)).await;
}

#[tokio::test]
async fn test_openapi_and_health() {
    let dir = tempfile::tempdir().unwrap();
    let (loader, server) = agent(dir.path()).await;
    let app = server.router();

    let (status, body) = send(&app, get("/health")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "healthy");

    let (status, doc) = send(&app, get(OPENAPI_PATH)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(
        doc["paths"]["/alpha/hello"]["get"]["responses"]["200"]["content"]["application/json"]
            ["schema"]["required"][0],
        "message"
    );
    assert!(doc["paths"]["/alpha/whoami"]["get"]["security"].is_array());
    assert!(doc["paths"]["/agent/plugins/load"]["post"].is_object());

    loader.close_all(Duration::from_secs(5)).await;
}
