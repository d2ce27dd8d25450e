//! Standalone mode: a plugin binary serving its own endpoints over REST.

use crate::dispatch::{Dispatcher, StaticResolver};
use crate::error::{PluginError, PluginResult};
use crate::plugin::{Plugin, RegistrationContext};
use crate::rest;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

pub const ENV_STANDALONE_PROTOCOL: &str = "OUTRIGGER_STANDALONE_PROTOCOL";
pub const ENV_STANDALONE_HOST: &str = "OUTRIGGER_STANDALONE_HOST";
pub const ENV_STANDALONE_PORT: &str = "OUTRIGGER_STANDALONE_PORT";
pub const ENV_STANDALONE_CORS: &str = "OUTRIGGER_STANDALONE_CORS";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StandaloneSettings {
    pub host: String,
    pub port: u16,
    pub cors: bool,
}

impl Default for StandaloneSettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8081,
            cors: false,
        }
    }
}

impl StandaloneSettings {
    /// Settings from the environment, or `None` when standalone mode is not
    /// requested. Only the `http` protocol is served.
    pub fn from_env() -> PluginResult<Option<Self>> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> PluginResult<Option<Self>> {
        let Some(protocol) = lookup(ENV_STANDALONE_PROTOCOL) else {
            return Ok(None);
        };
        if !protocol.eq_ignore_ascii_case("http") {
            return Err(PluginError::UnsupportedOption(format!(
                "standalone protocol {protocol:?} (only \"http\" is served)"
            )));
        }

        let mut settings = Self::default();
        if let Some(host) = lookup(ENV_STANDALONE_HOST) {
            settings.host = host;
        }
        if let Some(port) = lookup(ENV_STANDALONE_PORT) {
            settings.port = port.parse().map_err(|_| {
                PluginError::UnsupportedOption(format!("{ENV_STANDALONE_PORT}={port}"))
            })?;
        }
        if let Some(cors) = lookup(ENV_STANDALONE_CORS) {
            settings.cors = matches!(cors.to_ascii_lowercase().as_str(), "1" | "true" | "yes");
        }
        Ok(Some(settings))
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Builds the router serving every endpoint of `plugin` under its root path.
///
/// No authenticator is installed, so endpoints that require auth answer 401.
pub async fn router(plugin: Arc<dyn Plugin>, cors: bool) -> PluginResult<axum::Router> {
    let endpoints = plugin.register(RegistrationContext::default()).await?;
    let root = plugin.root_path();
    let resolver = StaticResolver::new(endpoints.iter().map(|e| e.rooted(&root)))?;
    let dispatcher = Arc::new(Dispatcher::new(Arc::new(resolver)));

    let mut app = rest::router(dispatcher).layer(TraceLayer::new_for_http());
    if cors {
        app = app.layer(CorsLayer::permissive());
    }
    Ok(app)
}

/// Serves `plugin` over REST until `shutdown` is cancelled.
pub async fn serve(
    plugin: Arc<dyn Plugin>,
    settings: StandaloneSettings,
    shutdown: CancellationToken,
) -> PluginResult<()> {
    let app = router(plugin.clone(), settings.cors).await?;
    let listener = TcpListener::bind(settings.bind_address()).await?;
    let addr: SocketAddr = listener.local_addr()?;
    info!(plugin = %plugin.name(), address = %addr, "Serving plugin standalone over REST");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::{Action, Endpoint};
    use crate::message::Response;
    use async_trait::async_trait;
    use axum::body::Body;
    use std::collections::HashMap;
    use tower::ServiceExt;

    struct Hello;

    #[async_trait]
    impl Plugin for Hello {
        fn name(&self) -> &str {
            "hello"
        }

        async fn register(&self, _ctx: RegistrationContext) -> PluginResult<Vec<Endpoint>> {
            Ok(vec![
                Endpoint::new(Action::Read, "/hello", |_req| async {
                    Response::json(&serde_json::json!({ "message": "hello" }))
                }),
                Endpoint::new(Action::Read, "/secret", |_req| async { Ok(Response::new()) })
                    .requires_auth(None),
            ])
        }
    }

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_settings_from_environment() {
        assert_eq!(StandaloneSettings::from_lookup(lookup(&[])).unwrap(), None);

        let settings = StandaloneSettings::from_lookup(lookup(&[
            (ENV_STANDALONE_PROTOCOL, "http"),
            (ENV_STANDALONE_HOST, "0.0.0.0"),
            (ENV_STANDALONE_PORT, "9000"),
            (ENV_STANDALONE_CORS, "true"),
        ]))
        .unwrap()
        .unwrap();
        assert_eq!(settings.bind_address(), "0.0.0.0:9000");
        assert!(settings.cors);

        assert!(StandaloneSettings::from_lookup(lookup(&[(ENV_STANDALONE_PROTOCOL, "grpc")])).is_err());
        assert!(StandaloneSettings::from_lookup(lookup(&[
            (ENV_STANDALONE_PROTOCOL, "http"),
            (ENV_STANDALONE_PORT, "not-a-port"),
        ]))
        .is_err());
    }

    #[tokio::test]
    async fn test_routes_served_under_root_path() {
        let app = router(Arc::new(Hello), false).await.unwrap();
        let response = app
            .clone()
            .oneshot(
                axum::http::Request::builder()
                    .uri("/hello/hello")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), axum::http::StatusCode::OK);

        let response = app
            .oneshot(
                axum::http::Request::builder()
                    .uri("/hello/secret")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), axum::http::StatusCode::UNAUTHORIZED);
    }
}
