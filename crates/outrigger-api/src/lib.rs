//! # Outrigger API
//!
//! Protocol adapters in front of the endpoint table:
//!
//! - **REST** (`axum`): every request is resolved against the live table by
//!   verb and path, with `/health` and `/api-docs/openapi.json` alongside.
//! - **gRPC** (`tonic`): the `Gateway` service, enabled by `api.grpc_port`.
//! - **Auth**: HS256 bearer tokens checked by [`auth::JwtAuthenticator`] for
//!   endpoints that require authentication.

pub mod auth;
pub mod grpc;
pub mod middleware;
pub mod openapi;

use auth::{AuthConfig, JwtAuthenticator};
use axum::extract::DefaultBodyLimit;
use axum::routing::get;
use axum::Router;
use grpc::GatewayService;
use middleware::{cors_layer, health_check, logging_middleware, request_id_middleware};
use outrigger_core::config::ApiConfig;
use outrigger_plugin_api::{Dispatcher, EndpointResolver};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_stream::wrappers::TcpListenerStream;
use tokio_util::sync::CancellationToken;
use tower::ServiceBuilder;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

pub use auth::Claims;
pub use openapi::OPENAPI_PATH;

const DEFAULT_JWT_SECRET: &str = "change-me-in-production";

// ============================================================================
// Router
// ============================================================================

/// REST router for `dispatcher`, with middleware applied per `config`.
pub fn router(dispatcher: Arc<Dispatcher>, config: &ApiConfig) -> Router {
    let mut app = Router::new()
        .route("/health", get(health_check))
        .route(OPENAPI_PATH, get(openapi::serve))
        .with_state(dispatcher.clone())
        .merge(outrigger_plugin_api::rest::router(dispatcher));

    app = app.layer(
        ServiceBuilder::new()
            .layer(TraceLayer::new_for_http())
            .layer(axum::middleware::from_fn(request_id_middleware))
            .layer(axum::middleware::from_fn(logging_middleware))
            .layer(DefaultBodyLimit::disable())
            .layer(RequestBodyLimitLayer::new(config.max_body_size)),
    );

    if config.cors {
        app = app.layer(cors_layer());
    }
    app
}

// ============================================================================
// Server
// ============================================================================

pub struct ApiServer {
    config: ApiConfig,
    dispatcher: Arc<Dispatcher>,
    authenticator: Arc<JwtAuthenticator>,
}

impl ApiServer {
    /// Serves `resolver`'s endpoints, checking bearer tokens against
    /// `config.jwt_secret`.
    pub fn new(config: ApiConfig, resolver: Arc<dyn EndpointResolver>) -> Self {
        if config.jwt_secret == DEFAULT_JWT_SECRET {
            warn!("api.jwt_secret is the built-in default - not suitable for production use!");
        }
        let authenticator = Arc::new(JwtAuthenticator::new(AuthConfig::with_secret(
            config.jwt_secret.clone(),
        )));
        let dispatcher =
            Arc::new(Dispatcher::new(resolver).with_authenticator(authenticator.clone()));

        Self {
            config,
            dispatcher,
            authenticator,
        }
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    pub fn authenticator(&self) -> &Arc<JwtAuthenticator> {
        &self.authenticator
    }

    pub fn router(&self) -> Router {
        router(self.dispatcher.clone(), &self.config)
    }

    /// Binds the configured addresses and serves until `shutdown` is cancelled.
    pub async fn run(self, shutdown: CancellationToken) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.config.bind_address()).await?;
        let grpc = match self.config.grpc_bind_address() {
            Some(address) => Some(TcpListener::bind(address).await?),
            None => None,
        };
        self.serve(listener, grpc, shutdown).await
    }

    /// Serves REST on `listener` and, when given, the gRPC gateway on `grpc`.
    pub async fn serve(
        self,
        listener: TcpListener,
        grpc: Option<TcpListener>,
        shutdown: CancellationToken,
    ) -> anyhow::Result<()> {
        let grpc_task = match grpc {
            Some(grpc) => {
                let local_addr = grpc.local_addr()?;
                let service = GatewayService::new(self.dispatcher.clone()).into_server();
                let shutdown = shutdown.clone();
                info!(address = %local_addr, "gRPC gateway listening");
                Some(tokio::spawn(async move {
                    let result = tonic::transport::Server::builder()
                        .add_service(service)
                        .serve_with_incoming_shutdown(TcpListenerStream::new(grpc), async move {
                            shutdown.cancelled().await
                        })
                        .await;
                    if let Err(e) = &result {
                        error!(error = %e, "gRPC gateway failed");
                    }
                    result
                }))
            }
            None => None,
        };

        let local_addr = listener.local_addr()?;
        info!(address = %local_addr, cors = self.config.cors, "REST adapter listening");

        let app = self.router();
        let rest_shutdown = shutdown.clone();
        let rest = axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move { rest_shutdown.cancelled().await })
        .await;

        // Either adapter stopping takes the other down with it.
        shutdown.cancel();
        if let Some(task) = grpc_task {
            task.await??;
        }
        rest?;

        info!("API server shutdown complete");
        Ok(())
    }
}
