//! gRPC transport built on `tonic`.

use super::convert::{action_from_proto, action_to_proto};
use super::{LogStream, PluginRpc};
use crate::endpoint::Action;
use crate::error::{PluginError, PluginResult};
use crate::message::{
    RefreshTokenRequest, RegisterRequest, Registration, Request, Response, TokenRequest,
    TokenResponse,
};
use crate::proto;
use crate::proto::plugin_service_client::PluginServiceClient;
use crate::proto::plugin_service_server::{PluginService, PluginServiceServer};
use crate::tls::ClientTls;
use async_trait::async_trait;
use futures::{Stream, StreamExt};
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_stream::wrappers::TcpListenerStream;
use tokio_util::sync::CancellationToken;
use tonic::transport::{Channel, Endpoint, Identity, Server, ServerTlsConfig};
use tonic::Status;
use tracing::debug;

// ============================================================================
// Server
// ============================================================================

struct GrpcPluginServer {
    handler: Arc<dyn PluginRpc>,
}

#[async_trait]
impl PluginService for GrpcPluginServer {
    async fn register(
        &self,
        request: tonic::Request<proto::RegisterRequest>,
    ) -> Result<tonic::Response<proto::RegisterResponse>, Status> {
        let request = RegisterRequest::try_from(request.into_inner())?;
        let registration = self.handler.register(request).await?;
        Ok(tonic::Response::new(registration.into()))
    }

    async fn call(
        &self,
        request: tonic::Request<proto::CallRequest>,
    ) -> Result<tonic::Response<proto::Response>, Status> {
        let call = request.into_inner();
        let action = action_from_proto(call.action)?;
        let response = self
            .handler
            .call(&call.method, action, call.request.unwrap_or_default().into())
            .await?;
        Ok(tonic::Response::new(response.into()))
    }

    type LoggingStreamStream =
        Pin<Box<dyn Stream<Item = Result<proto::LogMessage, Status>> + Send + 'static>>;

    async fn logging_stream(
        &self,
        _request: tonic::Request<proto::LogStreamRequest>,
    ) -> Result<tonic::Response<Self::LoggingStreamStream>, Status> {
        let stream = self
            .handler
            .logging_stream()
            .await?
            .map(|item| item.map(Into::into).map_err(Status::from));
        Ok(tonic::Response::new(Box::pin(stream)))
    }

    async fn request_token(
        &self,
        request: tonic::Request<proto::TokenRequest>,
    ) -> Result<tonic::Response<proto::TokenResponse>, Status> {
        let token = self
            .handler
            .request_token(request.into_inner().into())
            .await?;
        Ok(tonic::Response::new(token.into()))
    }

    async fn refresh_token(
        &self,
        request: tonic::Request<proto::RefreshTokenRequest>,
    ) -> Result<tonic::Response<proto::TokenResponse>, Status> {
        let token = self
            .handler
            .refresh_token(request.into_inner().into())
            .await?;
        Ok(tonic::Response::new(token.into()))
    }
}

/// Serves `handler` on `listener` until `shutdown` is cancelled.
pub async fn serve(
    listener: TcpListener,
    handler: Arc<dyn PluginRpc>,
    tls: Option<Identity>,
    shutdown: CancellationToken,
) -> PluginResult<()> {
    let mut builder = Server::builder();
    if let Some(identity) = tls {
        builder = builder
            .tls_config(ServerTlsConfig::new().identity(identity))
            .map_err(|e| PluginError::Tls(e.to_string()))?;
    }

    builder
        .add_service(PluginServiceServer::new(GrpcPluginServer { handler }))
        .serve_with_incoming_shutdown(TcpListenerStream::new(listener), async move {
            shutdown.cancelled().await
        })
        .await
        .map_err(|e| PluginError::transport("serve", e))
}

// ============================================================================
// Client
// ============================================================================

/// Client half of the gRPC transport.
#[derive(Clone)]
pub struct GrpcClient {
    inner: PluginServiceClient<Channel>,
}

impl GrpcClient {
    /// Connects to a child, using TLS when trust settings are given.
    pub async fn connect(address: SocketAddr, tls: Option<&ClientTls>) -> PluginResult<Self> {
        let scheme = if tls.is_some() { "https" } else { "http" };
        let mut endpoint = Endpoint::from_shared(format!("{scheme}://{address}"))
            .map_err(|e| PluginError::transport("connect", e))?;
        if let Some(tls) = tls {
            endpoint = endpoint
                .tls_config(tls.tonic_config())
                .map_err(|e| PluginError::Tls(e.to_string()))?;
        }

        let channel = endpoint
            .connect()
            .await
            .map_err(|e| PluginError::transport("connect", format!("{address}: {e}")))?;
        debug!(address = %address, "Connected gRPC plugin client");

        Ok(Self {
            inner: PluginServiceClient::new(channel),
        })
    }
}

#[async_trait]
impl PluginRpc for GrpcClient {
    async fn register(&self, request: RegisterRequest) -> PluginResult<Registration> {
        let response = self
            .inner
            .clone()
            .register(proto::RegisterRequest::from(request))
            .await
            .map_err(|s| PluginError::from_status("Register", s))?;
        Registration::try_from(response.into_inner())
    }

    async fn call(&self, method: &str, action: Action, request: Request) -> PluginResult<Response> {
        let call = proto::CallRequest {
            method: method.to_string(),
            action: action_to_proto(action),
            request: Some(request.into()),
        };
        let response = self
            .inner
            .clone()
            .call(call)
            .await
            .map_err(|s| PluginError::from_status(method, s))?;
        Ok(response.into_inner().into())
    }

    async fn logging_stream(&self) -> PluginResult<LogStream> {
        let stream = self
            .inner
            .clone()
            .logging_stream(proto::LogStreamRequest {})
            .await
            .map_err(|s| PluginError::from_status("LoggingStream", s))?
            .into_inner();

        Ok(stream
            .map(|item| {
                item.map(Into::into)
                    .map_err(|s| PluginError::from_status("LoggingStream", s))
            })
            .boxed())
    }

    async fn request_token(&self, request: TokenRequest) -> PluginResult<TokenResponse> {
        let response = self
            .inner
            .clone()
            .request_token(proto::TokenRequest::from(request))
            .await
            .map_err(|s| PluginError::from_status("RequestToken", s))?;
        Ok(response.into_inner().into())
    }

    async fn refresh_token(&self, request: RefreshTokenRequest) -> PluginResult<TokenResponse> {
        let response = self
            .inner
            .clone()
            .refresh_token(proto::RefreshTokenRequest::from(request))
            .await
            .map_err(|s| PluginError::from_status("RefreshToken", s))?;
        Ok(response.into_inner().into())
    }
}
