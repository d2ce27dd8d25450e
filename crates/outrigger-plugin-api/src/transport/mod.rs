//! RPC transports between the agent and its children.
//!
//! Both variants speak the same contract, [`PluginRpc`]. The child-side host
//! implements it directly and serves it over one transport; the agent holds a
//! client for the transport named in the child's handshake.

pub mod convert;
pub mod grpc;
pub mod legacy;

use crate::endpoint::Action;
use crate::error::{PluginError, PluginResult};
use crate::handshake::{Handshake, RpcProtocol};
use crate::message::{
    LogMessage, RefreshTokenRequest, RegisterRequest, Registration, Request, Response,
    TokenRequest, TokenResponse,
};
use crate::tls::ClientTls;
use async_trait::async_trait;
use futures::stream::BoxStream;
use std::sync::Arc;
use tracing::debug;

/// Stream of log records from a child.
pub type LogStream = BoxStream<'static, PluginResult<LogMessage>>;

/// Connected client for one child.
pub type RpcClient = Arc<dyn PluginRpc>;

/// Operations every plugin transport carries.
#[async_trait]
pub trait PluginRpc: Send + Sync + 'static {
    /// Exchanges configuration for the child's endpoint descriptors.
    async fn register(&self, request: RegisterRequest) -> PluginResult<Registration>;

    /// Invokes the endpoint registered under `method` (a path relative to the
    /// child's root) for `action`.
    async fn call(&self, method: &str, action: Action, request: Request) -> PluginResult<Response>;

    /// Opens the child's log stream.
    async fn logging_stream(&self) -> PluginResult<LogStream>;

    async fn request_token(&self, request: TokenRequest) -> PluginResult<TokenResponse>;

    async fn refresh_token(&self, request: RefreshTokenRequest) -> PluginResult<TokenResponse>;
}

/// Connects to the child described by `handshake`.
///
/// A child that announced `tls=true` is only reachable with trust settings;
/// connecting without them fails rather than falling back to plaintext.
pub async fn connect(handshake: &Handshake, tls: Option<&ClientTls>) -> PluginResult<RpcClient> {
    let tls = match (handshake.options.tls_enabled, tls) {
        (true, Some(tls)) => Some(tls),
        (true, None) => {
            return Err(PluginError::Tls(format!(
                "{} announced TLS but no trust settings are configured",
                handshake.name
            )))
        }
        (false, _) => None,
    };

    debug!(
        plugin = %handshake.name,
        protocol = %handshake.rpc_protocol,
        address = %handshake.address(),
        tls = tls.is_some(),
        "Connecting to plugin transport"
    );

    let client: RpcClient = match handshake.rpc_protocol {
        RpcProtocol::Legacy => Arc::new(legacy::LegacyClient::connect(handshake.address(), tls).await?),
        RpcProtocol::Grpc => Arc::new(grpc::GrpcClient::connect(handshake.address(), tls).await?),
    };
    Ok(client)
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::message::LogMessage;
    use futures::StreamExt;

    /// In-memory service used to exercise both transports.
    pub struct EchoService;

    #[async_trait]
    impl PluginRpc for EchoService {
        async fn register(&self, request: RegisterRequest) -> PluginResult<Registration> {
            let mut registration = Registration {
                module_type: "echo".to_string(),
                capabilities: vec!["echo".to_string()],
                ..Registration::default()
            };
            registration
                .endpoints
                .push(crate::endpoint::EndpointDescriptor::new(Action::Read, "/echo"));
            if request.default_secure {
                registration.endpoints[0].requires_auth = true;
            }
            Ok(registration)
        }

        async fn call(&self, method: &str, action: Action, request: Request) -> PluginResult<Response> {
            match (method, action) {
                ("/echo", Action::Read) => Ok(Response::from_bytes(request.body)
                    .with_header("x-method", method)),
                ("/slow", Action::Read) => {
                    tokio::time::sleep(std::time::Duration::from_secs(30)).await;
                    Ok(Response::new())
                }
                ("/fail", _) => Err(PluginError::handler("handler exploded")),
                _ => Err(PluginError::NotFound(format!("{action}:{method}"))),
            }
        }

        async fn logging_stream(&self) -> PluginResult<LogStream> {
            let records = (0..3).map(|i| {
                Ok(LogMessage {
                    level: "INFO".to_string(),
                    message: format!("record {i}"),
                    ..LogMessage::default()
                })
            });
            Ok(futures::stream::iter(records).boxed())
        }

        async fn request_token(&self, request: TokenRequest) -> PluginResult<TokenResponse> {
            Ok(TokenResponse {
                token: format!("token-for-{}", request.subject),
                expires_at: 42,
            })
        }

        async fn refresh_token(&self, _request: RefreshTokenRequest) -> PluginResult<TokenResponse> {
            Err(PluginError::Unimplemented("refresh_token".to_string()))
        }
    }

    /// Runs the same contract checks against any connected client.
    pub async fn exercise(client: &dyn PluginRpc) {
        let registration = client
            .register(RegisterRequest {
                default_secure: true,
                ..RegisterRequest::default()
            })
            .await
            .unwrap();
        assert_eq!(registration.module_type, "echo");
        assert_eq!(registration.endpoints.len(), 1);
        assert!(registration.endpoints[0].requires_auth);

        let response = client
            .call("/echo", Action::Read, Request::new().with_body("ping"))
            .await
            .unwrap();
        assert_eq!(response.value, b"ping");
        assert_eq!(response.header("x-method"), Some("/echo"));

        assert!(matches!(
            client.call("/missing", Action::Read, Request::new()).await,
            Err(PluginError::NotFound(_))
        ));
        assert!(matches!(
            client.call("/fail", Action::Create, Request::new()).await,
            Err(PluginError::Handler(m)) if m == "handler exploded"
        ));

        let logs: Vec<_> = client.logging_stream().await.unwrap().collect().await;
        assert_eq!(logs.len(), 3);
        assert_eq!(logs[2].as_ref().unwrap().message, "record 2");

        let token = client
            .request_token(TokenRequest {
                subject: "alice".to_string(),
                groups: vec![],
            })
            .await
            .unwrap();
        assert_eq!(token.token, "token-for-alice");
        assert!(matches!(
            client
                .refresh_token(RefreshTokenRequest {
                    token: token.token
                })
                .await,
            Err(PluginError::Unimplemented(_))
        ));
    }
}
