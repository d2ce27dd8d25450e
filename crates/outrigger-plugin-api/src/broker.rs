//! Child-side client for the agent's plugin-to-plugin broker.

use crate::endpoint::Action;
use crate::error::{PluginError, PluginResult};
use crate::message::{Request, Response};
use crate::proto;
use crate::proto::broker_service_client::BrokerServiceClient;
use crate::transport::convert::action_to_proto;
use std::net::SocketAddr;
use tonic::metadata::AsciiMetadataValue;
use tonic::transport::{Channel, Endpoint};

/// Loopback address of the broker service.
pub const ENV_BROKER_ADDR: &str = "OUTRIGGER_BROKER_ADDR";
/// Per-instance token identifying the caller to the broker.
pub const ENV_BROKER_TOKEN: &str = "OUTRIGGER_BROKER_TOKEN";
/// gRPC metadata key carrying the broker token.
pub const BROKER_TOKEN_HEADER: &str = "x-outrigger-broker-token";

/// Calls other loaded plugins through the agent.
#[derive(Clone)]
pub struct BrokerClient {
    inner: BrokerServiceClient<Channel>,
    token: String,
}

impl std::fmt::Debug for BrokerClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BrokerClient").finish_non_exhaustive()
    }
}

impl BrokerClient {
    /// Builds a client without connecting; the channel connects on first use.
    pub fn connect_lazy(address: SocketAddr, token: impl Into<String>) -> PluginResult<Self> {
        let channel = Endpoint::from_shared(format!("http://{address}"))
            .map_err(|e| PluginError::transport("broker", e))?
            .connect_lazy();
        Ok(Self {
            inner: BrokerServiceClient::new(channel),
            token: token.into(),
        })
    }

    /// Client configured by the launching agent, if it enabled the broker.
    pub fn from_env() -> PluginResult<Option<Self>> {
        let Ok(addr) = std::env::var(ENV_BROKER_ADDR) else {
            return Ok(None);
        };
        let address: SocketAddr = addr
            .parse()
            .map_err(|e| PluginError::transport("broker", format!("invalid {ENV_BROKER_ADDR}: {e}")))?;
        let token = std::env::var(ENV_BROKER_TOKEN).unwrap_or_default();
        Self::connect_lazy(address, token).map(Some)
    }

    fn authorized<T>(&self, message: T) -> PluginResult<tonic::Request<T>> {
        let mut request = tonic::Request::new(message);
        let token: AsciiMetadataValue = self
            .token
            .parse()
            .map_err(|_| PluginError::Unauthorized("broker token is not valid metadata".into()))?;
        request.metadata_mut().insert(BROKER_TOKEN_HEADER, token);
        Ok(request)
    }

    /// Calls `method` (relative to the target's root) on another plugin.
    pub async fn call(
        &self,
        target: &str,
        method: &str,
        action: Action,
        request: Request,
    ) -> PluginResult<Response> {
        let message = proto::BrokerCallRequest {
            target: target.to_string(),
            method: method.to_string(),
            action: action_to_proto(action),
            request: Some(request.into()),
        };
        let response = self
            .inner
            .clone()
            .call(self.authorized(message)?)
            .await
            .map_err(|s| PluginError::from_status(&format!("{target}{method}"), s))?;
        Ok(response.into_inner().into())
    }

    /// Names of the instances currently loaded by the agent.
    pub async fn list_plugins(&self) -> PluginResult<Vec<String>> {
        let response = self
            .inner
            .clone()
            .list_plugins(self.authorized(proto::ListPluginsRequest {})?)
            .await
            .map_err(|s| PluginError::from_status("ListPlugins", s))?;
        Ok(response.into_inner().names)
    }

    pub async fn is_plugin_loaded(&self, name: &str) -> PluginResult<bool> {
        let response = self
            .inner
            .clone()
            .is_plugin_loaded(self.authorized(proto::IsPluginLoadedRequest {
                name: name.to_string(),
            })?)
            .await
            .map_err(|s| PluginError::from_status("IsPluginLoaded", s))?;
        Ok(response.into_inner().loaded)
    }
}
