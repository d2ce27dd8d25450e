//! Plugin-to-plugin broker.
//!
//! Children never connect to each other. A call from one plugin to another
//! goes to the broker service on loopback, which resolves the target through
//! the loader and forwards the call through the same call shim the adapters
//! use.

use outrigger_plugin_api::broker::BROKER_TOKEN_HEADER;
use outrigger_plugin_api::endpoint::join_path;
use outrigger_plugin_api::message::{META_AUTH_SUBJECT, META_CALLER};
use outrigger_plugin_api::proto;
use outrigger_plugin_api::proto::broker_service_server::{BrokerService, BrokerServiceServer};
use outrigger_plugin_api::transport::convert::action_from_proto;
use outrigger_plugin_api::{
    Action, EndpointDescriptor, PluginError, PluginResult, Request, Response,
};
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_stream::wrappers::TcpListenerStream;
use tonic::metadata::MetadataMap;
use tonic::transport::Server;
use tonic::Status;
use tracing::{error, info};

use crate::loader::Loader;

/// Routes calls between loaded instances.
#[derive(Clone)]
pub struct Broker {
    loader: Arc<Loader>,
}

impl Broker {
    pub fn new(loader: Arc<Loader>) -> Self {
        Self { loader }
    }

    /// Calls `method` (relative to the target's root path) on `target`.
    ///
    /// Fails with `NotFound` when the target is not loaded and with
    /// `InstanceExited` when it has exited. Brokered calls never carry an
    /// authenticated subject; only the adapters set one.
    pub async fn call(
        &self,
        target: &str,
        method: &str,
        action: Action,
        mut request: Request,
    ) -> PluginResult<Response> {
        request.metadata.remove(META_AUTH_SUBJECT);

        let instance = self
            .loader
            .instance(target)
            .ok_or_else(|| PluginError::NotFound(format!("plugin {target} is not loaded")))?;
        if let Some(exit_code) = instance.exit_code() {
            return Err(PluginError::InstanceExited {
                name: target.to_string(),
                exit_code,
            });
        }

        let endpoint = EndpointDescriptor::new(action, join_path(&instance.root_path, method));
        self.loader.call_shim(&endpoint, request).await
    }

    pub fn list_plugins(&self) -> Vec<String> {
        self.loader.instance_names()
    }

    pub fn is_plugin_loaded(&self, name: &str) -> bool {
        self.loader.instance(name).is_some()
    }

    /// Serves the broker on an OS-assigned loopback port until the loader
    /// shuts down, and records the address for future launches.
    pub async fn start(self) -> PluginResult<SocketAddr> {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await?;
        let address = listener.local_addr()?;
        self.loader.set_broker_address(address);

        let shutdown = self.loader.shutdown_token().clone();
        let service = BrokerServiceServer::new(BrokerServer { broker: self });
        tokio::spawn(async move {
            let result = Server::builder()
                .add_service(service)
                .serve_with_incoming_shutdown(TcpListenerStream::new(listener), async move {
                    shutdown.cancelled().await
                })
                .await;
            if let Err(e) = result {
                error!(error = %e, "Broker service failed");
            }
        });

        info!(address = %address, "Broker service listening");
        Ok(address)
    }
}

/// gRPC face of the [`Broker`]. Every request must carry a token issued to a
/// loaded instance.
pub struct BrokerServer {
    broker: Broker,
}

impl BrokerServer {
    fn caller(&self, metadata: &MetadataMap) -> Result<String, Status> {
        let token = metadata
            .get(BROKER_TOKEN_HEADER)
            .and_then(|value| value.to_str().ok())
            .ok_or_else(|| Status::unauthenticated("missing broker token"))?;
        self.broker
            .loader
            .token_owner(token)
            .ok_or_else(|| Status::unauthenticated("unknown broker token"))
    }
}

#[tonic::async_trait]
impl BrokerService for BrokerServer {
    async fn call(
        &self,
        request: tonic::Request<proto::BrokerCallRequest>,
    ) -> Result<tonic::Response<proto::Response>, Status> {
        let caller = self.caller(request.metadata())?;
        let message = request.into_inner();
        let action = action_from_proto(message.action)?;
        let inner = Request::from(message.request.unwrap_or_default())
            .with_metadata(META_CALLER, caller.clone());

        info!(
            caller = %caller,
            target = %message.target,
            method = %message.method,
            action = %action,
            "Brokered call"
        );
        let response = self
            .broker
            .call(&message.target, &message.method, action, inner)
            .await?;
        Ok(tonic::Response::new(response.into()))
    }

    async fn list_plugins(
        &self,
        request: tonic::Request<proto::ListPluginsRequest>,
    ) -> Result<tonic::Response<proto::ListPluginsResponse>, Status> {
        self.caller(request.metadata())?;
        Ok(tonic::Response::new(proto::ListPluginsResponse {
            names: self.broker.list_plugins(),
        }))
    }

    async fn is_plugin_loaded(
        &self,
        request: tonic::Request<proto::IsPluginLoadedRequest>,
    ) -> Result<tonic::Response<proto::IsPluginLoadedResponse>, Status> {
        self.caller(request.metadata())?;
        let name = request.into_inner().name;
        Ok(tonic::Response::new(proto::IsPluginLoadedResponse {
            loaded: self.broker.is_plugin_loaded(&name),
        }))
    }
}
