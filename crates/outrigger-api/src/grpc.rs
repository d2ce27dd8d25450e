//! gRPC front door.
//!
//! `Gateway.Invoke` carries an action, a full path and a request; it goes
//! through the same [`Dispatcher`] as REST. Caller metadata such as
//! `authorization` is merged into the request headers so the authenticator
//! sees the same credentials on both adapters.

use outrigger_plugin_api::message::{MultiMap, META_PATH, META_PROTOCOL};
use outrigger_plugin_api::proto;
use outrigger_plugin_api::proto::gateway_server::{Gateway, GatewayServer};
use outrigger_plugin_api::transport::convert::action_from_proto;
use outrigger_plugin_api::{Dispatcher, Request};
use std::sync::Arc;
use tonic::metadata::{KeyAndValueRef, MetadataMap};
use tonic::Status;
use tracing::debug;

/// Metadata that belongs to the gRPC framing rather than the caller.
const RESERVED_METADATA: &[&str] = &["content-type", "te", "user-agent", "accept-encoding"];

pub struct GatewayService {
    dispatcher: Arc<Dispatcher>,
}

impl GatewayService {
    pub fn new(dispatcher: Arc<Dispatcher>) -> Self {
        Self { dispatcher }
    }

    pub fn into_server(self) -> GatewayServer<Self> {
        GatewayServer::new(self)
    }
}

fn metadata_headers(metadata: &MetadataMap) -> MultiMap {
    let mut headers = MultiMap::new();
    for entry in metadata.iter() {
        let KeyAndValueRef::Ascii(key, value) = entry else {
            continue;
        };
        let name = key.as_str();
        if name.starts_with("grpc-") || RESERVED_METADATA.contains(&name) {
            continue;
        }
        if let Ok(value) = value.to_str() {
            headers
                .entry(name.to_string())
                .or_default()
                .push(value.to_string());
        }
    }
    headers
}

#[tonic::async_trait]
impl Gateway for GatewayService {
    async fn invoke(
        &self,
        request: tonic::Request<proto::InvokeRequest>,
    ) -> Result<tonic::Response<proto::Response>, Status> {
        let headers = metadata_headers(request.metadata());
        let message = request.into_inner();
        let action = action_from_proto(message.action)?;

        let mut inner = Request::from(message.request.unwrap_or_default())
            .with_metadata(META_PATH, message.path.clone())
            .with_metadata(META_PROTOCOL, "grpc");
        for (name, values) in headers {
            inner.headers.entry(name).or_default().extend(values);
        }

        debug!(action = %action, path = %message.path, "Gateway invoke");
        let response = self.dispatcher.dispatch(action, &message.path, inner).await?;
        Ok(tonic::Response::new(response.into()))
    }
}
