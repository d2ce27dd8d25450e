//! # Outrigger Plugin API
//!
//! The contract shared by the agent and the plugin binaries it launches.
//!
//! A plugin implements [`Plugin`], returning [`Endpoint`]s: protocol-neutral
//! `(action, path) -> function` descriptors. [`PluginHost`] serves them from the
//! child process over one of two RPC transports (line-delimited JSON or gRPC),
//! optionally wrapped in TLS, after announcing itself with a [`Handshake`] line
//! on stdout. The agent side uses the same transports, error taxonomy and
//! dispatch to reach them.
//!
//! ## Example
//!
//! ```no_run
//! use outrigger_plugin_api::{
//!     async_trait, Action, Endpoint, Plugin, PluginHost, PluginResult, RegistrationContext,
//!     Response,
//! };
//!
//! struct Hello;
//!
//! #[async_trait]
//! impl Plugin for Hello {
//!     fn name(&self) -> &str {
//!         "hello"
//!     }
//!
//!     async fn register(&self, _ctx: RegistrationContext) -> PluginResult<Vec<Endpoint>> {
//!         Ok(vec![Endpoint::new(Action::Read, "/hello", |_req| async {
//!             Response::json(&serde_json::json!({ "message": "hello" }))
//!         })])
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> PluginResult<()> {
//!     PluginHost::new(Hello).serve().await
//! }
//! ```

pub mod broker;
pub mod dispatch;
pub mod endpoint;
pub mod error;
pub mod handshake;
pub mod host;
pub mod log_bridge;
pub mod message;
pub mod plugin;
pub mod rest;
pub mod security;
pub mod standalone;
pub mod tls;
pub mod transport;

/// Generated protobuf and gRPC types.
pub mod proto {
    tonic::include_proto!("outrigger.plugin.v1");
}

/// Version announced in the handshake by hosts built from this crate.
pub const PLUGIN_API_VERSION: &str = "1";

pub use async_trait::async_trait;
pub use broker::BrokerClient;
pub use dispatch::{Authenticator, Dispatcher, EndpointResolver, Identity, StaticResolver};
pub use endpoint::{Action, Endpoint, EndpointDescriptor};
pub use error::{PluginError, PluginResult};
pub use handshake::{Handshake, Options, RpcProtocol};
pub use host::{HostSettings, HostState, PluginHost};
pub use log_bridge::LogBridge;
pub use message::{LogMessage, Request, Response};
pub use plugin::{Plugin, RegistrationContext};
pub use tls::{ClientTls, TlsMaterial};
pub use transport::{PluginRpc, RpcClient};
