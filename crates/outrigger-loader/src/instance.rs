//! Running plugin and module instances.

use chrono::{DateTime, Utc};
use outrigger_core::{InstanceKind, PluginConfig};
use outrigger_plugin_api::{EndpointDescriptor, Handshake, RpcClient};
use parking_lot::RwLock;
use serde::Serialize;
use std::path::PathBuf;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

/// Exit code recorded when a child is terminated by a signal.
pub const SIGNALLED_EXIT_CODE: i32 = -1;

/// One launched child process.
///
/// Created when the handshake is captured; the RPC client and endpoints are
/// filled in by registration. The exit code is written exactly once by the
/// exit watcher.
pub struct Instance {
    pub kind: InstanceKind,
    pub path: PathBuf,
    pub name: String,
    pub root_path: String,
    pub handshake: Handshake,
    pub config: PluginConfig,
    pub started_at: DateTime<Utc>,
    pub(crate) broker_token: Option<String>,
    cancel: CancellationToken,
    exit: watch::Receiver<Option<i32>>,
    registration: RwLock<RegistrationState>,
}

#[derive(Default)]
struct RegistrationState {
    client: Option<RpcClient>,
    endpoints: Vec<EndpointDescriptor>,
    module_type: String,
    capabilities: Vec<String>,
}

impl Instance {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        kind: InstanceKind,
        path: PathBuf,
        root_path: String,
        handshake: Handshake,
        config: PluginConfig,
        broker_token: Option<String>,
        cancel: CancellationToken,
        exit: watch::Receiver<Option<i32>>,
    ) -> Self {
        Self {
            kind,
            path,
            name: handshake.name.clone(),
            root_path,
            handshake,
            config,
            started_at: Utc::now(),
            broker_token,
            cancel,
            exit,
            registration: RwLock::new(RegistrationState::default()),
        }
    }

    pub fn has_exited(&self) -> bool {
        self.exit.borrow().is_some()
    }

    pub fn exit_code(&self) -> Option<i32> {
        *self.exit.borrow()
    }

    /// Resolves with the exit code once the child has exited.
    pub async fn exited(&self) -> i32 {
        let mut exit = self.exit.clone();
        loop {
            if let Some(code) = *exit.borrow_and_update() {
                return code;
            }
            if exit.changed().await.is_err() {
                return (*exit.borrow()).unwrap_or(SIGNALLED_EXIT_CODE);
            }
        }
    }

    /// Terminates the child. The exit watcher records the result.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn client(&self) -> Option<RpcClient> {
        self.registration.read().client.clone()
    }

    pub fn is_registered(&self) -> bool {
        self.registration.read().client.is_some()
    }

    /// Endpoint descriptors with paths rooted under the instance's root path.
    pub fn endpoints(&self) -> Vec<EndpointDescriptor> {
        self.registration.read().endpoints.clone()
    }

    pub fn module_type(&self) -> String {
        self.registration.read().module_type.clone()
    }

    pub fn capabilities(&self) -> Vec<String> {
        self.registration.read().capabilities.clone()
    }

    pub(crate) fn set_registration(
        &self,
        client: RpcClient,
        endpoints: Vec<EndpointDescriptor>,
        module_type: String,
        capabilities: Vec<String>,
    ) {
        let mut state = self.registration.write();
        state.client = Some(client);
        state.endpoints = endpoints;
        state.module_type = module_type;
        state.capabilities = capabilities;
    }

    pub(crate) fn clear_registration(&self) {
        let mut state = self.registration.write();
        state.client = None;
        state.endpoints.clear();
    }

    pub fn summary(&self) -> InstanceSummary {
        let registration = self.registration.read();
        InstanceSummary {
            name: self.name.clone(),
            kind: self.kind,
            path: self.path.display().to_string(),
            root_path: self.root_path.clone(),
            protocol: self.handshake.rpc_protocol.to_string(),
            address: self.handshake.address().to_string(),
            api_version: self.handshake.api_version.clone(),
            tls: self.handshake.options.tls_enabled,
            module_type: registration.module_type.clone(),
            capabilities: registration.capabilities.clone(),
            endpoints: registration.endpoints.len(),
            registered: registration.client.is_some(),
            exit_code: self.exit_code(),
            started_at: self.started_at,
        }
    }
}

impl std::fmt::Debug for Instance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Instance")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("path", &self.path)
            .field("root_path", &self.root_path)
            .field("exit_code", &self.exit_code())
            .finish_non_exhaustive()
    }
}

/// Serializable view of an instance for the control endpoints.
#[derive(Debug, Clone, Serialize)]
pub struct InstanceSummary {
    pub name: String,
    pub kind: InstanceKind,
    pub path: String,
    pub root_path: String,
    pub protocol: String,
    pub address: String,
    pub api_version: String,
    pub tls: bool,
    pub module_type: String,
    pub capabilities: Vec<String>,
    pub endpoints: usize,
    pub registered: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    pub started_at: DateTime<Utc>,
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use outrigger_plugin_api::{Options, RpcProtocol};
    use std::net::Ipv4Addr;

    pub fn handshake(name: &str) -> Handshake {
        Handshake {
            name: name.to_string(),
            root_path: format!("/{name}"),
            rpc_protocol: RpcProtocol::Grpc,
            transport_protocol: "tcp".to_string(),
            ip: Ipv4Addr::LOCALHOST,
            port: 1,
            api_version: "1".to_string(),
            options: Options::default(),
        }
    }

    /// Instance with no process behind it, plus the sender standing in for
    /// its exit watcher.
    pub fn detached(name: &str) -> (Instance, watch::Sender<Option<i32>>) {
        let (tx, rx) = watch::channel(None);
        let instance = Instance::new(
            InstanceKind::Plugin,
            PathBuf::from(format!("/plugins/{name}.plugin")),
            format!("/{name}"),
            handshake(name),
            PluginConfig::new(format!("{name}.plugin")),
            None,
            CancellationToken::new(),
            rx,
        );
        (instance, tx)
    }
}
