//! Child-side host.
//!
//! [`PluginHost`] wraps a [`Plugin`], binds one RPC transport on loopback,
//! announces it with a handshake line on stdout and serves until the agent
//! terminates the process. Logs go to stderr and into the logging stream.

use crate::broker::BrokerClient;
use crate::endpoint::{route_key, Action, Endpoint};
use crate::error::{PluginError, PluginResult};
use crate::handshake::{Handshake, Options, RpcProtocol};
use crate::log_bridge::LogBridge;
use crate::message::{
    RefreshTokenRequest, RegisterRequest, Registration, Request, Response, TokenRequest,
    TokenResponse,
};
use crate::plugin::{Plugin, RegistrationContext};
use crate::standalone::{self, StandaloneSettings};
use crate::tls::TlsMaterial;
use crate::transport::{grpc, legacy, LogStream, PluginRpc};
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::io::Write;
use std::net::Ipv4Addr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Marker the agent sets on every child it launches.
pub const ENV_PLUGIN_COOKIE: &str = "OUTRIGGER_PLUGIN_COOKIE";
/// Expected value of [`ENV_PLUGIN_COOKIE`].
pub const PLUGIN_COOKIE_VALUE: &str = "4f1c8a2e-outrigger-extension-host";
/// Overrides the transport a child serves (`grpc` or `jsonrpc`).
pub const ENV_PLUGIN_PROTOCOL: &str = "OUTRIGGER_PLUGIN_PROTOCOL";
/// Log filter for the child, in `EnvFilter` syntax.
pub const ENV_PLUGIN_LOG: &str = "OUTRIGGER_PLUGIN_LOG";
/// Capacity of the child's log channel, set by the agent.
pub const ENV_PLUGIN_LOG_CAPACITY: &str = "OUTRIGGER_PLUGIN_LOG_CAPACITY";

const DEFAULT_LOG_CAPACITY: usize = 1024;

/// Lifecycle of one host process. There is no way back to an earlier state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostState {
    Created,
    Announced,
    Serving,
    Terminated,
}

/// Launch settings a child reads from its environment.
#[derive(Debug, Clone)]
pub struct HostSettings {
    pub protocol: RpcProtocol,
    pub tls: Option<TlsMaterial>,
    pub broker: Option<BrokerClient>,
}

impl HostSettings {
    pub fn new(protocol: RpcProtocol) -> Self {
        Self {
            protocol,
            tls: None,
            broker: None,
        }
    }

    /// Reads transport, TLS and broker settings placed by the agent.
    pub fn from_env(default_protocol: RpcProtocol) -> PluginResult<Self> {
        let protocol = match std::env::var(ENV_PLUGIN_PROTOCOL) {
            Ok(value) => value
                .parse()
                .map_err(|e: String| PluginError::UnsupportedOption(e))?,
            Err(_) => default_protocol,
        };
        Ok(Self {
            protocol,
            tls: TlsMaterial::from_env(),
            broker: BrokerClient::from_env()?,
        })
    }
}

/// Serves a plugin's endpoints over one RPC transport.
pub struct PluginHost {
    plugin: Arc<dyn Plugin>,
    protocol: RpcProtocol,
    bridge: LogBridge,
    state: Arc<Mutex<HostState>>,
}

impl PluginHost {
    pub fn new(plugin: impl Plugin) -> Self {
        Self {
            plugin: Arc::new(plugin),
            protocol: RpcProtocol::Grpc,
            bridge: LogBridge::new(DEFAULT_LOG_CAPACITY),
            state: Arc::new(Mutex::new(HostState::Created)),
        }
    }

    /// Transport served when the agent does not pick one.
    pub fn with_protocol(mut self, protocol: RpcProtocol) -> Self {
        self.protocol = protocol;
        self
    }

    /// Capacity of the logging stream's channel.
    pub fn with_log_capacity(mut self, capacity: usize) -> Self {
        self.bridge = LogBridge::new(capacity);
        self
    }

    pub fn state(&self) -> HostState {
        *self.state.lock()
    }

    pub fn log_bridge(&self) -> &LogBridge {
        &self.bridge
    }

    /// Entry point for plugin binaries.
    ///
    /// Refuses to run unless launched by the agent, except in standalone mode
    /// where the plugin serves its own endpoints over REST.
    pub async fn serve(mut self) -> PluginResult<()> {
        if let Some(capacity) = std::env::var(ENV_PLUGIN_LOG_CAPACITY)
            .ok()
            .and_then(|v| v.parse::<usize>().ok())
        {
            self.bridge = LogBridge::new(capacity);
        }
        self.init_logging();

        if std::env::var(ENV_PLUGIN_COOKIE).ok().as_deref() != Some(PLUGIN_COOKIE_VALUE) {
            return match StandaloneSettings::from_env()? {
                Some(settings) => {
                    let shutdown = CancellationToken::new();
                    tokio::spawn(cancel_on_signal(shutdown.clone()));
                    standalone::serve(self.plugin.clone(), settings, shutdown).await
                }
                None => Err(PluginError::NotLaunchedByHost),
            };
        }

        let settings = HostSettings::from_env(self.protocol)?;
        let bound = self.bind(settings).await?;

        {
            let mut stdout = std::io::stdout().lock();
            writeln!(stdout, "{}", bound.handshake())?;
            stdout.flush()?;
        }
        bound.announced();

        let shutdown = CancellationToken::new();
        tokio::spawn(cancel_on_signal(shutdown.clone()));
        bound.serve(shutdown).await
    }

    /// Installs a stderr subscriber plus the log bridge. Leaves an existing
    /// global subscriber in place.
    pub fn init_logging(&self) {
        let filter = EnvFilter::try_from_env(ENV_PLUGIN_LOG)
            .unwrap_or_else(|_| EnvFilter::new("info"));
        let result = tracing_subscriber::registry()
            .with(filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .with_writer(std::io::stderr)
                    .with_ansi(false),
            )
            .with(self.bridge.layer())
            .try_init();
        if result.is_err() {
            warn!("A global subscriber is already installed; plugin logs will not be streamed");
        }
    }

    /// Binds the transport listener on an OS-assigned loopback port.
    pub async fn bind(&self, settings: HostSettings) -> PluginResult<BoundHost> {
        let name = self.plugin.name().to_string();
        let root_path = self.plugin.root_path();
        if name.is_empty() || name.contains(':') || root_path.contains(':') {
            return Err(PluginError::MalformedHandshake {
                line: format!("{name}:{root_path}"),
                reason: "name must be non-empty and neither name nor root path may contain ':'"
                    .to_string(),
            });
        }

        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await?;
        let port = listener.local_addr()?.port();

        let transport_tls = match (&settings.tls, settings.protocol) {
            (Some(material), RpcProtocol::Legacy) => {
                TransportTls::Legacy(material.acceptor()?)
            }
            (Some(material), RpcProtocol::Grpc) => TransportTls::Grpc(material.tonic_identity()),
            (None, _) => TransportTls::None,
        };

        let handshake = Handshake {
            name,
            root_path,
            rpc_protocol: settings.protocol,
            transport_protocol: "tcp".to_string(),
            ip: Ipv4Addr::LOCALHOST,
            port,
            api_version: self.plugin.api_version().to_string(),
            options: Options {
                encryption_enabled: false,
                encryption_key: None,
                tls_enabled: settings.tls.is_some(),
            },
        };

        let service = Arc::new(HostService::new(
            self.plugin.clone(),
            self.bridge.clone(),
            settings.broker,
        ));

        Ok(BoundHost {
            handshake,
            listener,
            service,
            tls: transport_tls,
            state: self.state.clone(),
        })
    }
}

enum TransportTls {
    None,
    Legacy(tokio_rustls::TlsAcceptor),
    Grpc(tonic::transport::Identity),
}

/// A host whose listener is bound but not yet serving.
pub struct BoundHost {
    handshake: Handshake,
    listener: TcpListener,
    service: Arc<HostService>,
    tls: TransportTls,
    state: Arc<Mutex<HostState>>,
}

impl BoundHost {
    /// The line to announce on stdout.
    pub fn handshake(&self) -> &Handshake {
        &self.handshake
    }

    /// Records that the handshake has been printed.
    pub fn announced(&self) {
        *self.state.lock() = HostState::Announced;
    }

    /// Serves the transport until `shutdown` is cancelled.
    pub async fn serve(self, shutdown: CancellationToken) -> PluginResult<()> {
        *self.state.lock() = HostState::Serving;
        info!(
            plugin = %self.handshake.name,
            root_path = %self.handshake.root_path,
            protocol = %self.handshake.rpc_protocol,
            port = self.handshake.port,
            tls = self.handshake.options.tls_enabled,
            "Plugin host serving"
        );

        let handler: Arc<dyn PluginRpc> = self.service;
        let result = match self.tls {
            TransportTls::Legacy(acceptor) => {
                legacy::serve(self.listener, handler, Some(acceptor), shutdown).await
            }
            TransportTls::Grpc(identity) => {
                grpc::serve(self.listener, handler, Some(identity), shutdown).await
            }
            TransportTls::None => match self.handshake.rpc_protocol {
                RpcProtocol::Legacy => legacy::serve(self.listener, handler, None, shutdown).await,
                RpcProtocol::Grpc => grpc::serve(self.listener, handler, None, shutdown).await,
            },
        };

        *self.state.lock() = HostState::Terminated;
        info!(plugin = %self.handshake.name, "Plugin host stopped");
        result
    }
}

/// Forwards transport calls into the wrapped plugin.
pub(crate) struct HostService {
    plugin: Arc<dyn Plugin>,
    routes: RwLock<HashMap<String, Endpoint>>,
    bridge: LogBridge,
    broker: Option<BrokerClient>,
}

impl HostService {
    pub(crate) fn new(plugin: Arc<dyn Plugin>, bridge: LogBridge, broker: Option<BrokerClient>) -> Self {
        Self {
            plugin,
            routes: RwLock::new(HashMap::new()),
            bridge,
            broker,
        }
    }
}

#[async_trait]
impl PluginRpc for HostService {
    async fn register(&self, request: RegisterRequest) -> PluginResult<Registration> {
        let ctx = RegistrationContext::new(request.config, request.default_secure, self.broker.clone());
        let endpoints = self.plugin.register(ctx).await?;

        let mut routes = HashMap::with_capacity(endpoints.len());
        let mut descriptors = Vec::with_capacity(endpoints.len());
        for endpoint in endpoints {
            let key = endpoint.descriptor().route_key();
            if routes.contains_key(&key) {
                return Err(PluginError::RouteConflict {
                    key,
                    owner: self.plugin.name().to_string(),
                });
            }
            descriptors.push(endpoint.descriptor().clone());
            routes.insert(key, endpoint);
        }

        *self.routes.write() = routes;
        debug!(plugin = %self.plugin.name(), endpoints = descriptors.len(), "Registered endpoints");

        Ok(Registration {
            endpoints: descriptors,
            module_type: self.plugin.module_type().to_string(),
            capabilities: self.plugin.capabilities(),
        })
    }

    async fn call(&self, method: &str, action: Action, request: Request) -> PluginResult<Response> {
        let key = route_key(action, method);
        let endpoint = self
            .routes
            .read()
            .get(&key)
            .cloned()
            .ok_or_else(|| PluginError::NotFound(format!("no handler for {key}")))?;
        endpoint.call(request).await
    }

    async fn logging_stream(&self) -> PluginResult<LogStream> {
        Ok(self.bridge.subscribe())
    }

    async fn request_token(&self, request: TokenRequest) -> PluginResult<TokenResponse> {
        self.plugin.request_token(request).await
    }

    async fn refresh_token(&self, request: RefreshTokenRequest) -> PluginResult<TokenResponse> {
        self.plugin.refresh_token(request).await
    }
}

/// Resolves when the process receives Ctrl-C or SIGTERM.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl-C signal");
        },
        _ = terminate => {
            info!("Received terminate signal");
        },
    }
}

async fn cancel_on_signal(token: CancellationToken) {
    shutdown_signal().await;
    token.cancel();
}
