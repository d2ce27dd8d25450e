//! Parent-side loader
//!
//! Owns every launched child: its process, RPC client and the routes it
//! contributes. The instance table and the route map live behind one lock so
//! adapters, the broker and load/unload requests can run concurrently.

use futures::StreamExt;
use outrigger_core::config::LoaderConfig;
use outrigger_core::{AppConfig, InstanceKind, PluginConfig};
use outrigger_plugin_api::endpoint::{join_path, route_key, HandlerFn};
use outrigger_plugin_api::message::RegisterRequest;
use outrigger_plugin_api::{
    transport, Action, ClientTls, Endpoint, EndpointDescriptor, EndpointResolver, LogMessage,
    PluginError, PluginResult, Request, Response, TlsMaterial,
};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::control;
use crate::instance::{Instance, InstanceSummary};
use crate::launch::{self, LaunchSettings};

/// Owner name of the loader's own control endpoints.
pub const AGENT_OWNER: &str = "agent";

/// Resolved target of one route.
#[derive(Debug, Clone)]
pub struct HandlerEntry {
    /// Instance name, or [`AGENT_OWNER`].
    pub owner: String,
    /// Path the owner registered the handler under, relative to its root.
    pub handler: String,
    pub endpoint: Endpoint,
}

#[derive(Default)]
struct LoaderState {
    instances: HashMap<String, Arc<Instance>>,
    /// Keyed by `route_key(action, full_path)`.
    routes: HashMap<String, HandlerEntry>,
    /// Broker token -> instance name.
    tokens: HashMap<String, String>,
}

/// Discovers, launches and tracks plugin and module instances.
pub struct Loader {
    me: Weak<Loader>,
    directory: PathBuf,
    load_unconfigured: bool,
    call_timeout: Duration,
    plugins: Vec<PluginConfig>,
    modules: Vec<PluginConfig>,
    launch: RwLock<LaunchSettings>,
    client_tls: Option<ClientTls>,
    default_secure: AtomicBool,
    state: RwLock<LoaderState>,
    shutdown: CancellationToken,
}

impl Loader {
    /// Builds a loader from the agent configuration. TLS material named in
    /// the loader section is read here.
    pub fn from_config(config: &AppConfig) -> PluginResult<Arc<Self>> {
        let tls = match config.loader.tls {
            Some(ref tls) => Some((
                TlsMaterial::from_files(&tls.cert_path, &tls.key_path)?,
                tls.server_name.clone(),
            )),
            None => None,
        };
        Ok(Self::new(
            &config.loader,
            config.plugins.clone(),
            config.modules.clone(),
            tls,
        ))
    }

    pub fn new(
        settings: &LoaderConfig,
        plugins: Vec<PluginConfig>,
        modules: Vec<PluginConfig>,
        tls: Option<(TlsMaterial, String)>,
    ) -> Arc<Self> {
        let client_tls = tls
            .as_ref()
            .map(|(material, server_name)| material.client(server_name.clone()));
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            directory: settings.directory.clone(),
            load_unconfigured: settings.load_unconfigured,
            call_timeout: settings.call_timeout(),
            plugins,
            modules,
            launch: RwLock::new(LaunchSettings {
                handshake_timeout: settings.handshake_timeout(),
                log_capacity: settings.log_channel_capacity,
                tls: tls.map(|(material, _)| material),
                broker: None,
            }),
            client_tls,
            default_secure: AtomicBool::new(true),
            state: RwLock::new(LoaderState::default()),
            shutdown: CancellationToken::new(),
        })
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    pub fn default_secure(&self) -> bool {
        self.default_secure.load(Ordering::Acquire)
    }

    /// Address children use to reach the broker service, once started.
    pub fn broker_address(&self) -> Option<SocketAddr> {
        self.launch.read().broker
    }

    pub(crate) fn set_broker_address(&self, address: SocketAddr) {
        self.launch.write().broker = Some(address);
    }

    /// Token cancelled when the loader shuts down.
    pub fn shutdown_token(&self) -> &CancellationToken {
        &self.shutdown
    }

    // ========================================================================
    // Discovery and lifecycle
    // ========================================================================

    /// Launches and registers every enabled binary in the plugin directory,
    /// then publishes the control endpoints.
    ///
    /// One failing binary never stops the sweep; its error is logged and it is
    /// skipped. Returns the names of the instances that loaded.
    pub async fn initialize(&self, secure_by_default: bool) -> PluginResult<Vec<String>> {
        self.default_secure.store(secure_by_default, Ordering::Release);
        self.publish_control_endpoints(secure_by_default)?;

        let candidates = match self.list_plugins() {
            Ok(candidates) => candidates,
            Err(e) => {
                warn!(directory = %self.directory.display(), error = %e, "Plugin directory is not readable");
                Vec::new()
            }
        };

        let mut loaded = Vec::new();
        for path in candidates {
            let Some(kind) = InstanceKind::from_path(&path) else {
                continue;
            };
            let Some(config) = self.config_for(kind, &path) else {
                debug!(path = %path.display(), "Skipping unconfigured binary");
                continue;
            };
            if !config.enabled {
                info!(path = %path.display(), "Skipping disabled {kind}");
                continue;
            }

            match self.load(kind, config).await {
                Ok(name) => loaded.push(name),
                Err(e) => error!(path = %path.display(), error = %e, "Failed to load {kind}"),
            }
        }

        info!(
            loaded = loaded.len(),
            directory = %self.directory.display(),
            "Loader initialized"
        );
        Ok(loaded)
    }

    /// Binaries in the plugin directory carrying a plugin or module suffix.
    pub fn list_plugins(&self) -> PluginResult<Vec<PathBuf>> {
        launch::discover(&self.directory)
    }

    /// Configuration for a discovered binary, or `None` when it is not
    /// configured and unconfigured binaries are not loaded.
    fn config_for(&self, kind: InstanceKind, path: &Path) -> Option<PluginConfig> {
        let entries = match kind {
            InstanceKind::Plugin => &self.plugins,
            InstanceKind::Module => &self.modules,
        };
        let mut config = match entries.iter().find(|entry| entry.matches(path)) {
            Some(entry) => entry.clone(),
            None if self.load_unconfigured => PluginConfig::new(path),
            None => return None,
        };
        config.path = path.to_path_buf();
        Some(config)
    }

    /// Launches and registers one binary. An instance that fails to register
    /// is closed again.
    pub async fn load(&self, kind: InstanceKind, config: PluginConfig) -> PluginResult<String> {
        let instance = self.launch_plugin(kind, config).await?;
        let name = instance.name.clone();
        if let Err(e) = self.register_plugin(&name).await {
            self.forget(&instance);
            return Err(e);
        }
        Ok(name)
    }

    /// Drops `instance` from the tables if it is still the one loaded under
    /// its name, then terminates it.
    fn forget(&self, instance: &Arc<Instance>) {
        {
            let mut state = self.state.write();
            let current = state
                .instances
                .get(&instance.name)
                .is_some_and(|loaded| Arc::ptr_eq(loaded, instance));
            if current {
                state.instances.remove(&instance.name);
                state.routes.retain(|_, entry| entry.owner != instance.name);
            }
            if let Some(ref token) = instance.broker_token {
                state.tokens.remove(token);
            }
        }
        instance.clear_registration();
        instance.cancel();
    }

    /// Loads the binary in the plugin directory whose file name or stem is
    /// `name`. The same rules as [`Loader::initialize`] apply: the binary must
    /// be configured (or unconfigured binaries allowed) and enabled.
    pub async fn load_by_name(&self, name: &str) -> PluginResult<InstanceSummary> {
        let path = self
            .list_plugins()?
            .into_iter()
            .find(|path| {
                let kind = InstanceKind::from_path(path);
                let file_name = path.file_name().and_then(|n| n.to_str()).unwrap_or_default();
                file_name == name || kind.is_some_and(|k| k.stem(file_name) == name)
            })
            .ok_or_else(|| PluginError::NotFound(format!("no binary named {name}")))?;
        let kind = InstanceKind::from_path(&path)
            .ok_or_else(|| PluginError::NotFound(format!("no binary named {name}")))?;

        let config = self.config_for(kind, &path).ok_or_else(|| {
            PluginError::Forbidden(format!(
                "{name} is not configured and unconfigured binaries are not loaded"
            ))
        })?;
        if !config.enabled {
            return Err(PluginError::Forbidden(format!("{name} is disabled")));
        }
        let loaded = self.load(kind, config).await?;
        self.instance(&loaded)
            .map(|instance| instance.summary())
            .ok_or(PluginError::NotFound(loaded))
    }

    /// Verifies, spawns and records one binary. Fails with `Integrity` on a
    /// hash mismatch, `Permission` on an unsafe file mode and
    /// `HandshakeTimeout` when no handshake arrives in time.
    pub async fn launch_plugin(
        &self,
        kind: InstanceKind,
        config: PluginConfig,
    ) -> PluginResult<Arc<Instance>> {
        let settings = self.launch.read().clone();
        let token = settings.broker.map(|_| uuid::Uuid::new_v4().to_string());
        let launched = launch::launch(kind, &config, &settings, token.as_deref()).await?;

        let root_path = config
            .root_path
            .clone()
            .unwrap_or_else(|| launched.handshake.root_path.clone());
        let instance = Arc::new(Instance::new(
            kind,
            config.path.clone(),
            root_path,
            launched.handshake,
            config,
            token,
            launched.cancel,
            launched.exit,
        ));

        {
            let mut state = self.state.write();
            if state.instances.contains_key(&instance.name) || instance.name == AGENT_OWNER {
                instance.cancel();
                return Err(PluginError::Launch {
                    path: instance.path.display().to_string(),
                    reason: format!("an instance named {} is already loaded", instance.name),
                });
            }
            if let Some(ref token) = instance.broker_token {
                state.tokens.insert(token.clone(), instance.name.clone());
            }
            state
                .instances
                .insert(instance.name.clone(), instance.clone());
        }

        info!(
            name = %instance.name,
            kind = %kind,
            root_path = %instance.root_path,
            "Launched {kind}"
        );
        Ok(instance)
    }

    /// Connects to a launched instance, registers it with its configuration
    /// and folds its endpoints into the route map under its root path.
    ///
    /// Fails as a whole if any endpoint collides with a route owned by
    /// someone else.
    pub async fn register_plugin(&self, name: &str) -> PluginResult<()> {
        let instance = self
            .instance(name)
            .ok_or_else(|| PluginError::NotFound(format!("instance {name}")))?;

        if instance.handshake.options.encryption_enabled {
            return Err(PluginError::UnsupportedOption(format!(
                "{name} requested payload encryption; use TLS instead"
            )));
        }

        let client = transport::connect(&instance.handshake, self.client_tls.as_ref()).await?;
        let registration = client
            .register(RegisterRequest {
                config: instance.config.config.clone(),
                default_secure: self.default_secure(),
            })
            .await?;

        let mut entries = Vec::with_capacity(registration.endpoints.len());
        let mut descriptors = Vec::with_capacity(registration.endpoints.len());
        for descriptor in registration.endpoints {
            let handler = descriptor.path.clone();
            let mut full = descriptor;
            full.path = join_path(&instance.root_path, &full.path);
            descriptors.push(full.clone());
            entries.push(HandlerEntry {
                owner: name.to_string(),
                handler,
                endpoint: Endpoint::from_parts(full.clone(), self.shim_handler(full)),
            });
        }

        self.install_routes(name, Some(&instance), entries)?;
        instance.set_registration(
            client.clone(),
            descriptors,
            registration.module_type,
            registration.capabilities,
        );
        self.spawn_log_consumer(&instance, client);

        info!(
            name = %name,
            endpoints = instance.endpoints().len(),
            module_type = %instance.module_type(),
            "Registered {}", instance.kind
        );
        Ok(())
    }

    /// Removes every route owned by `name`. The process keeps running.
    pub fn unregister_plugin(&self, name: &str) -> PluginResult<()> {
        let instance = self
            .instance(name)
            .ok_or_else(|| PluginError::NotFound(format!("instance {name}")))?;
        let removed = {
            let mut state = self.state.write();
            let before = state.routes.len();
            state.routes.retain(|_, entry| entry.owner != name);
            before - state.routes.len()
        };
        instance.clear_registration();
        debug!(name = %name, removed, "Unregistered routes");
        Ok(())
    }

    /// Terminates the child through its cancellation token and forgets it.
    pub fn close_plugin(&self, name: &str) -> PluginResult<()> {
        let instance = {
            let mut state = self.state.write();
            let instance = state
                .instances
                .remove(name)
                .ok_or_else(|| PluginError::NotFound(format!("instance {name}")))?;
            state.routes.retain(|_, entry| entry.owner != name);
            if let Some(ref token) = instance.broker_token {
                state.tokens.remove(token);
            }
            instance
        };
        instance.clear_registration();
        instance.cancel();
        info!(name = %name, "Closed {}", instance.kind);
        Ok(())
    }

    /// Unregisters and closes `name`.
    pub fn unload(&self, name: &str) -> PluginResult<()> {
        self.unregister_plugin(name)?;
        self.close_plugin(name)
    }

    /// Closes every instance and waits up to `timeout` for them to exit.
    pub async fn close_all(&self, timeout: Duration) {
        let instances: Vec<_> = self.state.read().instances.values().cloned().collect();
        for instance in &instances {
            if let Err(e) = self.close_plugin(&instance.name) {
                debug!(name = %instance.name, error = %e, "Instance already closed");
            }
        }
        self.shutdown.cancel();

        let exits = futures::future::join_all(instances.iter().map(|i| i.exited()));
        if tokio::time::timeout(timeout, exits).await.is_err() {
            warn!(timeout = ?timeout, "Instances did not exit in time");
        }
    }

    // ========================================================================
    // Lookup
    // ========================================================================

    pub fn instance(&self, name: &str) -> Option<Arc<Instance>> {
        self.state.read().instances.get(name).cloned()
    }

    /// Names of loaded instances, sorted.
    pub fn instance_names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.state.read().instances.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn summaries(&self) -> Vec<InstanceSummary> {
        let mut summaries: Vec<_> = self
            .state
            .read()
            .instances
            .values()
            .map(|instance| instance.summary())
            .collect();
        summaries.sort_by(|a, b| a.name.cmp(&b.name));
        summaries
    }

    pub fn route(&self, action: Action, full_path: &str) -> Option<HandlerEntry> {
        self.state
            .read()
            .routes
            .get(&route_key(action, full_path))
            .cloned()
    }

    /// Instance holding a broker token.
    pub(crate) fn token_owner(&self, token: &str) -> Option<String> {
        self.state.read().tokens.get(token).cloned()
    }

    // ========================================================================
    // Calls
    // ========================================================================

    /// Forwards a call for `endpoint` to the instance that owns its route.
    ///
    /// Fails with `NotFound` when no route matches and with `InstanceExited`
    /// when the owner has exited, before or during the call. The call is
    /// bounded by the configured call timeout.
    pub async fn call_shim(
        &self,
        endpoint: &EndpointDescriptor,
        request: Request,
    ) -> PluginResult<Response> {
        let entry = self.route(endpoint.action, &endpoint.path).ok_or_else(|| {
            PluginError::NotFound(format!("no route for {}", endpoint.route_key()))
        })?;
        let instance = self
            .instance(&entry.owner)
            .ok_or_else(|| PluginError::NotFound(format!("instance {}", entry.owner)))?;

        if let Some(exit_code) = instance.exit_code() {
            return Err(PluginError::InstanceExited {
                name: instance.name.clone(),
                exit_code,
            });
        }
        let client = instance
            .client()
            .ok_or_else(|| PluginError::NotFound(format!("{} is not registered", instance.name)))?;

        trace!(owner = %entry.owner, handler = %entry.handler, action = %endpoint.action, "Calling plugin");
        tokio::select! {
            result = client.call(&entry.handler, endpoint.action, request) => result,
            exit_code = instance.exited() => Err(PluginError::InstanceExited {
                name: instance.name.clone(),
                exit_code,
            }),
            _ = tokio::time::sleep(self.call_timeout) => Err(PluginError::CallTimeout {
                method: endpoint.path.clone(),
                timeout: self.call_timeout,
            }),
        }
    }

    fn shim_handler(&self, descriptor: EndpointDescriptor) -> HandlerFn {
        let loader = self.me.clone();
        Arc::new(move |request| {
            let loader = loader.clone();
            let descriptor = descriptor.clone();
            Box::pin(async move {
                let loader = loader
                    .upgrade()
                    .ok_or_else(|| PluginError::NotFound("loader has shut down".to_string()))?;
                loader.call_shim(&descriptor, request).await
            })
        })
    }

    // ========================================================================
    // Route map
    // ========================================================================

    /// Replaces the routes owned by `owner` with `entries`, atomically.
    ///
    /// When `instance` is given it must still be the loaded instance named
    /// `owner`; an instance closed while it was registering gets no routes.
    fn install_routes(
        &self,
        owner: &str,
        instance: Option<&Arc<Instance>>,
        entries: Vec<HandlerEntry>,
    ) -> PluginResult<()> {
        let mut state = self.state.write();

        if let Some(instance) = instance {
            let current = state
                .instances
                .get(owner)
                .is_some_and(|loaded| Arc::ptr_eq(loaded, instance));
            if !current {
                return Err(PluginError::NotFound(format!(
                    "instance {owner} was closed during registration"
                )));
            }
        }

        let mut incoming = HashMap::with_capacity(entries.len());
        for entry in entries {
            let key = entry.endpoint.descriptor().route_key();
            if let Some(existing) = state.routes.get(&key).filter(|e| e.owner != owner) {
                return Err(PluginError::RouteConflict {
                    key,
                    owner: existing.owner.clone(),
                });
            }
            if incoming.contains_key(&key) {
                return Err(PluginError::RouteConflict {
                    key,
                    owner: owner.to_string(),
                });
            }
            incoming.insert(key, entry);
        }

        state.routes.retain(|_, entry| entry.owner != owner);
        state.routes.extend(incoming);
        Ok(())
    }

    fn publish_control_endpoints(&self, secure: bool) -> PluginResult<()> {
        let entries = control::endpoints(self.me.clone(), secure)
            .into_iter()
            .map(|endpoint| HandlerEntry {
                owner: AGENT_OWNER.to_string(),
                handler: endpoint.path().to_string(),
                endpoint,
            })
            .collect();
        self.install_routes(AGENT_OWNER, None, entries)
    }

    // ========================================================================
    // Logging
    // ========================================================================

    /// Re-emits the instance's log stream under the `plugin` target until the
    /// instance or the loader stops.
    fn spawn_log_consumer(&self, instance: &Arc<Instance>, client: transport::RpcClient) {
        let name = instance.name.clone();
        let cancel = instance.cancellation().clone();
        let shutdown = self.shutdown.clone();

        tokio::spawn(async move {
            let mut stream = match client.logging_stream().await {
                Ok(stream) => stream,
                Err(e) => {
                    warn!(plugin = %name, error = %e, "Failed to open logging stream");
                    return;
                }
            };

            loop {
                let next = tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = shutdown.cancelled() => break,
                    next = stream.next() => next,
                };
                match next {
                    Some(Ok(message)) => emit(&name, &message),
                    Some(Err(e)) => {
                        debug!(plugin = %name, error = %e, "Logging stream ended with error");
                        break;
                    }
                    None => break,
                }
            }
            debug!(plugin = %name, "Logging stream closed");
        });
    }
}

fn emit(plugin: &str, message: &LogMessage) {
    let fields = &message.fields;
    let source = message.target.as_str();
    match message.level.to_ascii_uppercase().as_str() {
        "ERROR" => error!(target: "plugin", plugin, source, ?fields, "{}", message.message),
        "WARN" => warn!(target: "plugin", plugin, source, ?fields, "{}", message.message),
        "DEBUG" => debug!(target: "plugin", plugin, source, ?fields, "{}", message.message),
        "TRACE" => trace!(target: "plugin", plugin, source, ?fields, "{}", message.message),
        _ => info!(target: "plugin", plugin, source, ?fields, "{}", message.message),
    }
}

impl EndpointResolver for Loader {
    fn resolve(&self, action: Action, path: &str) -> Option<Endpoint> {
        self.route(action, path).map(|entry| entry.endpoint)
    }

    fn endpoints(&self) -> Vec<Endpoint> {
        let mut endpoints: Vec<_> = self
            .state
            .read()
            .routes
            .values()
            .map(|entry| entry.endpoint.clone())
            .collect();
        endpoints.sort_by(|a, b| {
            a.path()
                .cmp(b.path())
                .then_with(|| a.action().as_str().cmp(b.action().as_str()))
        });
        endpoints
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::{attach, loader, Fake};
    use super::*;
    use crate::instance::test_support::detached;

    fn read(path: &str) -> EndpointDescriptor {
        EndpointDescriptor::new(Action::Read, path)
    }

    #[tokio::test]
    async fn test_same_relative_path_under_distinct_roots() {
        let dir = tempfile::tempdir().unwrap();
        let loader = loader(dir.path());
        let _alpha_exit = attach(&loader, "alpha", Arc::new(Fake("alpha")), &[(Action::Read, "/status")]).unwrap();
        let _beta_exit = attach(&loader, "beta", Arc::new(Fake("beta")), &[(Action::Read, "/status")]).unwrap();

        let a = loader.call_shim(&read("/alpha/status"), Request::new()).await.unwrap();
        let b = loader.call_shim(&read("/beta/status"), Request::new()).await.unwrap();
        assert_eq!(a.value, b"alpha:/status");
        assert_eq!(b.value, b"beta:/status");
    }

    #[tokio::test]
    async fn test_unknown_route_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let loader = loader(dir.path());
        let _alpha_exit = attach(&loader, "alpha", Arc::new(Fake("alpha")), &[(Action::Read, "/status")]).unwrap();

        assert!(matches!(
            loader.call_shim(&read("/alpha/missing"), Request::new()).await,
            Err(PluginError::NotFound(_))
        ));
        assert!(matches!(
            loader
                .call_shim(&EndpointDescriptor::new(Action::Delete, "/alpha/status"), Request::new())
                .await,
            Err(PluginError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_exited_instance_fails_fast() {
        let dir = tempfile::tempdir().unwrap();
        let loader = loader(dir.path());
        let exit = attach(&loader, "alpha", Arc::new(Fake("alpha")), &[(Action::Read, "/status")]).unwrap();
        exit.send_replace(Some(2));

        assert!(matches!(
            loader.call_shim(&read("/alpha/status"), Request::new()).await,
            Err(PluginError::InstanceExited { exit_code: 2, .. })
        ));
    }

    #[tokio::test]
    async fn test_exit_during_call_interrupts_it() {
        let dir = tempfile::tempdir().unwrap();
        let loader = loader(dir.path());
        let exit = attach(&loader, "alpha", Arc::new(Fake("alpha")), &[(Action::Read, "/slow")]).unwrap();

        let call = {
            let loader = loader.clone();
            tokio::spawn(async move { loader.call_shim(&read("/alpha/slow"), Request::new()).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        exit.send_replace(Some(137));

        assert!(matches!(
            call.await.unwrap(),
            Err(PluginError::InstanceExited { exit_code: 137, .. })
        ));
    }

    #[tokio::test]
    async fn test_call_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let loader = loader(dir.path());
        let _alpha_exit = attach(&loader, "alpha", Arc::new(Fake("alpha")), &[(Action::Read, "/slow")]).unwrap();

        assert!(matches!(
            loader.call_shim(&read("/alpha/slow"), Request::new()).await,
            Err(PluginError::CallTimeout { .. })
        ));
    }

    #[tokio::test]
    async fn test_route_conflict_rejects_whole_registration() {
        let dir = tempfile::tempdir().unwrap();
        let loader = loader(dir.path());
        let _alpha_exit = attach(&loader, "alpha", Arc::new(Fake("alpha")), &[(Action::Read, "/status")]).unwrap();

        let endpoint = |path: &str| HandlerEntry {
            owner: "intruder".to_string(),
            handler: path.to_string(),
            endpoint: Endpoint::new(Action::Read, path, |_req| async { Ok(Response::new()) }),
        };
        let result = loader.install_routes(
            "intruder",
            None,
            vec![endpoint("/intruder/fine"), endpoint("/alpha/status")],
        );
        assert!(matches!(result, Err(PluginError::RouteConflict { ref owner, .. }) if owner == "alpha"));
        assert!(loader.route(Action::Read, "/intruder/fine").is_none());
    }

    #[tokio::test]
    async fn test_instance_closed_while_registering_gets_no_routes() {
        let dir = tempfile::tempdir().unwrap();
        let loader = loader(dir.path());
        let (instance, _exit) = detached("alpha");
        let instance = Arc::new(instance);
        loader
            .state
            .write()
            .instances
            .insert("alpha".to_string(), instance.clone());

        let entry = HandlerEntry {
            owner: "alpha".to_string(),
            handler: "/status".to_string(),
            endpoint: Endpoint::new(Action::Read, "/alpha/status", |_req| async { Ok(Response::new()) }),
        };
        loader.close_plugin("alpha").unwrap();
        assert!(matches!(
            loader.install_routes("alpha", Some(&instance), vec![entry.clone()]),
            Err(PluginError::NotFound(_))
        ));
        assert!(loader.route(Action::Read, "/alpha/status").is_none());

        // A newer instance under the same name does not adopt the stale registration.
        let _newer_exit = attach(&loader, "alpha", Arc::new(Fake("alpha")), &[]).unwrap();
        assert!(matches!(
            loader.install_routes("alpha", Some(&instance), vec![entry]),
            Err(PluginError::NotFound(_))
        ));
        assert!(loader.route(Action::Read, "/alpha/status").is_none());
    }

    #[tokio::test]
    async fn test_load_by_name_respects_configuration() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("stray.plugin"), "").unwrap();
        std::fs::write(dir.path().join("parked.plugin"), "").unwrap();

        let mut parked = PluginConfig::new("parked.plugin");
        parked.enabled = false;
        let settings = LoaderConfig {
            directory: dir.path().to_path_buf(),
            ..LoaderConfig::default()
        };
        let loader = Loader::new(&settings, vec![parked], Vec::new(), None);

        assert!(matches!(
            loader.load_by_name("stray").await,
            Err(PluginError::Forbidden(_))
        ));
        assert!(matches!(
            loader.load_by_name("parked").await,
            Err(PluginError::Forbidden(_))
        ));
        assert!(matches!(
            loader.load_by_name("ghost").await,
            Err(PluginError::NotFound(_))
        ));
        assert!(loader.instance_names().is_empty());
    }

    #[tokio::test]
    async fn test_unregister_then_close() {
        let dir = tempfile::tempdir().unwrap();
        let loader = loader(dir.path());
        let _alpha_exit = attach(&loader, "alpha", Arc::new(Fake("alpha")), &[(Action::Read, "/status")]).unwrap();

        loader.unregister_plugin("alpha").unwrap();
        assert!(loader.route(Action::Read, "/alpha/status").is_none());
        assert_eq!(loader.instance_names(), vec!["alpha"]);
        assert!(!loader.instance("alpha").unwrap().is_registered());

        let instance = loader.instance("alpha").unwrap();
        loader.close_plugin("alpha").unwrap();
        assert!(instance.cancellation().is_cancelled());
        assert!(loader.instance_names().is_empty());
        assert!(matches!(loader.close_plugin("alpha"), Err(PluginError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_resolver_serves_shim_endpoints() {
        let dir = tempfile::tempdir().unwrap();
        let loader = loader(dir.path());
        let _alpha_exit = attach(&loader, "alpha", Arc::new(Fake("alpha")), &[(Action::Read, "/status")]).unwrap();

        let endpoint = loader.resolve(Action::Read, "/alpha/status").unwrap();
        let response = endpoint.call(Request::new()).await.unwrap();
        assert_eq!(response.value, b"alpha:/status");
        assert_eq!(loader.endpoints().len(), 1);
    }

    #[tokio::test]
    async fn test_initialize_with_empty_directory_publishes_controls() {
        let dir = tempfile::tempdir().unwrap();
        let loader = loader(dir.path());
        let loaded = loader.initialize(true).await.unwrap();
        assert!(loaded.is_empty());

        let list = loader.resolve(Action::Read, "/agent/plugins").unwrap();
        assert!(list.descriptor().requires_auth);
        assert!(loader.resolve(Action::Create, "/agent/plugins/load").is_some());
        assert!(loader.resolve(Action::Delete, "/agent/plugins/unload").is_some());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_initialize_skips_failing_binaries() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.plugin");
        std::fs::write(&path, "#!/bin/sh\nexit 1\n").unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        std::fs::write(dir.path().join("ignored.txt"), "").unwrap();

        let settings = LoaderConfig {
            directory: dir.path().to_path_buf(),
            load_unconfigured: true,
            handshake_timeout_secs: 1,
            ..LoaderConfig::default()
        };
        let loader = Loader::new(&settings, Vec::new(), Vec::new(), None);
        let loaded = loader.initialize(false).await.unwrap();
        assert!(loaded.is_empty());
        assert!(loader.instance_names().is_empty());
    }

    #[test]
    fn test_unconfigured_binaries_need_opt_in() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hello.plugin");
        let loader = loader(dir.path());
        assert!(loader.config_for(InstanceKind::Plugin, &path).is_none());

        let mut entry = PluginConfig::new("hello.plugin");
        entry.root_path = Some("/greeter".to_string());
        let settings = LoaderConfig {
            directory: dir.path().to_path_buf(),
            ..LoaderConfig::default()
        };
        let loader = Loader::new(&settings, vec![entry], Vec::new(), None);
        let config = loader.config_for(InstanceKind::Plugin, &path).unwrap();
        assert_eq!(config.path, path);
        assert_eq!(config.root_path.as_deref(), Some("/greeter"));
        assert!(loader.config_for(InstanceKind::Module, &dir.path().join("hello.module")).is_none());
    }
}
