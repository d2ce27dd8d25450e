use crate::broker::BrokerClient;
use crate::endpoint::Endpoint;
use crate::error::{PluginError, PluginResult};
use crate::message::{RefreshTokenRequest, TokenRequest, TokenResponse};
use async_trait::async_trait;
use serde::de::DeserializeOwned;

/// A capability provider served from a child process.
///
/// Implementors name themselves explicitly; the host never inspects types to
/// derive a name.
#[async_trait]
pub trait Plugin: Send + Sync + 'static {
    /// Name announced in the handshake. Must not contain `:`.
    fn name(&self) -> &str;

    /// Path every endpoint of this plugin is rooted under.
    fn root_path(&self) -> String {
        format!("/{}", self.name())
    }

    fn api_version(&self) -> &str {
        crate::PLUGIN_API_VERSION
    }

    /// Free-form kind reported at registration ("plugin", "module", ...).
    fn module_type(&self) -> &str {
        "plugin"
    }

    fn capabilities(&self) -> Vec<String> {
        Vec::new()
    }

    /// Returns the endpoints this plugin serves, with paths relative to
    /// [`Plugin::root_path`].
    async fn register(&self, ctx: RegistrationContext) -> PluginResult<Vec<Endpoint>>;

    async fn request_token(&self, _request: TokenRequest) -> PluginResult<TokenResponse> {
        Err(PluginError::Unimplemented(format!(
            "{} does not issue tokens",
            self.name()
        )))
    }

    async fn refresh_token(&self, _request: RefreshTokenRequest) -> PluginResult<TokenResponse> {
        Err(PluginError::Unimplemented(format!(
            "{} does not refresh tokens",
            self.name()
        )))
    }
}

/// What a plugin receives when asked to register.
#[derive(Clone, Default)]
pub struct RegistrationContext {
    config: serde_json::Map<String, serde_json::Value>,
    default_secure: bool,
    broker: Option<BrokerClient>,
}

impl RegistrationContext {
    pub fn new(
        config: serde_json::Map<String, serde_json::Value>,
        default_secure: bool,
        broker: Option<BrokerClient>,
    ) -> Self {
        Self {
            config,
            default_secure,
            broker,
        }
    }

    /// Settings from the plugin's configuration entry.
    pub fn config(&self) -> &serde_json::Map<String, serde_json::Value> {
        &self.config
    }

    /// Decodes one configuration value, if present.
    pub fn config_value<T: DeserializeOwned>(&self, key: &str) -> PluginResult<Option<T>> {
        self.config
            .get(key)
            .map(|v| serde_json::from_value(v.clone()))
            .transpose()
            .map_err(|e| PluginError::InvalidRequest(format!("config key '{key}': {e}")))
    }

    /// Whether the agent asks endpoints to require authentication by default.
    pub fn default_secure(&self) -> bool {
        self.default_secure
    }

    /// Client for calling other plugins through the agent.
    pub fn broker(&self) -> Option<&BrokerClient> {
        self.broker.as_ref()
    }
}
