//! Configuration management for the outrigger agent.
//!
//! This module provides the configuration consumed at startup:
//! - Loading from YAML files
//! - Environment variable overrides (`OUTRIGGER__SECTION__FIELD`)
//! - Validation of plugin entries, loader timeouts, TLS material and API settings

use crate::error::{ConfigError, Result};
use crate::types::InstanceKind;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::Level;

/// Main application configuration.
///
/// # Examples
///
/// ```no_run
/// use outrigger_core::config::AppConfig;
///
/// let config = AppConfig::from_file("config.yaml").unwrap();
/// config.validate().unwrap();
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Agent-wide settings
    #[serde(default)]
    pub agent: AgentConfig,

    /// Discovery and launch settings
    #[serde(default)]
    pub loader: LoaderConfig,

    /// Plugin binaries
    #[serde(default)]
    pub plugins: Vec<PluginConfig>,

    /// Module binaries
    #[serde(default)]
    pub modules: Vec<ModuleConfig>,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// REST and gRPC front door configuration
    #[serde(default)]
    pub api: ApiConfig,
}

impl AppConfig {
    /// Creates a new default configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads configuration from a YAML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::LoadFailed {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;

        Self::from_yaml(&contents)
    }

    /// Loads configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml).map_err(|e| {
            ConfigError::InvalidFormat {
                reason: e.to_string(),
            }
            .into()
        })
    }

    /// Loads configuration using the `config` crate so any field can be
    /// overridden from the environment, e.g. `OUTRIGGER__API__PORT=9000`.
    pub fn from_config_builder<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        let config = config::Config::builder()
            .add_source(config::File::from(path).required(true))
            .add_source(
                config::Environment::with_prefix("OUTRIGGER")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| ConfigError::LoadFailed {
                path: path.display().to_string(),
                reason: e.to_string(),
            })?;

        config.try_deserialize().map_err(|e| {
            ConfigError::InvalidFormat {
                reason: e.to_string(),
            }
            .into()
        })
    }

    /// Validates the configuration.
    ///
    /// Checks for:
    /// - Empty or duplicate binary paths
    /// - Malformed integrity hashes
    /// - Loader timeouts of zero
    /// - Half-configured transport TLS
    /// - A usable API port
    pub fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();
        let entries = self
            .plugins
            .iter()
            .map(|p| (InstanceKind::Plugin, p))
            .chain(self.modules.iter().map(|m| (InstanceKind::Module, m)));

        for (kind, entry) in entries {
            entry.validate(kind)?;
            if !seen.insert(entry.path.clone()) {
                return Err(ConfigError::DuplicatePluginPath {
                    path: entry.path.display().to_string(),
                }
                .into());
            }
        }

        self.loader.validate()?;
        self.api.validate()?;
        self.logging.parse_level()?;

        Ok(())
    }

    /// Returns the configured entry for a discovered binary, if any.
    pub fn entry_for(&self, kind: InstanceKind, candidate: &Path) -> Option<&PluginConfig> {
        let entries = match kind {
            InstanceKind::Plugin => &self.plugins,
            InstanceKind::Module => &self.modules,
        };
        entries.iter().find(|entry| entry.matches(candidate))
    }
}

/// Agent-wide settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Agent name, used in logs and API documentation
    #[serde(default = "default_agent_name")]
    pub name: String,

    /// Require authentication on built-in control endpoints
    #[serde(default = "default_true")]
    pub secure_by_default: bool,

    /// Graceful shutdown timeout in seconds
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_secs: u64,
}

fn default_agent_name() -> String {
    "outrigger".to_string()
}

fn default_true() -> bool {
    true
}

fn default_shutdown_timeout() -> u64 {
    10
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            name: default_agent_name(),
            secure_by_default: true,
            shutdown_timeout_secs: default_shutdown_timeout(),
        }
    }
}

/// Discovery, launch and RPC settings for child binaries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoaderConfig {
    /// Directory scanned for `*.plugin` / `*.module` binaries
    #[serde(default = "default_plugin_dir")]
    pub directory: PathBuf,

    /// Launch binaries that have no matching configuration entry
    #[serde(default)]
    pub load_unconfigured: bool,

    /// Time allowed for a child to print its handshake line
    #[serde(default = "default_handshake_timeout")]
    pub handshake_timeout_secs: u64,

    /// Upper bound for one RPC round trip
    #[serde(default = "default_call_timeout")]
    pub call_timeout_secs: u64,

    /// Capacity of each child's log channel
    #[serde(default = "default_log_channel_capacity")]
    pub log_channel_capacity: usize,

    /// Serve the plugin-to-plugin broker on loopback
    #[serde(default = "default_true")]
    pub broker_enabled: bool,

    /// TLS material handed to children for their RPC listener
    #[serde(default)]
    pub tls: Option<TransportTlsConfig>,
}

fn default_plugin_dir() -> PathBuf {
    PathBuf::from("./plugins")
}

fn default_handshake_timeout() -> u64 {
    5
}

fn default_call_timeout() -> u64 {
    30
}

fn default_log_channel_capacity() -> usize {
    1024
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            directory: default_plugin_dir(),
            load_unconfigured: false,
            handshake_timeout_secs: default_handshake_timeout(),
            call_timeout_secs: default_call_timeout(),
            log_channel_capacity: default_log_channel_capacity(),
            broker_enabled: true,
            tls: None,
        }
    }
}

impl LoaderConfig {
    /// Returns the handshake timeout as a Duration.
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }

    /// Returns the RPC call timeout as a Duration.
    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs)
    }

    fn validate(&self) -> Result<()> {
        if self.handshake_timeout_secs == 0 {
            return Err(ConfigError::invalid_value(
                "loader.handshake_timeout_secs",
                "must be greater than 0",
            )
            .into());
        }
        if self.call_timeout_secs == 0 {
            return Err(
                ConfigError::invalid_value("loader.call_timeout_secs", "must be greater than 0")
                    .into(),
            );
        }
        if self.log_channel_capacity == 0 {
            return Err(ConfigError::invalid_value(
                "loader.log_channel_capacity",
                "must be greater than 0",
            )
            .into());
        }
        if let Some(ref tls) = self.tls {
            tls.validate()?;
        }
        Ok(())
    }
}

/// Certificate and key used by children to upgrade their RPC listener.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportTlsConfig {
    /// PEM certificate path
    pub cert_path: PathBuf,

    /// PEM private key path
    pub key_path: PathBuf,

    /// Name the certificate is issued for
    #[serde(default = "default_server_name")]
    pub server_name: String,
}

fn default_server_name() -> String {
    "localhost".to_string()
}

impl TransportTlsConfig {
    fn validate(&self) -> Result<()> {
        if !self.cert_path.exists() {
            return Err(ConfigError::invalid_value(
                "loader.tls.cert_path",
                format!("certificate not found: {}", self.cert_path.display()),
            )
            .into());
        }
        if !self.key_path.exists() {
            return Err(ConfigError::invalid_value(
                "loader.tls.key_path",
                format!("key not found: {}", self.key_path.display()),
            )
            .into());
        }
        Ok(())
    }
}

/// Configuration for one plugin binary. Identity is the binary path.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginConfig {
    /// Binary path, absolute or relative to the loader directory
    pub path: PathBuf,

    /// Overrides the root path announced by the child
    #[serde(default)]
    pub root_path: Option<String>,

    /// Whether the binary should be launched
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Expected hex digest of the binary
    #[serde(default)]
    pub hash: Option<String>,

    /// Unix user the child runs as
    #[serde(default)]
    pub user: Option<String>,

    /// Opaque settings forwarded in the Register call
    #[serde(default)]
    pub config: serde_json::Map<String, serde_json::Value>,
}

/// Modules are configured exactly like plugins.
pub type ModuleConfig = PluginConfig;

impl PluginConfig {
    /// Creates an enabled entry with no hash for the given binary.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            root_path: None,
            enabled: true,
            hash: None,
            user: None,
            config: serde_json::Map::new(),
        }
    }

    /// Returns true if this entry describes `candidate`.
    pub fn matches(&self, candidate: &Path) -> bool {
        candidate == self.path || candidate.ends_with(&self.path)
    }

    /// Validates the entry for the given binary kind.
    pub fn validate(&self, kind: InstanceKind) -> Result<()> {
        let display = self.path.display().to_string();
        if self.path.as_os_str().is_empty() {
            return Err(ConfigError::invalid_plugin(display, "path cannot be empty").into());
        }

        if let Some(ref hash) = self.hash {
            let algorithm = kind.hash_algorithm();
            if !algorithm.is_valid_hex(hash) {
                return Err(ConfigError::invalid_plugin(
                    display,
                    format!("hash must be a {} character {} hex digest", algorithm.hex_len(), algorithm),
                )
                .into());
            }
        }

        if let Some(ref root) = self.root_path {
            if !root.starts_with('/') {
                return Err(
                    ConfigError::invalid_plugin(display, "root_path must start with '/'").into(),
                );
            }
        }

        Ok(())
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format: "text" or "json"
    #[serde(default = "default_log_format")]
    pub format: LogFormat,

    /// Whether to include file/line info
    #[serde(default)]
    pub file_line: bool,

    /// Per-module log levels
    #[serde(default)]
    pub module_levels: HashMap<String, String>,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> LogFormat {
    LogFormat::Text
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::Text,
            file_line: false,
            module_levels: HashMap::new(),
        }
    }
}

impl LoggingConfig {
    /// Parses the log level string to a tracing Level.
    pub fn parse_level(&self) -> Result<Level> {
        self.level.parse().map_err(|_| {
            ConfigError::InvalidValue {
                field: "logging.level".to_string(),
                reason: format!("Invalid log level: {}", self.level),
            }
            .into()
        })
    }

    /// Builds an `EnvFilter` directive string from the global and per-module levels.
    pub fn filter_directives(&self) -> String {
        let mut modules: Vec<_> = self.module_levels.iter().collect();
        modules.sort();
        std::iter::once(self.level.clone())
            .chain(modules.into_iter().map(|(module, level)| format!("{module}={level}")))
            .collect::<Vec<_>>()
            .join(",")
    }
}

/// Log format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable text format
    Text,
    /// JSON format for structured logging
    Json,
}

/// REST and gRPC front door configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    /// Bind host for both adapters
    #[serde(default = "default_api_host")]
    pub host: String,

    /// REST port
    #[serde(default = "default_api_port")]
    pub port: u16,

    /// gRPC front door port (0 disables it)
    #[serde(default)]
    pub grpc_port: u16,

    /// Whether to enable permissive CORS
    #[serde(default = "default_true")]
    pub cors: bool,

    /// Maximum request body size in bytes
    #[serde(default = "default_max_body_size")]
    pub max_body_size: usize,

    /// HMAC secret used to verify bearer tokens
    #[serde(default = "default_jwt_secret")]
    pub jwt_secret: String,
}

fn default_api_host() -> String {
    "127.0.0.1".to_string()
}

fn default_api_port() -> u16 {
    8080
}

fn default_max_body_size() -> usize {
    4 * 1024 * 1024
}

fn default_jwt_secret() -> String {
    "change-me-in-production".to_string()
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: default_api_host(),
            port: default_api_port(),
            grpc_port: 0,
            cors: true,
            max_body_size: default_max_body_size(),
            jwt_secret: default_jwt_secret(),
        }
    }
}

impl ApiConfig {
    /// Validates the API configuration.
    pub fn validate(&self) -> Result<()> {
        if self.port == 0 {
            return Err(ConfigError::invalid_value("api.port", "Port cannot be 0").into());
        }
        if self.grpc_port != 0 && self.grpc_port == self.port {
            return Err(ConfigError::invalid_value(
                "api.grpc_port",
                "must differ from the REST port",
            )
            .into());
        }
        Ok(())
    }

    /// Returns the REST bind address.
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Returns the gRPC bind address, if the front door is enabled.
    pub fn grpc_bind_address(&self) -> Option<String> {
        (self.grpc_port != 0).then(|| format!("{}:{}", self.host, self.grpc_port))
    }
}
