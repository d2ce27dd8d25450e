//! # Outrigger Core
//!
//! Configuration, error handling and shared types for the outrigger agent.
//!
//! - **Types**: `InstanceKind` (plugin or module) and the `HashAlgorithm`
//!   each kind is verified with.
//! - **Errors**: serializable configuration and I/O errors built with `thiserror`.
//! - **Configuration**: YAML files with `OUTRIGGER__*` environment overrides
//!   and validation of plugin entries, loader timeouts and API settings.
//!
//! ## Example
//!
//! ```
//! use outrigger_core::config::AppConfig;
//!
//! let config = AppConfig::from_yaml("plugins:\n  - path: hello.plugin\n").unwrap();
//! assert!(config.validate().is_ok());
//! ```

pub mod config;
pub mod error;
pub mod types;

// Re-export commonly used types for convenience
pub use config::{AppConfig, PluginConfig};
pub use error::{OutriggerError, Result};
pub use types::{HashAlgorithm, InstanceKind};
