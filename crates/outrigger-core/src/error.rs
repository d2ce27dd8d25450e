//! Error types shared by the outrigger agent crates.
//!
//! Errors here are serializable so they can be embedded in API responses and
//! structured logs. Plugin lifecycle and RPC failures live in
//! `outrigger-plugin-api`; this module only covers configuration and I/O.

use serde::{Deserialize, Serialize};
use std::io;
use thiserror::Error;

/// Result type alias using OutriggerError as the error type.
pub type Result<T> = std::result::Result<T, OutriggerError>;

/// Top-level error type for agent startup and configuration.
#[derive(Debug, Error, Serialize, Deserialize)]
#[serde(tag = "type", content = "details")]
pub enum OutriggerError {
    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] IoError),
}

/// Errors raised while loading or validating configuration.
#[derive(Debug, Error, Serialize, Deserialize)]
pub enum ConfigError {
    /// Failed to load configuration
    #[error("Failed to load configuration from {path}: {reason}")]
    LoadFailed { path: String, reason: String },

    /// Invalid configuration format
    #[error("Invalid configuration format: {reason}")]
    InvalidFormat { reason: String },

    /// Invalid configuration value
    #[error("Invalid configuration value for '{field}': {reason}")]
    InvalidValue { field: String, reason: String },

    /// Two entries configure the same binary
    #[error("Duplicate plugin path: {path}")]
    DuplicatePluginPath { path: String },

    /// A plugin or module entry is unusable
    #[error("Invalid plugin configuration for '{path}': {reason}")]
    InvalidPluginConfig { path: String, reason: String },
}

impl ConfigError {
    /// Creates an invalid value error.
    pub fn invalid_value(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidValue {
            field: field.into(),
            reason: reason.into(),
        }
    }

    /// Creates an invalid plugin configuration error.
    pub fn invalid_plugin(path: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidPluginConfig {
            path: path.into(),
            reason: reason.into(),
        }
    }
}

/// Wrapper for I/O errors to make them serializable.
#[derive(Debug, Error, Serialize, Deserialize)]
#[error("I/O error: {kind:?}: {message}")]
pub struct IoError {
    pub kind: IoErrorKind,
    pub message: String,
}

impl From<io::Error> for IoError {
    fn from(err: io::Error) -> Self {
        Self {
            kind: err.kind().into(),
            message: err.to_string(),
        }
    }
}

impl From<io::Error> for OutriggerError {
    fn from(err: io::Error) -> Self {
        OutriggerError::Io(err.into())
    }
}

/// Serializable subset of std::io::ErrorKind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IoErrorKind {
    NotFound,
    PermissionDenied,
    ConnectionRefused,
    AddrInUse,
    InvalidData,
    TimedOut,
    UnexpectedEof,
    Other,
}

impl From<io::ErrorKind> for IoErrorKind {
    fn from(kind: io::ErrorKind) -> Self {
        match kind {
            io::ErrorKind::NotFound => IoErrorKind::NotFound,
            io::ErrorKind::PermissionDenied => IoErrorKind::PermissionDenied,
            io::ErrorKind::ConnectionRefused => IoErrorKind::ConnectionRefused,
            io::ErrorKind::AddrInUse => IoErrorKind::AddrInUse,
            io::ErrorKind::InvalidData => IoErrorKind::InvalidData,
            io::ErrorKind::TimedOut => IoErrorKind::TimedOut,
            io::ErrorKind::UnexpectedEof => IoErrorKind::UnexpectedEof,
            _ => IoErrorKind::Other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_serialization() {
        let err = OutriggerError::Config(ConfigError::DuplicatePluginPath {
            path: "/opt/plugins/hello.plugin".to_string(),
        });
        let json = serde_json::to_string(&err).unwrap();
        assert!(json.contains("Config"));
        assert!(json.contains("hello.plugin"));
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = io::Error::new(io::ErrorKind::PermissionDenied, "denied");
        let err: OutriggerError = io_err.into();
        match err {
            OutriggerError::Io(inner) => assert_eq!(inner.kind, IoErrorKind::PermissionDenied),
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
