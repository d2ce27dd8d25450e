use std::time::Duration;
use thiserror::Error;
use tonic::{Code, Status};

/// Plugin lifecycle, transport and dispatch errors
#[derive(Debug, Error)]
pub enum PluginError {
    #[error("Integrity check failed for {path}: expected {expected}, computed {actual}")]
    Integrity {
        path: String,
        expected: String,
        actual: String,
    },

    #[error("Unsafe permissions on {path}: {reason}")]
    Permission { path: String, reason: String },

    #[error("No handshake from {path} within {timeout:?}; output: {output:?}")]
    HandshakeTimeout {
        path: String,
        timeout: Duration,
        output: String,
    },

    #[error("Malformed handshake {line:?}: {reason}")]
    MalformedHandshake { line: String, reason: String },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Instance {name} has exited with code {exit_code}")]
    InstanceExited { name: String, exit_code: i32 },

    #[error("Route {key} is already owned by {owner}")]
    RouteConflict { key: String, owner: String },

    #[error("Transport error calling {method}: {reason}")]
    Transport { method: String, reason: String },

    #[error("Call to {method} timed out after {timeout:?}")]
    CallTimeout { method: String, timeout: Duration },

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Invalid action: {0}")]
    InvalidAction(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Unsupported option: {0}")]
    UnsupportedOption(String),

    #[error("Not launched by the outrigger host; refusing to run")]
    NotLaunchedByHost,

    #[error("Unimplemented: {0}")]
    Unimplemented(String),

    #[error("Handler error: {0}")]
    Handler(String),

    #[error("Launch failed for {path}: {reason}")]
    Launch { path: String, reason: String },

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type PluginResult<T> = Result<T, PluginError>;

impl PluginError {
    /// Creates a handler error from anything printable.
    pub fn handler(message: impl std::fmt::Display) -> Self {
        Self::Handler(message.to_string())
    }

    /// Creates a transport error for the given method.
    pub fn transport(method: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        Self::Transport {
            method: method.into(),
            reason: reason.to_string(),
        }
    }

    /// HTTP status code adapters use for this error.
    pub fn status_code(&self) -> u16 {
        match self {
            PluginError::NotFound(_) => 404,
            PluginError::Unauthorized(_) => 401,
            PluginError::Forbidden(_) => 403,
            PluginError::InvalidRequest(_) | PluginError::Serialization(_) => 400,
            PluginError::InvalidAction(_) => 405,
            PluginError::RouteConflict { .. } => 409,
            PluginError::Unimplemented(_) => 501,
            PluginError::InstanceExited { .. } | PluginError::Transport { .. } => 503,
            PluginError::CallTimeout { .. } => 504,
            _ => 500,
        }
    }

    /// Short machine-readable code used in error bodies.
    pub fn error_code(&self) -> &'static str {
        match self {
            PluginError::Integrity { .. } => "integrity_error",
            PluginError::Permission { .. } => "permission_error",
            PluginError::HandshakeTimeout { .. } => "handshake_timeout",
            PluginError::MalformedHandshake { .. } => "malformed_handshake",
            PluginError::NotFound(_) => "not_found",
            PluginError::InstanceExited { .. } => "instance_exited",
            PluginError::RouteConflict { .. } => "route_conflict",
            PluginError::Transport { .. } => "transport_error",
            PluginError::CallTimeout { .. } => "call_timeout",
            PluginError::Unauthorized(_) => "unauthorized",
            PluginError::Forbidden(_) => "forbidden",
            PluginError::InvalidAction(_) => "invalid_action",
            PluginError::InvalidRequest(_) | PluginError::Serialization(_) => "bad_request",
            PluginError::UnsupportedOption(_) => "unsupported_option",
            PluginError::NotLaunchedByHost => "not_launched_by_host",
            PluginError::Unimplemented(_) => "unimplemented",
            PluginError::Handler(_) => "handler_error",
            PluginError::Launch { .. } => "launch_error",
            PluginError::Tls(_) => "tls_error",
            PluginError::Io(_) => "io_error",
        }
    }

    /// Rebuilds an error received from the other side of an RPC boundary.
    ///
    /// Caller-facing kinds survive the round trip; anything else is reported
    /// as a transport failure of `method`.
    pub fn from_status(method: &str, status: Status) -> Self {
        let message = status.message().to_string();
        match status.code() {
            Code::NotFound => PluginError::NotFound(message),
            Code::Unauthenticated => PluginError::Unauthorized(message),
            Code::PermissionDenied => PluginError::Forbidden(message),
            Code::InvalidArgument => PluginError::InvalidRequest(message),
            Code::Unimplemented => PluginError::Unimplemented(message),
            Code::FailedPrecondition => PluginError::InvalidAction(message),
            Code::Internal => PluginError::Handler(message),
            Code::DeadlineExceeded => PluginError::CallTimeout {
                method: method.to_string(),
                timeout: Duration::ZERO,
            },
            _ => PluginError::transport(method, format!("{}: {}", status.code(), message)),
        }
    }
}

impl From<PluginError> for Status {
    fn from(err: PluginError) -> Self {
        let message = err.to_string();
        match err {
            PluginError::NotFound(m) => Status::not_found(m),
            PluginError::Unauthorized(m) => Status::unauthenticated(m),
            PluginError::Forbidden(m) => Status::permission_denied(m),
            PluginError::InvalidRequest(m) => Status::invalid_argument(m),
            PluginError::Serialization(_) => Status::invalid_argument(message),
            PluginError::Unimplemented(m) => Status::unimplemented(m),
            PluginError::InvalidAction(m) => Status::failed_precondition(m),
            PluginError::Handler(m) => Status::internal(m),
            PluginError::CallTimeout { .. } => Status::deadline_exceeded(message),
            PluginError::InstanceExited { .. } | PluginError::Transport { .. } => {
                Status::unavailable(message)
            }
            PluginError::RouteConflict { .. } => Status::already_exists(message),
            _ => Status::internal(message),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        assert_eq!(PluginError::NotFound("x".into()).status_code(), 404);
        assert_eq!(
            PluginError::InstanceExited {
                name: "hello".into(),
                exit_code: 1
            }
            .status_code(),
            503
        );
        assert_eq!(PluginError::Unauthorized("x".into()).status_code(), 401);
    }

    #[test]
    fn test_status_round_trip_keeps_caller_facing_kinds() {
        let status: Status = PluginError::NotFound("no route Read:/x".into()).into();
        match PluginError::from_status("/x", status) {
            PluginError::NotFound(msg) => assert_eq!(msg, "no route Read:/x"),
            other => panic!("unexpected error: {other:?}"),
        }

        let status: Status = PluginError::handler("boom").into();
        assert!(matches!(
            PluginError::from_status("/x", status),
            PluginError::Handler(m) if m == "boom"
        ));
    }

    #[test]
    fn test_unavailable_becomes_transport_error() {
        let err = PluginError::from_status("/ping", Status::unavailable("connection refused"));
        match err {
            PluginError::Transport { method, reason } => {
                assert_eq!(method, "/ping");
                assert!(reason.contains("connection refused"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
