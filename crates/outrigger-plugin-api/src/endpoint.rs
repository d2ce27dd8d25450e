//! Protocol-agnostic endpoints.
//!
//! An [`Endpoint`] pairs an [`EndpointDescriptor`] (what adapters and API
//! documentation see) with the function that serves it. Descriptors cross the
//! process boundary during registration; handlers never do.

use crate::error::{PluginError, PluginResult};
use crate::message::{Request, Response};
use axum::http::Method;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::str::FromStr;
use std::sync::Arc;

/// What an endpoint does to its resource. Maps one-to-one onto REST verbs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Create,
    Read,
    Write,
    Delete,
}

impl Action {
    pub const ALL: [Action; 4] = [Action::Create, Action::Read, Action::Write, Action::Delete];

    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Create => "create",
            Action::Read => "read",
            Action::Write => "write",
            Action::Delete => "delete",
        }
    }

    /// REST verb serving this action.
    pub fn http_method(&self) -> Method {
        match self {
            Action::Create => Method::POST,
            Action::Read => Method::GET,
            Action::Write => Method::PUT,
            Action::Delete => Method::DELETE,
        }
    }

    /// Inverse of [`Action::http_method`]. Any other verb is rejected.
    pub fn from_http_method(method: &Method) -> PluginResult<Self> {
        Action::ALL
            .into_iter()
            .find(|action| &action.http_method() == method)
            .ok_or_else(|| PluginError::InvalidAction(format!("no action is mapped to {method}")))
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Action {
    type Err = PluginError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Action::ALL
            .into_iter()
            .find(|a| a.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| PluginError::InvalidAction(s.to_string()))
    }
}

/// Route map key for an action and path.
pub fn route_key(action: Action, path: &str) -> String {
    format!("{action}:{path}")
}

/// Normalizes a path to a leading slash and no trailing slash.
pub fn normalize_path(path: &str) -> String {
    let trimmed = path.trim_matches('/');
    let mut out = String::with_capacity(trimmed.len() + 1);
    out.push('/');
    out.push_str(trimmed);
    out
}

/// Joins an endpoint path under a root path.
pub fn join_path(root: &str, path: &str) -> String {
    let root = normalize_path(root);
    let path = normalize_path(path);
    match (root.as_str(), path.as_str()) {
        ("/", p) => p.to_string(),
        (r, "/") => r.to_string(),
        (r, p) => format!("{r}{p}"),
    }
}

/// Serializable description of one endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EndpointDescriptor {
    pub path: String,
    pub action: Action,
    #[serde(default)]
    pub requires_auth: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_group: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata_schema: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub headers_schema: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameters_schema: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body_schema: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_schema: Option<serde_json::Value>,
}

impl EndpointDescriptor {
    pub fn new(action: Action, path: impl AsRef<str>) -> Self {
        Self {
            path: normalize_path(path.as_ref()),
            action,
            requires_auth: false,
            auth_group: None,
            metadata_schema: None,
            headers_schema: None,
            parameters_schema: None,
            body_schema: None,
            output_schema: None,
        }
    }

    pub fn route_key(&self) -> String {
        route_key(self.action, &self.path)
    }
}

/// Boxed endpoint function.
pub type HandlerFn =
    Arc<dyn Fn(Request) -> BoxFuture<'static, PluginResult<Response>> + Send + Sync>;

/// A callable endpoint.
#[derive(Clone)]
pub struct Endpoint {
    descriptor: EndpointDescriptor,
    handler: HandlerFn,
}

impl Endpoint {
    /// Creates an endpoint from an async function.
    ///
    /// ```
    /// use outrigger_plugin_api::{Action, Endpoint, Response};
    ///
    /// let endpoint = Endpoint::new(Action::Read, "/hello", |_req| async {
    ///     Response::json(&serde_json::json!({ "message": "hello" }))
    /// });
    /// assert_eq!(endpoint.path(), "/hello");
    /// ```
    pub fn new<F, Fut>(action: Action, path: impl AsRef<str>, handler: F) -> Self
    where
        F: Fn(Request) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = PluginResult<Response>> + Send + 'static,
    {
        Self {
            descriptor: EndpointDescriptor::new(action, path),
            handler: Arc::new(move |req| Box::pin(handler(req))),
        }
    }

    /// Creates an endpoint from a descriptor and an already boxed handler.
    pub fn from_parts(descriptor: EndpointDescriptor, handler: HandlerFn) -> Self {
        Self {
            descriptor,
            handler,
        }
    }

    pub fn requires_auth(mut self, group: Option<&str>) -> Self {
        self.descriptor.requires_auth = true;
        self.descriptor.auth_group = group.map(str::to_string);
        self
    }

    pub fn with_metadata_schema(mut self, schema: serde_json::Value) -> Self {
        self.descriptor.metadata_schema = Some(schema);
        self
    }

    pub fn with_headers_schema(mut self, schema: serde_json::Value) -> Self {
        self.descriptor.headers_schema = Some(schema);
        self
    }

    pub fn with_parameters_schema(mut self, schema: serde_json::Value) -> Self {
        self.descriptor.parameters_schema = Some(schema);
        self
    }

    pub fn with_body_schema(mut self, schema: serde_json::Value) -> Self {
        self.descriptor.body_schema = Some(schema);
        self
    }

    pub fn with_output_schema(mut self, schema: serde_json::Value) -> Self {
        self.descriptor.output_schema = Some(schema);
        self
    }

    pub fn descriptor(&self) -> &EndpointDescriptor {
        &self.descriptor
    }

    pub fn path(&self) -> &str {
        &self.descriptor.path
    }

    pub fn action(&self) -> Action {
        self.descriptor.action
    }

    /// Same handler, path moved under `root`.
    pub fn rooted(&self, root: &str) -> Self {
        let mut descriptor = self.descriptor.clone();
        descriptor.path = join_path(root, &descriptor.path);
        Self {
            descriptor,
            handler: self.handler.clone(),
        }
    }

    /// Invokes the endpoint function.
    pub fn call(&self, request: Request) -> BoxFuture<'static, PluginResult<Response>> {
        (self.handler)(request)
    }
}

impl fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Endpoint")
            .field("descriptor", &self.descriptor)
            .finish_non_exhaustive()
    }
}
