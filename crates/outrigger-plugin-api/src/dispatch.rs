//! Protocol-neutral request dispatch shared by every adapter.
//!
//! Adapters turn wire requests into a [`Request`], pick an [`Action`] and a
//! full path, and hand both to a [`Dispatcher`]. The dispatcher resolves the
//! endpoint, enforces its auth requirement and runs it.

use crate::endpoint::{normalize_path, route_key, Action, Endpoint};
use crate::error::{PluginError, PluginResult};
use crate::message::{Request, Response, META_AUTH_SUBJECT};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// Authenticated caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Identity {
    pub subject: String,
    #[serde(default)]
    pub groups: Vec<String>,
}

impl Identity {
    pub fn in_group(&self, group: &str) -> bool {
        self.groups.iter().any(|g| g == group)
    }
}

/// Validates caller credentials carried in a request's headers.
#[async_trait]
pub trait Authenticator: Send + Sync + 'static {
    async fn authenticate(&self, request: &Request) -> PluginResult<Identity>;
}

/// Source of endpoints keyed by action and full path.
pub trait EndpointResolver: Send + Sync + 'static {
    fn resolve(&self, action: Action, path: &str) -> Option<Endpoint>;

    /// Every endpoint currently served, for documentation.
    fn endpoints(&self) -> Vec<Endpoint>;
}

/// Fixed endpoint table built once.
#[derive(Debug, Default)]
pub struct StaticResolver {
    routes: HashMap<String, Endpoint>,
}

impl StaticResolver {
    /// Fails if two endpoints share an action and path.
    pub fn new(endpoints: impl IntoIterator<Item = Endpoint>) -> PluginResult<Self> {
        let mut routes = HashMap::new();
        for endpoint in endpoints {
            let key = endpoint.descriptor().route_key();
            if routes.contains_key(&key) {
                return Err(PluginError::RouteConflict {
                    key,
                    owner: "static".to_string(),
                });
            }
            routes.insert(key, endpoint);
        }
        Ok(Self { routes })
    }
}

impl EndpointResolver for StaticResolver {
    fn resolve(&self, action: Action, path: &str) -> Option<Endpoint> {
        self.routes.get(&route_key(action, path)).cloned()
    }

    fn endpoints(&self) -> Vec<Endpoint> {
        let mut endpoints: Vec<_> = self.routes.values().cloned().collect();
        endpoints.sort_by(|a, b| a.path().cmp(b.path()));
        endpoints
    }
}

/// Resolves, authorizes and invokes endpoints.
#[derive(Clone)]
pub struct Dispatcher {
    resolver: Arc<dyn EndpointResolver>,
    authenticator: Option<Arc<dyn Authenticator>>,
}

impl Dispatcher {
    pub fn new(resolver: Arc<dyn EndpointResolver>) -> Self {
        Self {
            resolver,
            authenticator: None,
        }
    }

    pub fn with_authenticator(mut self, authenticator: Arc<dyn Authenticator>) -> Self {
        self.authenticator = Some(authenticator);
        self
    }

    pub fn resolver(&self) -> &Arc<dyn EndpointResolver> {
        &self.resolver
    }

    /// Dispatches a request for `action` on `path`.
    pub async fn dispatch(&self, action: Action, path: &str, request: Request) -> PluginResult<Response> {
        let path = normalize_path(path);
        let endpoint = self
            .resolver
            .resolve(action, &path)
            .ok_or_else(|| PluginError::NotFound(format!("no endpoint for {}", route_key(action, &path))))?;
        self.invoke(&endpoint, request).await
    }

    /// Runs `endpoint`, enforcing its auth requirement first.
    pub async fn invoke(&self, endpoint: &Endpoint, mut request: Request) -> PluginResult<Response> {
        let descriptor = endpoint.descriptor();
        if descriptor.requires_auth {
            let identity = self.authorize(descriptor.auth_group.as_deref(), &request).await?;
            request
                .metadata
                .insert(META_AUTH_SUBJECT.to_string(), identity.subject);
        } else {
            // A caller must not be able to forge an authenticated subject.
            request.metadata.remove(META_AUTH_SUBJECT);
        }

        debug!(action = %descriptor.action, path = %descriptor.path, "Dispatching request");
        endpoint.call(request).await
    }

    async fn authorize(&self, group: Option<&str>, request: &Request) -> PluginResult<Identity> {
        let authenticator = self
            .authenticator
            .as_ref()
            .ok_or_else(|| PluginError::Unauthorized("authentication is not configured".into()))?;
        let identity = authenticator.authenticate(request).await?;

        if let Some(group) = group {
            if !identity.in_group(group) {
                return Err(PluginError::Forbidden(format!(
                    "{} is not a member of {group}",
                    identity.subject
                )));
            }
        }
        Ok(identity)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct HeaderAuth;

    #[async_trait]
    impl Authenticator for HeaderAuth {
        async fn authenticate(&self, request: &Request) -> PluginResult<Identity> {
            match request.header("authorization") {
                Some("Bearer admin") => Ok(Identity {
                    subject: "admin".to_string(),
                    groups: vec!["ops".to_string()],
                }),
                Some("Bearer guest") => Ok(Identity {
                    subject: "guest".to_string(),
                    groups: vec![],
                }),
                _ => Err(PluginError::Unauthorized("bad token".to_string())),
            }
        }
    }

    fn whoami() -> Endpoint {
        Endpoint::new(Action::Read, "/svc/whoami", |req| async move {
            Ok(Response::from_bytes(
                req.metadata.get(META_AUTH_SUBJECT).cloned().unwrap_or_default(),
            ))
        })
    }

    fn dispatcher() -> Dispatcher {
        let resolver = StaticResolver::new(vec![
            whoami(),
            whoami().requires_auth(None).rooted("/secure"),
            whoami().requires_auth(Some("ops")).rooted("/ops"),
        ])
        .unwrap();
        Dispatcher::new(Arc::new(resolver)).with_authenticator(Arc::new(HeaderAuth))
    }

    #[tokio::test]
    async fn test_open_endpoint_strips_forged_subject() {
        let response = dispatcher()
            .dispatch(
                Action::Read,
                "/svc/whoami/",
                Request::new().with_metadata(META_AUTH_SUBJECT, "root"),
            )
            .await
            .unwrap();
        assert!(response.value.is_empty());
    }

    #[tokio::test]
    async fn test_auth_required_before_handler_runs() {
        let d = dispatcher();
        assert!(matches!(
            d.dispatch(Action::Read, "/secure/svc/whoami", Request::new()).await,
            Err(PluginError::Unauthorized(_))
        ));

        let ok = d
            .dispatch(
                Action::Read,
                "/secure/svc/whoami",
                Request::new().with_header("Authorization", "Bearer guest"),
            )
            .await
            .unwrap();
        assert_eq!(ok.value, b"guest");
    }

    #[tokio::test]
    async fn test_auth_group_enforced() {
        let d = dispatcher();
        let guest = Request::new().with_header("authorization", "Bearer guest");
        assert!(matches!(
            d.dispatch(Action::Read, "/ops/svc/whoami", guest).await,
            Err(PluginError::Forbidden(_))
        ));

        let admin = Request::new().with_header("authorization", "Bearer admin");
        assert_eq!(
            d.dispatch(Action::Read, "/ops/svc/whoami", admin).await.unwrap().value,
            b"admin"
        );
    }

    #[tokio::test]
    async fn test_unknown_route_and_wrong_action() {
        let d = dispatcher();
        assert!(matches!(
            d.dispatch(Action::Read, "/nope", Request::new()).await,
            Err(PluginError::NotFound(_))
        ));
        assert!(matches!(
            d.dispatch(Action::Delete, "/svc/whoami", Request::new()).await,
            Err(PluginError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_missing_authenticator_is_unauthorized() {
        let resolver = StaticResolver::new(vec![whoami().requires_auth(None)]).unwrap();
        let d = Dispatcher::new(Arc::new(resolver));
        assert!(matches!(
            d.dispatch(Action::Read, "/svc/whoami", Request::new()).await,
            Err(PluginError::Unauthorized(_))
        ));
    }

    #[test]
    fn test_static_resolver_rejects_duplicates() {
        assert!(matches!(
            StaticResolver::new(vec![whoami(), whoami()]),
            Err(PluginError::RouteConflict { .. })
        ));
    }
}
