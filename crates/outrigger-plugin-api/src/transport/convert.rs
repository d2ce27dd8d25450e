//! Conversions between the crate's payload types and the protobuf messages.

use crate::endpoint::{Action, EndpointDescriptor};
use crate::error::{PluginError, PluginResult};
use crate::message::{
    LogMessage, MultiMap, RefreshTokenRequest, RegisterRequest, Registration, Request, Response,
    TokenRequest, TokenResponse,
};
use crate::proto;
use std::collections::HashMap;

pub fn action_to_proto(action: Action) -> i32 {
    let action = match action {
        Action::Create => proto::Action::Create,
        Action::Read => proto::Action::Read,
        Action::Write => proto::Action::Write,
        Action::Delete => proto::Action::Delete,
    };
    action as i32
}

pub fn action_from_proto(value: i32) -> PluginResult<Action> {
    match proto::Action::try_from(value) {
        Ok(proto::Action::Create) => Ok(Action::Create),
        Ok(proto::Action::Read) => Ok(Action::Read),
        Ok(proto::Action::Write) => Ok(Action::Write),
        Ok(proto::Action::Delete) => Ok(Action::Delete),
        Ok(proto::Action::Unspecified) | Err(_) => Err(PluginError::InvalidAction(format!(
            "unmapped action value {value}"
        ))),
    }
}

fn multi_to_proto(map: MultiMap) -> HashMap<String, proto::StringList> {
    map.into_iter()
        .map(|(k, values)| (k, proto::StringList { values }))
        .collect()
}

fn multi_from_proto(map: HashMap<String, proto::StringList>) -> MultiMap {
    map.into_iter().map(|(k, list)| (k, list.values)).collect()
}

fn schema_to_proto(schema: Option<serde_json::Value>) -> String {
    schema.map(|s| s.to_string()).unwrap_or_default()
}

fn schema_from_proto(schema: String, field: &str) -> PluginResult<Option<serde_json::Value>> {
    if schema.is_empty() {
        return Ok(None);
    }
    serde_json::from_str(&schema)
        .map(Some)
        .map_err(|e| PluginError::InvalidRequest(format!("invalid {field} schema: {e}")))
}

impl From<Request> for proto::Request {
    fn from(r: Request) -> Self {
        Self {
            metadata: r.metadata,
            headers: multi_to_proto(r.headers),
            parameters: multi_to_proto(r.parameters),
            body: r.body,
        }
    }
}

impl From<proto::Request> for Request {
    fn from(r: proto::Request) -> Self {
        Self {
            metadata: r.metadata,
            headers: multi_from_proto(r.headers),
            parameters: multi_from_proto(r.parameters),
            body: r.body,
        }
    }
}

impl From<Response> for proto::Response {
    fn from(r: Response) -> Self {
        Self {
            metadata: r.metadata,
            headers: multi_to_proto(r.headers),
            parameters: multi_to_proto(r.parameters),
            value: r.value,
        }
    }
}

impl From<proto::Response> for Response {
    fn from(r: proto::Response) -> Self {
        Self {
            metadata: r.metadata,
            headers: multi_from_proto(r.headers),
            parameters: multi_from_proto(r.parameters),
            value: r.value,
        }
    }
}

impl From<EndpointDescriptor> for proto::EndpointDescriptor {
    fn from(d: EndpointDescriptor) -> Self {
        Self {
            path: d.path,
            action: action_to_proto(d.action),
            requires_auth: d.requires_auth,
            auth_group: d.auth_group.unwrap_or_default(),
            metadata_schema: schema_to_proto(d.metadata_schema),
            headers_schema: schema_to_proto(d.headers_schema),
            parameters_schema: schema_to_proto(d.parameters_schema),
            body_schema: schema_to_proto(d.body_schema),
            output_schema: schema_to_proto(d.output_schema),
        }
    }
}

impl TryFrom<proto::EndpointDescriptor> for EndpointDescriptor {
    type Error = PluginError;

    fn try_from(d: proto::EndpointDescriptor) -> PluginResult<Self> {
        Ok(Self {
            action: action_from_proto(d.action)?,
            path: d.path,
            requires_auth: d.requires_auth,
            auth_group: (!d.auth_group.is_empty()).then_some(d.auth_group),
            metadata_schema: schema_from_proto(d.metadata_schema, "metadata")?,
            headers_schema: schema_from_proto(d.headers_schema, "headers")?,
            parameters_schema: schema_from_proto(d.parameters_schema, "parameters")?,
            body_schema: schema_from_proto(d.body_schema, "body")?,
            output_schema: schema_from_proto(d.output_schema, "output")?,
        })
    }
}

impl From<RegisterRequest> for proto::RegisterRequest {
    fn from(r: RegisterRequest) -> Self {
        Self {
            config_json: serde_json::Value::Object(r.config).to_string(),
            default_secure: r.default_secure,
        }
    }
}

impl TryFrom<proto::RegisterRequest> for RegisterRequest {
    type Error = PluginError;

    fn try_from(r: proto::RegisterRequest) -> PluginResult<Self> {
        let config = if r.config_json.is_empty() {
            serde_json::Map::new()
        } else {
            serde_json::from_str(&r.config_json)
                .map_err(|e| PluginError::InvalidRequest(format!("invalid config: {e}")))?
        };
        Ok(Self {
            config,
            default_secure: r.default_secure,
        })
    }
}

impl From<Registration> for proto::RegisterResponse {
    fn from(r: Registration) -> Self {
        Self {
            endpoints: r.endpoints.into_iter().map(Into::into).collect(),
            module_type: r.module_type,
            capabilities: r.capabilities,
        }
    }
}

impl TryFrom<proto::RegisterResponse> for Registration {
    type Error = PluginError;

    fn try_from(r: proto::RegisterResponse) -> PluginResult<Self> {
        Ok(Self {
            endpoints: r
                .endpoints
                .into_iter()
                .map(EndpointDescriptor::try_from)
                .collect::<PluginResult<_>>()?,
            module_type: r.module_type,
            capabilities: r.capabilities,
        })
    }
}

impl From<LogMessage> for proto::LogMessage {
    fn from(m: LogMessage) -> Self {
        Self {
            level: m.level,
            message: m.message,
            fields: m.fields.into_iter().collect(),
            target: m.target,
            timestamp_ms: m.timestamp_ms,
        }
    }
}

impl From<proto::LogMessage> for LogMessage {
    fn from(m: proto::LogMessage) -> Self {
        Self {
            level: m.level,
            message: m.message,
            fields: m.fields.into_iter().collect(),
            target: m.target,
            timestamp_ms: m.timestamp_ms,
        }
    }
}

impl From<TokenRequest> for proto::TokenRequest {
    fn from(r: TokenRequest) -> Self {
        Self {
            subject: r.subject,
            groups: r.groups,
        }
    }
}

impl From<proto::TokenRequest> for TokenRequest {
    fn from(r: proto::TokenRequest) -> Self {
        Self {
            subject: r.subject,
            groups: r.groups,
        }
    }
}

impl From<RefreshTokenRequest> for proto::RefreshTokenRequest {
    fn from(r: RefreshTokenRequest) -> Self {
        Self { token: r.token }
    }
}

impl From<proto::RefreshTokenRequest> for RefreshTokenRequest {
    fn from(r: proto::RefreshTokenRequest) -> Self {
        Self { token: r.token }
    }
}

impl From<TokenResponse> for proto::TokenResponse {
    fn from(r: TokenResponse) -> Self {
        Self {
            token: r.token,
            expires_at: r.expires_at,
        }
    }
}

impl From<proto::TokenResponse> for TokenResponse {
    fn from(r: proto::TokenResponse) -> Self {
        Self {
            token: r.token,
            expires_at: r.expires_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unspecified_action_rejected() {
        assert!(matches!(action_from_proto(0), Err(PluginError::InvalidAction(_))));
        assert!(matches!(action_from_proto(99), Err(PluginError::InvalidAction(_))));
        for action in Action::ALL {
            assert_eq!(action_from_proto(action_to_proto(action)).unwrap(), action);
        }
    }

    #[test]
    fn test_descriptor_schemas_survive() {
        let mut descriptor = EndpointDescriptor::new(Action::Create, "/items");
        descriptor.requires_auth = true;
        descriptor.auth_group = Some("admins".to_string());
        descriptor.body_schema = Some(serde_json::json!({ "type": "object" }));

        let wire: proto::EndpointDescriptor = descriptor.clone().into();
        assert!(wire.output_schema.is_empty());
        assert_eq!(EndpointDescriptor::try_from(wire).unwrap(), descriptor);
    }

    #[test]
    fn test_bad_schema_rejected() {
        let wire = proto::EndpointDescriptor {
            path: "/x".to_string(),
            action: action_to_proto(Action::Read),
            body_schema: "{not json".to_string(),
            ..Default::default()
        };
        assert!(EndpointDescriptor::try_from(wire).is_err());
    }

    #[test]
    fn test_register_request_config() {
        let mut config = serde_json::Map::new();
        config.insert("greeting".to_string(), serde_json::json!("hi"));
        let wire: proto::RegisterRequest = RegisterRequest {
            config: config.clone(),
            default_secure: true,
        }
        .into();

        let back = RegisterRequest::try_from(wire).unwrap();
        assert_eq!(back.config, config);
        assert!(back.default_secure);
    }
}
