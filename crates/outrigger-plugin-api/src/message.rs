//! Payloads that cross the RPC boundary.
//!
//! Bodies are opaque bytes; callers encode and decode their own types.

use crate::error::{PluginError, PluginResult};
use crate::endpoint::EndpointDescriptor;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

/// Multi-valued string map used for headers and parameters.
pub type MultiMap = HashMap<String, Vec<String>>;

/// Metadata key holding the authenticated caller's subject.
pub const META_AUTH_SUBJECT: &str = "auth-subject";
/// Metadata key holding the calling plugin for brokered calls.
pub const META_CALLER: &str = "caller";
/// Metadata key holding the full path that was requested.
pub const META_PATH: &str = "path";
/// Metadata key holding the wire protocol the request arrived on.
pub const META_PROTOCOL: &str = "protocol";

mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded).map_err(serde::de::Error::custom)
    }
}

fn first<'a>(map: &'a MultiMap, name: &str) -> Option<&'a str> {
    map.get(name)
        .and_then(|values| values.first())
        .map(String::as_str)
}

/// Inbound call payload.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Request {
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    #[serde(default)]
    pub headers: MultiMap,
    #[serde(default)]
    pub parameters: MultiMap,
    #[serde(default, with = "base64_bytes")]
    pub body: Vec<u8>,
}

impl Request {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request whose body is the JSON encoding of `value`.
    pub fn json<T: Serialize>(value: &T) -> PluginResult<Self> {
        Ok(Self {
            body: serde_json::to_vec(value)?,
            ..Self::default()
        }
        .with_header("content-type", "application/json"))
    }

    pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = body.into();
        self
    }

    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers
            .entry(name.to_ascii_lowercase())
            .or_default()
            .push(value.into());
        self
    }

    pub fn with_parameter(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.parameters
            .entry(name.into())
            .or_default()
            .push(value.into());
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// First value of a header. Names are matched case-insensitively.
    pub fn header(&self, name: &str) -> Option<&str> {
        first(&self.headers, &name.to_ascii_lowercase())
    }

    /// First value of a query or form parameter.
    pub fn parameter(&self, name: &str) -> Option<&str> {
        first(&self.parameters, name)
    }

    /// Decodes the body as JSON.
    pub fn parse_body<T: DeserializeOwned>(&self) -> PluginResult<T> {
        serde_json::from_slice(&self.body)
            .map_err(|e| PluginError::InvalidRequest(format!("invalid JSON body: {e}")))
    }
}

/// Outbound call payload.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Response {
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    #[serde(default)]
    pub headers: MultiMap,
    #[serde(default)]
    pub parameters: MultiMap,
    #[serde(default, with = "base64_bytes")]
    pub value: Vec<u8>,
}

impl Response {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_bytes(value: impl Into<Vec<u8>>) -> Self {
        Self {
            value: value.into(),
            ..Self::default()
        }
    }

    /// Response whose value is the JSON encoding of `value`.
    pub fn json<T: Serialize>(value: &T) -> PluginResult<Self> {
        Ok(Self::from_bytes(serde_json::to_vec(value)?)
            .with_header("content-type", "application/json"))
    }

    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers
            .entry(name.to_ascii_lowercase())
            .or_default()
            .push(value.into());
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        first(&self.headers, &name.to_ascii_lowercase())
    }

    /// Decodes the value as JSON.
    pub fn parse_value<T: DeserializeOwned>(&self) -> PluginResult<T> {
        Ok(serde_json::from_slice(&self.value)?)
    }
}

/// Payload of the `Register` call.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RegisterRequest {
    #[serde(default)]
    pub config: serde_json::Map<String, serde_json::Value>,
    #[serde(default)]
    pub default_secure: bool,
}

/// Result of the `Register` call.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Registration {
    pub endpoints: Vec<EndpointDescriptor>,
    #[serde(default)]
    pub module_type: String,
    #[serde(default)]
    pub capabilities: Vec<String>,
}

/// One record from a child's logging stream.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LogMessage {
    pub level: String,
    pub message: String,
    #[serde(default)]
    pub fields: BTreeMap<String, String>,
    #[serde(default)]
    pub target: String,
    #[serde(default)]
    pub timestamp_ms: i64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TokenRequest {
    pub subject: String,
    #[serde(default)]
    pub groups: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RefreshTokenRequest {
    pub token: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TokenResponse {
    pub token: String,
    pub expires_at: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_lookup_is_case_insensitive() {
        let request = Request::new().with_header("X-Trace-Id", "abc");
        assert_eq!(request.header("x-trace-id"), Some("abc"));
        assert_eq!(request.header("X-TRACE-ID"), Some("abc"));
        assert_eq!(request.header("missing"), None);
    }

    #[test]
    fn test_body_is_base64_in_json() {
        let request = Request::new().with_body(vec![0u8, 159, 255]);
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["body"], "AJ//");

        let decoded: Request = serde_json::from_value(json).unwrap();
        assert_eq!(decoded.body, vec![0u8, 159, 255]);
    }

    #[test]
    fn test_json_helpers() {
        let response = Response::json(&serde_json::json!({ "message": "hello" })).unwrap();
        assert_eq!(response.header("Content-Type"), Some("application/json"));
        let value: serde_json::Value = response.parse_value().unwrap();
        assert_eq!(value["message"], "hello");

        let request = Request::new().with_body("not json");
        assert!(matches!(
            request.parse_body::<serde_json::Value>(),
            Err(PluginError::InvalidRequest(_))
        ));
    }

    #[test]
    fn test_missing_fields_default() {
        let request: Request = serde_json::from_str("{}").unwrap();
        assert!(request.body.is_empty());
        assert!(request.metadata.is_empty());
    }
}
