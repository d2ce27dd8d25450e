//! Handshake line codec.
//!
//! A child announces itself with one line on stdout:
//!
//! ```text
//! CONNECT{{name:rootPath:rpcProtocol:transportProtocol:ip:port:apiVersion:[opt1=v1,opt2=v2]}}
//! ```
//!
//! Parsing is strict: wrong field counts, a non-numeric port or an unknown
//! option key all fail.

use crate::error::{PluginError, PluginResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{Ipv4Addr, SocketAddr};
use std::str::FromStr;

const PREFIX: &str = "CONNECT{{";
const SUFFIX: &str = "}}";
const FIELD_COUNT: usize = 8;

const OPT_ENCRYPTED: &str = "encrypted";
const OPT_KEY: &str = "key";
const OPT_TLS: &str = "tls";

/// RPC transport a child serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RpcProtocol {
    /// Newline-delimited JSON-RPC over a raw socket
    #[serde(rename = "jsonrpc")]
    Legacy,
    Grpc,
}

impl RpcProtocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            RpcProtocol::Legacy => "jsonrpc",
            RpcProtocol::Grpc => "grpc",
        }
    }
}

impl fmt::Display for RpcProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RpcProtocol {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "jsonrpc" => Ok(RpcProtocol::Legacy),
            "grpc" => Ok(RpcProtocol::Grpc),
            other => Err(format!("unknown rpc protocol '{other}'")),
        }
    }
}

/// Options carried in the bracketed handshake tail.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Options {
    pub encryption_enabled: bool,
    pub encryption_key: Option<String>,
    pub tls_enabled: bool,
}

impl Options {
    fn parse(tail: &str, line: &str) -> PluginResult<Self> {
        let malformed = |reason: String| PluginError::MalformedHandshake {
            line: line.to_string(),
            reason,
        };

        let inner = tail
            .strip_prefix('[')
            .and_then(|t| t.strip_suffix(']'))
            .ok_or_else(|| malformed(format!("options must be bracketed, got '{tail}'")))?;

        let mut options = Options::default();
        let mut seen = Vec::new();
        for pair in inner.split(',').filter(|p| !p.is_empty()) {
            let (key, value) = pair
                .split_once('=')
                .ok_or_else(|| malformed(format!("option '{pair}' has no value")))?;
            if seen.contains(&key) {
                return Err(malformed(format!("duplicate option '{key}'")));
            }
            seen.push(key);

            let parse_bool = |v: &str| {
                v.parse::<bool>()
                    .map_err(|_| malformed(format!("option '{key}' expects true or false, got '{v}'")))
            };

            match key {
                OPT_ENCRYPTED => options.encryption_enabled = parse_bool(value)?,
                OPT_TLS => options.tls_enabled = parse_bool(value)?,
                OPT_KEY => {
                    options.encryption_key = (!value.is_empty()).then(|| value.to_string())
                }
                other => return Err(malformed(format!("unknown option '{other}'"))),
            }
        }
        Ok(options)
    }
}

impl fmt::Display for Options {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{OPT_ENCRYPTED}={},{OPT_TLS}={}",
            self.encryption_enabled, self.tls_enabled
        )?;
        if let Some(ref key) = self.encryption_key {
            write!(f, ",{OPT_KEY}={key}")?;
        }
        f.write_str("]")
    }
}

/// Decoded handshake announcement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Handshake {
    pub name: String,
    pub root_path: String,
    pub rpc_protocol: RpcProtocol,
    pub transport_protocol: String,
    pub ip: Ipv4Addr,
    pub port: u16,
    pub api_version: String,
    pub options: Options,
}

impl Handshake {
    /// Socket address the child is listening on.
    pub fn address(&self) -> SocketAddr {
        SocketAddr::from((self.ip, self.port))
    }

    /// Finds and decodes the first handshake embedded in `line`.
    ///
    /// Children may print other output before announcing; only the
    /// `CONNECT{{...}}` span is considered.
    pub fn find(line: &str) -> Option<PluginResult<Self>> {
        let start = line.find(PREFIX)?;
        Some(line[start..].trim_end().parse())
    }
}

impl fmt::Display for Handshake {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{PREFIX}{}:{}:{}:{}:{}:{}:{}:{}{SUFFIX}",
            self.name,
            self.root_path,
            self.rpc_protocol,
            self.transport_protocol,
            self.ip,
            self.port,
            self.api_version,
            self.options
        )
    }
}

impl FromStr for Handshake {
    type Err = PluginError;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let malformed = |reason: &str| PluginError::MalformedHandshake {
            line: line.to_string(),
            reason: reason.to_string(),
        };

        let body = line
            .trim()
            .strip_prefix(PREFIX)
            .and_then(|rest| rest.strip_suffix(SUFFIX))
            .ok_or_else(|| malformed("missing CONNECT{{...}} wrapper"))?;

        let fields: Vec<&str> = body.split(':').collect();
        if fields.len() != FIELD_COUNT {
            return Err(malformed(&format!(
                "expected {FIELD_COUNT} fields, found {}",
                fields.len()
            )));
        }

        if fields[0].is_empty() {
            return Err(malformed("empty name"));
        }
        let rpc_protocol = fields[2].parse().map_err(|e: String| malformed(&e))?;
        let ip = fields[4]
            .parse()
            .map_err(|_| malformed(&format!("invalid ip '{}'", fields[4])))?;
        let port = fields[5]
            .parse()
            .map_err(|_| malformed(&format!("invalid port '{}'", fields[5])))?;

        Ok(Handshake {
            name: fields[0].to_string(),
            root_path: fields[1].to_string(),
            rpc_protocol,
            transport_protocol: fields[3].to_string(),
            ip,
            port,
            api_version: fields[6].to_string(),
            options: Options::parse(fields[7], line)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Handshake {
        Handshake {
            name: "hello".to_string(),
            root_path: "/hello".to_string(),
            rpc_protocol: RpcProtocol::Grpc,
            transport_protocol: "tcp".to_string(),
            ip: Ipv4Addr::LOCALHOST,
            port: 40123,
            api_version: "1".to_string(),
            options: Options {
                encryption_enabled: false,
                encryption_key: None,
                tls_enabled: true,
            },
        }
    }

    #[test]
    fn test_encode_format() {
        assert_eq!(
            sample().to_string(),
            "CONNECT{{hello:/hello:grpc:tcp:127.0.0.1:40123:1:[encrypted=false,tls=true]}}"
        );
    }

    #[test]
    fn test_round_trip() {
        let mut handshake = sample();
        assert_eq!(handshake.to_string().parse::<Handshake>().unwrap(), handshake);

        handshake.rpc_protocol = RpcProtocol::Legacy;
        handshake.options.encryption_enabled = true;
        handshake.options.encryption_key = Some("c2VjcmV0a2V5PQ==".to_string());
        assert_eq!(handshake.to_string().parse::<Handshake>().unwrap(), handshake);
    }

    #[test]
    fn test_empty_options() {
        let parsed: Handshake = "CONNECT{{a:/a:jsonrpc:tcp:127.0.0.1:1:1:[]}}".parse().unwrap();
        assert_eq!(parsed.options, Options::default());
        assert_eq!(parsed.rpc_protocol, RpcProtocol::Legacy);
    }

    #[test]
    fn test_rejects_malformed() {
        let bad = [
            "hello:/hello:grpc:tcp:127.0.0.1:1:1:[]",
            "CONNECT{{hello:/hello:grpc:tcp:127.0.0.1:1:1:[]",
            "CONNECT{{hello:/hello:grpc:tcp:127.0.0.1:1:[]}}",
            "CONNECT{{hello:/hello:grpc:tcp:127.0.0.1:abc:1:[]}}",
            "CONNECT{{hello:/hello:grpc:tcp:127.0.0.1:70000:1:[]}}",
            "CONNECT{{hello:/hello:grpc:tcp:127.0.0.1:1:1:tls=true}}",
            "CONNECT{{hello:/hello:grpc:tcp:127.0.0.1:1:1:[tls=true}}",
            "CONNECT{{hello:/hello:grpc:tcp:127.0.0.1:1:1:[compress=true]}}",
            "CONNECT{{hello:/hello:grpc:tcp:127.0.0.1:1:1:[tls=yes]}}",
            "CONNECT{{hello:/hello:grpc:tcp:127.0.0.1:1:1:[tls]}}",
            "CONNECT{{hello:/hello:grpc:tcp:127.0.0.1:1:1:[tls=true,tls=false]}}",
            "CONNECT{{hello:/hello:carrier-pigeon:tcp:127.0.0.1:1:1:[]}}",
            "CONNECT{{:/hello:grpc:tcp:127.0.0.1:1:1:[]}}",
        ];
        for line in bad {
            assert!(
                matches!(line.parse::<Handshake>(), Err(PluginError::MalformedHandshake { .. })),
                "accepted {line}"
            );
        }
    }

    #[test]
    fn test_key_split_on_first_equals() {
        let parsed: Handshake = "CONNECT{{a:/a:grpc:tcp:127.0.0.1:1:1:[encrypted=true,key=abc==]}}"
            .parse()
            .unwrap();
        assert_eq!(parsed.options.encryption_key.as_deref(), Some("abc=="));
    }

    #[test]
    fn test_find_in_noisy_output() {
        let line = format!("starting up... {}\n", sample());
        let found = Handshake::find(&line).unwrap().unwrap();
        assert_eq!(found, sample());
        assert!(Handshake::find("no announcement here").is_none());
    }
}
