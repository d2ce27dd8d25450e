//! TLS material for plugin transports.
//!
//! The loader hands PEM contents (not paths) to children through the
//! environment. A child that finds both variables upgrades its listener; the
//! loader trusts the same certificate when it connects back.

use crate::error::{PluginError, PluginResult};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tracing::debug;

/// PEM certificate handed to the child.
pub const ENV_TLS_CERT: &str = "OUTRIGGER_PLUGIN_TLS_CERT";
/// PEM private key handed to the child.
pub const ENV_TLS_KEY: &str = "OUTRIGGER_PLUGIN_TLS_KEY";
/// Name children's certificates are issued for.
pub const DEFAULT_SERVER_NAME: &str = "localhost";

/// Installs ring as the process-wide rustls provider. Safe to call repeatedly.
pub fn install_default_provider() {
    let _ = rustls::crypto::ring::default_provider().install_default();
}

fn provider() -> Arc<rustls::crypto::CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

fn parse_certs(pem: &str) -> PluginResult<Vec<CertificateDer<'static>>> {
    let certs = rustls_pemfile::certs(&mut pem.as_bytes())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| PluginError::Tls(format!("failed to parse certificate: {e}")))?;
    if certs.is_empty() {
        return Err(PluginError::Tls("no certificate found in PEM".to_string()));
    }
    Ok(certs)
}

fn parse_key(pem: &str) -> PluginResult<PrivateKeyDer<'static>> {
    rustls_pemfile::private_key(&mut pem.as_bytes())
        .map_err(|e| PluginError::Tls(format!("failed to read private key: {e}")))?
        .ok_or_else(|| PluginError::Tls("no private key found in PEM".to_string()))
}

/// Server-side certificate and key.
#[derive(Clone)]
pub struct TlsMaterial {
    cert_pem: String,
    key_pem: String,
}

impl TlsMaterial {
    pub fn new(cert_pem: impl Into<String>, key_pem: impl Into<String>) -> Self {
        Self {
            cert_pem: cert_pem.into(),
            key_pem: key_pem.into(),
        }
    }

    /// Reads PEM files from disk.
    pub fn from_files(cert_path: &Path, key_path: &Path) -> PluginResult<Self> {
        Ok(Self::new(
            std::fs::read_to_string(cert_path)?,
            std::fs::read_to_string(key_path)?,
        ))
    }

    /// Reads the material a launching host placed in the environment.
    pub fn from_env() -> Option<Self> {
        let cert = std::env::var(ENV_TLS_CERT).ok().filter(|v| !v.is_empty())?;
        let key = std::env::var(ENV_TLS_KEY).ok().filter(|v| !v.is_empty())?;
        Some(Self::new(cert, key))
    }

    /// Environment entries that pass this material to a child.
    pub fn env_vars(&self) -> [(&'static str, &str); 2] {
        [(ENV_TLS_CERT, &self.cert_pem), (ENV_TLS_KEY, &self.key_pem)]
    }

    pub fn cert_pem(&self) -> &str {
        &self.cert_pem
    }

    /// Acceptor for the line-RPC listener.
    pub fn acceptor(&self) -> PluginResult<TlsAcceptor> {
        let certs = parse_certs(&self.cert_pem)?;
        let key = parse_key(&self.key_pem)?;

        let config = rustls::ServerConfig::builder_with_provider(provider())
            .with_safe_default_protocol_versions()
            .map_err(|e| PluginError::Tls(e.to_string()))?
            .with_no_client_auth()
            .with_single_cert(certs, key)
            .map_err(|e| PluginError::Tls(format!("invalid certificate or key: {e}")))?;

        debug!("Built TLS acceptor for plugin transport");
        Ok(TlsAcceptor::from(Arc::new(config)))
    }

    /// Identity for the gRPC listener.
    pub fn tonic_identity(&self) -> tonic::transport::Identity {
        tonic::transport::Identity::from_pem(&self.cert_pem, &self.key_pem)
    }

    /// Client settings that trust this certificate.
    pub fn client(&self, server_name: impl Into<String>) -> ClientTls {
        ClientTls::new(self.cert_pem.clone(), server_name)
    }
}

impl fmt::Debug for TlsMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsMaterial")
            .field("cert_pem", &format_args!("{} bytes", self.cert_pem.len()))
            .field("key_pem", &"<redacted>")
            .finish()
    }
}

/// Client-side trust settings for connecting to a TLS child.
#[derive(Debug, Clone)]
pub struct ClientTls {
    ca_pem: String,
    server_name: String,
}

impl ClientTls {
    pub fn new(ca_pem: impl Into<String>, server_name: impl Into<String>) -> Self {
        Self {
            ca_pem: ca_pem.into(),
            server_name: server_name.into(),
        }
    }

    pub fn server_name(&self) -> &str {
        &self.server_name
    }

    /// Connector and server name for the line-RPC client.
    pub fn connector(&self) -> PluginResult<(TlsConnector, ServerName<'static>)> {
        let mut roots = rustls::RootCertStore::empty();
        for cert in parse_certs(&self.ca_pem)? {
            roots
                .add(cert)
                .map_err(|e| PluginError::Tls(format!("failed to add trust root: {e}")))?;
        }

        let config = rustls::ClientConfig::builder_with_provider(provider())
            .with_safe_default_protocol_versions()
            .map_err(|e| PluginError::Tls(e.to_string()))?
            .with_root_certificates(roots)
            .with_no_client_auth();

        let server_name = ServerName::try_from(self.server_name.clone())
            .map_err(|e| PluginError::Tls(format!("invalid server name: {e}")))?;

        Ok((TlsConnector::from(Arc::new(config)), server_name))
    }

    /// Settings for the gRPC client.
    pub fn tonic_config(&self) -> tonic::transport::ClientTlsConfig {
        tonic::transport::ClientTlsConfig::new()
            .ca_certificate(tonic::transport::Certificate::from_pem(&self.ca_pem))
            .domain_name(self.server_name.clone())
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::TlsMaterial;

    /// Self-signed certificate for `localhost`.
    pub fn self_signed() -> TlsMaterial {
        let cert = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
        TlsMaterial::new(cert.cert.pem(), cert.key_pair.serialize_pem())
    }
}
