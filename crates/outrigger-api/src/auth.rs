//! Bearer-token authentication for endpoints that require it.
//!
//! Tokens are HS256 JWTs signed with `api.jwt_secret`. Issuing tokens to end
//! users is left to an external identity service; [`JwtAuthenticator::issue_token`]
//! exists for operators and tests.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use outrigger_plugin_api::{Authenticator, Identity, PluginError, PluginResult, Request};
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

// ============================================================================
// Configuration
// ============================================================================

#[derive(Debug, Clone)]
pub struct AuthConfig {
    /// JWT secret key
    pub jwt_secret: String,

    /// JWT token expiration duration
    pub jwt_expiration: Duration,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            jwt_secret: "change-me-in-production".to_string(),
            jwt_expiration: Duration::hours(24),
        }
    }
}

impl AuthConfig {
    pub fn with_secret(secret: impl Into<String>) -> Self {
        Self {
            jwt_secret: secret.into(),
            ..Self::default()
        }
    }
}

// ============================================================================
// JWT Claims
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// Subject
    pub sub: String,

    /// Groups checked against an endpoint's auth group
    #[serde(default)]
    pub groups: Vec<String>,

    /// Issued at (Unix timestamp)
    pub iat: i64,

    /// Expiration time (Unix timestamp)
    pub exp: i64,

    /// JWT ID
    pub jti: String,
}

impl Claims {
    pub fn new(subject: String, groups: Vec<String>, expiration: Duration) -> Self {
        let now = Utc::now();
        Self {
            sub: subject,
            groups,
            iat: now.timestamp(),
            exp: (now + expiration).timestamp(),
            jti: Uuid::new_v4().to_string(),
        }
    }
}

impl From<Claims> for Identity {
    fn from(claims: Claims) -> Self {
        Identity {
            subject: claims.sub,
            groups: claims.groups,
        }
    }
}

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("Missing authentication credentials")]
    MissingCredentials,

    #[error("Invalid or expired JWT token")]
    InvalidToken,

    #[error("Failed to issue token: {0}")]
    Issue(String),
}

impl From<AuthError> for PluginError {
    fn from(err: AuthError) -> Self {
        PluginError::Unauthorized(err.to_string())
    }
}

// ============================================================================
// Authenticator
// ============================================================================

/// Verifies `Authorization: Bearer <jwt>` headers.
pub struct JwtAuthenticator {
    config: AuthConfig,
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
}

impl JwtAuthenticator {
    pub fn new(config: AuthConfig) -> Self {
        let encoding_key = EncodingKey::from_secret(config.jwt_secret.as_bytes());
        let decoding_key = DecodingKey::from_secret(config.jwt_secret.as_bytes());

        Self {
            config,
            encoding_key,
            decoding_key,
        }
    }

    /// Signs a token for `subject` that expires after the configured duration.
    pub fn issue_token(
        &self,
        subject: &str,
        groups: Vec<String>,
    ) -> Result<(String, DateTime<Utc>), AuthError> {
        let claims = Claims::new(subject.to_string(), groups, self.config.jwt_expiration);
        let expires_at = DateTime::from_timestamp(claims.exp, 0)
            .ok_or_else(|| AuthError::Issue("invalid expiration timestamp".to_string()))?;

        let token = encode(&Header::default(), &claims, &self.encoding_key)
            .map_err(|e| AuthError::Issue(e.to_string()))?;

        Ok((token, expires_at))
    }

    /// Verify and decode JWT token
    pub fn verify_token(&self, token: &str) -> Result<Claims, AuthError> {
        let token_data = decode::<Claims>(token, &self.decoding_key, &Validation::default())
            .map_err(|e| {
                debug!(error = %e, "Rejected bearer token");
                AuthError::InvalidToken
            })?;

        Ok(token_data.claims)
    }
}

fn bearer(request: &Request) -> Result<&str, AuthError> {
    let value = request
        .header("authorization")
        .ok_or(AuthError::MissingCredentials)?;
    let (scheme, token) = value
        .split_once(' ')
        .ok_or(AuthError::MissingCredentials)?;
    if !scheme.eq_ignore_ascii_case("bearer") || token.trim().is_empty() {
        return Err(AuthError::MissingCredentials);
    }
    Ok(token.trim())
}

#[async_trait]
impl Authenticator for JwtAuthenticator {
    async fn authenticate(&self, request: &Request) -> PluginResult<Identity> {
        let token = bearer(request)?;
        Ok(self.verify_token(token)?.into())
    }
}
