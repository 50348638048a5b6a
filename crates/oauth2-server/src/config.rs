//! Authorization server configuration.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use oauth2_server_core::env;
use oauth2_server_core::{ConfigError, GrantType};

use crate::codec::{AccessTokenCodec, JwtCodec, OpaqueCodec};
use crate::error::ServerError;

/// Access token encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccessTokenFormat {
    /// HS512-signed JWT.
    Jwt,
    /// Random opaque string; the store row is the only source of truth.
    Opaque,
}

impl std::str::FromStr for AccessTokenFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "jwt" => Ok(Self::Jwt),
            "opaque" => Ok(Self::Opaque),
            other => Err(format!("unknown access token format {other:?}")),
        }
    }
}

/// Authorization server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerOptions {
    /// Issuer URL (JWT `iss`, discovery metadata).
    #[serde(default = "default_issuer")]
    pub issuer: String,
    /// HMAC key for JWT access tokens.
    #[serde(default, skip_serializing)]
    pub signing_key: Option<String>,
    /// Explicit token format. Defaults to JWT when a signing key is set.
    #[serde(default)]
    pub access_token_format: Option<AccessTokenFormat>,
    /// Authorization code TTL in seconds.
    #[serde(default = "default_code_ttl")]
    pub authorization_code_ttl: i64,
    /// Access token TTL in seconds.
    #[serde(default = "default_access_token_ttl")]
    pub access_token_ttl: i64,
    /// Refresh token TTL in seconds.
    #[serde(default = "default_refresh_token_ttl")]
    pub refresh_token_ttl: i64,
    /// Issue a refresh token with client_credentials grants.
    #[serde(default)]
    pub client_credentials_refresh: bool,
    /// Ceiling scope for the authorization code grant.
    #[serde(default = "default_code_scope")]
    pub code_scope: String,
    /// Ceiling scope for the password grant.
    #[serde(default = "default_password_scope")]
    pub password_scope: String,
    /// Ceiling scope for the client_credentials grant.
    #[serde(default = "default_client_scope")]
    pub client_scope: String,
    #[serde(default = "default_true")]
    pub require_pkce_for_public_clients: bool,
    #[serde(default = "default_true")]
    pub allow_plain_pkce: bool,
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
    /// Per store call deadline in milliseconds.
    #[serde(default = "default_store_timeout")]
    pub store_timeout_ms: u64,
}

fn default_issuer() -> String { "http://localhost:8080".to_string() }
/// Upper bound for any TTL: ten years.
pub const MAX_TTL_SECS: i64 = 10 * 365 * 24 * 60 * 60;

fn default_code_ttl() -> i64 { 600 }                  // 10 minutes
fn default_access_token_ttl() -> i64 { 7200 }         // 2 hours
fn default_refresh_token_ttl() -> i64 { 259200 }      // 3 days
fn default_code_scope() -> String { "user:* client:*".to_string() }
fn default_password_scope() -> String { "user:*".to_string() }
fn default_client_scope() -> String { "user:read client:read".to_string() }
fn default_true() -> bool { true }
fn default_sweep_interval() -> u64 { 3600 }
fn default_store_timeout() -> u64 { 5000 }

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            issuer: default_issuer(),
            signing_key: None,
            access_token_format: None,
            authorization_code_ttl: default_code_ttl(),
            access_token_ttl: default_access_token_ttl(),
            refresh_token_ttl: default_refresh_token_ttl(),
            client_credentials_refresh: false,
            code_scope: default_code_scope(),
            password_scope: default_password_scope(),
            client_scope: default_client_scope(),
            require_pkce_for_public_clients: true,
            allow_plain_pkce: true,
            sweep_interval_secs: default_sweep_interval(),
            store_timeout_ms: default_store_timeout(),
        }
    }
}

impl ServerOptions {
    /// Load from `OAUTH_*` variables, falling back to defaults for anything unset.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut opts = Self::default();

        if let Some(v) = env::get_string("OAUTH_ISSUER") {
            opts.issuer = v;
        }
        opts.signing_key = env::get_string("OAUTH_SIGNING_KEY");
        opts.access_token_format = env::get_parsed("OAUTH_ACCESS_TOKEN_FORMAT")?;

        if let Some(v) = env::get_parsed("OAUTH_AUTHORIZATION_CODE_TTL")? {
            opts.authorization_code_ttl = v;
        }
        if let Some(v) = env::get_parsed("OAUTH_ACCESS_TOKEN_TTL")? {
            opts.access_token_ttl = v;
        }
        if let Some(v) = env::get_parsed("OAUTH_REFRESH_TOKEN_TTL")? {
            opts.refresh_token_ttl = v;
        }
        if let Some(v) = env::get_bool("OAUTH_CLIENT_CREDENTIALS_REFRESH")? {
            opts.client_credentials_refresh = v;
        }
        if let Some(v) = env::get_string("OAUTH_CODE_SCOPE") {
            opts.code_scope = v;
        }
        if let Some(v) = env::get_string("OAUTH_PASSWORD_SCOPE") {
            opts.password_scope = v;
        }
        if let Some(v) = env::get_string("OAUTH_CLIENT_SCOPE") {
            opts.client_scope = v;
        }
        if let Some(v) = env::get_bool("OAUTH_REQUIRE_PKCE")? {
            opts.require_pkce_for_public_clients = v;
        }
        if let Some(v) = env::get_bool("OAUTH_ALLOW_PLAIN_PKCE")? {
            opts.allow_plain_pkce = v;
        }
        if let Some(v) = env::get_parsed("OAUTH_SWEEP_INTERVAL_SECS")? {
            opts.sweep_interval_secs = v;
        }
        if let Some(v) = env::get_parsed("OAUTH_STORE_TIMEOUT_MS")? {
            opts.store_timeout_ms = v;
        }

        opts.validate()?;
        Ok(opts)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let ttls = [
            ("authorization_code_ttl", self.authorization_code_ttl),
            ("access_token_ttl", self.access_token_ttl),
            ("refresh_token_ttl", self.refresh_token_ttl),
        ];
        for (key, ttl) in ttls {
            if ttl <= 0 {
                return Err(ConfigError::Invalid {
                    key: key.to_string(),
                    reason: "must be positive".to_string(),
                });
            }
            if ttl > MAX_TTL_SECS {
                return Err(ConfigError::Invalid {
                    key: key.to_string(),
                    reason: format!("must not exceed {MAX_TTL_SECS} seconds"),
                });
            }
        }
        if self.effective_token_format() == AccessTokenFormat::Jwt && self.signing_key.is_none() {
            return Err(ConfigError::Missing("OAUTH_SIGNING_KEY".to_string()));
        }
        Ok(())
    }

    pub fn effective_token_format(&self) -> AccessTokenFormat {
        self.access_token_format.unwrap_or(if self.signing_key.is_some() {
            AccessTokenFormat::Jwt
        } else {
            AccessTokenFormat::Opaque
        })
    }

    /// Build the access token codec for the configured format.
    pub fn access_token_codec(&self) -> Result<Arc<dyn AccessTokenCodec>, ServerError> {
        match self.effective_token_format() {
            AccessTokenFormat::Opaque => Ok(Arc::new(OpaqueCodec)),
            AccessTokenFormat::Jwt => {
                let key = self
                    .signing_key
                    .as_deref()
                    .ok_or_else(|| ServerError::Config("JWT access tokens need a signing key".into()))?;
                Ok(Arc::new(JwtCodec::new(self.issuer.clone(), key.as_bytes())))
            }
        }
    }

    /// Server-wide ceiling scope for a grant. Empty means unrestricted.
    pub fn ceiling_scope(&self, grant: GrantType) -> &str {
        match grant {
            GrantType::AuthorizationCode => &self.code_scope,
            GrantType::Password => &self.password_scope,
            GrantType::ClientCredentials => &self.client_scope,
            GrantType::RefreshToken => "",
        }
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }

    pub fn store_timeout(&self) -> Option<Duration> {
        (self.store_timeout_ms > 0).then(|| Duration::from_millis(self.store_timeout_ms))
    }
}
