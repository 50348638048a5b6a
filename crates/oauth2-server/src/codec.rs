//! Token codec: credential generation and access-token verification.
//!
//! Authorization codes and refresh tokens are always opaque random strings.
//! Access tokens come from an [`AccessTokenCodec`]: either opaque
//! ([`OpaqueCodec`]) or a signed HS512 JWT ([`JwtCodec`]) carrying
//! `aud` (client id), `sub` (user id), `scope`, `exp`, `iat`, `jti`, `iss`.

use std::fmt;

use base64::Engine;
use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ServerError;

fn random_token() -> String {
    let bytes: [u8; 32] = rand::random();
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes)
}

/// Generate an authorization code.
pub fn generate_authorization_code() -> String {
    random_token()
}

/// Generate a refresh token. Independent of any access token.
pub fn generate_refresh_token() -> String {
    random_token()
}

/// What an access token is minted for.
#[derive(Debug, Clone)]
pub struct AccessTokenInput<'a> {
    pub client_id: &'a str,
    pub user_id: Option<Uuid>,
    pub scope: &'a str,
    pub issued_at: DateTime<Utc>,
    pub expires_in: i64,
}

/// Claims recovered from a presented access token, when the format carries any.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessClaims {
    pub iss: String,
    /// Client id.
    pub aud: String,
    /// User id; absent for client-credential tokens.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub: Option<String>,
    pub scope: String,
    pub exp: i64,
    pub iat: i64,
    pub jti: String,
}

/// Why a presented access token was refused by the codec.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CodecError {
    #[error("token signature is invalid or the token is malformed")]
    InvalidSignature,

    #[error("token has expired")]
    Expired,
}

pub trait AccessTokenCodec: Send + Sync + fmt::Debug {
    fn generate(&self, input: &AccessTokenInput<'_>) -> Result<String, ServerError>;

    /// Check format-level validity. Opaque tokens carry no claims and
    /// always pass; the store row is authoritative for them.
    fn verify(&self, token: &str) -> Result<Option<AccessClaims>, CodecError>;
}

/// Random opaque access tokens.
#[derive(Debug, Clone, Default)]
pub struct OpaqueCodec;

impl AccessTokenCodec for OpaqueCodec {
    fn generate(&self, _input: &AccessTokenInput<'_>) -> Result<String, ServerError> {
        Ok(random_token())
    }

    fn verify(&self, _token: &str) -> Result<Option<AccessClaims>, CodecError> {
        Ok(None)
    }
}

/// HS512-signed JWT access tokens.
#[derive(Clone)]
pub struct JwtCodec {
    issuer: String,
    encoding: EncodingKey,
    decoding: DecodingKey,
}

impl fmt::Debug for JwtCodec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JwtCodec")
            .field("issuer", &self.issuer)
            .finish_non_exhaustive()
    }
}

impl JwtCodec {
    pub fn new(issuer: impl Into<String>, signing_key: &[u8]) -> Self {
        Self {
            issuer: issuer.into(),
            encoding: EncodingKey::from_secret(signing_key),
            decoding: DecodingKey::from_secret(signing_key),
        }
    }
}

impl AccessTokenCodec for JwtCodec {
    fn generate(&self, input: &AccessTokenInput<'_>) -> Result<String, ServerError> {
        let expires_at = Duration::try_seconds(input.expires_in)
            .and_then(|ttl| input.issued_at.checked_add_signed(ttl))
            .ok_or_else(|| ServerError::Crypto(format!("access token ttl {} out of range", input.expires_in)))?;
        let claims = AccessClaims {
            iss: self.issuer.clone(),
            aud: input.client_id.to_string(),
            sub: input.user_id.map(|u| u.to_string()),
            scope: input.scope.to_string(),
            exp: expires_at.timestamp(),
            iat: input.issued_at.timestamp(),
            jti: Uuid::new_v4().to_string(),
        };

        jsonwebtoken::encode(&Header::new(Algorithm::HS512), &claims, &self.encoding)
            .map_err(|e| ServerError::Crypto(format!("JWT signing failed: {e}")))
    }

    fn verify(&self, token: &str) -> Result<Option<AccessClaims>, CodecError> {
        let mut validation = Validation::new(Algorithm::HS512);
        validation.validate_exp = true;
        validation.leeway = 0;
        validation.validate_aud = false;
        validation.set_issuer(&[self.issuer.as_str()]);

        match jsonwebtoken::decode::<AccessClaims>(token, &self.decoding, &validation) {
            Ok(data) => Ok(Some(data.claims)),
            Err(e) => match e.kind() {
                jsonwebtoken::errors::ErrorKind::ExpiredSignature => Err(CodecError::Expired),
                _ => Err(CodecError::InvalidSignature),
            },
        }
    }
}
