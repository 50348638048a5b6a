//! Protocol error taxonomy.
//!
//! Every failure leaving the engine is an [`OAuthError`] carrying one of the
//! [`OAuthErrorKind`]s below. Storage and internal faults are logged with
//! their context and surface only as `server_error` or
//! `temporarily_unavailable`.

use std::fmt;

use serde::{Deserialize, Serialize};

use oauth2_server_core::error::StoreError;

/// HTTP status an error kind maps to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HttpStatus {
    BadRequest = 400,
    Unauthorized = 401,
    InternalServerError = 500,
    ServiceUnavailable = 503,
}

impl HttpStatus {
    pub fn status_code(&self) -> u16 {
        *self as u16
    }
}

impl fmt::Display for HttpStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.status_code())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OAuthErrorKind {
    InvalidRequest,
    InvalidClient,
    UnauthorizedClient,
    InvalidGrant,
    InvalidScope,
    InvalidAccessToken,
    InvalidRefreshToken,
    UnsupportedGrantType,
    UnsupportedResponseType,
    InvalidRedirectUri,
    ServerError,
    TemporarilyUnavailable,
}

impl OAuthErrorKind {
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidRequest => "invalid_request",
            Self::InvalidClient => "invalid_client",
            Self::UnauthorizedClient => "unauthorized_client",
            Self::InvalidGrant => "invalid_grant",
            Self::InvalidScope => "invalid_scope",
            Self::InvalidAccessToken => "invalid_access_token",
            Self::InvalidRefreshToken => "invalid_refresh_token",
            Self::UnsupportedGrantType => "unsupported_grant_type",
            Self::UnsupportedResponseType => "unsupported_response_type",
            Self::InvalidRedirectUri => "invalid_redirect_uri",
            Self::ServerError => "server_error",
            Self::TemporarilyUnavailable => "temporarily_unavailable",
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            Self::InvalidRequest => "The request is missing a required parameter or is malformed",
            Self::InvalidClient => "Client authentication failed",
            Self::UnauthorizedClient => "The client is not authorized to use this grant type",
            Self::InvalidGrant => "The provided authorization grant is invalid, expired or revoked",
            Self::InvalidScope => "The requested scope is invalid or exceeds the granted scope",
            Self::InvalidAccessToken => "Invalid access token",
            Self::InvalidRefreshToken => "Invalid refresh token",
            Self::UnsupportedGrantType => "The grant type is not supported",
            Self::UnsupportedResponseType => "The response type is not supported",
            Self::InvalidRedirectUri => "Invalid redirect uri",
            Self::ServerError => "Something went wrong, please try again later",
            Self::TemporarilyUnavailable => "The server is temporarily unavailable",
        }
    }

    pub fn status(&self) -> HttpStatus {
        match self {
            Self::InvalidClient | Self::InvalidAccessToken => HttpStatus::Unauthorized,
            Self::ServerError => HttpStatus::InternalServerError,
            Self::TemporarilyUnavailable => HttpStatus::ServiceUnavailable,
            _ => HttpStatus::BadRequest,
        }
    }
}

impl fmt::Display for OAuthErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

/// Error returned by every engine operation.
///
/// `message` is safe to show to the caller. `context` is internal detail
/// (operation, lineage stage, underlying cause) and is only logged.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct OAuthError {
    pub kind: OAuthErrorKind,
    pub message: String,
    pub context: Option<String>,
}

impl OAuthError {
    pub fn new(kind: OAuthErrorKind) -> Self {
        Self {
            kind,
            message: kind.description().to_string(),
            context: None,
        }
    }

    pub fn with_message(kind: OAuthErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            context: None,
        }
    }

    pub fn context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::with_message(OAuthErrorKind::InvalidRequest, message)
    }

    pub fn invalid_client() -> Self {
        Self::new(OAuthErrorKind::InvalidClient)
    }

    pub fn unauthorized_client() -> Self {
        Self::new(OAuthErrorKind::UnauthorizedClient)
    }

    pub fn invalid_grant() -> Self {
        Self::new(OAuthErrorKind::InvalidGrant)
    }

    pub fn invalid_scope() -> Self {
        Self::new(OAuthErrorKind::InvalidScope)
    }

    pub fn invalid_access_token() -> Self {
        Self::new(OAuthErrorKind::InvalidAccessToken)
    }

    pub fn server_error() -> Self {
        Self::new(OAuthErrorKind::ServerError)
    }

    /// Downgrade a store failure for the caller, keeping the cause in
    /// `context`. `NotFound` must be mapped by the caller before this.
    pub fn from_store(err: &StoreError, operation: &str) -> Self {
        let kind = if err.is_interrupted() {
            OAuthErrorKind::TemporarilyUnavailable
        } else {
            OAuthErrorKind::ServerError
        };
        Self::new(kind).context(format!("{operation}: {err}"))
    }

    pub fn status(&self) -> HttpStatus {
        self.kind.status()
    }

    /// RFC 6749 §5.2 error body.
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "error": self.kind.code(),
            "error_description": self.message,
        })
    }
}

impl From<OAuthErrorKind> for OAuthError {
    fn from(kind: OAuthErrorKind) -> Self {
        Self::new(kind)
    }
}

/// Internal failures outside the store: hashing, signing, configuration.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("crypto error: {0}")]
    Crypto(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

pub type Result<T> = std::result::Result<T, OAuthError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_are_rfc_strings() {
        assert_eq!(OAuthErrorKind::InvalidGrant.code(), "invalid_grant");
        assert_eq!(OAuthErrorKind::UnsupportedGrantType.to_string(), "unsupported_grant_type");
    }

    #[test]
    fn test_statuses() {
        assert_eq!(OAuthErrorKind::InvalidClient.status().status_code(), 401);
        assert_eq!(OAuthErrorKind::InvalidScope.status().status_code(), 400);
        assert_eq!(OAuthErrorKind::ServerError.status().status_code(), 500);
    }

    #[test]
    fn test_store_errors_never_leak_detail() {
        let err = OAuthError::from_store(&StoreError::backend("connection refused on 10.0.0.3"), "create_token");
        assert_eq!(err.kind, OAuthErrorKind::ServerError);
        assert!(!err.to_json().to_string().contains("10.0.0.3"));
        assert!(err.context.unwrap().contains("connection refused"));
    }

    #[test]
    fn test_interrupted_store_call_is_temporary() {
        let err = OAuthError::from_store(&StoreError::Timeout, "get_token_by_code");
        assert_eq!(err.kind, OAuthErrorKind::TemporarilyUnavailable);
    }

    #[test]
    fn test_json_body_shape() {
        let body = OAuthError::invalid_request("missing code").to_json();
        assert_eq!(body["error"], "invalid_request");
        assert_eq!(body["error_description"], "missing code");
    }
}
