//! Declarative request validation.
//!
//! A [`Validator`] is an ordered list of [`Rule`]s built for one request
//! shape. Rules are plain closures over the request; nothing is registered
//! globally, so each validator can be built and tested on its own.

use std::fmt;

use oauth2_server_core::GrantType;

use crate::error::OAuthError;
use crate::types::{AuthorizeRequest, IntrospectRequest, RevokeRequest, TokenRequest};

const MAX_SCOPE_LEN: usize = 1024;
const MAX_FIELD_LEN: usize = 2048;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldError {
    pub field: &'static str,
    pub reason: String,
}

impl FieldError {
    pub fn new(field: &'static str, reason: impl Into<String>) -> Self {
        Self {
            field,
            reason: reason.into(),
        }
    }
}

impl fmt::Display for FieldError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.field, self.reason)
    }
}

pub type Rule<T> = Box<dyn Fn(&T) -> Option<FieldError> + Send + Sync>;

/// Field must be present and non-blank.
pub fn required<T, G>(field: &'static str, get: G) -> Rule<T>
where
    G: for<'a> Fn(&'a T) -> Option<&'a str> + Send + Sync + 'static,
{
    Box::new(move |req| match get(req) {
        Some(v) if !v.trim().is_empty() => None,
        _ => Some(FieldError::new(field, "is required")),
    })
}

/// Field, when present, must not exceed `max` bytes.
pub fn max_len<T, G>(field: &'static str, max: usize, get: G) -> Rule<T>
where
    G: for<'a> Fn(&'a T) -> Option<&'a str> + Send + Sync + 'static,
{
    Box::new(move |req| match get(req) {
        Some(v) if v.len() > max => Some(FieldError::new(field, format!("exceeds {max} bytes"))),
        _ => None,
    })
}

/// Field, when present, must be one of `allowed`.
pub fn one_of<T, G>(field: &'static str, allowed: &'static [&'static str], get: G) -> Rule<T>
where
    G: for<'a> Fn(&'a T) -> Option<&'a str> + Send + Sync + 'static,
{
    Box::new(move |req| match get(req) {
        Some(v) if !allowed.iter().any(|a| *a == v) => {
            Some(FieldError::new(field, format!("must be one of {}", allowed.join(", "))))
        }
        _ => None,
    })
}

pub struct Validator<T> {
    rules: Vec<Rule<T>>,
}

impl<T> Default for Validator<T> {
    fn default() -> Self {
        Self { rules: Vec::new() }
    }
}

impl<T> fmt::Debug for Validator<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Validator")
            .field("rules", &self.rules.len())
            .finish()
    }
}

impl<T> Validator<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn rule(mut self, rule: Rule<T>) -> Self {
        self.rules.push(rule);
        self
    }

    /// Run every rule and collect all failures.
    pub fn errors(&self, req: &T) -> Vec<FieldError> {
        self.rules.iter().filter_map(|rule| rule(req)).collect()
    }

    /// Run every rule; any failure is an `invalid_request` naming the fields.
    pub fn validate(&self, req: &T) -> Result<(), OAuthError> {
        let errors = self.errors(req);
        if errors.is_empty() {
            return Ok(());
        }
        let message = errors
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join("; ");
        Err(OAuthError::invalid_request(message))
    }
}

pub fn authorize_validator() -> Validator<AuthorizeRequest> {
    Validator::new()
        .rule(required("response_type", |r: &AuthorizeRequest| Some(r.response_type.as_str())))
        .rule(required("client_id", |r: &AuthorizeRequest| Some(r.client_id.as_str())))
        .rule(max_len("scope", MAX_SCOPE_LEN, |r: &AuthorizeRequest| r.scope.as_deref()))
        .rule(max_len("redirect_uri", MAX_FIELD_LEN, |r: &AuthorizeRequest| r.redirect_uri.as_deref()))
        .rule(max_len("state", MAX_FIELD_LEN, |r: &AuthorizeRequest| r.state.as_deref()))
        .rule(one_of(
            "code_challenge_method",
            &["plain", "S256"],
            |r: &AuthorizeRequest| r.code_challenge_method.as_deref(),
        ))
}

/// Rules for one grant type. Client secrets are checked by client
/// authentication, not here.
pub fn token_validator(grant: GrantType) -> Validator<TokenRequest> {
    let base = Validator::new()
        .rule(required("client_id", |r: &TokenRequest| r.client_id.as_deref()))
        .rule(max_len("scope", MAX_SCOPE_LEN, |r: &TokenRequest| r.scope.as_deref()));

    match grant {
        GrantType::AuthorizationCode => base
            .rule(required("code", |r: &TokenRequest| r.code.as_deref()))
            .rule(max_len("redirect_uri", MAX_FIELD_LEN, |r: &TokenRequest| r.redirect_uri.as_deref())),
        GrantType::Password => base
            .rule(required("username", |r: &TokenRequest| r.username.as_deref()))
            .rule(required("password", |r: &TokenRequest| r.password.as_deref())),
        GrantType::ClientCredentials => base,
        GrantType::RefreshToken => {
            base.rule(required("refresh_token", |r: &TokenRequest| r.refresh_token.as_deref()))
        }
    }
}

pub fn revoke_validator() -> Validator<RevokeRequest> {
    Validator::new().rule(required("token", |r: &RevokeRequest| Some(r.token.as_str())))
}

pub fn introspect_validator() -> Validator<IntrospectRequest> {
    Validator::new().rule(required("token", |r: &IntrospectRequest| Some(r.token.as_str())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::OAuthErrorKind;

    #[test]
    fn test_collects_every_failure() {
        let req = TokenRequest {
            grant_type: "password".into(),
            ..Default::default()
        };
        let errors = token_validator(GrantType::Password).errors(&req);
        let fields: Vec<_> = errors.iter().map(|e| e.field).collect();
        assert_eq!(fields, vec!["client_id", "username", "password"]);
    }

    #[test]
    fn test_validate_maps_to_invalid_request() {
        let req = TokenRequest::new("refresh_token", "c1");
        let err = token_validator(GrantType::RefreshToken).validate(&req).unwrap_err();
        assert_eq!(err.kind, OAuthErrorKind::InvalidRequest);
        assert!(err.message.contains("refresh_token"));
    }

    #[test]
    fn test_blank_counts_as_missing() {
        let mut req = TokenRequest::new("authorization_code", "c1");
        req.code = Some("   ".into());
        assert!(token_validator(GrantType::AuthorizationCode).validate(&req).is_err());
        req.code = Some("abc".into());
        assert!(token_validator(GrantType::AuthorizationCode).validate(&req).is_ok());
    }

    #[test]
    fn test_scope_length_bound() {
        let req = TokenRequest::new("client_credentials", "c1").scope("a".repeat(MAX_SCOPE_LEN + 1));
        assert!(token_validator(GrantType::ClientCredentials).validate(&req).is_err());
    }

    #[test]
    fn test_authorize_rejects_unknown_challenge_method() {
        let mut req = AuthorizeRequest::new("c1", uuid::Uuid::new_v4());
        req.code_challenge_method = Some("S512".into());
        let errors = authorize_validator().errors(&req);
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].field, "code_challenge_method");
    }

    #[test]
    fn test_revoke_and_introspect_need_token() {
        let revoke = RevokeRequest {
            token: String::new(),
            token_type_hint: None,
        };
        assert!(revoke_validator().validate(&revoke).is_err());
        let introspect = IntrospectRequest {
            token: "t".into(),
            token_type_hint: None,
        };
        assert!(introspect_validator().validate(&introspect).is_ok());
    }
}
