//! OAuth 2.0 Authorization Server Metadata (RFC 8414).

use serde::{Deserialize, Serialize};

use oauth2_server_core::GrantType;

use crate::config::{AccessTokenFormat, ServerOptions};
use crate::pkce::CodeChallengeMethod;
use crate::scope::tokens;

/// Authorization Server Metadata response.
/// Maps to `.well-known/oauth-authorization-server`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthorizationServerMetadata {
    pub issuer: String,
    pub authorization_endpoint: String,
    pub token_endpoint: String,
    pub introspection_endpoint: String,
    pub revocation_endpoint: String,
    pub response_types_supported: Vec<String>,
    pub grant_types_supported: Vec<String>,
    pub token_endpoint_auth_methods_supported: Vec<String>,
    pub scopes_supported: Vec<String>,
    pub code_challenge_methods_supported: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub access_token_signing_alg_values_supported: Option<Vec<String>>,
}

/// Build the discovery metadata document.
pub fn build_metadata(options: &ServerOptions, base_url: &str) -> AuthorizationServerMetadata {
    let base_url = base_url.trim_end_matches('/');

    let mut scopes: Vec<String> = Vec::new();
    for ceiling in [&options.code_scope, &options.password_scope, &options.client_scope] {
        for scope in tokens(ceiling) {
            if !scopes.iter().any(|s| s == scope) {
                scopes.push(scope.to_string());
            }
        }
    }

    let mut pkce_methods = vec![CodeChallengeMethod::S256.as_str().to_string()];
    if options.allow_plain_pkce {
        pkce_methods.push(CodeChallengeMethod::Plain.as_str().to_string());
    }

    AuthorizationServerMetadata {
        issuer: options.issuer.clone(),
        authorization_endpoint: format!("{}/oauth/authorize", base_url),
        token_endpoint: format!("{}/oauth/token", base_url),
        introspection_endpoint: format!("{}/oauth/introspect", base_url),
        revocation_endpoint: format!("{}/oauth/revoke", base_url),
        response_types_supported: vec!["code".to_string()],
        grant_types_supported: GrantType::ALL.iter().map(|g| g.as_str().to_string()).collect(),
        token_endpoint_auth_methods_supported: vec![
            "client_secret_post".to_string(),
            "none".to_string(),
        ],
        scopes_supported: scopes,
        code_challenge_methods_supported: pkce_methods,
        access_token_signing_alg_values_supported: (options.effective_token_format()
            == AccessTokenFormat::Jwt)
            .then(|| vec!["HS512".to_string()]),
    }
}
