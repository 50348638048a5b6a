//! Client registration and authentication.

use std::collections::BTreeSet;

use base64::Engine;
use chrono::Utc;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use url::Url;
use uuid::Uuid;

use oauth2_server_core::{Client, GrantType};

use crate::error::{OAuthError, OAuthErrorKind};

/// Hash a client secret for storage.
pub fn hash_client_secret(secret: &str) -> Vec<u8> {
    Sha256::digest(secret.as_bytes()).to_vec()
}

/// Verify a client secret against a stored hash.
pub fn verify_client_secret(secret: &str, hash: &[u8]) -> bool {
    if hash.is_empty() {
        return false;
    }
    hash_client_secret(secret).ct_eq(hash).into()
}

/// Authenticate a client presenting `client_secret`.
///
/// Confidential clients must present a matching secret. Public clients are
/// bound by PKCE instead; a secret they send is ignored.
pub fn authenticate_client(client: &Client, client_secret: Option<&str>) -> Result<(), OAuthError> {
    if client.is_public {
        return Ok(());
    }
    let secret = client_secret
        .filter(|s| !s.is_empty())
        .ok_or_else(OAuthError::invalid_client)?;
    if verify_client_secret(secret, &client.secret_hash) {
        Ok(())
    } else {
        Err(OAuthError::invalid_client())
    }
}

fn invalid_redirect(reason: &str) -> OAuthError {
    OAuthError::new(OAuthErrorKind::InvalidRedirectUri).context(reason.to_string())
}

/// Resolve the redirect URI for an authorize call against the client domain.
///
/// An absent or blank URI defaults to the domain itself. Otherwise the scheme
/// and port must match, the host must be the domain host or a subdomain of
/// it, the path must sit under the domain path, and no fragment is allowed.
pub fn validate_redirect_uri(domain: &str, redirect_uri: Option<&str>) -> Result<String, OAuthError> {
    let base = Url::parse(domain).map_err(|_| invalid_redirect("client domain is not a URL"))?;

    let raw = match redirect_uri.map(str::trim).filter(|s| !s.is_empty()) {
        Some(raw) => raw,
        None => return Ok(domain.to_string()),
    };
    let uri = Url::parse(raw).map_err(|_| invalid_redirect("redirect uri is not a URL"))?;

    if uri.fragment().is_some() {
        return Err(invalid_redirect("fragment"));
    }
    if uri.scheme() != base.scheme() {
        return Err(invalid_redirect("scheme"));
    }

    let host = uri.host_str().unwrap_or_default();
    let base_host = base.host_str().unwrap_or_default();
    if base_host.is_empty() || !(host == base_host || host.ends_with(&format!(".{base_host}"))) {
        return Err(invalid_redirect("host"));
    }
    if uri.port_or_known_default() != base.port_or_known_default() {
        return Err(invalid_redirect("port"));
    }

    let base_path = base.path().trim_end_matches('/');
    let path = uri.path();
    if !(base_path.is_empty() || path == base_path || path.starts_with(&format!("{base_path}/"))) {
        return Err(invalid_redirect("path"));
    }

    Ok(raw.to_string())
}

/// Build a new client. Returns the plaintext secret for confidential clients;
/// only its hash is kept on the record.
pub fn build_client(
    domain: &str,
    is_public: bool,
    allowed_grants: BTreeSet<GrantType>,
    scope: &str,
    owner_user_id: Option<Uuid>,
) -> Result<(Client, Option<String>), OAuthError> {
    Url::parse(domain).map_err(|_| OAuthError::invalid_request("domain must be an absolute URL"))?;

    let secret = (!is_public).then(|| {
        base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(rand::random::<[u8; 32]>())
    });

    let client = Client {
        id: Uuid::new_v4().to_string(),
        secret_hash: secret.as_deref().map(hash_client_secret).unwrap_or_default(),
        domain: domain.to_string(),
        is_public,
        owner_user_id,
        allowed_grants,
        scope: crate::scope::normalize(scope),
        created_at: Utc::now(),
    };
    client.check_invariants().map_err(OAuthError::invalid_request)?;

    Ok((client, secret))
}
