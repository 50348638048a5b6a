//! Grant authorization handlers.
//!
//! Each protocol juncture the engine consults is its own capability trait, so
//! a deployment can swap one policy without re-implementing the rest.
//! [`StorePolicy`] is the default implementation of all of them, backed by
//! the credential store and user directory.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use uuid::Uuid;

use oauth2_server_core::{
    CallContext, CredentialStore, GrantType, StoreError, Token, UserDirectory,
};

use crate::config::ServerOptions;
use crate::crypto::{verify_password_blocking, DECOY_PASSWORD_HASH};
use crate::error::{OAuthError, OAuthErrorKind, Result};
use crate::scope::{match_scopes_strict, normalize};
use crate::types::ExtensionFields;

/// Is `client_id` allowed to use `grant`.
#[async_trait]
pub trait ClientAuthorizedHandler: Send + Sync {
    /// Fails with `unauthorized_client` when the client is unknown or the
    /// grant is not in its allowed set.
    async fn client_authorized(&self, ctx: &CallContext, client_id: &str, grant: GrantType) -> Result<()>;
}

/// Is the requested scope inside the client's ceiling.
#[async_trait]
pub trait ClientScopeHandler: Send + Sync {
    async fn client_scope(&self, ctx: &CallContext, client_id: &str, requested: &str) -> Result<()>;
}

/// Server-wide ceiling for a grant. Returns the effective scope.
pub trait AuthorizeScopeHandler: Send + Sync {
    fn authorize_scope(&self, requested: &str, grant: GrantType) -> Result<String>;
}

/// A refresh must never widen the lineage's scope.
pub trait RefreshingScopeHandler: Send + Sync {
    fn refreshing_scope(&self, requested: &str, old_scope: &str) -> Result<()>;
}

/// Resource-owner credential check for the password grant.
#[async_trait]
pub trait PasswordAuthorizationHandler: Send + Sync {
    /// Unknown client is `invalid_client`. Unknown user and wrong password
    /// are the same `invalid_grant`.
    async fn password_authorization(
        &self,
        ctx: &CallContext,
        client_id: &str,
        username: &str,
        password: &str,
    ) -> Result<Uuid>;
}

/// Extra fields merged into a token response.
pub trait ExtensionFieldsHandler: Send + Sync {
    fn extension_fields(&self, token: &Token) -> ExtensionFields;
}

/// Internal cause of a rejected password grant. Logged, never returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialFailure {
    UnknownUser,
    PasswordMismatch,
    MalformedHash,
}

impl CredentialFailure {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::UnknownUser => "unknown_user",
            Self::PasswordMismatch => "password_mismatch",
            Self::MalformedHash => "malformed_hash",
        }
    }
}

const BAD_CREDENTIALS: &str = "Invalid username or password";

fn bad_credentials(cause: CredentialFailure) -> OAuthError {
    tracing::warn!(cause = cause.as_str(), "password grant rejected");
    OAuthError::with_message(OAuthErrorKind::InvalidGrant, BAD_CREDENTIALS).context(cause.as_str())
}

/// Default policy over the credential store.
pub struct StorePolicy {
    store: Arc<dyn CredentialStore>,
    users: Option<Arc<dyn UserDirectory>>,
    code_scope: String,
    password_scope: String,
    client_scope: String,
}

impl fmt::Debug for StorePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StorePolicy")
            .field("code_scope", &self.code_scope)
            .field("password_scope", &self.password_scope)
            .field("client_scope", &self.client_scope)
            .field("has_user_directory", &self.users.is_some())
            .finish()
    }
}

impl StorePolicy {
    pub fn new(
        store: Arc<dyn CredentialStore>,
        users: Option<Arc<dyn UserDirectory>>,
        options: &ServerOptions,
    ) -> Self {
        Self {
            store,
            users,
            code_scope: options.ceiling_scope(GrantType::AuthorizationCode).to_string(),
            password_scope: options.ceiling_scope(GrantType::Password).to_string(),
            client_scope: options.ceiling_scope(GrantType::ClientCredentials).to_string(),
        }
    }

    fn ceiling(&self, grant: GrantType) -> &str {
        match grant {
            GrantType::AuthorizationCode => &self.code_scope,
            GrantType::Password => &self.password_scope,
            GrantType::ClientCredentials => &self.client_scope,
            GrantType::RefreshToken => "",
        }
    }
}

#[async_trait]
impl ClientAuthorizedHandler for StorePolicy {
    async fn client_authorized(&self, ctx: &CallContext, client_id: &str, grant: GrantType) -> Result<()> {
        let client = ctx
            .run(self.store.get_client_by_id(client_id))
            .await
            .map_err(|e| match e {
                StoreError::NotFound => OAuthError::unauthorized_client(),
                other => OAuthError::from_store(&other, "client_authorized"),
            })?;

        if client.allows_grant(grant) {
            Ok(())
        } else {
            Err(OAuthError::unauthorized_client().context(format!("grant {grant} not allowed")))
        }
    }
}

#[async_trait]
impl ClientScopeHandler for StorePolicy {
    async fn client_scope(&self, ctx: &CallContext, client_id: &str, requested: &str) -> Result<()> {
        let client = ctx
            .run(self.store.get_client_by_id(client_id))
            .await
            .map_err(|e| match e {
                StoreError::NotFound => OAuthError::invalid_client(),
                other => OAuthError::from_store(&other, "client_scope"),
            })?;

        if match_scopes_strict(requested, &client.scope) {
            Ok(())
        } else {
            Err(OAuthError::invalid_scope())
        }
    }
}

impl AuthorizeScopeHandler for StorePolicy {
    fn authorize_scope(&self, requested: &str, grant: GrantType) -> Result<String> {
        let requested = normalize(requested);
        let ceiling = self.ceiling(grant);
        if requested.is_empty() || ceiling.trim().is_empty() {
            return Ok(requested);
        }
        if match_scopes_strict(&requested, ceiling) {
            Ok(requested)
        } else {
            Err(OAuthError::invalid_scope())
        }
    }
}

impl RefreshingScopeHandler for StorePolicy {
    fn refreshing_scope(&self, requested: &str, old_scope: &str) -> Result<()> {
        if match_scopes_strict(requested, old_scope) {
            Ok(())
        } else {
            Err(OAuthError::invalid_scope())
        }
    }
}

#[async_trait]
impl PasswordAuthorizationHandler for StorePolicy {
    async fn password_authorization(
        &self,
        ctx: &CallContext,
        client_id: &str,
        username: &str,
        password: &str,
    ) -> Result<Uuid> {
        ctx.run(self.store.get_client_by_id(client_id))
            .await
            .map_err(|e| match e {
                StoreError::NotFound => OAuthError::invalid_client(),
                other => OAuthError::from_store(&other, "password_authorization: client"),
            })?;

        let users = self.users.as_ref().ok_or_else(|| {
            OAuthError::server_error().context("password grant needs a user directory")
        })?;

        // An unknown user still pays for one key derivation.
        let (user, hash) = match ctx.run(users.get_user_by_username(username)).await {
            Ok(user) => {
                let hash = user.password_hash.clone();
                (Some(user), hash)
            }
            Err(StoreError::NotFound) => (None, DECOY_PASSWORD_HASH.to_string()),
            Err(other) => return Err(OAuthError::from_store(&other, "password_authorization: user")),
        };

        let verified = verify_password_blocking(hash, password.to_string()).await;
        let Some(user) = user else {
            return Err(bad_credentials(CredentialFailure::UnknownUser));
        };
        match verified {
            Ok(true) => Ok(user.id),
            Ok(false) => Err(bad_credentials(CredentialFailure::PasswordMismatch)),
            Err(e) => {
                tracing::error!(user_id = %user.id, error = %e, "stored password hash is unreadable");
                Err(bad_credentials(CredentialFailure::MalformedHash))
            }
        }
    }
}

impl ExtensionFieldsHandler for StorePolicy {
    fn extension_fields(&self, token: &Token) -> ExtensionFields {
        ExtensionFields {
            token_type: "Bearer".to_string(),
            expires_in: token.access_expires_in,
            user_id: token.user_id.map(|id| id.to_string()),
        }
    }
}

/// The handler set an engine consults.
#[derive(Clone)]
pub struct Policies {
    pub client_authorized: Arc<dyn ClientAuthorizedHandler>,
    pub client_scope: Arc<dyn ClientScopeHandler>,
    pub authorize_scope: Arc<dyn AuthorizeScopeHandler>,
    pub refreshing_scope: Arc<dyn RefreshingScopeHandler>,
    pub password: Arc<dyn PasswordAuthorizationHandler>,
    pub extension_fields: Arc<dyn ExtensionFieldsHandler>,
}

impl fmt::Debug for Policies {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Policies").finish_non_exhaustive()
    }
}

impl Policies {
    /// Use one policy object for every juncture.
    pub fn uniform(policy: Arc<StorePolicy>) -> Self {
        Self {
            client_authorized: policy.clone(),
            client_scope: policy.clone(),
            authorize_scope: policy.clone(),
            refreshing_scope: policy.clone(),
            password: policy.clone(),
            extension_fields: policy,
        }
    }

    pub fn with_client_authorized(mut self, handler: Arc<dyn ClientAuthorizedHandler>) -> Self {
        self.client_authorized = handler;
        self
    }

    pub fn with_client_scope(mut self, handler: Arc<dyn ClientScopeHandler>) -> Self {
        self.client_scope = handler;
        self
    }

    pub fn with_authorize_scope(mut self, handler: Arc<dyn AuthorizeScopeHandler>) -> Self {
        self.authorize_scope = handler;
        self
    }

    pub fn with_refreshing_scope(mut self, handler: Arc<dyn RefreshingScopeHandler>) -> Self {
        self.refreshing_scope = handler;
        self
    }

    pub fn with_password(mut self, handler: Arc<dyn PasswordAuthorizationHandler>) -> Self {
        self.password = handler;
        self
    }

    pub fn with_extension_fields(mut self, handler: Arc<dyn ExtensionFieldsHandler>) -> Self {
        self.extension_fields = handler;
        self
    }
}
