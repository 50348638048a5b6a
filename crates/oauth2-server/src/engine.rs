//! Authorization flow engine.
//!
//! Drives each credential lineage through its states:
//! `NONE -> CODE_ISSUED -> ACCESS_ISSUED (+ refresh) -> ROTATED -> REVOKED`.
//! The engine holds no mutable state of its own; every transition is a store
//! call bounded by the caller's [`CallContext`], and the two transitions that
//! consume a credential (code exchange and refresh rotation) go through the
//! store's atomic replace operations so concurrent callers get one winner.

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use chrono::{DateTime, SubsecRound, Utc};
use serde_json::{json, Value};
use url::Url;
use uuid::Uuid;

use oauth2_server_core::{
    CallContext, Client, CreateTokenParams, CredentialStore, DecisionEvent, DecisionHook,
    DecisionOutcome, DecisionRecord, GrantType, HookRegistry, StoreError, Token, UserDirectory,
};

use crate::client::{authenticate_client, validate_redirect_uri};
use crate::codec::{
    generate_authorization_code, generate_refresh_token, AccessTokenCodec, AccessTokenInput,
};
use crate::config::ServerOptions;
use crate::error::{OAuthError, OAuthErrorKind, Result, ServerError};
use crate::handlers::{Policies, StorePolicy};
use crate::logging::TracingDecisionHook;
use crate::pkce::{self, PkceError};
use crate::scope::normalize;
use crate::types::{
    AuthorizeRequest, AuthorizeResponse, ExtensionFields, IntrospectRequest, IntrospectResponse,
    RevokeRequest, TokenRequest, TokenResponse, TokenTypeHint,
};
use crate::validation;

fn now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(0)
}

/// Log a store failure with its operation and downgrade it for the caller.
fn store_failure(operation: &'static str) -> impl Fn(StoreError) -> OAuthError {
    move |err| {
        tracing::error!(operation, error = %err, "credential store call failed");
        OAuthError::from_store(&err, operation)
    }
}

/// Like [`store_failure`], but an absent key becomes `kind`.
fn missing_as(kind: OAuthErrorKind, operation: &'static str) -> impl Fn(StoreError) -> OAuthError {
    move |err| match err {
        StoreError::NotFound => OAuthError::new(kind),
        other => store_failure(operation)(other),
    }
}

fn rejected(grant: GrantType, client_id: &str, err: OAuthError) -> OAuthError {
    tracing::warn!(
        grant_type = grant.as_str(),
        client_id,
        error = err.kind.code(),
        context = err.context.as_deref().unwrap_or(""),
        "grant rejected"
    );
    err
}

pub struct AuthorizationEngine {
    store: Arc<dyn CredentialStore>,
    codec: Arc<dyn AccessTokenCodec>,
    policies: Policies,
    hooks: HookRegistry,
    options: ServerOptions,
}

impl fmt::Debug for AuthorizationEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthorizationEngine")
            .field("store", &self.store)
            .field("codec", &self.codec)
            .field("hooks", &self.hooks)
            .field("issuer", &self.options.issuer)
            .finish()
    }
}

pub struct EngineBuilder {
    store: Arc<dyn CredentialStore>,
    users: Option<Arc<dyn UserDirectory>>,
    options: ServerOptions,
    codec: Option<Arc<dyn AccessTokenCodec>>,
    policies: Option<Policies>,
    hooks: HookRegistry,
}

impl EngineBuilder {
    fn new(store: Arc<dyn CredentialStore>) -> Self {
        let mut hooks = HookRegistry::new();
        hooks.register(Arc::new(TracingDecisionHook));
        Self {
            store,
            users: None,
            options: ServerOptions::default(),
            codec: None,
            policies: None,
            hooks,
        }
    }

    pub fn options(mut self, options: ServerOptions) -> Self {
        self.options = options;
        self
    }

    /// Enables the password grant.
    pub fn users(mut self, users: Arc<dyn UserDirectory>) -> Self {
        self.users = Some(users);
        self
    }

    /// Override the codec derived from the options.
    pub fn codec(mut self, codec: Arc<dyn AccessTokenCodec>) -> Self {
        self.codec = Some(codec);
        self
    }

    /// Override the default store-backed policies.
    pub fn policies(mut self, policies: Policies) -> Self {
        self.policies = Some(policies);
        self
    }

    pub fn hook(mut self, hook: Arc<dyn DecisionHook>) -> Self {
        self.hooks.register(hook);
        self
    }

    pub fn hook_for(mut self, event: DecisionEvent, hook: Arc<dyn DecisionHook>) -> Self {
        self.hooks.register_for(event, hook);
        self
    }

    /// Replace the hook list, dropping the default tracing hook.
    pub fn hooks(mut self, hooks: HookRegistry) -> Self {
        self.hooks = hooks;
        self
    }

    pub fn build(self) -> std::result::Result<AuthorizationEngine, ServerError> {
        let codec = match self.codec {
            Some(codec) => codec,
            None => {
                self.options
                    .validate()
                    .map_err(|e| ServerError::Config(e.to_string()))?;
                self.options.access_token_codec()?
            }
        };

        let policies = self.policies.unwrap_or_else(|| {
            Policies::uniform(Arc::new(StorePolicy::new(
                self.store.clone(),
                self.users,
                &self.options,
            )))
        });

        Ok(AuthorizationEngine {
            store: self.store,
            codec,
            policies,
            hooks: self.hooks,
            options: self.options,
        })
    }
}

impl AuthorizationEngine {
    pub fn builder(store: Arc<dyn CredentialStore>) -> EngineBuilder {
        EngineBuilder::new(store)
    }

    pub fn options(&self) -> &ServerOptions {
        &self.options
    }

    pub fn store(&self) -> &Arc<dyn CredentialStore> {
        &self.store
    }

    /// The caller's context, bounded by `store_timeout` when it has no deadline.
    fn bounded(&self, ctx: &CallContext) -> CallContext {
        match self.options.store_timeout() {
            Some(limit) => ctx.clone().with_default_timeout(limit),
            None => ctx.clone(),
        }
    }

    // ─── Decisions ──────────────────────────────────────────────

    async fn decide<T, F>(
        &self,
        record: DecisionRecord,
        decision: F,
        project: fn(&T) -> Option<Value>,
    ) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        self.hooks.run_before(&record).await;
        let result = decision.await;
        let outcome = match &result {
            Ok(value) => DecisionOutcome::Allowed(project(value)),
            Err(err) => DecisionOutcome::Denied(err.kind.code().to_string()),
        };
        self.hooks.run_after(&record, &outcome).await;
        result
    }

    async fn client_authorized(&self, ctx: &CallContext, client_id: &str, grant: GrantType) -> Result<()> {
        let record = DecisionRecord::new(
            DecisionEvent::ClientAuthorized,
            Some(client_id),
            json!({ "grant_type": grant.as_str() }),
        );
        self.decide(
            record,
            self.policies.client_authorized.client_authorized(ctx, client_id, grant),
            |_| None,
        )
        .await
    }

    async fn client_scope(&self, ctx: &CallContext, client_id: &str, scope: &str) -> Result<()> {
        let record = DecisionRecord::new(DecisionEvent::ClientScope, Some(client_id), json!({ "scope": scope }));
        self.decide(
            record,
            self.policies.client_scope.client_scope(ctx, client_id, scope),
            |_| None,
        )
        .await
    }

    async fn authorize_scope(&self, client_id: &str, requested: &str, grant: GrantType) -> Result<String> {
        let record = DecisionRecord::new(
            DecisionEvent::AuthorizeScope,
            Some(client_id),
            json!({ "scope": requested, "grant_type": grant.as_str() }),
        );
        let policy = self.policies.authorize_scope.clone();
        self.decide(
            record,
            async move { policy.authorize_scope(requested, grant) },
            |scope| Some(json!(scope)),
        )
        .await
    }

    async fn refreshing_scope(&self, client_id: &str, requested: &str, old_scope: &str) -> Result<()> {
        let record = DecisionRecord::new(
            DecisionEvent::RefreshingScope,
            Some(client_id),
            json!({ "scope": requested, "old_scope": old_scope }),
        );
        let policy = self.policies.refreshing_scope.clone();
        self.decide(
            record,
            async move { policy.refreshing_scope(requested, old_scope) },
            |_| None,
        )
        .await
    }

    async fn password_authorization(
        &self,
        ctx: &CallContext,
        client_id: &str,
        username: &str,
        password: &str,
    ) -> Result<Uuid> {
        let record = DecisionRecord::new(
            DecisionEvent::PasswordAuthorization,
            Some(client_id),
            json!({ "username": username }),
        );
        self.decide(
            record,
            self.policies
                .password
                .password_authorization(ctx, client_id, username, password),
            |user_id| Some(json!(user_id.to_string())),
        )
        .await
    }

    /// Extra response fields for an issued lineage.
    pub async fn extension_fields(&self, token: &Token) -> ExtensionFields {
        let record = DecisionRecord::new(
            DecisionEvent::ExtensionFields,
            Some(&token.client_id),
            json!({ "lineage": token.id.to_string() }),
        );
        let policy = self.policies.extension_fields.clone();
        let fields = self
            .decide(record, async move { Ok(policy.extension_fields(token)) }, |_| None)
            .await;
        match fields {
            Ok(fields) => fields,
            Err(_) => self.policies.extension_fields.extension_fields(token),
        }
    }

    // ─── Shared steps ───────────────────────────────────────────

    async fn load_client(&self, ctx: &CallContext, client_id: &str) -> Result<Client> {
        ctx.run(self.store.get_client_by_id(client_id))
            .await
            .map_err(missing_as(OAuthErrorKind::InvalidClient, "get_client_by_id"))
    }

    /// Client authentication followed by the grant-type policy check.
    async fn authenticate(&self, ctx: &CallContext, req: &TokenRequest, grant: GrantType) -> Result<Client> {
        let client_id = req.client_id.as_deref().unwrap_or_default();
        let client = self.load_client(ctx, client_id).await?;
        authenticate_client(&client, req.client_secret.as_deref())?;
        self.client_authorized(ctx, &client.id, grant).await?;
        Ok(client)
    }

    /// Effective scope for a new grant: the per-grant ceiling applies to an
    /// explicit request, an absent one falls back to the client's scope, and
    /// the result must sit inside the client's ceiling.
    async fn resolve_scope(
        &self,
        ctx: &CallContext,
        client: &Client,
        requested: Option<&str>,
        grant: GrantType,
    ) -> Result<String> {
        let requested = normalize(requested.unwrap_or_default());
        let mut scope = self.authorize_scope(&client.id, &requested, grant).await?;
        if scope.is_empty() {
            scope = normalize(&client.scope);
        }
        self.client_scope(ctx, &client.id, &scope).await?;
        Ok(scope)
    }

    /// Mint access (and optionally refresh) values onto `params`.
    fn mint(&self, params: CreateTokenParams, issued_at: DateTime<Utc>, with_refresh: bool) -> Result<CreateTokenParams> {
        let access = self
            .codec
            .generate(&AccessTokenInput {
                client_id: &params.client_id,
                user_id: params.user_id,
                scope: &params.scope,
                issued_at,
                expires_in: self.options.access_token_ttl,
            })
            .map_err(|e| {
                tracing::error!(error = %e, "access token generation failed");
                OAuthError::server_error().context(e.to_string())
            })?;

        let params = params.access(access, issued_at, self.options.access_token_ttl);
        Ok(if with_refresh {
            params.refresh(generate_refresh_token(), issued_at, self.options.refresh_token_ttl)
        } else {
            params
        })
    }

    async fn token_response(&self, token: &Token) -> Result<TokenResponse> {
        let access_token = token
            .access
            .clone()
            .ok_or_else(|| OAuthError::server_error().context("issued lineage has no access token"))?;
        Ok(TokenResponse {
            access_token,
            refresh_token: token.refresh.clone(),
            scope: token.scope.clone(),
            extension: self.extension_fields(token).await,
        })
    }

    fn map_issue_error(operation: &'static str) -> impl Fn(StoreError) -> OAuthError {
        move |err| match err {
            StoreError::ClientNotFound(_) => OAuthError::invalid_client(),
            other => store_failure(operation)(other),
        }
    }

    // ─── Authorize ──────────────────────────────────────────────

    /// Start the authorization code flow for an already-authenticated user.
    pub async fn authorize(&self, ctx: &CallContext, req: AuthorizeRequest) -> Result<AuthorizeResponse> {
        let ctx = &self.bounded(ctx);
        validation::authorize_validator().validate(&req)?;
        if req.response_type != "code" {
            return Err(OAuthError::new(OAuthErrorKind::UnsupportedResponseType));
        }

        let client = self.load_client(ctx, &req.client_id).await?;
        let redirect_uri = validate_redirect_uri(&client.domain, req.redirect_uri.as_deref())
            .map_err(|e| rejected(GrantType::AuthorizationCode, &client.id, e))?;

        let challenge = req
            .code_challenge
            .as_deref()
            .map(str::trim)
            .filter(|c| !c.is_empty());
        let method = match challenge {
            Some(challenge) => Some(
                pkce::validate_challenge(
                    challenge,
                    req.code_challenge_method.as_deref(),
                    self.options.allow_plain_pkce,
                )
                .map_err(|e| OAuthError::invalid_request(e.to_string()))?,
            ),
            None if req.code_challenge_method.is_some() => {
                return Err(OAuthError::invalid_request("code_challenge_method without code_challenge"));
            }
            None if client.is_public && self.options.require_pkce_for_public_clients => {
                return Err(rejected(
                    GrantType::AuthorizationCode,
                    &client.id,
                    OAuthError::invalid_request("code_challenge is required for public clients"),
                ));
            }
            None => None,
        };

        self.client_authorized(ctx, &client.id, GrantType::AuthorizationCode).await?;
        let scope = self
            .resolve_scope(ctx, &client, req.scope.as_deref(), GrantType::AuthorizationCode)
            .await?;

        let issued_at = now();
        let code = generate_authorization_code();
        let params = CreateTokenParams::new(client.id.clone(), scope)
            .user(Some(req.user_id))
            .redirect_uri(redirect_uri.clone())
            .code(code.clone(), issued_at, self.options.authorization_code_ttl)
            .challenge(
                challenge.map(str::to_string),
                method.map(|m| m.as_str().to_string()),
            );

        let token = ctx
            .run(self.store.create_token(params))
            .await
            .map_err(Self::map_issue_error("authorize: create_token"))?;
        tracing::info!(lineage = %token.id, client_id = %client.id, "authorization code issued");

        let mut redirect_to = Url::parse(&redirect_uri)
            .map_err(|_| OAuthError::new(OAuthErrorKind::InvalidRedirectUri))?;
        {
            let mut query = redirect_to.query_pairs_mut();
            query.append_pair("code", &code);
            if let Some(state) = req.state.as_deref() {
                query.append_pair("state", state);
            }
        }

        Ok(AuthorizeResponse {
            code,
            state: req.state,
            redirect_uri,
            redirect_to: redirect_to.into(),
        })
    }

    // ─── Token ──────────────────────────────────────────────────

    /// Token endpoint: dispatch on `grant_type`.
    pub async fn token(&self, ctx: &CallContext, req: TokenRequest) -> Result<TokenResponse> {
        let ctx = &self.bounded(ctx);
        let grant: GrantType = req
            .grant_type
            .parse()
            .map_err(|_| OAuthError::new(OAuthErrorKind::UnsupportedGrantType))?;
        validation::token_validator(grant).validate(&req)?;

        let client_id = req.client_id.clone().unwrap_or_default();
        let result = match grant {
            GrantType::AuthorizationCode => self.exchange_code(ctx, &req).await,
            GrantType::Password => self.password(ctx, &req).await,
            GrantType::ClientCredentials => self.client_credentials(ctx, &req).await,
            GrantType::RefreshToken => self.refresh(ctx, &req).await,
        };
        result.map_err(|e| rejected(grant, &client_id, e))
    }

    async fn exchange_code(&self, ctx: &CallContext, req: &TokenRequest) -> Result<TokenResponse> {
        let client = self.authenticate(ctx, req, GrantType::AuthorizationCode).await?;
        let code = req.code.as_deref().unwrap_or_default();

        let stored = ctx
            .run(self.store.get_token_by_code(code))
            .await
            .map_err(missing_as(OAuthErrorKind::InvalidGrant, "get_token_by_code"))?;

        if stored.client_id != client.id {
            return Err(OAuthError::invalid_grant().context("code issued to another client"));
        }

        if !stored.is_code_active(now()) {
            if let Err(e) = ctx.run(self.store.delete_by_code(code)).await {
                tracing::warn!(lineage = %stored.id, error = %e, "failed to delete expired code");
            }
            return Err(OAuthError::invalid_grant().context("code expired"));
        }

        if !stored.redirect_uri.is_empty()
            && req.redirect_uri.as_deref() != Some(stored.redirect_uri.as_str())
        {
            return Err(OAuthError::invalid_grant().context("redirect_uri mismatch"));
        }

        match (stored.code_challenge.as_deref(), req.code_verifier.as_deref()) {
            (Some(challenge), Some(verifier)) => {
                pkce::verify_code_verifier(verifier, challenge, stored.code_challenge_method.as_deref())
                    .map_err(|e: PkceError| OAuthError::invalid_grant().context(e.to_string()))?;
            }
            (Some(_), None) => {
                return Err(OAuthError::invalid_grant().context("code_verifier missing"));
            }
            (None, Some(_)) => {
                return Err(OAuthError::invalid_grant().context("code_verifier sent for a code without challenge"));
            }
            (None, None) => {}
        }

        let params = CreateTokenParams::new(stored.client_id.clone(), stored.scope.clone())
            .user(stored.user_id)
            .redirect_uri(stored.redirect_uri.clone());
        let params = self.mint(params, now(), true)?;

        let token = ctx
            .run(self.store.exchange_code(code, params))
            .await
            .map_err(|e| match e {
                StoreError::NotFound => OAuthError::invalid_grant().context("code already consumed"),
                other => Self::map_issue_error("exchange_code")(other),
            })?;
        tracing::info!(lineage = %token.id, consumed = %stored.id, client_id = %client.id, "authorization code exchanged");

        self.token_response(&token).await
    }

    async fn password(&self, ctx: &CallContext, req: &TokenRequest) -> Result<TokenResponse> {
        let client = self.authenticate(ctx, req, GrantType::Password).await?;
        if client.is_public {
            return Err(OAuthError::unauthorized_client().context("public client"));
        }
        let user_id = self
            .password_authorization(
                ctx,
                &client.id,
                req.username.as_deref().unwrap_or_default(),
                req.password.as_deref().unwrap_or_default(),
            )
            .await?;
        let scope = self
            .resolve_scope(ctx, &client, req.scope.as_deref(), GrantType::Password)
            .await?;

        let params = CreateTokenParams::new(client.id.clone(), scope).user(Some(user_id));
        let params = self.mint(params, now(), client.allows_grant(GrantType::RefreshToken))?;

        let token = ctx
            .run(self.store.create_token(params))
            .await
            .map_err(Self::map_issue_error("password: create_token"))?;
        tracing::info!(lineage = %token.id, client_id = %client.id, "password grant issued");

        self.token_response(&token).await
    }

    async fn client_credentials(&self, ctx: &CallContext, req: &TokenRequest) -> Result<TokenResponse> {
        let client = self.authenticate(ctx, req, GrantType::ClientCredentials).await?;
        if client.is_public {
            return Err(OAuthError::unauthorized_client().context("public client"));
        }
        let scope = self
            .resolve_scope(ctx, &client, req.scope.as_deref(), GrantType::ClientCredentials)
            .await?;

        let params = CreateTokenParams::new(client.id.clone(), scope);
        let params = self.mint(params, now(), self.options.client_credentials_refresh)?;

        let token = ctx
            .run(self.store.create_token(params))
            .await
            .map_err(Self::map_issue_error("client_credentials: create_token"))?;
        tracing::info!(lineage = %token.id, client_id = %client.id, "client credentials issued");

        self.token_response(&token).await
    }

    async fn refresh(&self, ctx: &CallContext, req: &TokenRequest) -> Result<TokenResponse> {
        let client = self.authenticate(ctx, req, GrantType::RefreshToken).await?;
        let refresh = req.refresh_token.as_deref().unwrap_or_default();

        let stored = ctx
            .run(self.store.get_token_by_refresh(refresh))
            .await
            .map_err(missing_as(OAuthErrorKind::InvalidGrant, "get_token_by_refresh"))?;

        if stored.client_id != client.id {
            return Err(OAuthError::invalid_grant().context("refresh token issued to another client"));
        }
        if !stored.is_refresh_active(now()) {
            return Err(OAuthError::invalid_grant().context("refresh token expired"));
        }

        let requested = normalize(req.scope.as_deref().unwrap_or_default());
        let scope = if requested.is_empty() {
            stored.scope.clone()
        } else {
            self.refreshing_scope(&client.id, &requested, &stored.scope).await?;
            requested
        };
        self.client_scope(ctx, &client.id, &scope).await?;

        let params = CreateTokenParams::new(stored.client_id.clone(), scope)
            .user(stored.user_id)
            .redirect_uri(stored.redirect_uri.clone());
        let params = self.mint(params, now(), true)?;

        let token = ctx
            .run(self.store.rotate_refresh(refresh, params))
            .await
            .map_err(|e| match e {
                StoreError::NotFound => OAuthError::invalid_grant().context("refresh token already rotated"),
                other => Self::map_issue_error("rotate_refresh")(other),
            })?;
        tracing::info!(lineage = %token.id, rotated = %stored.id, client_id = %client.id, "refresh token rotated");

        self.token_response(&token).await
    }

    // ─── Revoke / introspect / verify ───────────────────────────

    /// Idempotent revocation. Success does not reveal whether the token existed.
    pub async fn revoke(&self, ctx: &CallContext, req: RevokeRequest) -> Result<()> {
        let ctx = &self.bounded(ctx);
        validation::revoke_validator().validate(&req)?;

        let removed = match TokenTypeHint::parse_lenient(req.token_type_hint.as_deref()) {
            Some(TokenTypeHint::AccessToken) => ctx
                .run(self.store.delete_by_access(&req.token))
                .await
                .map_err(store_failure("delete_by_access"))?,
            Some(TokenTypeHint::RefreshToken) => ctx
                .run(self.store.delete_by_refresh(&req.token))
                .await
                .map_err(store_failure("delete_by_refresh"))?,
            None => {
                let by_access = ctx
                    .run(self.store.delete_by_access(&req.token))
                    .await
                    .map_err(store_failure("delete_by_access"))?;
                let by_refresh = ctx
                    .run(self.store.delete_by_refresh(&req.token))
                    .await
                    .map_err(store_failure("delete_by_refresh"))?;
                by_access + by_refresh
            }
        };

        if removed > 0 {
            tracing::info!(rows = removed, "token revoked");
        } else {
            tracing::debug!("revocation of unknown token");
        }
        Ok(())
    }

    /// RFC 7662 introspection. Unknown, expired and revoked tokens are
    /// `active: false`, not errors.
    pub async fn introspect(&self, ctx: &CallContext, req: IntrospectRequest) -> Result<IntrospectResponse> {
        let ctx = &self.bounded(ctx);
        validation::introspect_validator().validate(&req)?;

        let order = match TokenTypeHint::parse_lenient(req.token_type_hint.as_deref()) {
            Some(TokenTypeHint::RefreshToken) => [TokenTypeHint::RefreshToken, TokenTypeHint::AccessToken],
            _ => [TokenTypeHint::AccessToken, TokenTypeHint::RefreshToken],
        };

        for kind in order {
            let lookup = match kind {
                TokenTypeHint::AccessToken => ctx.run(self.store.get_token_by_access(&req.token)).await,
                TokenTypeHint::RefreshToken => ctx.run(self.store.get_token_by_refresh(&req.token)).await,
            };
            let token = match lookup {
                Ok(token) => token,
                Err(StoreError::NotFound) => continue,
                Err(other) => return Err(store_failure("introspect")(other)),
            };

            let now = now();
            let (active, issued_at, expires_at) = match kind {
                TokenTypeHint::AccessToken => (
                    token.is_access_active(now),
                    token.access_created_at,
                    token.access_expires_at(),
                ),
                TokenTypeHint::RefreshToken => (
                    token.is_refresh_active(now),
                    token.refresh_created_at,
                    token.refresh_expires_at(),
                ),
            };
            if !active {
                return Ok(IntrospectResponse::inactive());
            }

            return Ok(IntrospectResponse {
                active: true,
                scope: Some(token.scope),
                client_id: Some(token.client_id),
                user_id: token.user_id.map(|u| u.to_string()),
                token_type: Some(kind.as_str().to_string()),
                exp: expires_at.map(|t| t.timestamp()),
                iat: issued_at.map(|t| t.timestamp()),
            });
        }

        Ok(IntrospectResponse::inactive())
    }

    /// Bearer validation for resource servers. Every failure is
    /// `invalid_access_token`; store faults stay `server_error`.
    pub async fn verify_access_token(&self, ctx: &CallContext, access: &str) -> Result<Token> {
        let ctx = &self.bounded(ctx);
        if access.trim().is_empty() {
            return Err(OAuthError::invalid_access_token());
        }

        let claims = self
            .codec
            .verify(access)
            .map_err(|e| OAuthError::invalid_access_token().context(e.to_string()))?;

        let token = ctx
            .run(self.store.get_token_by_access(access))
            .await
            .map_err(missing_as(OAuthErrorKind::InvalidAccessToken, "get_token_by_access"))?;

        if !token.is_access_active(now()) {
            return Err(OAuthError::invalid_access_token().context("access token expired"));
        }
        if let Some(claims) = claims {
            if claims.aud != token.client_id {
                return Err(OAuthError::invalid_access_token().context("audience mismatch"));
            }
        }
        Ok(token)
    }

    /// Resolve a refresh token to its lineage without rotating it.
    pub async fn verify_refresh_token(&self, ctx: &CallContext, refresh: &str) -> Result<Token> {
        let ctx = &self.bounded(ctx);
        if refresh.trim().is_empty() {
            return Err(OAuthError::new(OAuthErrorKind::InvalidRefreshToken));
        }

        let token = ctx
            .run(self.store.get_token_by_refresh(refresh))
            .await
            .map_err(missing_as(OAuthErrorKind::InvalidRefreshToken, "get_token_by_refresh"))?;

        if !token.is_refresh_active(now()) {
            return Err(OAuthError::new(OAuthErrorKind::InvalidRefreshToken).context("refresh token expired"));
        }
        Ok(token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use oauth2_server_memory::MemoryStore;
    use oauth2_server_test_utils::fixtures;
    use std::sync::Mutex;

    use crate::client::hash_client_secret;

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<(DecisionEvent, bool)>>,
    }

    #[async_trait::async_trait]
    impl DecisionHook for Recorder {
        async fn after(&self, record: &DecisionRecord, outcome: &DecisionOutcome) {
            self.events
                .lock()
                .unwrap()
                .push((record.event, outcome.is_allowed()));
        }
    }

    async fn engine_with(recorder: Arc<Recorder>) -> (AuthorizationEngine, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let mut client = fixtures::confidential_client("svc");
        client.secret_hash = hash_client_secret("s3cret");
        store.create_client(client).await.unwrap();

        let engine = AuthorizationEngine::builder(store.clone())
            .hook(recorder)
            .build()
            .unwrap();
        (engine, store)
    }

    #[tokio::test]
    async fn test_hooks_observe_each_decision() {
        let recorder = Arc::new(Recorder::default());
        let (engine, _) = engine_with(recorder.clone()).await;

        let req = TokenRequest::new("client_credentials", "svc")
            .secret("s3cret")
            .scope("user:read");
        engine.token(&CallContext::new(), req).await.unwrap();

        let events = recorder.events.lock().unwrap().clone();
        assert_eq!(
            events,
            vec![
                (DecisionEvent::ClientAuthorized, true),
                (DecisionEvent::AuthorizeScope, true),
                (DecisionEvent::ClientScope, true),
                (DecisionEvent::ExtensionFields, true),
            ]
        );
    }

    #[tokio::test]
    async fn test_hooks_see_denials() {
        let recorder = Arc::new(Recorder::default());
        let (engine, _) = engine_with(recorder.clone()).await;

        let req = TokenRequest::new("client_credentials", "svc")
            .secret("s3cret")
            .scope("client:write");
        let err = engine.token(&CallContext::new(), req).await.unwrap_err();
        assert_eq!(err.kind, OAuthErrorKind::InvalidScope);

        let events = recorder.events.lock().unwrap().clone();
        assert_eq!(events.last(), Some(&(DecisionEvent::AuthorizeScope, false)));
    }

    #[tokio::test]
    async fn test_unknown_grant_type() {
        let (engine, _) = engine_with(Arc::default()).await;
        let err = engine
            .token(&CallContext::new(), TokenRequest::new("implicit", "svc"))
            .await
            .unwrap_err();
        assert_eq!(err.kind, OAuthErrorKind::UnsupportedGrantType);
    }

    #[tokio::test]
    async fn test_client_credentials_defaults_to_client_scope() {
        let store = Arc::new(MemoryStore::new());
        let mut client = fixtures::confidential_client("svc");
        client.secret_hash = hash_client_secret("s3cret");
        client.scope = "user:read".into();
        store.create_client(client).await.unwrap();
        let engine = AuthorizationEngine::builder(store.clone()).build().unwrap();

        let resp = engine
            .token(&CallContext::new(), TokenRequest::new("client_credentials", "svc").secret("s3cret"))
            .await
            .unwrap();
        assert_eq!(resp.scope, "user:read");
        assert!(resp.refresh_token.is_none());
        assert_eq!(resp.extension.user_id, None);
        assert_eq!(resp.extension.expires_in, 7200);
    }

    #[tokio::test]
    async fn test_wrong_secret_is_invalid_client() {
        let (engine, store) = engine_with(Arc::default()).await;
        let err = engine
            .token(
                &CallContext::new(),
                TokenRequest::new("client_credentials", "svc").secret("nope"),
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind, OAuthErrorKind::InvalidClient);
        assert_eq!(store.token_count().await, 0);
    }

    #[tokio::test]
    async fn test_cancelled_context_issues_nothing() {
        let (engine, store) = engine_with(Arc::default()).await;
        let ctx = CallContext::new();
        ctx.cancel();

        let err = engine
            .token(&ctx, TokenRequest::new("client_credentials", "svc").secret("s3cret"))
            .await
            .unwrap_err();
        assert_eq!(err.kind, OAuthErrorKind::TemporarilyUnavailable);
        assert_eq!(store.token_count().await, 0);
    }

    struct Stalled;

    #[async_trait::async_trait]
    impl crate::handlers::ClientAuthorizedHandler for Stalled {
        async fn client_authorized(&self, ctx: &CallContext, _: &str, _: GrantType) -> Result<()> {
            ctx.run(std::future::pending::<oauth2_server_core::StoreResult<()>>())
                .await
                .map_err(|e| OAuthError::from_store(&e, "stalled"))
        }
    }

    #[tokio::test]
    async fn test_store_timeout_bounds_unbounded_context() {
        let store = Arc::new(MemoryStore::new());
        let mut client = fixtures::confidential_client("svc");
        client.secret_hash = hash_client_secret("s3cret");
        store.create_client(client).await.unwrap();
        let options = ServerOptions {
            store_timeout_ms: 20,
            ..Default::default()
        };
        let policies = Policies::uniform(Arc::new(StorePolicy::new(store.clone(), None, &options)))
            .with_client_authorized(Arc::new(Stalled));
        let engine = AuthorizationEngine::builder(store.clone())
            .options(options)
            .policies(policies)
            .build()
            .unwrap();

        let result = tokio::time::timeout(
            std::time::Duration::from_secs(2),
            engine.token(&CallContext::new(), TokenRequest::new("client_credentials", "svc").secret("s3cret")),
        )
        .await
        .expect("engine call should be bounded by store_timeout");
        assert_eq!(result.unwrap_err().kind, OAuthErrorKind::TemporarilyUnavailable);
        assert_eq!(store.token_count().await, 0);
    }

    #[tokio::test]
    async fn test_jwt_engine_verifies_access_tokens() {
        let store = Arc::new(MemoryStore::new());
        let mut client = fixtures::confidential_client("svc");
        client.secret_hash = hash_client_secret("s3cret");
        store.create_client(client).await.unwrap();
        let options = ServerOptions {
            signing_key: Some("test-signing-key".into()),
            ..Default::default()
        };
        let engine = AuthorizationEngine::builder(store.clone())
            .options(options)
            .build()
            .unwrap();
        let ctx = CallContext::new();

        let resp = engine
            .token(&ctx, TokenRequest::new("client_credentials", "svc").secret("s3cret"))
            .await
            .unwrap();
        assert_eq!(resp.access_token.split('.').count(), 3);

        let token = engine.verify_access_token(&ctx, &resp.access_token).await.unwrap();
        assert_eq!(token.client_id, "svc");

        let mut tampered = resp.access_token.clone();
        tampered.push('x');
        let err = engine.verify_access_token(&ctx, &tampered).await.unwrap_err();
        assert_eq!(err.kind, OAuthErrorKind::InvalidAccessToken);
    }
}
