//! Engine flow tests over the in-memory store.
//!
//! Covers: authorization code with PKCE, code replay and concurrent exchange,
//! refresh rotation and scope containment, password and client credential
//! grants, revocation, introspection and bearer verification.

use std::sync::Arc;

use chrono::Duration;
use uuid::Uuid;

use oauth2_server::client::hash_client_secret;
use oauth2_server::crypto::hash_password;
use oauth2_server::pkce::{generate_code_challenge, generate_code_verifier, CodeChallengeMethod};
use oauth2_server::{
    AuthorizationEngine, AuthorizeRequest, AuthorizeResponse, IntrospectRequest, OAuthErrorKind,
    RevokeRequest, ServerOptions, TokenRequest, TokenResponse,
};
use oauth2_server_core::{
    CallContext, Client, CreateTokenParams, CredentialStore, GrantType, User, UserDirectory,
};
use oauth2_server_memory::MemoryStore;
use oauth2_server_test_utils::fixtures;

const SECRET: &str = "confidential-secret";

fn spa_client() -> Client {
    Client {
        id: "c1".to_string(),
        secret_hash: Vec::new(),
        domain: "https://spa.example.com/app".to_string(),
        is_public: true,
        owner_user_id: None,
        allowed_grants: [GrantType::AuthorizationCode, GrantType::RefreshToken]
            .into_iter()
            .collect(),
        scope: "user:read user:write".to_string(),
        created_at: fixtures::now(),
    }
}

fn backend_client() -> Client {
    let mut client = fixtures::confidential_client("backend");
    client.secret_hash = hash_client_secret(SECRET);
    client
}

/// Helper: engine over a fresh store seeded with both clients and one user.
async fn setup() -> (Arc<AuthorizationEngine>, Arc<MemoryStore>) {
    let store = Arc::new(MemoryStore::new());
    store.create_client(spa_client()).await.unwrap();
    store.create_client(backend_client()).await.unwrap();
    store
        .create_user(User::new("alice@example.com", hash_password("wonderland").unwrap()))
        .await
        .unwrap();

    let engine = AuthorizationEngine::builder(store.clone())
        .users(store.clone())
        .options(ServerOptions::default())
        .build()
        .unwrap();
    (Arc::new(engine), store)
}

struct Pkce {
    verifier: String,
    challenge: String,
}

fn pkce() -> Pkce {
    let verifier = generate_code_verifier();
    let challenge = generate_code_challenge(&verifier, CodeChallengeMethod::S256);
    Pkce { verifier, challenge }
}

async fn authorize(engine: &AuthorizationEngine, scope: &str, pkce: &Pkce) -> AuthorizeResponse {
    let mut req = AuthorizeRequest::new("c1", Uuid::new_v4());
    req.scope = Some(scope.to_string());
    req.redirect_uri = Some("https://spa.example.com/app/callback".to_string());
    req.state = Some("xyz".to_string());
    req.code_challenge = Some(pkce.challenge.clone());
    req.code_challenge_method = Some("S256".to_string());
    engine.authorize(&CallContext::new(), req).await.unwrap()
}

fn code_request(code: &str, verifier: &str) -> TokenRequest {
    let mut req = TokenRequest::new("authorization_code", "c1");
    req.code = Some(code.to_string());
    req.redirect_uri = Some("https://spa.example.com/app/callback".to_string());
    req.code_verifier = Some(verifier.to_string());
    req
}

fn refresh_request(refresh: &str, scope: Option<&str>) -> TokenRequest {
    let mut req = TokenRequest::new("refresh_token", "c1");
    req.refresh_token = Some(refresh.to_string());
    req.scope = scope.map(str::to_string);
    req
}

async fn issue_via_code(engine: &AuthorizationEngine, scope: &str) -> TokenResponse {
    let pkce = pkce();
    let auth = authorize(engine, scope, &pkce).await;
    engine
        .token(&CallContext::new(), code_request(&auth.code, &pkce.verifier))
        .await
        .unwrap()
}

// ─── Authorization code ──────────────────────────────────────────

#[tokio::test]
async fn test_public_client_pkce_scenario() {
    let (engine, _) = setup().await;
    let ctx = CallContext::new();

    let issued = issue_via_code(&engine, "user:read").await;
    assert_eq!(issued.scope, "user:read");
    assert_eq!(issued.extension.token_type, "Bearer");
    let old_refresh = issued.refresh_token.clone().unwrap();

    let err = engine
        .token(&ctx, refresh_request(&old_refresh, Some("user:write")))
        .await
        .unwrap_err();
    assert_eq!(err.kind, OAuthErrorKind::InvalidScope);

    let rotated = engine
        .token(&ctx, refresh_request(&old_refresh, Some("user:read")))
        .await
        .unwrap();
    assert_eq!(rotated.scope, "user:read");
    assert_eq!(rotated.extension.user_id, issued.extension.user_id);
    let new_refresh = rotated.refresh_token.clone().unwrap();
    assert_ne!(new_refresh, old_refresh);

    let err = engine
        .token(&ctx, refresh_request(&old_refresh, Some("user:read")))
        .await
        .unwrap_err();
    assert_eq!(err.kind, OAuthErrorKind::InvalidGrant);

    let info = engine
        .introspect(
            &ctx,
            IntrospectRequest {
                token: new_refresh,
                token_type_hint: Some("refresh_token".into()),
            },
        )
        .await
        .unwrap();
    assert!(info.active);
    assert_eq!(info.client_id.as_deref(), Some("c1"));
    assert_eq!(info.user_id, issued.extension.user_id);
    assert_eq!(info.token_type.as_deref(), Some("refresh_token"));
}

#[tokio::test]
async fn test_authorize_builds_redirect() {
    let (engine, store) = setup().await;
    let auth = authorize(&engine, "user:read", &pkce()).await;

    assert_eq!(auth.redirect_uri, "https://spa.example.com/app/callback");
    assert_eq!(auth.state.as_deref(), Some("xyz"));
    assert!(auth.redirect_to.starts_with("https://spa.example.com/app/callback?code="));
    assert!(auth.redirect_to.ends_with("&state=xyz"));

    let row = store.get_token_by_code(&auth.code).await.unwrap();
    assert_eq!(row.code_challenge_method.as_deref(), Some("S256"));
    assert!(row.access.is_none());
}

#[tokio::test]
async fn test_code_replay_is_invalid_grant() {
    let (engine, _) = setup().await;
    let pkce = pkce();
    let auth = authorize(&engine, "user:read", &pkce).await;
    let ctx = CallContext::new();

    engine
        .token(&ctx, code_request(&auth.code, &pkce.verifier))
        .await
        .unwrap();
    let err = engine
        .token(&ctx, code_request(&auth.code, &pkce.verifier))
        .await
        .unwrap_err();
    assert_eq!(err.kind, OAuthErrorKind::InvalidGrant);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_code_exchange_has_one_winner() {
    let (engine, _) = setup().await;
    let pkce = pkce();
    let auth = authorize(&engine, "user:read", &pkce).await;

    let attempts = (0..8).map(|_| {
        let engine = engine.clone();
        let req = code_request(&auth.code, &pkce.verifier);
        tokio::spawn(async move { engine.token(&CallContext::new(), req).await })
    });
    let results = futures::future::join_all(attempts).await;

    let mut wins = 0;
    for result in results {
        match result.unwrap() {
            Ok(_) => wins += 1,
            Err(e) => assert_eq!(e.kind, OAuthErrorKind::InvalidGrant),
        }
    }
    assert_eq!(wins, 1);
}

#[tokio::test]
async fn test_pkce_mismatch_keeps_code_usable() {
    let (engine, _) = setup().await;
    let pkce = pkce();
    let auth = authorize(&engine, "user:read", &pkce).await;
    let ctx = CallContext::new();

    let err = engine
        .token(&ctx, code_request(&auth.code, &"w".repeat(64)))
        .await
        .unwrap_err();
    assert_eq!(err.kind, OAuthErrorKind::InvalidGrant);

    let mut missing = code_request(&auth.code, "");
    missing.code_verifier = None;
    let err = engine.token(&ctx, missing).await.unwrap_err();
    assert_eq!(err.kind, OAuthErrorKind::InvalidGrant);

    assert!(engine
        .token(&ctx, code_request(&auth.code, &pkce.verifier))
        .await
        .is_ok());
}

#[tokio::test]
async fn test_expired_code_is_rejected_and_removed() {
    let (engine, store) = setup().await;
    let pkce = pkce();
    let params = CreateTokenParams::new("c1", "user:read")
        .user(Some(Uuid::new_v4()))
        .redirect_uri("https://spa.example.com/app/callback")
        .code("stale-code", fixtures::now() - Duration::seconds(700), 600)
        .challenge(Some(pkce.challenge.clone()), Some("S256".into()));
    store.create_token(params).await.unwrap();

    let err = engine
        .token(&CallContext::new(), code_request("stale-code", &pkce.verifier))
        .await
        .unwrap_err();
    assert_eq!(err.kind, OAuthErrorKind::InvalidGrant);
    assert!(store.get_token_by_code("stale-code").await.is_err());
}

#[tokio::test]
async fn test_code_bound_to_issuing_client() {
    let (engine, _) = setup().await;
    let pkce = pkce();
    let auth = authorize(&engine, "user:read", &pkce).await;

    let mut req = code_request(&auth.code, &pkce.verifier);
    req.client_id = Some("backend".into());
    req.client_secret = Some(SECRET.into());
    let err = engine.token(&CallContext::new(), req).await.unwrap_err();
    assert_eq!(err.kind, OAuthErrorKind::InvalidGrant);
}

#[tokio::test]
async fn test_redirect_uri_must_match_at_exchange() {
    let (engine, _) = setup().await;
    let pkce = pkce();
    let auth = authorize(&engine, "user:read", &pkce).await;

    let mut req = code_request(&auth.code, &pkce.verifier);
    req.redirect_uri = Some("https://spa.example.com/app/other".into());
    let err = engine.token(&CallContext::new(), req).await.unwrap_err();
    assert_eq!(err.kind, OAuthErrorKind::InvalidGrant);
}

#[tokio::test]
async fn test_exchange_without_redirect_uri_is_rejected() {
    let (engine, _) = setup().await;
    let pkce = pkce();
    let auth = authorize(&engine, "user:read", &pkce).await;
    let ctx = CallContext::new();

    let mut req = code_request(&auth.code, &pkce.verifier);
    req.redirect_uri = None;
    let err = engine.token(&ctx, req).await.unwrap_err();
    assert_eq!(err.kind, OAuthErrorKind::InvalidGrant);

    assert!(engine
        .token(&ctx, code_request(&auth.code, &pkce.verifier))
        .await
        .is_ok());
}

#[tokio::test]
async fn test_public_client_requires_challenge() {
    let (engine, store) = setup().await;
    let mut req = AuthorizeRequest::new("c1", Uuid::new_v4());
    req.scope = Some("user:read".into());

    let err = engine.authorize(&CallContext::new(), req).await.unwrap_err();
    assert_eq!(err.kind, OAuthErrorKind::InvalidRequest);
    assert_eq!(store.token_count().await, 0);
}

#[tokio::test]
async fn test_authorize_policy_failures_persist_nothing() {
    let (engine, store) = setup().await;
    let ctx = CallContext::new();
    let pkce = pkce();

    let mut foreign = AuthorizeRequest::new("c1", Uuid::new_v4());
    foreign.redirect_uri = Some("https://evil.example.net/app".into());
    foreign.code_challenge = Some(pkce.challenge.clone());
    foreign.code_challenge_method = Some("S256".into());
    let err = engine.authorize(&ctx, foreign).await.unwrap_err();
    assert_eq!(err.kind, OAuthErrorKind::InvalidRedirectUri);

    let mut wide = AuthorizeRequest::new("c1", Uuid::new_v4());
    wide.scope = Some("client:delete".into());
    wide.code_challenge = Some(pkce.challenge.clone());
    wide.code_challenge_method = Some("S256".into());
    let err = engine.authorize(&ctx, wide).await.unwrap_err();
    assert_eq!(err.kind, OAuthErrorKind::InvalidScope);

    let mut token_flow = AuthorizeRequest::new("c1", Uuid::new_v4());
    token_flow.response_type = "token".into();
    let err = engine.authorize(&ctx, token_flow).await.unwrap_err();
    assert_eq!(err.kind, OAuthErrorKind::UnsupportedResponseType);

    assert_eq!(store.token_count().await, 0);
}

#[tokio::test]
async fn test_absent_authorize_scope_uses_client_scope() {
    let (engine, store) = setup().await;
    let pkce = pkce();
    let mut req = AuthorizeRequest::new("c1", Uuid::new_v4());
    req.code_challenge = Some(pkce.challenge.clone());
    req.code_challenge_method = Some("S256".into());

    let auth = engine.authorize(&CallContext::new(), req).await.unwrap();
    assert_eq!(auth.redirect_uri, "https://spa.example.com/app");
    let row = store.get_token_by_code(&auth.code).await.unwrap();
    assert_eq!(row.scope, "user:read user:write");
}

// ─── Refresh ─────────────────────────────────────────────────────

#[tokio::test]
async fn test_refresh_without_scope_keeps_old_scope() {
    let (engine, _) = setup().await;
    let issued = issue_via_code(&engine, "user:read user:write").await;

    let rotated = engine
        .token(
            &CallContext::new(),
            refresh_request(issued.refresh_token.as_deref().unwrap(), None),
        )
        .await
        .unwrap();
    assert_eq!(rotated.scope, "user:read user:write");
}

#[tokio::test]
async fn test_rotation_revokes_old_access_token() {
    let (engine, _) = setup().await;
    let ctx = CallContext::new();
    let issued = issue_via_code(&engine, "user:read").await;

    engine
        .token(&ctx, refresh_request(issued.refresh_token.as_deref().unwrap(), None))
        .await
        .unwrap();

    let err = engine
        .verify_access_token(&ctx, &issued.access_token)
        .await
        .unwrap_err();
    assert_eq!(err.kind, OAuthErrorKind::InvalidAccessToken);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_refresh_has_one_winner() {
    let (engine, _) = setup().await;
    let issued = issue_via_code(&engine, "user:read").await;
    let refresh = issued.refresh_token.unwrap();

    let attempts = (0..8).map(|_| {
        let engine = engine.clone();
        let req = refresh_request(&refresh, None);
        tokio::spawn(async move { engine.token(&CallContext::new(), req).await })
    });
    let results = futures::future::join_all(attempts).await;

    let wins = results
        .into_iter()
        .map(|r| r.unwrap())
        .filter(|r| r.is_ok())
        .count();
    assert_eq!(wins, 1);
}

#[tokio::test]
async fn test_verify_refresh_token() {
    let (engine, store) = setup().await;
    let ctx = CallContext::new();
    let issued = issue_via_code(&engine, "user:read").await;
    let refresh = issued.refresh_token.unwrap();

    let token = engine.verify_refresh_token(&ctx, &refresh).await.unwrap();
    assert_eq!(token.client_id, "c1");
    assert_eq!(token.scope, "user:read");

    let err = engine.verify_refresh_token(&ctx, "unknown").await.unwrap_err();
    assert_eq!(err.kind, OAuthErrorKind::InvalidRefreshToken);

    let params = fixtures::aged_lineage_params("c1", 120, 60, 60);
    let stale = params.refresh.clone().unwrap();
    store.create_token(params).await.unwrap();
    let err = engine.verify_refresh_token(&ctx, &stale).await.unwrap_err();
    assert_eq!(err.kind, OAuthErrorKind::InvalidRefreshToken);
}

#[tokio::test]
async fn test_expired_refresh_is_invalid_grant() {
    let (engine, store) = setup().await;
    let params = fixtures::aged_lineage_params("c1", 120, 60, 60);
    let refresh = params.refresh.clone().unwrap();
    store.create_token(params).await.unwrap();

    let err = engine
        .token(&CallContext::new(), refresh_request(&refresh, None))
        .await
        .unwrap_err();
    assert_eq!(err.kind, OAuthErrorKind::InvalidGrant);
}

// ─── Password / client credentials ───────────────────────────────

fn password_request(username: &str, password: &str) -> TokenRequest {
    let mut req = TokenRequest::new("password", "backend").secret(SECRET);
    req.username = Some(username.to_string());
    req.password = Some(password.to_string());
    req
}

#[tokio::test]
async fn test_password_grant() {
    let (engine, _) = setup().await;
    let resp = engine
        .token(
            &CallContext::new(),
            password_request("Alice@Example.com", "wonderland").scope("user:profile"),
        )
        .await
        .unwrap();
    assert_eq!(resp.scope, "user:profile");
    assert!(resp.refresh_token.is_some());
    assert!(resp.extension.user_id.is_some());
}

#[tokio::test]
async fn test_password_failures_look_identical() {
    let (engine, _) = setup().await;
    let ctx = CallContext::new();

    let unknown = engine
        .token(&ctx, password_request("bob@example.com", "wonderland"))
        .await
        .unwrap_err();
    let mismatch = engine
        .token(&ctx, password_request("alice@example.com", "looking-glass"))
        .await
        .unwrap_err();
    assert_eq!(unknown.kind, OAuthErrorKind::InvalidGrant);
    assert_eq!(unknown.to_json(), mismatch.to_json());
}

#[tokio::test]
async fn test_password_grant_respects_ceiling() {
    let (engine, _) = setup().await;
    let err = engine
        .token(
            &CallContext::new(),
            password_request("alice@example.com", "wonderland").scope("client:read"),
        )
        .await
        .unwrap_err();
    assert_eq!(err.kind, OAuthErrorKind::InvalidScope);
}

#[tokio::test]
async fn test_public_client_cannot_use_password_grant() {
    let (engine, store) = setup().await;
    let mut client = spa_client();
    client.id = "mobile".into();
    client.allowed_grants.insert(GrantType::Password);
    store.create_client(client).await.unwrap();

    let mut req = TokenRequest::new("password", "mobile");
    req.username = Some("alice@example.com".into());
    req.password = Some("wonderland".into());
    let err = engine.token(&CallContext::new(), req).await.unwrap_err();
    assert_eq!(err.kind, OAuthErrorKind::UnauthorizedClient);
    assert_eq!(store.token_count().await, 0);
}

#[tokio::test]
async fn test_client_credentials_has_no_user() {
    let (engine, store) = setup().await;
    let resp = engine
        .token(
            &CallContext::new(),
            TokenRequest::new("client_credentials", "backend")
                .secret(SECRET)
                .scope("client:read"),
        )
        .await
        .unwrap();
    assert!(resp.refresh_token.is_none());

    let row = store.get_token_by_access(&resp.access_token).await.unwrap();
    assert!(row.user_id.is_none());
    assert_eq!(row.scope, "client:read");
}

// ─── Revoke / introspect / verify ────────────────────────────────

#[tokio::test]
async fn test_revoke_is_idempotent() {
    let (engine, _) = setup().await;
    let ctx = CallContext::new();
    let issued = issue_via_code(&engine, "user:read").await;

    for _ in 0..2 {
        engine
            .revoke(
                &ctx,
                RevokeRequest {
                    token: issued.access_token.clone(),
                    token_type_hint: Some("access_token".into()),
                },
            )
            .await
            .unwrap();
    }
    engine
        .revoke(
            &ctx,
            RevokeRequest {
                token: "never-issued".into(),
                token_type_hint: None,
            },
        )
        .await
        .unwrap();

    let info = engine
        .introspect(
            &ctx,
            IntrospectRequest {
                token: issued.access_token.clone(),
                token_type_hint: None,
            },
        )
        .await
        .unwrap();
    assert!(!info.active);
    assert!(engine.verify_access_token(&ctx, &issued.access_token).await.is_err());
}

#[tokio::test]
async fn test_revoke_by_refresh_without_hint() {
    let (engine, _) = setup().await;
    let ctx = CallContext::new();
    let issued = issue_via_code(&engine, "user:read").await;
    let refresh = issued.refresh_token.unwrap();

    engine
        .revoke(
            &ctx,
            RevokeRequest {
                token: refresh.clone(),
                token_type_hint: None,
            },
        )
        .await
        .unwrap();

    let err = engine
        .token(&ctx, refresh_request(&refresh, None))
        .await
        .unwrap_err();
    assert_eq!(err.kind, OAuthErrorKind::InvalidGrant);
}

#[tokio::test]
async fn test_introspect_expired_before_sweep() {
    let (engine, store) = setup().await;
    let ctx = CallContext::new();
    let params = fixtures::aged_lineage_params("c1", 120, 60, 3600);
    let access = params.access.clone().unwrap();
    let refresh = params.refresh.clone().unwrap();
    store.create_token(params).await.unwrap();

    let info = engine
        .introspect(
            &ctx,
            IntrospectRequest {
                token: access.clone(),
                token_type_hint: None,
            },
        )
        .await
        .unwrap();
    assert_eq!(info, oauth2_server::IntrospectResponse::inactive());

    let info = engine
        .introspect(
            &ctx,
            IntrospectRequest {
                token: refresh,
                token_type_hint: None,
            },
        )
        .await
        .unwrap();
    assert!(info.active);

    let err = engine.verify_access_token(&ctx, &access).await.unwrap_err();
    assert_eq!(err.kind, OAuthErrorKind::InvalidAccessToken);
}

#[tokio::test]
async fn test_introspect_active_access_claims() {
    let (engine, _) = setup().await;
    let issued = issue_via_code(&engine, "user:read").await;

    let info = engine
        .introspect(
            &CallContext::new(),
            IntrospectRequest {
                token: issued.access_token.clone(),
                token_type_hint: Some("access_token".into()),
            },
        )
        .await
        .unwrap();
    assert!(info.active);
    assert_eq!(info.scope.as_deref(), Some("user:read"));
    assert_eq!(info.token_type.as_deref(), Some("access_token"));
    assert_eq!(info.exp.unwrap() - info.iat.unwrap(), 7200);
}

#[tokio::test]
async fn test_verify_access_token() {
    let (engine, _) = setup().await;
    let ctx = CallContext::new();
    let issued = issue_via_code(&engine, "user:read").await;

    let token = engine.verify_access_token(&ctx, &issued.access_token).await.unwrap();
    assert_eq!(token.client_id, "c1");
    assert_eq!(token.scope, "user:read");

    let err = engine.verify_access_token(&ctx, "bogus").await.unwrap_err();
    assert_eq!(err.kind, OAuthErrorKind::InvalidAccessToken);
}
