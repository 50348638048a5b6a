// Record generators for tests.
//
// Every generator draws fresh random values so cases can share one store
// without colliding on unique columns.

use chrono::{DateTime, Duration, SubsecRound, Utc};
use rand::distributions::Alphanumeric;
use rand::Rng;
use uuid::Uuid;

use oauth2_server_core::db::models::{Client, CreateTokenParams, GrantType, User};

/// Current time truncated to whole seconds, matching relational storage.
pub fn now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(0)
}

/// A random credential-shaped string.
pub fn random_value(prefix: &str) -> String {
    let tail: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(24)
        .map(char::from)
        .collect();
    format!("{prefix}-{tail}")
}

/// A confidential client allowed every grant, with a placeholder secret hash.
pub fn confidential_client(id: &str) -> Client {
    Client {
        id: id.to_string(),
        secret_hash: vec![0xAB; 32],
        domain: "https://app.example.com".to_string(),
        is_public: false,
        owner_user_id: None,
        allowed_grants: GrantType::ALL.into_iter().collect(),
        scope: "user:* client:read".to_string(),
        created_at: now(),
    }
}

/// A public client limited to the authorization code and refresh flows.
pub fn public_client(id: &str) -> Client {
    Client {
        id: id.to_string(),
        secret_hash: Vec::new(),
        domain: "https://spa.example.com/app".to_string(),
        is_public: true,
        owner_user_id: Some(Uuid::new_v4()),
        allowed_grants: [GrantType::AuthorizationCode, GrantType::RefreshToken]
            .into_iter()
            .collect(),
        scope: "user:read".to_string(),
        created_at: now(),
    }
}

/// A confidential client with a random id.
pub fn random_client() -> Client {
    confidential_client(&random_value("client"))
}

pub fn user(email: &str, password_hash: &str) -> User {
    let mut user = User::new(email, password_hash);
    user.created_at = now();
    user
}

/// Params for a fresh code-stage row.
pub fn code_params(client_id: &str, ttl: i64) -> CreateTokenParams {
    CreateTokenParams::new(client_id, "user:read")
        .user(Some(Uuid::new_v4()))
        .redirect_uri("https://app.example.com/cb")
        .code(random_value("code"), now(), ttl)
}

/// Params for an access + refresh row issued at `issued_at`.
pub fn lineage_params(
    client_id: &str,
    issued_at: DateTime<Utc>,
    access_ttl: i64,
    refresh_ttl: i64,
) -> CreateTokenParams {
    CreateTokenParams::new(client_id, "user:read")
        .user(Some(Uuid::new_v4()))
        .redirect_uri("https://app.example.com/cb")
        .access(random_value("at"), issued_at, access_ttl)
        .refresh(random_value("rt"), issued_at, refresh_ttl)
}

/// An access + refresh row issued `age` seconds ago.
pub fn aged_lineage_params(client_id: &str, age: i64, access_ttl: i64, refresh_ttl: i64) -> CreateTokenParams {
    lineage_params(client_id, now() - Duration::seconds(age), access_ttl, refresh_ttl)
}
