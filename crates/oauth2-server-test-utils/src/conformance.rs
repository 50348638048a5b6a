// Credential store conformance suite.
//
// Every backend runs the same cases: point lookups, NotFound semantics,
// idempotent deletes, unique credential values, the expiry sweep, and the
// single-winner guarantee of `exchange_code` / `rotate_refresh` under
// concurrent callers. Cases use random ids, so they can share one store.

use std::sync::Arc;

use chrono::Duration;

use oauth2_server_core::db::models::{CreateTokenParams, Token};
use oauth2_server_core::db::store::{CredentialStore, StoreResult, UserDirectory};
use oauth2_server_core::error::StoreError;

use crate::fixtures;

/// Number of concurrent callers racing for one code or refresh token.
const RACERS: usize = 8;

/// A failed conformance case.
#[derive(Debug, Clone, thiserror::Error)]
#[error("[{case}] {message}")]
pub struct ConformanceError {
    pub case: &'static str,
    pub message: String,
}

fn fail(case: &'static str, message: impl Into<String>) -> ConformanceError {
    ConformanceError {
        case,
        message: message.into(),
    }
}

fn ensure(case: &'static str, cond: bool, message: &str) -> Result<(), ConformanceError> {
    if cond {
        Ok(())
    } else {
        Err(fail(case, message))
    }
}

trait StoreResultExt<T> {
    fn during(self, case: &'static str, op: &str) -> Result<T, ConformanceError>;
}

impl<T> StoreResultExt<T> for StoreResult<T> {
    fn during(self, case: &'static str, op: &str) -> Result<T, ConformanceError> {
        self.map_err(|e| fail(case, format!("{op} failed: {e}")))
    }
}

fn expect_not_found<T: std::fmt::Debug>(
    case: &'static str,
    op: &str,
    res: StoreResult<T>,
) -> Result<(), ConformanceError> {
    match res {
        Err(StoreError::NotFound) => Ok(()),
        other => Err(fail(case, format!("{op}: expected NotFound, got {other:?}"))),
    }
}

async fn seeded_client(store: &Arc<dyn CredentialStore>, case: &'static str) -> Result<String, ConformanceError> {
    let client = store
        .create_client(fixtures::random_client())
        .await
        .during(case, "create_client")?;
    Ok(client.id)
}

/// Run every credential store case against `store`.
pub async fn run_all(store: Arc<dyn CredentialStore>) -> Result<(), ConformanceError> {
    tracing::info!("running credential store conformance suite");

    client_round_trip(&store).await?;
    create_token_requires_client(&store).await?;
    lookups_resolve_each_index(&store).await?;
    duplicate_values_conflict(&store).await?;
    deletes_are_idempotent(&store).await?;
    timestamps_survive_storage(&store).await?;
    exchange_code_consumes_code(&store).await?;
    exchange_code_single_winner(&store).await?;
    rotate_refresh_invalidates_old_pair(&store).await?;
    rotate_refresh_single_winner(&store).await?;
    sweep_uses_expiry_formula(&store).await?;

    tracing::info!("credential store conformance suite passed");
    Ok(())
}

async fn client_round_trip(store: &Arc<dyn CredentialStore>) -> Result<(), ConformanceError> {
    const CASE: &str = "client_round_trip";
    let mut client = fixtures::public_client(&fixtures::random_value("spa"));
    client.owner_user_id = Some(uuid::Uuid::new_v4());
    store
        .create_client(client.clone())
        .await
        .during(CASE, "create_client")?;

    let loaded = store
        .get_client_by_id(&client.id)
        .await
        .during(CASE, "get_client_by_id")?;
    ensure(CASE, loaded.domain == client.domain, "domain changed")?;
    ensure(CASE, loaded.is_public, "is_public lost")?;
    ensure(CASE, loaded.allowed_grants == client.allowed_grants, "grants changed")?;
    ensure(CASE, loaded.scope == client.scope, "scope changed")?;
    ensure(CASE, loaded.owner_user_id == client.owner_user_id, "owner changed")?;
    ensure(CASE, loaded.secret_hash == client.secret_hash, "secret hash changed")?;

    expect_not_found(CASE, "unknown client", store.get_client_by_id("no-such-client").await)?;

    match store.create_client(client).await {
        Err(StoreError::Conflict(_)) => Ok(()),
        other => Err(fail(CASE, format!("duplicate client id: expected Conflict, got {other:?}"))),
    }
}

async fn create_token_requires_client(store: &Arc<dyn CredentialStore>) -> Result<(), ConformanceError> {
    const CASE: &str = "create_token_requires_client";
    let ghost = fixtures::random_value("ghost");
    match store.create_token(fixtures::code_params(&ghost, 600)).await {
        Err(StoreError::ClientNotFound(id)) if id == ghost => Ok(()),
        other => Err(fail(CASE, format!("expected ClientNotFound, got {other:?}"))),
    }
}

async fn lookups_resolve_each_index(store: &Arc<dyn CredentialStore>) -> Result<(), ConformanceError> {
    const CASE: &str = "lookups_resolve_each_index";
    let client_id = seeded_client(store, CASE).await?;

    let params = fixtures::code_params(&client_id, 600).challenge(
        Some("E9Melhoa2OwvFrEMTJguCHaoeK1t8URWbuGJSstw-cM".into()),
        Some("S256".into()),
    );
    let code = params.code.clone().unwrap_or_default();
    let created = store.create_token(params).await.during(CASE, "create_token")?;
    let by_code = store
        .get_token_by_code(&code)
        .await
        .during(CASE, "get_token_by_code")?;
    ensure(CASE, by_code.id == created.id, "code lookup returned another row")?;
    ensure(CASE, by_code.code_challenge_method.as_deref() == Some("S256"), "challenge method lost")?;
    ensure(CASE, by_code.access.is_none(), "code row grew an access token")?;

    let params = fixtures::lineage_params(&client_id, fixtures::now(), 60, 3600);
    let (access, refresh) = (
        params.access.clone().unwrap_or_default(),
        params.refresh.clone().unwrap_or_default(),
    );
    let created = store.create_token(params).await.during(CASE, "create_token")?;
    let by_access = store
        .get_token_by_access(&access)
        .await
        .during(CASE, "get_token_by_access")?;
    let by_refresh = store
        .get_token_by_refresh(&refresh)
        .await
        .during(CASE, "get_token_by_refresh")?;
    ensure(CASE, by_access.id == created.id, "access lookup returned another row")?;
    ensure(CASE, by_refresh.id == created.id, "refresh lookup returned another row")?;
    ensure(CASE, by_refresh.user_id == created.user_id, "user id lost")?;

    expect_not_found(CASE, "absent code", store.get_token_by_code("nope").await)?;
    expect_not_found(CASE, "absent access", store.get_token_by_access("nope").await)?;
    expect_not_found(CASE, "absent refresh", store.get_token_by_refresh("nope").await)
}

async fn duplicate_values_conflict(store: &Arc<dyn CredentialStore>) -> Result<(), ConformanceError> {
    const CASE: &str = "duplicate_values_conflict";
    let client_id = seeded_client(store, CASE).await?;
    let params = fixtures::lineage_params(&client_id, fixtures::now(), 60, 3600);
    store
        .create_token(params.clone())
        .await
        .during(CASE, "create_token")?;

    let dup = CreateTokenParams::new(&client_id, "user:read").access(
        params.access.clone().unwrap_or_default(),
        fixtures::now(),
        60,
    );
    match store.create_token(dup).await {
        Err(StoreError::Conflict(_)) => Ok(()),
        other => Err(fail(CASE, format!("expected Conflict, got {other:?}"))),
    }
}

async fn deletes_are_idempotent(store: &Arc<dyn CredentialStore>) -> Result<(), ConformanceError> {
    const CASE: &str = "deletes_are_idempotent";
    let client_id = seeded_client(store, CASE).await?;
    let params = fixtures::lineage_params(&client_id, fixtures::now(), 60, 3600);
    let (access, refresh) = (
        params.access.clone().unwrap_or_default(),
        params.refresh.clone().unwrap_or_default(),
    );
    store.create_token(params).await.during(CASE, "create_token")?;

    let first = store.delete_by_access(&access).await.during(CASE, "delete_by_access")?;
    let second = store.delete_by_access(&access).await.during(CASE, "delete_by_access")?;
    ensure(CASE, first == 1, "first delete removed nothing")?;
    ensure(CASE, second == 0, "second delete removed a row")?;
    // The row goes with its access value, refresh included.
    expect_not_found(CASE, "refresh after access delete", store.get_token_by_refresh(&refresh).await)?;

    let none = store.delete_by_code("never-issued").await.during(CASE, "delete_by_code")?;
    ensure(CASE, none == 0, "deleting an absent code reported a row")?;
    let none = store.delete_by_refresh(&refresh).await.during(CASE, "delete_by_refresh")?;
    ensure(CASE, none == 0, "deleting a gone refresh reported a row")
}

async fn timestamps_survive_storage(store: &Arc<dyn CredentialStore>) -> Result<(), ConformanceError> {
    const CASE: &str = "timestamps_survive_storage";
    let client_id = seeded_client(store, CASE).await?;
    let issued = fixtures::now() - Duration::seconds(30);
    let params = fixtures::lineage_params(&client_id, issued, 45, 90);
    let access = params.access.clone().unwrap_or_default();
    store.create_token(params).await.during(CASE, "create_token")?;

    let token = store
        .get_token_by_access(&access)
        .await
        .during(CASE, "get_token_by_access")?;
    ensure(CASE, token.access_created_at == Some(issued), "access_created_at drifted")?;
    ensure(CASE, token.access_expires_in == 45, "access_expires_in changed")?;
    ensure(CASE, token.refresh_expires_in == 90, "refresh_expires_in changed")?;
    ensure(CASE, token.is_access_active(fixtures::now()), "access should still be active")?;
    ensure(
        CASE,
        !token.is_access_active(issued + Duration::seconds(45)),
        "access active at its expiry instant",
    )
}

fn exchange_params(client_id: &str) -> CreateTokenParams {
    fixtures::lineage_params(client_id, fixtures::now(), 3600, 7200)
}

async fn exchange_code_consumes_code(store: &Arc<dyn CredentialStore>) -> Result<(), ConformanceError> {
    const CASE: &str = "exchange_code_consumes_code";
    let client_id = seeded_client(store, CASE).await?;
    let params = fixtures::code_params(&client_id, 600);
    let code = params.code.clone().unwrap_or_default();
    store.create_token(params).await.during(CASE, "create_token")?;

    let issued: Token = store
        .exchange_code(&code, exchange_params(&client_id))
        .await
        .during(CASE, "exchange_code")?;
    ensure(CASE, issued.access.is_some(), "exchange issued no access token")?;
    expect_not_found(CASE, "code after exchange", store.get_token_by_code(&code).await)?;
    expect_not_found(
        CASE,
        "second exchange",
        store.exchange_code(&code, exchange_params(&client_id)).await,
    )?;
    expect_not_found(
        CASE,
        "exchange of unknown code",
        store.exchange_code("unknown", exchange_params(&client_id)).await,
    )
}

async fn exchange_code_single_winner(store: &Arc<dyn CredentialStore>) -> Result<(), ConformanceError> {
    const CASE: &str = "exchange_code_single_winner";
    let client_id = seeded_client(store, CASE).await?;
    let params = fixtures::code_params(&client_id, 600);
    let code = params.code.clone().unwrap_or_default();
    store.create_token(params).await.during(CASE, "create_token")?;

    let handles: Vec<_> = (0..RACERS)
        .map(|_| {
            let store = Arc::clone(store);
            let code = code.clone();
            let params = exchange_params(&client_id);
            tokio::spawn(async move { store.exchange_code(&code, params).await })
        })
        .collect();

    tally_race(CASE, handles).await
}

async fn rotate_refresh_invalidates_old_pair(store: &Arc<dyn CredentialStore>) -> Result<(), ConformanceError> {
    const CASE: &str = "rotate_refresh_invalidates_old_pair";
    let client_id = seeded_client(store, CASE).await?;
    let params = fixtures::lineage_params(&client_id, fixtures::now(), 60, 3600);
    let (access, refresh) = (
        params.access.clone().unwrap_or_default(),
        params.refresh.clone().unwrap_or_default(),
    );
    store.create_token(params).await.during(CASE, "create_token")?;

    let next = exchange_params(&client_id);
    let new_refresh = next.refresh.clone().unwrap_or_default();
    store
        .rotate_refresh(&refresh, next)
        .await
        .during(CASE, "rotate_refresh")?;

    expect_not_found(CASE, "old refresh", store.get_token_by_refresh(&refresh).await)?;
    expect_not_found(CASE, "old access", store.get_token_by_access(&access).await)?;
    store
        .get_token_by_refresh(&new_refresh)
        .await
        .during(CASE, "new refresh lookup")?;
    Ok(())
}

async fn rotate_refresh_single_winner(store: &Arc<dyn CredentialStore>) -> Result<(), ConformanceError> {
    const CASE: &str = "rotate_refresh_single_winner";
    let client_id = seeded_client(store, CASE).await?;
    let params = fixtures::lineage_params(&client_id, fixtures::now(), 60, 3600);
    let refresh = params.refresh.clone().unwrap_or_default();
    store.create_token(params).await.during(CASE, "create_token")?;

    let handles: Vec<_> = (0..RACERS)
        .map(|_| {
            let store = Arc::clone(store);
            let refresh = refresh.clone();
            let params = exchange_params(&client_id);
            tokio::spawn(async move { store.rotate_refresh(&refresh, params).await })
        })
        .collect();

    tally_race(CASE, handles).await
}

async fn tally_race(
    case: &'static str,
    handles: Vec<tokio::task::JoinHandle<StoreResult<Token>>>,
) -> Result<(), ConformanceError> {
    let mut winners = 0;
    for joined in futures::future::join_all(handles).await {
        match joined.map_err(|e| fail(case, format!("racer panicked: {e}")))? {
            Ok(_) => winners += 1,
            Err(StoreError::NotFound) => {}
            Err(e) => return Err(fail(case, format!("loser saw {e} instead of NotFound"))),
        }
    }
    ensure(case, winners == 1, &format!("expected exactly one winner, got {winners}"))
}

async fn sweep_uses_expiry_formula(store: &Arc<dyn CredentialStore>) -> Result<(), ConformanceError> {
    const CASE: &str = "sweep_uses_expiry_formula";
    let client_id = seeded_client(store, CASE).await?;

    // Both stages elapsed.
    let dead = fixtures::aged_lineage_params(&client_id, 600, 60, 120);
    let dead_access = dead.access.clone().unwrap_or_default();
    // Access elapsed, refresh alive.
    let half = fixtures::aged_lineage_params(&client_id, 600, 60, 3600);
    let half_refresh = half.refresh.clone().unwrap_or_default();
    // Fresh.
    let live = fixtures::lineage_params(&client_id, fixtures::now(), 60, 3600);
    let live_access = live.access.clone().unwrap_or_default();
    // Code expired.
    let stale_code = CreateTokenParams::new(&client_id, "user:read").code(
        fixtures::random_value("code"),
        fixtures::now() - Duration::seconds(700),
        600,
    );
    let stale_code_value = stale_code.code.clone().unwrap_or_default();

    for params in [dead, half, live, stale_code] {
        store.create_token(params).await.during(CASE, "create_token")?;
    }

    let removed = store
        .delete_expired_tokens()
        .await
        .during(CASE, "delete_expired_tokens")?;
    ensure(CASE, removed >= 2, &format!("sweep removed {removed} rows, expected at least 2"))?;

    expect_not_found(CASE, "dead lineage", store.get_token_by_access(&dead_access).await)?;
    expect_not_found(CASE, "stale code", store.get_token_by_code(&stale_code_value).await)?;
    store
        .get_token_by_refresh(&half_refresh)
        .await
        .during(CASE, "half-expired lineage")?;
    store
        .get_token_by_access(&live_access)
        .await
        .during(CASE, "live lineage")?;

    let again = store
        .delete_expired_tokens()
        .await
        .during(CASE, "delete_expired_tokens")?;
    ensure(CASE, again == 0, "second sweep found more expired rows")
}

/// Run the user directory cases against `directory`.
pub async fn run_user_directory(directory: Arc<dyn UserDirectory>) -> Result<(), ConformanceError> {
    const CASE: &str = "user_directory";
    let email = format!("{}@Example.com", fixtures::random_value("Alice"));
    let user = directory
        .create_user(fixtures::user(&email, "00ff:11ee"))
        .await
        .during(CASE, "create_user")?;
    ensure(CASE, user.email == email.to_lowercase(), "email not normalized")?;

    let loaded = directory
        .get_user_by_username(&email.to_uppercase())
        .await
        .during(CASE, "get_user_by_username")?;
    ensure(CASE, loaded.id == user.id, "lookup returned another user")?;
    ensure(CASE, loaded.password_hash == "00ff:11ee", "password hash changed")?;

    expect_not_found(
        CASE,
        "unknown user",
        directory.get_user_by_username("nobody@example.com").await,
    )?;

    match directory.create_user(fixtures::user(&email, "x")).await {
        Err(StoreError::Conflict(_)) => Ok(()),
        other => Err(fail(CASE, format!("duplicate email: expected Conflict, got {other:?}"))),
    }
}
