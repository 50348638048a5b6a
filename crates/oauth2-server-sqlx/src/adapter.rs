// SqlxStore: credential store and user directory over sqlx::Any.
//
// Uses the `sqlx::any` driver to support Postgres and SQLite through a single
// runtime-polymorphic pool. Timestamps are persisted as unix seconds, client
// secret hashes as hex text. Atomic operations run inside one transaction; a
// future dropped mid-flight drops the transaction, which rolls it back.

use async_trait::async_trait;
use chrono::{DateTime, SubsecRound, Utc};
use sqlx::any::{AnyArguments, AnyRow};
use sqlx::query::Query;
use sqlx::{Any, AnyConnection, AnyPool, Row};
use uuid::Uuid;

use oauth2_server_core::db::models::{
    format_grant_list, parse_grant_list, Client, CreateTokenParams, Token, User,
};
use oauth2_server_core::db::store::{CredentialStore, StoreResult, UserDirectory};
use oauth2_server_core::error::StoreError;

use crate::migration;

/// SQLx-backed credential store.
#[derive(Debug, Clone)]
pub struct SqlxStore {
    pool: AnyPool,
}

impl SqlxStore {
    /// Create a store from an existing pool.
    pub fn new(pool: AnyPool) -> Self {
        Self { pool }
    }

    /// Create a store by connecting to a database URL.
    pub async fn connect(url: &str) -> StoreResult<Self> {
        sqlx::any::install_default_drivers();

        // Each connection to "sqlite::memory:" opens a separate database.
        let pool = if url.contains(":memory:") || url.contains("mode=memory") {
            sqlx::any::AnyPoolOptions::new()
                .max_connections(1)
                .connect(url)
                .await
        } else {
            AnyPool::connect(url).await
        }
        .map_err(|e| StoreError::backend(format!("database connection failed: {e}")))?;

        Ok(Self { pool })
    }

    /// Create any missing tables.
    pub async fn migrate(&self) -> StoreResult<()> {
        migration::get_migrations(&self.pool)
            .await?
            .run(&self.pool)
            .await
    }

    pub fn pool(&self) -> &AnyPool {
        &self.pool
    }
}

// ─── Binding and decoding ───────────────────────────────────────────

/// Typed bind value; NULLs keep their column type so Postgres accepts them.
#[derive(Debug, Clone)]
pub(crate) enum BindValue {
    Text(Option<String>),
    Int(Option<i64>),
}

impl BindValue {
    fn text(s: impl Into<String>) -> Self {
        Self::Text(Some(s.into()))
    }

    fn int(i: i64) -> Self {
        Self::Int(Some(i))
    }

    fn time(at: Option<DateTime<Utc>>) -> Self {
        Self::Int(at.map(|t| t.timestamp()))
    }
}

fn bind_all<'q>(sql: &'q str, binds: &'q [BindValue]) -> Query<'q, Any, AnyArguments<'q>> {
    let mut query = sqlx::query(sql);
    for bv in binds {
        query = match bv {
            BindValue::Text(s) => query.bind(s.as_deref()),
            BindValue::Int(i) => query.bind(*i),
        };
    }
    query
}

fn map_sqlx(err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::RowNotFound => StoreError::NotFound,
        sqlx::Error::Database(db) if db.is_unique_violation() => {
            StoreError::Conflict(db.constraint().unwrap_or("unique").to_string())
        }
        other => StoreError::backend(other),
    }
}

fn col<T>(row: &AnyRow, name: &str) -> StoreResult<T>
where
    T: for<'r> sqlx::Decode<'r, Any> + sqlx::Type<Any>,
{
    row.try_get(name)
        .map_err(|e| StoreError::backend(format!("column {name}: {e}")))
}

fn from_unix(secs: i64) -> StoreResult<DateTime<Utc>> {
    DateTime::from_timestamp(secs, 0)
        .ok_or_else(|| StoreError::backend(format!("timestamp out of range: {secs}")))
}

fn opt_time(row: &AnyRow, name: &str) -> StoreResult<Option<DateTime<Utc>>> {
    col::<Option<i64>>(row, name)?.map(from_unix).transpose()
}

fn parse_uuid(raw: &str) -> StoreResult<Uuid> {
    Uuid::parse_str(raw).map_err(|e| StoreError::backend(format!("bad uuid {raw:?}: {e}")))
}

fn opt_uuid(row: &AnyRow, name: &str) -> StoreResult<Option<Uuid>> {
    col::<Option<String>>(row, name)?
        .as_deref()
        .map(parse_uuid)
        .transpose()
}

const CLIENT_COLUMNS: &str =
    r#""id", "secret_hash", "domain", "is_public", "user_id", "allowed_grants", "scope", "created_at""#;

const TOKEN_COLUMNS: &str = r#""id", "client_id", "user_id", "redirect_uri", "scope",
    "code", "code_created_at", "code_expires_in", "code_challenge", "code_challenge_method",
    "access", "access_created_at", "access_expires_in",
    "refresh", "refresh_created_at", "refresh_expires_in", "created_at""#;

/// A row is expired when every populated stage has elapsed at `$1`..`$3`.
const EXPIRED_PREDICATE: &str = r#"("code" IS NULL OR "code_created_at" IS NULL OR "code_created_at" + "code_expires_in" <= $1)
    AND ("access" IS NULL OR "access_created_at" IS NULL OR "access_created_at" + "access_expires_in" <= $2)
    AND ("refresh" IS NULL OR "refresh_created_at" IS NULL OR "refresh_created_at" + "refresh_expires_in" <= $3)"#;

fn client_from_row(row: &AnyRow) -> StoreResult<Client> {
    let secret_hex: String = col(row, "secret_hash")?;
    let grants: String = col(row, "allowed_grants")?;
    Ok(Client {
        id: col(row, "id")?,
        secret_hash: hex::decode(&secret_hex)
            .map_err(|e| StoreError::backend(format!("bad secret hash: {e}")))?,
        domain: col(row, "domain")?,
        is_public: col::<i64>(row, "is_public")? != 0,
        owner_user_id: opt_uuid(row, "user_id")?,
        allowed_grants: parse_grant_list(&grants).map_err(StoreError::backend)?,
        scope: col(row, "scope")?,
        created_at: from_unix(col(row, "created_at")?)?,
    })
}

fn token_from_row(row: &AnyRow) -> StoreResult<Token> {
    let id: String = col(row, "id")?;
    Ok(Token {
        id: parse_uuid(&id)?,
        client_id: col(row, "client_id")?,
        user_id: opt_uuid(row, "user_id")?,
        redirect_uri: col(row, "redirect_uri")?,
        scope: col(row, "scope")?,
        code: col(row, "code")?,
        code_created_at: opt_time(row, "code_created_at")?,
        code_expires_in: col(row, "code_expires_in")?,
        code_challenge: col(row, "code_challenge")?,
        code_challenge_method: col(row, "code_challenge_method")?,
        access: col(row, "access")?,
        access_created_at: opt_time(row, "access_created_at")?,
        access_expires_in: col(row, "access_expires_in")?,
        refresh: col(row, "refresh")?,
        refresh_created_at: opt_time(row, "refresh_created_at")?,
        refresh_expires_in: col(row, "refresh_expires_in")?,
        created_at: from_unix(col(row, "created_at")?)?,
    })
}

fn user_from_row(row: &AnyRow) -> StoreResult<User> {
    let id: String = col(row, "id")?;
    Ok(User {
        id: parse_uuid(&id)?,
        email: col(row, "email")?,
        password_hash: col(row, "password_hash")?,
        created_at: from_unix(col(row, "created_at")?)?,
        verified_at: opt_time(row, "verified_at")?,
    })
}

// ─── Statements shared by plain and transactional paths ─────────────

/// Check the client exists, then insert the row. Runs on whatever
/// connection the caller holds, usually an open transaction.
async fn insert_token(conn: &mut AnyConnection, params: CreateTokenParams) -> StoreResult<Token> {
    let exists = bind_all(
        r#"SELECT "id" FROM "clients" WHERE "id" = $1"#,
        &[BindValue::text(params.client_id.clone())],
    )
    .fetch_optional(&mut *conn)
    .await
    .map_err(map_sqlx)?;
    if exists.is_none() {
        return Err(StoreError::ClientNotFound(params.client_id));
    }

    let token = params.into_token(Uuid::new_v4(), Utc::now().trunc_subsecs(0));
    let binds = vec![
        BindValue::text(token.id.to_string()),
        BindValue::text(token.client_id.clone()),
        BindValue::Text(token.user_id.map(|u| u.to_string())),
        BindValue::text(token.redirect_uri.clone()),
        BindValue::text(token.scope.clone()),
        BindValue::Text(token.code.clone()),
        BindValue::time(token.code_created_at),
        BindValue::int(token.code_expires_in),
        BindValue::Text(token.code_challenge.clone()),
        BindValue::Text(token.code_challenge_method.clone()),
        BindValue::Text(token.access.clone()),
        BindValue::time(token.access_created_at),
        BindValue::int(token.access_expires_in),
        BindValue::Text(token.refresh.clone()),
        BindValue::time(token.refresh_created_at),
        BindValue::int(token.refresh_expires_in),
        BindValue::int(token.created_at.timestamp()),
    ];
    let sql = format!(
        r#"INSERT INTO "tokens" ({TOKEN_COLUMNS}) VALUES
        ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17)"#
    );
    bind_all(&sql, &binds)
        .execute(&mut *conn)
        .await
        .map_err(map_sqlx)?;
    Ok(token)
}

impl SqlxStore {
    async fn fetch_token(&self, column: &str, value: &str) -> StoreResult<Token> {
        let sql = format!(r#"SELECT {TOKEN_COLUMNS} FROM "tokens" WHERE "{column}" = $1"#);
        let binds = [BindValue::text(value)];
        let row = bind_all(&sql, &binds)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx)?
            .ok_or(StoreError::NotFound)?;
        token_from_row(&row)
    }

    async fn delete_where(&self, column: &str, value: &str) -> StoreResult<u64> {
        let sql = format!(r#"DELETE FROM "tokens" WHERE "{column}" = $1"#);
        let binds = [BindValue::text(value)];
        let result = bind_all(&sql, &binds)
            .execute(&self.pool)
            .await
            .map_err(map_sqlx)?;
        Ok(result.rows_affected())
    }

    /// Delete the row holding `value` in `column` and insert `params`, in
    /// one transaction. Zero rows deleted means another caller won.
    async fn replace_where(
        &self,
        column: &str,
        value: &str,
        params: CreateTokenParams,
    ) -> StoreResult<Token> {
        let mut tx = self.pool.begin().await.map_err(map_sqlx)?;

        let sql = format!(r#"DELETE FROM "tokens" WHERE "{column}" = $1"#);
        let binds = [BindValue::text(value)];
        let deleted = bind_all(&sql, &binds)
            .execute(&mut *tx)
            .await
            .map_err(map_sqlx)?
            .rows_affected();
        if deleted == 0 {
            tx.rollback().await.map_err(map_sqlx)?;
            return Err(StoreError::NotFound);
        }

        let token = insert_token(&mut tx, params).await?;
        tx.commit().await.map_err(map_sqlx)?;
        Ok(token)
    }
}

#[async_trait]
impl CredentialStore for SqlxStore {
    async fn get_client_by_id(&self, id: &str) -> StoreResult<Client> {
        let sql = format!(r#"SELECT {CLIENT_COLUMNS} FROM "clients" WHERE "id" = $1"#);
        let binds = [BindValue::text(id)];
        let row = bind_all(&sql, &binds)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx)?
            .ok_or(StoreError::NotFound)?;
        client_from_row(&row)
    }

    async fn create_client(&self, client: Client) -> StoreResult<Client> {
        let mut client = client;
        client.created_at = client.created_at.trunc_subsecs(0);
        let binds = vec![
            BindValue::text(client.id.clone()),
            BindValue::text(hex::encode(&client.secret_hash)),
            BindValue::text(client.domain.clone()),
            BindValue::int(i64::from(client.is_public)),
            BindValue::Text(client.owner_user_id.map(|u| u.to_string())),
            BindValue::text(format_grant_list(&client.allowed_grants)),
            BindValue::text(client.scope.clone()),
            BindValue::int(client.created_at.timestamp()),
        ];
        let sql = format!(
            r#"INSERT INTO "clients" ({CLIENT_COLUMNS}) VALUES ($1, $2, $3, $4, $5, $6, $7, $8)"#
        );
        bind_all(&sql, &binds)
            .execute(&self.pool)
            .await
            .map_err(map_sqlx)?;
        Ok(client)
    }

    async fn create_token(&self, params: CreateTokenParams) -> StoreResult<Token> {
        let mut tx = self.pool.begin().await.map_err(map_sqlx)?;
        let token = insert_token(&mut tx, params).await?;
        tx.commit().await.map_err(map_sqlx)?;
        Ok(token)
    }

    async fn get_token_by_code(&self, code: &str) -> StoreResult<Token> {
        self.fetch_token("code", code).await
    }

    async fn get_token_by_access(&self, access: &str) -> StoreResult<Token> {
        self.fetch_token("access", access).await
    }

    async fn get_token_by_refresh(&self, refresh: &str) -> StoreResult<Token> {
        self.fetch_token("refresh", refresh).await
    }

    async fn delete_by_code(&self, code: &str) -> StoreResult<u64> {
        self.delete_where("code", code).await
    }

    async fn delete_by_access(&self, access: &str) -> StoreResult<u64> {
        self.delete_where("access", access).await
    }

    async fn delete_by_refresh(&self, refresh: &str) -> StoreResult<u64> {
        self.delete_where("refresh", refresh).await
    }

    async fn delete_expired_tokens(&self) -> StoreResult<u64> {
        // Select candidates first, then delete one row per statement with the
        // predicate re-checked, so no lock spans more than a single row.
        let now = Utc::now().timestamp();
        let now_binds = [BindValue::int(now), BindValue::int(now), BindValue::int(now)];
        let select = format!(r#"SELECT "id" FROM "tokens" WHERE {EXPIRED_PREDICATE}"#);
        let ids: Vec<String> = bind_all(&select, &now_binds)
            .fetch_all(&self.pool)
            .await
            .map_err(map_sqlx)?
            .iter()
            .map(|row| col::<String>(row, "id"))
            .collect::<StoreResult<_>>()?;

        let delete = format!(r#"DELETE FROM "tokens" WHERE {EXPIRED_PREDICATE} AND "id" = $4"#);
        let mut removed = 0u64;
        for id in ids {
            let now = Utc::now().timestamp();
            let binds = [
                BindValue::int(now),
                BindValue::int(now),
                BindValue::int(now),
                BindValue::text(id),
            ];
            removed += bind_all(&delete, &binds)
                .execute(&self.pool)
                .await
                .map_err(map_sqlx)?
                .rows_affected();
        }

        if removed > 0 {
            tracing::debug!(removed, "swept expired token rows");
        }
        Ok(removed)
    }

    async fn exchange_code(&self, code: &str, params: CreateTokenParams) -> StoreResult<Token> {
        self.replace_where("code", code, params).await
    }

    async fn rotate_refresh(&self, refresh: &str, params: CreateTokenParams) -> StoreResult<Token> {
        self.replace_where("refresh", refresh, params).await
    }
}

#[async_trait]
impl UserDirectory for SqlxStore {
    async fn get_user_by_username(&self, username: &str) -> StoreResult<User> {
        let binds = [BindValue::text(username.trim().to_lowercase())];
        let row = bind_all(
            r#"SELECT "id", "email", "password_hash", "created_at", "verified_at" FROM "users" WHERE "email" = $1"#,
            &binds,
        )
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx)?
        .ok_or(StoreError::NotFound)?;
        user_from_row(&row)
    }

    async fn create_user(&self, user: User) -> StoreResult<User> {
        let mut user = user;
        user.email = user.email.to_lowercase();
        user.created_at = user.created_at.trunc_subsecs(0);
        user.verified_at = user.verified_at.map(|t| t.trunc_subsecs(0));
        let binds = vec![
            BindValue::text(user.id.to_string()),
            BindValue::text(user.email.clone()),
            BindValue::text(user.password_hash.clone()),
            BindValue::int(user.created_at.timestamp()),
            BindValue::time(user.verified_at),
        ];
        bind_all(
            r#"INSERT INTO "users" ("id", "email", "password_hash", "created_at", "verified_at") VALUES ($1, $2, $3, $4, $5)"#,
            &binds,
        )
        .execute(&self.pool)
        .await
        .map_err(map_sqlx)?;
        Ok(user)
    }
}
