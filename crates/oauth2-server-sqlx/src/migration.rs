// Schema migrations for the relational credential store.
//
// Introspects the live database for existing tables, compares against the
// three tables the store needs (clients, tokens, users) and produces a plan of
// CREATE TABLE / CREATE INDEX statements for whatever is missing. The DDL is
// portable between SQLite and PostgreSQL: timestamps are unix seconds in
// BIGINT columns and ids are TEXT.

use sqlx::{AnyPool, Row};

use oauth2_server_core::error::StoreError;

// ---------------------------------------------------------------------------
// Target schema
// ---------------------------------------------------------------------------

/// One table the store owns.
#[derive(Debug, Clone, Copy)]
pub struct TableDef {
    pub name: &'static str,
    pub create: &'static str,
    pub indexes: &'static [&'static str],
}

/// Tables in dependency order.
pub const TABLES: &[TableDef] = &[
    TableDef {
        name: "clients",
        create: r#"CREATE TABLE IF NOT EXISTS "clients" (
    "id" TEXT PRIMARY KEY,
    "secret_hash" TEXT NOT NULL DEFAULT '',
    "domain" TEXT NOT NULL,
    "is_public" BIGINT NOT NULL DEFAULT 0,
    "user_id" TEXT,
    "allowed_grants" TEXT NOT NULL DEFAULT '',
    "scope" TEXT NOT NULL DEFAULT '',
    "created_at" BIGINT NOT NULL
)"#,
        indexes: &[],
    },
    TableDef {
        name: "tokens",
        create: r#"CREATE TABLE IF NOT EXISTS "tokens" (
    "id" TEXT PRIMARY KEY,
    "client_id" TEXT NOT NULL REFERENCES "clients" ("id"),
    "user_id" TEXT,
    "redirect_uri" TEXT NOT NULL DEFAULT '',
    "scope" TEXT NOT NULL DEFAULT '',
    "code" TEXT UNIQUE,
    "code_created_at" BIGINT,
    "code_expires_in" BIGINT NOT NULL DEFAULT 0,
    "code_challenge" TEXT,
    "code_challenge_method" TEXT,
    "access" TEXT UNIQUE,
    "access_created_at" BIGINT,
    "access_expires_in" BIGINT NOT NULL DEFAULT 0,
    "refresh" TEXT UNIQUE,
    "refresh_created_at" BIGINT,
    "refresh_expires_in" BIGINT NOT NULL DEFAULT 0,
    "created_at" BIGINT NOT NULL
)"#,
        indexes: &[
            r#"CREATE INDEX IF NOT EXISTS "idx_tokens_client_id" ON "tokens" ("client_id")"#,
        ],
    },
    TableDef {
        name: "users",
        create: r#"CREATE TABLE IF NOT EXISTS "users" (
    "id" TEXT PRIMARY KEY,
    "email" TEXT NOT NULL UNIQUE,
    "password_hash" TEXT NOT NULL,
    "created_at" BIGINT NOT NULL,
    "verified_at" BIGINT
)"#,
        indexes: &[],
    },
];

// ---------------------------------------------------------------------------
// Migration plan
// ---------------------------------------------------------------------------

/// Result of comparing the live database against [`TABLES`].
#[derive(Debug, Clone, Default)]
pub struct MigrationPlan {
    /// Tables missing from the database.
    pub to_be_created: Vec<&'static str>,
    /// The SQL statements to run, in order.
    pub statements: Vec<String>,
}

impl MigrationPlan {
    /// Compile all statements into a single SQL script.
    pub fn compile(&self) -> String {
        if self.statements.is_empty() {
            return ";".to_string();
        }
        self.statements
            .iter()
            .map(|s| format!("{s};"))
            .collect::<Vec<_>>()
            .join("\n\n")
    }

    pub fn has_pending(&self) -> bool {
        !self.to_be_created.is_empty()
    }

    /// Run every statement against the pool.
    pub async fn run(&self, pool: &AnyPool) -> Result<(), StoreError> {
        for stmt in &self.statements {
            sqlx::query(stmt)
                .execute(pool)
                .await
                .map_err(|e| StoreError::backend(format!("migration failed: {e}\nSQL: {stmt}")))?;
        }
        if self.has_pending() {
            tracing::info!(tables = ?self.to_be_created, "applied credential store migrations");
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Database type detection
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DatabaseType {
    Sqlite,
    Postgres,
}

/// Detect the database type from the pool's connect options.
pub fn detect_db_type(pool: &AnyPool) -> DatabaseType {
    let opts = format!("{:?}", pool.connect_options()).to_lowercase();
    if opts.contains("postgres") {
        DatabaseType::Postgres
    } else {
        DatabaseType::Sqlite
    }
}

// ---------------------------------------------------------------------------
// Introspection
// ---------------------------------------------------------------------------

/// Names of the user tables present in the database.
pub async fn existing_tables(pool: &AnyPool, db_type: DatabaseType) -> Result<Vec<String>, StoreError> {
    let sql = match db_type {
        DatabaseType::Sqlite => {
            "SELECT name FROM sqlite_master WHERE type='table' AND name NOT LIKE 'sqlite_%'"
        }
        DatabaseType::Postgres => {
            "SELECT table_name AS name FROM information_schema.tables WHERE table_schema = current_schema()"
        }
    };

    let rows = sqlx::query(sql)
        .fetch_all(pool)
        .await
        .map_err(|e| StoreError::backend(format!("table introspection failed: {e}")))?;

    rows.iter()
        .map(|row| {
            row.try_get::<String, _>("name")
                .map_err(|e| StoreError::backend(format!("failed to read table name: {e}")))
        })
        .collect()
}

/// Build the plan that brings the database up to [`TABLES`].
pub async fn get_migrations(pool: &AnyPool) -> Result<MigrationPlan, StoreError> {
    let db_type = detect_db_type(pool);
    let existing = existing_tables(pool, db_type).await?;
    Ok(plan_for(&existing))
}

fn plan_for(existing: &[String]) -> MigrationPlan {
    let mut plan = MigrationPlan::default();
    for table in TABLES {
        if existing.iter().any(|name| name == table.name) {
            continue;
        }
        plan.to_be_created.push(table.name);
        plan.statements.push(table.create.to_string());
        plan.statements
            .extend(table.indexes.iter().map(|s| s.to_string()));
    }
    plan
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plan_for_empty_db_creates_everything() {
        let plan = plan_for(&[]);
        assert_eq!(plan.to_be_created, vec!["clients", "tokens", "users"]);
        assert_eq!(plan.statements.len(), 4);
        assert!(plan.compile().contains("CREATE TABLE IF NOT EXISTS \"tokens\""));
    }

    #[test]
    fn test_plan_skips_existing_tables() {
        let plan = plan_for(&["clients".to_string(), "users".to_string()]);
        assert_eq!(plan.to_be_created, vec!["tokens"]);
        assert!(plan.has_pending());
    }

    #[test]
    fn test_empty_plan_compiles_to_noop() {
        let existing: Vec<String> = TABLES.iter().map(|t| t.name.to_string()).collect();
        let plan = plan_for(&existing);
        assert!(!plan.has_pending());
        assert_eq!(plan.compile(), ";");
    }

    #[tokio::test]
    async fn test_get_migrations_sqlite_empty_db() {
        sqlx::any::install_default_drivers();
        let pool = sqlx::any::AnyPoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .expect("Failed to create SQLite pool");

        let plan = get_migrations(&pool).await.expect("Migration computation failed");
        assert_eq!(plan.to_be_created.len(), 3);

        plan.run(&pool).await.expect("Migration failed");
        let again = get_migrations(&pool).await.expect("Migration computation failed");
        assert!(!again.has_pending());
    }
}
