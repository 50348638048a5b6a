// oauth2-server-sqlx: relational credential store.
//
// Implements the core store traits over sqlx::AnyPool, supporting SQLite and
// Postgres. `SqlxStore::migrate` creates the clients, tokens and users tables.

pub mod adapter;
pub mod migration;

pub use adapter::SqlxStore;
pub use migration::{get_migrations, MigrationPlan, TABLES};
