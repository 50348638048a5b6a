// Credential store contract: the persistence seam every backend implements.
//
// Stores are dumb and consistent: point lookups, idempotent deletes, an
// expiry sweep, and two atomic check-and-replace operations used for code
// consumption and refresh rotation. All policy lives in the engine.

use std::fmt;

use async_trait::async_trait;

use crate::db::models::{Client, CreateTokenParams, Token, User};
use crate::error::StoreError;

/// Result type for store operations.
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Persistence for clients and token lineages.
///
/// Lookups return `StoreError::NotFound` for an absent key, never a backend
/// error. Deletes return the number of rows removed and treat an absent key
/// as success (`Ok(0)`).
#[async_trait]
pub trait CredentialStore: Send + Sync + fmt::Debug {
    async fn get_client_by_id(&self, id: &str) -> StoreResult<Client>;

    /// Register a client. Used by seeding and tests.
    async fn create_client(&self, client: Client) -> StoreResult<Client>;

    /// Persist a new lineage row. Fails with `ClientNotFound` when the
    /// referenced client does not exist and `Conflict` on a duplicate
    /// code/access/refresh value.
    async fn create_token(&self, params: CreateTokenParams) -> StoreResult<Token>;

    async fn get_token_by_code(&self, code: &str) -> StoreResult<Token>;

    async fn get_token_by_access(&self, access: &str) -> StoreResult<Token>;

    async fn get_token_by_refresh(&self, refresh: &str) -> StoreResult<Token>;

    async fn delete_by_code(&self, code: &str) -> StoreResult<u64>;

    async fn delete_by_access(&self, access: &str) -> StoreResult<u64>;

    async fn delete_by_refresh(&self, refresh: &str) -> StoreResult<u64>;

    /// Delete every row whose populated stages have all elapsed, using the
    /// same `created_at + expires_in` formula as point lookups.
    async fn delete_expired_tokens(&self) -> StoreResult<u64>;

    /// Atomically delete the row holding `code` and insert `params`.
    ///
    /// Exactly one of any number of concurrent callers for the same code
    /// succeeds; the rest get `NotFound`. Nothing is written on failure.
    async fn exchange_code(&self, code: &str, params: CreateTokenParams) -> StoreResult<Token>;

    /// Atomically delete the row holding `refresh` (old access included) and
    /// insert `params`. Same single-winner guarantee as `exchange_code`.
    async fn rotate_refresh(&self, refresh: &str, params: CreateTokenParams) -> StoreResult<Token>;
}

/// Lookup of resource owners for the password grant.
#[async_trait]
pub trait UserDirectory: Send + Sync + fmt::Debug {
    /// Usernames are email addresses, matched case-insensitively.
    async fn get_user_by_username(&self, username: &str) -> StoreResult<User>;

    async fn create_user(&self, user: User) -> StoreResult<User>;
}
