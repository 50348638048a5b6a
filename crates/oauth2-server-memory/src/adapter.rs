// In-memory credential store: HashMap tables implementing the core store traits.
//
// Token rows live in one table keyed by row id, with three secondary indexes
// (code, access, refresh) mapping credential values back to the row. Every
// mutation happens under a single write lock, which makes `exchange_code` and
// `rotate_refresh` trivially single-winner.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;
use uuid::Uuid;

use oauth2_server_core::db::models::{Client, CreateTokenParams, Token, User};
use oauth2_server_core::db::store::{CredentialStore, StoreResult, UserDirectory};
use oauth2_server_core::error::StoreError;

#[derive(Debug, Default, Clone)]
struct Tables {
    clients: HashMap<String, Client>,
    tokens: HashMap<Uuid, Token>,
    by_code: HashMap<String, Uuid>,
    by_access: HashMap<String, Uuid>,
    by_refresh: HashMap<String, Uuid>,
    /// Keyed by lowercased email.
    users: HashMap<String, User>,
}

impl Tables {
    fn lookup(&self, index: &HashMap<String, Uuid>, key: &str) -> StoreResult<Token> {
        index
            .get(key)
            .and_then(|id| self.tokens.get(id))
            .cloned()
            .ok_or(StoreError::NotFound)
    }

    fn insert_token(&mut self, params: CreateTokenParams) -> StoreResult<Token> {
        if !self.clients.contains_key(&params.client_id) {
            return Err(StoreError::ClientNotFound(params.client_id));
        }
        if let Some(code) = &params.code {
            if self.by_code.contains_key(code) {
                return Err(StoreError::Conflict("tokens.code".into()));
            }
        }
        if let Some(access) = &params.access {
            if self.by_access.contains_key(access) {
                return Err(StoreError::Conflict("tokens.access".into()));
            }
        }
        if let Some(refresh) = &params.refresh {
            if self.by_refresh.contains_key(refresh) {
                return Err(StoreError::Conflict("tokens.refresh".into()));
            }
        }

        let token = params.into_token(Uuid::new_v4(), Utc::now());
        self.index(&token);
        self.tokens.insert(token.id, token.clone());
        Ok(token)
    }

    fn index(&mut self, token: &Token) {
        if let Some(code) = &token.code {
            self.by_code.insert(code.clone(), token.id);
        }
        if let Some(access) = &token.access {
            self.by_access.insert(access.clone(), token.id);
        }
        if let Some(refresh) = &token.refresh {
            self.by_refresh.insert(refresh.clone(), token.id);
        }
    }

    fn remove_token(&mut self, id: &Uuid) -> Option<Token> {
        let token = self.tokens.remove(id)?;
        if let Some(code) = &token.code {
            self.by_code.remove(code);
        }
        if let Some(access) = &token.access {
            self.by_access.remove(access);
        }
        if let Some(refresh) = &token.refresh {
            self.by_refresh.remove(refresh);
        }
        Some(token)
    }

    fn restore(&mut self, token: Token) {
        self.index(&token);
        self.tokens.insert(token.id, token);
    }

    fn delete_via(&mut self, which: Index, key: &str) -> u64 {
        let id = match which {
            Index::Code => self.by_code.get(key),
            Index::Access => self.by_access.get(key),
            Index::Refresh => self.by_refresh.get(key),
        }
        .copied();
        match id {
            Some(id) => self.remove_token(&id).map_or(0, |_| 1),
            None => 0,
        }
    }

    /// Remove the row found through `which`/`key` and insert `params` in its
    /// place. On insert failure the removed row is put back untouched.
    fn replace_via(&mut self, which: Index, key: &str, params: CreateTokenParams) -> StoreResult<Token> {
        let id = match which {
            Index::Code => self.by_code.get(key),
            Index::Access => self.by_access.get(key),
            Index::Refresh => self.by_refresh.get(key),
        }
        .copied()
        .ok_or(StoreError::NotFound)?;

        let old = self.remove_token(&id).ok_or(StoreError::NotFound)?;
        match self.insert_token(params) {
            Ok(token) => Ok(token),
            Err(e) => {
                self.restore(old);
                Err(e)
            }
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Index {
    Code,
    Access,
    Refresh,
}

/// In-memory credential store and user directory.
///
/// Cloning shares the underlying tables. Data is lost when the last clone
/// is dropped.
#[derive(Debug, Clone)]
pub struct MemoryStore {
    tables: Arc<RwLock<Tables>>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    /// Create a new empty store.
    pub fn new() -> Self {
        Self {
            tables: Arc::new(RwLock::new(Tables::default())),
        }
    }

    /// Number of token rows currently held, expired or not.
    pub async fn token_count(&self) -> usize {
        self.tables.read().await.tokens.len()
    }

    pub async fn client_count(&self) -> usize {
        self.tables.read().await.clients.len()
    }

    /// Drop every client, token and user.
    pub async fn clear(&self) {
        *self.tables.write().await = Tables::default();
    }
}

#[async_trait]
impl CredentialStore for MemoryStore {
    async fn get_client_by_id(&self, id: &str) -> StoreResult<Client> {
        self.tables
            .read()
            .await
            .clients
            .get(id)
            .cloned()
            .ok_or(StoreError::NotFound)
    }

    async fn create_client(&self, client: Client) -> StoreResult<Client> {
        let mut tables = self.tables.write().await;
        if tables.clients.contains_key(&client.id) {
            return Err(StoreError::Conflict("clients.id".into()));
        }
        tables.clients.insert(client.id.clone(), client.clone());
        Ok(client)
    }

    async fn create_token(&self, params: CreateTokenParams) -> StoreResult<Token> {
        self.tables.write().await.insert_token(params)
    }

    async fn get_token_by_code(&self, code: &str) -> StoreResult<Token> {
        let tables = self.tables.read().await;
        tables.lookup(&tables.by_code, code)
    }

    async fn get_token_by_access(&self, access: &str) -> StoreResult<Token> {
        let tables = self.tables.read().await;
        tables.lookup(&tables.by_access, access)
    }

    async fn get_token_by_refresh(&self, refresh: &str) -> StoreResult<Token> {
        let tables = self.tables.read().await;
        tables.lookup(&tables.by_refresh, refresh)
    }

    async fn delete_by_code(&self, code: &str) -> StoreResult<u64> {
        Ok(self.tables.write().await.delete_via(Index::Code, code))
    }

    async fn delete_by_access(&self, access: &str) -> StoreResult<u64> {
        Ok(self.tables.write().await.delete_via(Index::Access, access))
    }

    async fn delete_by_refresh(&self, refresh: &str) -> StoreResult<u64> {
        Ok(self.tables.write().await.delete_via(Index::Refresh, refresh))
    }

    async fn delete_expired_tokens(&self) -> StoreResult<u64> {
        // Candidates are gathered under the read lock; each removal takes the
        // write lock for a single row and re-checks expiry against a fresh clock.
        let candidates: Vec<Uuid> = {
            let now = Utc::now();
            let tables = self.tables.read().await;
            tables
                .tokens
                .values()
                .filter(|t| t.is_expired(now))
                .map(|t| t.id)
                .collect()
        };

        let mut removed = 0u64;
        for id in candidates {
            let mut tables = self.tables.write().await;
            let still_expired = tables
                .tokens
                .get(&id)
                .map_or(false, |t| t.is_expired(Utc::now()));
            if still_expired && tables.remove_token(&id).is_some() {
                removed += 1;
            }
        }

        if removed > 0 {
            tracing::debug!(removed, "swept expired token rows");
        }
        Ok(removed)
    }

    async fn exchange_code(&self, code: &str, params: CreateTokenParams) -> StoreResult<Token> {
        self.tables
            .write()
            .await
            .replace_via(Index::Code, code, params)
    }

    async fn rotate_refresh(&self, refresh: &str, params: CreateTokenParams) -> StoreResult<Token> {
        self.tables
            .write()
            .await
            .replace_via(Index::Refresh, refresh, params)
    }
}

#[async_trait]
impl UserDirectory for MemoryStore {
    async fn get_user_by_username(&self, username: &str) -> StoreResult<User> {
        self.tables
            .read()
            .await
            .users
            .get(&username.trim().to_lowercase())
            .cloned()
            .ok_or(StoreError::NotFound)
    }

    async fn create_user(&self, user: User) -> StoreResult<User> {
        let mut tables = self.tables.write().await;
        let key = user.email.to_lowercase();
        if tables.users.contains_key(&key) {
            return Err(StoreError::Conflict("users.email".into()));
        }
        tables.users.insert(key, user.clone());
        Ok(user)
    }
}
