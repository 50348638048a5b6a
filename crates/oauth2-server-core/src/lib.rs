//! Shared foundation for the OAuth2 authorization server.
//!
//! Holds the persisted data model, the [`CredentialStore`] and
//! [`UserDirectory`] contracts every backend implements, store errors, the
//! per-call [`CallContext`], decision hooks and environment helpers.

pub mod context;
pub mod db;
pub mod env;
pub mod error;
pub mod hooks;

// Re-exports for convenience
pub use context::CallContext;
pub use db::models::{
    format_grant_list, parse_grant_list, Client, CreateTokenParams, GrantType, Token,
    UnknownGrantType, User,
};
pub use db::store::{CredentialStore, StoreResult, UserDirectory};
pub use error::{ConfigError, StoreError};
pub use hooks::{DecisionEvent, DecisionHook, DecisionOutcome, DecisionRecord, HookRegistry};
