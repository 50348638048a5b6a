//! # oauth2-server
//!
//! Credential lifecycle engine for an OAuth 2.0 authorization server.
//!
//! Implements:
//! - Authorization Code Grant (with PKCE)
//! - Resource Owner Password Credentials Grant
//! - Client Credentials Grant
//! - Refresh Token Grant with rotation
//! - Token Introspection (RFC 7662)
//! - Token Revocation (RFC 7009)
//! - Hierarchical scope matching
//! - Discovery Metadata (RFC 8414)
//!
//! Persistence is pluggable through [`oauth2_server_core::CredentialStore`];
//! transport is left to the caller.

pub mod client;
pub mod codec;
pub mod config;
pub mod crypto;
pub mod discovery;
pub mod engine;
pub mod error;
pub mod handlers;
pub mod logging;
pub mod pkce;
pub mod scope;
pub mod sweeper;
pub mod types;
pub mod validation;

pub use config::*;
pub use engine::{AuthorizationEngine, EngineBuilder};
pub use error::*;
pub use types::*;
