pub mod models;
pub mod store;

pub use models::{
    format_grant_list, parse_grant_list, stage_active, stage_expiry, Client, CreateTokenParams,
    GrantType, Token, UnknownGrantType, User,
};
pub use store::{CredentialStore, StoreResult, UserDirectory};
