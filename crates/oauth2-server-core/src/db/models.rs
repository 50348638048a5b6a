// Persisted records: registered clients, token lineages and resource owners.
//
// A `Token` row carries up to three credential stages (code, access, refresh).
// Each stage stores its creation instant and lifetime separately; expiry is
// always derived as `created_at + expires_in`.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// The four protocol flows a client can be allowed to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GrantType {
    AuthorizationCode,
    Password,
    ClientCredentials,
    RefreshToken,
}

impl GrantType {
    pub const ALL: [GrantType; 4] = [
        GrantType::AuthorizationCode,
        GrantType::Password,
        GrantType::ClientCredentials,
        GrantType::RefreshToken,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AuthorizationCode => "authorization_code",
            Self::Password => "password",
            Self::ClientCredentials => "client_credentials",
            Self::RefreshToken => "refresh_token",
        }
    }
}

impl fmt::Display for GrantType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Returned when a grant-type tag is not one of the four supported flows.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unsupported grant type: {0}")]
pub struct UnknownGrantType(pub String);

impl FromStr for GrantType {
    type Err = UnknownGrantType;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "authorization_code" => Ok(Self::AuthorizationCode),
            "password" => Ok(Self::Password),
            "client_credentials" => Ok(Self::ClientCredentials),
            "refresh_token" => Ok(Self::RefreshToken),
            other => Err(UnknownGrantType(other.to_string())),
        }
    }
}

/// Parse a space-delimited list of grant tags, ignoring blanks.
pub fn parse_grant_list(raw: &str) -> Result<BTreeSet<GrantType>, UnknownGrantType> {
    raw.split_whitespace().map(GrantType::from_str).collect()
}

/// Render a grant set in the space-delimited form used for storage.
pub fn format_grant_list(grants: &BTreeSet<GrantType>) -> String {
    grants
        .iter()
        .map(GrantType::as_str)
        .collect::<Vec<_>>()
        .join(" ")
}

/// A registered OAuth client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Client {
    pub id: String,
    /// Irreversible hash of the client secret. Empty for public clients.
    #[serde(skip_serializing, default)]
    pub secret_hash: Vec<u8>,
    /// Base URI that every redirect URI must live under.
    pub domain: String,
    pub is_public: bool,
    pub owner_user_id: Option<Uuid>,
    pub allowed_grants: BTreeSet<GrantType>,
    /// Ceiling scope: nothing issued to this client may exceed it.
    pub scope: String,
    pub created_at: DateTime<Utc>,
}

impl Client {
    pub fn allows_grant(&self, grant: GrantType) -> bool {
        self.allowed_grants.contains(&grant)
    }

    /// Public clients can neither hold a secret nor use `client_credentials`.
    pub fn check_invariants(&self) -> Result<(), String> {
        if self.is_public && self.allows_grant(GrantType::ClientCredentials) {
            return Err(format!(
                "public client {} cannot be allowed the client_credentials grant",
                self.id
            ));
        }
        if self.is_public && !self.secret_hash.is_empty() {
            return Err(format!("public client {} cannot hold a secret", self.id));
        }
        Ok(())
    }
}

/// One credential lineage at a point in time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Token {
    pub id: Uuid,
    pub client_id: String,
    /// Absent for `client_credentials` lineages.
    pub user_id: Option<Uuid>,
    pub redirect_uri: String,
    pub scope: String,

    pub code: Option<String>,
    pub code_created_at: Option<DateTime<Utc>>,
    pub code_expires_in: i64,
    pub code_challenge: Option<String>,
    pub code_challenge_method: Option<String>,

    pub access: Option<String>,
    pub access_created_at: Option<DateTime<Utc>>,
    pub access_expires_in: i64,

    pub refresh: Option<String>,
    pub refresh_created_at: Option<DateTime<Utc>>,
    pub refresh_expires_in: i64,

    pub created_at: DateTime<Utc>,
}

/// `created_at + expires_in` for one stage, if the stage is populated.
pub fn stage_expiry(created_at: Option<DateTime<Utc>>, expires_in: i64) -> Option<DateTime<Utc>> {
    created_at.and_then(|at| at.checked_add_signed(Duration::try_seconds(expires_in)?))
}

/// A stage is active iff it is populated and `now < created_at + expires_in`.
pub fn stage_active(created_at: Option<DateTime<Utc>>, expires_in: i64, now: DateTime<Utc>) -> bool {
    stage_expiry(created_at, expires_in).map_or(false, |exp| now < exp)
}

impl Token {
    pub fn code_expires_at(&self) -> Option<DateTime<Utc>> {
        self.code.as_ref()?;
        stage_expiry(self.code_created_at, self.code_expires_in)
    }

    pub fn access_expires_at(&self) -> Option<DateTime<Utc>> {
        self.access.as_ref()?;
        stage_expiry(self.access_created_at, self.access_expires_in)
    }

    pub fn refresh_expires_at(&self) -> Option<DateTime<Utc>> {
        self.refresh.as_ref()?;
        stage_expiry(self.refresh_created_at, self.refresh_expires_in)
    }

    pub fn is_code_active(&self, now: DateTime<Utc>) -> bool {
        self.code_expires_at().map_or(false, |exp| now < exp)
    }

    pub fn is_access_active(&self, now: DateTime<Utc>) -> bool {
        self.access_expires_at().map_or(false, |exp| now < exp)
    }

    pub fn is_refresh_active(&self, now: DateTime<Utc>) -> bool {
        self.refresh_expires_at().map_or(false, |exp| now < exp)
    }

    /// Sweep predicate: every populated stage has elapsed.
    ///
    /// A row with no populated stage carries no credential and counts as expired.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        !(self.is_code_active(now) || self.is_access_active(now) || self.is_refresh_active(now))
    }
}

/// Input for creating a token row. The store assigns the row id.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CreateTokenParams {
    pub client_id: String,
    pub user_id: Option<Uuid>,
    pub redirect_uri: String,
    pub scope: String,

    pub code: Option<String>,
    pub code_created_at: Option<DateTime<Utc>>,
    pub code_expires_in: i64,
    pub code_challenge: Option<String>,
    pub code_challenge_method: Option<String>,

    pub access: Option<String>,
    pub access_created_at: Option<DateTime<Utc>>,
    pub access_expires_in: i64,

    pub refresh: Option<String>,
    pub refresh_created_at: Option<DateTime<Utc>>,
    pub refresh_expires_in: i64,
}

impl CreateTokenParams {
    pub fn new(client_id: impl Into<String>, scope: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            scope: scope.into(),
            ..Default::default()
        }
    }

    pub fn user(mut self, user_id: Option<Uuid>) -> Self {
        self.user_id = user_id;
        self
    }

    pub fn redirect_uri(mut self, redirect_uri: impl Into<String>) -> Self {
        self.redirect_uri = redirect_uri.into();
        self
    }

    pub fn code(mut self, code: impl Into<String>, created_at: DateTime<Utc>, expires_in: i64) -> Self {
        self.code = Some(code.into());
        self.code_created_at = Some(created_at);
        self.code_expires_in = expires_in;
        self
    }

    pub fn challenge(mut self, challenge: Option<String>, method: Option<String>) -> Self {
        self.code_challenge = challenge;
        self.code_challenge_method = method;
        self
    }

    pub fn access(mut self, access: impl Into<String>, created_at: DateTime<Utc>, expires_in: i64) -> Self {
        self.access = Some(access.into());
        self.access_created_at = Some(created_at);
        self.access_expires_in = expires_in;
        self
    }

    pub fn refresh(mut self, refresh: impl Into<String>, created_at: DateTime<Utc>, expires_in: i64) -> Self {
        self.refresh = Some(refresh.into());
        self.refresh_created_at = Some(created_at);
        self.refresh_expires_in = expires_in;
        self
    }

    /// Materialize the row a store persists for these params.
    pub fn into_token(self, id: Uuid, created_at: DateTime<Utc>) -> Token {
        Token {
            id,
            client_id: self.client_id,
            user_id: self.user_id,
            redirect_uri: self.redirect_uri,
            scope: self.scope,
            code: self.code,
            code_created_at: self.code_created_at,
            code_expires_in: self.code_expires_in,
            code_challenge: self.code_challenge,
            code_challenge_method: self.code_challenge_method,
            access: self.access,
            access_created_at: self.access_created_at,
            access_expires_in: self.access_expires_in,
            refresh: self.refresh,
            refresh_created_at: self.refresh_created_at,
            refresh_expires_in: self.refresh_expires_in,
            created_at,
        }
    }
}

/// A resource owner able to use the password grant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: Uuid,
    pub email: String,
    /// scrypt hash in `hex(salt):hex(key)` form.
    #[serde(skip_serializing, default)]
    pub password_hash: String,
    pub created_at: DateTime<Utc>,
    pub verified_at: Option<DateTime<Utc>>,
}

impl User {
    pub fn new(email: impl Into<String>, password_hash: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            email: email.into().to_lowercase(),
            password_hash: password_hash.into(),
            created_at: Utc::now(),
            verified_at: None,
        }
    }
}
