// Decision hooks: observers invoked around every policy decision.
//
// The engine calls `run_before` and `run_after` around each grant
// authorization handler. Hooks observe; they cannot alter or veto a decision.
// Payloads never contain secrets, passwords or token values.

use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;

/// The policy juncture being decided.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DecisionEvent {
    /// Is the client allowed this grant type.
    ClientAuthorized,
    /// Is the requested scope inside the client's ceiling.
    ClientScope,
    /// Server-wide ceiling for a grant's requested scope.
    AuthorizeScope,
    /// Refresh must not widen scope.
    RefreshingScope,
    /// Resource-owner credential check.
    PasswordAuthorization,
    /// Projection of extra token response fields.
    ExtensionFields,
}

impl DecisionEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ClientAuthorized => "client_authorized",
            Self::ClientScope => "client_scope",
            Self::AuthorizeScope => "authorize_scope",
            Self::RefreshingScope => "refreshing_scope",
            Self::PasswordAuthorization => "password_authorization",
            Self::ExtensionFields => "extension_fields",
        }
    }
}

/// What the handler was asked.
#[derive(Debug, Clone)]
pub struct DecisionRecord {
    pub event: DecisionEvent,
    pub client_id: Option<String>,
    /// Event-specific inputs (grant type, scopes, username).
    pub input: Value,
}

impl DecisionRecord {
    pub fn new(event: DecisionEvent, client_id: Option<&str>, input: Value) -> Self {
        Self {
            event,
            client_id: client_id.map(str::to_string),
            input,
        }
    }
}

/// What the handler answered.
#[derive(Debug, Clone, PartialEq)]
pub enum DecisionOutcome {
    /// Allowed, optionally with the value the handler produced.
    Allowed(Option<Value>),
    /// Denied with the protocol error code.
    Denied(String),
}

impl DecisionOutcome {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allowed(_))
    }
}

#[async_trait]
pub trait DecisionHook: Send + Sync {
    async fn before(&self, _record: &DecisionRecord) {}

    async fn after(&self, _record: &DecisionRecord, _outcome: &DecisionOutcome) {}
}

/// Ordered list of hooks, optionally scoped to a single event.
#[derive(Clone, Default)]
pub struct HookRegistry {
    hooks: Vec<(Option<DecisionEvent>, Arc<dyn DecisionHook>)>,
}

impl std::fmt::Debug for HookRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HookRegistry")
            .field("hook_count", &self.hooks.len())
            .finish()
    }
}

impl HookRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a hook for every decision.
    pub fn register(&mut self, hook: Arc<dyn DecisionHook>) {
        self.hooks.push((None, hook));
    }

    /// Register a hook for one kind of decision.
    pub fn register_for(&mut self, event: DecisionEvent, hook: Arc<dyn DecisionHook>) {
        self.hooks.push((Some(event), hook));
    }

    fn matching(&self, event: DecisionEvent) -> impl Iterator<Item = &Arc<dyn DecisionHook>> {
        self.hooks
            .iter()
            .filter(move |(scope, _)| scope.map_or(true, |e| e == event))
            .map(|(_, hook)| hook)
    }

    pub async fn run_before(&self, record: &DecisionRecord) {
        for hook in self.matching(record.event) {
            hook.before(record).await;
        }
    }

    pub async fn run_after(&self, record: &DecisionRecord, outcome: &DecisionOutcome) {
        for hook in self.matching(record.event) {
            hook.after(record, outcome).await;
        }
    }

    pub fn is_empty(&self) -> bool {
        self.hooks.is_empty()
    }

    pub fn len(&self) -> usize {
        self.hooks.len()
    }
}
