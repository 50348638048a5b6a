// Internal error types shared by stores and the engine.
//
// Store errors never cross the engine boundary as-is: the engine maps
// `NotFound` onto a protocol error kind and downgrades everything else to a
// generic server error after logging it.

/// Failure of a credential store or user directory call.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("record not found")]
    NotFound,

    #[error("client {0} does not exist")]
    ClientNotFound(String),

    #[error("unique constraint violated on {0}")]
    Conflict(String),

    #[error("store call timed out")]
    Timeout,

    #[error("store call cancelled")]
    Cancelled,

    #[error("backend error: {0}")]
    Backend(String),
}

impl StoreError {
    pub fn backend(err: impl std::fmt::Display) -> Self {
        Self::Backend(err.to_string())
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound)
    }

    /// Timeout and cancellation are caller-driven, not backend faults.
    pub fn is_interrupted(&self) -> bool {
        matches!(self, Self::Timeout | Self::Cancelled)
    }
}

/// Configuration problems detected while loading settings.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("missing required setting {0}")]
    Missing(String),

    #[error("invalid value for {key}: {reason}")]
    Invalid { key: String, reason: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_is_distinguishable() {
        assert!(StoreError::NotFound.is_not_found());
        assert!(!StoreError::backend("connection reset").is_not_found());
    }

    #[test]
    fn test_interrupted_kinds() {
        assert!(StoreError::Timeout.is_interrupted());
        assert!(StoreError::Cancelled.is_interrupted());
        assert!(!StoreError::Conflict("tokens.code".into()).is_interrupted());
    }

    #[test]
    fn test_display() {
        assert_eq!(
            StoreError::ClientNotFound("c1".into()).to_string(),
            "client c1 does not exist"
        );
    }
}
