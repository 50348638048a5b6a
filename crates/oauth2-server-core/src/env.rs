// Environment detection, typed variable lookup and logger configuration.

use std::str::FromStr;
use std::sync::OnceLock;

use crate::error::ConfigError;

/// Cached environment mode.
static ENV_MODE: OnceLock<EnvMode> = OnceLock::new();

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnvMode {
    Production,
    Development,
    Test,
}

impl EnvMode {
    fn from_value(value: &str) -> Self {
        match value.to_lowercase().as_str() {
            "production" | "prod" => EnvMode::Production,
            "test" | "testing" => EnvMode::Test,
            _ => EnvMode::Development,
        }
    }
}

/// Detect the current environment mode.
/// Checks `OAUTH_ENV` then `RUST_ENV`.
pub fn detect_env_mode() -> EnvMode {
    *ENV_MODE.get_or_init(|| {
        let env_val = std::env::var("OAUTH_ENV")
            .or_else(|_| std::env::var("RUST_ENV"))
            .unwrap_or_default();
        EnvMode::from_value(&env_val)
    })
}

pub fn is_production() -> bool {
    detect_env_mode() == EnvMode::Production
}

/// Read a variable, treating an empty value as unset.
pub fn get_string(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

/// Parse a variable into `T`, returning `Ok(None)` when unset.
pub fn get_parsed<T>(key: &str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match get_string(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| ConfigError::Invalid {
                key: key.to_string(),
                reason: e.to_string(),
            }),
    }
}

/// Accepts `1/0`, `true/false`, `yes/no`, `on/off`.
pub fn get_bool(key: &str) -> Result<Option<bool>, ConfigError> {
    match get_string(key) {
        None => Ok(None),
        Some(raw) => parse_bool(&raw).map(Some).ok_or_else(|| ConfigError::Invalid {
            key: key.to_string(),
            reason: format!("expected a boolean, got {raw:?}"),
        }),
    }
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn default_filter() -> tracing_subscriber::EnvFilter {
    use tracing_subscriber::EnvFilter;

    EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if is_production() {
            EnvFilter::new("oauth2_server=info,oauth2_server_sqlx=info")
        } else {
            EnvFilter::new("oauth2_server=debug,oauth2_server_sqlx=debug,oauth2_server_memory=debug")
        }
    })
}

/// Initialize the `tracing` subscriber with appropriate defaults.
/// In production, uses JSON format. In development, uses the compact text format.
///
/// Panics if a global subscriber is already installed; use
/// [`try_init_logger`] when that is possible.
pub fn init_logger() {
    if let Err(e) = try_init_logger() {
        panic!("failed to install tracing subscriber: {e}");
    }
}

pub fn try_init_logger() -> anyhow::Result<()> {
    let builder = tracing_subscriber::fmt()
        .with_env_filter(default_filter())
        .with_target(true)
        .with_thread_ids(false);

    if is_production() {
        builder
            .json()
            .try_init()
            .map_err(|e| anyhow::anyhow!(e))
    } else {
        builder.try_init().map_err(|e| anyhow::anyhow!(e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_mode_from_value() {
        assert_eq!(EnvMode::from_value("PROD"), EnvMode::Production);
        assert_eq!(EnvMode::from_value("testing"), EnvMode::Test);
        assert_eq!(EnvMode::from_value(""), EnvMode::Development);
    }

    #[test]
    fn test_parse_bool() {
        assert_eq!(parse_bool(" Yes "), Some(true));
        assert_eq!(parse_bool("off"), Some(false));
        assert_eq!(parse_bool("maybe"), None);
    }

    #[test]
    fn test_get_parsed_rejects_garbage() {
        std::env::set_var("OAUTH2_CORE_TEST_TTL", "ten");
        let err = get_parsed::<u64>("OAUTH2_CORE_TEST_TTL").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { .. }));
        std::env::remove_var("OAUTH2_CORE_TEST_TTL");
    }

    #[test]
    fn test_unset_and_blank_are_none() {
        std::env::set_var("OAUTH2_CORE_TEST_BLANK", "  ");
        assert_eq!(get_string("OAUTH2_CORE_TEST_BLANK"), None);
        assert_eq!(get_parsed::<u64>("OAUTH2_CORE_TEST_UNSET").unwrap(), None);
        std::env::remove_var("OAUTH2_CORE_TEST_BLANK");
    }
}
