//! Small env-var parsing helpers shared by the config structs.

use std::str::FromStr;

use crate::error::ConfigError;

/// Read an env var, treating unset and empty as `None`.
pub(crate) fn optional_env(key: &str) -> Option<String> {
    match std::env::var(key) {
        Ok(v) if !v.trim().is_empty() => Some(v.trim().to_string()),
        _ => None,
    }
}

/// Parse a boolean env var. Accepts `true/false`, `1/0`, `yes/no`
/// (case-insensitive); unset falls back to `default`.
pub(crate) fn parse_bool_env(key: &str, default: bool) -> Result<bool, ConfigError> {
    let Some(raw) = optional_env(key) else {
        return Ok(default);
    };
    match raw.to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" => Ok(true),
        "false" | "0" | "no" => Ok(false),
        _ => Err(ConfigError::Invalid {
            key: key.to_string(),
            message: format!("expected a boolean, got {raw:?}"),
        }),
    }
}

/// Parse a numeric env var, falling back to `default` when unset.
pub(crate) fn parse_num_env<T>(key: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    let Some(raw) = optional_env(key) else {
        return Ok(default);
    };
    raw.parse().map_err(|e| ConfigError::Invalid {
        key: key.to_string(),
        message: format!("{e}"),
    })
}

/// Read a string env var with a default.
pub(crate) fn parse_string_env(key: &str, default: &str) -> String {
    optional_env(key).unwrap_or_else(|| default.to_string())
}
