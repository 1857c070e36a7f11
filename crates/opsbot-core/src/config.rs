//! Environment variable helpers shared by subsystem configs.
//!
//! Every config in the workspace loads through a reader closure so tests can
//! supply variables without mutating process-global environment state.

use std::env::VarError;
use std::fmt::Display;
use std::str::FromStr;

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("missing required environment variable: {0}")]
    MissingVar(String),

    #[error("invalid value for {0}: {1}")]
    InvalidValue(String, String),
}

/// Reader backed by the process environment.
pub fn env_reader() -> impl Fn(&str) -> Result<String, VarError> {
    |key: &str| std::env::var(key)
}

/// Parse `key` with `FromStr`, falling back to `default` when unset.
///
/// A present but unparseable value is an error rather than a silent default.
pub fn parse_or<F, T>(reader: &F, key: &str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Result<String, VarError>,
    T: FromStr,
    T::Err: Display,
{
    match reader(key) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map_err(|e| ConfigError::InvalidValue(key.to_string(), e.to_string())),
        Err(_) => Ok(default),
    }
}

/// Parse a boolean flag. Accepts `true/false`, `1/0`, `yes/no`, `on/off`.
pub fn parse_bool_or<F>(reader: &F, key: &str, default: bool) -> Result<bool, ConfigError>
where
    F: Fn(&str) -> Result<String, VarError>,
{
    let Ok(raw) = reader(key) else {
        return Ok(default);
    };
    match raw.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        other => Err(ConfigError::InvalidValue(
            key.to_string(),
            format!("expected a boolean, got '{other}'"),
        )),
    }
}

/// Parse a comma separated list. Blank entries are dropped; unset yields empty.
pub fn parse_list<F>(reader: &F, key: &str) -> Vec<String>
where
    F: Fn(&str) -> Result<String, VarError>,
{
    reader(key)
        .map(|raw| {
            raw.split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}
