//! Shared utility functions used across the codebase.

use std::str::FromStr;
use std::time::Duration;

use crate::config::ConfigError;

/// Parse an environment variable as a boolean, returning `default` if unset.
///
/// Recognises `1`, `true`, `yes`, `y`, `on` (case-insensitive) as `true`;
/// everything else maps to `false`.
pub fn env_var_bool(name: &str, default: bool) -> bool {
    match std::env::var(name) {
        Ok(value) => matches!(
            value.trim().to_lowercase().as_str(),
            "1" | "true" | "yes" | "y" | "on"
        ),
        Err(_) => default,
    }
}

/// Parse an environment variable with `FromStr`, falling back to `default` if unset.
///
/// A value that is set but does not parse is reported as `ConfigError::InvalidValue`
/// rather than silently replaced by the default.
pub fn env_var_parse<T>(name: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .map_err(|e: T::Err| ConfigError::InvalidValue(name.to_string(), e.to_string())),
        _ => Ok(default),
    }
}

/// Read a duration expressed in whole seconds.
pub fn env_var_secs(name: &str, default: Duration) -> Result<Duration, ConfigError> {
    env_var_parse(name, default.as_secs()).map(Duration::from_secs)
}

/// Read a duration expressed in milliseconds.
pub fn env_var_millis(name: &str, default: Duration) -> Result<Duration, ConfigError> {
    env_var_parse(name, default.as_millis() as u64).map(Duration::from_millis)
}

/// Shorten a string for log output, respecting char boundaries.
pub fn truncate_for_log(value: &str, max_chars: usize) -> String {
    if value.chars().count() <= max_chars {
        return value.to_string();
    }
    let mut out: String = value.chars().take(max_chars).collect();
    out.push('…');
    out
}

/// Convert a `chrono` span into a `std` duration, clamping negatives to zero.
pub fn elapsed_std(span: chrono::Duration) -> Duration {
    span.to_std().unwrap_or(Duration::ZERO)
}
