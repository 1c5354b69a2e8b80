//! Environment variable utilities
//!
//! Generic `env_get<T>` function for parsing environment variables with defaults.
//! Used by the configuration layer for `CSAFE_*` overrides.
//!
//! # Usage
//!
//! ```ignore
//! use csafe_core::env::{env_get, env_get_opt};
//!
//! let max: usize = env_get("CSAFE_MAX_CONNECTIONS", 10);
//! let method: Option<String> = env_get_opt("CSAFE_EVENT_METHOD");
//! ```

use std::str::FromStr;

/// Get environment variable parsed as type T, or return default
#[inline]
pub fn env_get<T>(key: &str, default: T) -> T
where
    T: FromStr,
{
    env_get_opt(key).unwrap_or(default)
}

/// Get environment variable as optional value
///
/// Returns `Some(T)` if the variable is set and parses successfully,
/// `None` otherwise.
#[inline]
pub fn env_get_opt<T>(key: &str) -> Option<T>
where
    T: FromStr,
{
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

/// Get environment variable as boolean
///
/// Accepts: "1", "true", "yes", "on" (case-insensitive) as true.
/// Everything else (including unset) returns the default.
#[inline]
pub fn env_get_bool(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(val) => matches!(val.to_lowercase().as_str(), "1" | "true" | "yes" | "on"),
        Err(_) => default,
    }
}
