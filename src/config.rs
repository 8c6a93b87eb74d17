//! Environment lookups shared by adapter construction and request normalization.
//!
//! Every helper takes the getter as a parameter so callers can resolve values
//! from something other than the process environment (tests pass a closure over
//! a fixed table).

use std::time::Duration;

/// Reads from the process environment.
pub fn process_env(key: &str) -> Option<String> {
    std::env::var(key).ok()
}

/// Trimmed value of `key`, or `None` when unset or blank.
pub fn string<F>(get: F, key: &str) -> Option<String>
where
    F: Fn(&str) -> Option<String>,
{
    get(key)
        .map(|value| value.trim().to_owned())
        .filter(|value| !value.is_empty())
}

pub fn string_or<F>(get: F, key: &str, default: &str) -> String
where
    F: Fn(&str) -> Option<String>,
{
    string(get, key).unwrap_or_else(|| default.to_owned())
}

pub fn bool_or<F>(get: F, key: &str, default: bool) -> bool
where
    F: Fn(&str) -> Option<String>,
{
    let Some(raw) = string(get, key) else {
        return default;
    };
    match raw.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "y" | "on" => true,
        "0" | "false" | "no" | "n" | "off" => false,
        _ => default,
    }
}

/// Whole seconds; zero and unparsable values fall back to `default`.
pub fn secs_or<F>(get: F, key: &str, default: Duration) -> Duration
where
    F: Fn(&str) -> Option<String>,
{
    string(get, key)
        .and_then(|raw| raw.parse::<u64>().ok())
        .filter(|secs| *secs > 0)
        .map(Duration::from_secs)
        .unwrap_or(default)
}
