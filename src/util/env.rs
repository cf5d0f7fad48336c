//! Environment helpers: dotenv loaded once, plus typed getters.
use std::str::FromStr;
use std::sync::Once;

static INIT: Once = Once::new();

/// Loads `.env` exactly once; safe to call repeatedly.
pub fn init_env() {
    INIT.call_once(|| {
        let _ = dotenv::dotenv();
    });
}

/// Required variable; errors when unset or blank.
pub fn env_req(key: &str) -> anyhow::Result<String> {
    env_opt(key).ok_or_else(|| anyhow::anyhow!("missing env var {key}"))
}

/// Optional variable (None if unset or empty).
pub fn env_opt(key: &str) -> Option<String> {
    init_env();
    match std::env::var(key) {
        Ok(v) if !v.trim().is_empty() => Some(v),
        _ => None,
    }
}

/// Parsed value, falling back to `default` when unset or unparsable.
pub fn env_parse<T>(key: &str, default: T) -> T
where
    T: FromStr,
{
    init_env();
    match std::env::var(key) {
        Ok(raw) => raw.trim().parse::<T>().unwrap_or(default),
        Err(_) => default,
    }
}

/// Boolean flag; accepts 1/true/on/yes (case-insensitive) as true.
pub fn env_flag(key: &str, default: bool) -> bool {
    init_env();
    match std::env::var(key) {
        Ok(raw) => {
            let v = raw.trim().to_ascii_lowercase();
            matches!(v.as_str(), "1" | "true" | "on" | "yes")
        }
        Err(_) => default,
    }
}
