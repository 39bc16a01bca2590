use once_cell::sync::Lazy;
use std::env;

pub static CATALOG_PATH: Lazy<Option<String>> = Lazy::new(|| non_empty_var("CATALOG_PATH"));

pub static MARKETPLACE_SUBMIT_URL: Lazy<Option<String>> =
    Lazy::new(|| non_empty_var("MARKETPLACE_SUBMIT_URL"));

pub static MARKETPLACE_API_KEY: Lazy<Option<String>> =
    Lazy::new(|| non_empty_var("MARKETPLACE_API_KEY"));

/// Simulated latency of the demo asset library per upload.
pub static DEMO_UPLOAD_LATENCY_MS: Lazy<u64> =
    Lazy::new(|| parse_var("DEMO_UPLOAD_LATENCY_MS").unwrap_or(400));

pub fn port() -> u16 {
    parse_var("PORT").unwrap_or(8000)
}

pub fn body_limit() -> usize {
    parse_var::<usize>("REQUEST_MAX_BYTES")
        .filter(|v| *v > 0)
        .unwrap_or(256 * 1024)
}

pub fn idempotency_ttl_secs() -> u64 {
    parse_var("IDEMPOTENCY_TTL_SECS").unwrap_or(3600)
}

fn non_empty_var(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

pub fn parse_var<T: std::str::FromStr>(key: &str) -> Option<T> {
    env::var(key).ok().and_then(|v| v.trim().parse::<T>().ok())
}
