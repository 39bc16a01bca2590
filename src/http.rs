use crate::config::parse_var;
use reqwest::Client;
use std::time::Duration;

/// Shared client settings for outbound collaborator calls.
pub fn build_client() -> Client {
    let timeout = parse_var::<u64>("HTTP_TIMEOUT_SECS").unwrap_or(15);
    let connect = parse_var::<u64>("HTTP_CONNECT_TIMEOUT_SECS").unwrap_or(5);
    Client::builder()
        .user_agent(concat!("listing-wizard/", env!("CARGO_PKG_VERSION")))
        .timeout(Duration::from_secs(timeout))
        .connect_timeout(Duration::from_secs(connect))
        .build()
        .unwrap_or_else(|_| Client::new())
}
