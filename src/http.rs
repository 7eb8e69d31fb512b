use reqwest::Client;
use std::time::Duration;

/// Shared outbound client. Every collaborator gets its own timeout budget:
/// media downloads run long, replies must stay short.
pub fn build_client(timeout: Duration, connect_timeout: Duration) -> Client {
    Client::builder()
        .timeout(timeout)
        .connect_timeout(connect_timeout)
        .build()
        .unwrap_or_else(|_| Client::new())
}
