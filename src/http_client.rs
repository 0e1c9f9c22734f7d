use std::time::Duration;

pub fn build_http_client() -> reqwest::Client {
    build_http_client_with_timeout(None)
}

/// System proxy discovery is opt-in (`PERSONA_ENABLE_SYSTEM_PROXY=1`); by
/// default clients are built with `no_proxy`.
pub fn build_http_client_with_timeout(timeout: Option<Duration>) -> reqwest::Client {
    let allow_system_proxy = std::env::var("PERSONA_ENABLE_SYSTEM_PROXY")
        .map(|value| value == "1" || value.eq_ignore_ascii_case("true"))
        .unwrap_or(false);

    if allow_system_proxy {
        match attempt_build(timeout, false) {
            Ok(client) => return client,
            Err(e) => tracing::warn!(
                "HTTP client initialization with system proxy failed ({}); retrying with no_proxy",
                e
            ),
        }
    }

    attempt_build(timeout, true).unwrap_or_else(|e| {
        tracing::error!("Failed to build configured HTTP client, using defaults: {}", e);
        reqwest::Client::new()
    })
}

fn attempt_build(
    timeout: Option<Duration>,
    no_proxy: bool,
) -> Result<reqwest::Client, reqwest::Error> {
    let mut builder = reqwest::Client::builder();
    if let Some(timeout) = timeout {
        builder = builder.timeout(timeout);
    }
    if no_proxy {
        builder = builder.no_proxy();
    }
    builder.build()
}
