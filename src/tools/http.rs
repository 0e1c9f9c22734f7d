//! `fetch_url`: read a public web page so the persona can quote or summarize it.
//!
//! GET only. Localhost and private destinations are blocked, the request has a
//! timeout, and the captured body is truncated.

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Url;
use serde_json::{json, Value};
use std::cmp::min;
use std::net::IpAddr;
use std::time::Duration;

use crate::http_client::build_http_client_with_timeout;

use super::{Tool, ToolCategory, ToolContext, ToolOutput};

const DEFAULT_MAX_RESPONSE_BYTES: usize = 64 * 1024;
const MAX_MAX_RESPONSE_BYTES: usize = 256 * 1024;

pub struct FetchUrlTool {
    client: reqwest::Client,
    timeout: Duration,
}

impl FetchUrlTool {
    pub fn new(timeout: Duration) -> Self {
        Self {
            client: build_http_client_with_timeout(Some(timeout)),
            timeout,
        }
    }
}

#[async_trait]
impl Tool for FetchUrlTool {
    fn name(&self) -> &str {
        "fetch_url"
    }

    fn description(&self) -> &str {
        "Fetch a public http(s) URL and return its status, content type and a truncated body."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "url": {
                    "type": "string",
                    "description": "Target URL to fetch"
                },
                "max_response_bytes": {
                    "type": "integer",
                    "description": "Maximum response bytes captured (default 65536, max 262144)"
                }
            },
            "required": ["url"]
        })
    }

    async fn execute(&self, params: Value, _ctx: &ToolContext) -> Result<ToolOutput> {
        let url_input = match params.get("url").and_then(Value::as_str).map(str::trim) {
            Some(v) if !v.is_empty() => v,
            _ => {
                return Ok(ToolOutput::Error(
                    "Missing required 'url' parameter".to_string(),
                ))
            }
        };

        let url = match Url::parse(url_input) {
            Ok(url) => url,
            Err(e) => {
                return Ok(ToolOutput::Error(format!(
                    "Invalid URL '{}': {}",
                    url_input, e
                )))
            }
        };
        if !matches!(url.scheme(), "http" | "https") {
            return Ok(ToolOutput::Error(
                "Only http:// and https:// URLs are supported".to_string(),
            ));
        }

        let max_response_bytes = params
            .get("max_response_bytes")
            .and_then(Value::as_u64)
            .map(|v| v as usize)
            .unwrap_or(DEFAULT_MAX_RESPONSE_BYTES)
            .clamp(1, MAX_MAX_RESPONSE_BYTES);

        if let Err(reason) = validate_destination(&url).await {
            return Ok(ToolOutput::Error(reason));
        }

        let mut response = match self.client.get(url.clone()).send().await {
            Ok(resp) => resp,
            Err(e) if e.is_timeout() => {
                return Ok(ToolOutput::Error(format!(
                    "Request timed out after {}s",
                    self.timeout.as_secs()
                )))
            }
            Err(e) => return Ok(ToolOutput::Error(format!("HTTP request failed: {}", e))),
        };

        let status = response.status();
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("application/octet-stream")
            .to_string();

        let mut body_bytes: Vec<u8> = Vec::new();
        let mut truncated = false;
        while let Some(chunk) = response
            .chunk()
            .await
            .context("Failed reading response body")?
        {
            let remaining = max_response_bytes - body_bytes.len();
            let take = min(remaining, chunk.len());
            body_bytes.extend_from_slice(&chunk[..take]);
            if take < chunk.len() {
                truncated = true;
                break;
            }
        }

        Ok(ToolOutput::Json(json!({
            "url": url.as_str(),
            "status_code": status.as_u16(),
            "content_type": content_type,
            "body": String::from_utf8_lossy(&body_bytes),
            "body_truncated": truncated,
        })))
    }

    fn category(&self) -> ToolCategory {
        ToolCategory::Network
    }
}

async fn validate_destination(url: &Url) -> std::result::Result<(), String> {
    let host = url
        .host_str()
        .ok_or_else(|| "URL is missing a host".to_string())?;
    let host_lower = host.to_ascii_lowercase();
    if host_lower == "localhost"
        || host_lower.ends_with(".localhost")
        || host_lower.ends_with(".local")
    {
        return Err(format!("Blocked local/private host '{}'", host));
    }

    let bare_host = host.trim_start_matches('[').trim_end_matches(']');
    if let Ok(ip) = bare_host.parse::<IpAddr>() {
        if is_private_or_local_ip(ip) {
            return Err(format!("Blocked private/local IP destination '{}'", host));
        }
        return Ok(());
    }

    let port = url.port_or_known_default().unwrap_or(80);
    match tokio::net::lookup_host((host, port)).await {
        Ok(resolved) => {
            for addr in resolved {
                if is_private_or_local_ip(addr.ip()) {
                    return Err(format!(
                        "Blocked destination '{}' resolved to private/local address {}",
                        host,
                        addr.ip()
                    ));
                }
            }
            Ok(())
        }
        Err(e) => {
            tracing::warn!("Could not pre-resolve host '{}': {}", host, e);
            Ok(())
        }
    }
}

fn is_private_or_local_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            v4.is_private()
                || v4.is_loopback()
                || v4.is_link_local()
                || v4.is_broadcast()
                || v4.is_documentation()
                || v4.is_unspecified()
                || v4.is_multicast()
        }
        IpAddr::V6(v6) => {
            v6.is_loopback()
                || v6.is_unspecified()
                || v6.is_multicast()
                || (v6.segments()[0] & 0xfe00) == 0xfc00
                || (v6.segments()[0] & 0xffc0) == 0xfe80
        }
    }
}
