//! `fetch_url`: read-only web fetch exposed to the model.
//!
//! GET only, blocks localhost/private destinations, refuses URLs carrying secrets,
//! enforces a timeout, and hands back page text rather than raw HTML.

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Url;
use serde_json::{json, Value};
use std::net::IpAddr;
use std::sync::OnceLock;
use std::time::Duration;

use crate::tags::{regex, Pattern};

use super::safety::{check_output, detect_leaks, SafetyVerdict};
use super::{Tool, ToolCategory, ToolContext, ToolOutput};

const DEFAULT_TIMEOUT_SECS: u64 = 20;
const MAX_TIMEOUT_SECS: u64 = 30;
const DEFAULT_MAX_CHARS: usize = 8_000;
const MAX_MAX_CHARS: usize = 40_000;
const MAX_BODY_BYTES: usize = 512 * 1024;

pub struct FetchUrlTool {
    client: reqwest::Client,
    allow_private_hosts: bool,
}

impl FetchUrlTool {
    pub fn new(client: reqwest::Client) -> Self {
        Self {
            client,
            allow_private_hosts: false,
        }
    }
}

#[async_trait]
impl Tool for FetchUrlTool {
    fn name(&self) -> &str {
        "fetch_url"
    }

    fn description(&self) -> &str {
        "Fetch a public web page over HTTP(S) and return its readable text."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "url": {
                    "type": "string",
                    "description": "Absolute http:// or https:// URL"
                },
                "max_chars": {
                    "type": "integer",
                    "description": "Maximum characters of text returned (default 8000)"
                },
                "timeout_secs": {
                    "type": "integer",
                    "description": "Request timeout in seconds (default 20, max 30)"
                }
            },
            "required": ["url"]
        })
    }

    async fn execute(&self, params: Value, ctx: &ToolContext) -> Result<ToolOutput> {
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
        if let SafetyVerdict::Block(reason) = detect_leaks(url.as_str()) {
            return Ok(ToolOutput::Error(format!("Outbound URL blocked: {}", reason)));
        }
        if let Err(reason) = validate_destination(&url, self.allow_private_hosts).await {
            return Ok(ToolOutput::Error(reason));
        }

        let timeout_secs = params
            .get("timeout_secs")
            .and_then(Value::as_u64)
            .unwrap_or(DEFAULT_TIMEOUT_SECS)
            .clamp(1, MAX_TIMEOUT_SECS);
        let max_chars = params
            .get("max_chars")
            .and_then(Value::as_u64)
            .map(|v| v as usize)
            .unwrap_or(DEFAULT_MAX_CHARS)
            .clamp(100, MAX_MAX_CHARS);

        tracing::debug!(
            "fetch_url for user {} in discussion {}: {}",
            ctx.username,
            ctx.discussion_id,
            url
        );

        let response = match self
            .client
            .get(url.clone())
            .timeout(Duration::from_secs(timeout_secs))
            .send()
            .await
        {
            Ok(resp) => resp,
            Err(e) => return Ok(ToolOutput::Error(format!("HTTP request failed: {}", e))),
        };
        let status = response.status();
        if !status.is_success() {
            return Ok(ToolOutput::Error(format!(
                "{} returned HTTP {}",
                url,
                status.as_u16()
            )));
        }
        let is_html = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.contains("html"))
            .unwrap_or(false);

        let raw = read_limited(response, MAX_BODY_BYTES).await?;
        let text = if is_html { html_to_text(&raw) } else { raw };
        let (text, truncated) = truncate_chars(&text, max_chars);

        let body = if truncated {
            format!("{}\n[truncated to {} characters]", text, max_chars)
        } else {
            text
        };
        match check_output(self.name(), &body) {
            Ok(wrapped) => Ok(ToolOutput::Text(wrapped)),
            Err(reason) => Ok(ToolOutput::Error(format!("Response blocked: {}", reason))),
        }
    }

    fn category(&self) -> ToolCategory {
        ToolCategory::Network
    }
}

async fn read_limited(mut response: reqwest::Response, max_bytes: usize) -> Result<String> {
    let mut body: Vec<u8> = Vec::new();
    while let Some(chunk) = response
        .chunk()
        .await
        .context("Failed reading response body")?
    {
        let remaining = max_bytes.saturating_sub(body.len());
        body.extend_from_slice(&chunk[..remaining.min(chunk.len())]);
        if body.len() >= max_bytes {
            break;
        }
    }
    Ok(String::from_utf8_lossy(&body).to_string())
}

/// Returns at most `max_chars` characters and whether anything was cut.
pub fn truncate_chars(text: &str, max_chars: usize) -> (String, bool) {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => (text[..idx].to_string(), true),
        None => (text.to_string(), false),
    }
}

/// Strips scripts, styles and markup, decodes the common entities and collapses
/// whitespace.
pub fn html_to_text(html: &str) -> String {
    static BLOCKS: Pattern = OnceLock::new();
    static TAGS: Pattern = OnceLock::new();
    static SPACES: Pattern = OnceLock::new();

    let mut text = html.to_string();
    if let Some(re) = regex(
        &BLOCKS,
        r"(?is)<(script|style|noscript|head)\b[^>]*>.*?</(script|style|noscript|head)\s*>",
    ) {
        text = re.replace_all(&text, " ").into_owned();
    }
    if let Some(re) = regex(&TAGS, r"(?s)<[^>]*>") {
        text = re.replace_all(&text, " ").into_owned();
    }
    let text = text
        .replace("&nbsp;", " ")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&amp;", "&");
    match regex(&SPACES, r"\s+") {
        Some(re) => re.replace_all(&text, " ").trim().to_string(),
        None => text.trim().to_string(),
    }
}

async fn validate_destination(url: &Url, allow_private_hosts: bool) -> Result<(), String> {
    if allow_private_hosts {
        return Ok(());
    }
    let host = url
        .host_str()
        .ok_or_else(|| "URL is missing a host".to_string())?;
    let host_lower = host.trim_matches(|c| c == '[' || c == ']').to_ascii_lowercase();
    if host_lower == "localhost"
        || host_lower.ends_with(".localhost")
        || host_lower.ends_with(".local")
        || host_lower.ends_with(".internal")
    {
        return Err(format!("Blocked local/private host '{}'", host));
    }
    if let Ok(ip) = host_lower.parse::<IpAddr>() {
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
        Err(e) => Err(format!("Could not resolve host '{}': {}", host, e)),
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
                || v6.is_unique_local()
                || v6.is_unicast_link_local()
                || v6
                    .to_ipv4_mapped()
                    .map(|v4| is_private_or_local_ip(IpAddr::V4(v4)))
                    .unwrap_or(false)
        }
    }
}
