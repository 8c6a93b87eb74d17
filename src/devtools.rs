//! Reachability check for the browser's DevTools endpoint.
//!
//! Callers use it before enqueueing crawl jobs; the orchestrator itself never
//! talks to the browser.

use std::path::Path;
use std::time::Duration;

use anyhow::Context as _;
use serde::Deserialize;

use crate::config;

pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_PORT: &str = "9222";
pub const DOCKER_HOST: &str = "host.docker.internal";
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

const MAX_BODY_BYTES: usize = 32 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct BrowserVersion {
    #[serde(rename = "Browser")]
    pub browser: String,
    #[serde(rename = "webSocketDebuggerUrl")]
    pub web_socket_debugger_url: String,
    #[serde(rename = "Protocol-Version", default)]
    pub protocol_version: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DevtoolsConfig {
    pub host: Option<String>,
    pub port: Option<String>,
}

impl DevtoolsConfig {
    pub fn from_env() -> Self {
        Self::from_env_with(config::process_env)
    }

    pub fn from_env_with<F>(get: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        Self {
            host: config::string(&get, "CHROME_DEBUG_HOST"),
            port: config::string(&get, "CHROME_DEBUG_PORT"),
        }
    }
}

pub fn version_url(host: &str, port: &str) -> String {
    format!("http://{host}:{port}/json/version")
}

/// Heuristic: `/.dockerenv` exists.
pub fn in_docker() -> bool {
    Path::new("/.dockerenv").exists()
}

/// Version URL for `config`. Inside a container the host defaults to the
/// Docker host alias and is resolved to an address up front, since Chrome
/// rejects DevTools requests whose `Host` header is not an IP or localhost.
pub async fn resolve_version_url(config: &DevtoolsConfig) -> String {
    let docker = in_docker();
    let host = match config.host.as_deref() {
        Some(host) => host.to_owned(),
        None if docker => DOCKER_HOST.to_owned(),
        None => DEFAULT_HOST.to_owned(),
    };
    let port = config.port.as_deref().unwrap_or(DEFAULT_PORT);

    let host = if docker {
        resolve_ip(&host, port).await.unwrap_or(host)
    } else {
        host
    };
    version_url(&host, port)
}

/// First IPv4 address of `host`, else the first address of any family.
async fn resolve_ip(host: &str, port: &str) -> Option<String> {
    if host.parse::<std::net::IpAddr>().is_ok() {
        return Some(host.to_owned());
    }
    let port = port.parse::<u16>().ok()?;
    let addrs = tokio::net::lookup_host((host, port))
        .await
        .inspect_err(|err| tracing::debug!(host, error = %err, "resolve devtools host"))
        .ok()?
        .collect::<Vec<_>>();
    addrs
        .iter()
        .find(|addr| addr.is_ipv4())
        .or_else(|| addrs.first())
        .map(|addr| addr.ip().to_string())
}

/// GETs `url` and checks that it answers like a DevTools version endpoint.
pub async fn check_reachable(url: &str, timeout: Duration) -> anyhow::Result<BrowserVersion> {
    if url.trim().is_empty() {
        anyhow::bail!("missing url");
    }
    let client = reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .context("build devtools http client")?;

    let resp = client
        .get(url)
        .send()
        .await
        .with_context(|| format!("GET {url}"))?;
    let status = resp.status();
    if !status.is_success() {
        anyhow::bail!("unexpected status {status} from {url}");
    }

    let body = read_body_limited(resp, MAX_BODY_BYTES).await?;
    if body.iter().all(u8::is_ascii_whitespace) {
        anyhow::bail!("empty response from {url}");
    }
    let version: BrowserVersion = serde_json::from_slice(&body)
        .with_context(|| format!("decode devtools version from {url}"))?;
    if version.web_socket_debugger_url.trim().is_empty() {
        anyhow::bail!("{url} returned an empty webSocketDebuggerUrl");
    }
    Ok(version)
}

async fn read_body_limited(mut resp: reqwest::Response, limit: usize) -> anyhow::Result<Vec<u8>> {
    let mut out = Vec::new();
    while let Some(chunk) = resp.chunk().await.context("read response chunk")? {
        let remaining = limit.saturating_sub(out.len());
        if chunk.len() > remaining {
            out.extend_from_slice(&chunk[..remaining]);
            break;
        }
        out.extend_from_slice(&chunk);
    }
    Ok(out)
}
