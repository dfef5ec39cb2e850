// Static configuration — protocol constants and the flat startup config.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;
use tracing::warn;

/// How long a successful login stays fresh; within this window re-login is skipped.
pub const LOGIN_FRESHNESS_WINDOW: Duration = Duration::from_secs(60);

/// Deadline for every upstream HTTP call.
pub const UPSTREAM_TIMEOUT: Duration = Duration::from_secs(10);

/// Interval between keep-alive heartbeat polls.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);

/// Login redirects tolerated per dynamic request before giving up.
pub const DEFAULT_RETRY_BUDGET: u32 = 3;

/// Upstream connection cap shared by heartbeat, login, and proxied traffic.
pub const UPSTREAM_MAX_CONNECTIONS: usize = 3;

/// Largest inbound request body the proxy will buffer (2 MB).
pub const MAX_REQUEST_BODY_BYTES: usize = 2 * 1024 * 1024;

/// Canonical hostname the device expects in host/referer/origin headers,
/// regardless of the address the proxy actually dials.
pub const UPSTREAM_CANONICAL_HOST: &str = "speedport.ip";
pub const UPSTREAM_CANONICAL_URL: &str = "http://speedport.ip";

pub const LOGIN_PAGE_PATH: &str = "/html/login/index.html";
pub const LOGIN_DATA_PATH: &str = "/data/Login.json";
pub const HEARTBEAT_PATH: &str = "/data/heartbeat.json";
pub const OVERVIEW_PATH: &str = "/html/content/overview/index.html";

/// Login and root paths downstream clients must never reach directly.
pub const LOGIN_PATHS: [&str; 6] = [
    "/",
    "/html",
    "/html/",
    "/html/login",
    "/html/login/",
    "/html/login/index.html",
];

/// Inbound headers forwarded to the device; everything else is dropped.
pub const ALLOWED_HEADERS: [&str; 3] = ["x-requested-with", "origin", "referer"];

/// Path extensions that always take the authenticated dynamic path.
pub const DYNAMIC_EXTENSIONS: [&str; 3] = ["htm", "html", "json"];

/// The device's UI misbehaves for unknown browsers, so every forwarded
/// request claims to be this one.
pub const FORCED_USER_AGENT: &str = "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_11_2) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/47.0.2526.106 Safari/537.36";

/// Reply for a downstream logout request; the real upstream session stays alive.
pub const LOGOUT_SUCCESS: &str = r#"[{"vartype":"status","varid":"status","varvalue":"ok"}]"#;

/// Heartbeat body served until the first real poll completes.
pub const INITIAL_HEARTBEAT: &str = r#"[{"vartype":"status","varid":"loginstate","varvalue":"1"}]"#;

/// Body of every error reply to downstream clients; detail stays in the logs.
pub const PROXY_ERROR_BODY: &str = "Internal SPAuthProxy error";

/// Top-level configuration, read once at startup.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    /// Host (or host:port) of the upstream device.
    pub upstream_host: String,
    /// Device admin password.
    pub password: String,
    /// Whether static responses are written to and served from disk.
    pub cache_enabled: bool,
    /// Directory holding the cache index and body blobs.
    pub cache_dir: String,
    /// Address the proxy listens on.
    pub bind_host: String,
    pub port: u16,
    /// URL downstream clients use to reach the proxy; rewritten out of
    /// referer/origin headers before forwarding.
    pub public_url: String,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            upstream_host: "192.168.2.1".to_string(),
            password: String::new(),
            cache_enabled: true,
            cache_dir: "cache".to_string(),
            bind_host: "127.0.0.1".to_string(),
            port: 8080,
            public_url: "http://127.0.0.1:8080".to_string(),
        }
    }
}

impl ProxyConfig {
    /// Load the JSON config file, then apply environment overrides.
    /// A missing file yields the defaults; a malformed one is an error.
    pub fn load(path: &Path) -> Result<Self> {
        let mut config = match std::fs::read_to_string(path) {
            Ok(raw) => serde_json::from_str(&raw)
                .with_context(|| format!("malformed config file {}", path.display()))?,
            Err(e) => {
                warn!(
                    "config file {} not readable ({}), using defaults",
                    path.display(),
                    e
                );
                Self::default()
            }
        };

        if let Ok(host) = std::env::var("SP_PROXY_UPSTREAM") {
            config.upstream_host = host;
        }
        if let Ok(password) = std::env::var("SP_PROXY_PASSWORD") {
            config.password = password;
        }

        Ok(config)
    }
}
