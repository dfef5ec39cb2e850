// Authenticated session state machine — owns the relationship with the
// upstream device and exposes a single authenticated-exchange primitive.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use anyhow::Result;
use bytes::Bytes;
use parking_lot::Mutex;
use rand::Rng;
use regex::Regex;
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE, COOKIE, LOCATION, SET_COOKIE};
use reqwest::{Method, StatusCode};
use serde::Deserialize;
use tokio::sync::{Mutex as FlightLock, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::crypto::{derive_key, hash_password};
use super::error::AuthError;
use crate::config::{
    HEARTBEAT_INTERVAL, HEARTBEAT_PATH, INITIAL_HEARTBEAT, LOGIN_DATA_PATH,
    LOGIN_FRESHNESS_WINDOW, LOGIN_PAGE_PATH, UPSTREAM_MAX_CONNECTIONS, UPSTREAM_TIMEOUT,
};

/// One upstream exchange, as requested by the proxy front.
#[derive(Debug, Clone)]
pub struct ExchangeSpec {
    pub method: Method,
    /// Path plus query string, e.g. `/data/Status.json?lang=en`.
    pub path_and_query: String,
    /// Headers to send upstream, already filtered/rewritten by the caller.
    pub headers: HeaderMap,
    /// When false the session cookie is neither attached upstream nor
    /// re-emitted downstream (static asset traffic).
    pub forward_cookies: bool,
    /// Login redirects tolerated before failing with `NotAuthenticated`.
    pub retry_budget: u32,
}

impl ExchangeSpec {
    /// A bare cookie-less GET with no relogin attempts.
    pub fn plain_get(path_and_query: impl Into<String>) -> Self {
        Self {
            method: Method::GET,
            path_and_query: path_and_query.into(),
            headers: HeaderMap::new(),
            forward_cookies: false,
            retry_budget: 0,
        }
    }
}

/// Mutable session state. Only the login routine writes the credential
/// fields; the exchange path reads them.
struct SessionState {
    /// Challenge token from the last stage-one fetch; cleared when a new
    /// login attempt starts.
    challenge: Option<String>,
    /// Composite cookie attached to authenticated requests:
    /// `challengev=<c>; SessionID_R3=<sid>; derivedk=<dk>`.
    cookie: Option<String>,
    /// set-cookie lines re-emitted to downstream clients.
    cookie_headers: Vec<String>,
    logged_in_at: Option<Instant>,
    /// Raw login-page body, replayed to downstream login UIs.
    stage_one_reply: Option<String>,
    /// Raw login-status body, replayed to downstream login UIs.
    stage_two_reply: Option<String>,
    last_heartbeat: String,
}

impl SessionState {
    fn new() -> Self {
        Self {
            challenge: None,
            cookie: None,
            cookie_headers: Vec::new(),
            logged_in_at: None,
            stage_one_reply: None,
            stage_two_reply: None,
            last_heartbeat: INITIAL_HEARTBEAT.to_string(),
        }
    }
}

pub struct AuthSession {
    client: reqwest::Client,
    base_url: String,
    password: String,
    state: Mutex<SessionState>,
    /// Serializes login attempts; queued callers adopt the outcome of the
    /// attempt that ran while they waited.
    login_flight: FlightLock<()>,
    login_attempt: AtomicU64,
    last_outcome: Mutex<Option<Result<(), AuthError>>>,
    /// Caps concurrent upstream calls; heartbeat, login and proxied
    /// traffic all draw from the same pool.
    upstream_permits: Semaphore,
}

impl AuthSession {
    /// Create a session for the device at `upstream_host` (host or host:port).
    pub fn new(upstream_host: &str, password: &str) -> Result<Self> {
        // Redirects must surface as-is: a 302 to the login page is the
        // session-expiry signal this whole module exists to handle.
        let client = reqwest::Client::builder()
            .timeout(UPSTREAM_TIMEOUT)
            .redirect(reqwest::redirect::Policy::none())
            .pool_max_idle_per_host(UPSTREAM_MAX_CONNECTIONS)
            .build()?;

        Ok(Self {
            client,
            base_url: format!("http://{}", upstream_host),
            password: password.to_string(),
            state: Mutex::new(SessionState::new()),
            login_flight: FlightLock::new(()),
            login_attempt: AtomicU64::new(0),
            last_outcome: Mutex::new(None),
            upstream_permits: Semaphore::new(UPSTREAM_MAX_CONNECTIONS),
        })
    }

    /// Perform an upstream exchange, transparently logging in first when the
    /// device answers with a redirect to its login page. Bounded loop: each
    /// observed login redirect consumes one unit of the retry budget;
    /// transport errors do not.
    pub async fn exchange(
        &self,
        spec: &ExchangeSpec,
        body: Option<Bytes>,
    ) -> Result<reqwest::Response, AuthError> {
        let mut budget = spec.retry_budget;

        loop {
            let response = self.send_upstream(spec, body.clone()).await?;

            if is_login_redirect(&response) {
                // Drain so the keep-alive connection returns to the pool.
                let _ = response.bytes().await;

                if budget == 0 {
                    return Err(AuthError::NotAuthenticated);
                }
                budget -= 1;
                debug!(
                    "login redirect for {} {}, relogging in ({} retries left)",
                    spec.method, spec.path_and_query, budget
                );
                self.login().await?;
                continue;
            }

            let mut response = response;
            if spec.forward_cookies {
                // The downstream client must only ever see the proxy's
                // session, not the device's raw one.
                let cookie_headers = self.state.lock().cookie_headers.clone();
                if !cookie_headers.is_empty() {
                    let headers = response.headers_mut();
                    headers.remove(SET_COOKIE);
                    for line in &cookie_headers {
                        if let Ok(value) = HeaderValue::from_str(line) {
                            headers.append(SET_COOKIE, value);
                        }
                    }
                }
            }
            return Ok(response);
        }
    }

    /// Ensure a live login. Fresh sessions short-circuit; callers that find
    /// a login already in flight wait for it and share its outcome, so at
    /// most one login sequence is ever in flight upstream.
    pub async fn login(&self) -> Result<(), AuthError> {
        if self.is_fresh() {
            return Ok(());
        }

        let attempt_seen = self.login_attempt.load(Ordering::Acquire);
        let _flight = self.login_flight.lock().await;

        // An attempt completed while we queued: adopt its outcome.
        if self.login_attempt.load(Ordering::Acquire) != attempt_seen {
            if let Some(outcome) = self.last_outcome.lock().clone() {
                return outcome;
            }
        }
        if self.is_fresh() {
            return Ok(());
        }

        let outcome = self.run_login().await;
        *self.last_outcome.lock() = Some(outcome.clone());
        self.login_attempt.fetch_add(1, Ordering::Release);
        outcome
    }

    /// One full login attempt: fetch the challenge, send the hashed
    /// password, validate the status reply, capture the session cookies.
    async fn run_login(&self) -> Result<(), AuthError> {
        // Whatever session we had is presumed invalid from here on.
        {
            let mut state = self.state.lock();
            state.challenge = None;
            state.cookie = None;
            state.cookie_headers.clear();
            state.logged_in_at = None;
        }

        // Stage one: the login page embeds the challenge token.
        let page = self
            .send_upstream(&ExchangeSpec::plain_get(LOGIN_PAGE_PATH), None)
            .await?
            .text()
            .await?;

        let challenge = extract_challenge(&page);
        if challenge.is_none() {
            warn!("login page carried no challenge token");
        }
        {
            let mut state = self.state.lock();
            state.stage_one_reply = Some(page);
            state.challenge = challenge.clone();
        }
        let challenge =
            challenge.ok_or_else(|| AuthError::LoginFailed("no challenge".to_string()))?;

        // Stage two: answer the challenge.
        let password_hash = hash_password(&challenge, &self.password);
        let derivedk = derive_key(&challenge, &self.password);
        let form = url::form_urlencoded::Serializer::new(String::new())
            .append_pair("password", &password_hash)
            .append_pair("showpw", "0")
            .append_pair("csrf_token", "nulltoken")
            .append_pair("challengev", &challenge)
            .finish();

        let mut spec = ExchangeSpec::plain_get(LOGIN_DATA_PATH);
        spec.method = Method::POST;
        spec.headers.insert(
            CONTENT_TYPE,
            HeaderValue::from_static("application/x-www-form-urlencoded"),
        );

        let response = self.send_upstream(&spec, Some(Bytes::from(form))).await?;
        let set_cookies: Vec<String> = response
            .headers()
            .get_all(SET_COOKIE)
            .iter()
            .filter_map(|v| v.to_str().ok().map(str::to_string))
            .collect();
        let status_body = response.text().await?;
        self.state.lock().stage_two_reply = Some(status_body.clone());

        let status = parse_login_status(&status_body)?;
        if status.get("login").map(String::as_str) != Some("success") {
            return Err(AuthError::LoginRejected(format!(
                "device said login={}",
                status.get("login").map(String::as_str).unwrap_or("<absent>")
            )));
        }

        let session_id = extract_session_cookie(&set_cookies)
            .ok_or_else(|| AuthError::LoginFailed("missing session id cookie".to_string()))?;

        let mut cookie_headers = set_cookies;
        cookie_headers.push(format!("derivedk={}; path=/;", derivedk));
        cookie_headers.push(format!("challengev={}; path=/;", challenge));

        {
            let mut state = self.state.lock();
            state.cookie = Some(format!(
                "challengev={}; {}; derivedk={}",
                challenge, session_id, derivedk
            ));
            state.cookie_headers = cookie_headers;
            state.logged_in_at = Some(Instant::now());
        }

        info!("logged in to upstream device");
        Ok(())
    }

    /// Issue one HTTP request against the device, attaching the session
    /// cookie when requested. A permit from the shared pool bounds how many
    /// upstream calls are in flight at once.
    async fn send_upstream(
        &self,
        spec: &ExchangeSpec,
        body: Option<Bytes>,
    ) -> Result<reqwest::Response, AuthError> {
        let _permit = self
            .upstream_permits
            .acquire()
            .await
            .map_err(|e| AuthError::Upstream(e.to_string()))?;

        let url = format!("{}{}", self.base_url, spec.path_and_query);
        let mut request = self
            .client
            .request(spec.method.clone(), &url)
            .headers(spec.headers.clone());

        if spec.forward_cookies {
            if let Some(session_cookie) = self.session_cookie() {
                // Session cookie first, then whatever the caller sent.
                let merged = match spec.headers.get(COOKIE).and_then(|v| v.to_str().ok()) {
                    Some(extra) => format!("{}; {}", session_cookie, extra),
                    None => session_cookie,
                };
                if let Ok(value) = HeaderValue::from_str(&merged) {
                    request = request.header(COOKIE, value);
                }
            }
        }

        if let Some(body) = body {
            request = request.body(body);
        }

        Ok(request.send().await?)
    }

    /// Poll the device's lightweight status endpoint once and keep the raw
    /// body for synthetic replies. Cache-busting query parameters mirror
    /// what the device's own UI sends.
    pub async fn poll_heartbeat(&self) -> Result<(), AuthError> {
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis())
            .unwrap_or(0);
        let rand: u32 = rand::thread_rng().gen_range(100..1000);

        let spec = ExchangeSpec::plain_get(format!(
            "{}?_time={}&_rand={}",
            HEARTBEAT_PATH, millis, rand
        ));
        let body = self.exchange(&spec, None).await?.text().await?;
        self.state.lock().last_heartbeat = body;
        Ok(())
    }

    /// Spawn the 5-second heartbeat loop. Failures are logged, never
    /// escalated; the polling itself keeps the connection pool warm.
    pub fn spawn_heartbeat(self: &Arc<Self>, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
        let session = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!("heartbeat task stopped");
                        return;
                    }
                    _ = tokio::time::sleep(HEARTBEAT_INTERVAL) => {}
                }
                if let Err(e) = session.poll_heartbeat().await {
                    warn!("heartbeat failed: {}", e);
                }
            }
        })
    }

    fn is_fresh(&self) -> bool {
        self.state
            .lock()
            .logged_in_at
            .is_some_and(|at| at.elapsed() < LOGIN_FRESHNESS_WINDOW)
    }

    fn session_cookie(&self) -> Option<String> {
        self.state.lock().cookie.clone()
    }

    /// Most recent heartbeat body (or the built-in placeholder).
    pub fn last_heartbeat(&self) -> String {
        self.state.lock().last_heartbeat.clone()
    }

    /// Raw login-page body captured by the proxy's own last login.
    pub fn stage_one_reply(&self) -> Option<String> {
        self.state.lock().stage_one_reply.clone()
    }

    /// Raw login-status body captured by the proxy's own last login.
    pub fn stage_two_reply(&self) -> Option<String> {
        self.state.lock().stage_two_reply.clone()
    }
}

/// The device signals "not logged in" with a 302 to its own login page.
fn is_login_redirect(response: &reqwest::Response) -> bool {
    response.status() == StatusCode::FOUND
        && response
            .headers()
            .get(LOCATION)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|location| location.contains(LOGIN_PAGE_PATH))
}

/// Pull the challenge token out of the login page markup. The embedded
/// `var challenge = "…";` assignment is undocumented upstream behavior and
/// the single most fragile dependency in the protocol.
fn extract_challenge(page: &str) -> Option<String> {
    let re = Regex::new(r#"var challenge = "([^"]+)";"#).unwrap();
    re.captures(page).map(|c| c[1].to_string())
}

/// Find the device's session id cookie among the set-cookie lines.
fn extract_session_cookie(set_cookies: &[String]) -> Option<String> {
    let re = Regex::new(r"SessionID_R3=[^;]*").unwrap();
    set_cookies
        .iter()
        .find_map(|line| re.find(line).map(|m| m.as_str().to_string()))
}

#[derive(Deserialize)]
struct LoginVar {
    varid: String,
    #[serde(default)]
    varvalue: serde_json::Value,
}

/// The login status reply is an ordered array of `{varid, varvalue}`
/// records; only `varid` is a stable contract, so fold into a map and read
/// fields by name.
fn parse_login_status(
    body: &str,
) -> Result<std::collections::HashMap<String, String>, AuthError> {
    let vars: Vec<LoginVar> = serde_json::from_str(body)
        .map_err(|e| AuthError::LoginFailed(format!("malformed login status: {}", e)))?;

    Ok(vars
        .into_iter()
        .map(|v| {
            let value = match v.varvalue {
                serde_json::Value::String(s) => s,
                other => other.to_string(),
            };
            (v.varid, value)
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_challenge() {
        let page = r#"<html><script>
            var challenge = "8f2e1bca77";
            var other = "x";
        </script></html>"#;
        assert_eq!(extract_challenge(page), Some("8f2e1bca77".to_string()));
        assert_eq!(extract_challenge("<html>no challenge here</html>"), None);
    }

    #[test]
    fn test_extract_session_cookie() {
        let cookies = vec![
            "lang=en; path=/".to_string(),
            "SessionID_R3=abc123def; path=/; HttpOnly".to_string(),
        ];
        assert_eq!(
            extract_session_cookie(&cookies),
            Some("SessionID_R3=abc123def".to_string())
        );
        assert_eq!(extract_session_cookie(&["lang=en".to_string()]), None);
    }

    #[test]
    fn test_parse_login_status_success() {
        let body = r#"[
            {"vartype":"status","varid":"login","varvalue":"success"},
            {"vartype":"status","varid":"status","varvalue":"ok"}
        ]"#;
        let status = parse_login_status(body).unwrap();
        assert_eq!(status.get("login").map(String::as_str), Some("success"));
        assert_eq!(status.get("status").map(String::as_str), Some("ok"));
    }

    #[test]
    fn test_parse_login_status_numeric_value() {
        // Some firmware revisions emit numbers; they must not break parsing.
        let body = r#"[{"varid":"login_locked","varvalue":60}]"#;
        let status = parse_login_status(body).unwrap();
        assert_eq!(status.get("login_locked").map(String::as_str), Some("60"));
    }

    #[test]
    fn test_parse_login_status_malformed() {
        let err = parse_login_status("not json at all").unwrap_err();
        assert!(matches!(err, AuthError::LoginFailed(_)));
    }
}
