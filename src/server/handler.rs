// Proxy front — classifies inbound requests and answers them synthetically,
// from the disk cache, or through the authenticated upstream session.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use axum::{
    body::Body,
    extract::{Request, State},
    http::{header, HeaderMap, HeaderName, HeaderValue, Method, StatusCode},
    response::{IntoResponse, Response},
    Router,
};
use bytes::Bytes;
use futures_util::{StreamExt, TryStreamExt};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, warn};

use crate::auth::session::{AuthSession, ExchangeSpec};
use crate::cache::{CacheEntry, CacheStore};
use crate::config::{
    ALLOWED_HEADERS, DEFAULT_RETRY_BUDGET, DYNAMIC_EXTENSIONS, FORCED_USER_AGENT, HEARTBEAT_PATH,
    LOGIN_DATA_PATH, LOGIN_PATHS, LOGOUT_SUCCESS, MAX_REQUEST_BODY_BYTES, OVERVIEW_PATH,
    PROXY_ERROR_BODY, UPSTREAM_CANONICAL_HOST, UPSTREAM_CANONICAL_URL,
};

const X_CACHING: HeaderName = HeaderName::from_static("x-caching");

/// Shared state for the request handler.
pub struct ProxyState {
    pub auth: Arc<AuthSession>,
    /// Present only when caching is enabled.
    pub cache: Option<Arc<CacheStore>>,
    /// The proxy's own public URL, rewritten out of forwarded headers.
    pub public_url: String,
}

pub struct ProxyServer {
    port: u16,
    shutdown_tx: Option<tokio::sync::oneshot::Sender<()>>,
}

impl ProxyServer {
    /// Bind the listener and start serving. Port 0 picks a free port.
    pub async fn start(bind_host: &str, port: u16, state: Arc<ProxyState>) -> Result<Self> {
        let listener = TcpListener::bind(format!("{}:{}", bind_host, port)).await?;
        let port = listener.local_addr()?.port();

        let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();

        // Every method and path funnels through one handler.
        let app = Router::new().fallback(proxy_handler).with_state(state);

        tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async {
                    let _ = shutdown_rx.await;
                })
                .await
                .ok();
        });

        Ok(Self {
            port,
            shutdown_tx: Some(shutdown_tx),
        })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Shutdown the server gracefully.
    pub fn shutdown(mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}

async fn proxy_handler(State(state): State<Arc<ProxyState>>, req: Request) -> Response {
    let method = req.method().clone();
    let uri = req.uri().clone();
    let inbound_headers = req.headers().clone();

    let path = uri.path().to_string();
    let path_and_query = uri
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| path.clone());

    let body = match axum::body::to_bytes(req.into_body(), MAX_REQUEST_BODY_BYTES).await {
        Ok(body) => body,
        Err(e) => {
            warn!("failed to read request body for {}: {}", path, e);
            return proxy_error();
        }
    };

    // Status polling is answered from the heartbeat snapshot; it never
    // causes a per-request upstream round trip.
    if path == HEARTBEAT_PATH {
        return (
            [(header::CONTENT_TYPE, "application/javascript")],
            state.auth.last_heartbeat(),
        )
            .into_response();
    }

    // The downstream client's own login UI is answered with artifacts from
    // the proxy's internal login; a second real login never happens.
    if path == LOGIN_DATA_PATH && !body.is_empty() {
        return interject_login(&state, &body);
    }

    // Never let a client reach the device's native login page.
    if LOGIN_PATHS.contains(&path.as_str()) {
        let is_ajax = inbound_headers
            .get("x-requested-with")
            .is_some_and(|v| v.as_bytes() == b"XMLHttpRequest");
        if is_ajax {
            return StatusCode::FORBIDDEN.into_response();
        }
        let location = format!("{}{}", state.public_url, OVERVIEW_PATH);
        return (StatusCode::FOUND, [(header::LOCATION, location)]).into_response();
    }

    let is_static = classify_static(&method, &path);

    if is_static {
        if let Some(cache) = &state.cache {
            if let Some(entry) = cache.lookup(&path) {
                match cache.read_body(&path).await {
                    Ok(body) => {
                        debug!("cache hit for {}", path);
                        return cached_response(entry, body);
                    }
                    Err(e) => warn!("cache body read failed for {}: {}", path, e),
                }
            }
        }
    }

    let spec = ExchangeSpec {
        method: method.clone(),
        path_and_query,
        headers: build_upstream_headers(&inbound_headers, &state.public_url),
        forward_cookies: !is_static,
        retry_budget: if is_static { 0 } else { DEFAULT_RETRY_BUDGET },
    };
    let body = if body.is_empty() { None } else { Some(body) };

    match state.auth.exchange(&spec, body).await {
        Ok(upstream) => relay_response(&state, upstream, path, is_static),
        Err(e) => {
            warn!("exchange failed for {} {}: {}", method, uri, e);
            proxy_error()
        }
    }
}

/// Stream the upstream response to the client; static responses are teed
/// into the cache while they stream.
fn relay_response(
    state: &ProxyState,
    upstream: reqwest::Response,
    path: String,
    is_static: bool,
) -> Response {
    let status = upstream.status();

    let mut headers = HeaderMap::new();
    for (name, value) in upstream.headers() {
        // Hop-by-hop headers don't survive the proxy.
        if name == header::CONNECTION || name == header::TRANSFER_ENCODING {
            continue;
        }
        headers.append(name.clone(), value.clone());
    }
    headers.insert(
        X_CACHING,
        HeaderValue::from_static(if is_static { "LOOKUP" } else { "PASS" }),
    );

    if is_static {
        if let Some(cache) = &state.cache {
            let cache = Arc::clone(cache);
            let cache_headers: Vec<(String, String)> = upstream
                .headers()
                .iter()
                .filter_map(|(name, value)| {
                    value
                        .to_str()
                        .ok()
                        .map(|v| (name.as_str().to_string(), v.to_string()))
                })
                .collect();
            let status_code = status.as_u16();

            let (tx, rx) = mpsc::channel::<std::io::Result<Bytes>>(16);
            tokio::spawn(async move {
                let mut stream = upstream.bytes_stream();
                let mut buffered: Vec<u8> = Vec::new();
                let mut truncated = false;

                while let Some(chunk) = stream.next().await {
                    match chunk {
                        Ok(bytes) => {
                            buffered.extend_from_slice(&bytes);
                            // A gone client doesn't stop the download; the
                            // cache entry should still complete.
                            let _ = tx.send(Ok(bytes)).await;
                        }
                        Err(e) => {
                            truncated = true;
                            let _ = tx.send(Err(std::io::Error::other(e))).await;
                            break;
                        }
                    }
                }

                if !truncated {
                    if let Err(e) = cache
                        .insert(&path, status_code, cache_headers, &buffered)
                        .await
                    {
                        warn!("cache write failed for {}: {}", path, e);
                    }
                }
                // tx drops here, ending the downstream body only after the
                // cache entry is durable.
            });

            let body = Body::from_stream(ReceiverStream::new(rx));
            return (status, headers, body).into_response();
        }
    }

    let body = Body::from_stream(upstream.bytes_stream().map_err(std::io::Error::other));
    (status, headers, body).into_response()
}

/// Serve a cached entry: stored status and headers, blob body, marked HIT.
fn cached_response(entry: CacheEntry, body: Vec<u8>) -> Response {
    let status = StatusCode::from_u16(entry.status).unwrap_or(StatusCode::OK);

    let mut headers = HeaderMap::new();
    for (name, value) in &entry.headers {
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            headers.append(name, value);
        }
    }
    headers.insert(X_CACHING, HeaderValue::from_static("HIT"));

    (status, headers, body).into_response()
}

/// Answer the downstream login UI from captured artifacts: stage one for a
/// challenge request, stage two for a password submission, a fixed success
/// payload for logout. Anything else is a 404.
fn interject_login(state: &ProxyState, body: &[u8]) -> Response {
    let form: HashMap<String, String> = url::form_urlencoded::parse(body)
        .into_owned()
        .collect();

    let reply = if form.get("challengev").map(String::as_str) == Some("null") {
        state.auth.stage_one_reply()
    } else if form.contains_key("password") {
        state.auth.stage_two_reply()
    } else if form.get("logout").map(String::as_str) == Some("byby") {
        Some(LOGOUT_SUCCESS.to_string())
    } else {
        None
    };

    match reply {
        Some(reply) => (
            [(header::CONTENT_TYPE, "application/javascript")],
            reply,
        )
            .into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

/// Static requests skip authentication and are cacheable: GET with a file
/// extension that is not markup or JSON. Extensionless paths count as
/// binary assets.
fn classify_static(method: &Method, path: &str) -> bool {
    if method != Method::GET {
        return false;
    }
    let extension = match path.rfind('.') {
        Some(i) if i > 0 => path[i + 1..].to_ascii_lowercase(),
        _ => "bin".to_string(),
    };
    !DYNAMIC_EXTENSIONS.contains(&extension.as_str())
}

/// Reduce inbound headers to the forwarding allowlist, force the browser
/// identity, and point referer/origin/host at the device's canonical name.
fn build_upstream_headers(inbound: &HeaderMap, public_url: &str) -> HeaderMap {
    let mut out = HeaderMap::new();

    for name in ALLOWED_HEADERS {
        if let Some(value) = inbound.get(name) {
            if let Ok(name) = HeaderName::from_bytes(name.as_bytes()) {
                out.insert(name, value.clone());
            }
        }
    }

    out.insert(
        header::USER_AGENT,
        HeaderValue::from_static(FORCED_USER_AGENT),
    );

    for name in [header::REFERER, header::ORIGIN] {
        let rewritten = out
            .get(&name)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.replace(public_url, UPSTREAM_CANONICAL_URL));
        if let Some(rewritten) = rewritten {
            if let Ok(value) = HeaderValue::from_str(&rewritten) {
                out.insert(name, value);
            }
        }
    }

    out.insert(
        header::HOST,
        HeaderValue::from_static(UPSTREAM_CANONICAL_HOST),
    );

    out
}

fn proxy_error() -> Response {
    (StatusCode::INTERNAL_SERVER_ERROR, PROXY_ERROR_BODY).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_static_by_extension() {
        assert!(classify_static(&Method::GET, "/html/assets/logo.png"));
        assert!(classify_static(&Method::GET, "/style.CSS"));
        // Markup and JSON always take the dynamic path.
        assert!(!classify_static(&Method::GET, "/data/status.json"));
        assert!(!classify_static(&Method::GET, "/html/content/overview/index.html"));
        assert!(!classify_static(&Method::GET, "/page.htm"));
    }

    #[test]
    fn test_classify_static_by_method() {
        // Non-GET is dynamic regardless of extension.
        assert!(!classify_static(&Method::POST, "/html/assets/logo.png"));
        assert!(!classify_static(&Method::HEAD, "/html/assets/logo.png"));
    }

    #[test]
    fn test_classify_static_extensionless() {
        assert!(classify_static(&Method::GET, "/firmware/blob"));
    }

    #[test]
    fn test_build_upstream_headers_allowlist() {
        let mut inbound = HeaderMap::new();
        inbound.insert("x-requested-with", HeaderValue::from_static("XMLHttpRequest"));
        inbound.insert("x-forwarded-for", HeaderValue::from_static("10.0.0.9"));
        inbound.insert(header::COOKIE, HeaderValue::from_static("tracking=1"));

        let out = build_upstream_headers(&inbound, "http://proxy.example");
        assert_eq!(
            out.get("x-requested-with").unwrap(),
            HeaderValue::from_static("XMLHttpRequest")
        );
        assert!(out.get("x-forwarded-for").is_none());
        assert!(out.get(header::COOKIE).is_none());
        assert_eq!(out.get(header::HOST).unwrap(), UPSTREAM_CANONICAL_HOST);
        assert_eq!(out.get(header::USER_AGENT).unwrap(), FORCED_USER_AGENT);
    }

    #[test]
    fn test_build_upstream_headers_rewrites_referer_and_origin() {
        let mut inbound = HeaderMap::new();
        inbound.insert(
            header::REFERER,
            HeaderValue::from_static("http://proxy.example/html/content/overview/index.html"),
        );
        inbound.insert(
            header::ORIGIN,
            HeaderValue::from_static("http://proxy.example"),
        );

        let out = build_upstream_headers(&inbound, "http://proxy.example");
        assert_eq!(
            out.get(header::REFERER).unwrap(),
            "http://speedport.ip/html/content/overview/index.html"
        );
        assert_eq!(out.get(header::ORIGIN).unwrap(), "http://speedport.ip");
    }
}
