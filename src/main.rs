use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use sp_auth_proxy::auth::session::AuthSession;
use sp_auth_proxy::cache::CacheStore;
use sp_auth_proxy::config::ProxyConfig;
use sp_auth_proxy::server::handler::{ProxyServer, ProxyState};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config_path =
        std::env::var("SP_PROXY_CONFIG").unwrap_or_else(|_| "config.json".to_string());
    let config = ProxyConfig::load(Path::new(&config_path))?;

    if config.password.is_empty() {
        warn!("no device password configured; every dynamic request will fail to log in");
    }

    // With caching enabled an unusable cache directory is fatal; without it
    // the proxy simply runs pass-through.
    let cache = if config.cache_enabled {
        let store = CacheStore::open(Path::new(&config.cache_dir))
            .await
            .context("cache directory unavailable")?;
        info!("cache enabled at {} ({} entries)", config.cache_dir, store.len());
        Some(Arc::new(store))
    } else {
        None
    };

    let auth = Arc::new(AuthSession::new(&config.upstream_host, &config.password)?);

    let cancel = CancellationToken::new();
    let heartbeat = auth.spawn_heartbeat(cancel.clone());

    let state = Arc::new(ProxyState {
        auth,
        cache,
        public_url: config.public_url.clone(),
    });

    let server = ProxyServer::start(&config.bind_host, config.port, state).await?;
    info!(
        "proxying {} on http://{}:{}",
        config.upstream_host,
        config.bind_host,
        server.port()
    );

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;

    info!("shutdown requested");
    cancel.cancel();
    server.shutdown();
    let _ = heartbeat.await;

    Ok(())
}
