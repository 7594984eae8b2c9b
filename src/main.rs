//! codex-relay - HTTP Server Entry Point
//!
//! Loads configuration, restores the account pool from disk, wires up the
//! token refresh client, rate-limit tracker, model catalog cache, and Fetch
//! Orchestrator, then starts the proactive refresh scheduler and the ambient
//! HTTP surface.

use std::sync::Arc;

use codex_relay::account::store::PersistentAccountStore;
use codex_relay::account::Pool;
use codex_relay::api;
use codex_relay::auth::{HttpTokenRefreshClient, ProactiveRefreshScheduler};
use codex_relay::catalog::{HttpCatalogSourceClient, ModelCatalogCache};
use codex_relay::config::Config;
use codex_relay::orchestrator::{FetchOrchestrator, HttpUpstreamClient};
use codex_relay::ratelimit::RateLimitTracker;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// The vendor's OAuth token endpoint and public client id, as used by the
/// Codex CLI. Not configurable: this is the identity of the OAuth app the
/// vendor issued, not a deployment-specific setting.
const TOKEN_ENDPOINT: &str = "https://auth.openai.com/oauth/token";
const CLIENT_ID: &str = "app_EMoamEEZ73f0CkXaXp7hrann";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "codex_relay=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env()?;
    info!(storage_root = %config.storage_root.display(), "loaded configuration");

    let store = Arc::new(PersistentAccountStore::new(config.accounts_file()));
    let doc = store.load()?;
    info!(accounts = doc.accounts.len(), "restored account pool from disk");

    let pool = Arc::new(Pool::from_document(
        &doc,
        config.account_selection_strategy,
        config.pid_offset_enabled,
        std::process::id(),
    ));

    let http = reqwest::Client::new();

    let token_client: Arc<dyn codex_relay::auth::TokenRefreshClient> = Arc::new(
        HttpTokenRefreshClient::new(http.clone(), TOKEN_ENDPOINT.to_string(), CLIENT_ID.to_string()),
    );

    let rate_limiter = Arc::new(RateLimitTracker::new(config.backoff.clone()));

    let catalog_source = Box::new(HttpCatalogSourceClient::new(
        http.clone(),
        config.upstream_base_url.clone(),
        config.catalog_fetch_timeout_ms,
    ));
    let catalog = Arc::new(ModelCatalogCache::new(
        config.cache_dir(),
        catalog_source,
        Vec::new(),
        config.catalog_cache_ttl_ms,
        config.catalog_session_cap_ms,
        config.catalog_cold_start_backoff_ms,
        config.client_version.clone(),
    ));

    let upstream: Arc<dyn codex_relay::orchestrator::UpstreamClient> =
        Arc::new(HttpUpstreamClient::new(http.clone()));

    // Built unconditionally: the orchestrator enqueues near-expiry refreshes
    // onto it even when the periodic full-sweep below is disabled.
    let scheduler = Arc::new(ProactiveRefreshScheduler::new(
        pool.clone(),
        store.clone(),
        token_client.clone(),
        config.proactive_refresh_interval_ms,
        config.proactive_refresh_buffer_ms,
        config.auth_failure_cooldown_ms,
        config.proactive_refresh_queue_interval_ms,
    ));

    let orchestrator = Arc::new(FetchOrchestrator::new(
        pool.clone(),
        store.clone(),
        token_client,
        upstream,
        catalog,
        rate_limiter,
        scheduler.clone(),
        &config,
    ));

    if config.proactive_token_refresh {
        scheduler.spawn();
        info!("proactive refresh scheduler started");
    }

    api::serve(config, pool, orchestrator).await?;

    Ok(())
}
