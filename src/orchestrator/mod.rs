//! Fetch Orchestrator: the per-request state machine — select, refresh,
//! issue, intercept, classify, and the exhaustion fallback.

pub mod diagnostic;
pub mod stream;
pub mod transform;

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::account::types::{quota_key, Account, CooldownReason};
use crate::account::Pool;
use crate::account::store::PersistentAccountStore;
use crate::auth::refresh::{should_refresh, TokenRefreshClient};
use crate::auth::scheduler::ProactiveRefreshScheduler;
use crate::catalog::ModelCatalogCache;
use crate::config::{BackoffConfig, Config};
use crate::error::{CoreError, Result};
use crate::orchestrator::stream::{HarvestedRateLimits, SseRateLimitHarvester};
use crate::ratelimit::decider::{decide, DeciderAction};
use crate::ratelimit::tracker::{RateLimitReason, RateLimitTracker};

fn now_ms() -> i64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_millis() as i64
}

const MAX_EVENTS: usize = 200;

#[derive(Debug, Clone, Serialize)]
pub struct OrchestratorEvent {
    pub timestamp_ms: i64,
    pub family: String,
    pub account_id: Option<String>,
    pub kind: &'static str,
    pub detail: String,
}

/// A normalized upstream (or synthesized) HTTP outcome.
#[derive(Debug, Clone)]
pub struct UpstreamOutcome {
    pub status: u16,
    pub headers: HashMap<String, String>,
    pub body: Bytes,
}

/// Pluggable upstream HTTP client, mirroring `TokenRefreshClient`'s shape so
/// the orchestrator's loop is testable without real network I/O.
#[async_trait]
pub trait UpstreamClient: Send + Sync {
    async fn issue(
        &self,
        url: &str,
        body: &Value,
        headers: Vec<(String, String)>,
        harvester: &mut SseRateLimitHarvester,
    ) -> Result<UpstreamOutcome>;
}

pub struct HttpUpstreamClient {
    http: reqwest::Client,
}

impl HttpUpstreamClient {
    pub fn new(http: reqwest::Client) -> Self {
        Self { http }
    }
}

#[async_trait]
impl UpstreamClient for HttpUpstreamClient {
    async fn issue(
        &self,
        url: &str,
        body: &Value,
        headers: Vec<(String, String)>,
        harvester: &mut SseRateLimitHarvester,
    ) -> Result<UpstreamOutcome> {
        let mut request = self.http.post(url).json(body);
        for (name, value) in headers {
            request = request.header(name, value);
        }

        let response = request.send().await?;
        let status = response.status().as_u16();
        let response_headers: HashMap<String, String> = response
            .headers()
            .iter()
            .filter(|(name, _)| {
                let n = name.as_str();
                n.starts_with("x-codex") || n == "retry-after" || n == "retry-after-ms"
            })
            .filter_map(|(name, value)| value.to_str().ok().map(|v| (name.to_string(), v.to_string())))
            .collect();

        let mut buf = Vec::new();
        let mut body_stream = response.bytes_stream();
        while let Some(chunk) = body_stream.next().await {
            let chunk = chunk?;
            let passed = harvester.feed(chunk);
            buf.extend_from_slice(&passed);
        }

        Ok(UpstreamOutcome { status, headers: response_headers, body: Bytes::from(buf) })
    }
}

enum LoopControl {
    Return(UpstreamOutcome),
    Retry,
}

pub struct FetchOrchestrator {
    pool: Arc<Pool>,
    store: Arc<PersistentAccountStore>,
    token_client: Arc<dyn TokenRefreshClient>,
    upstream: Arc<dyn UpstreamClient>,
    catalog: Arc<ModelCatalogCache>,
    rate_limiter: Arc<RateLimitTracker>,
    scheduler: Arc<ProactiveRefreshScheduler>,
    backoff_config: BackoffConfig,
    upstream_base_url: String,
    auth_failure_cooldown_ms: i64,
    token_refresh_skew_ms: i64,
    events: RwLock<Vec<OrchestratorEvent>>,
}

impl FetchOrchestrator {
    pub fn new(
        pool: Arc<Pool>,
        store: Arc<PersistentAccountStore>,
        token_client: Arc<dyn TokenRefreshClient>,
        upstream: Arc<dyn UpstreamClient>,
        catalog: Arc<ModelCatalogCache>,
        rate_limiter: Arc<RateLimitTracker>,
        scheduler: Arc<ProactiveRefreshScheduler>,
        config: &Config,
    ) -> Self {
        Self {
            pool,
            store,
            token_client,
            upstream,
            catalog,
            rate_limiter,
            scheduler,
            backoff_config: config.backoff.clone(),
            upstream_base_url: config.upstream_base_url.clone(),
            auth_failure_cooldown_ms: config.auth_failure_cooldown_ms as i64,
            token_refresh_skew_ms: config.token_refresh_skew_ms,
            events: RwLock::new(Vec::new()),
        }
    }

    pub async fn recent_events(&self, limit: usize) -> Vec<OrchestratorEvent> {
        let events = self.events.read().await;
        let start = events.len().saturating_sub(limit);
        events[start..].to_vec()
    }

    async fn record_event(&self, family: &str, account_id: Option<String>, kind: &'static str, detail: String) {
        let mut events = self.events.write().await;
        events.push(OrchestratorEvent { timestamp_ms: now_ms(), family: family.to_string(), account_id, kind, detail });
        if events.len() > MAX_EVENTS {
            let excess = events.len() - MAX_EVENTS;
            events.drain(..excess);
        }
    }

    /// Drive one inbound request through the full select -> refresh -> issue
    /// -> classify -> (sleep|switch)* loop, ending in a real response or a
    /// synthesized all-accounts-unavailable diagnostic.
    pub async fn fetch(&self, body: Value) -> Result<UpstreamOutcome> {
        let prepared = transform::extract(&body)?;
        let requested_effort = prepared
            .requested_effort
            .as_ref()
            .map(|e| transform::coerce_effort(e, &prepared.model));

        let defaults = self
            .catalog
            .get_runtime_defaults(&prepared.model, None, false, requested_effort.as_deref())
            .await?;
        let transformed_body =
            transform::transform_body(body, &defaults.reasoning_level, defaults.base_instructions.as_deref());

        let mut outer_retries = 0u32;

        loop {
            match self.pool.select(&prepared.family, Some(prepared.model.as_str())).await {
                Ok(selected) => match self.attempt(&prepared, &transformed_body, selected).await? {
                    LoopControl::Return(outcome) => return Ok(outcome),
                    LoopControl::Retry => continue,
                },
                Err(CoreError::PoolExhausted(_)) => {
                    let min_wait = self.pool.min_wait_for_family(&prepared.family, Some(prepared.model.as_str())).await;
                    if self.backoff_config.retry_all_accounts_rate_limited
                        && outer_retries < self.backoff_config.retry_all_accounts_max_retries
                        && min_wait <= self.backoff_config.retry_all_accounts_max_wait_ms as i64
                    {
                        outer_retries += 1;
                        info!(min_wait, outer_retries, "pool exhausted, waiting for earliest reset");
                        tokio::time::sleep(Duration::from_millis(min_wait.max(0) as u64)).await;
                        continue;
                    }
                    let accounts = self.pool.snapshot().await;
                    let diagnostic = diagnostic::build(&accounts, now_ms());
                    self.record_event(&prepared.family, None, "exhausted", "all accounts unavailable".to_string()).await;
                    let body = serde_json::to_vec(&diagnostic)
                        .unwrap_or_else(|_| b"{\"error\":\"all_accounts_unavailable\"}".to_vec());
                    return Ok(UpstreamOutcome { status: 429, headers: HashMap::new(), body: Bytes::from(body) });
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn attempt(
        &self,
        prepared: &transform::PreparedRequest,
        body: &Value,
        selected: crate::account::pool::SelectedAccount,
    ) -> Result<LoopControl> {
        let now = now_ms();
        let access_token = match self.ensure_token(selected.index, &selected.account, now).await {
            Ok(token) => token,
            Err(CoreError::AuthFailure(_)) => return Ok(LoopControl::Retry),
            Err(e) => return Err(e),
        };

        let headers = build_headers(&access_token, &selected.account);
        let captured: Arc<StdMutex<Vec<HarvestedRateLimits>>> = Arc::new(StdMutex::new(Vec::new()));
        let captured_for_closure = captured.clone();
        let mut harvester = SseRateLimitHarvester::new(Box::new(move |limits| {
            captured_for_closure.lock().unwrap().push(limits);
        }));

        let url = format!("{}/codex/responses", self.upstream_base_url);
        let outcome = self.upstream.issue(&url, body, headers, &mut harvester).await;

        match outcome {
            Ok(resp) if resp.status / 100 == 2 => {
                self.pool.mark_used(selected.index).await?;
                Ok(LoopControl::Return(resp))
            }
            Ok(resp) if resp.status == 429 => {
                self.handle_rate_limit(prepared, selected.index, &selected.account, &resp, captured).await
            }
            Ok(resp) => {
                self.pool.record_failure(selected.index).await?;
                Ok(LoopControl::Return(resp))
            }
            Err(CoreError::Transport(e)) => {
                self.pool.record_failure(selected.index).await?;
                Err(CoreError::Transport(e))
            }
            Err(e) => Err(e),
        }
    }

    async fn ensure_token(&self, index: usize, account: &Account, now: i64) -> Result<String> {
        let hard_expired = should_refresh(account.access_token.as_deref(), account.expires_at, 0, now);
        if !hard_expired {
            let near_expiry =
                should_refresh(account.access_token.as_deref(), account.expires_at, self.token_refresh_skew_ms, now);
            if near_expiry {
                self.scheduler.enqueue(index).await;
            }
            return Ok(account.access_token.clone().unwrap_or_default());
        }

        match self.token_client.refresh(&account.refresh_token).await {
            Ok(tokens) => {
                self.pool
                    .update_tokens(index, tokens.access_token.clone(), tokens.refresh_token, tokens.expires_at)
                    .await?;
                self.pool.persist(&self.store).await?;
                Ok(tokens.access_token)
            }
            Err(CoreError::AuthFailure(msg)) => {
                warn!(index, error = %msg, "token refresh failed, cooling down account");
                self.pool
                    .mark_account_cooling_down(index, self.auth_failure_cooldown_ms, CooldownReason::AuthFailure)
                    .await?;
                self.pool.persist(&self.store).await?;
                Err(CoreError::AuthFailure(msg))
            }
            Err(e) => Err(e),
        }
    }

    async fn handle_rate_limit(
        &self,
        prepared: &transform::PreparedRequest,
        index: usize,
        account: &Account,
        resp: &UpstreamOutcome,
        captured: Arc<StdMutex<Vec<HarvestedRateLimits>>>,
    ) -> Result<LoopControl> {
        let harvested = captured.lock().unwrap().first().cloned();
        let header_retry_ms = resp
            .headers
            .get("retry-after-ms")
            .and_then(|v| v.parse::<i64>().ok())
            .or_else(|| resp.headers.get("retry-after").and_then(|v| v.parse::<i64>().ok()).map(|secs| secs * 1000));
        let retry_after_ms = harvested.as_ref().and_then(|h| h.retry_after_ms).or(header_retry_ms);
        let reason = match harvested.as_ref().and_then(|h| h.reason.as_deref()) {
            Some("weekly") => RateLimitReason::Weekly,
            _ => RateLimitReason::Standard,
        };

        let key = format!("{}|{}", account.stable_key(), quota_key(&prepared.family, Some(prepared.model.as_str())));
        let backoff = self.rate_limiter.get_backoff(&key, reason, retry_after_ms);

        self.pool.mark_rate_limited(index, backoff.delay_ms, &prepared.family, Some(prepared.model.as_str())).await?;
        self.pool.record_rate_limit_health(index).await?;
        if !backoff.is_duplicate {
            self.record_event(
                &prepared.family,
                account.account_id.clone(),
                "rate-limited",
                format!("delay_ms={} attempt={}", backoff.delay_ms, backoff.attempt),
            )
            .await;
        }

        let decision = decide(&self.backoff_config, self.pool.len().await, backoff.attempt, backoff.delay_ms);
        match decision.action {
            DeciderAction::Wait => {
                debug!(delay_ms = decision.delay_ms, "waiting out backoff on current account");
                tokio::time::sleep(Duration::from_millis(decision.delay_ms.max(0) as u64)).await;
            }
            DeciderAction::Switch => {
                debug!("switching away from rate-limited account");
            }
        }
        Ok(LoopControl::Retry)
    }
}

fn build_headers(access_token: &str, account: &Account) -> Vec<(String, String)> {
    let mut headers = vec![
        ("Authorization".to_string(), format!("Bearer {access_token}")),
        ("OpenAI-Beta".to_string(), "responses=experimental".to_string()),
        ("originator".to_string(), "codex_cli_rs".to_string()),
    ];
    if let Some(account_id) = &account.account_id {
        headers.push(("chatgpt-account-id".to_string(), account_id.clone()));
    }
    headers
}
