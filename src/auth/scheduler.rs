//! Proactive Refresh Scheduler: a background timer that refreshes tokens
//! before they expire, so the request path rarely pays refresh latency.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex as TokioMutex;
use tracing::{debug, info, warn};

use crate::account::{CooldownReason, Pool};
use crate::account::store::PersistentAccountStore;
use crate::auth::refresh::TokenRefreshClient;
use crate::error::CoreError;

pub struct ProactiveRefreshScheduler {
    pool: Arc<Pool>,
    store: Arc<PersistentAccountStore>,
    client: Arc<dyn TokenRefreshClient>,
    interval: Duration,
    queue_interval: Duration,
    buffer_ms: i64,
    auth_failure_cooldown_ms: i64,
    stopped: Arc<AtomicBool>,
    in_flight: Arc<TokioMutex<HashSet<usize>>>,
    queue: Arc<TokioMutex<HashSet<usize>>>,
}

impl ProactiveRefreshScheduler {
    pub fn new(
        pool: Arc<Pool>,
        store: Arc<PersistentAccountStore>,
        client: Arc<dyn TokenRefreshClient>,
        interval_ms: u64,
        buffer_ms: u64,
        auth_failure_cooldown_ms: u64,
        queue_interval_ms: u64,
    ) -> Self {
        Self {
            pool,
            store,
            client,
            interval: Duration::from_millis(interval_ms),
            queue_interval: Duration::from_millis(queue_interval_ms),
            buffer_ms: buffer_ms as i64,
            auth_failure_cooldown_ms: auth_failure_cooldown_ms as i64,
            stopped: Arc::new(AtomicBool::new(false)),
            in_flight: Arc::new(TokioMutex::new(HashSet::new())),
            queue: Arc::new(TokioMutex::new(HashSet::new())),
        }
    }

    /// Called by the orchestrator when a token is near expiry but not yet
    /// hard-expired: request a refresh without blocking the in-flight
    /// request, which keeps serving the current access token.
    pub async fn enqueue(&self, index: usize) {
        self.queue.lock().await.insert(index);
    }

    async fn drain_queue(&self) {
        let pending: Vec<usize> = {
            let mut queue = self.queue.lock().await;
            queue.drain().collect()
        };
        if pending.is_empty() {
            return;
        }
        let accounts = self.pool.snapshot().await;
        for index in pending {
            let Some(account) = accounts.get(index) else { continue };
            {
                let mut in_flight = self.in_flight.lock().await;
                if in_flight.contains(&index) {
                    continue;
                }
                in_flight.insert(index);
            }
            self.refresh_one(index, &account.refresh_token).await;
            self.in_flight.lock().await.remove(&index);
        }
    }

    /// Spawn the background timer. Runs the full-sweep ticker (catches
    /// accounts nobody requested recently) and the queue-drain ticker
    /// (services `enqueue`d near-expiry refreshes promptly) concurrently.
    /// Cancellation is via `stop()`, which is idempotent and safe to call on
    /// loader reload.
    pub fn spawn(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.tick().await; // skip the immediate first tick; accounts were just loaded
            let mut queue_ticker = tokio::time::interval(self.queue_interval);
            queue_ticker.tick().await;

            loop {
                if self.stopped.load(Ordering::SeqCst) {
                    break;
                }
                tokio::select! {
                    _ = ticker.tick() => {
                        if self.stopped.load(Ordering::SeqCst) {
                            break;
                        }
                        self.run_cycle().await;
                    }
                    _ = queue_ticker.tick() => {
                        if self.stopped.load(Ordering::SeqCst) {
                            break;
                        }
                        self.drain_queue().await;
                    }
                }
            }
        })
    }

    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }

    async fn run_cycle(&self) {
        let accounts = self.pool.snapshot().await;
        let now = now_ms();

        for (index, account) in accounts.iter().enumerate() {
            if !account.enabled {
                continue;
            }
            let expiring = match account.expires_at {
                None => true,
                Some(expires_at) => expires_at - now <= self.buffer_ms,
            };
            if !expiring {
                continue;
            }

            {
                let mut in_flight = self.in_flight.lock().await;
                if in_flight.contains(&index) {
                    continue; // duplicate enqueue collapses
                }
                in_flight.insert(index);
            }

            self.refresh_one(index, &account.refresh_token).await;
            self.in_flight.lock().await.remove(&index);
        }
    }

    async fn refresh_one(&self, index: usize, refresh_token: &str) {
        debug!(index, "token expiring within buffer, refreshing");
        match self.client.refresh(refresh_token).await {
            Ok(tokens) => {
                if let Err(e) = self
                    .pool
                    .update_tokens(index, tokens.access_token, tokens.refresh_token, tokens.expires_at)
                    .await
                {
                    warn!(index, error = %e, "failed to apply refreshed token to pool");
                    return;
                }
                if let Err(e) = self.pool.persist(&self.store).await {
                    warn!(index, error = %e, "failed to persist refreshed token");
                }
                info!(index, "background token refresh succeeded");
            }
            Err(CoreError::AuthFailure(msg)) => {
                warn!(index, error = %msg, "refresh token rejected, cooling down account");
                let _ = self
                    .pool
                    .mark_account_cooling_down(index, self.auth_failure_cooldown_ms, CooldownReason::AuthFailure)
                    .await;
                let _ = self.pool.persist(&self.store).await;
            }
            Err(e) => {
                warn!(index, error = %e, "background refresh failed (transient), will retry next cycle");
            }
        }
    }
}

fn now_ms() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_millis() as i64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::account::types::{Account, Plan};
    use crate::config::SelectionStrategy;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::atomic::AtomicUsize;
    use tempfile::tempdir;

    struct FakeClient {
        calls: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl TokenRefreshClient for FakeClient {
        async fn refresh(&self, _refresh_token: &str) -> crate::error::Result<crate::auth::refresh::RefreshedTokens> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(CoreError::AuthFailure("denied".into()));
            }
            Ok(crate::auth::refresh::RefreshedTokens {
                access_token: "new-access".into(),
                refresh_token: "new-refresh".into(),
                expires_at: now_ms() + 3_600_000,
                id_token: None,
            })
        }
    }

    fn account(id: &str, expires_at: Option<i64>) -> Account {
        Account {
            refresh_token: format!("rt-{id}"),
            account_id: Some(id.to_string()),
            email: Some(format!("{id}@example.com")),
            plan: Some(Plan::Pro),
            enabled: true,
            added_at: 0,
            last_used: 0,
            last_switch_reason: None,
            rate_limit_reset_times: HashMap::new(),
            cooling_down_until: None,
            cooldown_reason: None,
            access_token: Some("old".into()),
            expires_at,
            notes: None,
        }
    }

    #[tokio::test]
    async fn skips_accounts_not_expiring_soon() {
        let dir = tempdir().unwrap();
        let store = Arc::new(PersistentAccountStore::new(dir.path().join("accounts.json")));
        let pool = Arc::new(Pool::new(vec![account("a", Some(now_ms() + 3_600_000))], SelectionStrategy::Sticky, false, 1));
        let client = Arc::new(FakeClient { calls: AtomicUsize::new(0), fail: false });
        let scheduler = ProactiveRefreshScheduler::new(pool.clone(), store, client.clone(), 1_000, 300_000, 60_000, 250);

        scheduler.run_cycle().await;
        assert_eq!(client.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn refreshes_expiring_account_and_persists() {
        let dir = tempdir().unwrap();
        let store = Arc::new(PersistentAccountStore::new(dir.path().join("accounts.json")));
        let pool = Arc::new(Pool::new(vec![account("a", Some(now_ms() + 1_000))], SelectionStrategy::Sticky, false, 1));
        let client = Arc::new(FakeClient { calls: AtomicUsize::new(0), fail: false });
        let scheduler = ProactiveRefreshScheduler::new(pool.clone(), store.clone(), client.clone(), 1_000, 300_000, 60_000, 250);

        scheduler.run_cycle().await;
        assert_eq!(client.calls.load(Ordering::SeqCst), 1);

        let reloaded = store.load().unwrap();
        assert_eq!(reloaded.accounts[0].access_token, Some("new-access".to_string()));
    }

    #[tokio::test]
    async fn auth_failure_cools_down_account() {
        let dir = tempdir().unwrap();
        let store = Arc::new(PersistentAccountStore::new(dir.path().join("accounts.json")));
        let pool = Arc::new(Pool::new(vec![account("a", Some(now_ms() + 1_000))], SelectionStrategy::Sticky, false, 1));
        let client = Arc::new(FakeClient { calls: AtomicUsize::new(0), fail: true });
        let scheduler = ProactiveRefreshScheduler::new(pool.clone(), store, client, 1_000, 300_000, 60_000, 250);

        scheduler.run_cycle().await;
        let snapshot = pool.snapshot().await;
        assert!(snapshot[0].cooling_down_until.is_some());
    }

    #[tokio::test]
    async fn stop_is_idempotent() {
        let dir = tempdir().unwrap();
        let store = Arc::new(PersistentAccountStore::new(dir.path().join("accounts.json")));
        let pool = Arc::new(Pool::new(vec![], SelectionStrategy::Sticky, false, 1));
        let client = Arc::new(FakeClient { calls: AtomicUsize::new(0), fail: false });
        let scheduler = ProactiveRefreshScheduler::new(pool, store, client, 1_000, 300_000, 60_000, 250);
        scheduler.stop();
        scheduler.stop();
        assert!(scheduler.stopped.load(Ordering::SeqCst));
    }
}
