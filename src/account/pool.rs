//! Account Pool & Selector: the in-memory view over the persisted accounts,
//! selection strategies (sticky, round-robin, hybrid), cooldown/rate-limit
//! bookkeeping, and the one-shot PID-offset rotation.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex as StdMutex;
use std::time::{SystemTime, UNIX_EPOCH};

use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::account::health::{HealthScoreTracker, TokenBucketTracker};
use crate::account::store::PersistentAccountStore;
use crate::account::types::{quota_key, quota_keys_to_write, Account, CooldownReason, FamilyName, LastSwitchReason, StorageDocument};
use crate::config::SelectionStrategy;
use crate::error::{CoreError, Result};

fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

/// A read-only copy of the account state the selector chose, plus its index
/// so the caller can re-resolve the live record for mutation.
#[derive(Debug, Clone)]
pub struct SelectedAccount {
    pub index: usize,
    pub account: Account,
}

pub struct Pool {
    accounts: RwLock<Vec<Account>>,
    current_index_by_family: RwLock<HashMap<FamilyName, usize>>,
    round_robin_cursor_by_family: RwLock<HashMap<FamilyName, usize>>,
    pid_offset_applied: RwLock<HashSet<FamilyName>>,
    health: StdMutex<HealthScoreTracker>,
    token_bucket: StdMutex<TokenBucketTracker>,
    strategy: SelectionStrategy,
    pid_offset_enabled: bool,
    pid: u32,
}

impl Pool {
    pub fn new(accounts: Vec<Account>, strategy: SelectionStrategy, pid_offset_enabled: bool, pid: u32) -> Self {
        Self {
            accounts: RwLock::new(accounts),
            current_index_by_family: RwLock::new(HashMap::new()),
            round_robin_cursor_by_family: RwLock::new(HashMap::new()),
            pid_offset_applied: RwLock::new(HashSet::new()),
            health: StdMutex::new(HealthScoreTracker::new()),
            token_bucket: StdMutex::new(TokenBucketTracker::new()),
            strategy,
            pid_offset_enabled,
            pid,
        }
    }

    pub fn from_document(doc: &StorageDocument, strategy: SelectionStrategy, pid_offset_enabled: bool, pid: u32) -> Self {
        Self::new(doc.accounts.clone(), strategy, pid_offset_enabled, pid)
    }

    /// Deep copy of the current document, for persistence.
    pub async fn to_document(&self) -> StorageDocument {
        let accounts = self.accounts.read().await.clone();
        let active_index_by_family = self.current_index_by_family.read().await.clone();
        StorageDocument {
            version: crate::account::types::STORAGE_VERSION,
            active_index: 0,
            accounts,
            active_index_by_family,
        }
    }

    /// Persist in-memory state via identity-merge, never a wholesale
    /// overwrite: a concurrent process may have appended an account to disk
    /// since this pool last loaded, and a plain `save` would discard it.
    pub async fn persist(&self, store: &PersistentAccountStore) -> Result<()> {
        let accounts = self.accounts.read().await.clone();
        let active_index_by_family = self.current_index_by_family.read().await.clone();
        store.update_with_lock(move |mut doc| {
            for account in accounts {
                doc.merge_account(account);
            }
            doc.active_index_by_family = active_index_by_family;
            Ok(doc)
        })?;
        Ok(())
    }

    /// Read-only snapshot of all accounts (deep-copied rate-limit maps).
    pub async fn snapshot(&self) -> Vec<Account> {
        self.accounts.read().await.clone()
    }

    fn eligible(account: &Account, family: &str, model: Option<&str>, now: i64) -> bool {
        if !account.enabled {
            return false;
        }
        if let Some(until) = account.cooling_down_until {
            if until > now {
                return false;
            }
        }
        for key in [quota_key(family, None), quota_key(family, model)] {
            if let Some(reset_at) = account.rate_limit_reset_times.get(&key) {
                if *reset_at > now {
                    return false;
                }
            }
        }
        true
    }

    async fn apply_pid_offset_once(&self, family: &str, n: usize) -> Option<usize> {
        if !self.pid_offset_enabled || n == 0 {
            return None;
        }
        let mut applied = self.pid_offset_applied.write().await;
        if applied.contains(family) {
            return None;
        }
        applied.insert(family.to_string());
        Some((self.pid as usize) % n)
    }

    /// Select an account for `family` (optionally scoped to `model`) according
    /// to the configured strategy.
    pub async fn select(&self, family: &str, model: Option<&str>) -> Result<SelectedAccount> {
        match self.strategy {
            SelectionStrategy::Sticky => self.select_sticky(family, model).await,
            SelectionStrategy::RoundRobin => self.select_round_robin(family, model).await,
            SelectionStrategy::Hybrid => self.select_hybrid(family, model).await,
        }
    }

    async fn select_sticky(&self, family: &str, model: Option<&str>) -> Result<SelectedAccount> {
        let now = now_ms();
        let accounts = self.accounts.read().await;
        let n = accounts.len();
        if n == 0 {
            return Err(CoreError::PoolExhausted(self.exhausted_message(&accounts, now)));
        }

        let pid_offset = self.apply_pid_offset_once(family, n).await;
        let mut current = {
            let map = self.current_index_by_family.read().await;
            map.get(family).copied().unwrap_or(pid_offset.unwrap_or(0))
        };

        if Self::eligible(&accounts[current], family, model, now) {
            debug!(family, index = current, "sticky: staying on current account");
            return Ok(SelectedAccount { index: current, account: accounts[current].clone() });
        }

        for offset in 1..=n {
            let idx = (current + offset) % n;
            if Self::eligible(&accounts[idx], family, model, now) {
                current = idx;
                self.current_index_by_family.write().await.insert(family.to_string(), current);
                info!(family, index = current, "sticky: switching to next eligible account");
                return Ok(SelectedAccount { index: current, account: accounts[current].clone() });
            }
        }

        Err(CoreError::PoolExhausted(self.exhausted_message(&accounts, now)))
    }

    async fn select_round_robin(&self, family: &str, model: Option<&str>) -> Result<SelectedAccount> {
        let now = now_ms();
        let accounts = self.accounts.read().await;
        let n = accounts.len();
        if n == 0 {
            return Err(CoreError::PoolExhausted(self.exhausted_message(&accounts, now)));
        }

        let pid_offset = self.apply_pid_offset_once(family, n).await;
        let start = {
            let mut cursors = self.round_robin_cursor_by_family.write().await;
            let entry = cursors.entry(family.to_string()).or_insert(pid_offset.unwrap_or(0));
            let start = *entry;
            *entry = (start + 1) % n;
            start
        };

        for offset in 0..n {
            let idx = (start + offset) % n;
            if Self::eligible(&accounts[idx], family, model, now) {
                debug!(family, index = idx, "round-robin: selected");
                return Ok(SelectedAccount { index: idx, account: accounts[idx].clone() });
            }
        }

        Err(CoreError::PoolExhausted(self.exhausted_message(&accounts, now)))
    }

    async fn select_hybrid(&self, family: &str, model: Option<&str>) -> Result<SelectedAccount> {
        const STICKINESS_BONUS: f64 = 5.0;
        const FRESHNESS_CAP_SECS: f64 = 3600.0;

        let now = now_ms();
        let accounts = self.accounts.read().await;
        let n = accounts.len();
        if n == 0 {
            return Err(CoreError::PoolExhausted(self.exhausted_message(&accounts, now)));
        }
        self.apply_pid_offset_once(family, n).await;
        let current = self.current_index_by_family.read().await.get(family).copied();

        let mut best: Option<(usize, f64)> = None;
        {
            let mut health = self.health.lock().unwrap();
            let mut buckets = self.token_bucket.lock().unwrap();
            for (idx, account) in accounts.iter().enumerate() {
                if !Self::eligible(account, family, model, now) {
                    continue;
                }
                let key = account.stable_key();
                if !buckets.has_token(&key) {
                    continue;
                }
                let health_score = health.score(&key);
                let freshness_secs = ((now - account.last_used).max(0) as f64 / 1000.0).min(FRESHNESS_CAP_SECS);
                let mut score = health_score + freshness_secs / 60.0;
                if current == Some(idx) {
                    score += STICKINESS_BONUS;
                }
                if best.map(|(_, s)| score > s).unwrap_or(true) {
                    best = Some((idx, score));
                }
            }
        }

        match best {
            Some((idx, _)) => {
                let key = accounts[idx].stable_key();
                self.token_bucket.lock().unwrap().consume(&key);
                self.current_index_by_family.write().await.insert(family.to_string(), idx);
                debug!(family, index = idx, "hybrid: selected");
                Ok(SelectedAccount { index: idx, account: accounts[idx].clone() })
            }
            None => Err(CoreError::PoolExhausted(self.exhausted_message(&accounts, now))),
        }
    }

    fn exhausted_message(&self, accounts: &[Account], now: i64) -> String {
        let total = accounts.len();
        let mut available = 0usize;
        let mut cooling = 0usize;
        let mut disabled = 0usize;
        for a in accounts {
            if !a.enabled {
                disabled += 1;
            } else if a.cooling_down_until.map(|u| u > now).unwrap_or(false) {
                cooling += 1;
            } else {
                available += 1;
            }
        }
        serde_json::json!({
            "error": {
                "type": "pool_exhausted",
                "message": "All accounts are rate-limited or cooling down",
                "pool": {
                    "accounts_total": total,
                    "accounts_available": available,
                    "accounts_cooling_down": cooling,
                    "accounts_disabled": disabled,
                }
            }
        })
        .to_string()
    }

    /// Mark rate-limited for `(family, model)`: writes reset timers under both
    /// the base and fine-grained quota keys (deduped when identical).
    pub async fn mark_rate_limited(&self, index: usize, retry_after_ms: i64, family: &str, model: Option<&str>) -> Result<()> {
        let mut accounts = self.accounts.write().await;
        let account = accounts.get_mut(index).ok_or_else(|| CoreError::StorageCorrupt("account index out of range".into()))?;
        let reset_at = now_ms() + retry_after_ms.max(0);
        for key in quota_keys_to_write(family, model) {
            account.rate_limit_reset_times.insert(key, reset_at);
        }
        account.last_switch_reason = Some(LastSwitchReason::RateLimit);
        warn!(index, family, retry_after_ms, "account marked rate-limited");
        Ok(())
    }

    pub async fn mark_account_cooling_down(&self, index: usize, ms: i64, reason: CooldownReason) -> Result<()> {
        let mut accounts = self.accounts.write().await;
        let account = accounts.get_mut(index).ok_or_else(|| CoreError::StorageCorrupt("account index out of range".into()))?;
        account.cooling_down_until = Some(now_ms() + ms.max(0));
        account.cooldown_reason = Some(reason);
        warn!(index, ms, "account cooling down");
        Ok(())
    }

    pub async fn mark_used(&self, index: usize) -> Result<()> {
        let mut accounts = self.accounts.write().await;
        let account = accounts.get_mut(index).ok_or_else(|| CoreError::StorageCorrupt("account index out of range".into()))?;
        account.last_used = now_ms();
        let key = account.stable_key();
        self.health.lock().unwrap().record_success(&key);
        Ok(())
    }

    pub async fn record_failure(&self, index: usize) -> Result<()> {
        let accounts = self.accounts.read().await;
        let account = accounts.get(index).ok_or_else(|| CoreError::StorageCorrupt("account index out of range".into()))?;
        let key = account.stable_key();
        self.health.lock().unwrap().record_failure(&key);
        Ok(())
    }

    pub async fn record_rate_limit_health(&self, index: usize) -> Result<()> {
        let accounts = self.accounts.read().await;
        let account = accounts.get(index).ok_or_else(|| CoreError::StorageCorrupt("account index out of range".into()))?;
        let key = account.stable_key();
        self.health.lock().unwrap().record_rate_limit(&key);
        Ok(())
    }

    /// Update the access/refresh token triple for an account after a successful
    /// OAuth refresh.
    pub async fn update_tokens(&self, index: usize, access_token: String, refresh_token: String, expires_at: i64) -> Result<()> {
        let mut accounts = self.accounts.write().await;
        let account = accounts.get_mut(index).ok_or_else(|| CoreError::StorageCorrupt("account index out of range".into()))?;
        account.access_token = Some(access_token);
        account.refresh_token = refresh_token;
        account.expires_at = Some(expires_at);
        Ok(())
    }

    pub async fn disable(&self, index: usize) -> Result<()> {
        let mut accounts = self.accounts.write().await;
        let account = accounts.get_mut(index).ok_or_else(|| CoreError::StorageCorrupt("account index out of range".into()))?;
        account.enabled = false;
        warn!(index, "account disabled");
        Ok(())
    }

    /// 0 if any account is eligible for `(family, model)`; otherwise the
    /// minimum time until the earliest reset/cooldown across relevant keys.
    pub async fn min_wait_for_family(&self, family: &str, model: Option<&str>) -> i64 {
        let now = now_ms();
        let accounts = self.accounts.read().await;
        let mut min_wait: Option<i64> = None;
        for account in accounts.iter() {
            if !account.enabled {
                continue;
            }
            if Self::eligible(account, family, model, now) {
                return 0;
            }
            let mut candidate = i64::MAX;
            if let Some(until) = account.cooling_down_until {
                candidate = candidate.min((until - now).max(0));
            }
            for key in [quota_key(family, None), quota_key(family, model)] {
                if let Some(reset_at) = account.rate_limit_reset_times.get(&key) {
                    candidate = candidate.min((*reset_at - now).max(0));
                }
            }
            if candidate != i64::MAX {
                min_wait = Some(min_wait.map(|m| m.min(candidate)).unwrap_or(candidate));
            }
        }
        min_wait.unwrap_or(0)
    }

    pub async fn len(&self) -> usize {
        self.accounts.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap as Map;

    fn account(id: &str) -> Account {
        Account {
            refresh_token: format!("rt-{id}"),
            account_id: Some(id.to_string()),
            email: Some(format!("{id}@example.com")),
            plan: Some(crate::account::types::Plan::Pro),
            enabled: true,
            added_at: 0,
            last_used: 0,
            last_switch_reason: None,
            rate_limit_reset_times: Map::new(),
            cooling_down_until: None,
            cooldown_reason: None,
            access_token: Some("at".into()),
            expires_at: None,
            notes: None,
        }
    }

    // Scenario 1: sticky + rate limit switches.
    #[tokio::test]
    async fn sticky_switches_after_rate_limit() {
        let pool = Pool::new(vec![account("a0"), account("a1")], SelectionStrategy::Sticky, false, 1);
        let s = pool.select("codex", None).await.unwrap();
        assert_eq!(s.index, 0);

        pool.mark_rate_limited(0, 60_000, "codex", None).await.unwrap();

        let s2 = pool.select("codex", None).await.unwrap();
        assert_eq!(s2.index, 1);
    }

    // Scenario 2: PID offset.
    #[tokio::test]
    async fn pid_offset_applied_once_per_family() {
        let pool = Pool::new(vec![account("a0"), account("a1"), account("a2")], SelectionStrategy::Sticky, true, 1);
        let s1 = pool.select("codex", None).await.unwrap();
        assert_eq!(s1.index, 1);
        let s2 = pool.select("codex", None).await.unwrap();
        assert_eq!(s2.index, 1);
    }

    // Scenario 3: round-robin.
    #[tokio::test]
    async fn round_robin_with_pid_offset_cycles() {
        let pool = Pool::new(vec![account("a0"), account("a1"), account("a2")], SelectionStrategy::RoundRobin, true, 1);
        let s1 = pool.select("codex", None).await.unwrap();
        let s2 = pool.select("codex", None).await.unwrap();
        let s3 = pool.select("codex", None).await.unwrap();
        assert_eq!([s1.index, s2.index, s3.index], [1, 2, 0]);
    }

    #[tokio::test]
    async fn disabled_accounts_never_selected() {
        let pool = Pool::new(vec![account("a0"), account("a1")], SelectionStrategy::Sticky, false, 1);
        pool.disable(0).await.unwrap();
        let s = pool.select("codex", None).await.unwrap();
        assert_eq!(s.index, 1);
    }

    #[tokio::test]
    async fn empty_pool_is_exhausted() {
        let pool = Pool::new(vec![], SelectionStrategy::Sticky, false, 1);
        let err = pool.select("codex", None).await.unwrap_err();
        assert!(err.to_string().contains("pool exhausted"));
    }

    #[tokio::test]
    async fn min_wait_for_family_zero_when_eligible() {
        let pool = Pool::new(vec![account("a0")], SelectionStrategy::Sticky, false, 1);
        assert_eq!(pool.min_wait_for_family("codex", None).await, 0);
    }

    #[tokio::test]
    async fn min_wait_for_family_positive_when_all_blocked() {
        let pool = Pool::new(vec![account("a0")], SelectionStrategy::Sticky, false, 1);
        pool.mark_rate_limited(0, 60_000, "codex", None).await.unwrap();
        let wait = pool.min_wait_for_family("codex", None).await;
        assert!(wait > 0 && wait <= 60_000);
    }
}
