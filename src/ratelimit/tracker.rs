//! Rate-Limit Tracker: deduplicated exponential backoff keyed by
//! (account, family, model).

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use rand::Rng;

use crate::config::BackoffConfig;

fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

/// Signals a longer vendor quota window than the default retry, so the base
/// delay is raised before the exponential growth is applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLimitReason {
    Standard,
    Weekly,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffResult {
    pub delay_ms: i64,
    pub attempt: u32,
    pub is_duplicate: bool,
}

struct Entry {
    last_attempt_ms: i64,
    attempt_count: u32,
    last_delay_ms: i64,
}

pub struct RateLimitTracker {
    config: BackoffConfig,
    entries: Mutex<HashMap<String, Entry>>,
}

impl RateLimitTracker {
    pub fn new(config: BackoffConfig) -> Self {
        Self {
            config,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn get_backoff(
        &self,
        key: &str,
        reason: RateLimitReason,
        server_retry_after_ms: Option<i64>,
    ) -> BackoffResult {
        self.get_backoff_at(key, reason, server_retry_after_ms, now_ms())
    }

    /// Same as `get_backoff` but with an explicit `now`, for deterministic tests.
    pub fn get_backoff_at(
        &self,
        key: &str,
        reason: RateLimitReason,
        server_retry_after_ms: Option<i64>,
        now: i64,
    ) -> BackoffResult {
        let mut entries = self.entries.lock().unwrap();

        if let Some(entry) = entries.get(key) {
            if now - entry.last_attempt_ms <= self.config.rate_limit_dedup_window_ms as i64 {
                return BackoffResult {
                    delay_ms: entry.last_delay_ms,
                    attempt: entry.attempt_count,
                    is_duplicate: true,
                };
            }
        }

        let reset = entries
            .get(key)
            .map(|e| now - e.last_attempt_ms > self.config.rate_limit_state_reset_ms as i64)
            .unwrap_or(true);

        let attempt = if reset {
            1
        } else {
            entries.get(key).map(|e| e.attempt_count + 1).unwrap_or(1)
        };

        let mut base = server_retry_after_ms
            .filter(|v| *v > 0)
            .unwrap_or(self.config.default_retry_after_ms as i64);
        if reason == RateLimitReason::Weekly {
            base = base.max(self.config.default_retry_after_ms as i64 * 7);
        }

        let exp = base.saturating_mul(1i64 << attempt.saturating_sub(1).min(30));
        let capped = exp.min(self.config.max_backoff_ms as i64);
        let jitter = if self.config.request_jitter_max_ms > 0 {
            rand::thread_rng().gen_range(0..=self.config.request_jitter_max_ms as i64)
        } else {
            0
        };
        let delay_ms = capped + jitter;

        entries.insert(
            key.to_string(),
            Entry {
                last_attempt_ms: now,
                attempt_count: attempt,
                last_delay_ms: delay_ms,
            },
        );

        BackoffResult {
            delay_ms,
            attempt,
            is_duplicate: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> BackoffConfig {
        BackoffConfig {
            rate_limit_dedup_window_ms: 2_000,
            rate_limit_state_reset_ms: 120_000,
            default_retry_after_ms: 60_000,
            max_backoff_ms: 120_000,
            request_jitter_max_ms: 0,
            ..Default::default()
        }
    }

    // Scenario 4: dedup backoff.
    #[test]
    fn dedup_window_returns_same_delay() {
        let tracker = RateLimitTracker::new(config());
        let first = tracker.get_backoff_at("acct:codex", RateLimitReason::Standard, Some(10_000), 0);
        let second = tracker.get_backoff_at("acct:codex", RateLimitReason::Standard, Some(10_000), 1_500);

        assert_eq!(first.delay_ms, second.delay_ms);
        assert!(!first.is_duplicate);
        assert!(second.is_duplicate);
    }

    // Scenario 5: backoff reset.
    #[test]
    fn reset_after_inactivity_window() {
        let tracker = RateLimitTracker::new(config());
        let first = tracker.get_backoff_at("acct:codex", RateLimitReason::Standard, Some(10_000), 0);
        assert_eq!(first.attempt, 1);

        let after_reset = tracker.get_backoff_at("acct:codex", RateLimitReason::Standard, Some(10_000), 121_000);
        assert_eq!(after_reset.attempt, 1);
        assert!(!after_reset.is_duplicate);
    }

    #[test]
    fn attempt_increments_within_growth_window() {
        let tracker = RateLimitTracker::new(config());
        let first = tracker.get_backoff_at("k", RateLimitReason::Standard, Some(1_000), 0);
        let second = tracker.get_backoff_at("k", RateLimitReason::Standard, Some(1_000), 10_000);
        assert_eq!(first.attempt, 1);
        assert_eq!(second.attempt, 2);
        assert!(second.delay_ms >= first.delay_ms);
    }

    #[test]
    fn delay_capped_at_max_backoff() {
        let tracker = RateLimitTracker::new(config());
        let mut t = 0i64;
        let mut last = BackoffResult { delay_ms: 0, attempt: 0, is_duplicate: false };
        for _ in 0..10 {
            last = tracker.get_backoff_at("k", RateLimitReason::Standard, Some(60_000), t);
            t += 3_000;
        }
        assert!(last.delay_ms <= 120_000);
    }

    #[test]
    fn default_base_used_when_no_server_value() {
        let tracker = RateLimitTracker::new(config());
        let result = tracker.get_backoff_at("k", RateLimitReason::Standard, None, 0);
        assert_eq!(result.delay_ms, 60_000);
    }
}
