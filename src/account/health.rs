//! Health score and token bucket trackers for the hybrid selection strategy.
//!
//! Both are keyed by an account's stable key (see `Account::stable_key`), are
//! process-local singletons, and are mutated without locks because the only
//! consumer is the orchestrator on the same event loop. Entries idle for the
//! eviction window are dropped lazily on next touch.

use std::collections::HashMap;
use std::time::{Duration, Instant};

const HEALTH_EVICT_AFTER: Duration = Duration::from_secs(24 * 3600);
const BUCKET_EVICT_AFTER: Duration = Duration::from_secs(3600);

const SUCCESS_DELTA: f64 = 1.0;
const RATE_LIMIT_DELTA: f64 = -10.0;
const FAILURE_DELTA: f64 = -20.0;
/// Linear recovery rate: points per second of rest.
const RECOVERY_PER_SEC: f64 = 0.05;

const BUCKET_INITIAL: f64 = 50.0;
const BUCKET_MAX: f64 = 50.0;
/// Tokens regenerated per minute.
const BUCKET_REGEN_PER_MIN: f64 = 6.0;

struct HealthEntry {
    score: f64,
    last_touched: Instant,
}

/// Rewards successes, penalizes rate limits/failures, recovers linearly with rest.
pub struct HealthScoreTracker {
    entries: HashMap<String, HealthEntry>,
}

impl HealthScoreTracker {
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }

    fn touch(&mut self, key: &str) -> &mut HealthEntry {
        let now = Instant::now();
        self.entries.retain(|_, e| now.duration_since(e.last_touched) < HEALTH_EVICT_AFTER);
        let entry = self.entries.entry(key.to_string()).or_insert(HealthEntry {
            score: 0.0,
            last_touched: now,
        });
        let elapsed = now.duration_since(entry.last_touched).as_secs_f64();
        entry.score += elapsed * RECOVERY_PER_SEC;
        entry.last_touched = now;
        entry
    }

    pub fn record_success(&mut self, key: &str) {
        self.touch(key).score += SUCCESS_DELTA;
    }

    pub fn record_rate_limit(&mut self, key: &str) {
        self.touch(key).score += RATE_LIMIT_DELTA;
    }

    pub fn record_failure(&mut self, key: &str) {
        self.touch(key).score += FAILURE_DELTA;
    }

    pub fn score(&mut self, key: &str) -> f64 {
        self.touch(key).score
    }
}

impl Default for HealthScoreTracker {
    fn default() -> Self {
        Self::new()
    }
}

struct BucketEntry {
    tokens: f64,
    last_touched: Instant,
}

/// Client-side throttling: an account must have at least one token to be a
/// hybrid-strategy candidate, and consumes one on use.
pub struct TokenBucketTracker {
    entries: HashMap<String, BucketEntry>,
}

impl TokenBucketTracker {
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }

    fn touch(&mut self, key: &str) -> &mut BucketEntry {
        let now = Instant::now();
        self.entries.retain(|_, e| now.duration_since(e.last_touched) < BUCKET_EVICT_AFTER);
        let entry = self.entries.entry(key.to_string()).or_insert(BucketEntry {
            tokens: BUCKET_INITIAL,
            last_touched: now,
        });
        let elapsed_min = now.duration_since(entry.last_touched).as_secs_f64() / 60.0;
        entry.tokens = (entry.tokens + elapsed_min * BUCKET_REGEN_PER_MIN).min(BUCKET_MAX);
        entry.last_touched = now;
        entry
    }

    pub fn has_token(&mut self, key: &str) -> bool {
        self.touch(key).tokens >= 1.0
    }

    pub fn consume(&mut self, key: &str) {
        let entry = self.touch(key);
        entry.tokens = (entry.tokens - 1.0).max(0.0);
    }

    pub fn tokens(&mut self, key: &str) -> f64 {
        self.touch(key).tokens
    }
}

impl Default for TokenBucketTracker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn health_score_rewards_and_penalizes() {
        let mut tracker = HealthScoreTracker::new();
        tracker.record_success("k");
        assert_eq!(tracker.score("k"), 1.0);
        tracker.record_rate_limit("k");
        assert!(tracker.score("k") < 0.0);
    }

    #[test]
    fn token_bucket_requires_token_and_consumes() {
        let mut bucket = TokenBucketTracker::new();
        assert!(bucket.has_token("k"));
        for _ in 0..50 {
            bucket.consume("k");
        }
        assert!(!bucket.has_token("k"));
    }
}
