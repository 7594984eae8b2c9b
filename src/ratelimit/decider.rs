//! Backoff Decider: the wait-vs-switch decision after a rate-limit response.

use crate::config::{BackoffConfig, SchedulingMode};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeciderAction {
    Wait,
    Switch,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decision {
    pub action: DeciderAction,
    pub delay_ms: i64,
}

/// Decide whether to wait out the computed backoff on the current account or
/// switch to another.
pub fn decide(config: &BackoffConfig, account_count: usize, attempt: u32, delay_ms: i64) -> Decision {
    if account_count <= 1 {
        return Decision { action: DeciderAction::Wait, delay_ms };
    }

    if config.switch_on_first_rate_limit && attempt == 1 {
        return Decision { action: DeciderAction::Switch, delay_ms };
    }

    let wait = match config.scheduling_mode {
        SchedulingMode::CacheFirst => delay_ms <= config.max_cache_first_wait_seconds as i64 * 1000,
        SchedulingMode::SwitchFirst => delay_ms <= config.short_retry_threshold_ms as i64,
    };

    Decision {
        action: if wait { DeciderAction::Wait } else { DeciderAction::Switch },
        delay_ms,
    }
}
