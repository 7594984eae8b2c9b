//! Rate-limit tracking (deduplicated exponential backoff) and the
//! wait-vs-switch Backoff Decider.

pub mod decider;
pub mod tracker;

pub use decider::{decide, Decision, DeciderAction};
pub use tracker::{BackoffResult, RateLimitReason, RateLimitTracker};
