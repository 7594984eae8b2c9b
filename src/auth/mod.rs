//! OAuth token lifecycle: the refresh client and the proactive refresh scheduler.

pub mod refresh;
pub mod scheduler;

pub use refresh::{should_refresh, ExtractedClaims, HttpTokenRefreshClient, RefreshedTokens, TokenRefreshClient};
pub use scheduler::ProactiveRefreshScheduler;
