//! Response shapes for the ambient HTTP surface.

use serde::Serialize;

use crate::account::types::Account;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
}

/// A read-only view of one account, omitting the refresh/access tokens.
#[derive(Debug, Serialize)]
pub struct AccountSnapshot {
    pub account_id: Option<String>,
    pub email: Option<String>,
    pub plan: Option<String>,
    pub enabled: bool,
    pub cooling_down_until: Option<i64>,
    pub rate_limited_quota_keys: Vec<String>,
}

impl From<&Account> for AccountSnapshot {
    fn from(account: &Account) -> Self {
        Self {
            account_id: account.account_id.clone(),
            email: account.email.clone(),
            plan: account.plan.map(|p| p.as_str().to_string()),
            enabled: account.enabled,
            cooling_down_until: account.cooling_down_until,
            rate_limited_quota_keys: account.rate_limit_reset_times.keys().cloned().collect(),
        }
    }
}
