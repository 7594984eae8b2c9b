//! The synthesized 429 diagnostic returned when every account in the pool is
//! rate-limited or cooling down.

use serde::Serialize;

use crate::account::types::Account;

#[derive(Debug, Clone, Serialize)]
pub struct AccountDiagnostic {
    pub account_id: Option<String>,
    pub status: &'static str,
    pub next_reset_ms: Option<i64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ExhaustionDiagnostic {
    pub error: ExhaustionError,
}

#[derive(Debug, Clone, Serialize)]
pub struct ExhaustionError {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub message: &'static str,
    pub accounts: Vec<AccountDiagnostic>,
    pub guidance: &'static str,
}

/// Build the diagnostic body enumerating each account's status, for the
/// synthesized 429 response when the pool is exhausted.
pub fn build(accounts: &[Account], now: i64) -> ExhaustionDiagnostic {
    let details = accounts
        .iter()
        .map(|account| {
            if !account.enabled {
                AccountDiagnostic { account_id: account.account_id.clone(), status: "disabled", next_reset_ms: None }
            } else if let Some(until) = account.cooling_down_until.filter(|u| *u > now) {
                AccountDiagnostic {
                    account_id: account.account_id.clone(),
                    status: "cooling-down",
                    next_reset_ms: Some(until - now),
                }
            } else if let Some(reset_at) = account.rate_limit_reset_times.values().filter(|r| **r > now).min() {
                AccountDiagnostic {
                    account_id: account.account_id.clone(),
                    status: "rate-limited",
                    next_reset_ms: Some(reset_at - now),
                }
            } else {
                AccountDiagnostic { account_id: account.account_id.clone(), status: "ok", next_reset_ms: None }
            }
        })
        .collect();

    ExhaustionDiagnostic {
        error: ExhaustionError {
            kind: "all_accounts_unavailable",
            message: "All accounts are rate-limited or cooling down",
            accounts: details,
            guidance: "retry after the shortest next_reset_ms, or add another account",
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn account(id: &str) -> Account {
        Account {
            refresh_token: "rt".into(),
            account_id: Some(id.to_string()),
            email: Some(format!("{id}@example.com")),
            plan: Some(crate::account::types::Plan::Pro),
            enabled: true,
            added_at: 0,
            last_used: 0,
            last_switch_reason: None,
            rate_limit_reset_times: HashMap::new(),
            cooling_down_until: None,
            cooldown_reason: None,
            access_token: None,
            expires_at: None,
            notes: None,
        }
    }

    #[test]
    fn classifies_each_account_status() {
        let mut a0 = account("a0");
        a0.cooling_down_until = Some(5_000);
        let mut a1 = account("a1");
        a1.rate_limit_reset_times.insert("codex".into(), 10_000);
        let mut a2 = account("a2");
        a2.enabled = false;

        let diag = build(&[a0, a1, a2], 1_000);
        assert_eq!(diag.error.accounts[0].status, "cooling-down");
        assert_eq!(diag.error.accounts[1].status, "rate-limited");
        assert_eq!(diag.error.accounts[2].status, "disabled");
    }
}
