//! Account data model: the persisted record, the storage document, and the
//! quota-key and identity-tuple helpers every other component keys off of.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

pub const STORAGE_VERSION: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LastSwitchReason {
    Initial,
    Rotation,
    RateLimit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CooldownReason {
    AuthFailure,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Plan {
    Free,
    Plus,
    Pro,
    Team,
    Enterprise,
}

impl Plan {
    /// Normalize a vendor plan string through the closed mapping to a title-cased name.
    pub fn normalize(raw: &str) -> Option<Self> {
        match raw.to_ascii_lowercase().as_str() {
            "free" => Some(Self::Free),
            "plus" => Some(Self::Plus),
            "pro" => Some(Self::Pro),
            "team" => Some(Self::Team),
            "enterprise" => Some(Self::Enterprise),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Free => "Free",
            Self::Plus => "Plus",
            Self::Pro => "Pro",
            Self::Team => "Team",
            Self::Enterprise => "Enterprise",
        }
    }
}

impl std::fmt::Display for Plan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A persisted credential record for one end-user subscription.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    pub refresh_token: String,
    #[serde(default)]
    pub account_id: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub plan: Option<Plan>,
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub added_at: i64,
    #[serde(default)]
    pub last_used: i64,
    #[serde(default)]
    pub last_switch_reason: Option<LastSwitchReason>,
    #[serde(default)]
    pub rate_limit_reset_times: HashMap<String, i64>,
    #[serde(default)]
    pub cooling_down_until: Option<i64>,
    #[serde(default)]
    pub cooldown_reason: Option<CooldownReason>,
    /// Access token cached in memory/on disk alongside the refresh token; not
    /// part of identity, refreshed independently.
    #[serde(default)]
    pub access_token: Option<String>,
    #[serde(default)]
    pub expires_at: Option<i64>,
    /// Opaque, core-agnostic field preserved verbatim through merges.
    #[serde(default)]
    pub notes: Option<String>,
}

fn default_true() -> bool {
    true
}

impl Account {
    /// The strict identity tuple: all three must match for two records to be
    /// considered the same account on merge.
    pub fn identity(&self) -> Option<(String, String, Plan)> {
        match (&self.account_id, &self.email, &self.plan) {
            (Some(id), Some(email), Some(plan)) => Some((id.clone(), email.clone(), *plan)),
            _ => None,
        }
    }

    /// A process-stable account key for the hybrid health/token-bucket trackers:
    /// `account_id|email|plan` when present, else a hash of the refresh token.
    pub fn stable_key(&self) -> String {
        if let (Some(id), Some(email), Some(plan)) = (&self.account_id, &self.email, &self.plan) {
            format!("{id}|{email}|{plan}")
        } else {
            use sha2::{Digest, Sha256};
            let mut hasher = Sha256::new();
            hasher.update(self.refresh_token.as_bytes());
            format!("sha256:{}", hex::encode(hasher.finalize()))
        }
    }

    pub fn has_identity(&self) -> bool {
        self.account_id.is_some() && self.email.is_some() && self.plan.is_some()
    }
}

/// `family` alone, or `family:model` when a model is specified.
pub fn quota_key(family: &str, model: Option<&str>) -> String {
    match model {
        Some(m) if !m.is_empty() => format!("{family}:{m}"),
        _ => family.to_string(),
    }
}

/// Both the base and fine-grained keys to write on a rate-limit event, deduped
/// when they'd resolve to the same string.
pub fn quota_keys_to_write(family: &str, model: Option<&str>) -> Vec<String> {
    let base = quota_key(family, None);
    let fine = quota_key(family, model);
    if base == fine {
        vec![base]
    } else {
        vec![base, fine]
    }
}

pub type FamilyName = String;

/// The v3 storage document. The single source of truth; the in-memory pool is
/// a derived view.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageDocument {
    pub version: u32,
    pub accounts: Vec<Account>,
    #[serde(default)]
    pub active_index: usize,
    #[serde(default)]
    pub active_index_by_family: HashMap<FamilyName, usize>,
}

impl Default for StorageDocument {
    fn default() -> Self {
        Self {
            version: STORAGE_VERSION,
            accounts: Vec::new(),
            active_index: 0,
            active_index_by_family: HashMap::new(),
        }
    }
}

impl StorageDocument {
    /// Clamp `active_index` into range; an empty pool is clamped to 0.
    pub fn clamp_active_index(&mut self) {
        if self.accounts.is_empty() {
            self.active_index = 0;
        } else if self.active_index >= self.accounts.len() {
            self.active_index = self.accounts.len() - 1;
        }
        let len = self.accounts.len();
        self.active_index_by_family.retain(|_, idx| len == 0 || *idx < len);
    }

    /// Merge `incoming` into this document by identity tuple (all three of
    /// account_id/email/plan must match). Existing `added_at` is preserved;
    /// `last_used` advances; the refresh token is replaced.
    pub fn merge_account(&mut self, incoming: Account) {
        if let Some(identity) = incoming.identity() {
            if let Some(existing) = self
                .accounts
                .iter_mut()
                .find(|a| a.identity().as_ref() == Some(&identity))
            {
                let added_at = existing.added_at;
                let mut merged = incoming;
                merged.added_at = added_at;
                merged.last_used = merged.last_used.max(existing.last_used);
                *existing = merged;
                return;
            }
        } else {
            // Identity partially unknown: fall back to refresh-token equality.
            if let Some(existing) = self
                .accounts
                .iter_mut()
                .find(|a| a.refresh_token == incoming.refresh_token)
            {
                let added_at = existing.added_at;
                let mut merged = incoming;
                merged.added_at = added_at;
                *existing = merged;
                return;
            }
        }
        self.accounts.push(incoming);
        self.clamp_active_index();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn account(id: &str, email: &str, plan: Plan) -> Account {
        Account {
            refresh_token: format!("rt-{id}"),
            account_id: Some(id.to_string()),
            email: Some(email.to_string()),
            plan: Some(plan),
            enabled: true,
            added_at: 1000,
            last_used: 1000,
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
    fn quota_keys_dedup_when_equal() {
        assert_eq!(quota_keys_to_write("codex", None), vec!["codex".to_string()]);
    }

    #[test]
    fn quota_keys_both_written_when_distinct() {
        let keys = quota_keys_to_write("codex", Some("gpt-5.1"));
        assert_eq!(keys, vec!["codex".to_string(), "codex:gpt-5.1".to_string()]);
    }

    #[test]
    fn merge_by_identity_preserves_added_at_and_advances_last_used() {
        let mut doc = StorageDocument::default();
        doc.accounts.push(account("a1", "x@y.com", Plan::Pro));
        doc.accounts[0].added_at = 500;
        doc.accounts[0].last_used = 500;

        let mut incoming = account("a1", "x@y.com", Plan::Pro);
        incoming.added_at = 999_999;
        incoming.last_used = 2000;
        incoming.refresh_token = "new-token".to_string();
        doc.merge_account(incoming);

        assert_eq!(doc.accounts.len(), 1);
        assert_eq!(doc.accounts[0].added_at, 500);
        assert_eq!(doc.accounts[0].last_used, 2000);
        assert_eq!(doc.accounts[0].refresh_token, "new-token");
    }

    #[test]
    fn distinct_identity_appends_new_account() {
        let mut doc = StorageDocument::default();
        doc.accounts.push(account("a1", "x@y.com", Plan::Pro));
        doc.merge_account(account("a2", "x@y.com", Plan::Pro));
        assert_eq!(doc.accounts.len(), 2);
    }

    #[test]
    fn clamp_active_index_handles_empty_pool() {
        let mut doc = StorageDocument::default();
        doc.active_index = 5;
        doc.clamp_active_index();
        assert_eq!(doc.active_index, 0);
    }

    #[test]
    fn clamp_active_index_clamps_into_range() {
        let mut doc = StorageDocument::default();
        doc.accounts.push(account("a1", "x@y.com", Plan::Pro));
        doc.active_index = 5;
        doc.clamp_active_index();
        assert_eq!(doc.active_index, 0);
    }
}
