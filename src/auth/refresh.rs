//! Token Refresh Client: OAuth refresh exchange and unverified claim decoding.
//!
//! Trust is the TLS endpoint, not the token signature — claims are decoded,
//! never cryptographically verified, matching the spec's explicit design
//! choice for this boundary.

use async_trait::async_trait;
use base64::Engine;
use serde::Deserialize;
use serde_json::Value;

use crate::account::types::Plan;
use crate::error::{CoreError, Result};

/// Nested claim namespace carrying account identity, following the vendor's
/// custom-claim convention.
const JWT_CLAIM_PATH: &str = "https://api.openai.com/auth";

#[derive(Debug, Clone)]
pub struct RefreshedTokens {
    pub access_token: String,
    pub refresh_token: String,
    /// Epoch ms.
    pub expires_at: i64,
    pub id_token: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct ExtractedClaims {
    pub account_id: Option<String>,
    pub plan: Option<Plan>,
    pub email: Option<String>,
}

#[derive(Deserialize)]
struct RawRefreshResponse {
    access_token: String,
    refresh_token: Option<String>,
    expires_in: Option<i64>,
    id_token: Option<String>,
}

#[async_trait]
pub trait TokenRefreshClient: Send + Sync {
    async fn refresh(&self, refresh_token: &str) -> Result<RefreshedTokens>;
}

pub struct HttpTokenRefreshClient {
    http: reqwest::Client,
    token_endpoint: String,
    client_id: String,
}

impl HttpTokenRefreshClient {
    pub fn new(http: reqwest::Client, token_endpoint: String, client_id: String) -> Self {
        Self { http, token_endpoint, client_id }
    }
}

#[async_trait]
impl TokenRefreshClient for HttpTokenRefreshClient {
    async fn refresh(&self, refresh_token: &str) -> Result<RefreshedTokens> {
        let body = serde_json::json!({
            "grant_type": "refresh_token",
            "refresh_token": refresh_token,
            "client_id": self.client_id,
        });

        let response = self
            .http
            .post(&self.token_endpoint)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(CoreError::AuthFailure(format!("refresh rejected: {status} {text}")));
        }

        let parsed: RawRefreshResponse = response
            .json()
            .await
            .map_err(|e| CoreError::AuthFailure(format!("malformed refresh response: {e}")))?;

        let now = now_ms();
        let expires_at = now + parsed.expires_in.unwrap_or(3600).max(0) * 1000;

        Ok(RefreshedTokens {
            access_token: parsed.access_token,
            refresh_token: parsed.refresh_token.unwrap_or_else(|| refresh_token.to_string()),
            expires_at,
            id_token: parsed.id_token,
        })
    }
}

fn now_ms() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_millis() as i64
}

/// `!auth.access || auth.expires <= now + max(0, skew_ms)`.
pub fn should_refresh(access_token: Option<&str>, expires_at: Option<i64>, skew_ms: i64, now: i64) -> bool {
    if access_token.map(str::is_empty).unwrap_or(true) {
        return true;
    }
    match expires_at {
        None => true,
        Some(expires) => expires <= now + skew_ms.max(0),
    }
}

/// Decode a JWT's claims (base64url, no signature check) and extract the
/// identity fields from the nested claim namespace.
pub fn extract_claims(token: &str) -> Result<ExtractedClaims> {
    let segments: Vec<&str> = token.split('.').collect();
    if segments.len() < 2 {
        return Err(CoreError::AuthFailure("malformed token: missing claims segment".into()));
    }

    let decoded = base64::engine::general_purpose::URL_SAFE_NO_PAD
        .decode(segments[1])
        .map_err(|e| CoreError::AuthFailure(format!("invalid base64url claims: {e}")))?;

    let claims: Value = serde_json::from_slice(&decoded)
        .map_err(|e| CoreError::AuthFailure(format!("invalid claims json: {e}")))?;

    let nested = claims.get(JWT_CLAIM_PATH);
    let account_id = nested
        .and_then(|n| n.get("chatgpt_account_id"))
        .and_then(Value::as_str)
        .map(str::to_string);
    let plan_type = nested
        .and_then(|n| n.get("chatgpt_plan_type"))
        .and_then(Value::as_str)
        .and_then(Plan::normalize);
    let email = claims
        .get("email")
        .and_then(Value::as_str)
        .map(|e| e.to_ascii_lowercase())
        .filter(|e| e.contains('@'));

    Ok(ExtractedClaims {
        account_id,
        plan: plan_type,
        email,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode_segment(value: &Value) -> String {
        base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(value.to_string())
    }

    fn make_token(claims: Value) -> String {
        let header = encode_segment(&serde_json::json!({"alg": "none"}));
        let payload = encode_segment(&claims);
        format!("{header}.{payload}.")
    }

    #[test]
    fn should_refresh_true_when_no_access_token() {
        assert!(should_refresh(None, Some(i64::MAX), 0, 0));
    }

    #[test]
    fn should_refresh_true_when_within_skew() {
        assert!(should_refresh(Some("at"), Some(1_000), 500, 600));
    }

    #[test]
    fn should_refresh_false_when_far_from_expiry() {
        assert!(!should_refresh(Some("at"), Some(100_000), 500, 0));
    }

    #[test]
    fn extract_claims_reads_nested_identity() {
        let token = make_token(serde_json::json!({
            "email": "User@Example.com",
            "https://api.openai.com/auth": {
                "chatgpt_account_id": "acct-123",
                "chatgpt_plan_type": "pro",
            }
        }));

        let claims = extract_claims(&token).unwrap();
        assert_eq!(claims.account_id, Some("acct-123".to_string()));
        assert_eq!(claims.plan, Some(Plan::Pro));
        assert_eq!(claims.email, Some("user@example.com".to_string()));
    }

    #[test]
    fn extract_claims_rejects_malformed_token() {
        assert!(extract_claims("not-a-jwt").is_err());
    }

    #[test]
    fn extract_claims_ignores_email_without_at_sign() {
        let token = make_token(serde_json::json!({"email": "not-an-email"}));
        let claims = extract_claims(&token).unwrap();
        assert_eq!(claims.email, None);
    }
}
