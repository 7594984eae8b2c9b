//! Error taxonomy for the core.
//!
//! Recovery is local wherever possible (cooldown, switch, retry); what survives
//! here is either surfaced to a programmatic caller or turned into a synthesized
//! response by the orchestrator. Nothing in this enum is thrown out of `fetch` —
//! the orchestrator always converts a terminal error into a `Response`-shaped value.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("auth failure: {0}")]
    AuthFailure(String),

    #[error("rate limited")]
    RateLimited,

    #[error("upstream error: status {status}")]
    UpstreamError { status: u16, body: String },

    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("storage busy: {0}")]
    StorageBusy(String),

    #[error("storage io error: {0}")]
    StorageIO(#[from] std::io::Error),

    #[error("storage corrupt, quarantined: {0}")]
    StorageCorrupt(String),

    #[error("model catalog unavailable: {0}")]
    ModelCatalogUnavailable(String),

    #[error("cancelled")]
    Cancelled,

    #[error("pool exhausted: {0}")]
    PoolExhausted(String),

    #[error("config error: {0}")]
    Config(#[from] crate::config::ConfigError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    AuthFailure,
    RateLimited,
    UpstreamError,
    Transport,
    StorageBusy,
    StorageIO,
    StorageCorrupt,
    ModelCatalogUnavailable,
    Cancelled,
    PoolExhausted,
    Config,
}

impl CoreError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            CoreError::AuthFailure(_) => ErrorKind::AuthFailure,
            CoreError::RateLimited => ErrorKind::RateLimited,
            CoreError::UpstreamError { .. } => ErrorKind::UpstreamError,
            CoreError::Transport(_) => ErrorKind::Transport,
            CoreError::StorageBusy(_) => ErrorKind::StorageBusy,
            CoreError::StorageIO(_) => ErrorKind::StorageIO,
            CoreError::StorageCorrupt(_) => ErrorKind::StorageCorrupt,
            CoreError::ModelCatalogUnavailable(_) => ErrorKind::ModelCatalogUnavailable,
            CoreError::Cancelled => ErrorKind::Cancelled,
            CoreError::PoolExhausted(_) => ErrorKind::PoolExhausted,
            CoreError::Config(_) => ErrorKind::Config,
        }
    }

    /// Whether a retry with backoff is worth attempting.
    pub fn is_transient(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::RateLimited | ErrorKind::Transport | ErrorKind::StorageBusy
        )
    }

    /// Suggested delay in milliseconds before a retry, given the attempt number (1-based).
    pub fn suggested_delay(&self, attempt: u32) -> u64 {
        let base: u64 = match self.kind() {
            ErrorKind::RateLimited => 1000,
            ErrorKind::Transport => 500,
            ErrorKind::StorageBusy => 100,
            _ => 0,
        };
        let exp = base.saturating_mul(1u64 << attempt.saturating_sub(1).min(16));
        exp.min(60_000)
    }
}

pub type Result<T> = std::result::Result<T, CoreError>;
