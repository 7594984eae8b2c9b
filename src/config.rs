//! Configuration for the relay.
//!
//! Represented as a single explicit `Config` value built once per process from
//! environment variables, so deep components never reach back into `std::env`
//! themselves. Recognized variables:
//!
//! - `OPENCODE_HOME` / `XDG_CONFIG_HOME` - storage root for the account file and caches.
//! - `OPENCODE_NO_BROWSER` - OAuth mode hint, passed through to the injected OAuth capability.
//! - `CODEX_AUTH_DEBUG`, `ENABLE_PLUGIN_REQUEST_LOGGING` - logging verbosity.
//! - `CODEX_AUTH_PROACTIVE_TOKEN_REFRESH` - overrides `proactive_token_refresh`.
//! - `ACCOUNT_SELECTION_STRATEGY` - `sticky` (default) | `round-robin` | `hybrid`.
//! - `PID_OFFSET_ENABLED` - default true when the pool has more than one account.
//! - `TOKEN_REFRESH_SKEW_MS`, `RATE_LIMIT_DEDUP_WINDOW_MS`, `RATE_LIMIT_STATE_RESET_MS`,
//!   `DEFAULT_RETRY_AFTER_MS`, `MAX_BACKOFF_MS`, `REQUEST_JITTER_MAX_MS`.
//! - `SCHEDULING_MODE` - `cache_first` (default) | `switch_first`.
//! - `MAX_CACHE_FIRST_WAIT_SECONDS`, `SWITCH_ON_FIRST_RATE_LIMIT`.
//! - `RETRY_ALL_ACCOUNTS_RATE_LIMITED`, `RETRY_ALL_ACCOUNTS_MAX_WAIT_MS`,
//!   `RETRY_ALL_ACCOUNTS_MAX_RETRIES`.
//! - `RATE_LIMIT_TOAST_DEBOUNCE_MS`, `QUIET_MODE`.
//! - `HOST`, `PORT` - ambient HTTP surface bind address.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("invalid value for {0}: {1}")]
    InvalidValue(String, String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectionStrategy {
    Sticky,
    RoundRobin,
    Hybrid,
}

impl SelectionStrategy {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "sticky" => Some(Self::Sticky),
            "round-robin" | "round_robin" => Some(Self::RoundRobin),
            "hybrid" => Some(Self::Hybrid),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulingMode {
    CacheFirst,
    SwitchFirst,
}

impl SchedulingMode {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "cache_first" | "cache-first" => Some(Self::CacheFirst),
            "switch_first" | "switch-first" => Some(Self::SwitchFirst),
            _ => None,
        }
    }
}

/// Rate-limit tracker and backoff decider knobs.
#[derive(Debug, Clone)]
pub struct BackoffConfig {
    pub rate_limit_dedup_window_ms: u64,
    pub rate_limit_state_reset_ms: u64,
    pub default_retry_after_ms: u64,
    pub max_backoff_ms: u64,
    pub request_jitter_max_ms: u64,
    pub scheduling_mode: SchedulingMode,
    pub max_cache_first_wait_seconds: u64,
    pub switch_on_first_rate_limit: bool,
    pub retry_all_accounts_rate_limited: bool,
    pub retry_all_accounts_max_wait_ms: u64,
    pub retry_all_accounts_max_retries: u32,
    /// Upper bound on a "short" retry-first wait in `switch_first` mode.
    pub short_retry_threshold_ms: u64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            rate_limit_dedup_window_ms: 2_000,
            rate_limit_state_reset_ms: 120_000,
            default_retry_after_ms: 60_000,
            max_backoff_ms: 120_000,
            request_jitter_max_ms: 1_000,
            scheduling_mode: SchedulingMode::CacheFirst,
            max_cache_first_wait_seconds: 60,
            switch_on_first_rate_limit: false,
            retry_all_accounts_rate_limited: true,
            retry_all_accounts_max_wait_ms: 120_000,
            retry_all_accounts_max_retries: 3,
            short_retry_threshold_ms: 5_000,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    /// Storage root for the account file and caches ($OPENCODE_HOME or $XDG_CONFIG_HOME/opencode).
    pub storage_root: PathBuf,

    pub account_selection_strategy: SelectionStrategy,
    pub pid_offset_enabled: bool,

    pub token_refresh_skew_ms: i64,
    pub proactive_token_refresh: bool,
    pub proactive_refresh_interval_ms: u64,
    pub proactive_refresh_buffer_ms: u64,
    pub proactive_refresh_queue_interval_ms: u64,
    pub auth_failure_cooldown_ms: u64,

    pub backoff: BackoffConfig,

    pub rate_limit_toast_debounce_ms: u64,
    pub quiet_mode: bool,

    pub catalog_cache_ttl_ms: u64,
    pub catalog_session_cap_ms: u64,
    pub catalog_cold_start_backoff_ms: u64,
    pub catalog_fetch_timeout_ms: u64,

    pub upstream_base_url: String,
    pub client_version: String,

    pub host: String,
    pub port: u16,

    pub request_logging: bool,
    pub auth_debug: bool,
}

fn env_bool(key: &str, default: bool) -> Result<bool, ConfigError> {
    match std::env::var(key) {
        Err(_) => Ok(default),
        Ok(v) => match v.as_str() {
            "1" | "true" | "TRUE" | "yes" => Ok(true),
            "0" | "false" | "FALSE" | "no" => Ok(false),
            other => Err(ConfigError::InvalidValue(key.to_string(), other.to_string())),
        },
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> Result<T, ConfigError> {
    match std::env::var(key) {
        Err(_) => Ok(default),
        Ok(v) => v
            .parse()
            .map_err(|_| ConfigError::InvalidValue(key.to_string(), v)),
    }
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let storage_root = std::env::var("OPENCODE_HOME")
            .or_else(|_| std::env::var("XDG_CONFIG_HOME").map(|d| format!("{d}/opencode")))
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
                PathBuf::from(home).join(".config").join("opencode")
            });

        let account_selection_strategy = std::env::var("ACCOUNT_SELECTION_STRATEGY")
            .ok()
            .map(|v| {
                SelectionStrategy::parse(&v)
                    .ok_or_else(|| ConfigError::InvalidValue("ACCOUNT_SELECTION_STRATEGY".into(), v))
            })
            .transpose()?
            .unwrap_or(SelectionStrategy::Sticky);

        let pid_offset_enabled = env_bool("PID_OFFSET_ENABLED", true)?;

        let token_refresh_skew_ms = env_parse("TOKEN_REFRESH_SKEW_MS", 60_000i64)?;
        let proactive_token_refresh = match std::env::var("CODEX_AUTH_PROACTIVE_TOKEN_REFRESH") {
            Ok(v) => v == "1" || v.eq_ignore_ascii_case("true"),
            Err(_) => true,
        };

        let backoff = BackoffConfig {
            rate_limit_dedup_window_ms: env_parse("RATE_LIMIT_DEDUP_WINDOW_MS", 2_000)?,
            rate_limit_state_reset_ms: env_parse("RATE_LIMIT_STATE_RESET_MS", 120_000)?,
            default_retry_after_ms: env_parse("DEFAULT_RETRY_AFTER_MS", 60_000)?,
            max_backoff_ms: env_parse("MAX_BACKOFF_MS", 120_000)?,
            request_jitter_max_ms: env_parse("REQUEST_JITTER_MAX_MS", 1_000)?,
            scheduling_mode: std::env::var("SCHEDULING_MODE")
                .ok()
                .map(|v| {
                    SchedulingMode::parse(&v)
                        .ok_or_else(|| ConfigError::InvalidValue("SCHEDULING_MODE".into(), v))
                })
                .transpose()?
                .unwrap_or(SchedulingMode::CacheFirst),
            max_cache_first_wait_seconds: env_parse("MAX_CACHE_FIRST_WAIT_SECONDS", 60)?,
            switch_on_first_rate_limit: env_bool("SWITCH_ON_FIRST_RATE_LIMIT", false)?,
            retry_all_accounts_rate_limited: env_bool("RETRY_ALL_ACCOUNTS_RATE_LIMITED", true)?,
            retry_all_accounts_max_wait_ms: env_parse("RETRY_ALL_ACCOUNTS_MAX_WAIT_MS", 120_000)?,
            retry_all_accounts_max_retries: env_parse("RETRY_ALL_ACCOUNTS_MAX_RETRIES", 3)?,
            short_retry_threshold_ms: env_parse("SHORT_RETRY_THRESHOLD_MS", 5_000)?,
        };

        Ok(Self {
            storage_root,
            account_selection_strategy,
            pid_offset_enabled,
            token_refresh_skew_ms,
            proactive_token_refresh,
            proactive_refresh_interval_ms: env_parse("PROACTIVE_REFRESH_INTERVAL_MS", 1_000)?,
            proactive_refresh_buffer_ms: env_parse("PROACTIVE_REFRESH_BUFFER_MS", 300_000)?,
            proactive_refresh_queue_interval_ms: env_parse(
                "PROACTIVE_REFRESH_QUEUE_INTERVAL_MS",
                250,
            )?,
            auth_failure_cooldown_ms: env_parse("AUTH_FAILURE_COOLDOWN_MS", 60_000)?,
            backoff,
            rate_limit_toast_debounce_ms: env_parse("RATE_LIMIT_TOAST_DEBOUNCE_MS", 30_000)?,
            quiet_mode: env_bool("QUIET_MODE", false)?,
            catalog_cache_ttl_ms: env_parse("CATALOG_CACHE_TTL_MS", 900_000)?,
            catalog_session_cap_ms: env_parse("CATALOG_SESSION_CAP_MS", 3_600_000)?,
            catalog_cold_start_backoff_ms: env_parse("CATALOG_COLD_START_BACKOFF_MS", 60_000)?,
            catalog_fetch_timeout_ms: env_parse("CATALOG_FETCH_TIMEOUT_MS", 5_000)?,
            upstream_base_url: std::env::var("UPSTREAM_BASE_URL")
                .unwrap_or_else(|_| "https://chatgpt.com/backend-api".to_string()),
            client_version: std::env::var("CODEX_CLIENT_VERSION")
                .unwrap_or_else(|_| "0.1.0".to_string()),
            host: std::env::var("HOST").unwrap_or_else(|_| "127.0.0.1".to_string()),
            port: env_parse("PORT", 4000u16)?,
            request_logging: env_bool("ENABLE_PLUGIN_REQUEST_LOGGING", false)?,
            auth_debug: env_bool("CODEX_AUTH_DEBUG", false)?,
        })
    }

    /// Construct a config with defaults, for tests.
    pub fn for_tests(storage_root: PathBuf) -> Self {
        Self {
            storage_root,
            account_selection_strategy: SelectionStrategy::Sticky,
            pid_offset_enabled: true,
            token_refresh_skew_ms: 60_000,
            proactive_token_refresh: true,
            proactive_refresh_interval_ms: 1_000,
            proactive_refresh_buffer_ms: 300_000,
            proactive_refresh_queue_interval_ms: 250,
            auth_failure_cooldown_ms: 60_000,
            backoff: BackoffConfig::default(),
            rate_limit_toast_debounce_ms: 30_000,
            quiet_mode: false,
            catalog_cache_ttl_ms: 900_000,
            catalog_session_cap_ms: 3_600_000,
            catalog_cold_start_backoff_ms: 60_000,
            catalog_fetch_timeout_ms: 5_000,
            upstream_base_url: "https://chatgpt.com/backend-api".to_string(),
            client_version: "0.1.0".to_string(),
            host: "127.0.0.1".to_string(),
            port: 4000,
            request_logging: false,
            auth_debug: false,
        }
    }

    pub fn accounts_file(&self) -> PathBuf {
        self.storage_root.join("openai-codex-accounts.json")
    }

    pub fn cache_dir(&self) -> PathBuf {
        self.storage_root.join("cache")
    }
}
