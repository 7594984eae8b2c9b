//! Model Catalog Cache: per-account authoritative catalog with ETag
//! revalidation, session TTL, and cold-start backoff.

use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::catalog::types::{expand_variants, normalize_legacy_model, reconcile_legacy_variants, CatalogEntry, CatalogFile, CatalogSource, Defaults};
use crate::error::{CoreError, Result};

fn now_ms() -> i64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_millis() as i64
}

const AUTH_SENTINEL: &str = "auth";

/// Outcome of a server fetch attempt.
pub enum FetchOutcome {
    NotModified,
    Fresh { models: Vec<CatalogEntry>, etag: Option<String> },
}

#[async_trait]
pub trait CatalogSourceClient: Send + Sync {
    async fn fetch(&self, account_id: Option<&str>, etag: Option<&str>, client_version: &str) -> Result<FetchOutcome>;
}

pub struct HttpCatalogSourceClient {
    http: reqwest::Client,
    base_url: String,
    timeout: Duration,
}

impl HttpCatalogSourceClient {
    pub fn new(http: reqwest::Client, base_url: String, timeout_ms: u64) -> Self {
        Self { http, base_url, timeout: Duration::from_millis(timeout_ms) }
    }
}

#[async_trait]
impl CatalogSourceClient for HttpCatalogSourceClient {
    async fn fetch(&self, account_id: Option<&str>, etag: Option<&str>, client_version: &str) -> Result<FetchOutcome> {
        let mut request = self
            .http
            .get(format!("{}/codex/models", self.base_url))
            .query(&[("client_version", client_version)])
            .timeout(self.timeout);
        if let Some(id) = account_id {
            request = request.header("chatgpt-account-id", id);
        }
        if let Some(tag) = etag {
            request = request.header("If-None-Match", tag);
        }

        let response = request.send().await?;
        if response.status().as_u16() == 304 {
            return Ok(FetchOutcome::NotModified);
        }
        if !response.status().is_success() {
            return Err(CoreError::ModelCatalogUnavailable(format!(
                "server returned {}",
                response.status()
            )));
        }
        let etag = response
            .headers()
            .get("etag")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let models: Vec<CatalogEntry> = response.json().await.map_err(|e| {
            CoreError::ModelCatalogUnavailable(format!("malformed catalog response: {e}"))
        })?;
        Ok(FetchOutcome::Fresh { models, etag })
    }
}

struct MemoryEntry {
    file: CatalogFile,
    loaded_at: Instant,
}

pub struct ModelCatalogCache {
    cache_dir: PathBuf,
    source: Box<dyn CatalogSourceClient>,
    static_templates: Vec<CatalogEntry>,
    cache_ttl_ms: i64,
    session_cap: Duration,
    cold_start_backoff: Duration,
    client_version: String,
    memory: Mutex<HashMap<String, MemoryEntry>>,
    cold_start_failures: Mutex<HashMap<String, Instant>>,
}

impl ModelCatalogCache {
    pub fn new(
        cache_dir: PathBuf,
        source: Box<dyn CatalogSourceClient>,
        static_templates: Vec<CatalogEntry>,
        cache_ttl_ms: u64,
        session_cap_ms: u64,
        cold_start_backoff_ms: u64,
        client_version: String,
    ) -> Self {
        Self {
            cache_dir,
            source,
            static_templates: Self::expand_catalog(static_templates),
            cache_ttl_ms: cache_ttl_ms as i64,
            session_cap: Duration::from_millis(session_cap_ms),
            cold_start_backoff: Duration::from_millis(cold_start_backoff_ms),
            client_version,
            memory: Mutex::new(HashMap::new()),
            cold_start_failures: Mutex::new(HashMap::new()),
        }
    }

    /// Variant expansion (spec: model catalog cache): reconcile away
    /// effort-suffixed legacy entries whose base is present, then derive a
    /// per-effort variant entry from each remaining base's
    /// `supported_reasoning_levels`.
    fn expand_catalog(models: Vec<CatalogEntry>) -> Vec<CatalogEntry> {
        let reconciled = reconcile_legacy_variants(models);
        let mut expanded = reconciled.clone();
        for entry in &reconciled {
            expanded.extend(expand_variants(entry));
        }
        expanded
    }

    fn auth_key(account_id: Option<&str>) -> String {
        account_id.unwrap_or(AUTH_SENTINEL).to_string()
    }

    fn disk_path(&self, account_id: Option<&str>) -> PathBuf {
        let mut hasher = Sha256::new();
        hasher.update(Self::auth_key(account_id).as_bytes());
        let hash = hex::encode(hasher.finalize());
        self.cache_dir.join(format!("codex-models-cache-{hash}.json"))
    }

    fn in_cold_start_backoff(&self, key: &str) -> bool {
        let failures = self.cold_start_failures.lock().unwrap();
        failures
            .get(key)
            .map(|at| at.elapsed() < self.cold_start_backoff)
            .unwrap_or(false)
    }

    fn record_cold_start_failure(&self, key: &str) {
        self.cold_start_failures.lock().unwrap().insert(key.to_string(), Instant::now());
    }

    fn find_slug<'a>(models: &'a [CatalogEntry], slug: &str) -> Option<&'a CatalogEntry> {
        models.iter().find(|m| m.slug == slug)
    }

    /// Exact match first; on a miss, fold a legacy bare `gpt-5` style slug to
    /// the lowest available concrete version within `models` (Scenario 8) and
    /// retry the lookup against that resolved slug.
    fn resolve_entry<'a>(models: &'a [CatalogEntry], slug: &str) -> Option<&'a CatalogEntry> {
        if let Some(entry) = Self::find_slug(models, slug) {
            return Some(entry);
        }
        let available: Vec<&str> = models.iter().map(|m| m.slug.as_str()).collect();
        let resolved = normalize_legacy_model(slug, &available)?;
        Self::find_slug(models, resolved)
    }

    fn load_disk(&self, account_id: Option<&str>) -> Option<CatalogFile> {
        let path = self.disk_path(account_id);
        let contents = fs::read_to_string(path).ok()?;
        serde_json::from_str(&contents).ok()
    }

    fn save_disk(&self, account_id: Option<&str>, file: &CatalogFile) {
        let path = self.disk_path(account_id);
        if let Some(parent) = path.parent() {
            let _ = fs::create_dir_all(parent);
        }
        if let Ok(json) = serde_json::to_string_pretty(file) {
            let tmp = path.with_extension("json.tmp");
            if fs::write(&tmp, &json).is_ok() {
                let _ = fs::rename(&tmp, &path);
            }
        }
    }

    /// Resolve the defaults for `model_id`. Sources, in order: in-memory ->
    /// disk -> server (ETag-aware) -> bundled static templates. Fails closed
    /// (no GitHub raw-file fallback) if nothing yields the requested slug.
    /// `requested_reasoning_level`, when given, is validated against the
    /// resolved entry's supported set and falls back to the entry's default.
    pub async fn get_runtime_defaults(
        &self,
        model_id: &str,
        account_id: Option<&str>,
        force_refresh: bool,
        requested_reasoning_level: Option<&str>,
    ) -> Result<Defaults> {
        let slug = CatalogEntry::normalize_slug(model_id);
        let key = Self::auth_key(account_id);

        if !force_refresh {
            if let Some(entry) = self.lookup_memory(&key, &slug) {
                debug!(slug, "catalog: served from in-memory cache");
                return Ok(Defaults::from_entry(&entry, requested_reasoning_level));
            }
            if let Some(entry) = self.lookup_disk(&key, account_id, &slug) {
                debug!(slug, "catalog: served from disk cache");
                return Ok(Defaults::from_entry(&entry, requested_reasoning_level));
            }
        }

        if self.in_cold_start_backoff(&key) {
            warn!(slug, "catalog: server in cold-start backoff, skipping network attempt");
        } else {
            match self.refresh_from_server(&key, account_id, force_refresh).await {
                Ok(()) => {
                    if let Some(entry) = self.lookup_disk(&key, account_id, &slug) {
                        return Ok(Defaults::from_entry(&entry, requested_reasoning_level));
                    }
                    // Server reachable, but slug (even after legacy-model folding) absent; fall through.
                }
                Err(e) => {
                    warn!(slug, error = %e, "catalog: server fetch failed, entering cold-start backoff");
                    self.record_cold_start_failure(&key);
                }
            }
        }

        if let Some(entry) = Self::resolve_entry(&self.static_templates, &slug) {
            info!(slug, "catalog: served from bundled static template");
            return Ok(Defaults::from_entry(entry, requested_reasoning_level));
        }

        Err(CoreError::ModelCatalogUnavailable(format!(
            "no source yielded catalog entry for '{slug}'"
        )))
    }

    fn lookup_memory(&self, key: &str, slug: &str) -> Option<CatalogEntry> {
        let memory = self.memory.lock().unwrap();
        let entry = memory.get(key)?;
        if entry.loaded_at.elapsed() >= self.session_cap {
            return None;
        }
        Self::resolve_entry(&entry.file.models, slug).cloned()
    }

    fn lookup_disk(&self, key: &str, account_id: Option<&str>, slug: &str) -> Option<CatalogEntry> {
        let file = self.load_disk(account_id)?;
        let age_ms = now_ms() - file.fetched_at;
        if age_ms >= self.cache_ttl_ms {
            return None;
        }
        let found = Self::resolve_entry(&file.models, slug).cloned();
        if found.is_some() {
            self.memory.lock().unwrap().insert(
                key.to_string(),
                MemoryEntry { file, loaded_at: Instant::now() },
            );
        }
        found
    }

    /// Refreshes the disk/memory cache from the server. Returns `Ok(())`
    /// whether the response was fresh or a 304; the caller re-queries the
    /// (now current) disk cache for the slug it actually wants.
    async fn refresh_from_server(&self, key: &str, account_id: Option<&str>, force_refresh: bool) -> Result<()> {
        let existing_etag = if force_refresh {
            None
        } else {
            self.load_disk(account_id).and_then(|f| f.etag)
        };

        match self.source.fetch(account_id, existing_etag.as_deref(), &self.client_version).await? {
            FetchOutcome::NotModified => {
                let mut file = self.load_disk(account_id).unwrap_or(CatalogFile {
                    fetched_at: now_ms(),
                    source: CatalogSource::Server,
                    etag: existing_etag,
                    models: Vec::new(),
                });
                file.fetched_at = now_ms();
                self.save_disk(account_id, &file);
                self.memory.lock().unwrap().insert(
                    key.to_string(),
                    MemoryEntry { file, loaded_at: Instant::now() },
                );
            }
            FetchOutcome::Fresh { models, etag } => {
                let file = CatalogFile {
                    fetched_at: now_ms(),
                    source: CatalogSource::Server,
                    etag,
                    models: Self::expand_catalog(models),
                };
                self.save_disk(account_id, &file);
                self.memory.lock().unwrap().insert(
                    key.to_string(),
                    MemoryEntry { file, loaded_at: Instant::now() },
                );
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::tempdir;

    struct AlwaysFails {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl CatalogSourceClient for AlwaysFails {
        async fn fetch(&self, _account_id: Option<&str>, _etag: Option<&str>, _client_version: &str) -> Result<FetchOutcome> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(CoreError::ModelCatalogUnavailable("simulated outage".into()))
        }
    }

    struct Returns(Vec<CatalogEntry>);

    #[async_trait]
    impl CatalogSourceClient for Returns {
        async fn fetch(&self, _account_id: Option<&str>, _etag: Option<&str>, _client_version: &str) -> Result<FetchOutcome> {
            Ok(FetchOutcome::Fresh { models: self.0.clone(), etag: Some("etag-1".into()) })
        }
    }

    fn entry(slug: &str) -> CatalogEntry {
        CatalogEntry {
            slug: slug.to_string(),
            supported_reasoning_levels: vec!["low".into(), "high".into()],
            default_reasoning_level: "low".into(),
            base_instructions: None,
            apply_patch_tool_type: None,
            supports_reasoning_summaries: Some(true),
            default_verbosity: None,
        }
    }

    // Scenario 7: model catalog backoff.
    #[tokio::test]
    async fn empty_cache_and_failing_server_fails_closed_then_suppresses_retry() {
        let dir = tempdir().unwrap();
        let source = AlwaysFails { calls: AtomicUsize::new(0) };
        let cache = ModelCatalogCache::new(dir.path().to_path_buf(), Box::new(source), vec![], 900_000, 3_600_000, 60_000, "1.0".into());

        let first = cache.get_runtime_defaults("gpt-5.1", None, false, None).await;
        assert!(first.is_err());

        let second = cache.get_runtime_defaults("gpt-5.1", None, false, None).await;
        assert!(second.is_err());

        // Verify the network was hit exactly once via the recorded failure.
        assert!(cache.in_cold_start_backoff(&ModelCatalogCache::auth_key(None)));
    }

    #[tokio::test]
    async fn server_success_populates_memory_and_disk() {
        let dir = tempdir().unwrap();
        let source = Returns(vec![entry("gpt-5.1")]);
        let cache = ModelCatalogCache::new(dir.path().to_path_buf(), Box::new(source), vec![], 900_000, 3_600_000, 60_000, "1.0".into());

        let defaults = cache.get_runtime_defaults("gpt-5.1", Some("acct-1"), false, None).await.unwrap();
        assert_eq!(defaults.slug, "gpt-5.1");
        assert_eq!(defaults.reasoning_level, "low");

        let path = cache.disk_path(Some("acct-1"));
        assert!(path.exists());
    }

    #[tokio::test]
    async fn falls_back_to_static_template_when_server_lacks_slug() {
        let dir = tempdir().unwrap();
        let source = Returns(vec![entry("gpt-5.2")]);
        let cache = ModelCatalogCache::new(
            dir.path().to_path_buf(),
            Box::new(source),
            vec![entry("gpt-5.1")],
            900_000,
            3_600_000,
            60_000,
            "1.0".into(),
        );

        let defaults = cache.get_runtime_defaults("gpt-5.1", None, false, None).await.unwrap();
        assert_eq!(defaults.slug, "gpt-5.1");
    }

    // Scenario 8: legacy model upgrade, exercised through the integrated lookup
    // path rather than the isolated normalize_legacy_model helper.
    #[tokio::test]
    async fn legacy_bare_slug_resolves_through_static_templates() {
        let dir = tempdir().unwrap();
        let source = AlwaysFails { calls: AtomicUsize::new(0) };
        let cache = ModelCatalogCache::new(
            dir.path().to_path_buf(),
            Box::new(source),
            vec![entry("gpt-5.1"), entry("gpt-5.2")],
            900_000,
            3_600_000,
            60_000,
            "1.0".into(),
        );

        let defaults = cache.get_runtime_defaults("gpt-5", None, false, None).await.unwrap();
        assert_eq!(defaults.slug, "gpt-5.1");
    }

    #[tokio::test]
    async fn legacy_bare_slug_resolves_through_server_and_disk() {
        let dir = tempdir().unwrap();
        let source = Returns(vec![entry("gpt-5.2"), entry("gpt-5.1")]);
        let cache = ModelCatalogCache::new(dir.path().to_path_buf(), Box::new(source), vec![], 900_000, 3_600_000, 60_000, "1.0".into());

        let defaults = cache.get_runtime_defaults("gpt-5-codex", None, false, None).await;
        assert!(defaults.is_err());

        let defaults = cache.get_runtime_defaults("gpt-5", None, false, None).await.unwrap();
        assert_eq!(defaults.slug, "gpt-5.1");
    }

    #[tokio::test]
    async fn variant_expansion_reconciles_legacy_suffixed_entry_and_derives_per_effort_slugs() {
        let dir = tempdir().unwrap();
        let mut legacy = entry("gpt-5.1:low");
        legacy.supported_reasoning_levels = vec!["low".into()];
        let source = Returns(vec![entry("gpt-5.1"), legacy]);
        let cache = ModelCatalogCache::new(dir.path().to_path_buf(), Box::new(source), vec![], 900_000, 3_600_000, 60_000, "1.0".into());

        // The pre-existing effort-suffixed config entry is reconciled away in favor
        // of the base's own derived variant, but the derived variant is still reachable.
        let base = cache.get_runtime_defaults("gpt-5.1", None, false, None).await.unwrap();
        assert_eq!(base.slug, "gpt-5.1");

        let variant = cache.get_runtime_defaults("gpt-5.1:high", None, false, None).await.unwrap();
        assert_eq!(variant.slug, "gpt-5.1:high");
        assert_eq!(variant.reasoning_level, "high");
    }
}
