//! Model catalog data model: the per-slug entry, the per-account cache file
//! shape, and variant expansion from `supported_reasoning_levels`.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CatalogEntry {
    pub slug: String,
    #[serde(default)]
    pub supported_reasoning_levels: Vec<String>,
    pub default_reasoning_level: String,
    #[serde(default)]
    pub base_instructions: Option<String>,
    #[serde(default)]
    pub apply_patch_tool_type: Option<String>,
    #[serde(default)]
    pub supports_reasoning_summaries: Option<bool>,
    #[serde(default)]
    pub default_verbosity: Option<String>,
}

impl CatalogEntry {
    /// Normalize a raw slug: lowercase, trimmed.
    pub fn normalize_slug(raw: &str) -> String {
        raw.trim().to_ascii_lowercase()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CatalogSource {
    Server,
    Github,
    Static,
}

/// The per-account cache file shape persisted to and loaded from disk.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CatalogFile {
    pub fetched_at: i64,
    pub source: CatalogSource,
    #[serde(default)]
    pub etag: Option<String>,
    pub models: Vec<CatalogEntry>,
}

/// Runtime defaults resolved for one model request, after variant expansion.
#[derive(Debug, Clone, PartialEq)]
pub struct Defaults {
    pub slug: String,
    pub reasoning_level: String,
    pub base_instructions: Option<String>,
    pub apply_patch_tool_type: Option<String>,
    pub supports_reasoning_summaries: bool,
    pub default_verbosity: Option<String>,
}

impl Defaults {
    pub fn from_entry(entry: &CatalogEntry, reasoning_level: Option<&str>) -> Self {
        Self {
            slug: entry.slug.clone(),
            reasoning_level: reasoning_level
                .filter(|lvl| entry.supported_reasoning_levels.iter().any(|l| l == lvl))
                .map(str::to_string)
                .unwrap_or_else(|| entry.default_reasoning_level.clone()),
            base_instructions: entry.base_instructions.clone(),
            apply_patch_tool_type: entry.apply_patch_tool_type.clone(),
            supports_reasoning_summaries: entry.supports_reasoning_summaries.unwrap_or(false),
            default_verbosity: entry.default_verbosity.clone(),
        }
    }
}

/// Given `gpt-5` and the available slugs, normalize to the lowest available
/// `gpt-5.X` (and similarly for the `-codex` suffix family). Returns `None`
/// when no member of the family is present.
pub fn normalize_legacy_model<'a>(requested: &str, available_slugs: &[&'a str]) -> Option<&'a str> {
    let normalized = CatalogEntry::normalize_slug(requested);
    if available_slugs.iter().any(|s| *s == normalized) {
        return available_slugs.iter().find(|s| **s == normalized).copied();
    }

    let (base, suffix) = if let Some(stripped) = normalized.strip_suffix("-codex") {
        (stripped, "-codex")
    } else {
        (normalized.as_str(), "")
    };

    // Only treat `gpt-5` as a legacy alias; distinct major families don't fold together.
    if base != "gpt-5" {
        return None;
    }

    available_slugs
        .iter()
        .filter(|s| {
            let candidate = if suffix.is_empty() {
                s.strip_suffix("-codex").is_none()
            } else {
                s.ends_with(suffix)
            };
            candidate && s.starts_with("gpt-5.")
        })
        .min()
        .copied()
}

/// Derive one variant entry per supported reasoning level, e.g. `gpt-5.1` with
/// levels `[low, high]` yields `gpt-5.1:low` and `gpt-5.1:high`, each locked to
/// that single level. Lets a caller pin an effort level by slug alone.
pub fn expand_variants(entry: &CatalogEntry) -> Vec<CatalogEntry> {
    entry
        .supported_reasoning_levels
        .iter()
        .map(|level| CatalogEntry {
            slug: format!("{}:{}", entry.slug, level),
            supported_reasoning_levels: vec![level.clone()],
            default_reasoning_level: level.clone(),
            base_instructions: entry.base_instructions.clone(),
            apply_patch_tool_type: entry.apply_patch_tool_type.clone(),
            supports_reasoning_summaries: entry.supports_reasoning_summaries,
            default_verbosity: entry.default_verbosity.clone(),
        })
        .collect()
}

/// The base slug of an effort-suffixed entry, e.g. `gpt-5.1:low` -> `gpt-5.1`.
/// Entries without a `:` suffix have no legacy base.
fn legacy_variant_base(slug: &str) -> Option<&str> {
    slug.rsplit_once(':').map(|(base, _)| base)
}

/// Drop effort-suffixed legacy entries (`gpt-5.1-low` style configs predating
/// `supported_reasoning_levels`) whenever the base entry is also present — the
/// base now expands into per-effort variants on its own, so the old suffixed
/// entry is redundant. A suffixed entry survives only when it's the sole
/// evidence a model exists at all.
pub fn reconcile_legacy_variants(models: Vec<CatalogEntry>) -> Vec<CatalogEntry> {
    let bases: std::collections::HashSet<String> = models.iter().map(|m| m.slug.clone()).collect();
    models
        .into_iter()
        .filter(|m| match legacy_variant_base(&m.slug) {
            Some(base) => !bases.contains(base),
            None => true,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    // Scenario 8: legacy model upgrade.
    #[test]
    fn legacy_gpt5_normalizes_to_lowest_available() {
        let available = ["gpt-5.1", "gpt-5.2", "gpt-5.1-codex"];
        assert_eq!(normalize_legacy_model("gpt-5", &available), Some("gpt-5.1"));
        assert_eq!(normalize_legacy_model("gpt-5-codex", &available), Some("gpt-5.1-codex"));
    }

    #[test]
    fn exact_slug_match_short_circuits() {
        let available = ["gpt-5.1", "gpt-5.2"];
        assert_eq!(normalize_legacy_model("GPT-5.2", &available), Some("gpt-5.2"));
    }

    #[test]
    fn unrelated_family_does_not_normalize() {
        let available = ["gpt-5.1", "o3"];
        assert_eq!(normalize_legacy_model("o4", &available), None);
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

    #[test]
    fn expand_variants_derives_one_entry_per_level() {
        let variants = expand_variants(&entry("gpt-5.1"));
        let slugs: Vec<&str> = variants.iter().map(|v| v.slug.as_str()).collect();
        assert_eq!(slugs, vec!["gpt-5.1:low", "gpt-5.1:high"]);
        assert_eq!(variants[0].supported_reasoning_levels, vec!["low".to_string()]);
        assert_eq!(variants[0].default_reasoning_level, "low");
    }

    #[test]
    fn reconcile_drops_suffixed_entry_when_base_present() {
        let mut legacy = entry("gpt-5.1:low");
        legacy.supported_reasoning_levels = vec!["low".into()];
        let models = vec![entry("gpt-5.1"), legacy];
        let reconciled = reconcile_legacy_variants(models);
        assert_eq!(reconciled.len(), 1);
        assert_eq!(reconciled[0].slug, "gpt-5.1");
    }

    #[test]
    fn reconcile_keeps_suffixed_entry_when_base_absent() {
        let mut legacy = entry("gpt-5.1:low");
        legacy.supported_reasoning_levels = vec!["low".into()];
        let models = vec![legacy];
        let reconciled = reconcile_legacy_variants(models);
        assert_eq!(reconciled.len(), 1);
        assert_eq!(reconciled[0].slug, "gpt-5.1:low");
    }
}
