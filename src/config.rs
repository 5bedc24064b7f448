use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TokenEstimatorConfig {
    pub chars_per_token: usize,
    pub max_file_bytes: u64,
}

/// Hard safety ceiling: files larger than this are **always** refused by the
/// extractors, regardless of config. Protects low-RAM machines from
/// Tree-sitter-parsing a 10 MB minified bundle.
pub const ABSOLUTE_MAX_FILE_BYTES: u64 = 1_000_000; // 1 MB

impl Default for TokenEstimatorConfig {
    fn default() -> Self {
        Self {
            chars_per_token: 4,
            // 512 KB default — enough for any real source file, blocks log/generated bloat.
            max_file_bytes: 512 * 1024,
        }
    }
}

/// Controls workspace scanning behavior (what to skip).
///
/// Note: `.gitignore` is always respected by the scanner; these are additional
/// hard skips for noisy monorepo directories.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanConfig {
    /// Directory *names* to skip anywhere in the tree (e.g. "generated", "tmp").
    ///
    /// These are compared against path components, not full paths.
    pub exclude_dir_names: Vec<String>,
}

/// Edge weights per relationship type, adjustable per repo.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EdgeWeightConfig {
    pub call: f64,
    pub import: f64,
    pub config: f64,
}

impl Default for EdgeWeightConfig {
    fn default() -> Self {
        Self { call: 1.0, import: 0.6, config: 0.8 }
    }
}

/// Budgets and caps for the slice engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SliceConfig {
    pub default_max_cards: usize,
    pub default_max_estimated_tokens: usize,
    /// Neighbours reported just outside the budget cut.
    pub frontier_size: usize,
    /// Top-k name-search matches folded into the seed set.
    pub seed_search_limit: usize,
    /// Slice handle lease, seconds.
    pub lease_ttl_secs: u64,
    /// LRU entry cap for the slice cache.
    pub cache_entries: usize,
}

impl Default for SliceConfig {
    fn default() -> Self {
        Self {
            default_max_cards: 24,
            default_max_estimated_tokens: 12_000,
            frontier_size: 8,
            seed_search_limit: 10,
            lease_ttl_secs: 3_600,
            cache_entries: 64,
        }
    }
}

/// Blast-radius traversal and governor settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BlastConfig {
    pub max_hops: u32,
    pub default_max_cards: usize,
    pub default_max_tokens: usize,
    /// Deadline for the external diagnostics producer, milliseconds.
    pub diagnostics_deadline_ms: u64,
}

impl Default for BlastConfig {
    fn default() -> Self {
        Self {
            max_hops: 3,
            default_max_cards: 40,
            default_max_tokens: 16_000,
            diagnostics_deadline_ms: 5_000,
        }
    }
}

/// Capacities of the process-wide bounded caches.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub prepared_statements: usize,
    pub hotpath_matchers: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self { prepared_statements: 200, hotpath_matchers: 32 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Repo-local state directory; the ledger database lives at
    /// `<output_dir>/sdl.db`.
    pub output_dir: PathBuf,
    /// Settings that govern file discovery and exclusion.
    pub scan: ScanConfig,
    pub token_estimator: TokenEstimatorConfig,
    pub edge_weights: EdgeWeightConfig,
    pub slice: SliceConfig,
    pub blast: BlastConfig,
    pub cache: CacheConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from(".symledger"),
            scan: ScanConfig::default(),
            token_estimator: TokenEstimatorConfig::default(),
            edge_weights: EdgeWeightConfig::default(),
            slice: SliceConfig::default(),
            blast: BlastConfig::default(),
            cache: CacheConfig::default(),
        }
    }
}

pub fn load_config(repo_root: &Path) -> Config {
    let primary = repo_root.join(".symledger.json");

    let text = std::fs::read_to_string(&primary);
    let Ok(text) = text else { return Config::default() };

    serde_json::from_str::<Config>(&text).unwrap_or_else(|_| Config::default())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_or_broken_config_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = load_config(dir.path());
        assert_eq!(cfg.slice.lease_ttl_secs, 3_600);

        std::fs::write(dir.path().join(".symledger.json"), "{not json").unwrap();
        let cfg = load_config(dir.path());
        assert_eq!(cfg.blast.max_hops, 3);
    }

    #[test]
    fn partial_config_keeps_unset_sections() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join(".symledger.json"),
            r#"{ "slice": { "default_max_cards": 5 } }"#,
        )
        .unwrap();
        let cfg = load_config(dir.path());
        assert_eq!(cfg.slice.default_max_cards, 5);
        assert_eq!(cfg.slice.frontier_size, 8);
        assert_eq!(cfg.edge_weights.import, 0.6);
    }
}
