//! Engine configuration — loaded from `.knowledge-engine.toml` with CLI
//! overrides, mirroring the teacher's `.codescope.toml` convention
//! (see `types::ScanConfig` in the teacher repo for the original shape).

use serde::Deserialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};

fn default_skip_dirs() -> HashSet<String> {
    [".git", "node_modules", "__pycache__", ".build", ".venv", ".DS_Store", "target", ".next"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

/// Root configuration for a single engine instance (one corpus).
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Directory containing the SQLite store and side files. Default `~/data/`.
    pub data_dir: PathBuf,
    /// Corpus root directory to scan.
    pub root: PathBuf,
    /// Include globs; empty means "all non-excluded text files".
    pub include: Vec<String>,
    /// Exclude globs, applied in addition to `skip_dirs`.
    pub exclude: Vec<String>,
    /// Directory names always skipped during the walk (spec.md §4.5).
    pub skip_dirs: HashSet<String>,
    /// Bounded worker pool size for the Scanner.
    pub scan_workers: usize,
    /// Files/interval throttle ceiling. 0 disables throttling.
    pub scan_rate_limit: usize,
    /// Throttle interval in milliseconds.
    pub scan_rate_interval_ms: u64,
    /// Maximum file size (bytes) the Chunker will read. spec.md §4.2.
    pub max_file_bytes: u64,
    /// Embedding model identity.
    pub embedding_model: String,
    /// Embedding dimensionality for the configured model.
    pub embedding_dim: usize,
    /// Max texts per `encode_batch` call. spec.md §4.3.
    pub embed_batch_ceiling: usize,
    /// Per-file top-k keywords. spec.md §4.4.
    pub keyword_top_k: usize,
    /// Corpus-size-change threshold (fraction) that triggers IDF rebuild.
    pub idf_rebuild_threshold: f64,
    /// Exact-index ceiling for the ANN Index. spec.md §4.6.
    pub ann_exact_ceiling: usize,
    /// Idle seconds before the ANN Index may be evicted under memory pressure.
    pub ann_idle_ceiling_secs: u64,
    /// Storage write retry cap. spec.md §4.1.
    pub storage_retry_cap: u32,
    /// SQLite busy_timeout in milliseconds.
    pub storage_busy_timeout_ms: u32,
    /// Default/hard result cap for listing and search primitives. spec.md §4.7.
    pub result_cap: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            root: PathBuf::from("."),
            include: Vec::new(),
            exclude: Vec::new(),
            skip_dirs: default_skip_dirs(),
            scan_workers: std::thread::available_parallelism().map(|n| n.get()).unwrap_or(4),
            scan_rate_limit: 0,
            scan_rate_interval_ms: 1000,
            max_file_bytes: 5 * 1024 * 1024,
            embedding_model: "minilm".to_string(),
            embedding_dim: 384,
            embed_batch_ceiling: 32,
            keyword_top_k: 20,
            idf_rebuild_threshold: 0.10,
            ann_exact_ceiling: 200_000,
            ann_idle_ceiling_secs: 300,
            storage_retry_cap: 5,
            storage_busy_timeout_ms: 5_000,
            result_cap: 50,
        }
    }
}

fn default_data_dir() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."))
        .join("data")
}

impl EngineConfig {
    /// Load from a TOML file, falling back to defaults for any missing key
    /// and for a missing/unreadable file entirely.
    pub fn load(path: &Path) -> Self {
        let Ok(content) = std::fs::read_to_string(path) else {
            return Self::default();
        };
        toml::from_str(&content).unwrap_or_else(|e| {
            tracing::warn!(path = %path.display(), error = %e, "Failed to parse config, using defaults");
            Self::default()
        })
    }

    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join("engine.sqlite3")
    }
}
