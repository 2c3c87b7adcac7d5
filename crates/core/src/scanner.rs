//! Scanner — discovers and ingests files into Storage, spec.md §4.5.
//!
//! The gitignore-respecting, filtered parallel directory walk is carried
//! over from the teacher's `walk_files_parallel` in `scan.rs`, generalized
//! from "collect file paths for in-memory indexes" to "ingest each file
//! through Chunker → Embedder → KeywordAnalyzer → Storage, one file per
//! atomic transaction, with throttling and cooperative cancellation."

use crate::chunker;
use crate::config::EngineConfig;
use crate::embedder::Embedder;
use crate::error::Result;
use crate::keyword_analyzer::{self, TermDocFreq};
use crate::model::ProcessingSession;
use crate::storage::{hash_file, Storage};
use globset::{Glob, GlobSet, GlobSetBuilder};
use ignore::WalkBuilder;
use rayon::prelude::*;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Cooperative cancellation flag shared between the Server Loop and a
/// running scan; set to request an early, clean stop (spec.md §4.5).
#[derive(Clone, Default)]
pub struct Interrupt(Arc<AtomicBool>);

impl Interrupt {
    pub fn new() -> Self {
        Self(Arc::new(AtomicBool::new(false)))
    }

    pub fn request(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_requested(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Default, Clone)]
struct Counters {
    discovered: u64,
    processed: u64,
    skipped: u64,
    failed: u64,
}

pub struct Scanner {
    storage: Arc<Storage>,
    embedder: Arc<Embedder>,
    config: EngineConfig,
}

impl Scanner {
    pub fn new(storage: Arc<Storage>, embedder: Arc<Embedder>, config: EngineConfig) -> Self {
        Self { storage, embedder, config }
    }

    /// Discover files under `config.root`, ingest each one, and record a
    /// `ProcessingSession` summary row (spec.md §4.5, §3).
    ///
    /// `force_rescan` bypasses the hash-match skip so every discovered file
    /// is re-chunked and re-embedded even when its content is unchanged
    /// (spec.md §4.5 Inputs).
    pub fn run(&self, interrupt: &Interrupt, force_rescan: bool) -> Result<ProcessingSession> {
        let session_id = uuid::Uuid::new_v4().to_string();
        let started_at = now_rfc3339();
        tracing::info!(session_id, root = %self.config.root.display(), "scan starting");

        let paths = self.walk();
        let counters = Mutex::new(Counters { discovered: paths.len() as u64, ..Default::default() });
        let retries_before = self.storage.retry_snapshot();
        let mut doc_freq = TermDocFreq::new();
        let baseline_docs = doc_freq.total_docs;

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.config.scan_workers.max(1))
            .build()
            .map_err(|e| crate::error::EngineError::StorageCorrupt(format!("scan pool build failed: {e}")))?;

        let throttle_every = if self.config.scan_rate_limit > 0 { self.config.scan_rate_limit } else { 0 };
        let throttle_interval = Duration::from_millis(self.config.scan_rate_interval_ms);

        let per_file_texts: Mutex<Vec<(String, String)>> = Mutex::new(Vec::new());

        pool.install(|| {
            paths.par_iter().enumerate().for_each(|(i, path)| {
                if interrupt.is_requested() {
                    return;
                }
                if throttle_every > 0 && i > 0 && i % throttle_every == 0 {
                    std::thread::sleep(throttle_interval);
                }

                match self.ingest_one(path, force_rescan) {
                    Ok(Some(text)) => {
                        let rel = relative_path(&self.config.root, path);
                        per_file_texts.lock().expect("poisoned").push((rel, text));
                        counters.lock().expect("poisoned").processed += 1;
                    }
                    Ok(None) => {
                        counters.lock().expect("poisoned").skipped += 1;
                    }
                    Err(e) => {
                        tracing::warn!(path = %path.display(), error = %e, "file ingest failed");
                        counters.lock().expect("poisoned").failed += 1;
                    }
                }
            });
        });

        // Keyword analysis runs after ingest so the IDF table sees the
        // whole batch before any single file's TF-IDF scores are computed
        // (spec.md §4.4).
        let texts = per_file_texts.into_inner().expect("poisoned");
        for (_, text) in &texts {
            doc_freq.observe_document(&keyword_analyzer::distinct_terms(text));
        }
        if doc_freq.growth_since(baseline_docs) >= self.config.idf_rebuild_threshold || baseline_docs == 0 {
            for (path, text) in &texts {
                let keywords = keyword_analyzer::analyze(text, &doc_freq, self.config.keyword_top_k);
                if let Err(e) = self.storage.upsert_analysis(path, &keywords) {
                    tracing::warn!(path, error = %e, "failed to persist keyword analysis");
                }
            }
        }

        let interrupted = interrupt.is_requested();
        let counters = counters.into_inner().expect("poisoned");
        let retry_delta = self.storage.retry_snapshot() - retries_before;
        let session = ProcessingSession {
            session_id,
            started_at,
            ended_at: now_rfc3339(),
            discovered: counters.discovered,
            processed: counters.processed,
            skipped: counters.skipped,
            failed: counters.failed,
            interrupted,
            total_retries: retry_delta.retries,
            max_attempts_reached: retry_delta.max_attempts_reached,
        };
        self.storage.record_session(&session)?;
        tracing::info!(
            session_id = %session.session_id,
            processed = session.processed,
            skipped = session.skipped,
            failed = session.failed,
            interrupted,
            "scan finished"
        );
        Ok(session)
    }

    fn walk(&self) -> Vec<PathBuf> {
        let results: Mutex<Vec<PathBuf>> = Mutex::new(Vec::new());
        let skip = self.config.skip_dirs.clone();
        let max_bytes = self.config.max_file_bytes;
        let include = build_globset(&self.config.include);
        let exclude = build_globset(&self.config.exclude);

        WalkBuilder::new(&self.config.root)
            .hidden(true)
            .git_ignore(true)
            .git_global(true)
            .git_exclude(true)
            .threads(rayon::current_num_threads().min(12))
            .filter_entry(move |entry| {
                if entry.file_type().is_some_and(|ft| ft.is_dir()) {
                    let name = entry.file_name().to_string_lossy();
                    return !skip.contains(name.as_ref());
                }
                true
            })
            .build_parallel()
            .run(|| {
                let results = &results;
                let include = include.clone();
                let exclude = exclude.clone();
                Box::new(move |entry| {
                    let entry = match entry {
                        Ok(e) => e,
                        Err(_) => return ignore::WalkState::Continue,
                    };
                    if !entry.file_type().is_some_and(|ft| ft.is_file()) {
                        return ignore::WalkState::Continue;
                    }
                    if let Ok(meta) = entry.metadata() {
                        if meta.len() > max_bytes {
                            return ignore::WalkState::Continue;
                        }
                    }
                    // Include globs restrict the scan to matching paths;
                    // exclude globs are applied on top of skip_dirs/gitignore
                    // (spec.md §4.5 Inputs).
                    if let Some(exclude) = &exclude {
                        if exclude.is_match(entry.path()) {
                            return ignore::WalkState::Continue;
                        }
                    }
                    if let Some(include) = &include {
                        if !include.is_match(entry.path()) {
                            return ignore::WalkState::Continue;
                        }
                    }
                    results.lock().expect("poisoned").push(entry.path().to_path_buf());
                    ignore::WalkState::Continue
                })
            });

        results.into_inner().expect("poisoned")
    }

    /// Ingest one file end to end: hash, chunk, embed, persist. Returns
    /// `Ok(Some(full_text))` on a fresh, changed, or force-rescanned file
    /// (so the caller can feed it to keyword analysis), `Ok(None)` if
    /// unchanged and not forced.
    fn ingest_one(&self, path: &Path, force_rescan: bool) -> Result<Option<String>> {
        let rel = relative_path(&self.config.root, path);
        let metadata = std::fs::metadata(path)?;
        let hash = hash_file(path)?;
        let mtime = metadata
            .modified()
            .ok()
            .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
            .map(|d| d.as_secs_f64())
            .unwrap_or(0.0);
        let file_type = path.extension().and_then(|e| e.to_str()).unwrap_or("").to_string();

        let changed = self.storage.upsert_file(&rel, metadata.len(), mtime, &hash, &file_type, &now_rfc3339())?;
        let is_new = self.storage.chunk_count(&rel)? == 0;
        if !changed && !is_new && !force_rescan {
            return Ok(None);
        }
        if force_rescan && !changed && !is_new {
            // Hash matched so upsert_file left the existing envelopes in
            // place; delete them before re-ingesting (spec.md §4.5 Inputs).
            self.storage.delete_chunks(&rel)?;
        }

        let content = match chunker::read_file_content(path, self.config.max_file_bytes) {
            Ok(c) => c,
            Err(e) => {
                tracing::debug!(path = %rel, error = %e, "skipping unreadable or oversized file");
                return Err(e);
            }
        };

        let mut envelopes = chunker::chunk_file(&rel, &content, &file_type, &hash, &now_rfc3339());
        let texts: Vec<String> = envelopes.iter().map(|e| e.content.clone()).collect();

        #[cfg(feature = "semantic")]
        {
            let embeddings = self.embedder.encode_batch(&texts);
            for (env, result) in envelopes.iter_mut().zip(embeddings) {
                match result {
                    Ok(v) => env.embedding = Some(v),
                    Err(e) => tracing::debug!(path = %rel, chunk = env.metadata.chunk_index, error = %e, "chunk embedding unavailable"),
                }
            }
        }
        #[cfg(not(feature = "semantic"))]
        {
            let _ = &self.embedder;
        }

        self.storage.insert_chunks(&rel, &envelopes)?;
        Ok(Some(content))
    }
}

/// Compile a glob list into a matcher; `None` for an empty list so callers
/// can skip the check entirely (spec.md §4.5 Inputs: "empty means all
/// non-excluded text files").
fn build_globset(patterns: &[String]) -> Option<Arc<GlobSet>> {
    if patterns.is_empty() {
        return None;
    }
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        match Glob::new(pattern) {
            Ok(glob) => {
                builder.add(glob);
            }
            Err(e) => tracing::warn!(pattern, error = %e, "invalid glob pattern, ignoring"),
        }
    }
    builder.build().ok().map(Arc::new)
}

fn relative_path(root: &Path, path: &Path) -> String {
    path.strip_prefix(root).unwrap_or(path).to_string_lossy().replace('\\', "/")
}

fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true)
}

pub fn elapsed_since(start: Instant) -> Duration {
    start.elapsed()
}
