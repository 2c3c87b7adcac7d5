//! QueryEngine — executes the eight retrieval primitives, spec.md §4.7.

use crate::ann_index::AnnIndex;
use crate::config::EngineConfig;
use crate::embedder::Embedder;
use crate::error::EngineError;
use crate::freshness::FreshnessLayer;
use crate::model::ChunkEnvelope;
use crate::response::{metadata, usage_hints, Envelope, ResultItem};
use crate::storage::{DirectorySummary, FileFilters, FileOrder, Storage};
use serde_json::{Map, Value};
use std::path::Path;
use std::sync::Arc;

pub struct QueryEngine {
    storage: Arc<Storage>,
    embedder: Arc<Embedder>,
    ann_index: Arc<AnnIndex>,
    freshness: FreshnessLayer,
    root: std::path::PathBuf,
    result_cap: usize,
}

impl QueryEngine {
    pub fn new(storage: Arc<Storage>, embedder: Arc<Embedder>, ann_index: Arc<AnnIndex>, config: &EngineConfig) -> Self {
        Self {
            storage,
            embedder,
            ann_index,
            freshness: FreshnessLayer::open(&config.root),
            root: config.root.clone(),
            result_cap: config.result_cap,
        }
    }

    fn cap(&self, requested: usize) -> (usize, bool) {
        if requested == 0 || requested > self.result_cap {
            (self.result_cap, requested > self.result_cap)
        } else {
            (requested, false)
        }
    }

    fn freshness_tag(&self, path: &str) -> Option<&'static str> {
        self.freshness.classify(&self.storage, &self.root, path).ok().map(|f| f.as_str())
    }

    /// spec.md §4.7 `full_text_search(q, limit, ctx?)`.
    pub fn full_text_search(&self, query: &str, limit: usize, ctx: usize) -> Envelope {
        let (capped, warned) = self.cap(limit);
        let rows = match self.storage.full_text_search(query, capped) {
            Ok(rows) => rows,
            Err(e) => return Envelope::error(&e.to_string(), "check FTS5 query syntax (quoted phrases, AND/OR/NOT, term* prefixes)"),
        };

        let mut results = Vec::with_capacity(rows.len());
        for (envelope, relevance, snippet) in rows {
            let mut search_metadata = Map::new();
            search_metadata.insert("relevance".into(), Value::from(relevance));
            search_metadata.insert("snippet".into(), Value::from(snippet));
            if let Some(tag) = self.freshness_tag(&envelope.file_path) {
                search_metadata.insert("freshness".into(), Value::from(tag));
            }
            let context_chunks = self.context_for(&envelope, ctx);
            results.push(ResultItem { chunk_envelope: envelope, search_metadata, context_chunks });
        }

        let query_metadata = metadata(vec![
            ("query", Value::from(query)),
            ("limit_requested", Value::from(limit)),
            ("limit_applied", Value::from(capped)),
            ("limit_capped", Value::from(warned)),
        ]);
        Envelope::ok(results, query_metadata, search_usage_hints(), Map::new())
    }

    /// spec.md §4.7 `semantic_search(q, top_k, ctx?)`.
    pub fn semantic_search(&self, query: &str, top_k: usize, ctx: usize) -> Envelope {
        let (capped, warned) = self.cap(top_k);

        if let Err(e) = self.ann_index.refresh(&self.storage) {
            return Envelope::error(&e.to_string(), "vector index build failed; full_text_search and search_by_keywords remain available");
        }

        let query_vector = match self.embedder.encode_query(query) {
            Ok(v) => v,
            Err(e) => return Envelope::error(&e.to_string(), "semantic search requires the embedding model to be loaded"),
        };

        let hits = match self.ann_index.search(&query_vector, capped) {
            Ok(h) => h,
            Err(EngineError::VectorIndexUnavailable(msg)) => {
                return Envelope::empty(
                    metadata(vec![("query", Value::from(query)), ("vector_index_unavailable", Value::from(msg))]),
                    search_usage_hints(),
                );
            }
            Err(e) => return Envelope::error(&e.to_string(), "retry after the next scan rebuilds the vector index"),
        };

        let mut results = Vec::with_capacity(hits.len());
        for hit in hits {
            let Ok(Some(envelope)) = self.lookup_by_row_id(hit.chunk_row_id) else { continue };
            let mut search_metadata = Map::new();
            search_metadata.insert("similarity".into(), Value::from(hit.score));
            if let Some(tag) = self.freshness_tag(&envelope.file_path) {
                search_metadata.insert("freshness".into(), Value::from(tag));
            }
            let context_chunks = self.context_for(&envelope, ctx);
            results.push(ResultItem { chunk_envelope: envelope, search_metadata, context_chunks });
        }

        let query_metadata = metadata(vec![
            ("query", Value::from(query)),
            ("limit_requested", Value::from(top_k)),
            ("limit_applied", Value::from(capped)),
            ("limit_capped", Value::from(warned)),
            ("approximate_index", Value::from(self.ann_index.is_approximate())),
        ]);
        Envelope::ok(results, query_metadata, search_usage_hints(), Map::new())
    }

    /// spec.md §4.7 `keyword_search(keywords[], limit)`.
    pub fn search_by_keywords(&self, keywords: &[String], limit: usize) -> Envelope {
        let (capped, warned) = self.cap(limit);
        let rows = match self.storage.keyword_search(keywords, capped) {
            Ok(r) => r,
            Err(e) => return Envelope::error(&e.to_string(), "check that keywords are non-empty strings"),
        };

        let mut results = Vec::with_capacity(rows.len());
        for (file, score) in rows {
            let chunks = self.storage.get_chunks(&file.path, None).unwrap_or_default();
            let Some(first) = chunks.into_iter().next() else { continue };
            let mut search_metadata = Map::new();
            search_metadata.insert("keyword_score".into(), Value::from(score));
            if let Some(tag) = self.freshness_tag(&file.path) {
                search_metadata.insert("freshness".into(), Value::from(tag));
            }
            results.push(ResultItem { chunk_envelope: first, search_metadata, context_chunks: Vec::new() });
        }

        let query_metadata = metadata(vec![
            ("keywords", Value::from(keywords.to_vec())),
            ("limit_requested", Value::from(limit)),
            ("limit_applied", Value::from(capped)),
            ("limit_capped", Value::from(warned)),
        ]);
        Envelope::ok(results, query_metadata, search_usage_hints(), Map::new())
    }

    /// spec.md §4.7 `list_files` (predicate-based file listing).
    pub fn search_files(&self, filters: FileFilters, limit: usize, order: FileOrder) -> Envelope {
        let (capped, warned) = self.cap(limit);
        let files = match self.storage.list_files(&filters, capped, order) {
            Ok(f) => f,
            Err(e) => return Envelope::error(&e.to_string(), "check filter values (size/modified bounds, glob pattern)"),
        };

        let mut summary = Map::new();
        summary.insert("total_matched".into(), Value::from(files.len()));
        let query_metadata = metadata(vec![
            ("limit_requested", Value::from(limit)),
            ("limit_applied", Value::from(capped)),
            ("limit_capped", Value::from(warned)),
        ]);
        let mut hints = Map::new();
        hints.insert("files".into(), Value::from("file_path, size, mtime, content_hash, file_type, discovered_at per entry"));
        Envelope::ok(
            files.into_iter().map(file_record_result).collect(),
            query_metadata,
            hints,
            summary,
        )
    }

    /// spec.md §4.7 `list_directories`.
    pub fn list_directories(&self, root: Option<&str>, limit: usize) -> Envelope {
        let (capped, warned) = self.cap(limit);
        let dirs = match self.storage.list_directories(root, capped) {
            Ok(d) => d,
            Err(e) => return Envelope::error(&e.to_string(), "check the root path filter"),
        };

        let query_metadata = metadata(vec![
            ("root", root.map(Value::from).unwrap_or(Value::Null)),
            ("limit_requested", Value::from(limit)),
            ("limit_applied", Value::from(capped)),
            ("limit_capped", Value::from(warned)),
        ]);
        let mut hints = Map::new();
        hints.insert("directories".into(), Value::from("each entry has path, file_count, total_size"));
        let mut summary = Map::new();
        summary.insert("directory_count".into(), Value::from(dirs.len()));

        let results = dirs
            .into_iter()
            .map(|d: DirectorySummary| {
                let mut search_metadata = Map::new();
                search_metadata.insert("path".into(), Value::from(d.path));
                search_metadata.insert("file_count".into(), Value::from(d.file_count));
                search_metadata.insert("total_size".into(), Value::from(d.total_size));
                ResultItem { chunk_envelope: directory_placeholder_envelope(), search_metadata, context_chunks: Vec::new() }
            })
            .collect();
        Envelope::ok(results, query_metadata, hints, summary)
    }

    /// spec.md §4.7 `get_file_info`.
    pub fn get_file_info(&self, path: &str) -> Envelope {
        let file = match self.storage.get_file(path) {
            Ok(Some(f)) => f,
            Ok(None) => return Envelope::empty(metadata(vec![("path", Value::from(path))]), Map::new()),
            Err(e) => return Envelope::error(&e.to_string(), "path lookup failed"),
        };
        let chunk_count = self.storage.chunk_count(path).unwrap_or(0);
        let analysis = self.storage.get_analysis(path).unwrap_or(None);
        let freshness = self.freshness_tag(path);

        let mut search_metadata = Map::new();
        search_metadata.insert("size".into(), Value::from(file.size));
        search_metadata.insert("mtime".into(), Value::from(file.mtime));
        search_metadata.insert("content_hash".into(), Value::from(file.content_hash.clone()));
        search_metadata.insert("file_type".into(), Value::from(file.file_type.clone()));
        search_metadata.insert("chunk_count".into(), Value::from(chunk_count));
        if let Some(a) = &analysis {
            search_metadata.insert(
                "top_keywords".into(),
                Value::from(a.keywords.iter().take(10).map(|k| k.keyword.clone()).collect::<Vec<_>>()),
            );
        }
        if let Some(tag) = freshness {
            search_metadata.insert("freshness".into(), Value::from(tag));
        }

        let first_chunk = self.storage.get_chunk(path, 0).ok();
        let chunk_envelope = first_chunk.unwrap_or_else(|| empty_envelope(path));
        let results = vec![ResultItem { chunk_envelope, search_metadata, context_chunks: Vec::new() }];
        Envelope::ok(results, metadata(vec![("path", Value::from(path))]), Map::new(), Map::new())
    }

    /// spec.md §4.7 `get_file_chunks`.
    pub fn get_file_chunks(&self, path: &str, range: Option<(usize, usize)>) -> Envelope {
        let chunks = match self.storage.get_chunks(path, range) {
            Ok(c) => c,
            Err(e) => return Envelope::error(&e.to_string(), "check the chunk range bounds"),
        };
        if chunks.is_empty() {
            return Envelope::empty(metadata(vec![("path", Value::from(path))]), Map::new());
        }
        let results = chunks
            .into_iter()
            .map(|env| ResultItem { chunk_envelope: env, search_metadata: Map::new(), context_chunks: Vec::new() })
            .collect();
        Envelope::ok(results, metadata(vec![("path", Value::from(path))]), Map::new(), Map::new())
    }

    /// spec.md §4.7 `get_stats`.
    pub fn get_stats(&self) -> Envelope {
        let stats = match self.storage.get_stats() {
            Ok(s) => s,
            Err(e) => return Envelope::error(&e.to_string(), "storage unavailable"),
        };
        let mut summary = Map::new();
        summary.insert("total_files".into(), Value::from(stats.total_files));
        summary.insert("total_chunks".into(), Value::from(stats.total_chunks));
        summary.insert("total_embeddings".into(), Value::from(stats.total_embeddings));
        summary.insert("total_size_bytes".into(), Value::from(stats.total_size_bytes));
        summary.insert(
            "per_extension".into(),
            Value::Object(stats.per_extension.into_iter().map(|(k, v)| (k, Value::from(v))).collect()),
        );
        summary.insert("vector_index_built".into(), Value::from(self.ann_index.is_built()));
        summary.insert("vector_index_approximate".into(), Value::from(self.ann_index.is_approximate()));
        summary.insert("vector_count".into(), Value::from(self.ann_index.vector_count()));
        summary.insert("embedding_model".into(), Value::from(self.embedder.identity().name.clone()));
        Envelope::ok(Vec::new(), Map::new(), Map::new(), summary)
    }

    fn context_for(&self, envelope: &ChunkEnvelope, ctx: usize) -> Vec<ChunkEnvelope> {
        if ctx == 0 {
            return Vec::new();
        }
        let index = envelope.metadata.chunk_index;
        let lo = index.saturating_sub(ctx);
        let hi = index + ctx;
        self.storage
            .get_chunks(&envelope.file_path, Some((lo, hi)))
            .unwrap_or_default()
            .into_iter()
            .filter(|c| c.metadata.chunk_index != index)
            .collect()
    }

    fn lookup_by_row_id(&self, row_id: i64) -> crate::error::Result<Option<ChunkEnvelope>> {
        self.storage.get_chunk_by_row_id(row_id)
    }
}

fn search_usage_hints() -> Map<String, Value> {
    usage_hints(&[
        ("chunk_envelope", "the full stored envelope, unchanged from ingest"),
        ("search_metadata", "ranking/similarity score plus freshness tag"),
        ("context_chunks", "adjacent envelopes when ctx>0 was requested"),
    ])
}

fn file_record_result(file: crate::model::FileRecord) -> ResultItem {
    let mut search_metadata = Map::new();
    search_metadata.insert("size".into(), Value::from(file.size));
    search_metadata.insert("mtime".into(), Value::from(file.mtime));
    search_metadata.insert("file_type".into(), Value::from(file.file_type.clone()));
    ResultItem { chunk_envelope: empty_envelope(&file.path), search_metadata, context_chunks: Vec::new() }
}

fn empty_envelope(path: &str) -> ChunkEnvelope {
    use crate::model::{AiMetadata, ChunkMetadata, ChunkPosition, ChunkStrategy, RetrievalContextSuggestion};
    ChunkEnvelope {
        metadata: ChunkMetadata {
            filename: path.to_string(),
            chunk_index: 0,
            total_chunks: 0,
            chunk_size: 0,
            chunk_strategy: ChunkStrategy::CodeDiscrete,
            overlap_chars: 0,
            file_type: String::new(),
            file_hash: String::new(),
            created_at: String::new(),
            ai_metadata: AiMetadata {
                line_count: 0,
                word_count: 0,
                chunk_position: ChunkPosition::Start,
                has_previous: false,
                has_next: false,
                previous_chunk_index: None,
                next_chunk_index: None,
                starts_with: String::new(),
                ends_with: String::new(),
                adjacent_chunk_indexes: [0, 0, 0],
                retrieval_context_suggestion: RetrievalContextSuggestion::NextOnly,
            },
        },
        content: String::new(),
        embedding: None,
        row_id: None,
        file_path: path.to_string(),
    }
}

fn directory_placeholder_envelope() -> ChunkEnvelope {
    empty_envelope("")
}

pub fn path_is_within(root: &Path, candidate: &Path) -> bool {
    candidate.strip_prefix(root).is_ok()
}
