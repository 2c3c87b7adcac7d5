//! Core library for the knowledge retrieval engine: ingestion, storage, and
//! retrieval primitives shared by the MCP, HTTP, and CLI surfaces.

pub mod ann_index;
pub mod chunker;
pub mod config;
pub mod embedder;
pub mod error;
pub mod freshness;
pub mod keyword_analyzer;
pub mod model;
pub mod query_engine;
pub mod response;
pub mod scanner;
pub mod storage;

use std::sync::Arc;

/// The full set of long-lived components a Server Loop owns (spec.md §4.9):
/// one Storage connection pool, one warm Embedder, and a lazily-built ANN
/// Index, wired into a QueryEngine for request dispatch.
pub struct Engine {
    pub storage: Arc<storage::Storage>,
    pub embedder: Arc<embedder::Embedder>,
    pub ann_index: Arc<ann_index::AnnIndex>,
    pub query_engine: Arc<query_engine::QueryEngine>,
    pub config: config::EngineConfig,
}

impl Engine {
    pub fn open(config: config::EngineConfig) -> error::Result<Self> {
        let db_path = config.db_path();
        let storage = Arc::new(storage::Storage::open(&db_path, config.storage_retry_cap, config.storage_busy_timeout_ms)?);
        let embedder = Arc::new(embedder::Embedder::new(&config.embedding_model, config.embedding_dim, config.embed_batch_ceiling));
        let ann_index = Arc::new(ann_index::AnnIndex::new(config.ann_exact_ceiling));
        let query_engine = Arc::new(query_engine::QueryEngine::new(storage.clone(), embedder.clone(), ann_index.clone(), &config));
        Ok(Self { storage, embedder, ann_index, query_engine, config })
    }

    pub fn scanner(&self) -> scanner::Scanner {
        scanner::Scanner::new(self.storage.clone(), self.embedder.clone(), self.config.clone())
    }
}
