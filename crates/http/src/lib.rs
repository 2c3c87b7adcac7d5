//! Thin HTTP surface over the eight retrieval primitives (spec.md §4.7).
//!
//! Each handler parses query/body parameters, calls straight into
//! `QueryEngine`, and serializes the resulting envelope as JSON. No business
//! logic lives here — it all belongs to the core crate.

use axum::{
    extract::{Query, State},
    response::{IntoResponse, Json},
    routing::get,
    Router,
};
use knowledge_engine_core::query_engine::QueryEngine;
use knowledge_engine_core::storage::{FileFilters, FileOrder};
use serde::Deserialize;
use std::sync::Arc;

pub fn router(query_engine: Arc<QueryEngine>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/search/full_text", get(full_text_search))
        .route("/search/semantic", get(semantic_search))
        .route("/search/keywords", get(search_by_keywords))
        .route("/files", get(list_files))
        .route("/directories", get(list_directories))
        .route("/files/info", get(get_file_info))
        .route("/files/chunks", get(get_file_chunks))
        .route("/stats", get(get_stats))
        .with_state(query_engine)
}

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok", "version": env!("CARGO_PKG_VERSION") }))
}

#[derive(Deserialize)]
struct FullTextQuery {
    q: String,
    limit: Option<usize>,
    context: Option<usize>,
}

async fn full_text_search(State(qe): State<Arc<QueryEngine>>, Query(q): Query<FullTextQuery>) -> impl IntoResponse {
    Json(qe.full_text_search(&q.q, q.limit.unwrap_or(0), q.context.unwrap_or(0)))
}

#[derive(Deserialize)]
struct SemanticQuery {
    q: String,
    top_k: Option<usize>,
    context: Option<usize>,
}

async fn semantic_search(State(qe): State<Arc<QueryEngine>>, Query(q): Query<SemanticQuery>) -> impl IntoResponse {
    Json(qe.semantic_search(&q.q, q.top_k.unwrap_or(0), q.context.unwrap_or(0)))
}

#[derive(Deserialize)]
struct KeywordQuery {
    keywords: String,
    limit: Option<usize>,
}

async fn search_by_keywords(State(qe): State<Arc<QueryEngine>>, Query(q): Query<KeywordQuery>) -> impl IntoResponse {
    let keywords: Vec<String> = q.keywords.split(',').map(|s| s.trim().to_string()).filter(|s| !s.is_empty()).collect();
    Json(qe.search_by_keywords(&keywords, q.limit.unwrap_or(0)))
}

#[derive(Deserialize)]
struct ListFilesQuery {
    path_prefix: Option<String>,
    name_pattern: Option<String>,
    file_type: Option<String>,
    size_min: Option<u64>,
    size_max: Option<u64>,
    modified_after: Option<f64>,
    modified_before: Option<f64>,
    order: Option<String>,
    limit: Option<usize>,
}

async fn list_files(State(qe): State<Arc<QueryEngine>>, Query(q): Query<ListFilesQuery>) -> impl IntoResponse {
    let filters = FileFilters {
        path_prefix: q.path_prefix,
        name_pattern: q.name_pattern,
        file_type: q.file_type,
        size_min: q.size_min,
        size_max: q.size_max,
        modified_after: q.modified_after,
        modified_before: q.modified_before,
    };
    let order = match q.order.as_deref() {
        Some("size_desc") => FileOrder::SizeDesc,
        Some("modified_desc") => FileOrder::ModifiedDesc,
        _ => FileOrder::PathAsc,
    };
    Json(qe.search_files(filters, q.limit.unwrap_or(0), order))
}

#[derive(Deserialize)]
struct ListDirectoriesQuery {
    root: Option<String>,
    limit: Option<usize>,
}

async fn list_directories(State(qe): State<Arc<QueryEngine>>, Query(q): Query<ListDirectoriesQuery>) -> impl IntoResponse {
    Json(qe.list_directories(q.root.as_deref(), q.limit.unwrap_or(0)))
}

#[derive(Deserialize)]
struct PathQuery {
    path: String,
}

async fn get_file_info(State(qe): State<Arc<QueryEngine>>, Query(q): Query<PathQuery>) -> impl IntoResponse {
    Json(qe.get_file_info(&q.path))
}

#[derive(Deserialize)]
struct ChunksQuery {
    path: String,
    start: Option<usize>,
    end: Option<usize>,
}

async fn get_file_chunks(State(qe): State<Arc<QueryEngine>>, Query(q): Query<ChunksQuery>) -> impl IntoResponse {
    let range = match (q.start, q.end) {
        (Some(s), Some(e)) => Some((s, e)),
        _ => None,
    };
    Json(qe.get_file_chunks(&q.path, range))
}

async fn get_stats(State(qe): State<Arc<QueryEngine>>) -> impl IntoResponse {
    Json(qe.get_stats())
}
