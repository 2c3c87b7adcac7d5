//! Shared response envelope types returned by every Query Engine primitive
//! (spec.md §4.7, §6).

use crate::model::ChunkEnvelope;
use serde::Serialize;
use serde_json::{Map, Value};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    Success,
    NoResults,
    Error,
}

#[derive(Clone, Debug, Serialize)]
pub struct ResultItem {
    pub chunk_envelope: ChunkEnvelope,
    pub search_metadata: Map<String, Value>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub context_chunks: Vec<ChunkEnvelope>,
}

/// The envelope every retrieval primitive returns (spec.md §6).
#[derive(Clone, Debug, Serialize)]
pub struct Envelope {
    pub status: Status,
    pub query_metadata: Map<String, Value>,
    pub results: Vec<ResultItem>,
    pub usage_hints: Map<String, Value>,
    pub summary: Map<String, Value>,
}

impl Envelope {
    pub fn error(message: &str, hint: &str) -> Self {
        let mut query_metadata = Map::new();
        query_metadata.insert("error".into(), Value::String(message.to_string()));
        query_metadata.insert("hint".into(), Value::String(hint.to_string()));
        Self { status: Status::Error, query_metadata, results: Vec::new(), usage_hints: Map::new(), summary: Map::new() }
    }

    pub fn empty(query_metadata: Map<String, Value>, usage_hints: Map<String, Value>) -> Self {
        let mut summary = Map::new();
        summary.insert("result_count".into(), Value::from(0));
        Self { status: Status::NoResults, query_metadata, results: Vec::new(), usage_hints, summary }
    }

    pub fn ok(
        results: Vec<ResultItem>,
        query_metadata: Map<String, Value>,
        usage_hints: Map<String, Value>,
        mut summary: Map<String, Value>,
    ) -> Self {
        let status = if results.is_empty() { Status::NoResults } else { Status::Success };
        summary.insert("result_count".into(), Value::from(results.len()));
        Self { status, query_metadata, results, usage_hints, summary }
    }
}

pub fn usage_hints(pairs: &[(&str, &str)]) -> Map<String, Value> {
    pairs.iter().map(|(k, v)| (k.to_string(), Value::String(v.to_string()))).collect()
}

pub fn metadata(pairs: Vec<(&str, Value)>) -> Map<String, Value> {
    pairs.into_iter().map(|(k, v)| (k.to_string(), v)).collect()
}
