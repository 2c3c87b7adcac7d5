//! Data model — spec.md §3 and the ChunkEnvelope JSON schema in spec.md §6.
//!
//! `ChunkEnvelope` is modeled as a closed, versioned structure rather than
//! the "dynamic dict" the source system used (spec.md §9 Design Notes):
//! `ai_metadata` carries optional forward-compatible fields, but the shape
//! itself is fixed and serializes to exactly the schema in spec.md §6.

use serde::{Deserialize, Serialize};

/// One of the three chunking strategies selected by file type (spec.md §4.2).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkStrategy {
    CodeDiscrete,
    ProseDiscrete,
    ProseOverlap,
}

impl ChunkStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChunkStrategy::CodeDiscrete => "code_discrete",
            ChunkStrategy::ProseDiscrete => "prose_discrete",
            ChunkStrategy::ProseOverlap => "prose_overlap",
        }
    }
}

impl std::str::FromStr for ChunkStrategy {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "code_discrete" => Ok(ChunkStrategy::CodeDiscrete),
            "prose_discrete" => Ok(ChunkStrategy::ProseDiscrete),
            "prose_overlap" => Ok(ChunkStrategy::ProseOverlap),
            other => Err(format!("unknown chunk strategy: {other}")),
        }
    }
}

/// Position of a chunk within its owning file's chunk sequence.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChunkPosition {
    Start,
    Middle,
    End,
}

impl ChunkPosition {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChunkPosition::Start => "start",
            ChunkPosition::Middle => "middle",
            ChunkPosition::End => "end",
        }
    }

    pub fn for_index(index: usize, total: usize) -> Self {
        if total <= 1 {
            ChunkPosition::Start
        } else if index == 0 {
            ChunkPosition::Start
        } else if index == total - 1 {
            ChunkPosition::End
        } else {
            ChunkPosition::Middle
        }
    }
}

/// How a caller retrieving this chunk should expand context, per spec.md §4.2.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetrievalContextSuggestion {
    Adjacent1,
    NextOnly,
    PreviousOnly,
}

impl RetrievalContextSuggestion {
    pub fn for_position(pos: ChunkPosition) -> Self {
        match pos {
            ChunkPosition::Start => RetrievalContextSuggestion::NextOnly,
            ChunkPosition::End => RetrievalContextSuggestion::PreviousOnly,
            ChunkPosition::Middle => RetrievalContextSuggestion::Adjacent1,
        }
    }
}

/// `ai_metadata` block of the ChunkEnvelope JSON schema (spec.md §6).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AiMetadata {
    pub line_count: usize,
    pub word_count: usize,
    pub chunk_position: ChunkPosition,
    pub has_previous: bool,
    pub has_next: bool,
    pub previous_chunk_index: Option<usize>,
    pub next_chunk_index: Option<usize>,
    pub starts_with: String,
    pub ends_with: String,
    pub adjacent_chunk_indexes: [usize; 3],
    pub retrieval_context_suggestion: RetrievalContextSuggestion,
}

/// `metadata` block of the ChunkEnvelope JSON schema (spec.md §6).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ChunkMetadata {
    pub filename: String,
    pub chunk_index: usize,
    pub total_chunks: usize,
    pub chunk_size: usize,
    pub chunk_strategy: ChunkStrategy,
    pub overlap_chars: usize,
    pub file_type: String,
    pub file_hash: String,
    pub created_at: String,
    pub ai_metadata: AiMetadata,
}

/// A single contiguous slice of a file's content with its full metadata
/// (spec.md §3, §6). Self-sufficient for AI consumption.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ChunkEnvelope {
    pub metadata: ChunkMetadata,
    pub content: String,
    /// Not part of the externally-facing JSON schema; carried alongside the
    /// envelope for Storage round-tripping. `None` when embedding failed or
    /// was never attempted for this chunk (spec.md §4.3 EmbedFailure policy).
    #[serde(skip)]
    pub embedding: Option<Vec<f32>>,
    /// Storage row id, populated once persisted. `None` for an envelope that
    /// has not yet been written.
    #[serde(skip)]
    pub row_id: Option<i64>,
    /// Owning file's path, not serialized into the JSON schema (it's implied
    /// by the surrounding response), but needed for internal plumbing.
    #[serde(skip)]
    pub file_path: String,
}

/// File row (spec.md §3, table `file_metadata`).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FileRecord {
    pub path: String,
    pub size: u64,
    pub mtime: f64,
    pub content_hash: String,
    pub file_type: String,
    pub discovered_at: String,
}

/// Per-file content analysis (spec.md §3, table `content_analysis`).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ContentAnalysis {
    pub file_path: String,
    pub keywords: Vec<KeywordScore>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct KeywordScore {
    pub keyword: String,
    pub score: f64,
}

/// Append-only scan-run audit row (spec.md §3, table `processing_stats`).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProcessingSession {
    pub session_id: String,
    pub started_at: String,
    pub ended_at: String,
    pub discovered: u64,
    pub processed: u64,
    pub skipped: u64,
    pub failed: u64,
    pub interrupted: bool,
    pub total_retries: u64,
    pub max_attempts_reached: u64,
}

/// Freshness annotation for a returned file (spec.md §4.8).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Freshness {
    Fresh,
    ModifiedSinceIndex,
    Deleted,
    UntrackedNew,
}

impl Freshness {
    pub fn as_str(&self) -> &'static str {
        match self {
            Freshness::Fresh => "fresh",
            Freshness::ModifiedSinceIndex => "modified_since_index",
            Freshness::Deleted => "deleted",
            Freshness::UntrackedNew => "untracked_new",
        }
    }
}
