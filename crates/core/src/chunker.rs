//! Chunker — splits file content into self-sufficient envelopes, spec.md §4.2.
//!
//! The accumulate-into-a-buffer-then-flush-at-a-boundary shape follows the
//! teacher's `extract_chunks` in `semantic.rs`, generalized from a single
//! blank-line-boundary strategy to the three strategies spec.md names.

use crate::error::{EngineError, Result};
use crate::model::{AiMetadata, ChunkEnvelope, ChunkMetadata, ChunkPosition, ChunkStrategy, RetrievalContextSuggestion};
use std::path::Path;

const CODE_TARGET_CHARS: usize = 350;
const PROSE_TARGET_CHARS: usize = 800;
const PROSE_OVERLAP_FRACTION: f64 = 0.15;

/// File types chunked as code; everything else — including the prose set
/// (`.md`, `.markdown`, `.txt`, `.org`, `.rst`, `.tex`, `.adoc`) and any
/// unrecognized type — chunks as `prose_discrete` (spec.md §4.2).
/// `prose_overlap` is an opt-in variant, not a default.
const CODE_EXTENSIONS: &[&str] =
    &["py", "js", "ts", "c", "cpp", "java", "rs", "go", "sh", "rb", "php", "swift", "kt", "jsx", "tsx"];

pub fn strategy_for(file_type: &str) -> ChunkStrategy {
    if CODE_EXTENSIONS.contains(&file_type) {
        ChunkStrategy::CodeDiscrete
    } else {
        ChunkStrategy::ProseDiscrete
    }
}

/// Read a file's content, applying spec.md §4.2's size ceiling and the
/// latin-1 fallback for files that aren't valid UTF-8.
pub fn read_file_content(path: &Path, max_bytes: u64) -> Result<String> {
    let metadata = std::fs::metadata(path).map_err(|e| EngineError::FileUnreadable {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })?;
    if metadata.len() > max_bytes {
        return Err(EngineError::FileTooLarge { path: path.to_path_buf(), size: metadata.len(), ceiling: max_bytes });
    }
    let bytes = std::fs::read(path).map_err(|e| EngineError::FileUnreadable {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })?;
    match String::from_utf8(bytes.clone()) {
        Ok(s) => Ok(s),
        Err(_) => Ok(bytes.iter().map(|&b| b as char).collect()),
    }
}

/// Produce the full ordered set of envelopes for one file's content.
pub fn chunk_file(
    file_path: &str,
    content: &str,
    file_type: &str,
    file_hash: &str,
    created_at: &str,
) -> Vec<ChunkEnvelope> {
    let strategy = strategy_for(file_type);
    let raw_chunks: Vec<(String, usize)> = match strategy {
        ChunkStrategy::CodeDiscrete => split_discrete(content, CODE_TARGET_CHARS, is_code_boundary),
        ChunkStrategy::ProseDiscrete => split_discrete(content, PROSE_TARGET_CHARS, is_paragraph_boundary),
        ChunkStrategy::ProseOverlap => split_overlap(content, PROSE_TARGET_CHARS, PROSE_OVERLAP_FRACTION),
    };

    let total = raw_chunks.len();
    raw_chunks
        .into_iter()
        .enumerate()
        .map(|(index, (text, overlap_chars))| {
            build_envelope(file_path, file_type, file_hash, created_at, strategy, index, total, overlap_chars, text)
        })
        .collect()
}

fn build_envelope(
    file_path: &str,
    file_type: &str,
    file_hash: &str,
    created_at: &str,
    strategy: ChunkStrategy,
    index: usize,
    total: usize,
    overlap_chars: usize,
    text: String,
) -> ChunkEnvelope {
    let position = ChunkPosition::for_index(index, total);
    let line_count = text.lines().count();
    let word_count = text.split_whitespace().count();
    let starts_with = text.chars().take(80).collect::<String>();
    let ends_with = text.chars().rev().take(80).collect::<Vec<_>>().into_iter().rev().collect::<String>();

    let mut adjacent = [index, index, index];
    if total > 1 {
        adjacent[0] = index.saturating_sub(1);
        adjacent[2] = (index + 1).min(total - 1);
    }

    let ai_metadata = AiMetadata {
        line_count,
        word_count,
        chunk_position: position,
        has_previous: index > 0,
        has_next: index + 1 < total,
        previous_chunk_index: index.checked_sub(1),
        next_chunk_index: if index + 1 < total { Some(index + 1) } else { None },
        starts_with,
        ends_with,
        adjacent_chunk_indexes: adjacent,
        retrieval_context_suggestion: RetrievalContextSuggestion::for_position(position),
    };

    let metadata = ChunkMetadata {
        filename: file_path.to_string(),
        chunk_index: index,
        total_chunks: total,
        chunk_size: text.len(),
        chunk_strategy: strategy,
        overlap_chars,
        file_type: file_type.to_string(),
        file_hash: file_hash.to_string(),
        created_at: created_at.to_string(),
        ai_metadata,
    };

    ChunkEnvelope { metadata, content: text, embedding: None, row_id: None, file_path: file_path.to_string() }
}

/// A discrete (non-overlapping) split: accumulate lines into a buffer,
/// flushing whenever the target size is reached AND a boundary predicate
/// is satisfied, so chunks end on a natural statement/paragraph edge
/// rather than mid-line.
fn split_discrete(content: &str, target_chars: usize, is_boundary: fn(&str) -> bool) -> Vec<(String, usize)> {
    let mut out = Vec::new();
    let mut buf = String::new();

    for line in content.lines() {
        if !buf.is_empty() {
            buf.push('\n');
        }
        buf.push_str(line);

        if buf.len() >= target_chars && is_boundary(line) {
            out.push((std::mem::take(&mut buf), 0));
        }
    }
    if !buf.trim().is_empty() {
        out.push((buf, 0));
    }
    if out.is_empty() && !content.is_empty() {
        out.push((content.to_string(), 0));
    }
    out
}

/// Overlapping prose split: same accumulation as `split_discrete`, but each
/// chunk after the first is seeded with a trailing ~`fraction` slice of the
/// previous chunk's text (spec.md §4.2 `prose_overlap`).
fn split_overlap(content: &str, target_chars: usize, fraction: f64) -> Vec<(String, usize)> {
    let plain = split_discrete(content, target_chars, is_paragraph_boundary);
    if plain.len() <= 1 {
        return plain;
    }

    let mut out = Vec::with_capacity(plain.len());
    let mut prev_text: Option<String> = None;
    for (text, _) in plain {
        match prev_text.take() {
            None => {
                out.push((text.clone(), 0));
            }
            Some(prev) => {
                let overlap_len = ((prev.len() as f64) * fraction).round() as usize;
                let tail: String = prev.chars().rev().take(overlap_len).collect::<Vec<_>>().into_iter().rev().collect();
                let mut combined = tail.clone();
                if !combined.is_empty() {
                    combined.push('\n');
                }
                combined.push_str(&text);
                out.push((combined, tail.chars().count()));
            }
        }
        prev_text = Some(text);
    }
    out
}

fn is_code_boundary(line: &str) -> bool {
    let trimmed = line.trim_end();
    trimmed.is_empty()
        || trimmed.ends_with(';')
        || trimmed.ends_with('}')
        || trimmed.ends_with(':')
}

fn is_paragraph_boundary(line: &str) -> bool {
    line.trim().is_empty()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn code_discrete_produces_contiguous_positions() {
        let content = (0..80).map(|i| format!("let x{i} = {i};")).collect::<Vec<_>>().join("\n");
        let envelopes = chunk_file("src/lib.rs", &content, "rs", "deadbeef", "2026-01-01T00:00:00Z");
        assert!(envelopes.len() > 1);
        for (i, env) in envelopes.iter().enumerate() {
            assert_eq!(env.metadata.chunk_index, i);
            assert_eq!(env.metadata.total_chunks, envelopes.len());
        }
        assert_eq!(envelopes[0].metadata.ai_metadata.chunk_position, ChunkPosition::Start);
        assert_eq!(
            envelopes.last().unwrap().metadata.ai_metadata.chunk_position,
            ChunkPosition::End
        );
    }

    #[test]
    fn prose_overlap_seeds_trailing_context() {
        let paragraph = "word ".repeat(200);
        let content = format!("{paragraph}\n\n{paragraph}\n\n{paragraph}");
        let envelopes = chunk_file("notes.md", &content, "md", "deadbeef", "2026-01-01T00:00:00Z");
        assert!(envelopes.len() > 1);
        assert!(envelopes[1].metadata.overlap_chars > 0);
    }

    #[test]
    fn single_short_file_is_one_chunk() {
        let envelopes = chunk_file("a.rs", "fn main() {}", "rs", "hash", "2026-01-01T00:00:00Z");
        assert_eq!(envelopes.len(), 1);
        assert_eq!(envelopes[0].metadata.total_chunks, 1);
        assert!(!envelopes[0].metadata.ai_metadata.has_previous);
        assert!(!envelopes[0].metadata.ai_metadata.has_next);
    }
}
