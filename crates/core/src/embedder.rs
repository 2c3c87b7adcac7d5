//! Embedder — local sentence-encoder wrapper, spec.md §4.3.
//!
//! Batched encode over a warm singleton model follows the teacher's
//! `semantic.rs` device-selection-once / mean-pool-then-normalize shape,
//! but runs the model through `fastembed` (the dependency the teacher's own
//! `Cargo.toml` declares, rather than the `candle` stack its `semantic.rs`
//! actually wired up — see DESIGN.md) instead of a hand-rolled BERT forward
//! pass. `fastembed::TextEmbedding` already mean-pools and L2-normalizes
//! internally, matching spec.md §4.3's normalization requirement for free.

use crate::error::{EngineError, Result};
use std::sync::Mutex;

#[cfg(feature = "semantic")]
use fastembed::{EmbeddingModel, InitOptions, TextEmbedding};

/// Identity of the loaded model, surfaced in `get_stats()` (spec.md §4.7).
#[derive(Clone, Debug)]
pub struct ModelIdentity {
    pub name: String,
    pub dim: usize,
}

pub struct Embedder {
    identity: ModelIdentity,
    batch_ceiling: usize,
    #[cfg(feature = "semantic")]
    inner: Mutex<Option<TextEmbedding>>,
    #[cfg(not(feature = "semantic"))]
    _inner: Mutex<()>,
}

impl Embedder {
    pub fn new(model_name: &str, dim: usize, batch_ceiling: usize) -> Self {
        Self {
            identity: ModelIdentity { name: model_name.to_string(), dim },
            batch_ceiling,
            #[cfg(feature = "semantic")]
            inner: Mutex::new(None),
            #[cfg(not(feature = "semantic"))]
            _inner: Mutex::new(()),
        }
    }

    pub fn identity(&self) -> &ModelIdentity {
        &self.identity
    }

    #[cfg(feature = "semantic")]
    fn model_variant(name: &str) -> EmbeddingModel {
        match name {
            "minilm" | "all-minilm-l6-v2" => EmbeddingModel::AllMiniLML6V2,
            "bge-small" => EmbeddingModel::BGESmallENV15,
            _ => EmbeddingModel::AllMiniLML6V2,
        }
    }

    /// Lazily load the model on first use and keep it warm for the life of
    /// the process (spec.md §4.3: "loaded once, reused across requests").
    #[cfg(feature = "semantic")]
    fn ensure_loaded(&self) -> Result<()> {
        let mut guard = self.inner.lock().expect("embedder mutex poisoned");
        if guard.is_some() {
            return Ok(());
        }
        tracing::info!(model = %self.identity.name, "loading embedding model");
        let options = InitOptions::new(Self::model_variant(&self.identity.name)).with_show_download_progress(false);
        let model = TextEmbedding::try_new(options)
            .map_err(|e| EngineError::EmbedFailure { path: "<model load>".into(), chunk_index: 0, reason: e.to_string() })?;
        *guard = Some(model);
        Ok(())
    }

    /// Encode a batch of texts, splitting into sub-batches of at most
    /// `batch_ceiling` (spec.md §4.3). Returns one result per input text in
    /// order; a chunk that fails embedding on both the batch attempt and a
    /// solo retry gets `Err` and the caller stores the envelope with no
    /// embedding rather than failing the whole ingest (spec.md §4.3
    /// EmbedFailure policy).
    #[cfg(feature = "semantic")]
    pub fn encode_batch(&self, texts: &[String]) -> Vec<Result<Vec<f32>>> {
        self.ensure_loaded_or_fill_errors(texts.len());
        if self.inner.lock().expect("embedder mutex poisoned").is_none() {
            return texts
                .iter()
                .map(|_| Err(EngineError::EmbedFailure { path: "<model>".into(), chunk_index: 0, reason: "model unavailable".into() }))
                .collect();
        }

        let mut out: Vec<Option<Result<Vec<f32>>>> = vec![None; texts.len()];
        for batch_start in (0..texts.len()).step_by(self.batch_ceiling.max(1)) {
            let end = (batch_start + self.batch_ceiling.max(1)).min(texts.len());
            let batch = &texts[batch_start..end];
            let refs: Vec<&str> = batch.iter().map(|s| s.as_str()).collect();

            match self.try_embed(&refs) {
                Ok(vectors) => {
                    for (offset, v) in vectors.into_iter().enumerate() {
                        out[batch_start + offset] = Some(Ok(v));
                    }
                }
                Err(batch_err) => {
                    tracing::debug!(error = %batch_err, size = refs.len(), "batch embed failed, retrying per-item");
                    for (offset, text) in refs.iter().enumerate() {
                        let idx = batch_start + offset;
                        match self.try_embed(std::slice::from_ref(text)) {
                            Ok(mut v) => out[idx] = Some(Ok(v.remove(0))),
                            Err(e) => {
                                tracing::warn!(chunk_index = idx, error = %e, "embedding failed after solo retry");
                                out[idx] = Some(Err(EngineError::EmbedFailure {
                                    path: "<chunk>".into(),
                                    chunk_index: idx,
                                    reason: e.to_string(),
                                }));
                            }
                        }
                    }
                }
            }
        }

        out.into_iter()
            .map(|o| o.unwrap_or_else(|| Err(EngineError::EmbedFailure { path: "<chunk>".into(), chunk_index: 0, reason: "no result produced".into() })))
            .collect()
    }

    #[cfg(feature = "semantic")]
    fn ensure_loaded_or_fill_errors(&self, _count: usize) {
        if let Err(e) = self.ensure_loaded() {
            tracing::error!(error = %e, "embedding model failed to load");
        }
    }

    #[cfg(feature = "semantic")]
    fn try_embed(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>> {
        let guard = self.inner.lock().expect("embedder mutex poisoned");
        let model = guard.as_ref().ok_or_else(|| EngineError::EmbedFailure {
            path: "<model>".into(),
            chunk_index: 0,
            reason: "model not loaded".into(),
        })?;
        let owned: Vec<String> = texts.iter().map(|s| s.to_string()).collect();
        model
            .embed(owned, None)
            .map_err(|e| EngineError::EmbedFailure { path: "<batch>".into(), chunk_index: 0, reason: e.to_string() })
    }

    /// Embed a single query string for semantic search (spec.md §4.7
    /// `semantic_search`).
    pub fn encode_query(&self, text: &str) -> Result<Vec<f32>> {
        #[cfg(feature = "semantic")]
        {
            self.ensure_loaded()?;
            self.try_embed(&[text]).map(|mut v| v.remove(0))
        }
        #[cfg(not(feature = "semantic"))]
        {
            let _ = text;
            Err(EngineError::VectorIndexUnavailable("semantic search built without the \"semantic\" feature".into()))
        }
    }
}

pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a <= f32::EPSILON || norm_b <= f32::EPSILON {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cosine_similarity_of_identical_vectors_is_one() {
        let v = vec![0.1, 0.2, 0.3, 0.4];
        let sim = cosine_similarity(&v, &v);
        assert!((sim - 1.0).abs() < 1e-5);
    }

    #[test]
    fn cosine_similarity_of_orthogonal_vectors_is_zero() {
        let a = vec![1.0, 0.0];
        let b = vec![0.0, 1.0];
        assert!(cosine_similarity(&a, &b).abs() < 1e-6);
    }

    #[test]
    fn mismatched_dimensions_are_safely_zero() {
        assert_eq!(cosine_similarity(&[1.0, 2.0], &[1.0]), 0.0);
    }
}
