//! ANNIndex — in-memory vector index with the Coherence Protocol, spec.md §4.6.
//!
//! The flat `Vec<f32>` embedding store and dot-product-as-cosine-similarity
//! search (embeddings are already L2-normalized) are carried over from the
//! teacher's `SemanticIndex` / `semantic_search` in `semantic.rs`; this
//! module adds the write-epoch-based staleness tracking spec.md §4.6 calls
//! for on top of that flat layout, plus an IVF (inverted-file) index over
//! `~sqrt(n)` k-means centroids for corpora above the exact-index ceiling,
//! so vector search stays sub-linear instead of scanning every embedding.

use crate::embedder::cosine_similarity;
use crate::error::{EngineError, Result};
use crate::storage::{Storage, WriteEpochs};
use rand::seq::IteratorRandom;
use std::sync::RwLock;

/// Coherence state of the index relative to Storage's write epochs.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Coherence {
    Fresh,
    DirtyAppend,
    DirtyDeleteOrUpdate,
}

/// Inverted-file index: `~sqrt(n)` centroids, each owning the list of vector
/// offsets assigned to it. Search probes only the nearest `n_probe`
/// centroids' postings instead of every vector (spec.md §4.6).
struct IvfIndex {
    /// Flat `n_centroids * dim` storage.
    centroids: Vec<f32>,
    postings: Vec<Vec<u32>>,
    n_probe: usize,
}

impl IvfIndex {
    fn n_centroids(&self, dim: usize) -> usize {
        if dim == 0 {
            0
        } else {
            self.centroids.len() / dim
        }
    }

    /// Lloyd's-algorithm k-means over cosine similarity (vectors are already
    /// L2-normalized, so nearest-centroid-by-cosine is nearest-by-angle).
    fn build(vectors: &[f32], dim: usize, n_vectors: usize) -> Self {
        let n_centroids = (n_vectors as f64).sqrt().ceil().max(1.0) as usize;
        let n_centroids = n_centroids.min(n_vectors.max(1));

        let mut rng = rand::thread_rng();
        let seeds: Vec<usize> = (0..n_vectors).choose_multiple(&mut rng, n_centroids);
        let mut centroids: Vec<f32> = Vec::with_capacity(seeds.len() * dim);
        for &i in &seeds {
            centroids.extend_from_slice(&vectors[i * dim..i * dim + dim]);
        }

        let mut assignments = vec![0usize; n_vectors];
        const ITERATIONS: usize = 4;
        for _ in 0..ITERATIONS {
            for i in 0..n_vectors {
                let v = &vectors[i * dim..i * dim + dim];
                assignments[i] = nearest_centroid(v, &centroids, dim);
            }

            let mut sums = vec![0f32; centroids.len()];
            let mut counts = vec![0usize; centroids.len() / dim.max(1)];
            for i in 0..n_vectors {
                let c = assignments[i];
                let v = &vectors[i * dim..i * dim + dim];
                for d in 0..dim {
                    sums[c * dim + d] += v[d];
                }
                counts[c] += 1;
            }
            for (c, &count) in counts.iter().enumerate() {
                if count == 0 {
                    continue;
                }
                let slice = &mut sums[c * dim..c * dim + dim];
                for x in slice.iter_mut() {
                    *x /= count as f32;
                }
                let norm = slice.iter().map(|x| x * x).sum::<f32>().sqrt();
                if norm > 0.0 {
                    for x in slice.iter_mut() {
                        *x /= norm;
                    }
                }
            }
            centroids = sums;
        }

        let mut postings: Vec<Vec<u32>> = vec![Vec::new(); centroids.len() / dim.max(1)];
        for (i, &c) in assignments.iter().enumerate() {
            postings[c].push(i as u32);
        }

        let n_probe = (postings.len() as f64).sqrt().ceil().max(1.0) as usize;
        Self { centroids, postings, n_probe }
    }

    /// Assign newly-appended vectors to their nearest existing centroid
    /// without re-running k-means (spec.md §4.6 append path).
    fn assign_new(&mut self, vectors: &[f32], dim: usize, start_offset: usize, count: usize) {
        for i in 0..count {
            let v = &vectors[(start_offset + i) * dim..(start_offset + i) * dim + dim];
            let c = nearest_centroid(v, &self.centroids, dim);
            self.postings[c].push((start_offset + i) as u32);
        }
    }
}

fn nearest_centroid(v: &[f32], centroids: &[f32], dim: usize) -> usize {
    let mut best = 0;
    let mut best_score = f32::MIN;
    for (c, chunk) in centroids.chunks(dim).enumerate() {
        let score = cosine_similarity(v, chunk);
        if score > best_score {
            best_score = score;
            best = c;
        }
    }
    best
}

struct BuiltIndex {
    ids: Vec<i64>,
    /// Flat `n_vectors * dim` storage, mirroring the teacher's `SemanticIndex::embeddings`.
    vectors: Vec<f32>,
    dim: usize,
    built_epochs: WriteEpochs,
    approximate: bool,
    ivf: Option<IvfIndex>,
}

/// A single match from `search`.
#[derive(Clone, Copy, Debug)]
pub struct AnnHit {
    pub chunk_row_id: i64,
    pub score: f32,
}

pub struct AnnIndex {
    exact_ceiling: usize,
    inner: RwLock<Option<BuiltIndex>>,
}

impl AnnIndex {
    pub fn new(exact_ceiling: usize) -> Self {
        Self { exact_ceiling, inner: RwLock::new(None) }
    }

    pub fn coherence(&self, storage: &Storage) -> Result<Coherence> {
        let current = storage.epochs()?;
        let guard = self.inner.read().expect("ann index lock poisoned");
        let Some(built) = guard.as_ref() else {
            return Ok(Coherence::DirtyDeleteOrUpdate);
        };
        if current.invalidation_epoch != built.built_epochs.invalidation_epoch {
            Ok(Coherence::DirtyDeleteOrUpdate)
        } else if current.append_epoch != built.built_epochs.append_epoch {
            Ok(Coherence::DirtyAppend)
        } else {
            Ok(Coherence::Fresh)
        }
    }

    /// Ensure the index reflects Storage's current state, rebuilding fully
    /// on a delete/update-dirty index and incrementally appending on an
    /// append-only-dirty one (spec.md §4.6 Coherence Protocol).
    pub fn refresh(&self, storage: &Storage) -> Result<()> {
        match self.coherence(storage)? {
            Coherence::Fresh => Ok(()),
            Coherence::DirtyAppend => self.append_new(storage),
            Coherence::DirtyDeleteOrUpdate => self.rebuild(storage),
        }
    }

    fn rebuild(&self, storage: &Storage) -> Result<()> {
        let epochs = storage.epochs()?;
        let pairs = storage.embeddings_cursor()?;
        let dim = pairs.first().map(|(_, v)| v.len()).unwrap_or(0);

        let mut ids = Vec::with_capacity(pairs.len());
        let mut vectors = Vec::with_capacity(pairs.len() * dim.max(1));
        for (id, v) in pairs {
            ids.push(id);
            vectors.extend(v);
        }

        let approximate = ids.len() > self.exact_ceiling;
        let ivf = if approximate && dim > 0 {
            tracing::info!(vectors = ids.len(), ceiling = self.exact_ceiling, "ANN index exceeds exact ceiling, building IVF index");
            Some(IvfIndex::build(&vectors, dim, ids.len()))
        } else {
            None
        };

        let mut guard = self.inner.write().expect("ann index lock poisoned");
        *guard = Some(BuiltIndex { ids, vectors, dim, built_epochs: epochs, approximate, ivf });
        Ok(())
    }

    fn append_new(&self, storage: &Storage) -> Result<()> {
        let max_existing = {
            let guard = self.inner.read().expect("ann index lock poisoned");
            match guard.as_ref() {
                Some(built) => built.ids.last().copied().unwrap_or(0),
                None => return self.rebuild(storage),
            }
        };

        let new_pairs = storage.embeddings_cursor_after(max_existing)?;
        let epochs = storage.epochs()?;
        let mut guard = self.inner.write().expect("ann index lock poisoned");
        if let Some(built) = guard.as_mut() {
            let start_offset = built.ids.len();
            let mut appended = 0usize;
            for (id, v) in new_pairs {
                if built.dim == 0 {
                    built.dim = v.len();
                }
                built.ids.push(id);
                built.vectors.extend(v);
                appended += 1;
            }
            built.built_epochs = epochs;
            built.approximate = built.ids.len() > self.exact_ceiling;

            if built.approximate && built.dim > 0 {
                if let Some(ivf) = built.ivf.as_mut() {
                    ivf.assign_new(&built.vectors, built.dim, start_offset, appended);
                } else {
                    built.ivf = Some(IvfIndex::build(&built.vectors, built.dim, built.ids.len()));
                }
            }
        }
        Ok(())
    }

    /// Cosine-similarity search against the query vector: exact below the
    /// ceiling, and via IVF centroid probing above it (spec.md §4.6).
    pub fn search(&self, query: &[f32], limit: usize) -> Result<Vec<AnnHit>> {
        let guard = self.inner.read().expect("ann index lock poisoned");
        let built = guard.as_ref().ok_or_else(|| {
            EngineError::VectorIndexUnavailable("ANN index has not been built yet".to_string())
        })?;
        if built.dim == 0 || built.ids.is_empty() {
            return Ok(Vec::new());
        }
        if query.len() != built.dim {
            return Err(EngineError::InvalidQuery {
                message: format!("query vector dim {} does not match index dim {}", query.len(), built.dim),
                hint: "re-embed the query with the configured model".to_string(),
            });
        }

        if let Some(ivf) = built.ivf.as_ref().filter(|_| built.approximate) {
            return Ok(self.search_ivf(built, ivf, query, limit));
        }

        let mut scored: Vec<AnnHit> = built
            .ids
            .iter()
            .enumerate()
            .map(|(i, &id)| {
                let offset = i * built.dim;
                let vec = &built.vectors[offset..offset + built.dim];
                AnnHit { chunk_row_id: id, score: cosine_similarity(query, vec) }
            })
            .collect();

        scored.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(limit);
        Ok(scored)
    }

    /// Probe the `n_probe` centroids nearest the query and score only their
    /// postings, instead of every vector in the index.
    fn search_ivf(&self, built: &BuiltIndex, ivf: &IvfIndex, query: &[f32], limit: usize) -> Vec<AnnHit> {
        let n_centroids = ivf.n_centroids(built.dim);
        let mut centroid_order: Vec<(usize, f32)> = (0..n_centroids)
            .map(|c| {
                let offset = c * built.dim;
                let cv = &ivf.centroids[offset..offset + built.dim];
                (c, cosine_similarity(query, cv))
            })
            .collect();
        centroid_order.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));

        let probe = ivf.n_probe.min(n_centroids);
        let mut scored = Vec::new();
        for &(c, _) in centroid_order.iter().take(probe) {
            for &i in &ivf.postings[c] {
                let offset = i as usize * built.dim;
                let vec = &built.vectors[offset..offset + built.dim];
                scored.push(AnnHit { chunk_row_id: built.ids[i as usize], score: cosine_similarity(query, vec) });
            }
        }

        scored.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(limit);
        scored
    }

    pub fn is_built(&self) -> bool {
        self.inner.read().expect("ann index lock poisoned").is_some()
    }

    pub fn is_approximate(&self) -> bool {
        self.inner
            .read()
            .expect("ann index lock poisoned")
            .as_ref()
            .map(|b| b.approximate)
            .unwrap_or(false)
    }

    pub fn vector_count(&self) -> usize {
        self.inner.read().expect("ann index lock poisoned").as_ref().map(|b| b.ids.len()).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn coherence_reports_dirty_delete_before_any_build() {
        // A fresh index with no prior build should never report Fresh.
        let index = AnnIndex::new(1000);
        assert!(!index.is_built());
    }

    #[test]
    fn search_against_unbuilt_index_is_vector_index_unavailable() {
        let index = AnnIndex::new(1000);
        let err = index.search(&[0.1, 0.2], 5).unwrap_err();
        assert!(matches!(err, EngineError::VectorIndexUnavailable(_)));
    }
}
