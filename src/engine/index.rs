// RU-PATH Engine — Embedding Index
//
// In-memory nearest-neighbor index over fact record embeddings. Rebuilds
// produce a fresh immutable snapshot that is swapped in atomically, so
// in-flight queries never observe a partially rebuilt index.

use crate::atoms::error::{EngineError, EngineResult};
use crate::engine::embedding::EmbeddingClient;
use crate::engine::facts::{record_text, FactStore};
use log::info;
use parking_lot::RwLock;
use std::sync::Arc;

struct IndexEntry {
    fact_id: String,
    vector: Vec<f32>,
}

struct IndexSnapshot {
    entries: Vec<IndexEntry>,
    version: u64,
}

impl IndexSnapshot {
    fn empty() -> Self {
        IndexSnapshot { entries: Vec::new(), version: 0 }
    }
}

/// Versioned-snapshot vector index. Readers clone the `Arc` and score
/// against a consistent view; writers swap in a new snapshot when done.
pub struct EmbeddingIndex {
    snapshot: RwLock<Arc<IndexSnapshot>>,
}

impl Default for EmbeddingIndex {
    fn default() -> Self {
        Self::new()
    }
}

impl EmbeddingIndex {
    pub fn new() -> Self {
        EmbeddingIndex { snapshot: RwLock::new(Arc::new(IndexSnapshot::empty())) }
    }

    pub fn is_ready(&self) -> bool {
        !self.snapshot.read().entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.snapshot.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn version(&self) -> u64 {
        self.snapshot.read().version
    }

    /// Embed every record and swap in the new snapshot. On failure the
    /// previous snapshot stays live untouched.
    pub async fn rebuild(
        &self,
        store: &FactStore,
        client: &EmbeddingClient,
    ) -> EngineResult<usize> {
        let mut entries = Vec::with_capacity(store.len());
        for rec in store.records() {
            let vector = client.embed(&record_text(rec)).await?;
            entries.push(IndexEntry { fact_id: rec.id.clone(), vector });
        }
        let version = self.version() + 1;
        let count = entries.len();
        *self.snapshot.write() = Arc::new(IndexSnapshot { entries, version });
        info!("[index] Snapshot v{version} live with {count} vectors");
        Ok(count)
    }

    /// Nearest neighbors by cosine similarity, descending, ties broken by
    /// fact id for determinism. Stable across repeated calls for the same
    /// input and snapshot.
    pub async fn query(
        &self,
        text: &str,
        k: usize,
        client: &EmbeddingClient,
    ) -> EngineResult<Vec<(String, f64)>> {
        let snapshot = self.snapshot.read().clone();
        if snapshot.entries.is_empty() {
            return Err(EngineError::EmbeddingUnavailable(
                "embedding index has not been built".into(),
            ));
        }
        let query_vec = client.embed(text).await?;

        let mut scored: Vec<(String, f64)> = snapshot
            .entries
            .iter()
            .map(|e| (e.fact_id.clone(), cosine_similarity(&query_vec, &e.vector)))
            .collect();
        scored.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.0.cmp(&b.0))
        });
        scored.truncate(k);
        Ok(scored)
    }
}

/// Cosine similarity between two vectors. Returns 0.0 on mismatched or
/// zero-length input.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f64 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let mut dot = 0.0f64;
    let mut norm_a = 0.0f64;
    let mut norm_b = 0.0f64;
    for (x, y) in a.iter().zip(b.iter()) {
        let x = *x as f64;
        let y = *y as f64;
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom < 1e-12 {
        0.0
    } else {
        dot / denom
    }
}
