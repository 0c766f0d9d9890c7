//! The vector-similarity index is an external collaborator (spec.md §1,
//! §6): opaque, "build from a list of vectors, search top-k by L2
//! distance". This module is the in-process stand-in for it — a flat
//! brute-force scan, rebuilt wholesale on every commit adoption rather
//! than updated incrementally (spec.md §5), which is the simplest thing
//! that is trivially consistent with a freshly persisted catalog.

use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::SearchHit;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VectorIndexEntry {
    pub cid: String,
    pub filename: String,
    pub added_at: DateTime<Utc>,
    pub vector: Vec<f32>,
}

/// An immutable snapshot of every confirmed document's embedding. Replaced
/// wholesale (never mutated in place) on each commit adoption so a reader
/// holding an `Arc<VectorIndex>` never observes a half-rebuilt state.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct VectorIndex {
    entries: Vec<VectorIndexEntry>,
}

impl VectorIndex {
    pub fn empty() -> Self {
        Self { entries: Vec::new() }
    }

    pub fn from_entries(entries: Vec<VectorIndexEntry>) -> Self {
        Self { entries }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Nearest neighbours of `query`, nearest-first, capped at `top_k`.
    pub fn search(&self, query: &[f32], top_k: usize) -> Vec<SearchHit> {
        let mut scored: Vec<(f32, &VectorIndexEntry)> =
            self.entries.iter().map(|entry| (l2_distance(query, &entry.vector), entry)).collect();
        scored.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(std::cmp::Ordering::Equal));

        scored
            .into_iter()
            .take(top_k)
            .enumerate()
            .map(|(i, (distance, entry))| SearchHit {
                rank: i + 1,
                distance,
                cid: entry.cid.clone(),
                filename: entry.filename.clone(),
                added_at: entry.added_at,
            })
            .collect()
    }

    pub async fn persist(&self, path: &str) -> std::io::Result<()> {
        let serialized = serde_json::to_vec(self)?;
        let tmp = format!("{path}.tmp");
        tokio::fs::write(&tmp, serialized).await?;
        tokio::fs::rename(&tmp, path).await?;
        Ok(())
    }

    pub async fn load(path: &str) -> Self {
        if !Path::new(path).exists() {
            return Self::empty();
        }
        match tokio::fs::read(path).await {
            Ok(bytes) => serde_json::from_slice(&bytes).unwrap_or_else(|_| Self::empty()),
            Err(_) => Self::empty(),
        }
    }
}

fn l2_distance(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b.iter()).map(|(x, y)| (x - y).powi(2)).sum::<f32>().sqrt()
}
