//! The embedding function is an external collaborator (spec.md §1, §6):
//! an opaque `embed(text) -> fixed-dimension float vector`. This crate only
//! defines the seam — [`Embedder`] — plus a deterministic placeholder so
//! the node is runnable without a real model wired in. Swapping in a real
//! model means providing another `Embedder` impl, not touching the
//! coordination protocol.

use sha2::{Digest, Sha256};

pub trait Embedder: Send + Sync {
    fn embed(&self, text: &str) -> Vec<f32>;
    fn dimension(&self) -> usize;
}

/// Deterministic, model-free placeholder: hashes `text` with a per-output
/// counter as a sufficiently-unpredictable extra input, then maps each
/// hash's bytes onto `[-1.0, 1.0]`. Same text always yields the same
/// vector, and unrelated texts produce effectively uncorrelated vectors —
/// enough to exercise the voting/commit/search plumbing without a model.
pub struct HashingEmbedder {
    dimension: usize,
}

impl HashingEmbedder {
    pub fn new(dimension: usize) -> Self {
        Self { dimension }
    }
}

impl Default for HashingEmbedder {
    fn default() -> Self {
        Self::new(64)
    }
}

impl Embedder for HashingEmbedder {
    fn embed(&self, text: &str) -> Vec<f32> {
        let mut out = Vec::with_capacity(self.dimension);
        let mut counter: u32 = 0;
        while out.len() < self.dimension {
            let mut hasher = Sha256::new();
            hasher.update(text.as_bytes());
            hasher.update(counter.to_le_bytes());
            let digest = hasher.finalize();
            for byte in digest.iter() {
                if out.len() == self.dimension {
                    break;
                }
                out.push((*byte as f32 / 255.0) * 2.0 - 1.0);
            }
            counter += 1;
        }
        out
    }

    fn dimension(&self) -> usize {
        self.dimension
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_text_same_vector() {
        let embedder = HashingEmbedder::new(32);
        assert_eq!(embedder.embed("hello"), embedder.embed("hello"));
    }

    #[test]
    fn different_text_different_vector() {
        let embedder = HashingEmbedder::new(32);
        assert_ne!(embedder.embed("hello"), embedder.embed("world"));
    }

    #[test]
    fn respects_requested_dimension() {
        let embedder = HashingEmbedder::new(17);
        assert_eq!(embedder.embed("x").len(), 17);
    }
}
