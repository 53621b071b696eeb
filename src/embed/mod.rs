//! Embedding capability
//!
//! One small interface: `embed` to a unit-normalized vector of fixed `dim`.
//! The memory store and the semantic scorer only ever see this trait, so the
//! backing model can be swapped by changing the factory string.

pub mod minilm;

use std::sync::Arc;

use anyhow::{bail, Result};
use sha2::{Digest, Sha256};

pub use minilm::MiniLmEmbedder;

pub trait EmbeddingProvider: Send + Sync {
    /// Unit-normalized embedding for `text`. Degrades to a zero vector of
    /// the right dimension when the backend fails.
    fn embed(&self, text: &str) -> Vec<f32>;

    fn dim(&self) -> usize;
}

/// Build a provider from its configuration key.
pub fn provider_from_config(name: &str) -> Result<Arc<dyn EmbeddingProvider>> {
    match name {
        "minilm-l6" | "sentence-transformers/all-MiniLM-L6-v2" => {
            Ok(Arc::new(MiniLmEmbedder::new()?))
        }
        "hash" => Ok(Arc::new(HashEmbedder::new(384))),
        other => bail!("unknown embedding provider: {other}"),
    }
}

/// Cosine similarity; zero when either vector has no magnitude.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}

pub fn normalize(vec: &mut [f32]) {
    let norm: f32 = vec.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        for x in vec.iter_mut() {
            *x /= norm;
        }
    }
}

/// Rough token count at ~4 characters per token.
pub fn estimate_tokens(text: &str) -> usize {
    (text.len() / 4).max(1)
}

/// Deterministic, network-free provider: folds a SHA-256 stream of the input
/// into the vector. Similar prefixes land near each other only by accident,
/// which is exactly what tests want from a stand-in.
pub struct HashEmbedder {
    dim: usize,
}

impl HashEmbedder {
    pub fn new(dim: usize) -> Self {
        Self { dim }
    }
}

impl EmbeddingProvider for HashEmbedder {
    fn embed(&self, text: &str) -> Vec<f32> {
        let mut out = vec![0.0f32; self.dim];
        let mut hasher = Sha256::new();
        hasher.update(text.as_bytes());
        let mut digest = hasher.finalize().to_vec();
        let mut i = 0;
        while i < self.dim {
            for byte in digest.iter() {
                if i >= self.dim {
                    break;
                }
                out[i] = (*byte as f32 - 127.5) / 127.5;
                i += 1;
            }
            let mut rehash = Sha256::new();
            rehash.update(&digest);
            digest = rehash.finalize().to_vec();
        }
        normalize(&mut out);
        out
    }

    fn dim(&self) -> usize {
        self.dim
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cosine_of_identical_vectors_is_one() {
        let v = vec![0.6, 0.8, 0.0];
        assert!((cosine_similarity(&v, &v) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn cosine_of_orthogonal_vectors_is_zero() {
        let a = vec![1.0, 0.0];
        let b = vec![0.0, 1.0];
        assert!(cosine_similarity(&a, &b).abs() < 1e-6);
    }

    #[test]
    fn cosine_handles_zero_vectors() {
        let a = vec![0.0, 0.0];
        let b = vec![1.0, 0.0];
        assert_eq!(cosine_similarity(&a, &b), 0.0);
    }

    #[test]
    fn hash_embedder_is_deterministic_and_normalized() {
        let embedder = HashEmbedder::new(384);
        let a = embedder.embed("hello world");
        let b = embedder.embed("hello world");
        assert_eq!(a, b);
        assert_eq!(a.len(), 384);
        let norm: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-4);
    }

    #[test]
    fn token_estimate_floors_at_one() {
        assert_eq!(estimate_tokens(""), 1);
        assert_eq!(estimate_tokens("abcdefgh"), 2);
    }
}
