//! Document retriever
//!
//! In-memory chunk index over local text/markdown files. The interface is
//! the contract; the index is a reference implementation good enough for
//! single-node use.

use std::path::Path;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;
use walkdir::WalkDir;

use crate::embed::{cosine_similarity, EmbeddingProvider};

const CHUNK_SIZE: usize = 800;
const CHUNK_OVERLAP: usize = 120;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RagHit {
    pub score: f32,
    pub chunk: String,
    pub source: String,
}

#[async_trait]
pub trait Retriever: Send + Sync {
    async fn query(&self, text: &str, k: usize) -> Result<Vec<RagHit>>;
}

struct IndexedChunk {
    text: String,
    source: String,
    embedding: Vec<f32>,
}

/// Embedding-backed chunk index built from a documents directory.
pub struct ChunkIndex {
    chunks: Vec<IndexedChunk>,
    embedder: Arc<dyn EmbeddingProvider>,
}

impl ChunkIndex {
    /// Index every `.txt` / `.md` under `data_dir`. Missing directory yields
    /// an empty index, not an error.
    pub fn build(data_dir: &Path, embedder: Arc<dyn EmbeddingProvider>) -> Self {
        let mut chunks = Vec::new();
        if data_dir.exists() {
            for entry in WalkDir::new(data_dir).into_iter().filter_map(|e| e.ok()) {
                let path = entry.path();
                let is_text = path
                    .extension()
                    .and_then(|e| e.to_str())
                    .map(|e| matches!(e, "txt" | "md"))
                    .unwrap_or(false);
                if !entry.file_type().is_file() || !is_text {
                    continue;
                }
                let Ok(text) = std::fs::read_to_string(path) else {
                    continue;
                };
                let source = path.display().to_string();
                for chunk in chunk_text(&text) {
                    let embedding = embedder.embed(&chunk);
                    chunks.push(IndexedChunk {
                        text: chunk,
                        source: source.clone(),
                        embedding,
                    });
                }
            }
        }
        debug!(chunks = chunks.len(), "chunk index built");
        Self { chunks, embedder }
    }

    pub fn empty(embedder: Arc<dyn EmbeddingProvider>) -> Self {
        Self {
            chunks: Vec::new(),
            embedder,
        }
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }
}

fn chunk_text(text: &str) -> Vec<String> {
    let bytes: Vec<char> = text.chars().collect();
    let mut out = Vec::new();
    let mut i = 0;
    while i < bytes.len() {
        let end = (i + CHUNK_SIZE).min(bytes.len());
        let chunk: String = bytes[i..end].iter().collect();
        if !chunk.trim().is_empty() {
            out.push(chunk);
        }
        i += CHUNK_SIZE.saturating_sub(CHUNK_OVERLAP).max(1);
    }
    out
}

#[async_trait]
impl Retriever for ChunkIndex {
    async fn query(&self, text: &str, k: usize) -> Result<Vec<RagHit>> {
        if self.chunks.is_empty() || k == 0 {
            return Ok(Vec::new());
        }
        let query_vec = self.embedder.embed(text);
        let mut scored: Vec<(f32, usize)> = self
            .chunks
            .iter()
            .enumerate()
            .map(|(idx, c)| (cosine_similarity(&query_vec, &c.embedding), idx))
            .collect();
        scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
        Ok(scored
            .into_iter()
            .take(k)
            .map(|(score, idx)| RagHit {
                score,
                chunk: self.chunks[idx].text.clone(),
                source: self.chunks[idx].source.clone(),
            })
            .collect())
    }
}
