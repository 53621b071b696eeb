//! MiniLM-L6 embedding provider backed by fastembed.

use anyhow::{Context, Result};
use fastembed::{EmbeddingModel, InitOptions, TextEmbedding};
use std::sync::Mutex;
use tracing::{info, warn};

use super::{normalize, EmbeddingProvider};

const MINILM_DIM: usize = 384;

pub struct MiniLmEmbedder {
    model: Mutex<TextEmbedding>,
}

impl MiniLmEmbedder {
    pub fn new() -> Result<Self> {
        info!("initializing MiniLM-L6 embedding model");
        let model = TextEmbedding::try_new(
            InitOptions::new(EmbeddingModel::AllMiniLML6V2).with_show_download_progress(false),
        )
        .context("failed to initialize embedding model")?;
        Ok(Self {
            model: Mutex::new(model),
        })
    }
}

impl EmbeddingProvider for MiniLmEmbedder {
    fn embed(&self, text: &str) -> Vec<f32> {
        let result = match self.model.lock() {
            Ok(mut model) => model.embed(vec![text.to_string()], None),
            Err(_) => {
                warn!("embedding model lock poisoned, returning zero vector");
                return vec![0.0; MINILM_DIM];
            }
        };
        match result {
            Ok(mut embeddings) if !embeddings.is_empty() => {
                let mut vec = embeddings.remove(0);
                normalize(&mut vec);
                vec
            }
            Ok(_) => vec![0.0; MINILM_DIM],
            Err(e) => {
                warn!("embedding failed, returning zero vector: {e}");
                vec![0.0; MINILM_DIM]
            }
        }
    }

    fn dim(&self) -> usize {
        MINILM_DIM
    }
}
