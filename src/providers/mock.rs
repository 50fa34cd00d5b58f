use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use async_trait::async_trait;

use crate::error::EmbedError;
use crate::provider::{EmbeddingProvider, ProviderInfo};

/// Deterministic offline provider. Same text, same vector; no network.
#[derive(Debug, Clone)]
pub struct MockEmbedder {
    name: String,
    dimension: usize,
}

impl MockEmbedder {
    pub fn new(name: impl Into<String>, dimension: usize) -> Self {
        Self {
            name: name.into(),
            dimension,
        }
    }

    fn hash_to_embedding(&self, text: &str) -> Vec<f32> {
        let mut hasher = DefaultHasher::new();
        self.name.hash(&mut hasher);
        text.hash(&mut hasher);
        let mut hash = hasher.finish();

        let mut embedding = Vec::with_capacity(self.dimension);
        for _ in 0..self.dimension {
            // map u64 onto [-1.0, 1.0]
            let value = (hash as f64 / u64::MAX as f64) * 2.0 - 1.0;
            embedding.push(value as f32);

            let mut h = DefaultHasher::new();
            hash.hash(&mut h);
            hash = h.finish();
        }
        embedding
    }
}

#[async_trait]
impl EmbeddingProvider for MockEmbedder {
    async fn generate(&self, text: &str) -> Result<Vec<f32>, EmbedError> {
        if text.trim().is_empty() {
            return Err(EmbedError::EmptyText);
        }
        Ok(self.hash_to_embedding(text))
    }

    fn info(&self) -> ProviderInfo {
        ProviderInfo {
            name: self.name.clone(),
            model: "mock-model".into(),
            dimension: self.dimension,
        }
    }
}
