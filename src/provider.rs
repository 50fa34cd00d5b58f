use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::EmbedError;

/// Static description of an embedding backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderInfo {
    /// Key under which this provider's vectors are stored ("openai", "gemini", ...).
    pub name: String,
    pub model: String,
    pub dimension: usize,
}

/// Embedding backend. OpenAI, Gemini, a local model, whatever.
/// Implementations are shared across tasks and must tolerate concurrent calls.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Embed a single text string.
    async fn generate(&self, text: &str) -> Result<Vec<f32>, EmbedError>;

    fn info(&self) -> ProviderInfo;

    fn name(&self) -> String {
        self.info().name
    }
}
