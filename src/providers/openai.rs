use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::EmbedError;
use crate::provider::{EmbeddingProvider, ProviderInfo};

/// Client for any OpenAI-compatible `/v1/embeddings` endpoint
/// (OpenAI, LiteLLM, vLLM, Ollama's compat layer).
pub struct OpenAiEmbedder {
    client: reqwest::Client,
    api_key: Option<String>,
    base_url: String,
    name: String,
    model: String,
    dimension: usize,
}

impl OpenAiEmbedder {
    /// `model` is the embedding model id (e.g. `text-embedding-3-small`).
    /// `dimension` must match the model's output dimensionality.
    pub fn new(api_key: impl Into<String>, model: &str, dimension: usize) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key: Some(api_key.into()),
            base_url: "https://api.openai.com".into(),
            name: "openai".into(),
            model: model.to_string(),
            dimension,
        }
    }

    pub fn with_base_url(mut self, url: &str) -> Self {
        self.base_url = url.trim_end_matches('/').to_string();
        self
    }

    /// Storage key for this provider's vectors. Defaults to `openai`.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Drop the bearer token, for local servers that don't want one.
    pub fn without_auth(mut self) -> Self {
        self.api_key = None;
        self
    }
}

#[derive(Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: [&'a str; 1],
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
}

#[async_trait]
impl EmbeddingProvider for OpenAiEmbedder {
    async fn generate(&self, text: &str) -> Result<Vec<f32>, EmbedError> {
        if text.trim().is_empty() {
            return Err(EmbedError::EmptyText);
        }

        let url = format!("{}/v1/embeddings", self.base_url);
        let body = EmbeddingRequest {
            model: &self.model,
            input: [text],
        };

        let mut request = self.client.post(&url).json(&body);
        if let Some(ref key) = self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request
            .send()
            .await
            .map_err(|e| EmbedError::Provider(format!("request failed: {e}")))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(EmbedError::Provider(format!(
                "{} returned {status}: {body}",
                self.name
            )));
        }

        let parsed: EmbeddingResponse = response
            .json()
            .await
            .map_err(|e| EmbedError::Provider(format!("failed to parse response: {e}")))?;

        let embedding = parsed
            .data
            .into_iter()
            .next()
            .map(|d| d.embedding)
            .ok_or_else(|| EmbedError::Provider(format!("no embedding data returned from {}", self.name)))?;

        if embedding.len() != self.dimension {
            return Err(EmbedError::Provider(format!(
                "expected {} dimensions, got {}",
                self.dimension,
                embedding.len()
            )));
        }

        Ok(embedding)
    }

    fn info(&self) -> ProviderInfo {
        ProviderInfo {
            name: self.name.clone(),
            model: self.model.clone(),
            dimension: self.dimension,
        }
    }
}
