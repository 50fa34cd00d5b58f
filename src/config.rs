use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::RunnerError;

/// Batch runner configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunnerConfig {
    /// Items per chunk for `process_all` / `process_for_owner`.
    pub batch_size: usize,
    /// Caps in-flight items within a chunk. `None` runs the whole chunk at once.
    pub max_concurrency: Option<usize>,
    /// Upper bound on items fetched per provider listing.
    pub listing_limit: usize,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            batch_size: 10,
            max_concurrency: None,
            listing_limit: 10_000,
        }
    }
}

impl RunnerConfig {
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_max_concurrency(mut self, limit: usize) -> Self {
        self.max_concurrency = Some(limit);
        self
    }

    pub fn with_listing_limit(mut self, limit: usize) -> Self {
        self.listing_limit = limit;
        self
    }

    pub fn validate(&self) -> Result<(), RunnerError> {
        if self.batch_size == 0 {
            return Err(RunnerError::InvalidBatchSize(0));
        }
        if self.max_concurrency == Some(0) {
            return Err(RunnerError::Config("max_concurrency must be at least 1".into()));
        }
        Ok(())
    }

    /// Load from a JSON file. Missing fields fall back to defaults.
    pub async fn load(path: impl AsRef<Path>) -> Result<Self, RunnerError> {
        let path = path.as_ref();
        let json = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| RunnerError::Config(format!("failed to read {}: {e}", path.display())))?;
        let config: Self = serde_json::from_str(&json)
            .map_err(|e| RunnerError::Config(format!("failed to parse {}: {e}", path.display())))?;
        config.validate()?;
        Ok(config)
    }
}
