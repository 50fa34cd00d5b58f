/// Failure from a provider or store call.
#[derive(Debug, thiserror::Error)]
pub enum EmbedError {
    #[error("provider error: {0}")]
    Provider(String),
    #[error("store error: {0}")]
    Store(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("empty text provided")]
    EmptyText,
    #[error("cancelled")]
    Cancelled,
}

/// Which half of a provider task failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureStage {
    Generate,
    Store,
}

impl FailureStage {
    fn marker(self) -> &'static str {
        match self {
            Self::Generate => "",
            Self::Store => "failed to store embedding: ",
        }
    }
}

/// One provider's failure inside a single `process` call.
#[derive(Debug, thiserror::Error)]
#[error("{provider}: {}{error}", .stage.marker())]
pub struct ProviderFailure {
    pub provider: String,
    pub stage: FailureStage,
    #[source]
    pub error: EmbedError,
}

/// Error returned when a single item could not be embedded.
#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    /// One or more providers failed. In general mode the providers that
    /// succeeded may already have been persisted.
    #[error("embedding generation failed: [{}]", join_failures(.0))]
    Generation(Vec<ProviderFailure>),
    #[error("failed to store dual embeddings for item {item_id}: {source}")]
    StoreDual {
        item_id: i64,
        #[source]
        source: EmbedError,
    },
    /// The item's task panicked or was aborted before reporting.
    #[error("item task aborted: {0}")]
    Aborted(String),
}

impl ProcessError {
    /// Provider failures carried by this error, empty for storage failures.
    pub fn failures(&self) -> &[ProviderFailure] {
        match self {
            Self::Generation(failures) => failures,
            Self::StoreDual { .. } | Self::Aborted(_) => &[],
        }
    }
}

fn join_failures(failures: &[ProviderFailure]) -> String {
    failures
        .iter()
        .map(|f| f.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

/// Run-level failures. Everything past the initial listing degrades to
/// per-item failures recorded in the batch result instead.
#[derive(Debug, thiserror::Error)]
pub enum RunnerError {
    #[error("invalid batch size: {0}")]
    InvalidBatchSize(usize),
    #[error("a batch run is already in progress")]
    AlreadyRunning,
    #[error("failed to list pending items for provider {provider}: {source}")]
    Listing {
        provider: String,
        #[source]
        source: EmbedError,
    },
    #[error("config error: {0}")]
    Config(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generation_error_names_every_provider() {
        let err = ProcessError::Generation(vec![
            ProviderFailure {
                provider: "openai".into(),
                stage: FailureStage::Generate,
                error: EmbedError::Provider("timeout".into()),
            },
            ProviderFailure {
                provider: "gemini".into(),
                stage: FailureStage::Store,
                error: EmbedError::Store("disk full".into()),
            },
        ]);

        let msg = err.to_string();
        assert!(msg.starts_with("embedding generation failed"));
        assert!(msg.contains("openai: provider error: timeout"));
        assert!(msg.contains("gemini: failed to store embedding: store error: disk full"));
        assert_eq!(err.failures().len(), 2);
        assert!(std::error::Error::source(&err.failures()[0]).is_some());
    }

    #[test]
    fn store_dual_error_keeps_source() {
        let err = ProcessError::StoreDual {
            item_id: 7,
            source: EmbedError::Store("connection reset".into()),
        };
        assert!(err.to_string().contains("failed to store dual embeddings for item 7"));
        assert!(std::error::Error::source(&err).is_some());
        assert!(err.failures().is_empty());
    }
}
