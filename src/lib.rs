//! Multi-provider embedding generation and a resumable batch runner.
//!
//! [`EmbeddingCoordinator`] embeds one item with every configured provider and
//! persists the vectors. [`BatchRunner`] drives many items through it in
//! sequential, internally concurrent chunks, with pause/resume/stop control and
//! per-item failure accounting.

pub mod config;
pub mod coordinator;
pub mod error;
pub mod events;
pub mod provider;
pub mod providers;
pub mod runner;
pub mod store;
pub mod stores;
pub mod types;

pub use config::RunnerConfig;
pub use coordinator::{EmbeddingCoordinator, ItemProcessor};
pub use error::{EmbedError, FailureStage, ProcessError, ProviderFailure, RunnerError};
pub use events::BatchEvent;
pub use provider::{EmbeddingProvider, ProviderInfo};
pub use providers::{mock::MockEmbedder, openai::OpenAiEmbedder};
pub use runner::BatchRunner;
pub use store::EmbeddingStore;
pub use stores::memory::InMemoryStore;
pub use types::{
    BatchResult, DualEmbedding, EmbeddingStatus, ItemFailure, ProcessingStatus, RunState,
    WorkItem,
};
pub use tokio_util::sync::CancellationToken;
