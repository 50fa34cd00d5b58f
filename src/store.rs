use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::EmbedError;
use crate::types::{DualEmbedding, WorkItem};

/// Backend storage for embeddings and the items they belong to. pgvector,
/// SQLite, in-memory, whatever. The coordinator decides what to write;
/// the store just writes and reads.
///
/// Every call except `close` receives the run's cancellation token. Honoring
/// it is up to the implementation: a store that can block should give up and
/// return [`EmbedError::Cancelled`] once the token fires.
#[async_trait]
pub trait EmbeddingStore: Send + Sync {
    /// Persist one provider's vector for an item.
    async fn store_single(
        &self,
        cancel: &CancellationToken,
        item_id: i64,
        provider: &str,
        embedding: &[f32],
    ) -> Result<(), EmbedError>;

    async fn get_single(
        &self,
        cancel: &CancellationToken,
        item_id: i64,
        provider: &str,
    ) -> Result<Vec<f32>, EmbedError>;

    /// Persist both halves of a dual record in one call. Each half is
    /// `(provider name, vector)`, so the record lands under the same names
    /// that `get_single` and the listings query.
    async fn store_dual(
        &self,
        cancel: &CancellationToken,
        item_id: i64,
        primary: (&str, &[f32]),
        secondary: (&str, &[f32]),
    ) -> Result<(), EmbedError>;

    /// Read both halves of a dual record for the named providers.
    async fn get_dual(
        &self,
        cancel: &CancellationToken,
        item_id: i64,
        primary: &str,
        secondary: &str,
    ) -> Result<DualEmbedding, EmbedError>;

    /// Items that have no vector yet for `provider`, at most `limit` of them.
    async fn list_without_embedding(
        &self,
        cancel: &CancellationToken,
        provider: &str,
        limit: usize,
    ) -> Result<Vec<WorkItem>, EmbedError>;

    /// Same as `list_without_embedding`, restricted to one owner.
    async fn list_without_embedding_for_owner(
        &self,
        cancel: &CancellationToken,
        provider: &str,
        owner: &str,
        limit: usize,
    ) -> Result<Vec<WorkItem>, EmbedError>;

    async fn close(&self) -> Result<(), EmbedError>;
}
