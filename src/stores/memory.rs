use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use crate::error::EmbedError;
use crate::store::EmbeddingStore;
use crate::types::{DualEmbedding, WorkItem};

/// In-process store. Items are kept in id order so listings are stable.
/// Vectors are keyed by `(item id, provider name)`, dual records included.
/// Nothing here blocks, so the cancellation token is never consulted.
pub struct InMemoryStore {
    inner: RwLock<Inner>,
}

#[derive(Default)]
struct Inner {
    items: BTreeMap<i64, WorkItem>,
    embeddings: HashMap<(i64, String), Vec<f32>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
        }
    }

    pub async fn insert_item(&self, item: WorkItem) {
        self.inner.write().await.items.insert(item.id, item);
    }

    pub async fn has_embedding(&self, item_id: i64, provider: &str) -> bool {
        self.inner
            .read()
            .await
            .embeddings
            .contains_key(&(item_id, provider.to_string()))
    }

    /// Total stored vectors across all providers.
    pub async fn embedding_count(&self) -> usize {
        self.inner.read().await.embeddings.len()
    }

    async fn pending(
        &self,
        provider: &str,
        owner: Option<&str>,
        limit: usize,
    ) -> Vec<WorkItem> {
        let inner = self.inner.read().await;
        inner
            .items
            .values()
            .filter(|item| owner.map_or(true, |o| item.owner == o))
            .filter(|item| {
                !inner
                    .embeddings
                    .contains_key(&(item.id, provider.to_string()))
            })
            .take(limit)
            .cloned()
            .collect()
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EmbeddingStore for InMemoryStore {
    async fn store_single(
        &self,
        _cancel: &CancellationToken,
        item_id: i64,
        provider: &str,
        embedding: &[f32],
    ) -> Result<(), EmbedError> {
        self.inner
            .write()
            .await
            .embeddings
            .insert((item_id, provider.to_string()), embedding.to_vec());
        Ok(())
    }

    async fn get_single(
        &self,
        _cancel: &CancellationToken,
        item_id: i64,
        provider: &str,
    ) -> Result<Vec<f32>, EmbedError> {
        self.inner
            .read()
            .await
            .embeddings
            .get(&(item_id, provider.to_string()))
            .cloned()
            .ok_or_else(|| EmbedError::NotFound(format!("embedding {item_id}/{provider}")))
    }

    async fn store_dual(
        &self,
        _cancel: &CancellationToken,
        item_id: i64,
        primary: (&str, &[f32]),
        secondary: (&str, &[f32]),
    ) -> Result<(), EmbedError> {
        // One write guard so readers never see half a dual record.
        let mut inner = self.inner.write().await;
        for (provider, embedding) in [primary, secondary] {
            inner
                .embeddings
                .insert((item_id, provider.to_string()), embedding.to_vec());
        }
        Ok(())
    }

    async fn get_dual(
        &self,
        _cancel: &CancellationToken,
        item_id: i64,
        primary: &str,
        secondary: &str,
    ) -> Result<DualEmbedding, EmbedError> {
        let inner = self.inner.read().await;
        let lookup = |provider: &str| {
            inner
                .embeddings
                .get(&(item_id, provider.to_string()))
                .cloned()
        };
        let primary = lookup(primary);
        let secondary = lookup(secondary);

        if primary.is_none() && secondary.is_none() {
            return Err(EmbedError::NotFound(format!("no embeddings for item {item_id}")));
        }

        Ok(DualEmbedding { primary, secondary })
    }

    async fn list_without_embedding(
        &self,
        _cancel: &CancellationToken,
        provider: &str,
        limit: usize,
    ) -> Result<Vec<WorkItem>, EmbedError> {
        Ok(self.pending(provider, None, limit).await)
    }

    async fn list_without_embedding_for_owner(
        &self,
        _cancel: &CancellationToken,
        provider: &str,
        owner: &str,
        limit: usize,
    ) -> Result<Vec<WorkItem>, EmbedError> {
        Ok(self.pending(provider, Some(owner), limit).await)
    }

    async fn close(&self) -> Result<(), EmbedError> {
        Ok(())
    }
}
