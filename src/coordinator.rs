use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::error::{EmbedError, FailureStage, ProcessError, ProviderFailure};
use crate::provider::EmbeddingProvider;
use crate::store::EmbeddingStore;
use crate::types::EmbeddingStatus;

/// Per-item embedding work, as seen by the batch runner.
#[async_trait]
pub trait ItemProcessor: Send + Sync {
    /// Embed one item with every configured provider and persist the result.
    async fn process(
        &self,
        cancel: &CancellationToken,
        item_id: i64,
        text: &str,
    ) -> Result<(), ProcessError>;

    /// Completion view for one item. Never fails: a storage error reads as
    /// "nothing embedded yet".
    async fn status(&self, cancel: &CancellationToken, item_id: i64) -> EmbeddingStatus;

    /// Names of the configured providers, in configuration order.
    fn provider_names(&self) -> Vec<String>;
}

/// Fans one item out to every provider and decides how results are persisted.
///
/// With exactly two providers it runs in dual mode: both vectors are written
/// together with `store_dual`, each under its provider's name, or nothing is
/// written. With any other count each
/// provider persists its own vector via `store_single` as soon as it has one,
/// so a failed call can still leave the successful providers' vectors behind.
pub struct EmbeddingCoordinator {
    providers: Vec<Arc<dyn EmbeddingProvider>>,
    store: Arc<dyn EmbeddingStore>,
}

impl EmbeddingCoordinator {
    pub fn new(store: Arc<dyn EmbeddingStore>) -> Self {
        Self {
            providers: Vec::new(),
            store,
        }
    }

    /// Add a provider. In dual mode the first one added is the primary.
    pub fn with_provider(mut self, provider: impl EmbeddingProvider + 'static) -> Self {
        self.providers.push(Arc::new(provider));
        self
    }

    pub fn with_shared_provider(mut self, provider: Arc<dyn EmbeddingProvider>) -> Self {
        self.providers.push(provider);
        self
    }

    pub fn is_dual(&self) -> bool {
        self.providers.len() == 2
    }

    pub fn store(&self) -> &Arc<dyn EmbeddingStore> {
        &self.store
    }

    async fn process_dual(
        &self,
        cancel: &CancellationToken,
        item_id: i64,
        text: Arc<str>,
    ) -> Result<(), ProcessError> {
        let outcomes = join_providers(&self.providers, |provider| {
            let cancel = cancel.clone();
            let text = Arc::clone(&text);
            async move {
                let name = provider.name();
                generate(provider.as_ref(), &cancel, &text)
                    .await
                    .map(|embedding| (name.clone(), embedding))
                    .map_err(|e| {
                        error!(provider = %name, item_id, error = %e, "failed to generate embedding");
                        ProviderFailure {
                            provider: name,
                            stage: FailureStage::Generate,
                            error: e,
                        }
                    })
            }
        })
        .await;

        let (vectors, failures) = split_outcomes(outcomes);
        if !failures.is_empty() {
            return Err(ProcessError::Generation(failures));
        }

        if let [(primary, a), (secondary, b)] = vectors.as_slice() {
            self.store
                .store_dual(
                    cancel,
                    item_id,
                    (primary.as_str(), a.as_slice()),
                    (secondary.as_str(), b.as_slice()),
                )
                .await
                .map_err(|source| ProcessError::StoreDual { item_id, source })?;
            info!(item_id, "stored dual embeddings");
        }

        Ok(())
    }

    async fn process_each(
        &self,
        cancel: &CancellationToken,
        item_id: i64,
        text: Arc<str>,
    ) -> Result<(), ProcessError> {
        let outcomes = join_providers(&self.providers, |provider| {
            let cancel = cancel.clone();
            let text = Arc::clone(&text);
            let store = Arc::clone(&self.store);
            async move {
                let name = provider.name();
                let embedding = match generate(provider.as_ref(), &cancel, &text).await {
                    Ok(v) => v,
                    Err(e) => {
                        error!(provider = %name, item_id, error = %e, "failed to generate embedding");
                        return Err(ProviderFailure {
                            provider: name,
                            stage: FailureStage::Generate,
                            error: e,
                        });
                    }
                };

                if let Err(e) = store.store_single(&cancel, item_id, &name, &embedding).await {
                    error!(provider = %name, item_id, error = %e, "failed to store embedding");
                    return Err(ProviderFailure {
                        provider: name,
                        stage: FailureStage::Store,
                        error: e,
                    });
                }

                info!(provider = %name, item_id, "stored embedding");
                Ok(())
            }
        })
        .await;

        let (_, failures) = split_outcomes(outcomes);
        if failures.is_empty() {
            Ok(())
        } else {
            Err(ProcessError::Generation(failures))
        }
    }
}

#[async_trait]
impl ItemProcessor for EmbeddingCoordinator {
    async fn process(
        &self,
        cancel: &CancellationToken,
        item_id: i64,
        text: &str,
    ) -> Result<(), ProcessError> {
        if self.providers.is_empty() {
            return Ok(());
        }

        let text: Arc<str> = Arc::from(text);
        if self.is_dual() {
            self.process_dual(cancel, item_id, text).await
        } else {
            self.process_each(cancel, item_id, text).await
        }
    }

    async fn status(&self, cancel: &CancellationToken, item_id: i64) -> EmbeddingStatus {
        let mut status = EmbeddingStatus {
            item_id,
            ..EmbeddingStatus::default()
        };

        let lookup = match self.providers.as_slice() {
            [] => return status,
            [only] => self
                .store
                .get_single(cancel, item_id, &only.name())
                .await
                .map(|_| (true, false)),
            [primary, secondary, ..] => self
                .store
                .get_dual(cancel, item_id, &primary.name(), &secondary.name())
                .await
                .map(|dual| (dual.primary.is_some(), dual.secondary.is_some())),
        };

        match lookup {
            Ok((primary, secondary)) => {
                status.primary_completed = primary;
                status.secondary_completed = secondary;
            }
            Err(e) => {
                warn!(item_id, error = %e, "embedding status lookup failed, reporting incomplete");
            }
        }

        status
    }

    fn provider_names(&self) -> Vec<String> {
        self.providers.iter().map(|p| p.name()).collect()
    }
}

/// Run one provider call, giving up early if the run is cancelled.
async fn generate(
    provider: &dyn EmbeddingProvider,
    cancel: &CancellationToken,
    text: &str,
) -> Result<Vec<f32>, EmbedError> {
    tokio::select! {
        result = provider.generate(text) => result,
        _ = cancel.cancelled() => Err(EmbedError::Cancelled),
    }
}

/// Spawn `task` once per provider and wait for every one of them.
/// Outcomes come back in provider order. A failing task never aborts its
/// siblings.
async fn join_providers<T, F, Fut>(
    providers: &[Arc<dyn EmbeddingProvider>],
    task: F,
) -> Vec<Result<T, ProviderFailure>>
where
    F: Fn(Arc<dyn EmbeddingProvider>) -> Fut,
    Fut: Future<Output = Result<T, ProviderFailure>> + Send + 'static,
    T: Send + 'static,
{
    let handles: Vec<_> = providers
        .iter()
        .map(|p| (p.name(), tokio::spawn(task(Arc::clone(p)))))
        .collect();

    let mut outcomes = Vec::with_capacity(handles.len());
    for (name, handle) in handles {
        let outcome = match handle.await {
            Ok(result) => result,
            Err(e) => Err(ProviderFailure {
                provider: name,
                stage: FailureStage::Generate,
                error: EmbedError::Provider(format!("provider task aborted: {e}")),
            }),
        };
        outcomes.push(outcome);
    }
    outcomes
}

fn split_outcomes<T>(outcomes: Vec<Result<T, ProviderFailure>>) -> (Vec<T>, Vec<ProviderFailure>) {
    let mut ok = Vec::with_capacity(outcomes.len());
    let mut failures = Vec::new();
    for outcome in outcomes {
        match outcome {
            Ok(v) => ok.push(v),
            Err(f) => failures.push(f),
        }
    }
    (ok, failures)
}
