mod control;

use std::collections::HashSet;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{mpsc, watch, Mutex, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::RunnerConfig;
use crate::coordinator::ItemProcessor;
use crate::error::{ProcessError, RunnerError};
use crate::events::BatchEvent;
use crate::store::EmbeddingStore;
use crate::types::{BatchResult, ItemFailure, ProcessingStatus, RunState, WorkItem};

use control::{Control, RunSnapshot};

/// Drives many items through an [`ItemProcessor`] in sequential chunks.
///
/// Items inside a chunk run concurrently; chunk N+1 starts only once every
/// item of chunk N has finished. Pause, resume, stop and cancellation are
/// honored at chunk boundaries. Per-item failures are counted in the returned
/// [`BatchResult`] and never abort the run.
///
/// One run at a time: share the runner behind an `Arc` to control it from
/// another task while `process_batch` is in flight.
pub struct BatchRunner {
    processor: Arc<dyn ItemProcessor>,
    store: Arc<dyn EmbeddingStore>,
    config: RunnerConfig,
    run: watch::Sender<RunSnapshot>,
    control: watch::Sender<Control>,
    events: Option<mpsc::Sender<BatchEvent>>,
}

impl BatchRunner {
    pub fn new(processor: Arc<dyn ItemProcessor>, store: Arc<dyn EmbeddingStore>) -> Self {
        let (run, _) = watch::channel(RunSnapshot::default());
        let (control, _) = watch::channel(Control::Run);
        Self {
            processor,
            store,
            config: RunnerConfig::default(),
            run,
            control,
            events: None,
        }
    }

    pub fn with_config(mut self, config: RunnerConfig) -> Self {
        self.config = config;
        self
    }

    /// Stream progress events to `tx`. Sends are best-effort.
    pub fn with_events(mut self, tx: mpsc::Sender<BatchEvent>) -> Self {
        self.events = Some(tx);
        self
    }

    pub fn config(&self) -> &RunnerConfig {
        &self.config
    }

    /// Process `items` in chunks of `batch_size`.
    ///
    /// Returns early, without error, when stopped or cancelled; the result then
    /// covers only the chunks that ran. A run-level error is returned only for
    /// a zero batch size or when another run is already active.
    pub async fn process_batch(
        &self,
        cancel: &CancellationToken,
        items: &[WorkItem],
        batch_size: usize,
    ) -> Result<BatchResult, RunnerError> {
        if batch_size == 0 {
            return Err(RunnerError::InvalidBatchSize(batch_size));
        }

        let total_batches = items.len().div_ceil(batch_size);
        self.begin(total_batches)?;
        let _guard = RunGuard { runner: self };

        self.emit(BatchEvent::RunStarted {
            total_items: items.len(),
            total_batches,
        })
        .await;

        let result = Arc::new(Mutex::new(BatchResult::default()));
        let limiter = self
            .config
            .max_concurrency
            .map(|n| Arc::new(Semaphore::new(n)));
        let mut completed_items = 0;
        let mut stopped = false;

        for (index, chunk) in items.chunks(batch_size).enumerate() {
            let batch = index + 1;
            if !self.checkpoint(cancel, batch).await {
                stopped = true;
                break;
            }

            self.run.send_modify(|run| run.current_batch = batch);
            self.emit(BatchEvent::BatchStarted {
                batch,
                total_batches,
            })
            .await;

            self.run_chunk(cancel, chunk, &result, limiter.as_ref()).await;

            completed_items += chunk.len();
            self.run.send_modify(|run| run.completed_batches = batch);

            let progress = completed_items as f64 / items.len() as f64 * 100.0;
            let (processed, failed) = {
                let r = result.lock().await;
                (r.processed, r.failed)
            };
            info!(batch, total_batches, progress, processed, failed, "batch processing progress");
            self.emit(BatchEvent::Progress {
                batch,
                progress,
                processed,
                failed,
            })
            .await;
        }

        let result = match Arc::try_unwrap(result) {
            Ok(result) => result.into_inner(),
            Err(shared) => std::mem::take(&mut *shared.lock().await),
        };

        if stopped {
            self.finish(RunState::Stopped);
            info!(
                processed = result.processed,
                failed = result.failed,
                remaining = items.len() - result.attempted(),
                "batch processing stopped"
            );
            self.emit(BatchEvent::Stopped {
                processed: result.processed,
                failed: result.failed,
            })
            .await;
        } else {
            self.finish(RunState::Completed);
            info!(
                processed = result.processed,
                failed = result.failed,
                "batch processing complete"
            );
            self.emit(BatchEvent::Finished {
                processed: result.processed,
                failed: result.failed,
            })
            .await;
        }

        Ok(result)
    }

    /// Embed every stored item that is missing a vector for any configured
    /// provider. Items pending for several providers are processed once.
    pub async fn process_all(&self, cancel: &CancellationToken) -> Result<BatchResult, RunnerError> {
        let items = self.collect_pending(cancel, None).await?;
        if items.is_empty() {
            info!("no items to process");
            return Ok(BatchResult::default());
        }

        info!(
            total_items = items.len(),
            providers = ?self.processor.provider_names(),
            batch_size = self.config.batch_size,
            "starting batch processing"
        );
        self.process_batch(cancel, &items, self.config.batch_size).await
    }

    /// Same as [`process_all`](Self::process_all), restricted to one owner's items.
    pub async fn process_for_owner(
        &self,
        cancel: &CancellationToken,
        owner: &str,
    ) -> Result<BatchResult, RunnerError> {
        let items = self.collect_pending(cancel, Some(owner)).await?;
        if items.is_empty() {
            info!(owner, "no items to process for owner");
            return Ok(BatchResult::default());
        }

        info!(
            owner,
            total_items = items.len(),
            providers = ?self.processor.provider_names(),
            batch_size = self.config.batch_size,
            "starting owner batch processing"
        );
        let result = self
            .process_batch(cancel, &items, self.config.batch_size)
            .await?;
        info!(owner, total_items = items.len(), "completed owner batch processing");
        Ok(result)
    }

    /// Point-in-time view of the current (or last) run.
    pub fn status(&self) -> ProcessingStatus {
        let pause_pending = *self.control.borrow() == Control::Pause;
        self.run.borrow().to_status(pause_pending, Utc::now())
    }

    /// Ask the run to pause at the next batch boundary. No-op unless running.
    pub fn pause(&self) {
        if self.run.borrow().state != RunState::Running {
            return;
        }
        let requested = self.control.send_if_modified(|c| {
            if *c == Control::Run {
                *c = Control::Pause;
                true
            } else {
                false
            }
        });
        if requested {
            info!("pause requested");
        }
    }

    /// Cancel a pending pause or wake a paused run. No-op unless paused.
    pub fn resume(&self) {
        if !self.run.borrow().state.is_active() {
            return;
        }
        let requested = self.control.send_if_modified(|c| {
            if *c == Control::Pause {
                *c = Control::Run;
                true
            } else {
                false
            }
        });
        if requested {
            info!("resume requested");
        }
    }

    /// Ask the run to stop at the next batch boundary, or immediately if it
    /// is paused. No-op unless a run is active.
    pub fn stop(&self) {
        if !self.run.borrow().state.is_active() {
            return;
        }
        self.control.send_replace(Control::Stop);
        info!("stop requested");
    }

    /// Resolves once the runner has published `state`. Pair with `pause` /
    /// `stop` to wait until the request has actually taken effect.
    pub async fn wait_for_state(&self, state: RunState) {
        let mut rx = self.run.subscribe();
        // The sender lives in `self`, so the channel cannot close here.
        let _ = rx.wait_for(|run| run.state == state).await;
    }

    fn begin(&self, total_batches: usize) -> Result<(), RunnerError> {
        let started = self.run.send_if_modified(|run| {
            if run.state.is_active() {
                false
            } else {
                *run = RunSnapshot::started(total_batches, Utc::now());
                true
            }
        });
        if !started {
            return Err(RunnerError::AlreadyRunning);
        }
        self.control.send_replace(Control::Run);
        Ok(())
    }

    fn finish(&self, state: RunState) {
        self.run.send_if_modified(|run| {
            if run.state.is_active() {
                run.state = state;
                true
            } else {
                false
            }
        });
    }

    /// Batch-boundary control check. Blocks while paused. Returns `false`
    /// when the run should end here.
    async fn checkpoint(&self, cancel: &CancellationToken, batch: usize) -> bool {
        let mut control = self.control.subscribe();
        loop {
            if cancel.is_cancelled() {
                info!(batch, "batch processing cancelled");
                return false;
            }

            let requested = *control.borrow_and_update();
            match requested {
                Control::Run => {
                    if self.transition(RunState::Paused, RunState::Running) {
                        info!(batch, "batch processing resumed");
                        self.emit(BatchEvent::Resumed).await;
                    }
                    return true;
                }
                Control::Stop => return false,
                Control::Pause => {
                    if self.transition(RunState::Running, RunState::Paused) {
                        info!(batch, "batch processing paused");
                        self.emit(BatchEvent::Paused { before_batch: batch })
                            .await;
                    }
                    tokio::select! {
                        changed = control.changed() => {
                            if changed.is_err() {
                                return false;
                            }
                        }
                        _ = cancel.cancelled() => {
                            info!(batch, "batch processing cancelled while paused");
                            return false;
                        }
                    }
                }
            }
        }
    }

    fn transition(&self, from: RunState, to: RunState) -> bool {
        self.run.send_if_modified(|run| {
            if run.state == from {
                run.state = to;
                true
            } else {
                false
            }
        })
    }

    async fn run_chunk(
        &self,
        cancel: &CancellationToken,
        chunk: &[WorkItem],
        result: &Arc<Mutex<BatchResult>>,
        limiter: Option<&Arc<Semaphore>>,
    ) {
        let mut handles = Vec::with_capacity(chunk.len());
        for item in chunk {
            let processor = Arc::clone(&self.processor);
            let cancel = cancel.clone();
            let result = Arc::clone(result);
            let limiter = limiter.cloned();
            let item_id = item.id;
            let text = item.text.clone();

            let handle = tokio::spawn(async move {
                let _permit = match limiter {
                    Some(sem) => sem.acquire_owned().await.ok(),
                    None => None,
                };
                let outcome = processor.process(&cancel, item_id, &text).await;
                record(&result, item_id, outcome).await;
            });
            handles.push((item_id, handle));
        }

        for (item_id, handle) in handles {
            if let Err(e) = handle.await {
                record(result, item_id, Err(ProcessError::Aborted(e.to_string()))).await;
            }
        }
    }

    async fn collect_pending(
        &self,
        cancel: &CancellationToken,
        owner: Option<&str>,
    ) -> Result<Vec<WorkItem>, RunnerError> {
        let limit = self.config.listing_limit;
        let mut seen = HashSet::new();
        let mut items = Vec::new();

        for provider in self.processor.provider_names() {
            let listed = match owner {
                Some(owner) => {
                    self.store
                        .list_without_embedding_for_owner(cancel, &provider, owner, limit)
                        .await
                }
                None => {
                    self.store
                        .list_without_embedding(cancel, &provider, limit)
                        .await
                }
            }
            .map_err(|source| RunnerError::Listing {
                provider: provider.clone(),
                source,
            })?;

            for item in listed {
                if seen.insert(item.id) {
                    items.push(item);
                }
            }
        }

        Ok(items)
    }

    async fn emit(&self, event: BatchEvent) {
        if let Some(ref tx) = self.events {
            let _ = tx.send(event).await;
        }
    }
}

async fn record(result: &Mutex<BatchResult>, item_id: i64, outcome: Result<(), ProcessError>) {
    let mut result = result.lock().await;
    match outcome {
        Ok(()) => result.processed += 1,
        Err(error) => {
            warn!(item_id, error = %error, "item failed");
            result.failed += 1;
            result.errors.push(ItemFailure { item_id, error });
        }
    }
}

/// Marks the run stopped if `process_batch` exits without finishing,
/// e.g. when its future is dropped mid-run.
struct RunGuard<'a> {
    runner: &'a BatchRunner,
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.runner.finish(RunState::Stopped);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::EmbeddingCoordinator;
    use crate::error::{EmbedError, FailureStage, ProviderFailure};
    use crate::providers::mock::MockEmbedder;
    use crate::stores::memory::InMemoryStore;
    use crate::types::{DualEmbedding, EmbeddingStatus};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::{Duration, Instant};

    // --- Mock Processor ---

    #[derive(Default)]
    struct MockProcessor {
        providers: Vec<String>,
        fail_ids: HashSet<i64>,
        panic_ids: HashSet<i64>,
        delay: Duration,
        gate: Option<Arc<Semaphore>>,
        started: Option<mpsc::UnboundedSender<i64>>,
        calls: Mutex<Vec<i64>>,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
    }

    impl MockProcessor {
        async fn calls(&self) -> Vec<i64> {
            let mut calls = self.calls.lock().await.clone();
            calls.sort();
            calls
        }
    }

    #[async_trait]
    impl ItemProcessor for MockProcessor {
        async fn process(
            &self,
            _cancel: &CancellationToken,
            item_id: i64,
            _text: &str,
        ) -> Result<(), ProcessError> {
            self.calls.lock().await.push(item_id);
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);

            if let Some(ref tx) = self.started {
                let _ = tx.send(item_id);
            }
            if let Some(ref gate) = self.gate {
                let _permit = gate.acquire().await;
            }
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            if self.panic_ids.contains(&item_id) {
                panic!("processor blew up on item {item_id}");
            }
            if self.fail_ids.contains(&item_id) {
                return Err(ProcessError::Generation(vec![ProviderFailure {
                    provider: "openai".into(),
                    stage: FailureStage::Generate,
                    error: EmbedError::Provider(format!("item {item_id} rejected")),
                }]));
            }
            Ok(())
        }

        async fn status(&self, _cancel: &CancellationToken, item_id: i64) -> EmbeddingStatus {
            EmbeddingStatus {
                item_id,
                ..EmbeddingStatus::default()
            }
        }

        fn provider_names(&self) -> Vec<String> {
            self.providers.clone()
        }
    }

    /// Processor whose items block until the test opens the gate, and which
    /// reports each item as it starts.
    fn gated() -> (MockProcessor, Arc<Semaphore>, mpsc::UnboundedReceiver<i64>) {
        let gate = Arc::new(Semaphore::new(0));
        let (tx, rx) = mpsc::unbounded_channel();
        let processor = MockProcessor {
            gate: Some(Arc::clone(&gate)),
            started: Some(tx),
            ..MockProcessor::default()
        };
        (processor, gate, rx)
    }

    // --- Broken Store ---

    struct BrokenStore;

    #[async_trait]
    impl EmbeddingStore for BrokenStore {
        async fn store_single(
            &self,
            _: &CancellationToken,
            _: i64,
            _: &str,
            _: &[f32],
        ) -> Result<(), EmbedError> {
            Err(EmbedError::Store("offline".into()))
        }

        async fn get_single(
            &self,
            _: &CancellationToken,
            _: i64,
            _: &str,
        ) -> Result<Vec<f32>, EmbedError> {
            Err(EmbedError::Store("offline".into()))
        }

        async fn store_dual(
            &self,
            _: &CancellationToken,
            _: i64,
            _: (&str, &[f32]),
            _: (&str, &[f32]),
        ) -> Result<(), EmbedError> {
            Err(EmbedError::Store("offline".into()))
        }

        async fn get_dual(
            &self,
            _: &CancellationToken,
            _: i64,
            _: &str,
            _: &str,
        ) -> Result<DualEmbedding, EmbedError> {
            Err(EmbedError::Store("offline".into()))
        }

        async fn list_without_embedding(
            &self,
            _: &CancellationToken,
            _: &str,
            _: usize,
        ) -> Result<Vec<WorkItem>, EmbedError> {
            Err(EmbedError::Store("offline".into()))
        }

        async fn list_without_embedding_for_owner(
            &self,
            _: &CancellationToken,
            _: &str,
            _: &str,
            _: usize,
        ) -> Result<Vec<WorkItem>, EmbedError> {
            Err(EmbedError::Store("offline".into()))
        }

        async fn close(&self) -> Result<(), EmbedError> {
            Ok(())
        }
    }

    // --- Helpers ---

    fn items(n: i64) -> Vec<WorkItem> {
        (1..=n)
            .map(|id| {
                let owner = if id % 2 == 1 { "alice" } else { "bob" };
                WorkItem::new(id, owner, format!("item {id} text"))
            })
            .collect()
    }

    fn runner(processor: &Arc<MockProcessor>) -> Arc<BatchRunner> {
        Arc::new(BatchRunner::new(
            Arc::clone(processor) as Arc<dyn ItemProcessor>,
            Arc::new(InMemoryStore::new()),
        ))
    }

    fn spawn_run(
        runner: &Arc<BatchRunner>,
        cancel: CancellationToken,
        items: Vec<WorkItem>,
        batch_size: usize,
    ) -> tokio::task::JoinHandle<Result<BatchResult, RunnerError>> {
        let runner = Arc::clone(runner);
        tokio::spawn(async move { runner.process_batch(&cancel, &items, batch_size).await })
    }

    async fn within<T>(fut: impl std::future::Future<Output = T>) -> T {
        tokio::time::timeout(Duration::from_secs(5), fut)
            .await
            .expect("timed out")
    }

    fn drain(rx: &mut mpsc::Receiver<BatchEvent>) -> Vec<BatchEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    // --- Tests ---

    #[tokio::test]
    async fn three_items_in_two_batches() {
        let processor = Arc::new(MockProcessor::default());
        let runner = runner(&processor);

        let result = runner
            .process_batch(&CancellationToken::new(), &items(3), 2)
            .await
            .unwrap();

        assert_eq!(result.processed, 3);
        assert_eq!(result.failed, 0);
        assert!(result.is_clean());

        let status = runner.status();
        assert_eq!(status.state, RunState::Completed);
        assert!(!status.is_processing);
        assert_eq!(status.total_batches, 2);
        assert_eq!(status.current_batch, 2);
        assert_eq!(status.progress_percent, 100.0);
        assert!(status.started_at.is_some());
        assert_eq!(processor.calls().await, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn failing_item_is_recorded_not_fatal() {
        let processor = Arc::new(MockProcessor {
            fail_ids: HashSet::from([3]),
            ..MockProcessor::default()
        });
        let runner = runner(&processor);

        let result = runner
            .process_batch(&CancellationToken::new(), &items(5), 5)
            .await
            .unwrap();

        assert_eq!(result.processed, 4);
        assert_eq!(result.failed, 1);
        assert_eq!(result.errors.len(), 1);
        assert_eq!(result.errors[0].item_id, 3);
        assert!(result.errors[0]
            .error
            .to_string()
            .contains("embedding generation failed"));
    }

    #[tokio::test]
    async fn counts_add_up_for_any_batch_size() {
        for (m, b) in [(1, 1), (7, 3), (10, 10), (10, 4), (13, 1), (4, 100)] {
            let processor = Arc::new(MockProcessor {
                fail_ids: (1..=m).filter(|id| id % 3 == 0).collect(),
                ..MockProcessor::default()
            });
            let runner = runner(&processor);

            let result = runner
                .process_batch(&CancellationToken::new(), &items(m), b)
                .await
                .unwrap();

            let expected_failed = (m / 3) as usize;
            assert_eq!(result.attempted(), m as usize, "m={m} b={b}");
            assert_eq!(result.failed, expected_failed, "m={m} b={b}");
            assert_eq!(result.errors.len(), result.failed);
            assert_eq!(
                runner.status().total_batches,
                (m as usize).div_ceil(b),
                "m={m} b={b}"
            );
        }
    }

    #[tokio::test]
    async fn zero_batch_size_rejected_up_front() {
        let processor = Arc::new(MockProcessor::default());
        let runner = runner(&processor);

        let err = runner
            .process_batch(&CancellationToken::new(), &items(3), 0)
            .await
            .unwrap_err();

        assert!(matches!(err, RunnerError::InvalidBatchSize(0)));
        assert_eq!(runner.status().state, RunState::Idle);
        assert!(processor.calls().await.is_empty());
    }

    #[tokio::test]
    async fn empty_input_completes_immediately() {
        let processor = Arc::new(MockProcessor::default());
        let runner = runner(&processor);

        let result = runner
            .process_batch(&CancellationToken::new(), &[], 4)
            .await
            .unwrap();

        assert_eq!(result.attempted(), 0);
        let status = runner.status();
        assert_eq!(status.state, RunState::Completed);
        assert_eq!(status.total_batches, 0);
        assert_eq!(status.progress_percent, 0.0);
    }

    #[tokio::test]
    async fn concurrency_bounded_by_chunk() {
        let processor = Arc::new(MockProcessor {
            delay: Duration::from_millis(20),
            ..MockProcessor::default()
        });
        let runner = runner(&processor);

        runner
            .process_batch(&CancellationToken::new(), &items(7), 3)
            .await
            .unwrap();

        assert_eq!(processor.max_in_flight.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn max_concurrency_caps_within_chunk() {
        let processor = Arc::new(MockProcessor {
            delay: Duration::from_millis(10),
            ..MockProcessor::default()
        });
        let runner = BatchRunner::new(
            Arc::clone(&processor) as Arc<dyn ItemProcessor>,
            Arc::new(InMemoryStore::new()),
        )
        .with_config(RunnerConfig::default().with_max_concurrency(2));

        let result = runner
            .process_batch(&CancellationToken::new(), &items(6), 6)
            .await
            .unwrap();

        assert_eq!(result.processed, 6);
        assert!(processor.max_in_flight.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn panicking_item_counts_as_failure() {
        let processor = Arc::new(MockProcessor {
            panic_ids: HashSet::from([2]),
            ..MockProcessor::default()
        });
        let runner = runner(&processor);

        let result = runner
            .process_batch(&CancellationToken::new(), &items(3), 3)
            .await
            .unwrap();

        assert_eq!(result.processed, 2);
        assert_eq!(result.failed, 1);
        assert!(matches!(result.errors[0].error, ProcessError::Aborted(_)));
    }

    #[tokio::test]
    async fn events_track_each_batch() {
        let processor = Arc::new(MockProcessor::default());
        let (tx, mut rx) = mpsc::channel(64);
        let runner = BatchRunner::new(
            Arc::clone(&processor) as Arc<dyn ItemProcessor>,
            Arc::new(InMemoryStore::new()),
        )
        .with_events(tx);

        runner
            .process_batch(&CancellationToken::new(), &items(3), 2)
            .await
            .unwrap();

        let events = drain(&mut rx);
        assert_eq!(
            events.first(),
            Some(&BatchEvent::RunStarted {
                total_items: 3,
                total_batches: 2
            })
        );
        let progress: Vec<f64> = events
            .iter()
            .filter_map(|e| match e {
                BatchEvent::Progress { progress, .. } => Some(*progress),
                _ => None,
            })
            .collect();
        assert_eq!(progress.len(), 2);
        assert!((progress[0] - 200.0 / 3.0).abs() < 1e-9);
        assert_eq!(progress[1], 100.0);
        assert_eq!(
            events.last(),
            Some(&BatchEvent::Finished {
                processed: 3,
                failed: 0
            })
        );
    }

    #[tokio::test]
    async fn pause_holds_next_batch_until_resume() {
        let (processor, gate, mut started) = gated();
        let processor = Arc::new(processor);
        let runner = runner(&processor);

        let begin = Instant::now();
        let run = spawn_run(&runner, CancellationToken::new(), items(4), 2);

        within(started.recv()).await;
        runner.pause();
        assert!(runner.status().is_paused);
        gate.add_permits(1);

        within(runner.wait_for_state(RunState::Paused)).await;
        assert_eq!(processor.calls().await, vec![1, 2]);
        assert!(runner.status().is_processing);

        tokio::time::sleep(Duration::from_millis(50)).await;
        runner.resume();

        let result = within(run).await.unwrap().unwrap();
        assert_eq!(result.processed, 4);
        assert!(begin.elapsed() >= Duration::from_millis(50));
        assert_eq!(runner.status().state, RunState::Completed);
    }

    #[tokio::test]
    async fn resume_before_boundary_cancels_pause() {
        let (processor, gate, mut started) = gated();
        let processor = Arc::new(processor);
        let runner = runner(&processor);

        let run = spawn_run(&runner, CancellationToken::new(), items(4), 2);

        within(started.recv()).await;
        runner.pause();
        runner.resume();
        assert!(!runner.status().is_paused);
        gate.add_permits(1);

        let result = within(run).await.unwrap().unwrap();
        assert_eq!(result.processed, 4);
    }

    #[tokio::test]
    async fn stop_ends_run_at_next_boundary() {
        let (processor, gate, mut started) = gated();
        let processor = Arc::new(processor);
        let (tx, mut rx) = mpsc::channel(64);
        let runner = Arc::new(
            BatchRunner::new(
                Arc::clone(&processor) as Arc<dyn ItemProcessor>,
                Arc::new(InMemoryStore::new()),
            )
            .with_events(tx),
        );

        let run = spawn_run(&runner, CancellationToken::new(), items(10), 5);

        within(started.recv()).await;
        runner.stop();
        gate.add_permits(1);

        let result = within(run).await.unwrap().unwrap();
        assert_eq!(result.processed, 5);
        assert!(result.attempted() < 10);
        assert_eq!(runner.status().state, RunState::Stopped);
        assert!(drain(&mut rx).contains(&BatchEvent::Stopped {
            processed: 5,
            failed: 0
        }));
    }

    #[tokio::test]
    async fn stop_while_paused_ends_immediately() {
        let (processor, gate, mut started) = gated();
        let processor = Arc::new(processor);
        let runner = runner(&processor);

        let run = spawn_run(&runner, CancellationToken::new(), items(4), 2);

        within(started.recv()).await;
        runner.pause();
        gate.add_permits(1);
        within(runner.wait_for_state(RunState::Paused)).await;

        runner.stop();
        let result = within(run).await.unwrap().unwrap();
        assert_eq!(result.processed, 2);
        assert_eq!(runner.status().state, RunState::Stopped);
    }

    #[tokio::test]
    async fn cancellation_ends_run_between_batches() {
        let (processor, gate, mut started) = gated();
        let processor = Arc::new(processor);
        let runner = runner(&processor);
        let cancel = CancellationToken::new();

        let run = spawn_run(&runner, cancel.clone(), items(4), 2);

        within(started.recv()).await;
        cancel.cancel();
        gate.add_permits(1);

        let result = within(run).await.unwrap().unwrap();
        assert_eq!(result.attempted(), 2);
        assert_eq!(runner.status().state, RunState::Stopped);
    }

    #[tokio::test]
    async fn cancellation_wakes_paused_run() {
        let (processor, gate, mut started) = gated();
        let processor = Arc::new(processor);
        let runner = runner(&processor);
        let cancel = CancellationToken::new();

        let run = spawn_run(&runner, cancel.clone(), items(4), 2);

        within(started.recv()).await;
        runner.pause();
        gate.add_permits(1);
        within(runner.wait_for_state(RunState::Paused)).await;

        cancel.cancel();
        let result = within(run).await.unwrap().unwrap();
        assert_eq!(result.attempted(), 2);
    }

    #[tokio::test]
    async fn controls_are_no_ops_when_idle() {
        let processor = Arc::new(MockProcessor::default());
        let runner = runner(&processor);

        runner.pause();
        runner.resume();
        runner.stop();
        let status = runner.status();
        assert_eq!(status.state, RunState::Idle);
        assert!(!status.is_paused);

        let result = runner
            .process_batch(&CancellationToken::new(), &items(4), 2)
            .await
            .unwrap();
        assert_eq!(result.processed, 4);
    }

    #[tokio::test]
    async fn second_run_rejected_while_active() {
        let (processor, gate, mut started) = gated();
        let processor = Arc::new(processor);
        let runner = runner(&processor);

        let run = spawn_run(&runner, CancellationToken::new(), items(2), 2);
        within(started.recv()).await;

        let err = runner
            .process_batch(&CancellationToken::new(), &items(2), 2)
            .await
            .unwrap_err();
        assert!(matches!(err, RunnerError::AlreadyRunning));

        gate.add_permits(1);
        let result = within(run).await.unwrap().unwrap();
        assert_eq!(result.processed, 2);
    }

    // --- Bulk entry points ---

    async fn seeded_store() -> Arc<InMemoryStore> {
        let store = Arc::new(InMemoryStore::new());
        for item in items(3) {
            store.insert_item(item).await;
        }
        store
    }

    #[tokio::test]
    async fn process_all_merges_provider_listings() {
        let store = seeded_store().await;
        let cancel = CancellationToken::new();
        store.store_single(&cancel, 1, "openai", &[0.1]).await.unwrap();
        store.store_single(&cancel, 2, "gemini", &[0.2]).await.unwrap();

        let processor = Arc::new(MockProcessor {
            providers: vec!["openai".into(), "gemini".into()],
            ..MockProcessor::default()
        });
        let runner = BatchRunner::new(
            Arc::clone(&processor) as Arc<dyn ItemProcessor>,
            Arc::clone(&store) as Arc<dyn EmbeddingStore>,
        );

        let result = runner.process_all(&CancellationToken::new()).await.unwrap();

        // 2 and 3 pending for openai, 1 and 3 for gemini: 3 appears once.
        assert_eq!(result.processed, 3);
        assert_eq!(processor.calls().await, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn process_for_owner_only_touches_owner_items() {
        let store = seeded_store().await;
        let processor = Arc::new(MockProcessor {
            providers: vec!["openai".into(), "gemini".into()],
            ..MockProcessor::default()
        });
        let runner = BatchRunner::new(
            Arc::clone(&processor) as Arc<dyn ItemProcessor>,
            Arc::clone(&store) as Arc<dyn EmbeddingStore>,
        );

        let result = runner
            .process_for_owner(&CancellationToken::new(), "alice")
            .await
            .unwrap();

        assert_eq!(result.processed, 2);
        assert_eq!(processor.calls().await, vec![1, 3]);
    }

    #[tokio::test]
    async fn listing_failure_aborts_before_processing() {
        let processor = Arc::new(MockProcessor {
            providers: vec!["openai".into()],
            ..MockProcessor::default()
        });
        let runner = BatchRunner::new(
            Arc::clone(&processor) as Arc<dyn ItemProcessor>,
            Arc::new(BrokenStore),
        );

        let err = runner
            .process_all(&CancellationToken::new())
            .await
            .unwrap_err();

        match err {
            RunnerError::Listing { provider, .. } => assert_eq!(provider, "openai"),
            other => panic!("expected listing error, got {other:?}"),
        }
        assert!(processor.calls().await.is_empty());
        assert_eq!(runner.status().state, RunState::Idle);
    }

    #[tokio::test]
    async fn nothing_pending_is_a_no_op() {
        let processor = Arc::new(MockProcessor {
            providers: vec!["openai".into()],
            ..MockProcessor::default()
        });
        let runner = runner(&processor);

        let result = runner
            .process_for_owner(&CancellationToken::new(), "nobody")
            .await
            .unwrap();

        assert_eq!(result.attempted(), 0);
        assert_eq!(runner.status().state, RunState::Idle);
    }

    #[tokio::test]
    async fn end_to_end_dual_backfill() {
        let store = seeded_store().await;
        let coordinator = EmbeddingCoordinator::new(Arc::clone(&store) as Arc<dyn EmbeddingStore>)
            .with_provider(MockEmbedder::new("openai", 8))
            .with_provider(MockEmbedder::new("gemini", 4));
        let coordinator: Arc<dyn ItemProcessor> = Arc::new(coordinator);
        let runner = BatchRunner::new(
            Arc::clone(&coordinator),
            Arc::clone(&store) as Arc<dyn EmbeddingStore>,
        )
        .with_config(RunnerConfig::default().with_batch_size(2));

        let result = runner.process_all(&CancellationToken::new()).await.unwrap();
        assert_eq!(result.processed, 3);
        assert_eq!(store.embedding_count().await, 6);

        let cancel = CancellationToken::new();
        let status = coordinator.status(&cancel, 2).await;
        assert!(status.primary_completed);
        assert!(status.secondary_completed);
        assert_eq!(store.get_single(&cancel, 2, "gemini").await.unwrap().len(), 4);

        let again = runner.process_all(&CancellationToken::new()).await.unwrap();
        assert_eq!(again.attempted(), 0);
    }

    #[tokio::test]
    async fn custom_dual_names_drain_the_backlog() {
        let store = seeded_store().await;
        let coordinator = EmbeddingCoordinator::new(Arc::clone(&store) as Arc<dyn EmbeddingStore>)
            .with_provider(MockEmbedder::new("voyage", 4))
            .with_provider(MockEmbedder::new("cohere", 6));
        let runner = BatchRunner::new(
            Arc::new(coordinator),
            Arc::clone(&store) as Arc<dyn EmbeddingStore>,
        );

        let first = runner.process_all(&CancellationToken::new()).await.unwrap();
        assert_eq!(first.processed, 3);
        assert!(!store.has_embedding(1, "openai").await);
        assert!(store.has_embedding(1, "voyage").await);
        assert!(store.has_embedding(1, "cohere").await);

        let second = runner.process_all(&CancellationToken::new()).await.unwrap();
        assert_eq!(second.attempted(), 0);
    }
}
