/// Events emitted during a batch run, for progress reporting.
#[derive(Debug, Clone, PartialEq)]
pub enum BatchEvent {
    RunStarted { total_items: usize, total_batches: usize },
    BatchStarted { batch: usize, total_batches: usize },
    Progress { batch: usize, progress: f64, processed: usize, failed: usize },
    Paused { before_batch: usize },
    Resumed,
    Stopped { processed: usize, failed: usize },
    Finished { processed: usize, failed: usize },
}
