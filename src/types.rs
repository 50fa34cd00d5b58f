use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ProcessError;

/// A unit of work: one stored text waiting for embeddings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkItem {
    pub id: i64,
    pub owner: String,
    pub text: String,
}

impl WorkItem {
    pub fn new(id: i64, owner: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            id,
            owner: owner.into(),
            text: text.into(),
        }
    }
}

/// Both vectors of a dual record. Either half may be missing.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DualEmbedding {
    pub primary: Option<Vec<f32>>,
    pub secondary: Option<Vec<f32>>,
}

/// Per-item embedding completion, derived from storage at query time.
///
/// `primary` is the first configured provider, `secondary` the second.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EmbeddingStatus {
    pub item_id: i64,
    pub primary_completed: bool,
    pub secondary_completed: bool,
    pub primary_error: Option<String>,
    pub secondary_error: Option<String>,
}

/// An item that failed during a batch run.
#[derive(Debug)]
pub struct ItemFailure {
    pub item_id: i64,
    pub error: ProcessError,
}

/// Outcome of one `process_batch` call. A successful return does not mean
/// every item succeeded; check `failed`.
#[derive(Debug, Default)]
pub struct BatchResult {
    pub processed: usize,
    pub failed: usize,
    /// In completion order, not input order.
    pub errors: Vec<ItemFailure>,
}

impl BatchResult {
    pub fn attempted(&self) -> usize {
        self.processed + self.failed
    }

    pub fn is_clean(&self) -> bool {
        self.failed == 0
    }
}

/// Lifecycle of a batch runner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    #[default]
    Idle,
    Running,
    Paused,
    Stopped,
    Completed,
}

impl RunState {
    /// True while a run owns the runner (running or paused).
    pub fn is_active(self) -> bool {
        matches!(self, Self::Running | Self::Paused)
    }
}

/// Point-in-time view of a batch runner.
#[derive(Debug, Clone, Serialize)]
pub struct ProcessingStatus {
    pub state: RunState,
    pub is_processing: bool,
    pub is_paused: bool,
    pub current_batch: usize,
    pub total_batches: usize,
    pub progress_percent: f64,
    pub started_at: Option<DateTime<Utc>>,
    pub eta: Option<DateTime<Utc>>,
}
