use chrono::{DateTime, Duration, Utc};

use crate::types::{ProcessingStatus, RunState};

/// Operator request, latest wins. Sticky until the runner acts on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub(crate) enum Control {
    #[default]
    Run,
    Pause,
    Stop,
}

/// Run-level state. Only the runner writes it, through its watch sender.
#[derive(Debug, Clone, Default)]
pub(crate) struct RunSnapshot {
    pub state: RunState,
    pub current_batch: usize,
    pub total_batches: usize,
    pub completed_batches: usize,
    pub started_at: Option<DateTime<Utc>>,
}

impl RunSnapshot {
    pub fn started(total_batches: usize, now: DateTime<Utc>) -> Self {
        Self {
            state: RunState::Running,
            current_batch: 0,
            total_batches,
            completed_batches: 0,
            started_at: Some(now),
        }
    }

    /// Status view. `pause_pending` covers a pause requested but not yet
    /// reached at a batch boundary.
    pub fn to_status(&self, pause_pending: bool, now: DateTime<Utc>) -> ProcessingStatus {
        let progress_percent = if self.total_batches > 0 {
            self.current_batch as f64 / self.total_batches as f64 * 100.0
        } else {
            0.0
        };

        ProcessingStatus {
            state: self.state,
            is_processing: self.state.is_active(),
            is_paused: self.state == RunState::Paused
                || (self.state == RunState::Running && pause_pending),
            current_batch: self.current_batch,
            total_batches: self.total_batches,
            progress_percent,
            started_at: self.started_at,
            eta: self.eta(now),
        }
    }

    /// Linear extrapolation from the average time per finished batch.
    fn eta(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        if !self.state.is_active() || self.completed_batches == 0 {
            return None;
        }
        let started_at = self.started_at?;
        let elapsed_ms = now.signed_duration_since(started_at).num_milliseconds().max(0);
        let per_batch_ms = elapsed_ms / self.completed_batches as i64;
        let remaining = self.total_batches.saturating_sub(self.completed_batches) as i64;
        Some(now + Duration::milliseconds(per_batch_ms * remaining))
    }
}
