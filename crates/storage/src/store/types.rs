#![forbid(unsafe_code)]

use qc_core::job::JobState;

/// One row of the `jobs` table. Timestamps are epoch milliseconds UTC;
/// boundaries render them as ISO-8601 with a trailing `Z`.
#[derive(Clone, Debug)]
pub struct JobRow {
    pub id: String,
    pub command: String,
    pub state: JobState,
    pub attempts: i64,
    pub max_retries: i64,
    pub base_backoff: f64,
    pub priority: i64,
    pub timeout_seconds: Option<f64>,
    pub stdout_log: String,
    pub last_error: Option<String>,
    pub created_at_ms: i64,
    pub updated_at_ms: i64,
    pub available_at_ms: i64,
    pub started_at_ms: Option<i64>,
    pub finished_at_ms: Option<i64>,
}

#[derive(Clone, Debug, Default)]
pub struct JobEnqueueRequest {
    pub id: String,
    pub command: String,
    pub max_retries: Option<i64>,
    pub base_backoff: Option<f64>,
    pub priority: Option<i64>,
    pub timeout_seconds: Option<f64>,
    /// ISO-8601 UTC (`...Z`); becomes `available_at`. Defaults to now.
    pub run_at: Option<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ListFilter {
    All,
    State(JobState),
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StatusSummary {
    pub pending: u64,
    pub processing: u64,
    pub completed: u64,
    pub dead: u64,
}

impl StatusSummary {
    pub fn total(&self) -> u64 {
        self.pending + self.processing + self.completed + self.dead
    }

    pub fn count(&self, state: JobState) -> u64 {
        match state {
            JobState::Pending => self.pending,
            JobState::Processing => self.processing,
            JobState::Completed => self.completed,
            JobState::Dead => self.dead,
        }
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct MetricsSnapshot {
    pub total: u64,
    pub completed: u64,
    pub dead: u64,
    /// Mean of `attempts` across non-pending jobs.
    pub avg_attempts: f64,
    /// Mean of `finished_at - started_at` across completed jobs, seconds.
    pub avg_duration_seconds: f64,
}
