//! Job record and status transitions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Job status.
///
/// State transitions:
/// - Pending -> Active -> Completed
/// - Pending -> Active -> Pending (retryable failure, claimed again later)
/// - Pending -> Active -> Failed (not retryable, or attempts exhausted)
/// - Active -> Pending (crash recovery / forced stop)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Waiting to be claimed.
    Pending,

    /// Claimed by a dispatcher and currently executing.
    Active,

    /// Finished successfully, output recorded.
    Completed,

    /// Failed permanently.
    Failed,
}

impl JobStatus {
    /// Is this a terminal state (no further transitions)?
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

/// One unit of work.
///
/// Design:
/// - The store is the single source of truth for job state.
/// - All state transitions happen via methods, not direct field writes.
/// - `id` is content-derived (`task_id:content_hash(input)`), so identical
///   inputs under different tasks never collide.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: String,
    pub task_id: String,
    pub input: Value,
    pub status: JobStatus,

    /// Number of execution attempts so far (incremented on claim).
    pub attempts: u32,

    /// Present iff the job completed.
    pub output: Option<Value>,

    /// Last error message (if any).
    pub error: Option<String>,

    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl JobRecord {
    pub fn new(id: String, task_id: String, input: Value) -> Self {
        Self {
            id,
            task_id,
            input,
            status: JobStatus::Pending,
            attempts: 0,
            output: None,
            error: None,
            created_at: Utc::now(),
            completed_at: None,
        }
    }

    /// Mark as active (increments attempts).
    pub fn claim(&mut self) {
        self.status = JobStatus::Active;
        self.attempts += 1;
    }

    /// Mark as completed with its output.
    pub fn complete(&mut self, output: Value) {
        self.status = JobStatus::Completed;
        self.output = Some(output);
        self.completed_at = Some(Utc::now());
    }

    /// Record a failure. Retryable failures go back to `Pending` so a
    /// future claim can pick them up; terminal failures park at `Failed`.
    pub fn fail(&mut self, error: String, can_retry: bool) {
        self.error = Some(error);
        if can_retry {
            self.status = JobStatus::Pending;
        } else {
            self.status = JobStatus::Failed;
            self.completed_at = Some(Utc::now());
        }
    }

    /// Force back to `Pending`, clearing any prior result. Used by crash
    /// recovery and by failed-job reset sweeps.
    pub fn requeue(&mut self) {
        self.status = JobStatus::Pending;
        self.output = None;
        self.error = None;
        self.completed_at = None;
    }
}
