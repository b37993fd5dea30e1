//! JobStore port: task/job CRUD, atomic claiming, count aggregation.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::domain::{JobRecord, JobStatus, StoreError, TaskMeta, TaskPatch};

/// Aggregate job counts for one task. The authoritative source for the
/// denormalized counters cached on `TaskMeta`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobCounts {
    pub pending: u64,
    pub active: u64,
    pub completed: u64,
    pub failed: u64,
}

impl JobCounts {
    pub fn total(&self) -> u64 {
        self.pending + self.active + self.completed + self.failed
    }
}

/// Persistence backend contract.
///
/// Any method may return `StoreError::Closed` once the backend has shut
/// down; the dispatcher and task treat that as a clean-stop signal. All
/// other errors propagate.
#[async_trait]
pub trait JobStore: Send + Sync {
    async fn initialize(&self) -> Result<(), StoreError>;
    async fn close(&self) -> Result<(), StoreError>;

    async fn create_task(&self, meta: TaskMeta) -> Result<(), StoreError>;
    async fn get_task(&self, id: &str) -> Result<Option<TaskMeta>, StoreError>;
    async fn update_task(&self, id: &str, patch: TaskPatch) -> Result<(), StoreError>;
    async fn delete_task(&self, id: &str) -> Result<(), StoreError>;
    async fn list_tasks(&self) -> Result<Vec<TaskMeta>, StoreError>;

    /// Bulk insert. Jobs whose id already exists are skipped (the id is
    /// content-derived, so a duplicate means the same input).
    async fn create_jobs(&self, jobs: Vec<JobRecord>) -> Result<(), StoreError>;
    async fn get_job(&self, id: &str) -> Result<Option<JobRecord>, StoreError>;
    async fn get_jobs_by_task(
        &self,
        task_id: &str,
        status: Option<JobStatus>,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<JobRecord>, StoreError>;
    async fn delete_jobs_by_task(&self, task_id: &str) -> Result<(), StoreError>;

    /// Atomically transition up to `limit` pending jobs of the task to
    /// active (incrementing their attempt counters) and return them.
    /// Concurrent callers must never receive overlapping job sets.
    async fn claim_jobs(&self, task_id: &str, limit: usize)
    -> Result<Vec<JobRecord>, StoreError>;

    async fn complete_job(&self, id: &str, output: Value) -> Result<(), StoreError>;

    /// Record a failure. With `can_retry` the job returns to pending,
    /// eligible for a future claim only after `retry_after` (if given);
    /// without it the job parks at failed.
    async fn fail_job(
        &self,
        id: &str,
        error: &str,
        can_retry: bool,
        retry_after: Option<Duration>,
    ) -> Result<(), StoreError>;

    async fn job_counts(&self, task_id: &str) -> Result<JobCounts, StoreError>;

    /// Crash recovery: bulk `active -> pending`.
    async fn reset_active_jobs(&self, task_id: &str) -> Result<(), StoreError>;

    /// Manual retry sweep: bulk `failed -> pending`, returning the count.
    async fn reset_failed_jobs(&self, task_id: &str) -> Result<u64, StoreError>;
}
