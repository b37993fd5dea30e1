//! In-memory reference backend.
//!
//! The claim path is the part that matters: one async mutex over the whole
//! state makes pop-and-transition atomic, so concurrent claimers can never
//! receive overlapping job sets. Everything else is bookkeeping.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::Mutex;

use crate::domain::{JobRecord, JobStatus, StoreError, TaskMeta, TaskPatch};
use crate::ports::{JobCounts, JobStore};

struct StoredJob {
    record: JobRecord,
    /// Earliest instant a retryable failure may be claimed again.
    retry_at: Option<Instant>,
}

#[derive(Default)]
struct StoreState {
    tasks: HashMap<String, TaskMeta>,
    /// Task ids in creation order, for stable listing.
    task_order: Vec<String>,
    jobs: HashMap<String, StoredJob>,
    /// Pending job ids per task, in enqueue order.
    pending: HashMap<String, VecDeque<String>>,
}

#[derive(Default)]
pub struct InMemoryStore {
    state: Mutex<StoreState>,
    closed: AtomicBool,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn ensure_open(&self) -> Result<(), StoreError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(StoreError::Closed);
        }
        Ok(())
    }
}

#[async_trait]
impl JobStore for InMemoryStore {
    async fn initialize(&self) -> Result<(), StoreError> {
        self.closed.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn close(&self) -> Result<(), StoreError> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn create_task(&self, meta: TaskMeta) -> Result<(), StoreError> {
        self.ensure_open()?;
        let mut state = self.state.lock().await;
        if state.tasks.contains_key(&meta.id) {
            return Err(StoreError::Conflict(meta.id));
        }
        state.task_order.push(meta.id.clone());
        state.tasks.insert(meta.id.clone(), meta);
        Ok(())
    }

    async fn get_task(&self, id: &str) -> Result<Option<TaskMeta>, StoreError> {
        self.ensure_open()?;
        Ok(self.state.lock().await.tasks.get(id).cloned())
    }

    async fn update_task(&self, id: &str, patch: TaskPatch) -> Result<(), StoreError> {
        self.ensure_open()?;
        let mut state = self.state.lock().await;
        let meta = state
            .tasks
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        meta.apply(&patch);
        Ok(())
    }

    async fn delete_task(&self, id: &str) -> Result<(), StoreError> {
        self.ensure_open()?;
        let mut state = self.state.lock().await;
        state.tasks.remove(id);
        state.task_order.retain(|t| t != id);
        Ok(())
    }

    async fn list_tasks(&self) -> Result<Vec<TaskMeta>, StoreError> {
        self.ensure_open()?;
        let state = self.state.lock().await;
        Ok(state
            .task_order
            .iter()
            .filter_map(|id| state.tasks.get(id).cloned())
            .collect())
    }

    async fn create_jobs(&self, jobs: Vec<JobRecord>) -> Result<(), StoreError> {
        self.ensure_open()?;
        let mut state = self.state.lock().await;
        for job in jobs {
            if state.jobs.contains_key(&job.id) {
                // Content-derived id: same id means same input.
                continue;
            }
            state
                .pending
                .entry(job.task_id.clone())
                .or_default()
                .push_back(job.id.clone());
            state.jobs.insert(
                job.id.clone(),
                StoredJob {
                    record: job,
                    retry_at: None,
                },
            );
        }
        Ok(())
    }

    async fn get_job(&self, id: &str) -> Result<Option<JobRecord>, StoreError> {
        self.ensure_open()?;
        Ok(self
            .state
            .lock()
            .await
            .jobs
            .get(id)
            .map(|j| j.record.clone()))
    }

    async fn get_jobs_by_task(
        &self,
        task_id: &str,
        status: Option<JobStatus>,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<JobRecord>, StoreError> {
        self.ensure_open()?;
        let state = self.state.lock().await;
        let mut jobs: Vec<JobRecord> = state
            .jobs
            .values()
            .filter(|j| j.record.task_id == task_id)
            .filter(|j| status.is_none_or(|s| j.record.status == s))
            .map(|j| j.record.clone())
            .collect();
        jobs.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(jobs.into_iter().skip(offset).take(limit).collect())
    }

    async fn delete_jobs_by_task(&self, task_id: &str) -> Result<(), StoreError> {
        self.ensure_open()?;
        let mut state = self.state.lock().await;
        state.jobs.retain(|_, j| j.record.task_id != task_id);
        state.pending.remove(task_id);
        Ok(())
    }

    async fn claim_jobs(
        &self,
        task_id: &str,
        limit: usize,
    ) -> Result<Vec<JobRecord>, StoreError> {
        self.ensure_open()?;
        let mut state = self.state.lock().await;
        let mut queue = state.pending.remove(task_id).unwrap_or_default();

        let now = Instant::now();
        let mut claimed = Vec::new();
        let mut leftover = VecDeque::new();
        while let Some(id) = queue.pop_front() {
            if claimed.len() >= limit {
                leftover.push_back(id);
                continue;
            }
            let Some(stored) = state.jobs.get_mut(&id) else {
                continue; // stale queue entry
            };
            if stored.record.status != JobStatus::Pending {
                continue;
            }
            if let Some(retry_at) = stored.retry_at
                && retry_at > now
            {
                leftover.push_back(id);
                continue;
            }
            stored.retry_at = None;
            stored.record.claim();
            claimed.push(stored.record.clone());
        }
        if !leftover.is_empty() {
            state.pending.insert(task_id.to_string(), leftover);
        }
        Ok(claimed)
    }

    async fn complete_job(&self, id: &str, output: Value) -> Result<(), StoreError> {
        self.ensure_open()?;
        let mut state = self.state.lock().await;
        let stored = state
            .jobs
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        stored.record.complete(output);
        Ok(())
    }

    async fn fail_job(
        &self,
        id: &str,
        error: &str,
        can_retry: bool,
        retry_after: Option<Duration>,
    ) -> Result<(), StoreError> {
        self.ensure_open()?;
        let mut state = self.state.lock().await;
        let stored = state
            .jobs
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        stored.record.fail(error.to_string(), can_retry);
        if can_retry {
            stored.retry_at = retry_after.map(|d| Instant::now() + d);
            let task_id = stored.record.task_id.clone();
            state
                .pending
                .entry(task_id)
                .or_default()
                .push_back(id.to_string());
        } else {
            stored.retry_at = None;
        }
        Ok(())
    }

    async fn job_counts(&self, task_id: &str) -> Result<JobCounts, StoreError> {
        self.ensure_open()?;
        let state = self.state.lock().await;
        let mut counts = JobCounts::default();
        for job in state.jobs.values() {
            if job.record.task_id != task_id {
                continue;
            }
            match job.record.status {
                JobStatus::Pending => counts.pending += 1,
                JobStatus::Active => counts.active += 1,
                JobStatus::Completed => counts.completed += 1,
                JobStatus::Failed => counts.failed += 1,
            }
        }
        Ok(counts)
    }

    async fn reset_active_jobs(&self, task_id: &str) -> Result<(), StoreError> {
        self.ensure_open()?;
        let mut state = self.state.lock().await;
        let mut stuck: Vec<(chrono::DateTime<chrono::Utc>, String)> = state
            .jobs
            .values()
            .filter(|j| j.record.task_id == task_id && j.record.status == JobStatus::Active)
            .map(|j| (j.record.created_at, j.record.id.clone()))
            .collect();
        stuck.sort();
        for (_, id) in stuck {
            if let Some(stored) = state.jobs.get_mut(&id) {
                stored.record.status = JobStatus::Pending;
                stored.retry_at = None;
            }
            state
                .pending
                .entry(task_id.to_string())
                .or_default()
                .push_back(id);
        }
        Ok(())
    }

    async fn reset_failed_jobs(&self, task_id: &str) -> Result<u64, StoreError> {
        self.ensure_open()?;
        let mut state = self.state.lock().await;
        let mut failed: Vec<(chrono::DateTime<chrono::Utc>, String)> = state
            .jobs
            .values()
            .filter(|j| j.record.task_id == task_id && j.record.status == JobStatus::Failed)
            .map(|j| (j.record.created_at, j.record.id.clone()))
            .collect();
        failed.sort();
        let count = failed.len() as u64;
        for (_, id) in failed {
            if let Some(stored) = state.jobs.get_mut(&id) {
                stored.record.requeue();
                stored.retry_at = None;
            }
            state
                .pending
                .entry(task_id.to_string())
                .or_default()
                .push_back(id);
        }
        Ok(count)
    }
}
