//! Task metadata: one named workload and its lifecycle.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// How a task's identifier is derived.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    /// Full input set known at creation time; id derived from the Merkle
    /// root over the input hashes, so re-submitting the same workload
    /// collapses to the same task.
    Deterministic,

    /// Inputs arrive as an open-ended lazy sequence; id derived from the
    /// creation timestamp and intentionally non-deterministic.
    Dynamic,
}

/// Task status.
///
/// State transitions:
/// - Idle -> Running -> Completed | Failed
/// - Running -> Paused -> Running
/// - Failed can be revived externally by resetting failed jobs and resuming.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Idle,
    Running,
    Paused,
    Completed,
    Failed,
}

/// Metadata for one named workload.
///
/// The store is the durable source of record; the in-memory copy held by a
/// `Task` is a cache kept consistent by write-through `TaskPatch` updates.
/// The job counters in particular are best-effort and are reconciled from
/// the store's aggregate query at every state-transition boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskMeta {
    pub id: String,
    pub name: String,
    pub kind: TaskKind,

    /// Only set for deterministic tasks.
    pub merkle_root: Option<String>,

    pub status: TaskStatus,

    /// Fixed once ingestion finishes; never mutated after.
    pub total_jobs: u64,
    pub completed_jobs: u64,
    pub failed_jobs: u64,

    pub created_at: DateTime<Utc>,
}

impl TaskMeta {
    pub fn new(
        id: String,
        name: String,
        kind: TaskKind,
        merkle_root: Option<String>,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            name,
            kind,
            merkle_root,
            status: TaskStatus::Idle,
            total_jobs: 0,
            completed_jobs: 0,
            failed_jobs: 0,
            created_at,
        }
    }

    /// Apply a partial update (the write-through unit shared with the store).
    pub fn apply(&mut self, patch: &TaskPatch) {
        if let Some(status) = patch.status {
            self.status = status;
        }
        if let Some(root) = &patch.merkle_root {
            self.merkle_root = Some(root.clone());
        }
        if let Some(total) = patch.total_jobs {
            self.total_jobs = total;
        }
        if let Some(completed) = patch.completed_jobs {
            self.completed_jobs = completed;
        }
        if let Some(failed) = patch.failed_jobs {
            self.failed_jobs = failed;
        }
    }
}

/// Partial update to a `TaskMeta`. Unset fields are left untouched.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TaskPatch {
    pub status: Option<TaskStatus>,
    pub merkle_root: Option<String>,
    pub total_jobs: Option<u64>,
    pub completed_jobs: Option<u64>,
    pub failed_jobs: Option<u64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta() -> TaskMeta {
        TaskMeta::new(
            "t1".into(),
            "demo".into(),
            TaskKind::Deterministic,
            None,
            Utc::now(),
        )
    }

    #[test]
    fn new_task_is_idle() {
        let meta = meta();
        assert_eq!(meta.status, TaskStatus::Idle);
        assert_eq!(meta.total_jobs, 0);
        assert!(meta.merkle_root.is_none());
    }

    #[test]
    fn patch_applies_only_set_fields() {
        let mut meta = meta();
        meta.apply(&TaskPatch {
            status: Some(TaskStatus::Running),
            total_jobs: Some(10),
            ..Default::default()
        });
        assert_eq!(meta.status, TaskStatus::Running);
        assert_eq!(meta.total_jobs, 10);
        assert_eq!(meta.completed_jobs, 0);

        meta.apply(&TaskPatch {
            completed_jobs: Some(4),
            failed_jobs: Some(1),
            ..Default::default()
        });
        assert_eq!(meta.status, TaskStatus::Running);
        assert_eq!(meta.completed_jobs, 4);
        assert_eq!(meta.failed_jobs, 1);
    }

    #[test]
    fn patch_can_set_merkle_root() {
        let mut meta = meta();
        meta.apply(&TaskPatch {
            merkle_root: Some("abc".into()),
            ..Default::default()
        });
        assert_eq!(meta.merkle_root.as_deref(), Some("abc"));
    }
}
