//! Hub: task factory and registry over one shared store.
//!
//! The hub owns identity: deterministic tasks get content-derived ids
//! (same name + same input set = same task, so re-submission is a
//! conflict, not a duplicate), dynamic tasks get timestamped ids. It also
//! owns recovery: `resume_task` rebuilds a `Task` from its durable rows
//! after a restart.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::Utc;

use crate::domain::{DispatchError, StoreError, TaskConfig, TaskKind, TaskMeta, TaskPatch,
    TaskStatus};
use crate::hash;
use crate::ports::{JobStore, WorkData, WorkSource};
use crate::task::{Task, leaf_digests};

/// Parameters for `Hub::create_task`.
pub struct CreateTask {
    pub name: String,

    /// Optional at creation: a task may be created idle and given its
    /// source later via `Task::set_source`.
    pub source: Option<Arc<dyn WorkSource>>,

    pub config: TaskConfig,
}

impl CreateTask {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            source: None,
            config: TaskConfig::default(),
        }
    }

    pub fn source(mut self, source: Arc<dyn WorkSource>) -> Self {
        self.source = Some(source);
        self
    }

    pub fn config(mut self, config: TaskConfig) -> Self {
        self.config = config;
        self
    }
}

pub struct Hub {
    store: Arc<dyn JobStore>,

    /// Fallback config for tasks rebuilt from the store.
    config: TaskConfig,

    tasks: Mutex<HashMap<String, Arc<Task>>>,
}

impl Hub {
    pub fn new(store: Arc<dyn JobStore>) -> Self {
        Self::with_config(store, TaskConfig::default())
    }

    pub fn with_config(store: Arc<dyn JobStore>, config: TaskConfig) -> Self {
        Self {
            store,
            config,
            tasks: Mutex::new(HashMap::new()),
        }
    }

    /// Create a task, derive its id, and ingest its inputs. Creation is
    /// atomic: if ingestion fails, the partially-written rows are removed
    /// and the error is re-raised.
    pub async fn create_task(&self, params: CreateTask) -> Result<Arc<Task>, DispatchError> {
        let CreateTask {
            name,
            source,
            config,
        } = params;

        // Deterministic sources are read once, up front: the same inputs
        // feed the id derivation and the ingestion.
        let prepared = match &source {
            Some(source) if source.kind() == TaskKind::Deterministic => {
                match source.data().await {
                    WorkData::Finite(inputs) => {
                        let leaves = leaf_digests(source.as_ref(), &inputs)?;
                        Some((inputs, leaves))
                    }
                    WorkData::Lazy(_) => {
                        return Err(DispatchError::InvalidState(format!(
                            "deterministic source for task {name} must provide finite data"
                        )));
                    }
                }
            }
            _ => None,
        };

        let (id, kind, root) = match &prepared {
            Some((_, leaves)) => {
                let root = hash::merkle_root(leaves);
                let id = hash::deterministic_task_id(&name, &root);
                (id, TaskKind::Deterministic, Some(root))
            }
            None => {
                let now = Utc::now();
                (
                    hash::dynamic_task_id(&name, now),
                    TaskKind::Dynamic,
                    None,
                )
            }
        };

        if self.lock_tasks().contains_key(&id) {
            return Err(DispatchError::TaskExists(id));
        }
        let meta = TaskMeta::new(id.clone(), name, kind, root, Utc::now());
        match self.store.create_task(meta.clone()).await {
            Ok(()) => {}
            Err(StoreError::Conflict(_)) => return Err(DispatchError::TaskExists(id)),
            Err(e) => return Err(e.into()),
        }

        let task = Task::new(meta, Arc::clone(&self.store), config);
        let ingested = match (source, prepared) {
            (Some(source), Some((inputs, leaves))) => {
                task.set_source_prepared(source, inputs, leaves).await
            }
            (Some(source), None) => task.set_source(source).await,
            (None, _) => Ok(()),
        };
        if let Err(e) = ingested {
            // Roll the half-created task back before surfacing the error.
            let _ = self.store.delete_jobs_by_task(&id).await;
            let _ = self.store.delete_task(&id).await;
            return Err(e);
        }

        self.lock_tasks().insert(id, Arc::clone(&task));
        Ok(task)
    }

    /// Look a task up, rebuilding it from the store if it is not live in
    /// this hub. A rebuilt task has no source attached.
    pub async fn get_task(&self, id: &str) -> Result<Option<Arc<Task>>, DispatchError> {
        if let Some(task) = self.lock_tasks().get(id) {
            return Ok(Some(Arc::clone(task)));
        }
        let Some(meta) = self.store.get_task(id).await? else {
            return Ok(None);
        };
        let task = Task::new(meta, Arc::clone(&self.store), self.config.clone());
        self.lock_tasks().insert(id.to_string(), Arc::clone(&task));
        Ok(Some(task))
    }

    pub async fn list_tasks(&self) -> Result<Vec<TaskMeta>, DispatchError> {
        Ok(self.store.list_tasks().await?)
    }

    /// Deterministic-task lookup by workload fingerprint.
    pub async fn find_task_by_merkle_root(
        &self,
        root: &str,
    ) -> Result<Option<TaskMeta>, DispatchError> {
        Ok(self
            .store
            .list_tasks()
            .await?
            .into_iter()
            .find(|meta| meta.merkle_root.as_deref() == Some(root)))
    }

    /// Remove a task and its jobs. A live task is stopped first.
    pub async fn delete_task(&self, id: &str) -> Result<(), DispatchError> {
        let live = self.lock_tasks().remove(id);
        if let Some(task) = live {
            task.destroy().await?;
        } else {
            self.store.delete_jobs_by_task(id).await?;
            self.store.delete_task(id).await?;
        }
        Ok(())
    }

    /// Rebuild a task from the store after a restart: stuck active jobs
    /// return to pending and a crashed `Running` status is downgraded to
    /// `Paused` so the caller decides when to start.
    pub async fn resume_task(
        &self,
        id: &str,
        source: Arc<dyn WorkSource>,
        config: Option<TaskConfig>,
    ) -> Result<Arc<Task>, DispatchError> {
        let mut meta = self
            .store
            .get_task(id)
            .await?
            .ok_or_else(|| DispatchError::TaskNotFound(id.to_string()))?;

        self.store.reset_active_jobs(id).await?;
        if meta.status == TaskStatus::Running {
            let patch = TaskPatch {
                status: Some(TaskStatus::Paused),
                ..Default::default()
            };
            self.store.update_task(id, patch.clone()).await?;
            meta.apply(&patch);
        }

        let task = Task::new(
            meta,
            Arc::clone(&self.store),
            config.unwrap_or_else(|| self.config.clone()),
        );
        task.attach_source(source);
        self.lock_tasks().insert(id.to_string(), Arc::clone(&task));
        Ok(task)
    }

    /// Manual retry sweep: every failed job of the task goes back to
    /// pending. Returns how many were reset.
    pub async fn reset_failed_jobs(&self, id: &str) -> Result<u64, DispatchError> {
        Ok(self.store.reset_failed_jobs(id).await?)
    }

    /// Stop every live task and close the store.
    pub async fn shutdown(&self) -> Result<(), DispatchError> {
        let live: Vec<Arc<Task>> = self.lock_tasks().drain().map(|(_, t)| t).collect();
        for task in live {
            task.stop().await?;
        }
        self.store.close().await?;
        Ok(())
    }

    fn lock_tasks(&self) -> MutexGuard<'_, HashMap<String, Arc<Task>>> {
        self.tasks.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
