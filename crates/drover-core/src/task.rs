//! Task: one named workload. Owns ingestion, the session lifecycle, and
//! the event bus its dispatcher publishes on.
//!
//! Session model: `start()` runs one dispatch session to completion.
//! Concurrent `start()` calls join the same session; the first caller to
//! observe the session's end finalizes it (reconcile counters, settle the
//! terminal status). `stop()` is a forced checkpoint: cancel everything,
//! reset claimed jobs to pending, park at `Paused`.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use serde_json::Value;
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::bus::{EventBus, Subscription};
use crate::dispatch::Dispatcher;
use crate::domain::{
    DispatchError, Event, EventKind, JobRecord, JobStatus, StoreError, TaskConfig, TaskKind,
    TaskMeta, TaskPatch, TaskProgress, TaskStatus,
};
use crate::hash;
use crate::ports::{InputFeed, JobStore, WorkData, WorkSource};

/// Filter for `Task::results`.
#[derive(Debug, Clone, Default)]
pub struct ResultsFilter {
    pub status: Option<JobStatus>,
    pub limit: Option<usize>,
    pub offset: usize,
}

pub struct Task {
    /// Self-handle for background sessions spawned by `resume()`.
    me: std::sync::Weak<Task>,

    store: Arc<dyn JobStore>,
    bus: Arc<EventBus>,
    config: TaskConfig,

    /// Cached copy of the durable metadata; the store stays authoritative
    /// and the cache is reconciled at session boundaries. Shared with the
    /// progress ticker.
    meta: Arc<Mutex<TaskMeta>>,

    source: Mutex<Option<Arc<dyn WorkSource>>>,

    /// Live dispatch session, if one is running. The async mutex doubles
    /// as the session gate: whoever creates the dispatcher does the
    /// session prep under this lock, so joiners cannot race past it.
    dispatcher: AsyncMutex<Option<Arc<Dispatcher>>>,

    ticker: Mutex<Option<JoinHandle<()>>>,
    started_at: Mutex<Option<Instant>>,
}

impl std::fmt::Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let meta = self.lock_meta();
        f.debug_struct("Task")
            .field("id", &meta.id)
            .field("status", &meta.status)
            .finish_non_exhaustive()
    }
}

impl Task {
    pub fn new(meta: TaskMeta, store: Arc<dyn JobStore>, config: TaskConfig) -> Arc<Self> {
        // The annotation pins `Self` for inference: the bus handlers below
        // call through the weak handle before the closure's return type is
        // known.
        Arc::new_cyclic(|me: &std::sync::Weak<Self>| {
            let bus = Arc::new(EventBus::new());

            // Keep the cached counters moving between reconciliations so
            // progress snapshots stay live. Best effort only; the store's
            // aggregate query wins at every session boundary.
            let weak = me.clone();
            bus.on(EventKind::JobComplete, move |_| {
                if let Some(task) = weak.upgrade() {
                    task.lock_meta().completed_jobs += 1;
                }
            });
            let weak = me.clone();
            bus.on(EventKind::JobFailed, move |_| {
                if let Some(task) = weak.upgrade() {
                    task.lock_meta().failed_jobs += 1;
                }
            });

            Self {
                me: me.clone(),
                store,
                bus,
                config,
                meta: Arc::new(Mutex::new(meta)),
                source: Mutex::new(None),
                dispatcher: AsyncMutex::new(None),
                ticker: Mutex::new(None),
                started_at: Mutex::new(None),
            }
        })
    }

    // --- accessors ---------------------------------------------------

    pub fn id(&self) -> String {
        self.lock_meta().id.clone()
    }

    pub fn meta(&self) -> TaskMeta {
        self.lock_meta().clone()
    }

    pub fn status(&self) -> TaskStatus {
        self.lock_meta().status
    }

    /// Subscribe to this task's lifecycle events.
    pub fn on(
        &self,
        kind: EventKind,
        handler: impl Fn(&Event) + Send + Sync + 'static,
    ) -> Subscription {
        self.bus.on(kind, handler)
    }

    pub fn off(&self, sub: Subscription) {
        self.bus.off(sub)
    }

    // --- ingestion ---------------------------------------------------

    /// Attach the work source and ingest its inputs as pending jobs.
    /// Only valid while the task is idle.
    pub async fn set_source(&self, source: Arc<dyn WorkSource>) -> Result<(), DispatchError> {
        {
            let meta = self.lock_meta();
            if meta.status != TaskStatus::Idle {
                return Err(DispatchError::InvalidState(format!(
                    "cannot attach a source to task {} in state {:?}",
                    meta.id, meta.status
                )));
            }
        }
        match source.data().await {
            WorkData::Finite(inputs) => {
                let leaves = leaf_digests(source.as_ref(), &inputs)?;
                self.ingest_finite(&source, inputs, leaves).await?;
            }
            WorkData::Lazy(feed) => self.ingest_lazy(&source, feed).await?,
        }
        *self.lock_source() = Some(source);
        Ok(())
    }

    /// Attach a source whose inputs and leaf digests were already read
    /// (the hub reads deterministic sources once to derive the task id).
    pub(crate) async fn set_source_prepared(
        &self,
        source: Arc<dyn WorkSource>,
        inputs: Vec<Value>,
        leaves: Vec<String>,
    ) -> Result<(), DispatchError> {
        self.ingest_finite(&source, inputs, leaves).await?;
        *self.lock_source() = Some(source);
        Ok(())
    }

    /// Attach a source without ingesting: the jobs already exist in the
    /// store (resume after restart).
    pub(crate) fn attach_source(&self, source: Arc<dyn WorkSource>) {
        *self.lock_source() = Some(source);
    }

    async fn ingest_finite(
        &self,
        source: &Arc<dyn WorkSource>,
        inputs: Vec<Value>,
        leaves: Vec<String>,
    ) -> Result<(), DispatchError> {
        let (task_id, kind) = {
            let meta = self.lock_meta();
            (meta.id.clone(), meta.kind)
        };

        let mut seen = HashSet::new();
        let mut batch = Vec::with_capacity(self.config.ingest_batch);
        for (input, leaf) in inputs.into_iter().zip(&leaves) {
            let job_id = format!("{task_id}:{leaf}");
            // Duplicate inputs collapse to one job; the Merkle leaves
            // keep every occurrence because pairing is positional.
            if !seen.insert(job_id.clone()) {
                continue;
            }
            batch.push(JobRecord::new(job_id, task_id.clone(), input));
            if batch.len() >= self.config.ingest_batch {
                self.store.create_jobs(std::mem::take(&mut batch)).await?;
            }
        }
        if !batch.is_empty() {
            self.store.create_jobs(batch).await?;
        }

        let mut patch = TaskPatch {
            total_jobs: Some(seen.len() as u64),
            ..Default::default()
        };
        if kind == TaskKind::Deterministic && source.kind() == TaskKind::Deterministic {
            patch.merkle_root = Some(hash::merkle_root(&leaves));
        }
        self.apply_patch(patch).await
    }

    async fn ingest_lazy(
        &self,
        source: &Arc<dyn WorkSource>,
        mut feed: Box<dyn InputFeed>,
    ) -> Result<(), DispatchError> {
        let task_id = self.id();
        let mut seen = HashSet::new();
        let mut batch = Vec::with_capacity(self.config.ingest_batch);
        while let Some(input) = feed.next().await {
            let leaf = match source.content_id(&input) {
                Some(id) => id,
                None => hash::content_hash(&input)?,
            };
            let job_id = format!("{task_id}:{leaf}");
            if !seen.insert(job_id.clone()) {
                continue;
            }
            batch.push(JobRecord::new(job_id, task_id.clone(), input));
            if batch.len() >= self.config.ingest_batch {
                self.store.create_jobs(std::mem::take(&mut batch)).await?;
            }
        }
        if !batch.is_empty() {
            self.store.create_jobs(batch).await?;
        }
        self.apply_patch(TaskPatch {
            total_jobs: Some(seen.len() as u64),
            ..Default::default()
        })
        .await
    }

    // --- lifecycle ---------------------------------------------------

    /// Run a dispatch session until the work is exhausted or the task is
    /// stopped. A concurrent call while a session runs joins it instead
    /// of starting a second one.
    pub async fn start(&self) -> Result<(), DispatchError> {
        let meta = self.meta();
        if meta.status == TaskStatus::Completed {
            return Err(DispatchError::InvalidState(format!(
                "task {} already completed",
                meta.id
            )));
        }

        let dispatcher = {
            let mut slot = self.dispatcher.lock().await;
            match slot.as_ref() {
                Some(d) => Arc::clone(d),
                None => {
                    let source = self
                        .lock_source()
                        .clone()
                        .ok_or(DispatchError::NoSource)?;
                    // Session prep happens under the slot lock so a
                    // joiner cannot begin claiming before recovery ran.
                    match self.store.reset_active_jobs(&meta.id).await {
                        Ok(()) | Err(StoreError::Closed) => {}
                        Err(e) => return Err(e.into()),
                    }
                    self.set_status(TaskStatus::Running).await;
                    let d = Dispatcher::new(
                        meta.id.clone(),
                        Arc::clone(&self.store),
                        source,
                        Arc::clone(&self.bus),
                        self.config.clone(),
                    );
                    *slot = Some(Arc::clone(&d));
                    *self.lock_started_at() = Some(Instant::now());
                    self.spawn_ticker(&d);
                    d
                }
            }
        };

        let result = dispatcher.start().await;
        self.finish_session(&dispatcher, result).await
    }

    /// Hold new claims; active jobs run to completion.
    pub async fn pause(&self) {
        if let Some(d) = self.dispatcher.lock().await.as_ref() {
            d.pause();
        }
        if self.status() == TaskStatus::Running {
            self.set_status(TaskStatus::Paused).await;
        }
    }

    /// Resume claiming. With a live session this un-pauses it; otherwise
    /// a fresh session is spawned in the background.
    pub async fn resume(&self) -> Result<(), DispatchError> {
        if let Some(d) = self.dispatcher.lock().await.as_ref() {
            self.set_status(TaskStatus::Running).await;
            d.resume();
            return Ok(());
        }
        if self.status() == TaskStatus::Completed {
            return Err(DispatchError::InvalidState(format!(
                "task {} already completed",
                self.id()
            )));
        }
        if self.lock_source().is_none() {
            return Err(DispatchError::NoSource);
        }
        if let Some(task) = self.me.upgrade() {
            tokio::spawn(async move {
                if let Err(e) = task.start().await {
                    tracing::warn!(task_id = %task.id(), error = %e, "resumed session failed");
                }
            });
        }
        Ok(())
    }

    /// Forced checkpoint: cancel active work, return claimed jobs to
    /// pending, reconcile counters, park at `Paused`.
    pub async fn stop(&self) -> Result<(), DispatchError> {
        let dispatcher = self.dispatcher.lock().await.clone();
        if let Some(d) = dispatcher {
            d.stop().await;
        }
        match self.store.reset_active_jobs(&self.id()).await {
            Ok(()) | Err(StoreError::Closed) => {}
            Err(e) => return Err(e.into()),
        }
        self.reconcile().await;
        if matches!(self.status(), TaskStatus::Running | TaskStatus::Idle) {
            self.set_status(TaskStatus::Paused).await;
        }
        Ok(())
    }

    /// Remove the task and all of its jobs. The bus is cleared so no
    /// handler outlives the task.
    pub async fn destroy(&self) -> Result<(), DispatchError> {
        self.stop().await?;
        let id = self.id();
        self.store.delete_jobs_by_task(&id).await?;
        self.store.delete_task(&id).await?;
        self.bus.remove_all(None);
        Ok(())
    }

    // --- reads -------------------------------------------------------

    /// Live progress snapshot, counts straight from the store.
    pub async fn progress(&self) -> Result<TaskProgress, DispatchError> {
        let counts = self.store.job_counts(&self.id()).await?;
        let (active, concurrency) = match self.dispatcher.lock().await.as_ref() {
            Some(d) => (d.active_count() as u64, d.current_concurrency()),
            None => (counts.active, self.config.aimd.initial),
        };
        let total = {
            let meta = self.lock_meta();
            if meta.total_jobs > 0 {
                meta.total_jobs
            } else {
                counts.total()
            }
        };
        let elapsed = (*self.lock_started_at())
            .map(|t| t.elapsed())
            .unwrap_or_default();
        let done = counts.completed + counts.failed;
        Ok(TaskProgress {
            total,
            completed: counts.completed,
            failed: counts.failed,
            pending: counts.pending,
            active,
            concurrency,
            elapsed,
            eta: TaskProgress::estimate_eta(
                elapsed,
                counts.completed,
                total.saturating_sub(done),
            ),
        })
    }

    /// Fetch job records, optionally filtered by status, with paging.
    pub async fn results(&self, filter: ResultsFilter) -> Result<Vec<JobRecord>, DispatchError> {
        Ok(self
            .store
            .get_jobs_by_task(
                &self.id(),
                filter.status,
                filter.limit.unwrap_or(usize::MAX),
                filter.offset,
            )
            .await?)
    }

    // --- session internals -------------------------------------------

    async fn finish_session(
        &self,
        dispatcher: &Arc<Dispatcher>,
        result: Result<(), DispatchError>,
    ) -> Result<(), DispatchError> {
        let mut slot = self.dispatcher.lock().await;
        let ours = slot
            .as_ref()
            .is_some_and(|current| Arc::ptr_eq(current, dispatcher));
        if !ours {
            // Another joiner already finalized this session.
            return result;
        }
        *slot = None;
        drop(slot);

        if let Some(ticker) = self.lock_ticker().take() {
            ticker.abort();
        }

        if dispatcher.is_stopped() {
            // stop() owns the checkpoint; leave status to it.
            return result;
        }
        self.reconcile().await;
        if result.is_ok() {
            // Work exhausted: completed if anything succeeded (or there
            // was nothing to do), failed only when every job failed.
            let meta = self.meta();
            let status = if meta.completed_jobs > 0 || meta.failed_jobs == 0 {
                TaskStatus::Completed
            } else {
                TaskStatus::Failed
            };
            self.set_status(status).await;
        }
        result
    }

    fn spawn_ticker(&self, dispatcher: &Arc<Dispatcher>) {
        let bus = Arc::clone(&self.bus);
        let dispatcher = Arc::downgrade(dispatcher);
        let meta = Arc::clone(&self.meta);
        let started_at = self.started_elapsed_anchor();

        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(std::time::Duration::from_secs(1));
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            // The first tick fires immediately; skip it so the first
            // snapshot reflects real work.
            interval.tick().await;
            loop {
                interval.tick().await;
                let Some(dispatcher) = dispatcher.upgrade() else {
                    return;
                };
                let snapshot = {
                    let meta = meta.lock().unwrap_or_else(PoisonError::into_inner);
                    let active = dispatcher.active_count() as u64;
                    let done = meta.completed_jobs + meta.failed_jobs;
                    let elapsed = started_at.elapsed();
                    let outstanding = meta.total_jobs.saturating_sub(done);
                    TaskProgress {
                        total: meta.total_jobs,
                        completed: meta.completed_jobs,
                        failed: meta.failed_jobs,
                        pending: meta.total_jobs.saturating_sub(done + active),
                        active,
                        concurrency: dispatcher.current_concurrency(),
                        elapsed,
                        eta: TaskProgress::estimate_eta(
                            elapsed,
                            meta.completed_jobs,
                            outstanding,
                        ),
                    }
                };
                bus.emit(&Event::Progress(snapshot));
            }
        });
        *self.lock_ticker() = Some(handle);
    }

    /// Pull the authoritative counters from the store into the cache.
    async fn reconcile(&self) {
        match self.store.job_counts(&self.id()).await {
            Ok(counts) => {
                self.apply_patch_best_effort(TaskPatch {
                    completed_jobs: Some(counts.completed),
                    failed_jobs: Some(counts.failed),
                    ..Default::default()
                })
                .await;
            }
            Err(e) if e.is_closed() => {
                // Cached counters stand until the store comes back.
            }
            Err(e) => {
                tracing::warn!(task_id = %self.id(), error = %e, "counter reconciliation failed");
            }
        }
    }

    async fn set_status(&self, status: TaskStatus) {
        self.apply_patch_best_effort(TaskPatch {
            status: Some(status),
            ..Default::default()
        })
        .await;
        self.bus.emit(&Event::StatusChange { status });
    }

    /// Write-through update: store first, then the cache. Store errors
    /// fail the call.
    async fn apply_patch(&self, patch: TaskPatch) -> Result<(), DispatchError> {
        self.store.update_task(&self.id(), patch.clone()).await?;
        self.lock_meta().apply(&patch);
        Ok(())
    }

    /// Like `apply_patch` but never fails: a closed store is expected
    /// during shutdown, anything else is logged.
    async fn apply_patch_best_effort(&self, patch: TaskPatch) {
        match self.store.update_task(&self.id(), patch.clone()).await {
            Ok(()) => {}
            Err(e) if e.is_closed() => {}
            Err(e) => {
                tracing::warn!(task_id = %self.id(), error = %e, "metadata update failed");
            }
        }
        self.lock_meta().apply(&patch);
    }

    fn lock_meta(&self) -> MutexGuard<'_, TaskMeta> {
        self.meta.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_source(&self) -> MutexGuard<'_, Option<Arc<dyn WorkSource>>> {
        self.source.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_ticker(&self) -> MutexGuard<'_, Option<JoinHandle<()>>> {
        self.ticker.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_started_at(&self) -> MutexGuard<'_, Option<Instant>> {
        self.started_at
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn started_elapsed_anchor(&self) -> Instant {
        (*self.lock_started_at()).unwrap_or_else(Instant::now)
    }
}

/// Leaf digest per input: the source's custom content id when provided,
/// otherwise the canonical content hash.
pub(crate) fn leaf_digests(
    source: &dyn WorkSource,
    inputs: &[Value],
) -> Result<Vec<String>, DispatchError> {
    inputs
        .iter()
        .map(|input| match source.content_id(input) {
            Some(id) => Ok(id),
            None => hash::content_hash(input),
        })
        .collect()
}
