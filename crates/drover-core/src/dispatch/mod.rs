//! Dispatcher: claims pending jobs from the store and executes them under
//! an AIMD-tuned concurrency limit.
//!
//! Design intent:
//! - One logical claim loop per dispatcher; job executions interleave at
//!   await points, bounded by the live limit (back-pressure, never literal
//!   CPU parallelism).
//! - The store is the single source of truth for job ownership. The
//!   dispatcher's in-memory bookkeeping (limit, active set) is safe to
//!   lose on crash; durable state is re-derivable from the store.
//! - Handler and timeout errors are fully absorbed into job state and
//!   events, never re-thrown. Only non-`Closed` store errors escape
//!   `start()`.

mod aimd;
mod cancel;

pub use aimd::AimdController;
pub use cancel::CancelToken;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{Notify, watch};

use crate::bus::EventBus;
use crate::domain::{DispatchError, Event, HandlerError, JobRecord, TaskConfig};
use crate::ports::{JobContext, JobStore, WorkSource};

/// How long the loop naps when there is nothing to do (paused, no free
/// slots, or claims came back empty while jobs are still in flight).
/// Completions cut the nap short via the wake notifier.
const IDLE_WAIT: Duration = Duration::from_millis(20);

type RunResult = Option<Result<(), DispatchError>>;

pub struct Dispatcher {
    /// Self-handle for spawning the claim loop and job tasks.
    me: Weak<Dispatcher>,

    task_id: String,
    store: Arc<dyn JobStore>,
    source: Arc<dyn WorkSource>,
    bus: Arc<EventBus>,
    config: TaskConfig,

    aimd: Mutex<AimdController>,

    /// Cancellation tokens of jobs currently in flight, keyed by job id.
    active: Mutex<HashMap<String, CancelToken>>,

    paused: AtomicBool,
    stopped: AtomicBool,

    /// Woken when a slot frees up, the limit grows, or pause/stop state
    /// changes.
    wake: Notify,

    /// Present while a claim loop is running; concurrent `start()` calls
    /// await the same completion through it.
    run_rx: Mutex<Option<watch::Receiver<RunResult>>>,
}

impl Dispatcher {
    pub fn new(
        task_id: String,
        store: Arc<dyn JobStore>,
        source: Arc<dyn WorkSource>,
        bus: Arc<EventBus>,
        config: TaskConfig,
    ) -> Arc<Self> {
        let aimd = AimdController::new(config.aimd.clone());
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            task_id,
            store,
            source,
            bus,
            config,
            aimd: Mutex::new(aimd),
            active: Mutex::new(HashMap::new()),
            paused: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            wake: Notify::new(),
            run_rx: Mutex::new(None),
        })
    }

    // --- observers ---------------------------------------------------

    pub fn current_concurrency(&self) -> usize {
        self.lock_aimd().limit()
    }

    pub fn active_count(&self) -> usize {
        self.lock_active().len()
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    // --- control -----------------------------------------------------

    /// Run until no pending jobs remain and none are active, or until
    /// `stop()`. Idempotent: a second call while running awaits the same
    /// completion instead of starting a second loop.
    pub async fn start(&self) -> Result<(), DispatchError> {
        let mut rx = self.ensure_loop();
        loop {
            if let Some(result) = rx.borrow_and_update().clone() {
                return result;
            }
            if rx.changed().await.is_err() {
                return Ok(());
            }
        }
    }

    /// Stop claiming new jobs; jobs already active run to completion.
    pub fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
    }

    /// Clear the paused flag and restart the claim loop if it is not
    /// already running.
    pub fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
        self.wake.notify_waiters();
        self.ensure_loop();
    }

    /// Terminal: cancel every active job and wait until all of them have
    /// unwound. Callers never observe work in flight afterwards.
    pub async fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        for token in self.lock_active().values() {
            token.cancel();
        }
        self.wake.notify_waiters();

        let rx = self.lock_run_rx().clone();
        if let Some(mut rx) = rx {
            loop {
                if rx.borrow_and_update().is_some() {
                    break;
                }
                if rx.changed().await.is_err() {
                    break;
                }
            }
        }
        self.wait_idle().await;
    }

    // --- claim loop --------------------------------------------------

    fn ensure_loop(&self) -> watch::Receiver<RunResult> {
        let mut guard = self.lock_run_rx();
        if let Some(rx) = guard.as_ref() {
            return rx.clone();
        }
        let (tx, rx) = watch::channel(None);
        *guard = Some(rx.clone());
        drop(guard);

        let Some(this) = self.me.upgrade() else {
            return rx;
        };
        tokio::spawn(async move {
            let result = this.run_loop().await;
            // Never resolve with work still in flight.
            this.wait_idle().await;
            *this.lock_run_rx() = None;
            let _ = tx.send(Some(result));
        });
        rx
    }

    async fn run_loop(&self) -> Result<(), DispatchError> {
        loop {
            if self.is_stopped() {
                return Ok(());
            }
            if self.is_paused() {
                self.idle_wait().await;
                continue;
            }

            let slots = self
                .current_concurrency()
                .saturating_sub(self.active_count());
            if slots == 0 {
                self.idle_wait().await;
                continue;
            }

            let claimed = match self.store.claim_jobs(&self.task_id, slots).await {
                Ok(jobs) => jobs,
                Err(e) if e.is_closed() => {
                    // Unrecoverable but expected during shutdown: leave
                    // job state as last durably written, ready for crash
                    // recovery.
                    tracing::debug!(task_id = %self.task_id, "store closed, stopping dispatcher");
                    self.stopped.store(true, Ordering::SeqCst);
                    return Ok(());
                }
                Err(e) => return Err(e.into()),
            };

            if claimed.is_empty() {
                if self.active_count() == 0 {
                    // Work exhausted.
                    return Ok(());
                }
                self.idle_wait().await;
                continue;
            }

            for job in claimed {
                self.spawn_job(job);
            }
        }
    }

    fn spawn_job(&self, job: JobRecord) {
        let Some(this) = self.me.upgrade() else {
            return;
        };
        let token = CancelToken::new();
        self.lock_active().insert(job.id.clone(), token.clone());

        tokio::spawn(async move {
            // Slot release is tied to a drop guard so the active count
            // stays accurate even if the handler panics.
            let _slot = SlotGuard {
                dispatcher: Arc::clone(&this),
                job_id: job.id.clone(),
                token: token.clone(),
            };
            this.execute(job, token).await;
        });
    }

    async fn execute(&self, job: JobRecord, token: CancelToken) {
        self.bus.emit(&Event::JobStart {
            job_id: job.id.clone(),
            attempt: job.attempts,
        });

        let ctx = JobContext {
            job_id: job.id.clone(),
            attempt: job.attempts,
            token: token.clone(),
        };

        // Race the handler against the timeout. The token is a separate
        // mechanism: a handler that never checks it is still bounded here.
        match tokio::time::timeout(self.config.timeout, self.source.run(&job.input, &ctx)).await {
            Ok(Ok(output)) => self.on_job_success(&job, output).await,
            Ok(Err(error)) => self.on_job_failure(&job, error, &token, false).await,
            Err(_) => {
                let error = HandlerError::new(format!(
                    "job {} timed out after {}ms",
                    job.id,
                    self.config.timeout.as_millis()
                ));
                self.on_job_failure(&job, error, &token, true).await
            }
        }
    }

    async fn on_job_success(&self, job: &JobRecord, output: Value) {
        match self.store.complete_job(&job.id, output.clone()).await {
            Ok(()) => {}
            Err(e) if e.is_closed() => {
                // Recovery reconciles on restart.
                tracing::debug!(job_id = %job.id, "store closed while recording completion");
            }
            Err(e) => {
                tracing::warn!(job_id = %job.id, error = %e, "failed to record completion");
            }
        }
        self.bus.emit(&Event::JobComplete {
            job_id: job.id.clone(),
            output,
        });
        if let Some(concurrency) = self.lock_aimd().on_success() {
            self.bus.emit(&Event::ConcurrencyChange { concurrency });
            // The limit grew; the loop may have free slots now.
            self.wake.notify_waiters();
        }
    }

    async fn on_job_failure(
        &self,
        job: &JobRecord,
        error: HandlerError,
        token: &CancelToken,
        timed_out: bool,
    ) {
        let rate_limited = self.source.is_rate_limited(&error);
        if rate_limited {
            if let Some(concurrency) = self.lock_aimd().on_rate_limit() {
                self.bus.emit(&Event::RateLimited { concurrency });
                self.bus.emit(&Event::ConcurrencyChange { concurrency });
            }
        }

        if self.is_stopped() {
            // Forcibly cancelled work is not trusted; the job stays
            // active in the store until the owning task resets it.
            return;
        }

        // Timeouts are retryable unconditionally; everything else is the
        // source's call, including errors it classified as rate limits.
        let retryable = timed_out || self.source.is_retryable(&error);
        if retryable && job.attempts < self.config.retry.max_attempts {
            let delay = self.config.retry.backoff(job.attempts);
            match self
                .store
                .fail_job(&job.id, &error.to_string(), true, Some(delay))
                .await
            {
                Ok(()) => {}
                Err(e) if e.is_closed() => {
                    tracing::debug!(job_id = %job.id, "store closed while recording retry");
                    return;
                }
                Err(e) => {
                    tracing::warn!(job_id = %job.id, error = %e, "failed to record retry");
                    return;
                }
            }
            self.bus.emit(&Event::JobRetry {
                job_id: job.id.clone(),
                attempt: job.attempts,
                error: error.to_string(),
                delay,
            });
            // Hold the slot through the backoff; stop() cuts it short.
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = token.cancelled() => {}
            }
        } else {
            match self
                .store
                .fail_job(&job.id, &error.to_string(), false, None)
                .await
            {
                Ok(()) => {}
                Err(e) if e.is_closed() => {
                    tracing::debug!(job_id = %job.id, "store closed while recording failure");
                }
                Err(e) => {
                    tracing::warn!(job_id = %job.id, error = %e, "failed to record failure");
                }
            }
            self.bus.emit(&Event::JobFailed {
                job_id: job.id.clone(),
                error: error.to_string(),
            });
        }
    }

    // --- internals ---------------------------------------------------

    async fn idle_wait(&self) {
        tokio::select! {
            _ = tokio::time::sleep(IDLE_WAIT) => {}
            _ = self.wake.notified() => {}
        }
    }

    async fn wait_idle(&self) {
        loop {
            if self.active_count() == 0 {
                return;
            }
            let notified = self.wake.notified();
            if self.active_count() == 0 {
                return;
            }
            notified.await;
        }
    }

    fn lock_aimd(&self) -> MutexGuard<'_, AimdController> {
        self.aimd.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_active(&self) -> MutexGuard<'_, HashMap<String, CancelToken>> {
        self.active.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_run_rx(&self) -> MutexGuard<'_, Option<watch::Receiver<RunResult>>> {
        self.run_rx.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Releases a job's slot on drop and wakes the loop and `stop()` waiters.
struct SlotGuard {
    dispatcher: Arc<Dispatcher>,
    job_id: String,
    token: CancelToken,
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        // A retried job can be re-claimed (and re-registered under the
        // same id) before its previous attempt finishes unwinding. Only
        // the registration this guard created may be released, or the
        // active count would undercount live work.
        let mut active = self.dispatcher.lock_active();
        if active
            .get(&self.job_id)
            .is_some_and(|current| current.same_token(&self.token))
        {
            active.remove(&self.job_id);
        }
        drop(active);
        self.dispatcher.wake.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{
        AimdConfig, EventKind, JobStatus, RetryConfig, StoreError, TaskKind, TaskMeta,
    };
    use crate::impls::InMemoryStore;
    use crate::ports::WorkData;
    use async_trait::async_trait;
    use chrono::Utc;
    use serde_json::json;
    use std::sync::atomic::AtomicU32;

    const TASK: &str = "task-under-test";

    fn test_config() -> TaskConfig {
        TaskConfig {
            aimd: AimdConfig {
                initial: 2,
                min: 1,
                max: 10,
                additive_increase: 1,
                multiplicative_decrease: 0.5,
                success_threshold: 100, // effectively off unless a test lowers it
            },
            retry: RetryConfig {
                max_attempts: 3,
                base_delay: Duration::from_millis(5),
                max_delay: Duration::from_millis(50),
            },
            timeout: Duration::from_secs(5),
            ingest_batch: 100,
        }
    }

    async fn seed(store: &InMemoryStore, n: usize) {
        let meta = TaskMeta::new(
            TASK.into(),
            "test".into(),
            TaskKind::Deterministic,
            None,
            Utc::now(),
        );
        store.create_task(meta).await.unwrap();
        let jobs = (0..n)
            .map(|i| JobRecord::new(format!("{TASK}:{i}"), TASK.into(), json!(i)))
            .collect();
        store.create_jobs(jobs).await.unwrap();
    }

    fn collect_events(bus: &EventBus, kinds: &[EventKind]) -> Arc<Mutex<Vec<Event>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        for &kind in kinds {
            let seen = Arc::clone(&seen);
            bus.on(kind, move |event| {
                seen.lock().unwrap().push(event.clone());
            });
        }
        seen
    }

    /// Succeeds every job, counting invocations per job id.
    struct CountingSource {
        calls: Mutex<HashMap<String, u32>>,
    }

    impl CountingSource {
        fn new() -> Self {
            Self {
                calls: Mutex::new(HashMap::new()),
            }
        }
    }

    #[async_trait]
    impl WorkSource for CountingSource {
        fn kind(&self) -> TaskKind {
            TaskKind::Deterministic
        }

        async fn data(&self) -> WorkData {
            WorkData::Finite(vec![])
        }

        async fn run(&self, _input: &Value, ctx: &JobContext) -> Result<Value, HandlerError> {
            *self
                .calls
                .lock()
                .unwrap()
                .entry(ctx.job_id.clone())
                .or_insert(0) += 1;
            Ok(json!("ok"))
        }
    }

    /// Fails the first `failures` invocations (per process, across jobs)
    /// with a retryable error, then succeeds.
    struct FlakySource {
        failures: AtomicU32,
        calls: AtomicU32,
    }

    impl FlakySource {
        fn new(failures: u32) -> Self {
            Self {
                failures: AtomicU32::new(failures),
                calls: AtomicU32::new(0),
            }
        }
    }

    #[async_trait]
    impl WorkSource for FlakySource {
        fn kind(&self) -> TaskKind {
            TaskKind::Deterministic
        }

        async fn data(&self) -> WorkData {
            WorkData::Finite(vec![])
        }

        async fn run(&self, _input: &Value, _ctx: &JobContext) -> Result<Value, HandlerError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let left = self.failures.load(Ordering::SeqCst);
            if left > 0 {
                self.failures.fetch_sub(1, Ordering::SeqCst);
                return Err(HandlerError::new("network glitch"));
            }
            Ok(json!("recovered"))
        }
    }

    /// First invocation fails with a 429 status, the rest succeed.
    struct RateLimitOnceSource {
        tripped: AtomicBool,
    }

    #[async_trait]
    impl WorkSource for RateLimitOnceSource {
        fn kind(&self) -> TaskKind {
            TaskKind::Deterministic
        }

        async fn data(&self) -> WorkData {
            WorkData::Finite(vec![])
        }

        async fn run(&self, _input: &Value, _ctx: &JobContext) -> Result<Value, HandlerError> {
            if !self.tripped.swap(true, Ordering::SeqCst) {
                return Err(HandlerError::with_status("too many requests", 429));
            }
            Ok(json!("ok"))
        }
    }

    /// Always fails with a non-retryable error.
    struct BrokenSource {
        calls: AtomicU32,
        retryable: bool,
    }

    #[async_trait]
    impl WorkSource for BrokenSource {
        fn kind(&self) -> TaskKind {
            TaskKind::Deterministic
        }

        async fn data(&self) -> WorkData {
            WorkData::Finite(vec![])
        }

        async fn run(&self, _input: &Value, _ctx: &JobContext) -> Result<Value, HandlerError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.retryable {
                Err(HandlerError::new("connection reset"))
            } else {
                Err(HandlerError::new("schema validation failed"))
            }
        }
    }

    /// Runs until its token is cancelled.
    struct ObedientSource;

    #[async_trait]
    impl WorkSource for ObedientSource {
        fn kind(&self) -> TaskKind {
            TaskKind::Deterministic
        }

        async fn data(&self) -> WorkData {
            WorkData::Finite(vec![])
        }

        async fn run(&self, _input: &Value, ctx: &JobContext) -> Result<Value, HandlerError> {
            ctx.token.cancelled().await;
            Err(HandlerError::new("cancelled"))
        }
    }

    /// Never finishes on its own; only the timeout bounds it.
    struct StuckSource;

    #[async_trait]
    impl WorkSource for StuckSource {
        fn kind(&self) -> TaskKind {
            TaskKind::Deterministic
        }

        async fn data(&self) -> WorkData {
            WorkData::Finite(vec![])
        }

        async fn run(&self, _input: &Value, _ctx: &JobContext) -> Result<Value, HandlerError> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(json!("unreachable"))
        }
    }

    #[tokio::test]
    async fn runs_every_job_exactly_once() {
        let store = Arc::new(InMemoryStore::new());
        seed(&store, 8).await;
        let source = Arc::new(CountingSource::new());
        let bus = Arc::new(EventBus::new());
        let dispatcher = Dispatcher::new(
            TASK.into(),
            store.clone(),
            source.clone(),
            bus,
            test_config(),
        );

        dispatcher.start().await.unwrap();

        let counts = store.job_counts(TASK).await.unwrap();
        assert_eq!(counts.completed, 8);
        assert_eq!(counts.active, 0);
        let calls = source.calls.lock().unwrap();
        assert_eq!(calls.len(), 8);
        assert!(calls.values().all(|&n| n == 1), "no job over-invoked");
    }

    #[tokio::test]
    async fn concurrent_starts_share_one_run() {
        let store = Arc::new(InMemoryStore::new());
        seed(&store, 20).await;
        let source = Arc::new(CountingSource::new());
        let bus = Arc::new(EventBus::new());
        let dispatcher = Dispatcher::new(
            TASK.into(),
            store.clone(),
            source.clone(),
            bus,
            test_config(),
        );

        let (a, b) = tokio::join!(dispatcher.start(), dispatcher.start());
        a.unwrap();
        b.unwrap();

        let counts = store.job_counts(TASK).await.unwrap();
        assert_eq!(counts.completed, 20);
        assert!(source.calls.lock().unwrap().values().all(|&n| n == 1));
    }

    #[tokio::test]
    async fn success_streak_raises_concurrency() {
        let store = Arc::new(InMemoryStore::new());
        seed(&store, 5).await;
        let bus = Arc::new(EventBus::new());
        let events = collect_events(&bus, &[EventKind::ConcurrencyChange]);
        let mut config = test_config();
        config.aimd.success_threshold = 3;

        let dispatcher = Dispatcher::new(
            TASK.into(),
            store,
            Arc::new(CountingSource::new()),
            bus,
            config,
        );
        dispatcher.start().await.unwrap();

        let events = events.lock().unwrap();
        assert!(
            events
                .iter()
                .any(|e| matches!(e, Event::ConcurrencyChange { concurrency: 3 })),
            "expected a concurrency-change to 3 after the third success, got {events:?}"
        );
        assert_eq!(dispatcher.current_concurrency(), 3);
    }

    #[tokio::test]
    async fn rate_limit_signal_shrinks_concurrency() {
        let store = Arc::new(InMemoryStore::new());
        seed(&store, 3).await;
        let bus = Arc::new(EventBus::new());
        let events = collect_events(&bus, &[EventKind::RateLimited]);
        let mut config = test_config();
        config.aimd.initial = 4;

        let dispatcher = Dispatcher::new(
            TASK.into(),
            store.clone(),
            Arc::new(RateLimitOnceSource {
                tripped: AtomicBool::new(false),
            }),
            bus,
            config,
        );
        dispatcher.start().await.unwrap();

        // floor(4 * 0.5) = 2
        assert_eq!(dispatcher.current_concurrency(), 2);
        assert!(
            events
                .lock()
                .unwrap()
                .iter()
                .any(|e| matches!(e, Event::RateLimited { concurrency: 2 }))
        );
        // The rate-limited job was retryable and eventually completed.
        assert_eq!(store.job_counts(TASK).await.unwrap().completed, 3);
    }

    #[tokio::test]
    async fn decrease_clamps_at_min_concurrency() {
        let store = Arc::new(InMemoryStore::new());
        seed(&store, 1).await;
        let bus = Arc::new(EventBus::new());
        let mut config = test_config();
        config.aimd.initial = 1;
        config.aimd.min = 1;
        config.retry.max_attempts = 1;

        let dispatcher = Dispatcher::new(
            TASK.into(),
            store,
            Arc::new(RateLimitOnceSource {
                tripped: AtomicBool::new(false),
            }),
            bus,
            config,
        );
        dispatcher.start().await.unwrap();
        assert_eq!(dispatcher.current_concurrency(), 1);
    }

    #[tokio::test]
    async fn retryable_failures_are_retried_to_success() {
        let store = Arc::new(InMemoryStore::new());
        seed(&store, 1).await;
        let source = Arc::new(FlakySource::new(2));
        let bus = Arc::new(EventBus::new());
        let events = collect_events(&bus, &[EventKind::JobRetry]);

        let dispatcher =
            Dispatcher::new(TASK.into(), store.clone(), source.clone(), bus, test_config());
        dispatcher.start().await.unwrap();

        // Failed twice, succeeded on the third attempt.
        assert_eq!(source.calls.load(Ordering::SeqCst), 3);
        assert_eq!(events.lock().unwrap().len(), 2);
        let job = store.get_job(&format!("{TASK}:0")).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.attempts, 3);
    }

    #[tokio::test]
    async fn attempts_exhaustion_fails_terminally() {
        let store = Arc::new(InMemoryStore::new());
        seed(&store, 1).await;
        let source = Arc::new(BrokenSource {
            calls: AtomicU32::new(0),
            retryable: true,
        });
        let bus = Arc::new(EventBus::new());
        let events = collect_events(&bus, &[EventKind::JobFailed]);
        let mut config = test_config();
        config.retry.max_attempts = 1;

        let dispatcher =
            Dispatcher::new(TASK.into(), store.clone(), source.clone(), bus, config);
        dispatcher.start().await.unwrap();

        assert_eq!(source.calls.load(Ordering::SeqCst), 1);
        assert_eq!(events.lock().unwrap().len(), 1);
        let job = store.get_job(&format!("{TASK}:0")).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);
    }

    #[tokio::test]
    async fn fatal_errors_are_not_retried() {
        let store = Arc::new(InMemoryStore::new());
        seed(&store, 1).await;
        let source = Arc::new(BrokenSource {
            calls: AtomicU32::new(0),
            retryable: false,
        });

        let dispatcher = Dispatcher::new(
            TASK.into(),
            store.clone(),
            source.clone(),
            Arc::new(EventBus::new()),
            test_config(),
        );
        dispatcher.start().await.unwrap();

        assert_eq!(source.calls.load(Ordering::SeqCst), 1);
        let counts = store.job_counts(TASK).await.unwrap();
        assert_eq!(counts.failed, 1);
    }

    #[tokio::test]
    async fn timeout_surfaces_as_a_distinct_error() {
        let store = Arc::new(InMemoryStore::new());
        seed(&store, 1).await;
        let mut config = test_config();
        config.timeout = Duration::from_millis(30);
        config.retry.max_attempts = 1;

        let dispatcher = Dispatcher::new(
            TASK.into(),
            store.clone(),
            Arc::new(StuckSource),
            Arc::new(EventBus::new()),
            config,
        );
        tokio::time::timeout(Duration::from_secs(5), dispatcher.start())
            .await
            .expect("timeout must bound the stuck handler")
            .unwrap();

        let job = store.get_job(&format!("{TASK}:0")).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert!(job.error.unwrap().contains("timed out"));
    }

    /// Stuck like `StuckSource`, and additionally insists that nothing it
    /// raises is worth retrying.
    struct StubbornStuckSource;

    #[async_trait]
    impl WorkSource for StubbornStuckSource {
        fn kind(&self) -> TaskKind {
            TaskKind::Deterministic
        }

        async fn data(&self) -> WorkData {
            WorkData::Finite(vec![])
        }

        async fn run(&self, _input: &Value, _ctx: &JobContext) -> Result<Value, HandlerError> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(json!("unreachable"))
        }

        fn is_retryable(&self, _error: &HandlerError) -> bool {
            false
        }
    }

    #[tokio::test]
    async fn timeouts_are_retried_even_when_the_classifier_says_no() {
        let store = Arc::new(InMemoryStore::new());
        seed(&store, 1).await;
        let mut config = test_config();
        config.timeout = Duration::from_millis(30);
        config.retry.max_attempts = 3;

        let dispatcher = Dispatcher::new(
            TASK.into(),
            store.clone(),
            Arc::new(StubbornStuckSource),
            Arc::new(EventBus::new()),
            config,
        );
        tokio::time::timeout(Duration::from_secs(5), dispatcher.start())
            .await
            .expect("timeout must bound the stuck handler")
            .unwrap();

        // Only attempt exhaustion ends a timing-out job, never the
        // source's retryability verdict.
        let job = store.get_job(&format!("{TASK}:0")).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.attempts, 3);
        assert!(job.error.unwrap().contains("timed out"));
    }

    /// Always answers 429, and its classifier vetoes retries outright.
    struct FatalRateLimitSource {
        calls: AtomicU32,
    }

    #[async_trait]
    impl WorkSource for FatalRateLimitSource {
        fn kind(&self) -> TaskKind {
            TaskKind::Deterministic
        }

        async fn data(&self) -> WorkData {
            WorkData::Finite(vec![])
        }

        async fn run(&self, _input: &Value, _ctx: &JobContext) -> Result<Value, HandlerError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(HandlerError::with_status("too many requests", 429))
        }

        fn is_retryable(&self, _error: &HandlerError) -> bool {
            false
        }
    }

    #[tokio::test]
    async fn retryable_override_outranks_the_rate_limit_signal() {
        let store = Arc::new(InMemoryStore::new());
        seed(&store, 1).await;
        let source = Arc::new(FatalRateLimitSource {
            calls: AtomicU32::new(0),
        });
        let mut config = test_config();
        config.aimd.initial = 4;

        let dispatcher =
            Dispatcher::new(TASK.into(), store.clone(), source.clone(), Arc::new(EventBus::new()), config);
        dispatcher.start().await.unwrap();

        // The rate limit still shrinks the window, but the source's
        // explicit verdict decides the retry: one attempt, then terminal.
        assert_eq!(dispatcher.current_concurrency(), 2);
        assert_eq!(source.calls.load(Ordering::SeqCst), 1);
        let counts = store.job_counts(TASK).await.unwrap();
        assert_eq!(counts.failed, 1);
    }

    #[tokio::test]
    async fn slot_guard_skips_a_superseded_registration() {
        let dispatcher = Dispatcher::new(
            TASK.into(),
            Arc::new(InMemoryStore::new()),
            Arc::new(CountingSource::new()),
            Arc::new(EventBus::new()),
            test_config(),
        );
        let stale = CancelToken::new();
        let fresh = CancelToken::new();
        dispatcher.lock_active().insert("j1".into(), fresh.clone());

        // A guard left over from a prior attempt must not free the slot
        // the re-claimed execution now holds.
        drop(SlotGuard {
            dispatcher: Arc::clone(&dispatcher),
            job_id: "j1".into(),
            token: stale,
        });
        assert_eq!(dispatcher.active_count(), 1);

        drop(SlotGuard {
            dispatcher: Arc::clone(&dispatcher),
            job_id: "j1".into(),
            token: fresh,
        });
        assert_eq!(dispatcher.active_count(), 0);
    }

    #[tokio::test]
    async fn stop_cancels_active_jobs_and_drains() {
        let store = Arc::new(InMemoryStore::new());
        seed(&store, 4).await;
        let bus = Arc::new(EventBus::new());
        let dispatcher = Dispatcher::new(
            TASK.into(),
            store.clone(),
            Arc::new(ObedientSource),
            bus,
            test_config(),
        );

        let runner = {
            let dispatcher = Arc::clone(&dispatcher);
            tokio::spawn(async move { dispatcher.start().await })
        };
        // Wait until some jobs are in flight.
        tokio::time::timeout(Duration::from_secs(5), async {
            while dispatcher.active_count() == 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        dispatcher.stop().await;
        assert_eq!(dispatcher.active_count(), 0);
        assert!(dispatcher.is_stopped());
        runner.await.unwrap().unwrap();

        // Cancelled work is not trusted: nothing completed, and the
        // claimed jobs are left active for the owning task to reset.
        let counts = store.job_counts(TASK).await.unwrap();
        assert_eq!(counts.completed, 0);
        assert!(counts.active > 0);
    }

    #[tokio::test]
    async fn pause_holds_claims_until_resume() {
        let store = Arc::new(InMemoryStore::new());
        seed(&store, 3).await;
        let dispatcher = Dispatcher::new(
            TASK.into(),
            store.clone(),
            Arc::new(CountingSource::new()),
            Arc::new(EventBus::new()),
            test_config(),
        );

        dispatcher.pause();
        let runner = {
            let dispatcher = Arc::clone(&dispatcher);
            tokio::spawn(async move { dispatcher.start().await })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(dispatcher.is_paused());
        assert_eq!(store.job_counts(TASK).await.unwrap().pending, 3);

        dispatcher.resume();
        tokio::time::timeout(Duration::from_secs(5), runner)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(store.job_counts(TASK).await.unwrap().completed, 3);
    }

    #[tokio::test]
    async fn closed_store_stops_cleanly() {
        let store = Arc::new(InMemoryStore::new());
        seed(&store, 2).await;
        store.close().await.unwrap();

        let dispatcher = Dispatcher::new(
            TASK.into(),
            store,
            Arc::new(CountingSource::new()),
            Arc::new(EventBus::new()),
            test_config(),
        );
        // No error surfaces; the dispatcher just stops.
        dispatcher.start().await.unwrap();
        assert!(dispatcher.is_stopped());
    }

    /// Store stub whose claim always fails with a non-closed error.
    struct ClaimErrorStore;

    #[async_trait]
    impl JobStore for ClaimErrorStore {
        async fn initialize(&self) -> Result<(), StoreError> {
            Ok(())
        }
        async fn close(&self) -> Result<(), StoreError> {
            Ok(())
        }
        async fn create_task(&self, _meta: TaskMeta) -> Result<(), StoreError> {
            Ok(())
        }
        async fn get_task(&self, _id: &str) -> Result<Option<TaskMeta>, StoreError> {
            Ok(None)
        }
        async fn update_task(
            &self,
            _id: &str,
            _patch: crate::domain::TaskPatch,
        ) -> Result<(), StoreError> {
            Ok(())
        }
        async fn delete_task(&self, _id: &str) -> Result<(), StoreError> {
            Ok(())
        }
        async fn list_tasks(&self) -> Result<Vec<TaskMeta>, StoreError> {
            Ok(vec![])
        }
        async fn create_jobs(&self, _jobs: Vec<JobRecord>) -> Result<(), StoreError> {
            Ok(())
        }
        async fn get_job(&self, _id: &str) -> Result<Option<JobRecord>, StoreError> {
            Ok(None)
        }
        async fn get_jobs_by_task(
            &self,
            _task_id: &str,
            _status: Option<JobStatus>,
            _limit: usize,
            _offset: usize,
        ) -> Result<Vec<JobRecord>, StoreError> {
            Ok(vec![])
        }
        async fn delete_jobs_by_task(&self, _task_id: &str) -> Result<(), StoreError> {
            Ok(())
        }
        async fn claim_jobs(
            &self,
            _task_id: &str,
            _limit: usize,
        ) -> Result<Vec<JobRecord>, StoreError> {
            Err(StoreError::Backend("disk on fire".into()))
        }
        async fn complete_job(&self, _id: &str, _output: Value) -> Result<(), StoreError> {
            Ok(())
        }
        async fn fail_job(
            &self,
            _id: &str,
            _error: &str,
            _can_retry: bool,
            _retry_after: Option<Duration>,
        ) -> Result<(), StoreError> {
            Ok(())
        }
        async fn job_counts(&self, _task_id: &str) -> Result<crate::ports::JobCounts, StoreError> {
            Ok(Default::default())
        }
        async fn reset_active_jobs(&self, _task_id: &str) -> Result<(), StoreError> {
            Ok(())
        }
        async fn reset_failed_jobs(&self, _task_id: &str) -> Result<u64, StoreError> {
            Ok(0)
        }
    }

    #[tokio::test]
    async fn non_closed_store_errors_propagate() {
        let dispatcher = Dispatcher::new(
            TASK.into(),
            Arc::new(ClaimErrorStore),
            Arc::new(CountingSource::new()),
            Arc::new(EventBus::new()),
            test_config(),
        );
        let err = dispatcher.start().await.unwrap_err();
        assert!(matches!(
            err,
            DispatchError::Store(StoreError::Backend(_))
        ));
    }
}
