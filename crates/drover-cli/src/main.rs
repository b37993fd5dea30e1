//! Demo driver: runs a small flaky workload end to end against the
//! in-memory store and prints what the engine does with it.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use tokio::time::{Duration, sleep};

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Value, json};

use drover_core::{
    AimdConfig, CreateTask, EventKind, HandlerError, Hub, InMemoryStore, JobContext, ResultsFilter,
    RetryConfig, TaskConfig, TaskKind, WorkData, WorkSource,
};

#[derive(Debug, Deserialize)]
struct FetchInput {
    url: String,
}

/// Pretends to fetch URLs: slow-ish, fails the first few calls with a
/// retryable error, and trips one rate-limit along the way so the AIMD
/// backoff is visible in the event stream.
struct FlakyFetcher {
    inputs: Vec<Value>,
    remaining_failures: AtomicU32,
    rate_limits: AtomicU32,
}

impl FlakyFetcher {
    fn new(inputs: Vec<Value>) -> Self {
        Self {
            inputs,
            remaining_failures: AtomicU32::new(3),
            rate_limits: AtomicU32::new(1),
        }
    }
}

#[async_trait]
impl WorkSource for FlakyFetcher {
    fn kind(&self) -> TaskKind {
        TaskKind::Deterministic
    }

    async fn data(&self) -> WorkData {
        WorkData::Finite(self.inputs.clone())
    }

    async fn run(&self, input: &Value, ctx: &JobContext) -> Result<Value, HandlerError> {
        let input: FetchInput = serde_json::from_value(input.clone())
            .map_err(|e| HandlerError::new(format!("json decode: {e}")))?;
        sleep(Duration::from_millis(40)).await;

        if self.rate_limits.load(Ordering::Relaxed) > 0 {
            self.rate_limits.fetch_sub(1, Ordering::Relaxed);
            return Err(HandlerError::with_status("too many requests", 429));
        }
        let left = self.remaining_failures.load(Ordering::Relaxed);
        if left > 0 {
            self.remaining_failures.fetch_sub(1, Ordering::Relaxed);
            return Err(HandlerError::new(format!(
                "connection reset (left={left})"
            )));
        }

        Ok(json!({
            "url": input.url,
            "attempt": ctx.attempt,
            "bytes": 1024 + input.url.len(),
        }))
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let store = Arc::new(InMemoryStore::new());
    let hub = Hub::new(store);

    let inputs: Vec<Value> = (0..12)
        .map(|i| json!({ "url": format!("https://example.com/page/{i}") }))
        .collect();

    let config = TaskConfig {
        aimd: AimdConfig {
            initial: 2,
            max: 6,
            success_threshold: 3,
            ..Default::default()
        },
        retry: RetryConfig {
            max_attempts: 3,
            base_delay: Duration::from_millis(50),
            max_delay: Duration::from_secs(2),
        },
        ..Default::default()
    };

    let task = hub
        .create_task(
            CreateTask::new("demo-crawl")
                .source(Arc::new(FlakyFetcher::new(inputs)))
                .config(config),
        )
        .await
        .expect("create demo task");

    tracing::info!(
        task_id = %task.id(),
        merkle_root = ?task.meta().merkle_root,
        total = task.meta().total_jobs,
        "task created"
    );

    task.on(EventKind::JobRetry, |event| {
        if let drover_core::Event::JobRetry {
            job_id,
            attempt,
            error,
            delay,
        } = event
        {
            tracing::warn!(%job_id, attempt, %error, ?delay, "retrying");
        }
    });
    task.on(EventKind::RateLimited, |event| {
        if let drover_core::Event::RateLimited { concurrency } = event {
            tracing::warn!(concurrency, "rate limited, backing off");
        }
    });
    task.on(EventKind::ConcurrencyChange, |event| {
        if let drover_core::Event::ConcurrencyChange { concurrency } = event {
            tracing::info!(concurrency, "concurrency adjusted");
        }
    });
    task.on(EventKind::Progress, |event| {
        if let drover_core::Event::Progress(p) = event {
            tracing::info!(
                completed = p.completed,
                failed = p.failed,
                active = p.active,
                concurrency = p.concurrency,
                eta = ?p.eta,
                "progress"
            );
        }
    });

    task.start().await.expect("run demo task");

    let progress = task.progress().await.expect("read final progress");
    tracing::info!(
        status = ?task.status(),
        completed = progress.completed,
        failed = progress.failed,
        elapsed = ?progress.elapsed,
        "task finished"
    );

    let results = task
        .results(ResultsFilter {
            limit: Some(3),
            ..Default::default()
        })
        .await
        .expect("read results");
    for job in results {
        tracing::info!(job_id = %job.id, attempts = job.attempts, output = ?job.output, "sample result");
    }

    hub.shutdown().await.expect("shutdown");
}
