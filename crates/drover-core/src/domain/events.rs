//! Lifecycle events emitted by the dispatcher and task.

use std::time::Duration;

use serde_json::Value;

use super::progress::TaskProgress;
use super::task_meta::TaskStatus;

/// Event name, used as the subscription key on the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    JobStart,
    JobComplete,
    JobRetry,
    JobFailed,
    RateLimited,
    ConcurrencyChange,
    Progress,
    StatusChange,
}

/// A lifecycle event with its payload.
#[derive(Debug, Clone)]
pub enum Event {
    JobStart {
        job_id: String,
        attempt: u32,
    },
    JobComplete {
        job_id: String,
        output: Value,
    },
    JobRetry {
        job_id: String,
        attempt: u32,
        error: String,
        delay: Duration,
    },
    JobFailed {
        job_id: String,
        error: String,
    },
    /// A provider signalled overload; carries the concurrency after the
    /// multiplicative decrease.
    RateLimited {
        concurrency: usize,
    },
    /// The live concurrency limit changed (either direction).
    ConcurrencyChange {
        concurrency: usize,
    },
    Progress(TaskProgress),
    StatusChange {
        status: TaskStatus,
    },
}

impl Event {
    pub fn kind(&self) -> EventKind {
        match self {
            Event::JobStart { .. } => EventKind::JobStart,
            Event::JobComplete { .. } => EventKind::JobComplete,
            Event::JobRetry { .. } => EventKind::JobRetry,
            Event::JobFailed { .. } => EventKind::JobFailed,
            Event::RateLimited { .. } => EventKind::RateLimited,
            Event::ConcurrencyChange { .. } => EventKind::ConcurrencyChange,
            Event::Progress(_) => EventKind::Progress,
            Event::StatusChange { .. } => EventKind::StatusChange,
        }
    }
}
