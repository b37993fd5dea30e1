//! Progress snapshot emitted once per second while a task runs.

use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskProgress {
    pub total: u64,
    pub completed: u64,
    pub failed: u64,
    pub pending: u64,
    pub active: u64,

    /// Live AIMD concurrency limit.
    pub concurrency: usize,

    /// Time since the session started.
    pub elapsed: Duration,

    /// Estimated remaining time: average time per completed job times the
    /// jobs still outstanding. `None` until the first completion.
    pub eta: Option<Duration>,
}

impl TaskProgress {
    /// Estimate remaining time from throughput so far.
    pub fn estimate_eta(elapsed: Duration, completed: u64, outstanding: u64) -> Option<Duration> {
        if completed == 0 {
            return None;
        }
        let per_job = elapsed.as_secs_f64() / completed as f64;
        Some(Duration::from_secs_f64(per_job * outstanding as f64))
    }
}
