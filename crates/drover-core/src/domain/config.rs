//! Dispatch configuration: AIMD limits, retry policy, timeouts.

use std::time::Duration;

/// AIMD (additive-increase/multiplicative-decrease) configuration.
///
/// The dispatcher probes for more headroom slowly (one additive step per
/// success streak) and backs off aggressively the instant a provider
/// signals overload, mirroring TCP congestion control.
#[derive(Debug, Clone)]
pub struct AimdConfig {
    /// Concurrency at session start.
    pub initial: usize,

    /// Lower clamp; the limit never drops below this.
    pub min: usize,

    /// Upper clamp; the limit never exceeds this.
    pub max: usize,

    /// Step added after each success streak.
    pub additive_increase: usize,

    /// Fraction (0..1) applied to the limit on a rate-limit signal.
    pub multiplicative_decrease: f64,

    /// Consecutive successes required before one additive step.
    pub success_threshold: u32,
}

impl Default for AimdConfig {
    fn default() -> Self {
        Self {
            initial: 2,
            min: 1,
            max: 20,
            additive_increase: 1,
            multiplicative_decrease: 0.5,
            success_threshold: 5,
        }
    }
}

/// Retry policy for failed jobs.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum execution attempts (including the first).
    pub max_attempts: u32,

    /// Base delay for the first retry.
    pub base_delay: Duration,

    /// Cap for the exponential backoff.
    pub max_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryConfig {
    /// Delay before the next retry: `min(base_delay * 2^(attempts - 1), max_delay)`.
    ///
    /// `attempts` is the number of attempts already made (1-indexed).
    pub fn backoff(&self, attempts: u32) -> Duration {
        let base = self.base_delay.as_secs_f64();
        let delay = base * 2f64.powi(attempts.saturating_sub(1).min(i32::MAX as u32) as i32);
        Duration::from_secs_f64(delay).min(self.max_delay)
    }
}

/// Per-task configuration bundle.
#[derive(Debug, Clone)]
pub struct TaskConfig {
    pub aimd: AimdConfig,
    pub retry: RetryConfig,

    /// Handler timeout; a job still running past this is failed with a
    /// distinct timeout error, independent of cancellation.
    pub timeout: Duration,

    /// Ingestion batch size: jobs are written to the store in chunks of
    /// this many so very large input sets are never materialized as
    /// persisted-job objects all at once.
    pub ingest_batch: usize,
}

impl Default for TaskConfig {
    fn default() -> Self {
        Self {
            aimd: AimdConfig::default(),
            retry: RetryConfig::default(),
            timeout: Duration::from_secs(30),
            ingest_batch: 200,
        }
    }
}
