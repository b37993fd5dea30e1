//! AIMD controller: the feedback loop that tunes the concurrency limit.

use crate::domain::AimdConfig;

/// Tracks the live concurrency limit and the consecutive-success streak.
///
/// Success branch: after `success_threshold` consecutive successes, add
/// `additive_increase` (clamped to `max`) and reset the streak.
/// Rate-limit branch: reset the streak and multiply the limit by
/// `multiplicative_decrease`, floored, clamped to `min`.
#[derive(Debug)]
pub struct AimdController {
    config: AimdConfig,
    limit: usize,
    streak: u32,
}

impl AimdController {
    pub fn new(config: AimdConfig) -> Self {
        let limit = config.initial.clamp(config.min, config.max);
        Self {
            config,
            limit,
            streak: 0,
        }
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Record one success. Returns the new limit if it changed.
    pub fn on_success(&mut self) -> Option<usize> {
        self.streak += 1;
        if self.streak < self.config.success_threshold {
            return None;
        }
        self.streak = 0;
        let next = (self.limit + self.config.additive_increase).min(self.config.max);
        if next == self.limit {
            return None;
        }
        self.limit = next;
        Some(next)
    }

    /// Record a rate-limit signal. Returns the new limit if it changed.
    pub fn on_rate_limit(&mut self) -> Option<usize> {
        self.streak = 0;
        let decreased = (self.limit as f64 * self.config.multiplicative_decrease).floor() as usize;
        let next = decreased.max(self.config.min);
        if next == self.limit {
            return None;
        }
        self.limit = next;
        Some(next)
    }
}
