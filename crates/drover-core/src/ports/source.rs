//! WorkSource port: inputs, handler, and error classifiers.

use async_trait::async_trait;
use serde_json::Value;

use crate::dispatch::CancelToken;
use crate::domain::{HandlerError, TaskKind};

/// Pull-based feed of inputs for a dynamic task: one input at a time,
/// unbounded in principle, not restartable. Ingestion batches writes off
/// this feed without materializing the whole sequence.
#[async_trait]
pub trait InputFeed: Send {
    async fn next(&mut self) -> Option<Value>;
}

/// The input collection a source provides.
pub enum WorkData {
    /// Finite collection, known up front (deterministic tasks).
    Finite(Vec<Value>),

    /// Unbounded lazy sequence (dynamic tasks).
    Lazy(Box<dyn InputFeed>),
}

/// Execution context passed to the handler alongside the input.
#[derive(Debug, Clone)]
pub struct JobContext {
    pub job_id: String,

    /// Which attempt this is (1-indexed).
    pub attempt: u32,

    /// Cooperative cancellation: `stop()` cancels this token; a handler
    /// is expected to observe it and abort promptly. Independent of the
    /// timeout race.
    pub token: CancelToken,
}

/// Caller-supplied bundle: the input collection, the handler, and
/// optional overrides for error classification and content ids.
#[async_trait]
pub trait WorkSource: Send + Sync {
    fn kind(&self) -> TaskKind;

    /// The input collection. Deterministic sources return `Finite` and
    /// may be read more than once; dynamic sources return `Lazy` and the
    /// feed is consumed exactly once, during ingestion.
    async fn data(&self) -> WorkData;

    /// Execute one input.
    async fn run(&self, input: &Value, ctx: &JobContext) -> Result<Value, HandlerError>;

    /// Is this error worth retrying? Defaults to the substring/status
    /// heuristic below; override when the source knows better.
    fn is_retryable(&self, error: &HandlerError) -> bool {
        default_retryable(error)
    }

    /// Is this error a rate-limit signal (triggers the AIMD decrease)?
    fn is_rate_limited(&self, error: &HandlerError) -> bool {
        default_rate_limited(error)
    }

    /// Custom content id for an input, used in place of the content hash
    /// when deriving job ids and Merkle leaves.
    fn content_id(&self, _input: &Value) -> Option<String> {
        None
    }
}

/// Default rate-limit heuristic: a 429/503 status, or rate-limit wording
/// in the message. Inherently fragile, kept as-is by design decision;
/// sources override `is_rate_limited` when they can do better.
pub fn default_rate_limited(error: &HandlerError) -> bool {
    if matches!(error.status, Some(429) | Some(503)) {
        return true;
    }
    let msg = error.message.to_ascii_lowercase();
    msg.contains("rate limit") || msg.contains("429") || msg.contains("503")
}

/// Default retryability heuristic: rate-limited errors, 5xx statuses, and
/// network/timeout-flavored messages.
pub fn default_retryable(error: &HandlerError) -> bool {
    if default_rate_limited(error) {
        return true;
    }
    if let Some(status) = error.status
        && (500..600).contains(&status)
    {
        return true;
    }
    let msg = error.message.to_ascii_lowercase();
    ["timeout", "timed out", "network", "connection reset", "econnreset", "socket"]
        .iter()
        .any(|needle| msg.contains(needle))
}
