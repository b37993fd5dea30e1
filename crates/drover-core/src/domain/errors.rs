//! Error taxonomy.
//!
//! Three layers, kept deliberately separate:
//! - `StoreError`: the persistence backend. `Closed` is the one sentinel
//!   the engine pattern-matches for graceful shutdown.
//! - `HandlerError`: raised by the work source; classified retryable /
//!   rate-limited / fatal by the dispatcher, never re-thrown to callers.
//! - `DispatchError`: programmer errors (invalid state transitions) and
//!   non-`Closed` backend errors that propagate out of `start()`-style
//!   calls.

use thiserror::Error;

/// Persistence backend error.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    /// The backend is closed / unavailable. Treated as a clean-stop
    /// signal, never surfaced as an exception to `start()` callers.
    #[error("store is closed")]
    Closed,

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("backend error: {0}")]
    Backend(String),
}

impl StoreError {
    pub fn is_closed(&self) -> bool {
        matches!(self, StoreError::Closed)
    }
}

/// Engine-level error returned by `Task`/`Hub` operations.
#[derive(Debug, Clone, Error)]
pub enum DispatchError {
    /// Invalid state transition (`set_source` on a non-idle task,
    /// `start()` on a completed one, ...). Fails fast, never retried.
    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("task not found: {0}")]
    TaskNotFound(String),

    #[error("task already exists: {0}")]
    TaskExists(String),

    #[error("no work source attached")]
    NoSource,

    /// The value cannot be canonically serialized for hashing.
    #[error("cannot canonicalize value: {0}")]
    Canonicalize(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Failure raised by a work source handler.
///
/// Carries an optional numeric `status` because the default rate-limit and
/// retryability heuristics sniff it (429/503/5xx) in addition to message
/// substrings. Sources with better knowledge override the classifiers.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct HandlerError {
    pub message: String,
    pub status: Option<u16>,
}

impl HandlerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            status: None,
        }
    }

    pub fn with_status(message: impl Into<String>, status: u16) -> Self {
        Self {
            message: message.into(),
            status: Some(status),
        }
    }
}
