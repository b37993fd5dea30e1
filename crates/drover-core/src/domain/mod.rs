//! Domain model (records, configuration, errors, events).

pub mod config;
pub mod errors;
pub mod events;
pub mod job;
pub mod progress;
pub mod task_meta;

pub use config::{AimdConfig, RetryConfig, TaskConfig};
pub use errors::{DispatchError, HandlerError, StoreError};
pub use events::{Event, EventKind};
pub use job::{JobRecord, JobStatus};
pub use progress::TaskProgress;
pub use task_meta::{TaskKind, TaskMeta, TaskPatch, TaskStatus};
