//! Adaptive job dispatch engine.
//!
//! A caller hands the [`Hub`] a named workload (a [`ports::WorkSource`]:
//! an input collection plus a handler) and gets back a [`Task`]. The task
//! ingests inputs as content-addressed jobs, then a [`dispatch::Dispatcher`]
//! claims and executes them under an AIMD-tuned concurrency limit, with
//! retries, cooperative cancellation, and lifecycle events on a typed bus.
//! All job state lives behind the [`ports::JobStore`] contract, so a
//! workload survives a process restart and resumes where it left off.

pub mod bus;
pub mod dispatch;
pub mod domain;
pub mod hash;
pub mod hub;
pub mod impls;
pub mod ports;
pub mod task;

pub use bus::{EventBus, Subscription};
pub use dispatch::{CancelToken, Dispatcher};
pub use domain::{
    AimdConfig, DispatchError, Event, EventKind, HandlerError, JobRecord, JobStatus, RetryConfig,
    StoreError, TaskConfig, TaskKind, TaskMeta, TaskPatch, TaskProgress, TaskStatus,
};
pub use hub::{CreateTask, Hub};
pub use impls::InMemoryStore;
pub use ports::{InputFeed, JobContext, JobCounts, JobStore, WorkData, WorkSource};
pub use task::{ResultsFilter, Task};
