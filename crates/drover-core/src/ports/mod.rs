//! Ports: the seams between the engine and the outside world.
//!
//! - `JobStore`: the persistence backend (source of truth for job
//!   ownership and state). Engine selection is a deployment concern; the
//!   engine itself is agnostic.
//! - `WorkSource`: the caller-supplied bundle of inputs, handler, and
//!   optional error classifiers.

pub mod source;
pub mod store;

pub use self::source::{InputFeed, JobContext, WorkData, WorkSource};
pub use self::store::{JobCounts, JobStore};
