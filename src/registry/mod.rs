//! In-memory job/task registry.
//!
//! [`JobTaskTable`] tracks every job and task attempt the agent has accepted,
//! keyed for the head service's view. The table carries the resync marker
//! that heartbeats use to request a state re-push after reporting failures.

pub mod table;
pub mod task;

pub use table::{JobInfo, JobTaskTable};
pub use task::{JobId, ProcessKey, TaskId, TaskInfo};
