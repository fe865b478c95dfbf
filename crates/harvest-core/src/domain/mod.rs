//! Domain model: ids, backlog tasks, duplicate counters, results and fetch outcomes.

pub mod duplicate;
pub mod ids;
pub mod outcome;
pub mod result;
pub mod task;

pub use duplicate::DuplicateRecord;
pub use ids::{DispatchId, TaskId, WorkerId};
pub use outcome::{FailureKind, FetchError};
pub use result::ResultRecord;
pub use task::{BacklogCounts, Discovery, Task, TaskStatus};
