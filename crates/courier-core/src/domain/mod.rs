//! Domain model (IDs, tasks, jobs, send outcomes).

pub mod ids;
pub mod job;
pub mod outcome;
pub mod task;

pub use ids::{JobId, ParseIdError, TaskId};
pub use job::{Job, JobCounts, JobStatus, UnknownJobStatus};
pub use outcome::SendOutcome;
pub use task::{NewTask, Payload, Task, TaskStatus, UnknownTaskStatus};
