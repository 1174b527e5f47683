use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::domain::{JobId, TaskId, TaskStatus};

/// Failure of the task store (the only thing that can abort a tick).
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("storage unavailable: {0}")]
    Unavailable(String),

    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("payload encoding: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("corrupt record: {0}")]
    Corrupt(String),

    #[error("job not found: {0}")]
    JobNotFound(JobId),

    #[error("timestamp outside the storable range: {0}")]
    TimestampOutOfRange(DateTime<Utc>),
}

/// Failure reported by a send capability. The message is recorded verbatim
/// as the task's failure reason.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{reason}")]
pub struct SendError {
    pub reason: String,
}

impl SendError {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{key} must be greater than zero")]
    Zero { key: &'static str },

    #[error("{key}: cannot parse {value:?} as a number")]
    NotANumber { key: String, value: String },

    #[error("{key} must be at most {max} seconds, got {value}")]
    TooLarge {
        key: &'static str,
        max: u64,
        value: u64,
    },
}

#[derive(Debug, Error)]
pub enum CourierError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("task not found: {0}")]
    TaskNotFound(TaskId),

    #[error("job not found: {0}")]
    JobNotFound(JobId),

    #[error("task {task_id} cannot be triggered while {status}")]
    NotTriggerable { task_id: TaskId, status: TaskStatus },

    #[error("task {0} was claimed by someone else")]
    ClaimLost(TaskId),

    #[error("scheduler loop stopped: {0}")]
    SchedulerStopped(String),
}
