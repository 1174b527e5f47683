//! Task record and its state machine.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ids::{JobId, TaskId};

/// Task status.
///
/// State transitions:
/// - Pending -> Processing (claim)
/// - Processing -> Sent (send succeeded)
/// - Processing -> Failed (send failed, returned or raised)
///
/// `Sent` and `Failed` never return to `Pending` on their own. The serialized
/// names are read by reporting layers, so renaming a variant is a breaking change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Waiting for `due_at` to pass.
    Pending,

    /// Claimed by exactly one dispatcher, send in flight.
    Processing,

    /// Delivered.
    Sent,

    /// Delivery failed; reason is kept on the task.
    Failed,
}

impl TaskStatus {
    pub const ALL: [TaskStatus; 4] = [
        TaskStatus::Pending,
        TaskStatus::Processing,
        TaskStatus::Sent,
        TaskStatus::Failed,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Processing => "processing",
            TaskStatus::Sent => "sent",
            TaskStatus::Failed => "failed",
        }
    }

    /// Is this a terminal state (no automatic transitions)?
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Sent | TaskStatus::Failed)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown task status: {0}")]
pub struct UnknownTaskStatus(pub String);

impl FromStr for TaskStatus {
    type Err = UnknownTaskStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TaskStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| UnknownTaskStatus(s.to_string()))
    }
}

/// Destination + message content. The dispatcher never looks inside; it is
/// handed to the send capability as-is.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Payload {
    pub destination: String,
    pub message: String,
}

impl Payload {
    pub fn new(destination: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            destination: destination.into(),
            message: message.into(),
        }
    }
}

/// What the ingestion side provides to create a task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewTask {
    pub payload: Payload,
    pub due_at: DateTime<Utc>,
}

impl NewTask {
    pub fn new(payload: Payload, due_at: DateTime<Utc>) -> Self {
        Self { payload, due_at }
    }
}

/// One scheduled send.
///
/// Design:
/// - The store holds the single authoritative copy.
/// - `completed_at` / `failure_reason` are only set on a terminal transition.
/// - Soft-deleted tasks stay in the store but are invisible to claims and counts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub job_id: JobId,
    pub payload: Payload,
    pub due_at: DateTime<Utc>,
    pub status: TaskStatus,

    /// When the current (or last) claim happened.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub claimed_at: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,

    #[serde(default)]
    pub soft_deleted: bool,

    pub created_at: DateTime<Utc>,
}

impl Task {
    pub fn new(id: TaskId, job_id: JobId, new: NewTask, created_at: DateTime<Utc>) -> Self {
        Self {
            id,
            job_id,
            payload: new.payload,
            due_at: new.due_at,
            status: TaskStatus::Pending,
            claimed_at: None,
            completed_at: None,
            failure_reason: None,
            soft_deleted: false,
            created_at,
        }
    }

    /// Eligible for `claim_next_due` at `now`?
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.status == TaskStatus::Pending && !self.soft_deleted && self.due_at <= now
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use ulid::Ulid;

    fn task_due_at(due_at: DateTime<Utc>) -> Task {
        Task::new(
            TaskId::from_ulid(Ulid::new()),
            JobId::from_ulid(Ulid::new()),
            NewTask::new(Payload::new("a@example.com", "hi"), due_at),
            due_at,
        )
    }

    #[test]
    fn status_names_are_the_persisted_names() {
        let names: Vec<String> = TaskStatus::ALL
            .iter()
            .map(|s| serde_json::to_string(s).unwrap())
            .collect();
        assert_eq!(
            names,
            vec!["\"pending\"", "\"processing\"", "\"sent\"", "\"failed\""]
        );

        for status in TaskStatus::ALL {
            assert_eq!(status.as_str().parse::<TaskStatus>().unwrap(), status);
        }
        assert!("scheduled".parse::<TaskStatus>().is_err());
    }

    #[test]
    fn only_sent_and_failed_are_terminal() {
        assert!(!TaskStatus::Pending.is_terminal());
        assert!(!TaskStatus::Processing.is_terminal());
        assert!(TaskStatus::Sent.is_terminal());
        assert!(TaskStatus::Failed.is_terminal());
    }

    #[test]
    fn due_check_respects_time_status_and_tombstone() {
        let nine = Utc.with_ymd_and_hms(2024, 5, 1, 9, 0, 0).unwrap();
        let mut task = task_due_at(nine);

        assert!(task.is_due(nine));
        assert!(!task.is_due(nine - chrono::Duration::seconds(1)));

        task.soft_deleted = true;
        assert!(!task.is_due(nine));

        task.soft_deleted = false;
        task.status = TaskStatus::Processing;
        assert!(!task.is_due(nine));
    }
}
