//! Job record and status management.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ids::JobId;

/// Job lifecycle status.
///
/// Transitions:
/// - Draft -> Scheduled (ingestion, when the first tasks are added)
/// - Draft | Scheduled -> InProgress (reconciler, some tasks processed)
/// - Draft | Scheduled | InProgress -> Completed (reconciler, all tasks processed)
/// - Paused is set from outside and is never left by the reconciler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Draft,
    Scheduled,
    InProgress,
    Completed,
    Paused,
}

impl JobStatus {
    pub const ALL: [JobStatus; 5] = [
        JobStatus::Draft,
        JobStatus::Scheduled,
        JobStatus::InProgress,
        JobStatus::Completed,
        JobStatus::Paused,
    ];

    /// Statuses the reconciler keeps in sync.
    pub const ACTIVE: [JobStatus; 3] = [
        JobStatus::Scheduled,
        JobStatus::InProgress,
        JobStatus::Draft,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Draft => "draft",
            JobStatus::Scheduled => "scheduled",
            JobStatus::InProgress => "in_progress",
            JobStatus::Completed => "completed",
            JobStatus::Paused => "paused",
        }
    }

    pub fn is_active(self) -> bool {
        JobStatus::ACTIVE.contains(&self)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown job status: {0}")]
pub struct UnknownJobStatus(pub String);

impl FromStr for JobStatus {
    type Err = UnknownJobStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| UnknownJobStatus(s.to_string()))
    }
}

/// Aggregate counts over a job's non-deleted tasks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobCounts {
    pub total: u64,
    pub sent: u64,
    pub failed: u64,
}

impl JobCounts {
    pub fn processed(&self) -> u64 {
        self.sent + self.failed
    }

    /// Status a job in `current` should move to, or `None` to leave it alone.
    ///
    /// - everything processed (and at least one task) -> Completed
    /// - some but not all processed -> InProgress, unless already there
    /// - nothing processed, or no tasks at all -> unchanged
    pub fn next_status(&self, current: JobStatus) -> Option<JobStatus> {
        let processed = self.processed();
        if self.total > 0 && processed >= self.total {
            (current != JobStatus::Completed).then_some(JobStatus::Completed)
        } else if processed > 0 && processed < self.total {
            (current != JobStatus::InProgress).then_some(JobStatus::InProgress)
        } else {
            None
        }
    }
}

/// Job record: the parent grouping of tasks.
///
/// `counts` is a cache. The reconciler overwrites it from task-level data on
/// every pass; nothing else writes it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub name: String,
    pub status: JobStatus,
    #[serde(flatten)]
    pub counts: JobCounts,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    pub fn new(id: JobId, name: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            id,
            name: name.into(),
            status: JobStatus::Draft,
            counts: JobCounts::default(),
            created_at: now,
            updated_at: now,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn counts(total: u64, sent: u64, failed: u64) -> JobCounts {
        JobCounts {
            total,
            sent,
            failed,
        }
    }

    #[test]
    fn status_names_are_the_persisted_names() {
        assert_eq!(
            serde_json::to_string(&JobStatus::InProgress).unwrap(),
            "\"in_progress\""
        );
        for status in JobStatus::ALL {
            assert_eq!(status.as_str().parse::<JobStatus>().unwrap(), status);
        }
    }

    #[test]
    fn only_draft_scheduled_in_progress_are_active() {
        assert!(JobStatus::Draft.is_active());
        assert!(JobStatus::Scheduled.is_active());
        assert!(JobStatus::InProgress.is_active());
        assert!(!JobStatus::Completed.is_active());
        assert!(!JobStatus::Paused.is_active());
    }

    #[rstest]
    #[case::all_sent(counts(3, 3, 0), JobStatus::Scheduled, Some(JobStatus::Completed))]
    #[case::mixed_terminal(counts(3, 1, 2), JobStatus::InProgress, Some(JobStatus::Completed))]
    #[case::all_failed_from_draft(counts(2, 0, 2), JobStatus::Draft, Some(JobStatus::Completed))]
    #[case::partial(counts(3, 1, 0), JobStatus::Scheduled, Some(JobStatus::InProgress))]
    #[case::partial_already_in_progress(counts(3, 1, 1), JobStatus::InProgress, None)]
    #[case::nothing_processed(counts(3, 0, 0), JobStatus::Scheduled, None)]
    #[case::no_tasks(counts(0, 0, 0), JobStatus::Scheduled, None)]
    #[case::no_tasks_draft(counts(0, 0, 0), JobStatus::Draft, None)]
    fn next_status_follows_processed_counts(
        #[case] counts: JobCounts,
        #[case] current: JobStatus,
        #[case] expected: Option<JobStatus>,
    ) {
        assert_eq!(counts.next_status(current), expected);
    }

    #[test]
    fn job_serializes_counts_inline() {
        let job = Job::new(JobId::from_ulid(ulid::Ulid::new()), "spring", Utc::now());
        let v = serde_json::to_value(&job).unwrap();
        assert_eq!(v["status"], "draft");
        assert_eq!(v["total"], 0);
        assert_eq!(v["sent"], 0);
        assert_eq!(v["failed"], 0);
    }
}
