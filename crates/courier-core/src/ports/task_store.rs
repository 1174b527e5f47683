//! TaskStore port - the source of truth for tasks and jobs.
//!
//! # Implementations
//! - `InMemoryTaskStore`: one process, atomicity from a single lock
//! - `SqliteTaskStore`: shared database file, atomicity from single statements

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::domain::{Job, JobCounts, JobId, JobStatus, SendOutcome, Task, TaskId, TaskStatus};
use crate::error::StoreError;

/// Task store contract.
///
/// # Design principles
/// - Every state transition is a single conditional update (compare-and-swap).
///   Concurrent dispatchers, in this process or another one, never both win.
/// - The store knows nothing about scheduling policy (batching, reconciliation).
/// - Soft-deleted tasks are invisible to claims and counts.
#[async_trait]
pub trait TaskStore: Send + Sync {
    // ---- dispatch ----

    /// Atomically pick the oldest-due `pending`, non-deleted task with
    /// `due_at <= now`, move it to `processing`, and return the snapshot taken
    /// before the update. `None` when nothing is due.
    async fn claim_next_due(&self, now: DateTime<Utc>) -> Result<Option<Task>, StoreError>;

    /// Atomically claim one specific task if it is `pending` or `failed` and
    /// not deleted, regardless of `due_at`. Returns the pre-update snapshot.
    async fn claim_task(
        &self,
        task_id: TaskId,
        now: DateTime<Utc>,
    ) -> Result<Option<Task>, StoreError>;

    /// Move a `processing` task to its terminal status. Returns `false` if the
    /// task was no longer `processing` (nothing is written then).
    async fn record_outcome(
        &self,
        task_id: TaskId,
        outcome: &SendOutcome,
        at: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    /// Put `processing` tasks claimed before `claimed_before` back to `pending`.
    async fn requeue_stale(&self, claimed_before: DateTime<Utc>) -> Result<u64, StoreError>;

    // ---- counts (reconciler) ----

    async fn count_by_status(&self, job_id: JobId, status: TaskStatus) -> Result<u64, StoreError>;

    async fn count_all(&self, job_id: JobId) -> Result<u64, StoreError>;

    // ---- jobs ----

    async fn insert_job(&self, job: &Job) -> Result<(), StoreError>;

    async fn get_job(&self, job_id: JobId) -> Result<Option<Job>, StoreError>;

    async fn jobs_with_status(&self, statuses: &[JobStatus]) -> Result<Vec<Job>, StoreError>;

    /// Overwrite the cached aggregates. Fails with `JobNotFound` for unknown jobs.
    async fn write_job_counts(
        &self,
        job_id: JobId,
        counts: JobCounts,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    /// Move a job from `from` to `to` only if it is still in `from`.
    async fn transition_job(
        &self,
        job_id: JobId,
        from: JobStatus,
        to: JobStatus,
        at: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    // ---- tasks (ingestion / admin) ----

    async fn insert_tasks(&self, tasks: &[Task]) -> Result<(), StoreError>;

    async fn get_task(&self, task_id: TaskId) -> Result<Option<Task>, StoreError>;

    /// Non-deleted tasks of a job, in `due_at` order.
    async fn list_tasks(&self, job_id: JobId) -> Result<Vec<Task>, StoreError>;

    /// Tombstone a task. Returns `false` if it was unknown or already deleted.
    async fn soft_delete_task(&self, task_id: TaskId) -> Result<bool, StoreError>;
}
