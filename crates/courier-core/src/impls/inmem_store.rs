//! In-memory task store.
//!
//! All state lives behind one tokio mutex; every trait method takes the lock
//! once and does its whole read-check-write under it, which is what makes
//! `claim_next_due` atomic here.

use std::collections::{BTreeSet, HashMap};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use crate::domain::{Job, JobCounts, JobId, JobStatus, SendOutcome, Task, TaskId, TaskStatus};
use crate::error::StoreError;
use crate::ports::TaskStore;

/// Pending-index entry. Ordered by due time, ties broken by id (ULIDs sort
/// by creation time, so equal due times stay FIFO).
type DueKey = (DateTime<Utc>, TaskId);

#[derive(Default)]
struct InMemoryState {
    /// All job records (single source of truth for jobs).
    jobs: HashMap<JobId, Job>,

    /// All task records (single source of truth for tasks).
    tasks: HashMap<TaskId, Task>,

    /// Claimable tasks only: pending and not deleted.
    pending: BTreeSet<DueKey>,
}

impl InMemoryState {
    fn index(&mut self, task: &Task) {
        if task.status == TaskStatus::Pending && !task.soft_deleted {
            self.pending.insert((task.due_at, task.id));
        }
    }

    fn unindex(&mut self, task: &Task) {
        self.pending.remove(&(task.due_at, task.id));
    }

    fn start_claim(&mut self, task_id: TaskId, now: DateTime<Utc>) -> Option<Task> {
        let record = self.tasks.get_mut(&task_id)?;
        let snapshot = record.clone();
        record.status = TaskStatus::Processing;
        record.claimed_at = Some(now);
        self.pending.remove(&(snapshot.due_at, snapshot.id));
        Some(snapshot)
    }

    fn live_tasks(&self, job_id: JobId) -> impl Iterator<Item = &Task> {
        self.tasks
            .values()
            .filter(move |t| t.job_id == job_id && !t.soft_deleted)
    }
}

/// In-memory `TaskStore`. Cheap to construct; meant for tests and for
/// running the engine without a database.
#[derive(Default)]
pub struct InMemoryTaskStore {
    state: Mutex<InMemoryState>,
}

impl InMemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Overwrite a job's cached counts without going through the reconciler.
    #[cfg(test)]
    pub(crate) async fn corrupt_counts(&self, job_id: JobId, counts: JobCounts) {
        let mut state = self.state.lock().await;
        if let Some(job) = state.jobs.get_mut(&job_id) {
            job.counts = counts;
        }
    }
}

#[async_trait]
impl TaskStore for InMemoryTaskStore {
    async fn claim_next_due(&self, now: DateTime<Utc>) -> Result<Option<Task>, StoreError> {
        let mut state = self.state.lock().await;
        let Some(&(due_at, task_id)) = state.pending.first() else {
            return Ok(None);
        };
        if due_at > now {
            return Ok(None);
        }
        Ok(state.start_claim(task_id, now))
    }

    async fn claim_task(
        &self,
        task_id: TaskId,
        now: DateTime<Utc>,
    ) -> Result<Option<Task>, StoreError> {
        let mut state = self.state.lock().await;
        let claimable = state.tasks.get(&task_id).is_some_and(|t| {
            !t.soft_deleted && matches!(t.status, TaskStatus::Pending | TaskStatus::Failed)
        });
        if !claimable {
            return Ok(None);
        }
        Ok(state.start_claim(task_id, now))
    }

    async fn record_outcome(
        &self,
        task_id: TaskId,
        outcome: &SendOutcome,
        at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let mut state = self.state.lock().await;
        let Some(record) = state.tasks.get_mut(&task_id) else {
            return Ok(false);
        };
        if record.status != TaskStatus::Processing {
            return Ok(false);
        }
        record.status = outcome.status();
        record.completed_at = Some(at);
        record.failure_reason = outcome.reason().map(str::to_string);
        Ok(true)
    }

    async fn requeue_stale(&self, claimed_before: DateTime<Utc>) -> Result<u64, StoreError> {
        let mut state = self.state.lock().await;
        let mut requeued = Vec::new();
        for task in state.tasks.values_mut() {
            let stale = task.status == TaskStatus::Processing
                && task.claimed_at.is_some_and(|at| at < claimed_before);
            if stale {
                task.status = TaskStatus::Pending;
                task.claimed_at = None;
                requeued.push(task.clone());
            }
        }
        for task in &requeued {
            state.index(task);
        }
        Ok(requeued.len() as u64)
    }

    async fn count_by_status(&self, job_id: JobId, status: TaskStatus) -> Result<u64, StoreError> {
        let state = self.state.lock().await;
        Ok(state.live_tasks(job_id).filter(|t| t.status == status).count() as u64)
    }

    async fn count_all(&self, job_id: JobId) -> Result<u64, StoreError> {
        let state = self.state.lock().await;
        Ok(state.live_tasks(job_id).count() as u64)
    }

    async fn insert_job(&self, job: &Job) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        state.jobs.insert(job.id, job.clone());
        Ok(())
    }

    async fn get_job(&self, job_id: JobId) -> Result<Option<Job>, StoreError> {
        let state = self.state.lock().await;
        Ok(state.jobs.get(&job_id).cloned())
    }

    async fn jobs_with_status(&self, statuses: &[JobStatus]) -> Result<Vec<Job>, StoreError> {
        let state = self.state.lock().await;
        let mut jobs: Vec<Job> = state
            .jobs
            .values()
            .filter(|j| statuses.contains(&j.status))
            .cloned()
            .collect();
        jobs.sort_by_key(|j| j.id);
        Ok(jobs)
    }

    async fn write_job_counts(
        &self,
        job_id: JobId,
        counts: JobCounts,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        let job = state
            .jobs
            .get_mut(&job_id)
            .ok_or(StoreError::JobNotFound(job_id))?;
        job.counts = counts;
        job.updated_at = at;
        Ok(())
    }

    async fn transition_job(
        &self,
        job_id: JobId,
        from: JobStatus,
        to: JobStatus,
        at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let mut state = self.state.lock().await;
        match state.jobs.get_mut(&job_id) {
            Some(job) if job.status == from => {
                job.status = to;
                job.updated_at = at;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn insert_tasks(&self, tasks: &[Task]) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        // 1件でも親 job が無ければ何も入れない (SQLite の FK と同じ挙動)
        if let Some(orphan) = tasks.iter().find(|t| !state.jobs.contains_key(&t.job_id)) {
            return Err(StoreError::JobNotFound(orphan.job_id));
        }
        for task in tasks {
            if let Some(previous) = state.tasks.insert(task.id, task.clone()) {
                state.unindex(&previous);
            }
            state.index(task);
        }
        Ok(())
    }

    async fn get_task(&self, task_id: TaskId) -> Result<Option<Task>, StoreError> {
        let state = self.state.lock().await;
        Ok(state.tasks.get(&task_id).cloned())
    }

    async fn list_tasks(&self, job_id: JobId) -> Result<Vec<Task>, StoreError> {
        let state = self.state.lock().await;
        let mut tasks: Vec<Task> = state.live_tasks(job_id).cloned().collect();
        tasks.sort_by_key(|t| (t.due_at, t.id));
        Ok(tasks)
    }

    async fn soft_delete_task(&self, task_id: TaskId) -> Result<bool, StoreError> {
        let mut state = self.state.lock().await;
        let Some(task) = state.tasks.get_mut(&task_id) else {
            return Ok(false);
        };
        if task.soft_deleted {
            return Ok(false);
        }
        task.soft_deleted = true;
        let snapshot = task.clone();
        state.unindex(&snapshot);
        Ok(true)
    }
}
