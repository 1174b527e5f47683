//! Intake - the ingestion boundary.
//!
//! Creates jobs, adds and removes tasks. Never writes job counts itself; after
//! every change the job is recalculated through the reconciler.

use std::sync::Arc;

use super::reconciler::Reconciler;
use crate::domain::{Job, JobId, JobStatus, NewTask, Task, TaskId};
use crate::error::CourierError;
use crate::ports::{Clock, IdGenerator, TaskStore};

pub struct Intake {
    store: Arc<dyn TaskStore>,
    clock: Arc<dyn Clock>,
    ids: Arc<dyn IdGenerator>,
    reconciler: Reconciler,
}

impl Intake {
    pub fn new(store: Arc<dyn TaskStore>, clock: Arc<dyn Clock>, ids: Arc<dyn IdGenerator>) -> Self {
        let reconciler = Reconciler::new(Arc::clone(&store), Arc::clone(&clock));
        Self {
            store,
            clock,
            ids,
            reconciler,
        }
    }

    /// New empty job in `draft`.
    pub async fn create_job(&self, name: &str) -> Result<Job, CourierError> {
        let job = Job::new(self.ids.generate_job_id(), name, self.clock.now());
        self.store.insert_job(&job).await?;
        tracing::info!(job_id = %job.id, name, "job created");
        Ok(job)
    }

    /// Add `pending` tasks to a job.
    ///
    /// A `draft` job becomes `scheduled`. Jobs in any other status keep it;
    /// a `completed` job is not reopened.
    pub async fn add_tasks(
        &self,
        job_id: JobId,
        new_tasks: Vec<NewTask>,
    ) -> Result<Vec<Task>, CourierError> {
        let job = self
            .store
            .get_job(job_id)
            .await?
            .ok_or(CourierError::JobNotFound(job_id))?;
        if new_tasks.is_empty() {
            return Ok(Vec::new());
        }

        let now = self.clock.now();
        let tasks: Vec<Task> = new_tasks
            .into_iter()
            .map(|new| Task::new(self.ids.generate_task_id(), job_id, new, now))
            .collect();
        self.store.insert_tasks(&tasks).await?;
        tracing::info!(job_id = %job_id, added = tasks.len(), "tasks added");

        if job.status == JobStatus::Draft {
            self.store
                .transition_job(job_id, JobStatus::Draft, JobStatus::Scheduled, now)
                .await?;
        }
        self.reconciler.recalculate(job_id).await?;
        Ok(tasks)
    }

    /// Soft-delete a task. It stops being claimable and drops out of its
    /// job's counts.
    pub async fn remove_task(&self, task_id: TaskId) -> Result<Job, CourierError> {
        let task = self
            .store
            .get_task(task_id)
            .await?
            .filter(|t| !t.soft_deleted)
            .ok_or(CourierError::TaskNotFound(task_id))?;
        if !self.store.soft_delete_task(task_id).await? {
            return Err(CourierError::TaskNotFound(task_id));
        }
        tracing::info!(task_id = %task_id, job_id = %task.job_id, status = %task.status, "task removed");
        self.reconciler.recalculate(task.job_id).await
    }

    pub async fn get_job(&self, job_id: JobId) -> Result<Job, CourierError> {
        self.store
            .get_job(job_id)
            .await?
            .ok_or(CourierError::JobNotFound(job_id))
    }

    pub async fn get_task(&self, task_id: TaskId) -> Result<Task, CourierError> {
        self.store
            .get_task(task_id)
            .await?
            .ok_or(CourierError::TaskNotFound(task_id))
    }

    /// Live tasks of a job, oldest due first.
    pub async fn list_tasks(&self, job_id: JobId) -> Result<Vec<Task>, CourierError> {
        self.get_job(job_id).await?;
        Ok(self.store.list_tasks(job_id).await?)
    }
}
