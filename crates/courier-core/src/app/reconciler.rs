//! Reconciler - recomputes job aggregates from task-level data.
//!
//! Job counts are a cache. Every pass overwrites them with fresh counts, so
//! any drift heals on the next tick; job status follows from the counts.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::domain::{Job, JobCounts, JobId, JobStatus, TaskStatus};
use crate::error::{CourierError, StoreError};
use crate::ports::{Clock, TaskStore};

/// What one reconciliation pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconcileReport {
    pub jobs: usize,
    pub completed: Vec<JobId>,
    pub started: Vec<JobId>,
}

pub struct Reconciler {
    store: Arc<dyn TaskStore>,
    clock: Arc<dyn Clock>,
}

impl Reconciler {
    pub fn new(store: Arc<dyn TaskStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// Fresh counts for one job, from non-deleted tasks.
    pub async fn count(&self, job_id: JobId) -> Result<JobCounts, StoreError> {
        Ok(JobCounts {
            sent: self.store.count_by_status(job_id, TaskStatus::Sent).await?,
            failed: self.store.count_by_status(job_id, TaskStatus::Failed).await?,
            total: self.store.count_all(job_id).await?,
        })
    }

    /// Reconcile every `draft`, `scheduled` and `in_progress` job.
    /// `completed` and `paused` jobs are never reopened.
    pub async fn reconcile_active(&self) -> Result<ReconcileReport, StoreError> {
        let jobs = self.store.jobs_with_status(&JobStatus::ACTIVE).await?;
        let mut report = ReconcileReport {
            jobs: jobs.len(),
            ..ReconcileReport::default()
        };
        for job in &jobs {
            match self.reconcile_job(job).await? {
                Some(JobStatus::Completed) => report.completed.push(job.id),
                Some(JobStatus::InProgress) => report.started.push(job.id),
                _ => {}
            }
        }
        Ok(report)
    }

    /// On-demand pass for one job, independent of the timer.
    ///
    /// Counts are refreshed whatever the job's status; the status itself only
    /// moves for active jobs, same as in the periodic pass.
    pub async fn recalculate(&self, job_id: JobId) -> Result<Job, CourierError> {
        let job = self
            .store
            .get_job(job_id)
            .await?
            .ok_or(CourierError::JobNotFound(job_id))?;
        if job.status.is_active() {
            self.reconcile_job(&job).await?;
        } else {
            let counts = self.count(job_id).await?;
            self.store
                .write_job_counts(job_id, counts, self.clock.now())
                .await?;
        }
        let job = self
            .store
            .get_job(job_id)
            .await?
            .ok_or(CourierError::JobNotFound(job_id))?;
        tracing::info!(
            job_id = %job.id,
            status = %job.status,
            total = job.counts.total,
            sent = job.counts.sent,
            failed = job.counts.failed,
            "job recalculated"
        );
        Ok(job)
    }

    /// Returns the status the job moved to, if it moved.
    async fn reconcile_job(&self, job: &Job) -> Result<Option<JobStatus>, StoreError> {
        let counts = self.count(job.id).await?;
        let now = self.clock.now();

        self.store.write_job_counts(job.id, counts, now).await?;
        if counts != job.counts {
            tracing::debug!(
                job_id = %job.id,
                cached = ?job.counts,
                fresh = ?counts,
                "job counts refreshed"
            );
        }

        let Some(next) = counts.next_status(job.status) else {
            return Ok(None);
        };
        // Conditional, so a pause that landed since the read is not overwritten.
        if !self
            .store
            .transition_job(job.id, job.status, next, now)
            .await?
        {
            tracing::debug!(job_id = %job.id, from = %job.status, "job status changed underneath, skipped");
            return Ok(None);
        }
        match next {
            JobStatus::Completed => tracing::info!(
                job_id = %job.id,
                name = %job.name,
                sent = counts.sent,
                failed = counts.failed,
                "job completed"
            ),
            _ => tracing::info!(job_id = %job.id, from = %job.status, to = %next, "job status changed"),
        }
        Ok(Some(next))
    }
}
