//! Dispatcher - one tick of the dispatch algorithm.
//!
//! # Flow per tick
//! 1. `claim_next_due(now)` up to `batch_limit` times (pending -> processing);
//!    `now` is read once when the tick starts
//! 2. hand each claimed task to the sender
//! 3. `record_outcome` (processing -> sent | failed)
//! 4. reconcile active jobs once, whatever happened above
//!
//! A store error in steps 1-3 aborts the tick. A sender error or panic only
//! fails its task.

use std::any::Any;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use super::config::{DispatchConfig, MAX_DURATION_SECS};
use super::reconciler::{ReconcileReport, Reconciler};
use crate::domain::{SendOutcome, Task, TaskId, TaskStatus};
use crate::error::{ConfigError, CourierError, StoreError};
use crate::ports::{Clock, MessageSender, TaskStore};

/// What one tick did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TickReport {
    pub claimed: usize,
    pub sent: usize,
    pub failed: usize,

    /// `None` when the reconciliation pass itself failed.
    pub reconciled: Option<ReconcileReport>,
}

pub struct Dispatcher {
    store: Arc<dyn TaskStore>,
    sender: Arc<dyn MessageSender>,
    clock: Arc<dyn Clock>,
    reconciler: Reconciler,
    config: DispatchConfig,

    /// Ticks in this process run one at a time (timer and manual trigger alike).
    tick_lock: Mutex<()>,
}

impl Dispatcher {
    pub fn new(
        store: Arc<dyn TaskStore>,
        sender: Arc<dyn MessageSender>,
        clock: Arc<dyn Clock>,
        config: DispatchConfig,
    ) -> Self {
        let reconciler = Reconciler::new(Arc::clone(&store), Arc::clone(&clock));
        Self {
            store,
            sender,
            clock,
            reconciler,
            config,
            tick_lock: Mutex::new(()),
        }
    }

    pub fn config(&self) -> &DispatchConfig {
        &self.config
    }

    pub fn reconciler(&self) -> &Reconciler {
        &self.reconciler
    }

    /// Run one tick. Used by the timer loop and by the manual trigger alike.
    pub async fn run_tick(&self) -> Result<TickReport, StoreError> {
        let _guard = self.tick_lock.lock().await;
        let mut report = TickReport::default();
        // tick 開始時刻で固定: send 中に due になったタスクは次の tick に回す
        let now = self.clock.now();

        for _ in 0..self.config.batch_limit {
            let Some(task) = self.store.claim_next_due(now).await? else {
                break;
            };
            if report.claimed == 0 {
                tracing::info!("due tasks found, dispatching");
            }
            report.claimed += 1;

            if self.process_claimed(task).await?.is_sent() {
                report.sent += 1;
            } else {
                report.failed += 1;
            }
        }

        if report.claimed == 0 {
            tracing::debug!("no tasks due");
        } else {
            tracing::info!(
                claimed = report.claimed,
                sent = report.sent,
                failed = report.failed,
                batch_limit = self.config.batch_limit,
                "tick processed tasks"
            );
        }

        report.reconciled = match self.reconciler.reconcile_active().await {
            Ok(reconciled) => Some(reconciled),
            Err(e) => {
                tracing::error!(error = %e, "reconciliation failed, aggregates stay stale until next tick");
                None
            }
        };
        Ok(report)
    }

    /// Send one task right now, outside the timer.
    ///
    /// Accepts `pending` (due or not) and `failed` tasks; this is the manual
    /// retry path. The task's job is recalculated afterwards.
    pub async fn trigger_task(&self, task_id: TaskId) -> Result<Task, CourierError> {
        let current = self
            .store
            .get_task(task_id)
            .await?
            .filter(|t| !t.soft_deleted)
            .ok_or(CourierError::TaskNotFound(task_id))?;
        if matches!(current.status, TaskStatus::Sent | TaskStatus::Processing) {
            return Err(CourierError::NotTriggerable {
                task_id,
                status: current.status,
            });
        }

        let claimed = self
            .store
            .claim_task(task_id, self.clock.now())
            .await?
            .ok_or(CourierError::ClaimLost(task_id))?;
        let job_id = claimed.job_id;
        tracing::info!(task_id = %task_id, previous = %claimed.status, "manual send triggered");

        self.process_claimed(claimed).await?;
        self.reconciler.recalculate(job_id).await?;

        self.store
            .get_task(task_id)
            .await?
            .ok_or(CourierError::TaskNotFound(task_id))
    }

    /// Return `processing` tasks older than `stale_after` to `pending`.
    ///
    /// Never called by the timer loop: a crash mid-send leaves the task in
    /// `processing` until an operator runs this, and a requeued task may be
    /// delivered twice.
    pub async fn recover_stale(&self) -> Result<u64, CourierError> {
        let stale_after = self.config.stale_after()?;
        let cutoff = self
            .clock
            .now()
            .checked_sub_signed(stale_after)
            .ok_or(ConfigError::TooLarge {
                key: "stale_after_secs",
                max: MAX_DURATION_SECS,
                value: self.config.stale_after_secs,
            })?;
        let requeued = self.store.requeue_stale(cutoff).await?;
        if requeued > 0 {
            tracing::warn!(requeued, %cutoff, "stale processing tasks returned to pending");
        }
        Ok(requeued)
    }

    /// Send a task this dispatcher holds the claim for, then record the result.
    async fn process_claimed(&self, task: Task) -> Result<SendOutcome, StoreError> {
        let task_id = task.id;
        tracing::debug!(task_id = %task_id, job_id = %task.job_id, due_at = %task.due_at, "task claimed");

        let outcome = self.send(task).await;
        match &outcome {
            SendOutcome::Sent => tracing::debug!(task_id = %task_id, "task sent"),
            SendOutcome::Failed { reason } => {
                tracing::warn!(task_id = %task_id, reason = %reason, "task failed")
            }
        }

        let recorded = self
            .store
            .record_outcome(task_id, &outcome, self.clock.now())
            .await?;
        if !recorded {
            tracing::warn!(task_id = %task_id, "task left processing before its outcome was recorded");
        }
        Ok(outcome)
    }

    /// Run the sender on its own task so a panic stays contained, bounded by
    /// the configured timeout.
    async fn send(&self, task: Task) -> SendOutcome {
        let sender = Arc::clone(&self.sender);
        let mut handle = tokio::spawn(async move { sender.send(&task).await });

        let joined = match self.config.send_timeout() {
            Some(limit) => match tokio::time::timeout(limit, &mut handle).await {
                Ok(joined) => joined,
                Err(_) => {
                    handle.abort();
                    return SendOutcome::failed(timeout_reason(limit));
                }
            },
            None => handle.await,
        };

        match joined {
            Ok(Ok(())) => SendOutcome::Sent,
            Ok(Err(e)) => SendOutcome::failed(e.reason),
            Err(e) if e.is_panic() => SendOutcome::failed(panic_message(e.into_panic())),
            Err(e) => SendOutcome::failed(format!("send aborted: {e}")),
        }
    }
}

fn timeout_reason(limit: Duration) -> String {
    format!("send timed out after {}s", limit.as_secs())
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "sender panicked".to_string()
    }
}
