//! Scheduler - runs dispatcher ticks on a fixed period.
//!
//! Stopping only prevents new ticks. A tick that has started always runs to
//! the end (claims, sends, outcomes, reconciliation) before the loop exits.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use super::config::check_max;
use super::dispatcher::Dispatcher;
use crate::error::{ConfigError, CourierError};

pub struct Scheduler {
    dispatcher: Arc<Dispatcher>,
    period: Duration,
}

impl Scheduler {
    /// The period must be non-zero and at most one year.
    pub fn new(dispatcher: Arc<Dispatcher>, period: Duration) -> Result<Self, ConfigError> {
        if period.is_zero() {
            return Err(ConfigError::Zero {
                key: "tick_interval_secs",
            });
        }
        check_max("tick_interval_secs", period.as_secs())?;
        Ok(Self { dispatcher, period })
    }

    /// Period taken from the dispatcher's own config.
    pub fn from_config(dispatcher: Arc<Dispatcher>) -> Result<Self, ConfigError> {
        let secs = dispatcher.config().tick_interval_secs;
        Self::new(dispatcher, Duration::from_secs(secs))
    }

    /// Start the timer loop. The first tick fires one period from now.
    pub fn spawn(self) -> SchedulerHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let join = tokio::spawn(tick_loop(self.dispatcher, self.period, shutdown_rx));
        SchedulerHandle {
            shutdown_tx,
            join: Some(join),
        }
    }
}

/// Handle to a running scheduler.
/// - dropping it stops the loop after the current tick
/// - `shutdown_and_join()` waits for that tick
/// - `wait()` reports a loop that ended on its own (e.g. a panic in a tick)
pub struct SchedulerHandle {
    shutdown_tx: watch::Sender<bool>,
    // wait() で回収済みなら None
    join: Option<JoinHandle<()>>,
}

impl SchedulerHandle {
    /// Stop scheduling new ticks. Does not interrupt a running one.
    pub fn request_shutdown(&self) {
        // receiver may already be gone if the loop exited
        let _ = self.shutdown_tx.send(true);
    }

    pub async fn shutdown_and_join(self) {
        self.request_shutdown();
        let Some(join) = self.join else {
            return;
        };
        if let Err(e) = join.await {
            tracing::error!(error = %e, "scheduler loop ended abnormally");
        }
    }

    /// Resolves once the loop has ended. Ending without a shutdown request
    /// is an error. Cancel safe, so it can sit in a `select!` next to a
    /// signal handler.
    pub async fn wait(&mut self) -> Result<(), CourierError> {
        let Some(join) = self.join.as_mut() else {
            return Ok(());
        };
        let joined = join.await;
        self.join = None;

        match joined {
            Err(e) => {
                tracing::error!(error = %e, "scheduler loop died");
                Err(CourierError::SchedulerStopped(e.to_string()))
            }
            Ok(()) if !*self.shutdown_tx.borrow() => {
                tracing::error!("scheduler loop exited without a shutdown request");
                Err(CourierError::SchedulerStopped(
                    "exited without a shutdown request".to_string(),
                ))
            }
            Ok(()) => Ok(()),
        }
    }
}

async fn tick_loop(
    dispatcher: Arc<Dispatcher>,
    period: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut interval = tokio::time::interval_at(Instant::now() + period, period);
    // a tick that overruns the period does not cause a burst afterwards
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    tracing::info!(period_secs = period.as_secs_f64(), "scheduler started");

    loop {
        if *shutdown_rx.borrow() {
            break;
        }

        tokio::select! {
            changed = shutdown_rx.changed() => {
                if changed.is_err() {
                    // handle dropped
                    break;
                }
                continue;
            }
            _ = interval.tick() => {}
        }

        // outside the select: shutdown cannot cancel a tick halfway
        match dispatcher.run_tick().await {
            Ok(report) if report.claimed > 0 => {
                tracing::debug!(claimed = report.claimed, "scheduled tick finished")
            }
            Ok(_) => {}
            Err(e) => tracing::error!(error = %e, "tick aborted by store failure"),
        }
    }

    tracing::info!("scheduler stopped");
}
