//! App - the dispatch engine, built from the ports.
//!
//! # Components
//! - **Dispatcher**: one tick (claim -> send -> record -> reconcile), manual
//!   single-task trigger, stale recovery
//! - **Reconciler**: job counts and status from task-level data
//! - **Scheduler**: runs dispatcher ticks on a timer, with a stop signal
//! - **Intake**: job creation and task ingestion

pub mod config;
pub mod dispatcher;
pub mod intake;
pub mod reconciler;
pub mod scheduler;

pub use self::config::DispatchConfig;
pub use self::dispatcher::{Dispatcher, TickReport};
pub use self::intake::Intake;
pub use self::reconciler::{ReconcileReport, Reconciler};
pub use self::scheduler::{Scheduler, SchedulerHandle};
