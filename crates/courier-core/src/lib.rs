//! courier-core
//!
//! Periodic dispatch of scheduled message tasks, and upkeep of the job
//! aggregates they roll up into.
//!
//! # Modules
//! - **domain**: tasks, jobs, IDs, send outcomes
//! - **ports**: `TaskStore`, `MessageSender`, `Clock`, `IdGenerator`
//! - **impls**: in-memory and SQLite stores, a log-only sender
//! - **app**: dispatcher, reconciler, scheduler, intake
//!
//! Everything is wired by the caller; there is no global state.

pub mod app;
pub mod domain;
pub mod error;
pub mod impls;
pub mod ports;

pub use app::{DispatchConfig, Dispatcher, Intake, Reconciler, Scheduler, SchedulerHandle};
pub use error::{ConfigError, CourierError, SendError, StoreError};
