//! Impls - implementations of the ports.
//!
//! - **InMemoryTaskStore**: single process, tests and local runs
//! - **SqliteTaskStore**: durable, safe to share between dispatcher processes
//! - **LogSender**: development send capability that only logs

pub mod inmem_store;
pub mod log_sender;
pub mod sqlite_store;

#[cfg(test)]
pub(crate) mod contract;

pub use self::inmem_store::InMemoryTaskStore;
pub use self::log_sender::LogSender;
pub use self::sqlite_store::SqliteTaskStore;
