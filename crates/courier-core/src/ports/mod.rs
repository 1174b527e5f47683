//! Ports - the seams between the dispatch engine and the outside world.
//!
//! - `TaskStore`: tasks and jobs (source of truth)
//! - `MessageSender`: delivery of one task
//! - `Clock`, `IdGenerator`: time and identity, swappable in tests

pub mod clock;
pub mod id_generator;
pub mod sender;
pub mod task_store;

pub use self::clock::{Clock, FixedClock, SystemClock};
pub use self::id_generator::{IdGenerator, UlidGenerator};
pub use self::sender::MessageSender;
pub use self::task_store::TaskStore;
