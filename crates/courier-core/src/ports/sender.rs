//! MessageSender port - the send capability.

use async_trait::async_trait;

use crate::domain::Task;
use crate::error::SendError;

/// Attempts delivery of one task.
///
/// May take arbitrarily long and may fail for any reason. The dispatcher
/// treats an `Err` and a panic the same way: the task becomes `failed` with
/// the message as reason, and the tick moves on.
#[async_trait]
pub trait MessageSender: Send + Sync {
    async fn send(&self, task: &Task) -> Result<(), SendError>;
}
