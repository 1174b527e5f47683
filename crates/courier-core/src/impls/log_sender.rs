//! LogSender - development send capability.
//!
//! Writes the delivery to the log instead of a mail transport. Destinations
//! that do not look like an address are refused, so the failure path can be
//! exercised end to end without a real transport.

use async_trait::async_trait;

use crate::domain::Task;
use crate::error::SendError;
use crate::ports::MessageSender;

#[derive(Debug, Clone, Copy, Default)]
pub struct LogSender;

impl LogSender {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl MessageSender for LogSender {
    async fn send(&self, task: &Task) -> Result<(), SendError> {
        let destination = task.payload.destination.trim();
        if !destination.contains('@') {
            return Err(SendError::new(format!(
                "invalid destination: {destination:?}"
            )));
        }
        tracing::info!(
            task_id = %task.id,
            job_id = %task.job_id,
            destination,
            bytes = task.payload.message.len(),
            "message delivered (log only)"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{JobId, NewTask, Payload, TaskId};
    use chrono::Utc;
    use ulid::Ulid;

    fn task_to(destination: &str) -> Task {
        Task::new(
            TaskId::from_ulid(Ulid::new()),
            JobId::from_ulid(Ulid::new()),
            NewTask::new(Payload::new(destination, "hi"), Utc::now()),
            Utc::now(),
        )
    }

    #[tokio::test]
    async fn accepts_addresses_and_refuses_the_rest() {
        let sender = LogSender::new();
        assert!(sender.send(&task_to("ana@example.com")).await.is_ok());

        let err = sender.send(&task_to("not-an-address")).await.unwrap_err();
        assert!(err.reason.contains("invalid destination"));
    }
}
