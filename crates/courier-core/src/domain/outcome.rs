//! Result of handing a task to the send capability.

use serde::{Deserialize, Serialize};

use super::task::TaskStatus;

/// Outcome of one send. Transient and permanent failures are not told apart;
/// either one makes the task terminally `failed`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SendOutcome {
    Sent,
    Failed { reason: String },
}

impl SendOutcome {
    pub fn failed(reason: impl Into<String>) -> Self {
        SendOutcome::Failed {
            reason: reason.into(),
        }
    }

    pub fn is_sent(&self) -> bool {
        matches!(self, SendOutcome::Sent)
    }

    /// Terminal task status this outcome records.
    pub fn status(&self) -> TaskStatus {
        match self {
            SendOutcome::Sent => TaskStatus::Sent,
            SendOutcome::Failed { .. } => TaskStatus::Failed,
        }
    }

    pub fn reason(&self) -> Option<&str> {
        match self {
            SendOutcome::Sent => None,
            SendOutcome::Failed { reason } => Some(reason),
        }
    }
}
