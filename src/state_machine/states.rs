use serde::{Deserialize, Serialize};
use std::fmt;

/// Batch lifecycle states.
///
/// A batch advances monotonically except for the pause/resume cycle;
/// `Completed`, `Failed` and `Cancelled` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(type_name = "batch_status", rename_all = "snake_case")]
pub enum BatchStatus {
    /// Initial state when the batch is created
    Pending,
    /// The dispatcher is draining the batch queue
    Processing,
    /// Dispatch suspended between chunks; queue left intact
    Paused,
    /// All messages reached a terminal state, at least one succeeded
    Completed,
    /// Batch failed (every message failed, or a system-level dispatch error)
    Failed,
    /// Batch was cancelled by the caller
    Cancelled,
}

impl BatchStatus {
    /// Check if this is a terminal state (no further transitions allowed)
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Check if this is an active state (the batch is being processed)
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Processing)
    }
}

impl fmt::Display for BatchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Processing => write!(f, "processing"),
            Self::Paused => write!(f, "paused"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl std::str::FromStr for BatchStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "processing" => Ok(Self::Processing),
            "paused" => Ok(Self::Paused),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            _ => Err(format!("Invalid batch status: {s}")),
        }
    }
}

impl Default for BatchStatus {
    fn default() -> Self {
        Self::Pending
    }
}

/// Per-message states within a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(type_name = "message_status", rename_all = "snake_case")]
pub enum MessageStatus {
    /// Queued, not yet picked up by a worker
    Pending,
    /// A worker is attempting delivery
    Processing,
    /// Delivered (or suppressed as a duplicate of a delivered message)
    Completed,
    /// All attempts exhausted or a permanent error occurred
    Failed,
    /// Cancelled before dispatch
    Cancelled,
}

impl MessageStatus {
    /// Check if this is a terminal state (the record becomes immutable)
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Check if this message still counts toward batch completion
    pub fn is_outstanding(&self) -> bool {
        matches!(self, Self::Pending | Self::Processing)
    }
}

impl fmt::Display for MessageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Processing => write!(f, "processing"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl std::str::FromStr for MessageStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "processing" => Ok(Self::Processing),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            _ => Err(format!("Invalid message status: {s}")),
        }
    }
}

impl Default for MessageStatus {
    fn default() -> Self {
        Self::Pending
    }
}
