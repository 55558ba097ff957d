use serde::{Deserialize, Serialize};

/// Events that can trigger batch state transitions
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum BatchEvent {
    /// Start processing the batch
    Start,
    /// Suspend dispatch between chunks
    Pause,
    /// Resume a paused batch
    Resume,
    /// Mark the batch as completed
    Complete,
    /// Mark the batch as failed with an error message
    Fail(String),
    /// Cancel the batch
    Cancel,
}

impl BatchEvent {
    /// Get a string representation of the event type for logging
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Pause => "pause",
            Self::Resume => "resume",
            Self::Complete => "complete",
            Self::Fail(_) => "fail",
            Self::Cancel => "cancel",
        }
    }

    /// Extract error message if this is a failure event
    pub fn error_message(&self) -> Option<&str> {
        match self {
            Self::Fail(msg) => Some(msg),
            _ => None,
        }
    }

    /// Check if this event represents a terminal transition
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete | Self::Fail(_) | Self::Cancel)
    }
}
