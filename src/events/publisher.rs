use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use tokio::sync::{broadcast, mpsc};
use uuid::Uuid;

/// Kinds of lifecycle events the engine emits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// Counter or status change on a batch
    State,
    /// Batch-level error
    Error,
    /// Terminal completion of a batch
    Complete,
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::State => write!(f, "state"),
            Self::Error => write!(f, "error"),
            Self::Complete => write!(f, "complete"),
        }
    }
}

/// Event that has been published
#[derive(Debug, Clone)]
pub struct DispatchEvent {
    pub kind: EventKind,
    pub batch_id: Uuid,
    pub payload: Value,
    pub published_at: chrono::DateTime<chrono::Utc>,
}

/// Best-effort event publisher for batch lifecycle events.
///
/// Delivery is non-blocking relative to dispatch: a full or subscriber-less
/// channel never stalls the engine.
#[derive(Debug, Clone)]
pub struct EventPublisher {
    sender: broadcast::Sender<DispatchEvent>,
}

impl EventPublisher {
    /// Create a new event publisher with the specified channel capacity
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publish an event for a batch.
    pub fn publish(&self, kind: EventKind, batch_id: Uuid, payload: Value) {
        let event = DispatchEvent {
            kind,
            batch_id,
            payload,
            published_at: chrono::Utc::now(),
        };

        // send() errors only when there are no subscribers, which is fine:
        // events are best-effort.
        let _ = self.sender.send(event);
    }

    /// Subscribe to all events
    pub fn subscribe(&self) -> broadcast::Receiver<DispatchEvent> {
        self.sender.subscribe()
    }

    /// Subscribe to the events of a single batch.
    ///
    /// Spawns a forwarding task that filters the broadcast stream; the task
    /// exits when either side is dropped.
    pub fn subscribe_batch(&self, batch_id: Uuid) -> mpsc::UnboundedReceiver<DispatchEvent> {
        let mut upstream = self.sender.subscribe();
        let (tx, rx) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            loop {
                match upstream.recv().await {
                    Ok(event) if event.batch_id == batch_id => {
                        if tx.send(event).is_err() {
                            break;
                        }
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(_)) => {}
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        rx
    }

    /// Get the number of active subscribers
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventPublisher {
    fn default() -> Self {
        Self::new(crate::constants::DEFAULT_EVENT_CAPACITY)
    }
}

/// Error types for event publishing
#[derive(Debug, thiserror::Error)]
pub enum PublishError {
    #[error("Event channel is closed")]
    ChannelClosed,
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
