//! Pure batch lifecycle transition table.
//!
//! Keeping the table free of side effects lets the tracker and coordinator
//! validate transitions before touching counters, storage, or events.

use super::events::BatchEvent;
use super::states::BatchStatus;
use crate::error::DispatchError;

/// Determine the target status for an event, or reject the transition.
///
/// Valid transitions:
/// - `Pending --Start--> Processing`
/// - `Processing --Pause--> Paused`
/// - `Paused --Resume--> Processing`
/// - `Processing --Complete--> Completed`
/// - `Pending | Processing | Paused --Fail--> Failed`
/// - any non-terminal `--Cancel--> Cancelled`
pub fn next_status(current: BatchStatus, event: &BatchEvent) -> Result<BatchStatus, DispatchError> {
    let target = match (current, event) {
        (BatchStatus::Pending, BatchEvent::Start) => BatchStatus::Processing,

        (BatchStatus::Processing, BatchEvent::Pause) => BatchStatus::Paused,
        (BatchStatus::Paused, BatchEvent::Resume) => BatchStatus::Processing,

        (BatchStatus::Processing, BatchEvent::Complete) => BatchStatus::Completed,

        (BatchStatus::Pending, BatchEvent::Fail(_))
        | (BatchStatus::Processing, BatchEvent::Fail(_))
        | (BatchStatus::Paused, BatchEvent::Fail(_)) => BatchStatus::Failed,

        (from, BatchEvent::Cancel) if !from.is_terminal() => BatchStatus::Cancelled,

        (from, event) => {
            return Err(DispatchError::InvalidTransition {
                from: from.to_string(),
                event: event.event_type().to_string(),
            })
        }
    };

    Ok(target)
}
