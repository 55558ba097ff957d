//! # Batch Tracker
//!
//! Owns the aggregate counters, derived metrics, and error aggregation for one
//! batch, and emits change notifications. The in-memory snapshot is
//! authoritative; every persistence call is best-effort and a store failure is
//! logged without blocking state progression.

use parking_lot::Mutex;
use std::sync::Arc;
use tracing::warn;

use super::sender::{ErrorCategory, SendResult};
use crate::error::Result;
use crate::events::{EventKind, EventPublisher};
use crate::models::{Batch, ErrorSample, MessageLog};
use crate::state_machine::{next_status, BatchEvent, BatchStatus};
use crate::storage::DispatchStore;

/// Aggregate state owner for a single batch.
pub struct BatchTracker {
    batch: Mutex<Batch>,
    store: Arc<dyn DispatchStore>,
    events: EventPublisher,
}

impl BatchTracker {
    pub fn new(batch: Batch, store: Arc<dyn DispatchStore>, events: EventPublisher) -> Self {
        Self {
            batch: Mutex::new(batch),
            store,
            events,
        }
    }

    pub fn batch_id(&self) -> uuid::Uuid {
        self.batch.lock().batch_id
    }

    /// Current in-memory snapshot.
    pub fn snapshot(&self) -> Batch {
        self.batch.lock().clone()
    }

    pub fn status(&self) -> BatchStatus {
        self.batch.lock().status
    }

    /// Transition pending → processing and record the start time.
    ///
    /// Idempotent: a batch already processing is returned unchanged so the
    /// dispatcher and coordinator can both call this safely.
    pub async fn start(&self) -> Result<Batch> {
        let snapshot = {
            let mut batch = self.batch.lock();
            if batch.status == BatchStatus::Processing {
                return Ok(batch.clone());
            }
            batch.status = next_status(batch.status, &BatchEvent::Start)?;
            if batch.started_at.is_none() {
                batch.started_at = Some(chrono::Utc::now());
            }
            batch.clone()
        };

        self.persist(&snapshot).await;
        self.emit_state(&snapshot);
        Ok(snapshot)
    }

    /// Transition processing → paused.
    pub async fn pause(&self) -> Result<Batch> {
        let snapshot = self.transition(&BatchEvent::Pause)?;
        self.persist(&snapshot).await;
        self.emit_state(&snapshot);
        Ok(snapshot)
    }

    /// Transition paused → processing.
    pub async fn resume(&self) -> Result<Batch> {
        let snapshot = self.transition(&BatchEvent::Resume)?;
        self.persist(&snapshot).await;
        self.emit_state(&snapshot);
        Ok(snapshot)
    }

    /// Move one message from pending into processing.
    pub fn start_processing_message(&self) {
        let mut batch = self.batch.lock();
        if batch.pending > 0 {
            batch.pending -= 1;
            batch.processing += 1;
        }
    }

    /// Return a deferred message from processing back to pending.
    pub fn defer_message(&self) {
        let mut batch = self.batch.lock();
        if batch.processing > 0 {
            batch.processing -= 1;
            batch.pending += 1;
        }
    }

    /// Fold one send outcome into the aggregate state.
    pub async fn record_result(&self, message: &MessageLog, result: &SendResult) {
        let snapshot = {
            let mut batch = self.batch.lock();
            if batch.processing > 0 {
                batch.processing -= 1;
            }

            match result {
                SendResult::Success { .. } => {
                    batch.completed += 1;
                    batch.credits_used += 1;
                }
                SendResult::Skipped { reason, .. } => {
                    batch.completed += 1;
                    batch.increment_error_count(&ErrorCategory::DuplicateSkip.to_string());
                    batch.last_error = Some(reason.to_string());
                }
                SendResult::Failed {
                    error, category, ..
                } => {
                    batch.failed += 1;
                    batch.increment_error_count(&category.to_string());
                    batch.last_error = Some(error.clone());
                    batch.push_error_sample(ErrorSample {
                        message_id: message.message_id,
                        phone: message.phone.clone(),
                        error: error.clone(),
                        category: category.to_string(),
                        recorded_at: chrono::Utc::now(),
                    });
                }
            }

            batch.update_metrics(chrono::Utc::now());
            batch.clone()
        };

        self.persist(&snapshot).await;
        self.emit_state(&snapshot);
    }

    /// Replace counters with a ground-truth recount from the store and
    /// refresh metrics.
    pub async fn apply_recount(
        &self,
        pending: i64,
        processing: i64,
        completed: i64,
        failed: i64,
    ) -> Batch {
        let snapshot = {
            let mut batch = self.batch.lock();
            batch.pending = pending;
            batch.processing = processing;
            batch.completed = completed;
            batch.failed = failed;
            batch.update_metrics(chrono::Utc::now());
            batch.clone()
        };

        self.persist(&snapshot).await;
        snapshot
    }

    /// Finalize as completed, persist the final snapshot, emit completion.
    pub async fn complete(&self) -> Result<Batch> {
        let snapshot = {
            let mut batch = self.batch.lock();
            batch.status = next_status(batch.status, &BatchEvent::Complete)?;
            batch.update_metrics(chrono::Utc::now());
            batch.clone()
        };

        self.persist(&snapshot).await;
        self.events.publish(
            EventKind::Complete,
            snapshot.batch_id,
            counters_payload(&snapshot),
        );
        Ok(snapshot)
    }

    /// Finalize as failed, persist, emit an error event.
    pub async fn fail(&self, error: &str) -> Result<Batch> {
        let snapshot = {
            let mut batch = self.batch.lock();
            batch.status = next_status(batch.status, &BatchEvent::Fail(error.to_string()))?;
            batch.last_error = Some(error.to_string());
            batch.clone()
        };

        self.persist(&snapshot).await;
        let mut payload = counters_payload(&snapshot);
        payload["error"] = serde_json::json!(error);
        self.events
            .publish(EventKind::Error, snapshot.batch_id, payload);
        Ok(snapshot)
    }

    /// Mark the batch cancelled (valid from any non-terminal state).
    pub async fn cancel(&self) -> Result<Batch> {
        let snapshot = self.transition(&BatchEvent::Cancel)?;
        self.persist(&snapshot).await;
        self.emit_state(&snapshot);
        Ok(snapshot)
    }

    fn transition(&self, event: &BatchEvent) -> Result<Batch> {
        let mut batch = self.batch.lock();
        batch.status = next_status(batch.status, event)?;
        Ok(batch.clone())
    }

    async fn persist(&self, snapshot: &Batch) {
        if let Err(err) = self.store.update_batch(snapshot).await {
            warn!(
                batch_id = %snapshot.batch_id,
                error = %err,
                "batch persistence failed; in-memory state remains authoritative"
            );
        }
    }

    fn emit_state(&self, snapshot: &Batch) {
        self.events.publish(
            EventKind::State,
            snapshot.batch_id,
            counters_payload(snapshot),
        );
    }
}

fn counters_payload(batch: &Batch) -> serde_json::Value {
    serde_json::json!({
        "status": batch.status,
        "total": batch.total,
        "pending": batch.pending,
        "processing": batch.processing,
        "completed": batch.completed,
        "failed": batch.failed,
        "messages_per_second": batch.messages_per_second,
        "success_rate": batch.success_rate,
        "credits_used": batch.credits_used,
    })
}
