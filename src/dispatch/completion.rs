//! # Completion Detector
//!
//! Asynchronous finalization of batches. Counter drift is possible while a
//! batch is in flight (deferred retries, store outages), so completion is
//! never declared from the live counters alone: a delayed check recounts
//! message statuses from the store page by page, reconciles the tracker, and
//! only finalizes when nothing is outstanding.
//!
//! A batch whose every message failed finalizes as `failed`; any delivered
//! message finalizes the batch as `completed`. Checks for paused batches are
//! skipped and not rescheduled; resuming triggers a fresh dispatch run which
//! schedules a new check.

use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::registry::{BatchRegistry, BatchRuntime};
use super::scheduler::{TaskKey, TaskScheduler};
use crate::state_machine::MessageStatus;
use crate::storage::DispatchStore;

/// Reconciled message-status counts for one batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatusCounts {
    pub pending: i64,
    pub processing: i64,
    pub completed: i64,
    pub failed: i64,
    pub cancelled: i64,
}

impl StatusCounts {
    pub fn outstanding(&self) -> i64 {
        self.pending + self.processing
    }
}

/// Delayed ground-truth completion checks.
pub struct CompletionDetector {
    registry: BatchRegistry,
    scheduler: TaskScheduler,
    store: Arc<dyn DispatchStore>,
    check_delay: Duration,
    page_size: i64,
}

impl CompletionDetector {
    pub fn new(
        registry: BatchRegistry,
        scheduler: TaskScheduler,
        store: Arc<dyn DispatchStore>,
        check_delay: Duration,
        page_size: i64,
    ) -> Self {
        Self {
            registry,
            scheduler,
            store,
            check_delay,
            page_size,
        }
    }

    /// Schedule a completion check after the configured delay, replacing any
    /// check already pending for the batch.
    pub fn schedule_check(self: &Arc<Self>, batch_id: Uuid) {
        let detector = Arc::clone(self);
        self.scheduler.schedule(
            TaskKey::CompletionCheck(batch_id),
            self.check_delay,
            async move {
                detector.run_check(batch_id).await;
            },
        );
    }

    /// Recount the batch from the store and finalize it if nothing remains
    /// outstanding.
    pub async fn run_check(self: &Arc<Self>, batch_id: Uuid) {
        let Some(runtime) = self.registry.get(batch_id) else {
            debug!(batch_id = %batch_id, "completion check for evicted batch skipped");
            return;
        };

        if runtime.is_paused() {
            debug!(batch_id = %batch_id, "completion check skipped while paused");
            return;
        }

        let counts = match self.recount(batch_id).await {
            Ok(counts) => counts,
            Err(err) => {
                // Store unreachable: trust the live counters for this round
                // and try again later.
                warn!(batch_id = %batch_id, error = %err, "completion recount failed");
                let snapshot = runtime.tracker.snapshot();
                StatusCounts {
                    pending: snapshot.pending,
                    processing: snapshot.processing,
                    completed: snapshot.completed,
                    failed: snapshot.failed,
                    cancelled: 0,
                }
            }
        };

        runtime
            .tracker
            .apply_recount(
                counts.pending,
                counts.processing,
                counts.completed,
                counts.failed,
            )
            .await;

        let settled =
            counts.outstanding() == 0 && runtime.queue_len() == 0 && !runtime.is_running();

        if settled {
            self.finalize(&runtime, &counts).await;
        } else {
            debug!(
                batch_id = %batch_id,
                outstanding = counts.outstanding(),
                queued = runtime.queue_len(),
                "batch not settled, rescheduling check"
            );
            self.schedule_check(batch_id);
        }
    }

    /// Page through the batch's messages and tally statuses.
    async fn recount(&self, batch_id: Uuid) -> crate::storage::StorageResult<StatusCounts> {
        let mut counts = StatusCounts::default();
        let mut offset: i64 = 0;

        loop {
            let page = self
                .store
                .fetch_messages(batch_id, None, self.page_size, offset)
                .await?;
            let fetched = page.len() as i64;

            for message in &page {
                match message.status {
                    MessageStatus::Pending => counts.pending += 1,
                    MessageStatus::Processing => counts.processing += 1,
                    MessageStatus::Completed => counts.completed += 1,
                    MessageStatus::Failed => counts.failed += 1,
                    MessageStatus::Cancelled => counts.cancelled += 1,
                }
            }

            if fetched < self.page_size {
                break;
            }
            offset += fetched;
        }

        Ok(counts)
    }

    async fn finalize(&self, runtime: &Arc<BatchRuntime>, counts: &StatusCounts) {
        let batch_id = runtime.batch_id();
        let all_failed = counts.completed == 0 && counts.failed > 0;

        let result = if all_failed {
            runtime.tracker.fail("all messages failed").await
        } else {
            runtime.tracker.complete().await
        };

        match result {
            Ok(snapshot) => {
                info!(
                    batch_id = %batch_id,
                    status = %snapshot.status,
                    completed = counts.completed,
                    failed = counts.failed,
                    success_rate = snapshot.success_rate,
                    "batch finalized"
                );
            }
            Err(err) => {
                // Already terminal (e.g. cancelled between check and now).
                debug!(batch_id = %batch_id, error = %err, "finalize transition rejected");
            }
        }
    }
}
