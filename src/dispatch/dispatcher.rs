//! # Batch Dispatcher
//!
//! Drives one batch's message queue through the sender: dequeues chunks up to
//! the concurrency limit, paces dispatch starts by priority tier, sends the
//! chunk concurrently, then folds each outcome into the tracker and the store.
//!
//! A run is exclusive per batch; concurrent `run` calls for the same batch
//! collapse into one. Pausing stops the loop at the next chunk boundary;
//! in-flight sends finish and queued messages stay queued for resume.
//!
//! Rate limiting gets one second chance: a message that exhausted its retries
//! on HTTP 429 is deferred back to pending once, re-enqueued after the
//! cooldown, and redispatched. A second rate-limited exhaustion is final.

use std::sync::Arc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::completion::CompletionDetector;
use super::provider::AuthContext;
use super::rate_limiter::RateLimiter;
use super::registry::{BatchRegistry, BatchRuntime};
use super::scheduler::{TaskKey, TaskScheduler};
use super::sender::{ErrorCategory, MessageSender, SendResult};
use crate::models::MessageLog;
use crate::state_machine::BatchStatus;
use crate::storage::DispatchStore;

/// Per-batch dispatch loop, shared across the engine.
#[derive(Clone)]
pub struct Dispatcher {
    registry: BatchRegistry,
    scheduler: TaskScheduler,
    sender: Arc<MessageSender>,
    limiter: RateLimiter,
    store: Arc<dyn DispatchStore>,
    completion: Arc<CompletionDetector>,
    concurrency: usize,
}

impl Dispatcher {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        registry: BatchRegistry,
        scheduler: TaskScheduler,
        sender: Arc<MessageSender>,
        limiter: RateLimiter,
        store: Arc<dyn DispatchStore>,
        completion: Arc<CompletionDetector>,
        concurrency: usize,
    ) -> Self {
        Self {
            registry,
            scheduler,
            sender,
            limiter,
            store,
            completion,
            concurrency,
        }
    }

    /// Spawn a dispatch run for the batch on the runtime.
    pub fn spawn_run(&self, batch_id: Uuid) {
        let dispatcher = self.clone();
        tokio::spawn(async move {
            dispatcher.run(batch_id).await;
        });
    }

    /// Drain the batch's queue. Idempotent: a no-op when the batch is
    /// unknown, paused, finished, or already being drained.
    pub async fn run(&self, batch_id: Uuid) {
        let Some(runtime) = self.registry.get(batch_id) else {
            debug!(batch_id = %batch_id, "dispatch run for unknown batch ignored");
            return;
        };

        if !runtime.try_begin_run() {
            return;
        }

        let outcome = self.run_inner(&runtime).await;
        runtime.end_run();

        if let Err(err) = outcome {
            error!(batch_id = %batch_id, error = %err, "dispatch run aborted");
            let category = ErrorCategory::System.to_string();
            if let Err(fail_err) = runtime.tracker.fail(&format!("{category}: {err}")).await {
                warn!(batch_id = %batch_id, error = %fail_err, "could not mark batch failed");
            }
        }
    }

    async fn run_inner(&self, runtime: &Arc<BatchRuntime>) -> crate::error::Result<()> {
        match runtime.tracker.status() {
            BatchStatus::Pending => {
                runtime.tracker.start().await?;
            }
            BatchStatus::Processing => {}
            other => {
                debug!(
                    batch_id = %runtime.batch_id(),
                    status = %other,
                    "dispatch run skipped"
                );
                return Ok(());
            }
        }

        let Some(auth) = runtime.auth() else {
            warn!(batch_id = %runtime.batch_id(), "dispatch run without credentials skipped");
            return Ok(());
        };

        let pace = self.limiter.delay_for(runtime.priority);
        let mut dispatched: u64 = 0;

        loop {
            if runtime.is_paused() {
                info!(
                    batch_id = %runtime.batch_id(),
                    queued = runtime.queue_len(),
                    "dispatch run paused"
                );
                return Ok(());
            }

            let chunk = runtime.dequeue_chunk(self.concurrency);
            if chunk.is_empty() {
                break;
            }

            let mut in_flight = Vec::with_capacity(chunk.len());
            let mut handles = Vec::with_capacity(chunk.len());
            for mut message in chunk {
                // Pacing gap before every dispatch start except the first
                // of the run.
                if dispatched > 0 {
                    tokio::time::sleep(pace).await;
                }
                dispatched += 1;

                runtime.tracker.start_processing_message();
                message.mark_processing();
                self.persist_message(&message).await;

                in_flight.push(message.clone());
                handles.push(self.spawn_send(runtime, message, auth.clone()));
            }

            let joined = futures::future::join_all(handles).await;
            for (fallback, joined) in in_flight.into_iter().zip(joined) {
                match joined {
                    Ok((message, result)) => {
                        self.settle(runtime, message, result).await;
                    }
                    Err(join_err) => {
                        // A panicked send task must still settle its message
                        // or the batch can never finalize.
                        warn!(
                            batch_id = %runtime.batch_id(),
                            message_id = %fallback.message_id,
                            error = %join_err,
                            "send task panicked"
                        );
                        self.sender.release_reservation(
                            &fallback.phone,
                            &runtime.template,
                            &fallback.variables,
                        );
                        let result = SendResult::Failed {
                            error: format!("send task panicked: {join_err}"),
                            category: ErrorCategory::System,
                            underlying: None,
                            rate_limit: None,
                            attempts: 0,
                        };
                        self.settle(runtime, fallback, result).await;
                    }
                }
            }
        }

        info!(
            batch_id = %runtime.batch_id(),
            dispatched = dispatched,
            "dispatch run drained queue"
        );
        self.completion.schedule_check(runtime.batch_id());
        Ok(())
    }

    fn spawn_send(
        &self,
        runtime: &Arc<BatchRuntime>,
        message: MessageLog,
        auth: AuthContext,
    ) -> tokio::task::JoinHandle<(MessageLog, SendResult)> {
        let sender = Arc::clone(&self.sender);
        let template = runtime.template.clone();
        tokio::spawn(async move {
            let result = sender
                .send(&message.phone, &template, &message.variables, &auth)
                .await;
            (message, result)
        })
    }

    /// Fold one send outcome into the message row, the tracker, and (for a
    /// first rate-limited exhaustion) the deferral schedule.
    async fn settle(&self, runtime: &Arc<BatchRuntime>, mut message: MessageLog, result: SendResult) {
        match &result {
            SendResult::Success {
                provider_message_id,
                attempts,
                ..
            } => {
                message.mark_completed(Some(provider_message_id.clone()), *attempts as i32);
            }
            SendResult::Skipped { reason, .. } => {
                message.mark_skipped(
                    &reason.to_string(),
                    &ErrorCategory::DuplicateSkip.to_string(),
                );
            }
            SendResult::Failed {
                error,
                category,
                underlying,
                attempts,
                ..
            } => {
                let rate_limited = *category == ErrorCategory::RateLimit
                    || *underlying == Some(ErrorCategory::RateLimit);

                if rate_limited
                    && self.sender.policy().defer_on_rate_limit
                    && runtime.mark_deferred(message.message_id)
                {
                    self.defer(runtime, message, error).await;
                    return;
                }

                message.mark_failed(error, &category.to_string(), *attempts as i32);
            }
        }

        self.persist_message(&message).await;
        runtime.tracker.record_result(&message, &result).await;
    }

    /// Put a rate-limited message back into pending and schedule its
    /// re-enqueue after the cooldown.
    async fn defer(&self, runtime: &Arc<BatchRuntime>, mut message: MessageLog, error: &str) {
        info!(
            batch_id = %runtime.batch_id(),
            message_id = %message.message_id,
            "rate-limited message deferred"
        );

        message.mark_deferred(error);
        message.attempts = 0;
        self.persist_message(&message).await;
        runtime.tracker.defer_message();

        let key = TaskKey::Deferral {
            batch_id: runtime.batch_id(),
            message_id: message.message_id,
        };
        let cooldown = self.sender.policy().rate_limit_cooldown();
        let dispatcher = self.clone();
        let runtime = Arc::clone(runtime);

        self.scheduler.schedule(key, cooldown, async move {
            runtime.enqueue(message);
            if !runtime.is_paused() {
                // Spawned rather than awaited: awaiting would make this
                // future's type recursive through the run loop.
                dispatcher.spawn_run(runtime.batch_id());
            }
        });
    }

    async fn persist_message(&self, message: &MessageLog) {
        if let Err(err) = self.store.update_message(message).await {
            warn!(
                message_id = %message.message_id,
                error = %err,
                "message persistence failed"
            );
        }
    }
}
