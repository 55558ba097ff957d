//! # Batch Coordinator
//!
//! Public entry point of the engine. Owns the shared components (registry,
//! scheduler, sender, completion detector, event publisher) and exposes the
//! batch lifecycle: create, start, pause, resume, cancel, plus state and
//! per-message result queries.
//!
//! Credentials are held in memory on the batch runtime and never persisted;
//! resuming a batch reuses the stored credentials or requires fresh ones.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use super::completion::CompletionDetector;
use super::dispatcher::Dispatcher;
use super::duplicate_guard::DuplicateGuard;
use super::provider::{AuthContext, MessageProvider};
use super::rate_limiter::{Priority, RateLimiter};
use super::registry::{BatchRegistry, BatchRuntime};
use super::scheduler::{TaskKey, TaskScheduler};
use super::sender::MessageSender;
use super::template::MessageTemplate;
use super::tracker::BatchTracker;
use crate::config::DispatchConfig;
use crate::error::{DispatchError, Result};
use crate::events::{DispatchEvent, EventPublisher};
use crate::models::{normalize_phone, Batch, MessageLog, NewBatch, NewMessage};
use crate::state_machine::MessageStatus;
use crate::storage::DispatchStore;

/// One recipient of a batch: a phone number plus template variables.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Recipient {
    pub phone: String,
    #[serde(default = "empty_object")]
    pub variables: serde_json::Value,
}

fn empty_object() -> serde_json::Value {
    serde_json::json!({})
}

/// Batch submission request.
#[derive(Debug, Clone, Default)]
pub struct CreateBatch {
    pub template: String,
    pub recipients: Vec<Recipient>,
    pub priority: Priority,
    /// Credentials for the provider; may also be supplied at start time.
    pub auth: Option<AuthContext>,
    /// Delay the first dispatch until this instant.
    pub scheduled_at: Option<DateTime<Utc>>,
    /// Begin dispatching immediately after creation (requires `auth`).
    pub auto_start: bool,
}

/// Batch lifecycle coordinator.
pub struct BatchCoordinator {
    store: Arc<dyn DispatchStore>,
    registry: BatchRegistry,
    scheduler: TaskScheduler,
    dispatcher: Dispatcher,
    events: EventPublisher,
    guard: Arc<DuplicateGuard>,
    config: DispatchConfig,
}

impl BatchCoordinator {
    /// Wire up an engine around a provider and a store.
    pub fn new(
        provider: Arc<dyn MessageProvider>,
        store: Arc<dyn DispatchStore>,
        config: DispatchConfig,
    ) -> Self {
        let registry = BatchRegistry::new();
        let scheduler = TaskScheduler::new();
        let events = EventPublisher::new(config.event_capacity);
        let guard = Arc::new(DuplicateGuard::new(config.duplicate_retention_days));
        let sender = Arc::new(MessageSender::new(
            provider,
            Arc::clone(&guard),
            config.retry.clone(),
        ));
        let completion = Arc::new(CompletionDetector::new(
            registry.clone(),
            scheduler.clone(),
            Arc::clone(&store),
            config.completion.check_delay(),
            config.completion.page_size,
        ));
        let dispatcher = Dispatcher::new(
            registry.clone(),
            scheduler.clone(),
            sender,
            RateLimiter::new(&config.rate_limits),
            Arc::clone(&store),
            completion,
            config.concurrency,
        );

        Self {
            store,
            registry,
            scheduler,
            dispatcher,
            events,
            guard,
            config,
        }
    }

    /// Validate and persist a batch with one message row per recipient, and
    /// register its runtime. Does not dispatch; call [`Self::start`] (or
    /// submit with `scheduled_at`).
    pub async fn create_batch(&self, request: CreateBatch) -> Result<Batch> {
        if request.template.trim().is_empty() {
            return Err(DispatchError::Validation(
                "template must not be empty".to_string(),
            ));
        }
        if request.recipients.is_empty() {
            return Err(DispatchError::Validation(
                "batch must have at least one recipient".to_string(),
            ));
        }
        if request.auto_start && request.auth.is_none() {
            return Err(DispatchError::AuthRequired);
        }

        let mut normalized = Vec::with_capacity(request.recipients.len());
        for recipient in &request.recipients {
            normalized.push((normalize_phone(&recipient.phone)?, &recipient.variables));
        }

        let batch = Batch::new(NewBatch {
            template: request.template.clone(),
            priority: request.priority.to_string(),
            total: normalized.len() as i64,
        });
        let batch_id = batch.batch_id;
        self.store
            .insert_batch(&batch)
            .await
            .map_err(|err| match err {
                crate::storage::StorageError::DuplicateBatch(id) => {
                    DispatchError::DuplicateBatch(id)
                }
                other => DispatchError::Storage(other),
            })?;

        let messages: Vec<MessageLog> = normalized
            .into_iter()
            .map(|(phone, variables)| {
                MessageLog::new(NewMessage {
                    batch_id,
                    phone,
                    variables: variables.clone(),
                })
            })
            .collect();
        self.store.insert_messages(&messages).await?;

        let tracker = Arc::new(BatchTracker::new(
            batch.clone(),
            Arc::clone(&self.store),
            self.events.clone(),
        ));
        let runtime = Arc::new(BatchRuntime::new(
            tracker,
            MessageTemplate::new(request.template),
            request.priority,
        ));
        runtime.set_auth(request.auth);
        for message in messages {
            runtime.enqueue(message);
        }
        self.registry.insert(Arc::clone(&runtime));

        self.schedule_eviction(batch_id);
        if let Some(at) = request.scheduled_at {
            self.schedule_start(batch_id, at);
        } else if request.auto_start {
            self.dispatcher.spawn_run(batch_id);
        }

        info!(
            batch_id = %batch_id,
            total = batch.total,
            priority = %request.priority,
            scheduled = request.scheduled_at.is_some(),
            "batch created"
        );
        Ok(batch)
    }

    /// Begin (or continue) dispatching a batch.
    ///
    /// Credentials supplied here replace any from submission; with neither,
    /// the start is rejected.
    pub async fn start(&self, batch_id: Uuid, auth: Option<AuthContext>) -> Result<Batch> {
        let runtime = self.runtime(batch_id)?;

        if let Some(auth) = auth {
            runtime.set_auth(Some(auth));
        }
        if runtime.auth().is_none() {
            return Err(DispatchError::AuthRequired);
        }

        runtime.set_paused(false);
        self.scheduler.cancel(&TaskKey::ScheduledStart(batch_id));
        self.dispatcher.spawn_run(batch_id);
        Ok(runtime.tracker.snapshot())
    }

    /// Pause dispatching at the next chunk boundary. In-flight sends finish;
    /// queued messages stay queued.
    ///
    /// A pending completion check is revoked; the drain after resume
    /// schedules a fresh one. Deferral timers keep running so deferred
    /// messages re-enter the queue, where the pause flag holds them.
    pub async fn pause(&self, batch_id: Uuid) -> Result<Batch> {
        let runtime = self.runtime(batch_id)?;
        runtime.set_paused(true);
        self.scheduler.cancel(&TaskKey::CompletionCheck(batch_id));
        let snapshot = runtime.tracker.pause().await?;
        info!(batch_id = %batch_id, queued = runtime.queue_len(), "batch paused");
        Ok(snapshot)
    }

    /// Resume a paused batch. Credentials supplied here replace the stored
    /// ones; with neither, the resume is rejected.
    pub async fn resume(&self, batch_id: Uuid, auth: Option<AuthContext>) -> Result<Batch> {
        let runtime = self.runtime(batch_id)?;

        if let Some(auth) = auth {
            runtime.set_auth(Some(auth));
        }
        if runtime.auth().is_none() {
            return Err(DispatchError::AuthRequired);
        }

        let snapshot = runtime.tracker.resume().await?;
        runtime.set_paused(false);
        self.dispatcher.spawn_run(batch_id);
        info!(batch_id = %batch_id, "batch resumed");
        Ok(snapshot)
    }

    /// Cancel a batch: revoke its timers, drop its queue, and mark every
    /// still-pending message cancelled.
    pub async fn cancel(&self, batch_id: Uuid) -> Result<Batch> {
        let runtime = self.runtime(batch_id)?;

        runtime.set_paused(true);
        let snapshot = runtime.tracker.cancel().await?;
        self.scheduler.cancel_batch(batch_id);

        let dropped = runtime.drain_queue();
        for mut message in dropped {
            message.mark_cancelled();
            if let Err(err) = self.store.update_message(&message).await {
                warn!(message_id = %message.message_id, error = %err, "cancel persistence failed");
            }
        }

        match self.store.cancel_pending_messages(batch_id).await {
            Ok(rows) => info!(batch_id = %batch_id, cancelled_rows = rows, "batch cancelled"),
            Err(err) => warn!(batch_id = %batch_id, error = %err, "cancel sweep failed"),
        }

        Ok(snapshot)
    }

    /// Current batch state: the live snapshot for resident batches, the
    /// stored record for evicted ones.
    pub async fn get_state(&self, batch_id: Uuid) -> Result<Batch> {
        if let Some(runtime) = self.registry.get(batch_id) {
            return Ok(runtime.tracker.snapshot());
        }
        self.store
            .fetch_batch(batch_id)
            .await?
            .ok_or(DispatchError::BatchNotFound(batch_id))
    }

    /// Paginated per-message results, optionally filtered by status.
    pub async fn get_results(
        &self,
        batch_id: Uuid,
        status: Option<MessageStatus>,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<MessageLog>> {
        Ok(self
            .store
            .fetch_messages(batch_id, status, limit, offset)
            .await?)
    }

    /// Subscribe to all engine events.
    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<DispatchEvent> {
        self.events.subscribe()
    }

    /// Subscribe to the events of a single batch.
    pub fn subscribe_batch(
        &self,
        batch_id: Uuid,
    ) -> tokio::sync::mpsc::UnboundedReceiver<DispatchEvent> {
        self.events.subscribe_batch(batch_id)
    }

    /// Replace the duplicate-suppression bypass allow-list.
    pub fn set_bypass_list<I: IntoIterator<Item = String>>(&self, phones: I) {
        self.guard.set_bypass_list(phones);
    }

    /// Engine configuration in effect.
    pub fn config(&self) -> &DispatchConfig {
        &self.config
    }

    fn runtime(&self, batch_id: Uuid) -> Result<Arc<BatchRuntime>> {
        self.registry
            .get(batch_id)
            .ok_or(DispatchError::BatchNotFound(batch_id))
    }

    fn schedule_eviction(&self, batch_id: Uuid) {
        let registry = self.registry.clone();
        let scheduler = self.scheduler.clone();
        self.scheduler.schedule(
            TaskKey::Eviction(batch_id),
            self.config.batch_retention(),
            async move {
                scheduler.cancel_batch(batch_id);
                if registry.remove(batch_id).is_some() {
                    info!(batch_id = %batch_id, "batch evicted from registry");
                }
            },
        );
    }

    fn schedule_start(&self, batch_id: Uuid, at: DateTime<Utc>) {
        let delay = (at - Utc::now())
            .to_std()
            .unwrap_or(std::time::Duration::ZERO);
        let dispatcher = self.dispatcher.clone();
        let registry = self.registry.clone();
        self.scheduler.schedule(
            TaskKey::ScheduledStart(batch_id),
            delay,
            async move {
                let Some(runtime) = registry.get(batch_id) else {
                    return;
                };
                if runtime.is_paused() {
                    return;
                }
                if runtime.auth().is_none() {
                    warn!(batch_id = %batch_id, "scheduled start skipped: no credentials");
                    return;
                }
                dispatcher.run(batch_id).await;
            },
        );
    }
}
