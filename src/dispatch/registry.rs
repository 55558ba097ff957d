//! # Batch Registry
//!
//! In-memory index of live batches. Each entry owns the batch's runtime
//! state: the pending message queue, pause/run flags, per-batch credentials,
//! and the deferral ledger. Entries are evicted after the retention period,
//! after which batch state is served from the store only.

use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use uuid::Uuid;

use super::provider::AuthContext;
use super::rate_limiter::Priority;
use super::template::MessageTemplate;
use super::tracker::BatchTracker;
use crate::models::MessageLog;

/// Queue of not-yet-dispatched messages, deduplicated by message id.
#[derive(Default)]
struct MessageQueue {
    entries: VecDeque<MessageLog>,
    queued_ids: HashSet<Uuid>,
}

/// Runtime state for one live batch.
pub struct BatchRuntime {
    pub tracker: Arc<BatchTracker>,
    pub template: MessageTemplate,
    pub priority: Priority,
    queue: Mutex<MessageQueue>,
    running: AtomicBool,
    paused: AtomicBool,
    auth: Mutex<Option<AuthContext>>,
    deferred: Mutex<HashSet<Uuid>>,
}

impl BatchRuntime {
    pub fn new(tracker: Arc<BatchTracker>, template: MessageTemplate, priority: Priority) -> Self {
        Self {
            tracker,
            template,
            priority,
            queue: Mutex::new(MessageQueue::default()),
            running: AtomicBool::new(false),
            paused: AtomicBool::new(false),
            auth: Mutex::new(None),
            deferred: Mutex::new(HashSet::new()),
        }
    }

    pub fn batch_id(&self) -> Uuid {
        self.tracker.batch_id()
    }

    /// Append a message to the dispatch queue unless it is already queued.
    pub fn enqueue(&self, message: MessageLog) -> bool {
        let mut queue = self.queue.lock();
        if !queue.queued_ids.insert(message.message_id) {
            return false;
        }
        queue.entries.push_back(message);
        true
    }

    /// Take up to `n` messages off the front of the queue.
    pub fn dequeue_chunk(&self, n: usize) -> Vec<MessageLog> {
        let mut queue = self.queue.lock();
        let take = n.min(queue.entries.len());
        let chunk: Vec<MessageLog> = queue.entries.drain(..take).collect();
        for message in &chunk {
            queue.queued_ids.remove(&message.message_id);
        }
        chunk
    }

    pub fn queue_len(&self) -> usize {
        self.queue.lock().entries.len()
    }

    /// Discard everything still queued, returning the dropped messages.
    pub fn drain_queue(&self) -> Vec<MessageLog> {
        let mut queue = self.queue.lock();
        queue.queued_ids.clear();
        queue.entries.drain(..).collect()
    }

    /// Claim the run loop. Returns false when a run is already active.
    pub fn try_begin_run(&self) -> bool {
        !self.running.swap(true, Ordering::SeqCst)
    }

    pub fn end_run(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn set_paused(&self, paused: bool) {
        self.paused.store(paused, Ordering::SeqCst);
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    pub fn set_auth(&self, auth: Option<AuthContext>) {
        *self.auth.lock() = auth;
    }

    pub fn auth(&self) -> Option<AuthContext> {
        self.auth.lock().clone()
    }

    /// Record that a message was deferred; returns false if it already used
    /// its one deferral.
    pub fn mark_deferred(&self, message_id: Uuid) -> bool {
        self.deferred.lock().insert(message_id)
    }
}

/// Shared index of live batch runtimes.
#[derive(Clone, Default)]
pub struct BatchRegistry {
    batches: Arc<DashMap<Uuid, Arc<BatchRuntime>>>,
}

impl BatchRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, runtime: Arc<BatchRuntime>) {
        self.batches.insert(runtime.batch_id(), runtime);
    }

    pub fn get(&self, batch_id: Uuid) -> Option<Arc<BatchRuntime>> {
        self.batches.get(&batch_id).map(|entry| entry.value().clone())
    }

    pub fn remove(&self, batch_id: Uuid) -> Option<Arc<BatchRuntime>> {
        self.batches.remove(&batch_id).map(|(_, runtime)| runtime)
    }

    pub fn contains(&self, batch_id: Uuid) -> bool {
        self.batches.contains_key(&batch_id)
    }

    pub fn len(&self) -> usize {
        self.batches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.batches.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventPublisher;
    use crate::models::{Batch, NewBatch, NewMessage};
    use crate::storage::MemoryStore;

    fn runtime_with(total: i64) -> Arc<BatchRuntime> {
        let batch = Batch::new(NewBatch {
            template: "hi {{name}}".to_string(),
            priority: "normal".to_string(),
            total,
        });
        let tracker = Arc::new(BatchTracker::new(
            batch,
            Arc::new(MemoryStore::new()),
            EventPublisher::default(),
        ));
        Arc::new(BatchRuntime::new(
            tracker,
            MessageTemplate::new("hi {{name}}"),
            Priority::Normal,
        ))
    }

    fn message_for(runtime: &BatchRuntime) -> MessageLog {
        MessageLog::new(NewMessage {
            batch_id: runtime.batch_id(),
            phone: "15551234567".to_string(),
            variables: serde_json::json!({}),
        })
    }

    #[test]
    fn test_enqueue_deduplicates_by_id() {
        let runtime = runtime_with(2);
        let msg = message_for(&runtime);

        assert!(runtime.enqueue(msg.clone()));
        assert!(!runtime.enqueue(msg.clone()));
        assert_eq!(runtime.queue_len(), 1);

        // After a dequeue the same id may be enqueued again (deferral path)
        let chunk = runtime.dequeue_chunk(5);
        assert_eq!(chunk.len(), 1);
        assert!(runtime.enqueue(msg));
    }

    #[test]
    fn test_dequeue_chunk_preserves_order() {
        let runtime = runtime_with(3);
        let msgs: Vec<MessageLog> = (0..3).map(|_| message_for(&runtime)).collect();
        for msg in &msgs {
            runtime.enqueue(msg.clone());
        }

        let chunk = runtime.dequeue_chunk(2);
        assert_eq!(chunk[0].message_id, msgs[0].message_id);
        assert_eq!(chunk[1].message_id, msgs[1].message_id);
        assert_eq!(runtime.queue_len(), 1);
    }

    #[test]
    fn test_run_claim_is_exclusive() {
        let runtime = runtime_with(1);
        assert!(runtime.try_begin_run());
        assert!(!runtime.try_begin_run());
        runtime.end_run();
        assert!(runtime.try_begin_run());
    }

    #[test]
    fn test_deferral_is_single_use() {
        let runtime = runtime_with(1);
        let id = Uuid::new_v4();
        assert!(runtime.mark_deferred(id));
        assert!(!runtime.mark_deferred(id));
    }

    #[test]
    fn test_registry_insert_get_remove() {
        let registry = BatchRegistry::new();
        let runtime = runtime_with(1);
        let id = runtime.batch_id();

        registry.insert(runtime);
        assert!(registry.contains(id));
        assert_eq!(registry.len(), 1);

        let removed = registry.remove(id);
        assert!(removed.is_some());
        assert!(registry.is_empty());
        assert!(registry.get(id).is_none());
    }
}
