//! # Task Scheduler
//!
//! Cancellable delayed-task abstraction keyed by batch/message id. Completion
//! polls, deferred re-enqueues, scheduled starts, and registry eviction all
//! run through here so that pausing or cancelling a batch can revoke its
//! outstanding timers deterministically instead of leaking them.

use dashmap::DashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::debug;
use uuid::Uuid;

/// Identity of a scheduled task.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TaskKey {
    /// Completion detector poll for a batch
    CompletionCheck(Uuid),
    /// Delayed start honoring a batch's schedule time
    ScheduledStart(Uuid),
    /// Re-enqueue of one deferred message
    Deferral { batch_id: Uuid, message_id: Uuid },
    /// In-memory registry eviction after the retention period
    Eviction(Uuid),
}

impl TaskKey {
    /// Batch this task belongs to.
    pub fn batch_id(&self) -> Uuid {
        match self {
            Self::CompletionCheck(id)
            | Self::ScheduledStart(id)
            | Self::Eviction(id) => *id,
            Self::Deferral { batch_id, .. } => *batch_id,
        }
    }

    /// Eviction timers survive pause/cancel; everything else is revocable.
    fn revocable_on_halt(&self) -> bool {
        !matches!(self, Self::Eviction(_))
    }
}

/// Delay queue of cancellable scheduled tasks.
#[derive(Clone, Default)]
pub struct TaskScheduler {
    tasks: Arc<DashMap<TaskKey, JoinHandle<()>>>,
}

impl TaskScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedule `fut` to run after `delay`, replacing (and aborting) any task
    /// already scheduled under the same key.
    pub fn schedule<F>(&self, key: TaskKey, delay: Duration, fut: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let tasks = Arc::clone(&self.tasks);
        let cleanup_key = key.clone();

        // The key is released before the body runs so a task may reschedule
        // itself under its own key without aborting itself.
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            tasks.remove(&cleanup_key);
            fut.await;
        });

        if let Some(previous) = self.tasks.insert(key, handle) {
            previous.abort();
        }
    }

    /// Cancel one scheduled task.
    pub fn cancel(&self, key: &TaskKey) {
        if let Some((_, handle)) = self.tasks.remove(key) {
            handle.abort();
        }
    }

    /// Cancel every revocable task belonging to a batch (deferred retries,
    /// completion checks, scheduled starts). Eviction timers are kept.
    pub fn cancel_batch(&self, batch_id: Uuid) {
        let keys: Vec<TaskKey> = self
            .tasks
            .iter()
            .filter(|entry| {
                entry.key().batch_id() == batch_id && entry.key().revocable_on_halt()
            })
            .map(|entry| entry.key().clone())
            .collect();

        for key in &keys {
            self.cancel(key);
        }

        if !keys.is_empty() {
            debug!(batch_id = %batch_id, revoked = keys.len(), "revoked scheduled tasks");
        }
    }

    /// Whether a task is currently scheduled under the key.
    pub fn is_scheduled(&self, key: &TaskKey) -> bool {
        self.tasks.contains_key(key)
    }

    /// Number of outstanding scheduled tasks.
    pub fn pending_count(&self) -> usize {
        self.tasks.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test(start_paused = true)]
    async fn test_scheduled_task_fires_after_delay() {
        let scheduler = TaskScheduler::new();
        let fired = Arc::new(AtomicU32::new(0));
        let batch_id = Uuid::new_v4();

        let fired_clone = fired.clone();
        scheduler.schedule(
            TaskKey::CompletionCheck(batch_id),
            Duration::from_secs(30),
            async move {
                fired_clone.fetch_add(1, Ordering::SeqCst);
            },
        );

        tokio::time::sleep(Duration::from_secs(29)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(scheduler.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_revokes_pending_task() {
        let scheduler = TaskScheduler::new();
        let fired = Arc::new(AtomicU32::new(0));
        let batch_id = Uuid::new_v4();
        let key = TaskKey::CompletionCheck(batch_id);

        let fired_clone = fired.clone();
        scheduler.schedule(key.clone(), Duration::from_secs(30), async move {
            fired_clone.fetch_add(1, Ordering::SeqCst);
        });

        scheduler.cancel(&key);
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_batch_keeps_eviction() {
        let scheduler = TaskScheduler::new();
        let batch_id = Uuid::new_v4();
        let fired = Arc::new(AtomicU32::new(0));

        for key in [
            TaskKey::CompletionCheck(batch_id),
            TaskKey::Deferral {
                batch_id,
                message_id: Uuid::new_v4(),
            },
            TaskKey::Eviction(batch_id),
        ] {
            let fired_clone = fired.clone();
            scheduler.schedule(key, Duration::from_secs(10), async move {
                fired_clone.fetch_add(1, Ordering::SeqCst);
            });
        }

        scheduler.cancel_batch(batch_id);
        assert_eq!(scheduler.pending_count(), 1);

        tokio::time::sleep(Duration::from_secs(20)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reschedule_replaces_previous_timer() {
        let scheduler = TaskScheduler::new();
        let fired = Arc::new(AtomicU32::new(0));
        let key = TaskKey::CompletionCheck(Uuid::new_v4());

        for _ in 0..2 {
            let fired_clone = fired.clone();
            scheduler.schedule(key.clone(), Duration::from_secs(30), async move {
                fired_clone.fetch_add(1, Ordering::SeqCst);
            });
        }

        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }
}
