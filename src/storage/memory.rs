//! In-memory [`DispatchStore`] used by tests and embedded deployments.
//!
//! Preserves message insertion order per batch so paginated queries return
//! rows in creation order, matching the Postgres implementation. A fault
//! toggle lets tests exercise the engine's graceful degradation path.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use uuid::Uuid;

use super::{DispatchStore, StorageError, StorageResult};
use crate::models::{Batch, MessageLog};
use crate::state_machine::MessageStatus;

/// HashMap-backed store with per-batch ordered message lists.
#[derive(Default)]
pub struct MemoryStore {
    batches: Mutex<HashMap<Uuid, Batch>>,
    messages: Mutex<HashMap<Uuid, Vec<MessageLog>>>,
    fail_writes: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every write fail with a database error, to simulate an outage.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    fn check_writable(&self) -> StorageResult<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StorageError::Database(sqlx::Error::PoolClosed));
        }
        Ok(())
    }
}

#[async_trait]
impl DispatchStore for MemoryStore {
    async fn insert_batch(&self, batch: &Batch) -> StorageResult<()> {
        self.check_writable()?;
        let mut batches = self.batches.lock();
        if batches.contains_key(&batch.batch_id) {
            return Err(StorageError::DuplicateBatch(batch.batch_id));
        }
        batches.insert(batch.batch_id, batch.clone());
        Ok(())
    }

    async fn update_batch(&self, batch: &Batch) -> StorageResult<()> {
        self.check_writable()?;
        let mut batches = self.batches.lock();
        if !batches.contains_key(&batch.batch_id) {
            return Err(StorageError::BatchNotFound(batch.batch_id));
        }
        batches.insert(batch.batch_id, batch.clone());
        Ok(())
    }

    async fn fetch_batch(&self, batch_id: Uuid) -> StorageResult<Option<Batch>> {
        Ok(self.batches.lock().get(&batch_id).cloned())
    }

    async fn insert_messages(&self, messages: &[MessageLog]) -> StorageResult<()> {
        self.check_writable()?;
        let mut store = self.messages.lock();
        for message in messages {
            store
                .entry(message.batch_id)
                .or_default()
                .push(message.clone());
        }
        Ok(())
    }

    async fn update_message(&self, message: &MessageLog) -> StorageResult<()> {
        self.check_writable()?;
        let mut store = self.messages.lock();
        if let Some(rows) = store.get_mut(&message.batch_id) {
            if let Some(row) = rows.iter_mut().find(|m| m.message_id == message.message_id) {
                *row = message.clone();
            }
        }
        Ok(())
    }

    async fn fetch_messages(
        &self,
        batch_id: Uuid,
        status: Option<MessageStatus>,
        limit: i64,
        offset: i64,
    ) -> StorageResult<Vec<MessageLog>> {
        let store = self.messages.lock();
        let rows = store.get(&batch_id).map(Vec::as_slice).unwrap_or(&[]);

        let page = rows
            .iter()
            .filter(|m| status.map_or(true, |s| m.status == s))
            .skip(offset.max(0) as usize)
            .take(limit.max(0) as usize)
            .cloned()
            .collect();

        Ok(page)
    }

    async fn cancel_pending_messages(&self, batch_id: Uuid) -> StorageResult<u64> {
        self.check_writable()?;
        let mut store = self.messages.lock();
        let mut affected = 0;
        if let Some(rows) = store.get_mut(&batch_id) {
            for row in rows.iter_mut() {
                if row.status == MessageStatus::Pending {
                    row.mark_cancelled();
                    affected += 1;
                }
            }
        }
        Ok(affected)
    }
}
