//! # Storage Layer
//!
//! Narrow persistent-store interface consumed by the engine: batch record
//! CRUD, bulk message insert, per-row message updates, and paginated message
//! queries. [`PgStore`] backs production deployments; [`MemoryStore`] backs
//! tests and embedded use.
//!
//! All engine-side calls are best-effort: a storage failure is logged by the
//! caller and never blocks in-memory state progression.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use uuid::Uuid;

use crate::models::{Batch, MessageLog};
use crate::state_machine::MessageStatus;

pub use memory::MemoryStore;
pub use postgres::PgStore;

/// Errors raised by store implementations.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("batch not found: {0}")]
    BatchNotFound(Uuid),

    #[error("duplicate batch: {0}")]
    DuplicateBatch(Uuid),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result alias for store operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Persistent store consumed by the dispatch engine.
#[async_trait]
pub trait DispatchStore: Send + Sync {
    /// Insert a new batch record; fails on duplicate id.
    async fn insert_batch(&self, batch: &Batch) -> StorageResult<()>;

    /// Replace the stored batch snapshot (status, counters, metrics).
    async fn update_batch(&self, batch: &Batch) -> StorageResult<()>;

    /// Fetch a batch by id.
    async fn fetch_batch(&self, batch_id: Uuid) -> StorageResult<Option<Batch>>;

    /// Bulk-insert message records at batch submission time.
    async fn insert_messages(&self, messages: &[MessageLog]) -> StorageResult<()>;

    /// Update a single message row.
    async fn update_message(&self, message: &MessageLog) -> StorageResult<()>;

    /// Paginated fetch of a batch's messages in creation order, optionally
    /// filtered by status.
    async fn fetch_messages(
        &self,
        batch_id: Uuid,
        status: Option<MessageStatus>,
        limit: i64,
        offset: i64,
    ) -> StorageResult<Vec<MessageLog>>;

    /// Mark every still-pending message of a batch as cancelled, returning
    /// the number of rows affected.
    async fn cancel_pending_messages(&self, batch_id: Uuid) -> StorageResult<u64>;
}
