//! PostgreSQL-backed [`DispatchStore`].
//!
//! Uses the runtime query API so the crate builds without a live database;
//! the schema is documented on the model modules ([`crate::models::batch`],
//! [`crate::models::message`]).

use async_trait::async_trait;
use sqlx::PgPool;
use uuid::Uuid;

use super::{DispatchStore, StorageError, StorageResult};
use crate::models::{Batch, MessageLog};
use crate::state_machine::MessageStatus;

/// sqlx Postgres store.
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl DispatchStore for PgStore {
    async fn insert_batch(&self, batch: &Batch) -> StorageResult<()> {
        let result = sqlx::query(
            r#"
            INSERT INTO dispatch_batches (
                batch_id, status, priority, template,
                total, pending, processing, completed, failed,
                messages_per_second, success_rate, credits_used,
                error_counts, error_samples, last_error,
                created_at, started_at, estimated_completion
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18)
            "#,
        )
        .bind(batch.batch_id)
        .bind(batch.status)
        .bind(&batch.priority)
        .bind(&batch.template)
        .bind(batch.total)
        .bind(batch.pending)
        .bind(batch.processing)
        .bind(batch.completed)
        .bind(batch.failed)
        .bind(batch.messages_per_second)
        .bind(batch.success_rate)
        .bind(batch.credits_used)
        .bind(&batch.error_counts)
        .bind(&batch.error_samples)
        .bind(&batch.last_error)
        .bind(batch.created_at)
        .bind(batch.started_at)
        .bind(batch.estimated_completion)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(err)) if err.is_unique_violation() => {
                Err(StorageError::DuplicateBatch(batch.batch_id))
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn update_batch(&self, batch: &Batch) -> StorageResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE dispatch_batches
            SET status = $2, pending = $3, processing = $4, completed = $5, failed = $6,
                messages_per_second = $7, success_rate = $8, credits_used = $9,
                error_counts = $10, error_samples = $11, last_error = $12,
                started_at = $13, estimated_completion = $14
            WHERE batch_id = $1
            "#,
        )
        .bind(batch.batch_id)
        .bind(batch.status)
        .bind(batch.pending)
        .bind(batch.processing)
        .bind(batch.completed)
        .bind(batch.failed)
        .bind(batch.messages_per_second)
        .bind(batch.success_rate)
        .bind(batch.credits_used)
        .bind(&batch.error_counts)
        .bind(&batch.error_samples)
        .bind(&batch.last_error)
        .bind(batch.started_at)
        .bind(batch.estimated_completion)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StorageError::BatchNotFound(batch.batch_id));
        }
        Ok(())
    }

    async fn fetch_batch(&self, batch_id: Uuid) -> StorageResult<Option<Batch>> {
        let batch = sqlx::query_as::<_, Batch>(
            r#"
            SELECT batch_id, status, priority, template,
                   total, pending, processing, completed, failed,
                   messages_per_second, success_rate, credits_used,
                   error_counts, error_samples, last_error,
                   created_at, started_at, estimated_completion
            FROM dispatch_batches
            WHERE batch_id = $1
            "#,
        )
        .bind(batch_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(batch)
    }

    async fn insert_messages(&self, messages: &[MessageLog]) -> StorageResult<()> {
        if messages.is_empty() {
            return Ok(());
        }

        let mut tx = self.pool.begin().await?;
        for message in messages {
            sqlx::query(
                r#"
                INSERT INTO dispatch_message_logs (
                    message_id, batch_id, phone, variables, status, attempts,
                    last_error, error_category, provider_message_id,
                    created_at, updated_at, sent_at
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
                "#,
            )
            .bind(message.message_id)
            .bind(message.batch_id)
            .bind(&message.phone)
            .bind(&message.variables)
            .bind(message.status)
            .bind(message.attempts)
            .bind(&message.last_error)
            .bind(&message.error_category)
            .bind(&message.provider_message_id)
            .bind(message.created_at)
            .bind(message.updated_at)
            .bind(message.sent_at)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;

        Ok(())
    }

    async fn update_message(&self, message: &MessageLog) -> StorageResult<()> {
        sqlx::query(
            r#"
            UPDATE dispatch_message_logs
            SET status = $2, attempts = $3, last_error = $4, error_category = $5,
                provider_message_id = $6, updated_at = $7, sent_at = $8
            WHERE message_id = $1
            "#,
        )
        .bind(message.message_id)
        .bind(message.status)
        .bind(message.attempts)
        .bind(&message.last_error)
        .bind(&message.error_category)
        .bind(&message.provider_message_id)
        .bind(message.updated_at)
        .bind(message.sent_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn fetch_messages(
        &self,
        batch_id: Uuid,
        status: Option<MessageStatus>,
        limit: i64,
        offset: i64,
    ) -> StorageResult<Vec<MessageLog>> {
        let rows = match status {
            Some(status) => {
                sqlx::query_as::<_, MessageLog>(
                    r#"
                    SELECT message_id, batch_id, phone, variables, status, attempts,
                           last_error, error_category, provider_message_id,
                           created_at, updated_at, sent_at
                    FROM dispatch_message_logs
                    WHERE batch_id = $1 AND status = $2
                    ORDER BY created_at, message_id
                    LIMIT $3 OFFSET $4
                    "#,
                )
                .bind(batch_id)
                .bind(status)
                .bind(limit)
                .bind(offset)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query_as::<_, MessageLog>(
                    r#"
                    SELECT message_id, batch_id, phone, variables, status, attempts,
                           last_error, error_category, provider_message_id,
                           created_at, updated_at, sent_at
                    FROM dispatch_message_logs
                    WHERE batch_id = $1
                    ORDER BY created_at, message_id
                    LIMIT $2 OFFSET $3
                    "#,
                )
                .bind(batch_id)
                .bind(limit)
                .bind(offset)
                .fetch_all(&self.pool)
                .await?
            }
        };

        Ok(rows)
    }

    async fn cancel_pending_messages(&self, batch_id: Uuid) -> StorageResult<u64> {
        let result = sqlx::query(
            r#"
            UPDATE dispatch_message_logs
            SET status = 'cancelled', updated_at = NOW()
            WHERE batch_id = $1 AND status = 'pending'
            "#,
        )
        .bind(batch_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }
}
