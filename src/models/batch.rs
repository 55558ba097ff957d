//! # Batch Model
//!
//! Persisted batch record with aggregate counters, derived metrics, and
//! bounded error aggregation.
//!
//! ## Schema
//!
//! ```sql
//! CREATE TYPE batch_status AS ENUM (
//!   'pending', 'processing', 'paused', 'completed', 'failed', 'cancelled'
//! );
//!
//! CREATE TABLE dispatch_batches (
//!   batch_id UUID PRIMARY KEY,
//!   status batch_status NOT NULL DEFAULT 'pending',
//!   priority TEXT NOT NULL DEFAULT 'normal',
//!   template TEXT NOT NULL,
//!   total BIGINT NOT NULL,
//!   pending BIGINT NOT NULL,
//!   processing BIGINT NOT NULL DEFAULT 0,
//!   completed BIGINT NOT NULL DEFAULT 0,
//!   failed BIGINT NOT NULL DEFAULT 0,
//!   messages_per_second DOUBLE PRECISION NOT NULL DEFAULT 0,
//!   success_rate DOUBLE PRECISION NOT NULL DEFAULT 0,
//!   credits_used BIGINT NOT NULL DEFAULT 0,
//!   error_counts JSONB NOT NULL DEFAULT '{}',
//!   error_samples JSONB NOT NULL DEFAULT '[]',
//!   last_error TEXT,
//!   created_at TIMESTAMPTZ NOT NULL,
//!   started_at TIMESTAMPTZ,
//!   estimated_completion TIMESTAMPTZ
//! );
//! ```
//!
//! ## Invariant
//!
//! `total == pending + processing + completed + failed` holds at all times;
//! [`Batch::counters_consistent`] asserts it in tests and reconciliation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

use crate::constants::ERROR_SAMPLE_LIMIT;
use crate::state_machine::BatchStatus;

/// A single captured failure, kept as a bounded sample list on the batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorSample {
    pub message_id: Uuid,
    pub phone: String,
    pub error: String,
    pub category: String,
    pub recorded_at: DateTime<Utc>,
}

/// Persisted batch record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct Batch {
    pub batch_id: Uuid,
    pub status: BatchStatus,
    pub priority: String,
    pub template: String,
    pub total: i64,
    pub pending: i64,
    pub processing: i64,
    pub completed: i64,
    pub failed: i64,
    pub messages_per_second: f64,
    pub success_rate: f64,
    pub credits_used: i64,
    /// Map of error category -> occurrence count, persisted as JSON.
    pub error_counts: serde_json::Value,
    /// Bounded list of [`ErrorSample`] values, persisted as JSON.
    pub error_samples: serde_json::Value,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub estimated_completion: Option<DateTime<Utc>>,
}

/// New batch for creation (without generated fields).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewBatch {
    pub template: String,
    pub priority: String,
    pub total: i64,
}

impl Batch {
    /// Build a fresh pending batch record.
    pub fn new(new_batch: NewBatch) -> Self {
        Self {
            batch_id: Uuid::new_v4(),
            status: BatchStatus::Pending,
            priority: new_batch.priority,
            template: new_batch.template,
            total: new_batch.total,
            pending: new_batch.total,
            processing: 0,
            completed: 0,
            failed: 0,
            messages_per_second: 0.0,
            success_rate: 0.0,
            credits_used: 0,
            error_counts: serde_json::json!({}),
            error_samples: serde_json::json!([]),
            last_error: None,
            created_at: Utc::now(),
            started_at: None,
            estimated_completion: None,
        }
    }

    /// Number of messages still outstanding (pending or in flight).
    pub fn outstanding(&self) -> i64 {
        self.pending + self.processing
    }

    /// Verify the aggregate counter invariant.
    pub fn counters_consistent(&self) -> bool {
        self.total == self.pending + self.processing + self.completed + self.failed
    }

    /// Increment the per-category error counter.
    ///
    /// A malformed stored column (anything but a JSON object) is reset rather
    /// than trusted.
    pub fn increment_error_count(&mut self, category: &str) {
        if !self.error_counts.is_object() {
            self.error_counts = serde_json::json!({});
        }
        if let Some(counts) = self.error_counts.as_object_mut() {
            let entry = counts.entry(category.to_string()).or_insert(serde_json::json!(0));
            let current = entry.as_i64().unwrap_or(0);
            *entry = serde_json::json!(current + 1);
        }
    }

    /// Append an error sample, dropping it once the bounded list is full.
    ///
    /// A malformed stored column (anything but a JSON array) is reset rather
    /// than trusted.
    pub fn push_error_sample(&mut self, sample: ErrorSample) {
        if !self.error_samples.is_array() {
            self.error_samples = serde_json::json!([]);
        }
        if let Some(samples) = self.error_samples.as_array_mut() {
            if samples.len() < ERROR_SAMPLE_LIMIT {
                if let Ok(value) = serde_json::to_value(&sample) {
                    samples.push(value);
                }
            }
        }
    }

    /// Count for one error category, for reporting and tests.
    pub fn error_count(&self, category: &str) -> i64 {
        self.error_counts
            .get(category)
            .and_then(|v| v.as_i64())
            .unwrap_or(0)
    }

    /// Recompute throughput, success rate, and estimated completion from
    /// elapsed wall time and the current counters.
    pub fn update_metrics(&mut self, now: DateTime<Utc>) {
        let Some(started_at) = self.started_at else {
            return;
        };

        let finished = self.completed + self.failed;
        let elapsed_secs = (now - started_at).num_milliseconds() as f64 / 1000.0;
        if elapsed_secs > 0.0 {
            self.messages_per_second = finished as f64 / elapsed_secs;
        }
        if finished > 0 {
            self.success_rate = self.completed as f64 / finished as f64 * 100.0;
        }

        let remaining = self.outstanding();
        if remaining > 0 && self.messages_per_second > 0.0 {
            let secs = (remaining as f64 / self.messages_per_second).ceil() as i64;
            self.estimated_completion = Some(now + chrono::Duration::seconds(secs));
        } else if remaining == 0 {
            self.estimated_completion = Some(now);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_batch(total: i64) -> Batch {
        Batch::new(NewBatch {
            template: "Hello {{name}}".to_string(),
            priority: "normal".to_string(),
            total,
        })
    }

    #[test]
    fn test_new_batch_starts_pending() {
        let batch = test_batch(10);
        assert_eq!(batch.status, BatchStatus::Pending);
        assert_eq!(batch.total, 10);
        assert_eq!(batch.pending, 10);
        assert!(batch.counters_consistent());
    }

    #[test]
    fn test_error_count_accumulation() {
        let mut batch = test_batch(3);
        batch.increment_error_count("invalid_request");
        batch.increment_error_count("invalid_request");
        batch.increment_error_count("network_error");

        assert_eq!(batch.error_count("invalid_request"), 2);
        assert_eq!(batch.error_count("network_error"), 1);
        assert_eq!(batch.error_count("rate_limit"), 0);
    }

    #[test]
    fn test_malformed_error_columns_are_reset() {
        // Simulates a hand-edited or corrupted stored row
        let mut batch = test_batch(3);
        batch.error_counts = serde_json::json!(null);
        batch.error_samples = serde_json::json!("oops");

        batch.increment_error_count("network_error");
        batch.push_error_sample(ErrorSample {
            message_id: Uuid::new_v4(),
            phone: "15550001111".to_string(),
            error: "boom".to_string(),
            category: "network_error".to_string(),
            recorded_at: Utc::now(),
        });

        assert_eq!(batch.error_count("network_error"), 1);
        assert_eq!(batch.error_samples.as_array().unwrap().len(), 1);
    }

    #[test]
    fn test_error_samples_are_bounded() {
        let mut batch = test_batch(100);
        for i in 0..ERROR_SAMPLE_LIMIT + 5 {
            batch.push_error_sample(ErrorSample {
                message_id: Uuid::new_v4(),
                phone: format!("1555000{i:04}"),
                error: "boom".to_string(),
                category: "unknown".to_string(),
                recorded_at: Utc::now(),
            });
        }
        assert_eq!(
            batch.error_samples.as_array().unwrap().len(),
            ERROR_SAMPLE_LIMIT
        );
    }

    #[test]
    fn test_update_metrics() {
        let mut batch = test_batch(10);
        let start = Utc::now();
        batch.started_at = Some(start);
        batch.pending = 5;
        batch.completed = 4;
        batch.failed = 1;

        batch.update_metrics(start + chrono::Duration::seconds(5));
        assert!((batch.messages_per_second - 1.0).abs() < f64::EPSILON);
        assert!((batch.success_rate - 80.0).abs() < f64::EPSILON);
        assert!(batch.estimated_completion.is_some());
    }

    #[test]
    fn test_update_metrics_without_start_is_noop() {
        let mut batch = test_batch(10);
        batch.update_metrics(Utc::now());
        assert_eq!(batch.messages_per_second, 0.0);
        assert_eq!(batch.success_rate, 0.0);
    }
}
