//! # Message Log Model
//!
//! One persisted row per recipient of a batch, created at submission time and
//! mutated by the dispatcher as delivery attempts progress. Terminal rows are
//! immutable except for audit fields.
//!
//! ## Schema
//!
//! ```sql
//! CREATE TYPE message_status AS ENUM (
//!   'pending', 'processing', 'completed', 'failed', 'cancelled'
//! );
//!
//! CREATE TABLE dispatch_message_logs (
//!   message_id UUID PRIMARY KEY,
//!   batch_id UUID NOT NULL REFERENCES dispatch_batches (batch_id),
//!   phone TEXT NOT NULL,
//!   variables JSONB NOT NULL DEFAULT '{}',
//!   status message_status NOT NULL DEFAULT 'pending',
//!   attempts INTEGER NOT NULL DEFAULT 0,
//!   last_error TEXT,
//!   error_category TEXT,
//!   provider_message_id TEXT,
//!   created_at TIMESTAMPTZ NOT NULL,
//!   updated_at TIMESTAMPTZ NOT NULL,
//!   sent_at TIMESTAMPTZ
//! );
//! CREATE INDEX idx_message_logs_batch_status
//!   ON dispatch_message_logs (batch_id, status);
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

use crate::error::DispatchError;
use crate::state_machine::MessageStatus;

/// Persisted per-recipient message record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct MessageLog {
    pub message_id: Uuid,
    pub batch_id: Uuid,
    /// Normalized country-code-prefixed digits, e.g. `15551234567`.
    pub phone: String,
    /// Per-recipient template variables.
    pub variables: serde_json::Value,
    pub status: MessageStatus,
    pub attempts: i32,
    pub last_error: Option<String>,
    pub error_category: Option<String>,
    pub provider_message_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub sent_at: Option<DateTime<Utc>>,
}

/// New message for creation (without generated fields).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewMessage {
    pub batch_id: Uuid,
    pub phone: String,
    pub variables: serde_json::Value,
}

impl MessageLog {
    /// Build a fresh pending message record.
    pub fn new(new_message: NewMessage) -> Self {
        let now = Utc::now();
        Self {
            message_id: Uuid::new_v4(),
            batch_id: new_message.batch_id,
            phone: new_message.phone,
            variables: new_message.variables,
            status: MessageStatus::Pending,
            attempts: 0,
            last_error: None,
            error_category: None,
            provider_message_id: None,
            created_at: now,
            updated_at: now,
            sent_at: None,
        }
    }

    /// Transition to `processing` when a worker picks the message up.
    pub fn mark_processing(&mut self) {
        self.status = MessageStatus::Processing;
        self.updated_at = Utc::now();
    }

    /// Record a successful provider acknowledgment.
    pub fn mark_completed(&mut self, provider_message_id: Option<String>, attempts: i32) {
        self.status = MessageStatus::Completed;
        self.provider_message_id = provider_message_id;
        self.attempts = attempts;
        self.sent_at = Some(Utc::now());
        self.updated_at = Utc::now();
    }

    /// Record a duplicate suppression: the message counts as completed, with
    /// the skip reason kept on the audit fields.
    pub fn mark_skipped(&mut self, reason: &str, category: &str) {
        self.status = MessageStatus::Completed;
        self.last_error = Some(reason.to_string());
        self.error_category = Some(category.to_string());
        self.updated_at = Utc::now();
    }

    /// Record a terminal failure with the last error and its category.
    pub fn mark_failed(&mut self, error: &str, category: &str, attempts: i32) {
        self.status = MessageStatus::Failed;
        self.last_error = Some(error.to_string());
        self.error_category = Some(category.to_string());
        self.attempts = attempts;
        self.updated_at = Utc::now();
    }

    /// Return a deferred message to the pending pool for a later re-enqueue.
    pub fn mark_deferred(&mut self, reason: &str) {
        self.status = MessageStatus::Pending;
        self.last_error = Some(reason.to_string());
        self.updated_at = Utc::now();
    }

    /// Cancel a not-yet-dispatched message.
    pub fn mark_cancelled(&mut self) {
        self.status = MessageStatus::Cancelled;
        self.updated_at = Utc::now();
    }
}

/// Normalize a raw phone number to 11-digit US format (`1` + 10 digits).
///
/// Accepts any formatting characters; rejects numbers that do not reduce to
/// 10 digits or 11 digits with a leading `1`.
pub fn normalize_phone(raw: &str) -> Result<String, DispatchError> {
    let digits: String = raw.chars().filter(char::is_ascii_digit).collect();

    match digits.len() {
        10 => Ok(format!("1{digits}")),
        11 if digits.starts_with('1') => Ok(digits),
        _ => Err(DispatchError::Validation(format!(
            "invalid phone number: {raw}"
        ))),
    }
}
