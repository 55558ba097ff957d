#![allow(clippy::doc_markdown)] // Allow technical terms like PostgreSQL, SQLx in docs
#![allow(clippy::missing_errors_doc)] // Allow public functions without # Errors sections
#![allow(clippy::must_use_candidate)] // Allow methods without must_use when context is clear

//! # Dispatch Core
//!
//! Batch message dispatch engine: rate-limited, retrying, duplicate-suppressing
//! delivery of templated messages to many recipients through an external
//! provider, with asynchronous completion detection.
//!
//! ## Overview
//!
//! A batch is submitted as a message template plus a list of recipients, each
//! with their own template variables. The engine persists one message row per
//! recipient, then drains the batch through a bounded-concurrency dispatch
//! loop: sends are paced by priority tier, retried with backoff under
//! progressive per-attempt timeouts, suppressed when identical content was
//! recently sent to the same number, and classified into a stable error
//! taxonomy on failure. Completion is never declared from live counters
//! alone; a delayed detector recounts message statuses from the store and
//! finalizes the batch from ground truth.
//!
//! ## Key Features
//!
//! - **Bounded concurrency**: at most N in-flight sends per batch, paced per
//!   priority tier (high / normal / low)
//! - **Retry with backoff**: progressive 10s/20s/30s attempt timeouts, with
//!   an extra cooldown after rate-limited attempts and a one-shot deferral
//!   for messages that exhaust their retries on HTTP 429
//! - **Duplicate suppression**: content-hash window per phone number, with an
//!   overridable bypass allow-list
//! - **Pause / resume / cancel**: in-flight sends finish, queued messages
//!   stay queued, credentials are re-validated on resume
//! - **Ground-truth completion**: paginated status recount reconciles counter
//!   drift before a batch is finalized
//!
//! ## Module Organization
//!
//! - [`dispatch`] - The engine: coordinator, dispatcher, sender, tracker,
//!   completion detector, duplicate guard, scheduler
//! - [`models`] - Persisted batch and message records
//! - [`state_machine`] - Batch and message status transitions
//! - [`storage`] - Store trait with PostgreSQL and in-memory backends
//! - [`events`] - Progress event broadcasting
//! - [`config`] - Layered configuration
//! - [`error`] - Structured error handling
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use dispatch_core::config::DispatchConfig;
//! use dispatch_core::dispatch::{AuthContext, BatchCoordinator, CreateBatch, Priority, Recipient};
//! use dispatch_core::storage::MemoryStore;
//! use std::sync::Arc;
//!
//! # async fn example(provider: Arc<dyn dispatch_core::dispatch::MessageProvider>) -> dispatch_core::error::Result<()> {
//! let coordinator = BatchCoordinator::new(provider, Arc::new(MemoryStore::new()), DispatchConfig::default());
//!
//! let batch = coordinator
//!     .create_batch(CreateBatch {
//!         template: "Hi {{name}}, your order shipped".to_string(),
//!         recipients: vec![Recipient {
//!             phone: "555-123-4567".to_string(),
//!             variables: serde_json::json!({"name": "Ada"}),
//!         }],
//!         priority: Priority::Normal,
//!         auth: Some(AuthContext::new("account", "token")),
//!         scheduled_at: None,
//!         auto_start: false,
//!     })
//!     .await?;
//!
//! coordinator.start(batch.batch_id, None).await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod constants;
pub mod dispatch;
pub mod error;
pub mod events;
pub mod logging;
pub mod models;
pub mod state_machine;
pub mod storage;

pub use config::{CompletionSettings, DispatchConfig, RateLimitSettings};
pub use dispatch::{
    AuthContext, BatchCoordinator, CreateBatch, ErrorCategory, MessageProvider, Priority,
    ProviderError, ProviderResponse, Recipient, RetryPolicy, SendResult,
};
pub use error::{DispatchError, Result};
pub use events::{DispatchEvent, EventKind, EventPublisher};
pub use models::{Batch, MessageLog};
pub use state_machine::{BatchStatus, MessageStatus};
pub use storage::{DispatchStore, MemoryStore, PgStore};
