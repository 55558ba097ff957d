//! # Data Models
//!
//! Persisted records for batches and their per-recipient message logs.

pub mod batch;
pub mod message;

pub use batch::{Batch, ErrorSample, NewBatch};
pub use message::{normalize_phone, MessageLog, NewMessage};
