//! # System Constants
//!
//! Default timings and limits for the dispatch engine. Every value here can be
//! overridden through [`crate::config::DispatchConfig`]; these are the
//! production defaults.

use std::time::Duration;

/// Default number of messages dispatched concurrently per batch.
pub const DEFAULT_CONCURRENCY: usize = 5;

/// Default maximum send attempts per message (initial attempt included).
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Backoff before the first retry, in minutes.
pub const DEFAULT_BACKOFF_MINUTES: u64 = 1;

/// Fixed backoff between subsequent retries.
pub const RETRY_INTERVAL: Duration = Duration::from_secs(60);

/// Additional cooldown applied after a rate-limited (HTTP 429) attempt.
pub const RATE_LIMIT_COOLDOWN: Duration = Duration::from_secs(60);

/// Per-attempt provider call timeouts: attempt 1, attempt 2, attempt 3+.
pub const PROGRESSIVE_TIMEOUTS_SECS: [u64; 3] = [10, 20, 30];

/// Inter-send pacing delay for high-priority batches.
pub const RATE_DELAY_HIGH_MS: u64 = 125;
/// Inter-send pacing delay for normal-priority batches.
pub const RATE_DELAY_NORMAL_MS: u64 = 200;
/// Inter-send pacing delay for low-priority batches.
pub const RATE_DELAY_LOW_MS: u64 = 500;

/// How long duplicate-suppression records are retained.
pub const DUPLICATE_RETENTION_DAYS: i64 = 30;

/// Probability that a duplicate-guard write triggers an opportunistic prune.
pub const DUPLICATE_PRUNE_PROBABILITY: f32 = 0.02;

/// Delay before a completion check runs after a processing burst.
pub const COMPLETION_CHECK_DELAY: Duration = Duration::from_secs(30);

/// Page size for the completion detector's paginated status recount.
pub const COMPLETION_PAGE_SIZE: i64 = 1000;

/// How long a batch stays in the in-memory registry after creation.
pub const BATCH_RETENTION_HOURS: u64 = 24;

/// Maximum number of error samples kept per batch.
pub const ERROR_SAMPLE_LIMIT: usize = 10;

/// Default capacity of the event broadcast channel.
pub const DEFAULT_EVENT_CAPACITY: usize = 1000;
