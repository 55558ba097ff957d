//! # Dispatch Engine
//!
//! Batch message delivery: rate-limited, retrying, duplicate-suppressing
//! dispatch of templated messages through an external provider, with
//! asynchronous ground-truth completion detection.
//!
//! [`BatchCoordinator`] is the public entry point; the remaining components
//! are exposed for embedding and tests.

pub mod completion;
pub mod coordinator;
pub mod dispatcher;
pub mod duplicate_guard;
pub mod provider;
pub mod rate_limiter;
pub mod registry;
pub mod scheduler;
pub mod sender;
pub mod template;
pub mod tracker;

pub use completion::{CompletionDetector, StatusCounts};
pub use coordinator::{BatchCoordinator, CreateBatch, Recipient};
pub use dispatcher::Dispatcher;
pub use duplicate_guard::DuplicateGuard;
pub use provider::{AuthContext, MessageProvider, ProviderError, ProviderResponse, RateLimitInfo};
pub use rate_limiter::{Priority, RateLimiter};
pub use registry::{BatchRegistry, BatchRuntime};
pub use scheduler::{TaskKey, TaskScheduler};
pub use sender::{ErrorCategory, MessageSender, RetryPolicy, SendResult, SkipReason};
pub use template::MessageTemplate;
pub use tracker::BatchTracker;
