//! # Event System
//!
//! Pluggable publish/subscribe notifier for batch lifecycle events.

pub mod publisher;

pub use publisher::{DispatchEvent, EventKind, EventPublisher, PublishError};
