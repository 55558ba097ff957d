//! # Batch State Machine
//!
//! Lifecycle states and transition rules for batches and messages. The
//! transition table is pure; persistence and event emission happen in the
//! components that call into it.

pub mod events;
pub mod states;
pub mod transitions;

pub use events::BatchEvent;
pub use states::{BatchStatus, MessageStatus};
pub use transitions::next_status;
