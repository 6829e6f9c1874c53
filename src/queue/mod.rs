//! Deduplicating task queue with per-key retry backoff.

mod taskqueue;

pub use taskqueue::{ObjectKey, TaskQueue};
