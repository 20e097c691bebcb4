//! Distributed mutual exclusion keyed by resource name
//!
//! Serializes all mutating operations against a channel or transfer across
//! hub instances. Waiters are served FIFO per resource with a bounded queue,
//! and a holder that never releases is forcibly expired after its TTL so a
//! crashed caller cannot deadlock the resource permanently.

pub mod service;
pub mod store;
pub mod wire;

pub use service::{ordered_pair, LockService};
pub use store::{LockStore, MemoryLockStore, ReleaseOutcome};
pub use wire::{LockRequest, LockResponse};

use thiserror::Error;

/// Lock service error types
#[derive(Debug, Error)]
pub enum LockError {
    /// The per-resource waiter queue is saturated; caller should back off.
    #[error("lock queue full for resource {0}")]
    QueueFull(String),

    /// The configured maximum wait elapsed without the resource freeing up.
    #[error("lock acquire timed out for resource {resource} after {waited_ms}ms")]
    Timeout { resource: String, waited_ms: u64 },

    /// The backing shared store failed.
    #[error("lock store failure: {0}")]
    Store(#[from] anyhow::Error),
}
