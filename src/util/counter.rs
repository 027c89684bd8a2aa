//! Shared byte counter used for RAM accounting.
//!
//! A per-thread writer hands one [`Counter`] to every allocator it owns so
//! that the flush logic can read a single number for the whole buffer.

use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};

/// A cheaply clonable, thread-safe signed counter.
#[derive(Debug, Clone, Default)]
pub struct Counter {
    value: Arc<AtomicI64>,
}

impl Counter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `delta` (which may be negative) and return the new value.
    pub fn add_and_get(&self, delta: i64) -> i64 {
        self.value.fetch_add(delta, Ordering::AcqRel) + delta
    }

    pub fn get(&self) -> i64 {
        self.value.load(Ordering::Acquire)
    }
}
