//! Atomic counters for heap observability.
//!
//! All counters use relaxed ordering. They are advisory, not
//! synchronization primitives. Each heap owns its own instance.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Per-heap operation counters.
#[derive(Debug)]
pub struct HeapMetrics {
    /// Successful allocations (zero-size requests excluded).
    pub allocations: AtomicU64,
    /// Zero-size requests answered with the sentinel handle.
    pub zero_size_requests: AtomicU64,
    /// Successful deallocations.
    pub deallocations: AtomicU64,
    /// Reallocations satisfied without moving the payload.
    pub reallocations_in_place: AtomicU64,
    /// Reallocations that moved the payload to a new block.
    pub reallocations_moved: AtomicU64,
    /// Blocks split off a larger free block.
    pub splits: AtomicU64,
    /// Physically adjacent free blocks coalesced.
    pub merges: AtomicU64,
    /// Arena growth events.
    pub grows: AtomicU64,
    /// Requests that failed with out-of-memory.
    pub out_of_memory: AtomicU64,
    /// Double frees detected.
    pub double_frees: AtomicU64,
    /// Foreign pointers rejected.
    pub foreign_pointers: AtomicU64,
    /// Corrupted headers detected.
    pub corrupted_headers: AtomicU64,
}

impl HeapMetrics {
    /// Create a new zeroed metrics instance.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            allocations: AtomicU64::new(0),
            zero_size_requests: AtomicU64::new(0),
            deallocations: AtomicU64::new(0),
            reallocations_in_place: AtomicU64::new(0),
            reallocations_moved: AtomicU64::new(0),
            splits: AtomicU64::new(0),
            merges: AtomicU64::new(0),
            grows: AtomicU64::new(0),
            out_of_memory: AtomicU64::new(0),
            double_frees: AtomicU64::new(0),
            foreign_pointers: AtomicU64::new(0),
            corrupted_headers: AtomicU64::new(0),
        }
    }

    /// Increment a counter by 1.
    pub fn inc(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Read a counter value.
    pub fn get(counter: &AtomicU64) -> u64 {
        counter.load(Ordering::Relaxed)
    }

    /// Total memory-safety violations observed.
    #[must_use]
    pub fn violations(&self) -> u64 {
        Self::get(&self.double_frees)
            + Self::get(&self.foreign_pointers)
            + Self::get(&self.corrupted_headers)
    }

    /// Snapshot all counters.
    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            allocations: Self::get(&self.allocations),
            zero_size_requests: Self::get(&self.zero_size_requests),
            deallocations: Self::get(&self.deallocations),
            reallocations_in_place: Self::get(&self.reallocations_in_place),
            reallocations_moved: Self::get(&self.reallocations_moved),
            splits: Self::get(&self.splits),
            merges: Self::get(&self.merges),
            grows: Self::get(&self.grows),
            out_of_memory: Self::get(&self.out_of_memory),
            double_frees: Self::get(&self.double_frees),
            foreign_pointers: Self::get(&self.foreign_pointers),
            corrupted_headers: Self::get(&self.corrupted_headers),
        }
    }
}

impl Default for HeapMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Point-in-time snapshot of all heap counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub allocations: u64,
    pub zero_size_requests: u64,
    pub deallocations: u64,
    pub reallocations_in_place: u64,
    pub reallocations_moved: u64,
    pub splits: u64,
    pub merges: u64,
    pub grows: u64,
    pub out_of_memory: u64,
    pub double_frees: u64,
    pub foreign_pointers: u64,
    pub corrupted_headers: u64,
}
