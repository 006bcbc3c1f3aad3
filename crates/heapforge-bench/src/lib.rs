//! Shared setup for the heapforge benchmarks.

use heapforge_core::{Heap, HeapConfig, ViolationMode};

/// A heap sized for benchmark loops, with the lifecycle log disabled.
pub fn bench_heap(max_size: usize) -> Heap {
    let config = HeapConfig::default()
        .with_initial_size(max_size.min(1024 * 1024))
        .with_max_size(max_size)
        .with_violation_mode(ViolationMode::Report)
        .with_log_capacity(0);
    match Heap::new(config) {
        Ok(heap) => heap,
        Err(err) => panic!("benchmark heap: {err}"),
    }
}
