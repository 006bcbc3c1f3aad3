//! Reference scenarios, run against fresh heaps and reported as pass/fail
//! records. These are the behaviours every build of the heap must show.

use heapforge_core::{BlockState, Heap, HeapConfig, HeapError, ViolationMode};
use serde::Serialize;

#[derive(Debug, Clone, Serialize)]
pub struct ScenarioOutcome {
    pub name: &'static str,
    pub passed: bool,
    /// Failure description; empty when the scenario passed.
    pub detail: String,
}

type ScenarioResult = Result<(), String>;

macro_rules! ensure {
    ($cond:expr, $($fmt:tt)+) => {
        if !$cond {
            return Err(format!($($fmt)+));
        }
    };
}

const SCENARIOS: [(&str, fn() -> ScenarioResult); 7] = [
    ("freed_block_reuse", freed_block_reuse),
    ("merge_reclaims_header", merge_reclaims_header),
    ("no_creep_on_repeat", no_creep_on_repeat),
    ("adjacent_frees_merge", adjacent_frees_merge),
    ("alignment_honoured", alignment_honoured),
    ("double_free_reported", double_free_reported),
    ("growth_stays_in_reservation", growth_stays_in_reservation),
];

/// Run every scenario, in a fixed order.
pub fn run_scenarios() -> Vec<ScenarioOutcome> {
    SCENARIOS
        .iter()
        .map(|&(name, scenario)| {
            let result = scenario();
            match &result {
                Ok(()) => tracing::info!(scenario = name, "scenario passed"),
                Err(detail) => tracing::error!(scenario = name, %detail, "scenario failed"),
            }
            ScenarioOutcome {
                name,
                passed: result.is_ok(),
                detail: result.err().unwrap_or_default(),
            }
        })
        .collect()
}

fn heap(config: HeapConfig) -> Result<Heap, String> {
    Heap::new(config.with_violation_mode(ViolationMode::Report).with_log_capacity(0))
        .map_err(|err| format!("heap construction: {err}"))
}

fn fail(what: &str) -> impl Fn(HeapError) -> String + '_ {
    move |err| format!("{what}: {err}")
}

fn accounting(heap: &Heap) -> ScenarioResult {
    let stats = heap.stats();
    ensure!(
        stats.bytes_in_use + stats.bytes_free + stats.header_bytes == stats.total_capacity,
        "accounting identity broken: {stats:?}"
    );
    heap.check_integrity().map_err(fail("integrity"))?;
    Ok(())
}

fn free_sizes(heap: &Heap) -> Result<Vec<usize>, String> {
    let mut sizes = Vec::new();
    for block in heap.blocks() {
        let block = block.map_err(fail("walk"))?;
        if block.state == BlockState::Free {
            sizes.push(block.size);
        }
    }
    Ok(sizes)
}

fn freed_block_reuse() -> ScenarioResult {
    let mut heap = heap(HeapConfig::fixed(1024))?;
    let first = heap.allocate(100, 8).map_err(fail("allocate(100)"))?;
    let first_size = heap.usable_size(first).map_err(fail("usable_size"))?;
    heap.allocate(200, 8).map_err(fail("allocate(200)"))?;
    heap.deallocate(first).map_err(fail("deallocate"))?;

    let head = heap
        .blocks()
        .next()
        .ok_or("empty walk")?
        .map_err(fail("walk"))?;
    ensure!(
        head.state == BlockState::Free && head.size == first_size,
        "first block not free with size {first_size}: {head:?}"
    );
    let reused = heap.allocate(50, 8).map_err(fail("allocate(50)"))?;
    ensure!(reused == first, "allocate(50) returned {reused:?}, expected {first:?}");
    ensure!(heap.metrics().snapshot().grows == 0, "arena grew");
    accounting(&heap)
}

fn merge_reclaims_header() -> ScenarioResult {
    let mut heap = heap(HeapConfig::fixed(672))?;
    let a = heap.allocate(300, 8).map_err(fail("allocate(300)"))?;
    let b = heap.allocate(300, 8).map_err(fail("allocate(300)"))?;
    let expected = heap.usable_size(a).map_err(fail("usable_size"))?
        + heap.usable_size(b).map_err(fail("usable_size"))?
        + heapforge_core::block::HEADER_SIZE;
    heap.deallocate(a).map_err(fail("deallocate"))?;
    heap.deallocate(b).map_err(fail("deallocate"))?;
    let sizes = free_sizes(&heap)?;
    ensure!(sizes == [expected], "free blocks {sizes:?}, expected [{expected}]");
    heap.allocate(590, 8).map_err(fail("allocate(590)"))?;
    ensure!(heap.metrics().snapshot().grows == 0, "arena grew");
    accounting(&heap)
}

fn no_creep_on_repeat() -> ScenarioResult {
    let mut heap = heap(HeapConfig::fixed(4096))?;
    let largest = heap.stats().largest_free_block;
    let mut peak = 0;
    for _ in 0..100 {
        let handle = heap.allocate(128, 16).map_err(fail("allocate(128)"))?;
        peak = peak.max(heap.stats().bytes_in_use);
        heap.deallocate(handle).map_err(fail("deallocate"))?;
    }
    ensure!(peak == 128, "bytes in use peaked at {peak}");
    let after = heap.stats().largest_free_block;
    ensure!(after == largest, "largest free block {after}, was {largest}");
    accounting(&heap)
}

fn adjacent_frees_merge() -> ScenarioResult {
    let mut heap = heap(HeapConfig::fixed(4096))?;
    let mut handles = Vec::new();
    for _ in 0..4 {
        handles.push(heap.allocate(64, 16).map_err(fail("allocate(64)"))?);
    }
    heap.deallocate(handles[0]).map_err(fail("deallocate"))?;
    heap.deallocate(handles[2]).map_err(fail("deallocate"))?;
    let apart = heap.stats().free_blocks;
    ensure!(apart == 3, "non-adjacent frees left {apart} free blocks, expected 3");
    heap.deallocate(handles[1]).map_err(fail("deallocate"))?;
    let merged = heap.stats().free_blocks;
    ensure!(merged == 2, "adjacent frees left {merged} free blocks, expected 2");
    accounting(&heap)
}

fn alignment_honoured() -> ScenarioResult {
    let mut heap = heap(HeapConfig::fixed(64 * 1024))?;
    for alignment in [8, 16, 32, 64, 128, 4096] {
        for size in [1, 24, 100, 1000] {
            let handle = heap
                .allocate(size, alignment)
                .map_err(fail("aligned allocate"))?;
            ensure!(
                handle.addr() % alignment == 0,
                "{handle:?} is not a multiple of {alignment}"
            );
        }
    }
    accounting(&heap)
}

fn double_free_reported() -> ScenarioResult {
    let mut heap = heap(HeapConfig::fixed(4096))?;
    let handle = heap.allocate(64, 16).map_err(fail("allocate(64)"))?;
    heap.deallocate(handle).map_err(fail("deallocate"))?;
    match heap.deallocate(handle) {
        Err(HeapError::DoubleFree { .. }) => {}
        other => return Err(format!("second free returned {other:?}")),
    }
    heap.allocate(64, 16).map_err(fail("allocate after double free"))?;
    ensure!(
        heap.metrics().snapshot().double_frees == 1,
        "double free not counted"
    );
    accounting(&heap)
}

fn growth_stays_in_reservation() -> ScenarioResult {
    let config = HeapConfig::default()
        .with_initial_size(1024)
        .with_max_size(8192)
        .with_growth_step(1024);
    let mut heap = heap(config)?;
    let mut live = 0;
    loop {
        match heap.allocate(480, 16) {
            Ok(_) => live += 1,
            Err(HeapError::OutOfMemory { .. }) => break,
            Err(err) => return Err(format!("allocate(480): {err}")),
        }
        ensure!(live <= 64, "reservation never ran out");
    }
    let stats = heap.stats();
    ensure!(
        stats.total_capacity <= stats.max_capacity,
        "committed {} beyond reservation {}",
        stats.total_capacity,
        stats.max_capacity
    );
    ensure!(heap.metrics().snapshot().grows > 0, "arena never grew");
    accounting(&heap)
}
