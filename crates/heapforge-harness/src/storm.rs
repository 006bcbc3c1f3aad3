//! Fragmentation storms.
//!
//! Each storm drives one heap through a fixed workload shape over a table of
//! slots. Every live slot's payload is filled with a per-slot byte and
//! re-checked before it is freed or resized, so any overlap between blocks
//! shows up as a clobbered payload. The sequence of placement decisions is
//! folded into a SHA-256 digest over arena-relative offsets; the same seed
//! always yields the same digest.

use std::fmt;
use std::str::FromStr;

use heapforge_core::{Handle, Heap, HeapConfig, HeapError, HeapStats, MetricsSnapshot, ViolationMode};
use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::error::HarnessError;
use crate::rng::XorShift64;

const SAMPLE_EVERY: usize = 64;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StormType {
    Sawtooth,
    InverseSawtooth,
    RandomChurn,
    SizeClassThrash,
    ArenaExhaustion,
    AlignmentStress,
}

impl StormType {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Sawtooth => "sawtooth",
            Self::InverseSawtooth => "inverse_sawtooth",
            Self::RandomChurn => "random_churn",
            Self::SizeClassThrash => "size_class_thrash",
            Self::ArenaExhaustion => "arena_exhaustion",
            Self::AlignmentStress => "alignment_stress",
        }
    }

    pub const fn all() -> [Self; 6] {
        [
            Self::Sawtooth,
            Self::InverseSawtooth,
            Self::RandomChurn,
            Self::SizeClassThrash,
            Self::ArenaExhaustion,
            Self::AlignmentStress,
        ]
    }

    /// Seed used when the caller does not pick one.
    pub const fn default_seed(self) -> u64 {
        match self {
            Self::Sawtooth => 0xA11CE,
            Self::InverseSawtooth => 0xBEEF,
            Self::RandomChurn => 0xC0FFEE,
            Self::SizeClassThrash => 0xD00D,
            Self::ArenaExhaustion => 0xE1F,
            Self::AlignmentStress => 0xF00D,
        }
    }

    const fn default_slots(self) -> usize {
        match self {
            // High alignments waste padding, keep fewer live blocks.
            Self::AlignmentStress => 64,
            _ => 256,
        }
    }
}

impl fmt::Display for StormType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StormType {
    type Err = HarnessError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let normalized = raw.trim().to_ascii_lowercase().replace('-', "_");
        Self::all()
            .into_iter()
            .find(|kind| kind.as_str() == normalized)
            .ok_or_else(|| HarnessError::UnknownStorm(raw.to_string()))
    }
}

#[derive(Clone, Debug)]
pub struct StormConfig {
    pub kind: StormType,
    pub seed: u64,
    pub ops: usize,
    pub slots: usize,
    pub heap: HeapConfig,
}

impl StormConfig {
    pub fn new(kind: StormType) -> Self {
        Self {
            kind,
            seed: kind.default_seed(),
            ops: 20_000,
            slots: kind.default_slots(),
            heap: HeapConfig::default()
                .with_initial_size(64 * 1024)
                .with_max_size(1024 * 1024)
                .with_growth_step(16 * 1024)
                .with_log_capacity(0),
        }
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn with_ops(mut self, ops: usize) -> Self {
        self.ops = ops;
        self
    }

    pub fn with_slots(mut self, slots: usize) -> Self {
        self.slots = slots.max(1);
        self
    }

    pub fn with_heap(mut self, heap: HeapConfig) -> Self {
        self.heap = heap;
        self
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct StormReport {
    pub storm_type: StormType,
    pub seed: u64,
    pub ops_count: usize,
    pub allocations: usize,
    pub failed_allocations: usize,
    pub frees: usize,
    pub reallocations: usize,
    pub violations: usize,
    pub peak_live_bytes: usize,
    pub mean_fragmentation_ratio: f64,
    /// Heap state at the end of the workload, before teardown.
    pub final_stats: HeapStats,
    pub metrics: MetricsSnapshot,
    pub integrity_check_passed: bool,
    /// Every slot freed and the arena coalesced back into one free block.
    pub clean_after_teardown: bool,
    pub trace_digest: String,
}

impl StormReport {
    pub fn passed(&self) -> bool {
        self.integrity_check_passed && self.clean_after_teardown && self.violations == 0
    }
}

#[derive(Clone, Copy, Debug)]
struct Live {
    handle: Handle,
    requested: usize,
}

struct StormRunner {
    heap: Heap,
    slots: Vec<Option<Live>>,
    rng: XorShift64,
    target_ops: usize,
    ops_count: usize,
    live_slots: usize,
    live_bytes: usize,
    peak_live_bytes: usize,
    allocations: usize,
    failed_allocations: usize,
    frees: usize,
    reallocations: usize,
    violations: Vec<String>,
    ratio_sum: f64,
    ratio_samples: usize,
    next_cursor: usize,
    trace: Sha256,
}

/// Run one storm to completion. Violations are counted, not fatal: the heap
/// always runs in report mode here.
pub fn run_storm(config: &StormConfig) -> Result<StormReport, HarnessError> {
    let heap = Heap::new(
        config
            .heap
            .clone()
            .with_violation_mode(ViolationMode::Report),
    )?;
    let mut runner = StormRunner {
        heap,
        slots: vec![None; config.slots.max(1)],
        rng: XorShift64::new(config.seed),
        target_ops: config.ops,
        ops_count: 0,
        live_slots: 0,
        live_bytes: 0,
        peak_live_bytes: 0,
        allocations: 0,
        failed_allocations: 0,
        frees: 0,
        reallocations: 0,
        violations: Vec::new(),
        ratio_sum: 0.0,
        ratio_samples: 0,
        next_cursor: 0,
        trace: Sha256::new(),
    };
    tracing::info!(
        storm = config.kind.as_str(),
        seed = config.seed,
        ops = config.ops,
        slots = config.slots,
        "storm started"
    );
    runner.run(config.kind);
    let report = runner.finish(config);
    if report.passed() {
        tracing::info!(
            storm = config.kind.as_str(),
            ops = report.ops_count,
            fragmentation = report.mean_fragmentation_ratio,
            digest = %report.trace_digest,
            "storm finished"
        );
    } else {
        tracing::error!(
            storm = config.kind.as_str(),
            violations = report.violations,
            integrity = report.integrity_check_passed,
            clean = report.clean_after_teardown,
            "storm finished with failures"
        );
    }
    Ok(report)
}

impl StormRunner {
    fn fill_byte(idx: usize) -> u8 {
        (idx % 251) as u8 + 1
    }

    fn trace(&mut self, tag: u8, idx: usize, handle: Option<Handle>) {
        let base = self.heap.base_address();
        let relative = handle.map_or(u64::MAX, |h| h.addr().wrapping_sub(base) as u64);
        self.trace.update([tag]);
        self.trace.update((idx as u64).to_le_bytes());
        self.trace.update(relative.to_le_bytes());
    }

    fn tick(&mut self) {
        self.ops_count += 1;
        if self.ops_count % SAMPLE_EVERY == 0 {
            self.ratio_sum += self.heap.stats().fragmentation_ratio;
            self.ratio_samples += 1;
        }
    }

    fn violation(&mut self, what: &str, idx: usize, err: HeapError) {
        tracing::warn!(op = what, slot = idx, error = %err, "storm violation");
        self.violations.push(format!("{what} slot {idx}: {err}"));
    }

    fn payload_intact(&mut self, idx: usize, live: Live) -> bool {
        let expected = Self::fill_byte(idx);
        let intact = match self.heap.payload(live.handle) {
            Ok(bytes) => bytes[..live.requested].iter().all(|&b| b == expected),
            Err(_) => false,
        };
        if !intact {
            self.violations
                .push(format!("slot {idx}: payload at {:?} clobbered", live.handle));
        }
        intact
    }

    fn allocate_at(&mut self, idx: usize, requested: usize, alignment: usize) -> bool {
        if self.slots[idx].is_some() {
            self.tick();
            return false;
        }
        let result = self.heap.allocate(requested, alignment);
        let ok = match result {
            Ok(handle) => {
                if handle.addr() % alignment != 0 {
                    self.violations
                        .push(format!("slot {idx}: {handle:?} misses alignment {alignment}"));
                }
                let fill = Self::fill_byte(idx);
                if let Ok(bytes) = self.heap.payload_mut(handle) {
                    bytes[..requested].fill(fill);
                }
                self.slots[idx] = Some(Live { handle, requested });
                self.live_slots += 1;
                self.live_bytes += requested;
                self.peak_live_bytes = self.peak_live_bytes.max(self.live_bytes);
                self.allocations += 1;
                self.trace(b'a', idx, Some(handle));
                true
            }
            Err(HeapError::OutOfMemory { .. }) => {
                self.failed_allocations += 1;
                self.trace(b'a', idx, None);
                false
            }
            Err(err) => {
                self.violation("allocate", idx, err);
                false
            }
        };
        self.tick();
        ok
    }

    fn free_at(&mut self, idx: usize) -> bool {
        let Some(live) = self.slots[idx] else {
            self.tick();
            return false;
        };
        self.payload_intact(idx, live);
        let ok = match self.heap.deallocate(live.handle) {
            Ok(()) => {
                self.slots[idx] = None;
                self.live_slots -= 1;
                self.live_bytes -= live.requested;
                self.frees += 1;
                self.trace(b'f', idx, Some(live.handle));
                true
            }
            Err(err) => {
                self.violation("deallocate", idx, err);
                false
            }
        };
        self.tick();
        ok
    }

    fn realloc_at(&mut self, idx: usize, new_size: usize) -> bool {
        let Some(live) = self.slots[idx] else {
            self.tick();
            return false;
        };
        self.payload_intact(idx, live);
        let ok = match self.heap.reallocate(live.handle, new_size) {
            Ok(handle) => {
                let fill = Self::fill_byte(idx);
                if let Ok(bytes) = self.heap.payload_mut(handle) {
                    bytes[..new_size].fill(fill);
                }
                self.slots[idx] = Some(Live {
                    handle,
                    requested: new_size,
                });
                self.live_bytes = self.live_bytes - live.requested + new_size;
                self.peak_live_bytes = self.peak_live_bytes.max(self.live_bytes);
                self.reallocations += 1;
                self.trace(b'r', idx, Some(handle));
                true
            }
            Err(HeapError::OutOfMemory { .. }) => {
                self.failed_allocations += 1;
                self.trace(b'r', idx, None);
                false
            }
            Err(err) => {
                self.violation("reallocate", idx, err);
                false
            }
        };
        self.tick();
        ok
    }

    fn random_slot(&mut self, live: bool) -> Option<usize> {
        let want = |slot: &Option<Live>| slot.is_some() == live;
        let len = self.slots.len();
        if (live && self.live_slots == 0) || (!live && self.live_slots == len) {
            return None;
        }
        for _ in 0..len {
            let idx = self.rng.gen_range(0, len - 1);
            if want(&self.slots[idx]) {
                return Some(idx);
            }
        }
        self.slots.iter().position(want)
    }

    fn next_round_robin(&mut self, live: bool) -> Option<usize> {
        let len = self.slots.len();
        for _ in 0..len {
            let idx = self.next_cursor % len;
            self.next_cursor = self.next_cursor.wrapping_add(1);
            if self.slots[idx].is_some() == live {
                return Some(idx);
            }
        }
        None
    }

    fn run(&mut self, kind: StormType) {
        match kind {
            StormType::Sawtooth => self.run_sawtooth(),
            StormType::InverseSawtooth => self.run_inverse_sawtooth(),
            StormType::RandomChurn => self.run_random_churn(),
            StormType::SizeClassThrash => self.run_size_class_thrash(),
            StormType::ArenaExhaustion => self.run_arena_exhaustion(),
            StormType::AlignmentStress => self.run_alignment_stress(),
        }
    }

    fn run_sawtooth(&mut self) {
        let len = self.slots.len();
        while self.ops_count < self.target_ops {
            let phase = self.ops_count % (len * 2);
            if phase < len {
                let size = 64 + (phase * 37) % 3_072;
                if !self.allocate_at(phase, size, 16) {
                    self.free_at(phase);
                }
            } else {
                let idx = phase - len;
                if idx % 2 == 0 {
                    if !self.free_at(idx) {
                        self.allocate_at(idx, 64 + (idx * 19) % 2_048, 16);
                    }
                } else if !self.realloc_at(idx, 128 + (idx * 23) % 1_024) {
                    self.allocate_at(idx, 128, 16);
                }
            }
        }
    }

    fn run_inverse_sawtooth(&mut self) {
        let len = self.slots.len();
        while self.ops_count < self.target_ops {
            let phase = self.ops_count % (len * 2);
            if phase < len {
                let idx = len - 1 - phase;
                if !self.allocate_at(idx, 32 + (phase * 11) % 2_560, 16) {
                    self.free_at(idx);
                }
            } else {
                let idx = len - 1 - (phase - len);
                if !self.free_at(idx) {
                    self.allocate_at(idx, 64 + (idx * 41) % 1_536, 16);
                }
            }
        }
    }

    fn run_random_churn(&mut self) {
        while self.ops_count < self.target_ops {
            match self.rng.next_u64() % 8 {
                0..=3 => {
                    if let Some(idx) = self.random_slot(false) {
                        let size = self.rng.gen_range(1, 4_096);
                        self.allocate_at(idx, size, 16);
                    } else if let Some(idx) = self.random_slot(true) {
                        self.free_at(idx);
                    }
                }
                4..=6 => {
                    if let Some(idx) = self.random_slot(true) {
                        self.free_at(idx);
                    } else if let Some(idx) = self.random_slot(false) {
                        let size = self.rng.gen_range(1, 2_048);
                        self.allocate_at(idx, size, 16);
                    }
                }
                _ => match self.random_slot(true) {
                    Some(idx) => {
                        let size = self.rng.gen_range(1, 6_144);
                        self.realloc_at(idx, size);
                    }
                    None => self.tick(),
                },
            }
        }
    }

    fn run_size_class_thrash(&mut self) {
        const SIZES: [usize; 14] = [
            16, 24, 32, 48, 64, 96, 128, 192, 256, 384, 512, 1024, 2048, 4096,
        ];
        let len = self.slots.len();
        while self.ops_count < self.target_ops {
            let idx = self.rng.gen_range(0, len - 1);
            let size = *self.rng.pick(&SIZES);
            if self.ops_count % 3 == 0 {
                if !self.free_at(idx) {
                    self.allocate_at(idx, size, 16);
                }
            } else if !self.allocate_at(idx, size, 16) {
                self.free_at(idx);
            }
        }
    }

    /// Fill until the reservation runs out, release half, repeat.
    fn run_arena_exhaustion(&mut self) {
        let mut filling = true;
        while self.ops_count < self.target_ops {
            if filling {
                match self.next_round_robin(false) {
                    Some(idx) => {
                        let size = 256 + (idx * 53) % 8_192;
                        if !self.allocate_at(idx, size, 16) {
                            filling = false;
                        }
                    }
                    None => filling = false,
                }
            } else {
                let target = self.live_slots / 2;
                while self.live_slots > target && self.ops_count < self.target_ops {
                    match self.next_round_robin(true) {
                        Some(idx) => {
                            self.free_at(idx);
                            self.next_cursor = self.next_cursor.wrapping_add(1);
                        }
                        None => break,
                    }
                }
                filling = true;
            }
        }
    }

    fn run_alignment_stress(&mut self) {
        const ALIGNMENTS: [usize; 5] = [16, 64, 256, 1024, 4096];
        let len = self.slots.len();
        while self.ops_count < self.target_ops {
            let idx = self.rng.gen_range(0, len - 1);
            let alignment = *self.rng.pick(&ALIGNMENTS);
            let size = self.rng.gen_range(1, 4_096);
            if self.ops_count % 4 != 0 {
                if !self.allocate_at(idx, size, alignment) {
                    self.free_at(idx);
                }
            } else if !self.free_at(idx) {
                self.allocate_at(idx, size, alignment);
            }
        }
    }

    fn finish(mut self, config: &StormConfig) -> StormReport {
        let final_stats = self.heap.stats();
        let integrity_check_passed = match self.heap.check_integrity() {
            Ok(report) => report.allocated_blocks == self.live_slots,
            Err(err) => {
                self.violations.push(format!("integrity: {err}"));
                false
            }
        };

        for idx in 0..self.slots.len() {
            if self.slots[idx].is_some() {
                self.free_at(idx);
            }
        }
        let teardown = self.heap.stats();
        let clean_after_teardown = teardown.allocated_blocks == 0
            && teardown.free_blocks == 1
            && teardown.bytes_free + teardown.header_bytes == teardown.total_capacity;

        let mean_fragmentation_ratio = if self.ratio_samples == 0 {
            0.0
        } else {
            self.ratio_sum / self.ratio_samples as f64
        };

        StormReport {
            storm_type: config.kind,
            seed: config.seed,
            ops_count: self.ops_count,
            allocations: self.allocations,
            failed_allocations: self.failed_allocations,
            frees: self.frees,
            reallocations: self.reallocations,
            violations: self.violations.len(),
            peak_live_bytes: self.peak_live_bytes,
            mean_fragmentation_ratio,
            final_stats,
            metrics: self.heap.metrics().snapshot(),
            integrity_check_passed,
            clean_after_teardown,
            trace_digest: to_hex(&self.trace.finalize()),
        }
    }
}

fn to_hex(bytes: &[u8]) -> String {
    const HEX: &[u8; 16] = b"0123456789abcdef";
    let mut out = String::with_capacity(bytes.len() * 2);
    for &byte in bytes {
        out.push(HEX[(byte >> 4) as usize] as char);
        out.push(HEX[(byte & 0x0f) as usize] as char);
    }
    out
}
