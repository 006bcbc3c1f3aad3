//! Allocation engine.
//!
//! `Heap` ties the arena, the block layer and the free lists together.
//! Every public operation either completes or returns an error with the heap
//! unchanged: all headers an operation will touch are read and verified
//! before the first write.

use std::ptr::{self, NonNull};

use heapforge_membrane::HeapMetrics;
use serde::Serialize;

use crate::arena::{ARENA_ALIGN, Arena};
use crate::block::{self, BlockHeader, GRANULARITY, HEADER_SIZE, MIN_ALIGN, MIN_ARENA_SIZE, round_up};
use crate::config::HeapConfig;
use crate::error::HeapError;
use crate::free_list::{Fit, FreeLists};
use crate::handle::Handle;
use crate::log::{AccountingSnapshot, LifecycleLog, LifecycleRecord, LogEvent, LogLevel};
use crate::size_class;

/// Largest alignment preserved when `reallocate` moves a payload.
pub const MAX_MOVE_ALIGN: usize = ARENA_ALIGN;

/// Point-in-time heap statistics.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct HeapStats {
    /// Committed arena bytes.
    pub total_capacity: usize,
    /// Payload bytes of allocated blocks.
    pub bytes_in_use: usize,
    /// Payload bytes of free blocks.
    pub bytes_free: usize,
    /// Header bytes of all blocks.
    pub header_bytes: usize,
    pub largest_free_block: usize,
    /// `1 - largest_free_block / bytes_free`, 0 when nothing is free.
    pub fragmentation_ratio: f64,
    pub allocated_blocks: usize,
    pub free_blocks: usize,
    /// Peak payload plus header bytes held by allocated blocks.
    pub high_watermark: usize,
    /// Reservation ceiling.
    pub max_capacity: usize,
}

/// A verified allocated block and its physical neighbours.
#[derive(Debug, Clone, Copy)]
struct Located {
    offset: usize,
    header: BlockHeader,
    prev: Option<(usize, BlockHeader)>,
    next: Option<(usize, BlockHeader)>,
}

impl Located {
    fn free_prev(&self) -> Option<(usize, BlockHeader)> {
        self.prev.filter(|(_, header)| header.is_free)
    }

    fn free_next(&self) -> Option<(usize, BlockHeader)> {
        self.next.filter(|(_, header)| header.is_free)
    }
}

/// Single-arena allocator.
///
/// Not thread safe; every mutation takes `&mut self`. Wrap it in a lock
/// to share it.
pub struct Heap {
    arena: Arena,
    free: FreeLists,
    config: HeapConfig,
    metrics: HeapMetrics,
    log: LifecycleLog,
    /// Payload bytes of allocated blocks.
    bytes_in_use: usize,
    allocated_blocks: usize,
    /// Offset of the physically last block.
    last_block: usize,
    /// Bit `k` set once a zero-size handle at `1 << k` above the sentinel
    /// page has been issued.
    issued_sentinels: u64,
}

impl Heap {
    /// Create a heap with one free block spanning the initial arena.
    pub fn new(config: HeapConfig) -> Result<Self, HeapError> {
        config.validate()?;
        let mut arena = Arena::reserve(config.initial_size, config.max_size)?;
        let first = BlockHeader::free(arena.total_size() - HEADER_SIZE, None);
        arena.write_header(0, &first);
        let mut free = FreeLists::new();
        free.insert(0, first.size);

        let mut heap = Self {
            arena,
            free,
            log: LifecycleLog::new(config.log_capacity),
            config,
            metrics: HeapMetrics::new(),
            bytes_in_use: 0,
            allocated_blocks: 0,
            last_block: 0,
            issued_sentinels: 0,
        };
        let details = format!(
            "max_size={};violation_mode={}",
            heap.arena.max_size(),
            heap.config.violation_mode.as_str()
        );
        let total = heap.arena.total_size();
        heap.record(
            LogEvent::new(LogLevel::Info, "new", "heap_created", "ok")
                .size(total)
                .details(details),
        );
        Ok(heap)
    }

    /// Allocate `size` bytes whose address is a multiple of `alignment`.
    ///
    /// Alignments below `MIN_ALIGN` are raised to it. A zero-byte request
    /// returns a sentinel handle that owns no memory; its address is the
    /// (raised) alignment.
    pub fn allocate(&mut self, size: usize, alignment: usize) -> Result<Handle, HeapError> {
        if !alignment.is_power_of_two() {
            self.record(
                LogEvent::new(LogLevel::Warn, "allocate", "invalid_alignment", "rejected")
                    .size(size)
                    .details(format!("alignment={alignment}")),
            );
            return Err(HeapError::InvalidAlignment { alignment });
        }
        let alignment = alignment.max(MIN_ALIGN);
        if size == 0 {
            HeapMetrics::inc(&self.metrics.zero_size_requests);
            let handle = Handle::zero_sized(alignment);
            if !handle.in_sentinel_page() {
                self.issued_sentinels |= 1 << alignment.trailing_zeros();
            }
            return Ok(handle);
        }

        match self.alloc_block(size, alignment, "allocate") {
            Ok((offset, header)) => {
                HeapMetrics::inc(&self.metrics.allocations);
                self.record(
                    LogEvent::new(LogLevel::Trace, "allocate", "alloc", "ok")
                        .offset(offset)
                        .size(header.size)
                        .class(size_class::class_of(header.size))
                        .details(format!("requested={size};alignment={alignment}")),
                );
                self.handle_at(offset, size)
            }
            Err(err) => Err(self.fail_alloc("allocate", size, err)),
        }
    }

    /// Like `allocate`, with the payload filled with zeros.
    pub fn allocate_zeroed(&mut self, size: usize, alignment: usize) -> Result<Handle, HeapError> {
        let handle = self.allocate(size, alignment)?;
        if let Ok(bytes) = self.payload_mut(handle) {
            bytes.fill(0);
        }
        Ok(handle)
    }

    /// Return an allocation to the heap, merging it with free neighbours.
    pub fn deallocate(&mut self, handle: Handle) -> Result<(), HeapError> {
        if self.is_zero_sized(handle) {
            return Ok(());
        }
        let located = match self.locate(handle) {
            Ok(located) => located,
            Err(err) => return Err(self.violation("deallocate", err)),
        };
        let size = located.header.size;
        match self.free_block(&located) {
            Ok((start, merged)) => {
                HeapMetrics::inc(&self.metrics.deallocations);
                self.record(
                    LogEvent::new(LogLevel::Trace, "deallocate", "free", "ok")
                        .offset(located.offset)
                        .size(size)
                        .class(size_class::class_of(merged.size))
                        .details(format!("merged_offset={start};merged_size={}", merged.size)),
                );
                Ok(())
            }
            Err(err) => Err(self.violation("deallocate", err)),
        }
    }

    /// Resize an allocation, in place when the block or its free successor
    /// allows it, otherwise by moving the payload.
    ///
    /// On failure the original allocation is left valid and untouched.
    pub fn reallocate(&mut self, handle: Handle, new_size: usize) -> Result<Handle, HeapError> {
        if self.is_zero_sized(handle) {
            // A sentinel's address is the alignment it was requested with.
            return self.allocate(new_size, handle.addr());
        }
        if new_size == 0 {
            self.deallocate(handle)?;
            return Ok(Handle::zero_sized(handle.implied_alignment(MAX_MOVE_ALIGN)));
        }

        let located = match self.locate(handle) {
            Ok(located) => located,
            Err(err) => return Err(self.violation("reallocate", err)),
        };
        let Some(rounded) = round_up(new_size, GRANULARITY) else {
            let oom = HeapError::OutOfMemory {
                requested: new_size,
            };
            return Err(self.fail_alloc("reallocate", new_size, oom));
        };

        match self.resize_in_place(&located, rounded) {
            Ok(true) => {
                HeapMetrics::inc(&self.metrics.reallocations_in_place);
                self.record(
                    LogEvent::new(LogLevel::Trace, "reallocate", "realloc_in_place", "ok")
                        .offset(located.offset)
                        .size(rounded)
                        .details(format!("old_size={}", located.header.size)),
                );
                Ok(handle)
            }
            Ok(false) => self.move_allocation(handle, &located, new_size),
            Err(err) => Err(self.violation("reallocate", err)),
        }
    }

    /// Snapshot of heap accounting.
    pub fn stats(&self) -> HeapStats {
        HeapStats {
            total_capacity: self.arena.total_size(),
            bytes_in_use: self.bytes_in_use,
            bytes_free: self.free.free_bytes(),
            header_bytes: HEADER_SIZE * (self.allocated_blocks + self.free.len()),
            largest_free_block: self.free.largest(),
            fragmentation_ratio: self.fragmentation_ratio(),
            allocated_blocks: self.allocated_blocks,
            free_blocks: self.free.len(),
            high_watermark: self.arena.high_watermark(),
            max_capacity: self.arena.max_size(),
        }
    }

    /// Usable payload bytes behind `handle` (0 for zero-size handles).
    pub fn usable_size(&self, handle: Handle) -> Result<usize, HeapError> {
        if self.is_zero_sized(handle) {
            return Ok(0);
        }
        Ok(self.locate(handle)?.header.size)
    }

    /// Borrow the payload behind `handle`.
    pub fn payload(&self, handle: Handle) -> Result<&[u8], HeapError> {
        if self.is_zero_sized(handle) {
            return Ok(&[]);
        }
        let located = self.locate(handle)?;
        Ok(self.arena.bytes(
            BlockHeader::payload_offset(located.offset),
            located.header.size,
        ))
    }

    /// Mutably borrow the payload behind `handle`.
    pub fn payload_mut(&mut self, handle: Handle) -> Result<&mut [u8], HeapError> {
        if self.is_zero_sized(handle) {
            return Ok(&mut []);
        }
        let located = self.locate(handle)?;
        Ok(self.arena.bytes_mut(
            BlockHeader::payload_offset(located.offset),
            located.header.size,
        ))
    }

    /// Raw pointer to the payload behind `handle`.
    ///
    /// Arena pointers carry the arena's provenance; zero-size handles map
    /// to a dangling, well-aligned pointer.
    pub fn as_ptr(&self, handle: Handle) -> Option<NonNull<u8>> {
        match self.arena.offset_of(handle.addr()) {
            Some(offset) => self.arena.ptr_at(offset),
            None => NonNull::new(ptr::without_provenance_mut(handle.addr())),
        }
    }

    /// Return the arena to the platform.
    ///
    /// Refused while any allocation is live. Afterwards every allocation
    /// fails with `OutOfMemory`.
    pub fn release(&mut self) -> Result<(), HeapError> {
        if self.allocated_blocks > 0 {
            let err = HeapError::ArenaNotEmpty {
                live_blocks: self.allocated_blocks,
            };
            self.record(
                LogEvent::new(LogLevel::Warn, "release", "release_refused", "rejected")
                    .details(err.to_string()),
            );
            return Err(err);
        }
        let total = self.arena.total_size();
        self.arena.release();
        self.free.clear();
        self.last_block = 0;
        self.record(LogEvent::new(LogLevel::Info, "release", "arena_released", "ok").size(total));
        Ok(())
    }

    pub fn is_released(&self) -> bool {
        self.arena.is_released()
    }

    pub fn config(&self) -> &HeapConfig {
        &self.config
    }

    pub fn metrics(&self) -> &HeapMetrics {
        &self.metrics
    }

    /// Address of arena offset 0 (0 once released).
    pub fn base_address(&self) -> usize {
        self.arena.base_address()
    }

    /// Retained lifecycle records, oldest first.
    pub fn lifecycle_logs(&self) -> impl ExactSizeIterator<Item = &LifecycleRecord> + '_ {
        self.log.records()
    }

    /// Remove and return all retained lifecycle records.
    pub fn drain_lifecycle_logs(&mut self) -> Vec<LifecycleRecord> {
        self.log.drain()
    }

    pub(crate) fn arena(&self) -> &Arena {
        &self.arena
    }

    #[cfg(test)]
    pub(crate) fn arena_mut(&mut self) -> &mut Arena {
        &mut self.arena
    }

    pub(crate) fn free_lists(&self) -> &FreeLists {
        &self.free
    }

    pub(crate) fn last_block(&self) -> usize {
        self.last_block
    }

    pub(crate) fn allocated_blocks(&self) -> usize {
        self.allocated_blocks
    }

    pub(crate) fn bytes_in_use(&self) -> usize {
        self.bytes_in_use
    }

    fn fragmentation_ratio(&self) -> f64 {
        let free = self.free.free_bytes();
        if free == 0 {
            return 0.0;
        }
        1.0 - self.free.largest() as f64 / free as f64
    }

    fn accounting(&self) -> AccountingSnapshot {
        AccountingSnapshot {
            allocated_blocks: self.allocated_blocks,
            free_blocks: self.free.len(),
            bytes_in_use: self.bytes_in_use,
            total_size: self.arena.total_size(),
        }
    }

    fn record(&mut self, event: LogEvent) {
        let accounting = self.accounting();
        self.log.record(event, accounting);
    }

    fn note_in_use(&mut self) {
        let held = self.bytes_in_use + HEADER_SIZE * self.allocated_blocks;
        self.arena.note_in_use(held);
    }

    fn handle_at(&self, offset: usize, requested: usize) -> Result<Handle, HeapError> {
        let addr = self.arena.base_address() + BlockHeader::payload_offset(offset);
        Handle::from_addr(addr).ok_or(HeapError::OutOfMemory { requested })
    }

    /// True only for sentinel values this heap hands out. Any other address
    /// outside the arena is a foreign pointer.
    fn is_zero_sized(&self, handle: Handle) -> bool {
        if !handle.looks_zero_sized() || self.arena.offset_of(handle.addr()).is_some() {
            return false;
        }
        handle.in_sentinel_page()
            || self.issued_sentinels & (1 << handle.addr().trailing_zeros()) != 0
    }

    /// Find (growing if needed) and carve a block for `size` bytes.
    ///
    /// Growth verifies the last block's header before committing. After a
    /// grow the only new fit is the tail block `grow_for` just wrote, which
    /// has no successor, so `carve` cannot fail on it and a corrupted heap
    /// never gains capacity.
    fn alloc_block(
        &mut self,
        size: usize,
        alignment: usize,
        symbol: &'static str,
    ) -> Result<(usize, BlockHeader), HeapError> {
        let oom = HeapError::OutOfMemory { requested: size };
        if self.arena.is_released() {
            return Err(oom);
        }
        let rounded = round_up(size, GRANULARITY).ok_or(oom)?;
        let base = self.arena.base_address();
        let fit = match self.free.find_fit(rounded, alignment, base) {
            Some(fit) => fit,
            None => {
                self.grow_for(rounded, alignment, symbol)?;
                self.free.find_fit(rounded, alignment, base).ok_or(oom)?
            }
        };
        self.carve(fit, rounded)
    }

    /// Commit enough arena to guarantee a fit for `rounded` at `alignment`.
    fn grow_for(
        &mut self,
        rounded: usize,
        alignment: usize,
        symbol: &'static str,
    ) -> Result<(), HeapError> {
        let oom = HeapError::OutOfMemory { requested: rounded };
        let worst_padding = if alignment > MIN_ALIGN {
            alignment.checked_add(MIN_ARENA_SIZE).ok_or(oom)?
        } else {
            0
        };
        let mut need = HEADER_SIZE
            .checked_add(rounded)
            .and_then(|need| need.checked_add(worst_padding))
            .ok_or(oom)?;

        let last_offset = self.last_block;
        let last = self.neighbour(last_offset)?;
        if last.is_free {
            need = need
                .saturating_sub(last.size + HEADER_SIZE)
                .max(GRANULARITY);
        }

        if let Some(limit) = self.config.fragmentation_limit {
            let ratio = self.fragmentation_ratio();
            if self.free.free_bytes() >= rounded && ratio > limit {
                return Err(HeapError::FragmentationLimitExceeded {
                    requested: rounded,
                    ratio_permille: (ratio * 1000.0).round() as u16,
                });
            }
        }

        let step = need
            .max(self.config.growth_step)
            .min(self.arena.remaining());
        if step < need {
            return Err(oom);
        }
        let old_end = self.arena.grow(step)?;
        let grown = self.arena.total_size() - old_end;

        if last.is_free {
            self.free.remove(last_offset, last.size);
            let extended = BlockHeader::free(last.size + grown, last.prev_physical);
            self.arena.write_header(last_offset, &extended);
            self.free.insert(last_offset, extended.size);
        } else {
            let tail = BlockHeader::free(grown - HEADER_SIZE, Some(last_offset));
            self.arena.write_header(old_end, &tail);
            self.free.insert(old_end, tail.size);
            self.last_block = old_end;
        }

        HeapMetrics::inc(&self.metrics.grows);
        let total = self.arena.total_size();
        self.record(
            LogEvent::new(LogLevel::Info, symbol, "arena_grow", "ok")
                .offset(old_end)
                .size(grown)
                .details(format!("total_size={total};requested={rounded}")),
        );
        Ok(())
    }

    /// Turn the free block described by `fit` into an allocated block of
    /// `rounded` bytes, splitting off padding in front and any usable tail.
    fn carve(&mut self, fit: Fit, rounded: usize) -> Result<(usize, BlockHeader), HeapError> {
        let Fit {
            offset,
            block_size,
            padding,
        } = fit;
        let listed = self
            .arena
            .read_header(offset)
            .map_err(|_| HeapError::CorruptedHeader { offset })?;
        if !listed.is_free || listed.size != block_size {
            return Err(HeapError::CorruptedHeader { offset });
        }
        let next = listed.next_physical(offset);
        if next < self.arena.total_size() {
            self.arena
                .read_header(next)
                .map_err(|_| HeapError::CorruptedHeader { offset: next })?;
        }

        self.free.remove(offset, block_size);
        let mut block_offset = offset;
        let mut header = listed;
        if padding > 0 {
            let pad = BlockHeader::free(padding - HEADER_SIZE, listed.prev_physical);
            block_offset = offset + padding;
            header = BlockHeader::free(block_size - padding, Some(offset));
            block::relink_next(&mut self.arena, block_offset, &header)?;
            self.arena.write_header(block_offset, &header);
            self.arena.write_header(offset, &pad);
            self.free.insert(offset, pad.size);
            if self.last_block == offset {
                self.last_block = block_offset;
            }
        }

        if let Some((rest_offset, rest)) =
            block::split(&mut self.arena, block_offset, &mut header, rounded)?
        {
            self.free.insert(rest_offset, rest.size);
            if self.last_block == block_offset {
                self.last_block = rest_offset;
            }
            HeapMetrics::inc(&self.metrics.splits);
        }

        header.is_free = false;
        self.arena.write_header(block_offset, &header);
        self.bytes_in_use += header.size;
        self.allocated_blocks += 1;
        self.note_in_use();
        Ok((block_offset, header))
    }

    /// Verify `handle` names a live block and read everything freeing or
    /// resizing it may touch.
    fn locate(&self, handle: Handle) -> Result<Located, HeapError> {
        let addr = handle.addr();
        let foreign = HeapError::ForeignPointer { addr };
        let payload = self.arena.offset_of(addr).ok_or(foreign)?;
        if payload < HEADER_SIZE || payload % GRANULARITY != 0 {
            return Err(foreign);
        }
        let offset = payload - HEADER_SIZE;
        let header = match self.arena.read_header(offset) {
            Ok(header) => header,
            Err(fault) if fault.is_absent() => return Err(foreign),
            Err(_) => return Err(HeapError::CorruptedHeader { offset }),
        };
        if header.is_free {
            return Err(HeapError::DoubleFree { addr });
        }

        let prev = match header.prev_physical {
            Some(prev_offset) => {
                let prev = self.neighbour(prev_offset)?;
                if prev.next_physical(prev_offset) != offset {
                    return Err(HeapError::CorruptedHeader { offset });
                }
                Some((prev_offset, prev))
            }
            None => None,
        };

        let next_offset = header.next_physical(offset);
        let next = if next_offset < self.arena.total_size() {
            let next = self.neighbour(next_offset)?;
            if next.prev_physical != Some(offset) {
                return Err(HeapError::CorruptedHeader { offset });
            }
            if next.is_free {
                let after = next.next_physical(next_offset);
                if after < self.arena.total_size() {
                    self.neighbour(after)?;
                }
            }
            Some((next_offset, next))
        } else {
            if self.last_block != offset {
                return Err(HeapError::CorruptedHeader { offset });
            }
            None
        };

        Ok(Located {
            offset,
            header,
            prev,
            next,
        })
    }

    /// Read a header the engine expects to be a live block boundary.
    fn neighbour(&self, offset: usize) -> Result<BlockHeader, HeapError> {
        let header = self
            .arena
            .read_header(offset)
            .map_err(|_| HeapError::CorruptedHeader { offset })?;
        if header.is_free && !self.free.contains(offset, header.size) {
            return Err(HeapError::CorruptedHeader { offset });
        }
        Ok(header)
    }

    /// Mark a located block free and coalesce it. Returns the resulting
    /// free block.
    fn free_block(&mut self, located: &Located) -> Result<(usize, BlockHeader), HeapError> {
        let Located {
            offset, mut header, ..
        } = *located;
        let size = header.size;
        let prev = located.free_prev();
        let next = located.free_next();

        if let Some((prev_offset, prev)) = prev {
            self.free.remove(prev_offset, prev.size);
        }
        if let Some((next_offset, next)) = next {
            self.free.remove(next_offset, next.size);
        }
        header.is_free = true;
        self.arena.write_header(offset, &header);

        let mut start = offset;
        if let Some((next_offset, next)) = next {
            header = block::merge(&mut self.arena, offset, &header, next_offset, &next)?;
            if self.last_block == next_offset {
                self.last_block = offset;
            }
            HeapMetrics::inc(&self.metrics.merges);
        }
        if let Some((prev_offset, prev)) = prev {
            header = block::merge(&mut self.arena, prev_offset, &prev, offset, &header)?;
            start = prev_offset;
            if self.last_block == offset {
                self.last_block = prev_offset;
            }
            HeapMetrics::inc(&self.metrics.merges);
        }

        self.free.insert(start, header.size);
        self.bytes_in_use -= size;
        self.allocated_blocks -= 1;
        Ok((start, header))
    }

    /// Shrink or grow without moving. Returns false when the block cannot
    /// be resized where it is.
    fn resize_in_place(&mut self, located: &Located, rounded: usize) -> Result<bool, HeapError> {
        let Located {
            offset, mut header, ..
        } = *located;
        let old_size = header.size;

        if rounded <= old_size {
            if old_size - rounded < MIN_ARENA_SIZE {
                return Ok(true);
            }
            let Some((rest_offset, rest)) =
                block::split(&mut self.arena, offset, &mut header, rounded)?
            else {
                return Ok(true);
            };
            HeapMetrics::inc(&self.metrics.splits);
            let mut tail = rest;
            if let Some((next_offset, next)) = located.free_next() {
                self.free.remove(next_offset, next.size);
                tail = block::merge(&mut self.arena, rest_offset, &rest, next_offset, &next)?;
                if self.last_block == next_offset {
                    self.last_block = rest_offset;
                }
                HeapMetrics::inc(&self.metrics.merges);
            } else if self.last_block == offset {
                self.last_block = rest_offset;
            }
            self.free.insert(rest_offset, tail.size);
            self.bytes_in_use -= old_size - rounded;
            return Ok(true);
        }

        let Some((next_offset, next)) = located.free_next() else {
            return Ok(false);
        };
        let combined = old_size + HEADER_SIZE + next.size;
        if combined < rounded {
            return Ok(false);
        }
        self.free.remove(next_offset, next.size);
        header.size = combined;
        block::relink_next(&mut self.arena, offset, &header)?;
        self.arena.write_header(offset, &header);
        if self.last_block == next_offset {
            self.last_block = offset;
        }
        HeapMetrics::inc(&self.metrics.merges);

        if let Some((rest_offset, rest)) =
            block::split(&mut self.arena, offset, &mut header, rounded)?
        {
            self.free.insert(rest_offset, rest.size);
            if self.last_block == offset {
                self.last_block = rest_offset;
            }
            HeapMetrics::inc(&self.metrics.splits);
        }
        self.bytes_in_use += header.size - old_size;
        self.note_in_use();
        Ok(true)
    }

    /// Allocate a new block, copy the payload across and free the old one.
    fn move_allocation(
        &mut self,
        handle: Handle,
        located: &Located,
        new_size: usize,
    ) -> Result<Handle, HeapError> {
        let alignment = handle.implied_alignment(MAX_MOVE_ALIGN);
        let (new_offset, new_header) = match self.alloc_block(new_size, alignment, "reallocate") {
            Ok(block) => block,
            Err(err) => return Err(self.fail_alloc("reallocate", new_size, err)),
        };

        let len = located.header.size.min(new_size);
        self.arena.copy(
            BlockHeader::payload_offset(located.offset),
            BlockHeader::payload_offset(new_offset),
            len,
        );
        // Growth or carving may have changed the old block's neighbours.
        let relocated = match self.locate(handle) {
            Ok(relocated) => relocated,
            Err(err) => return Err(self.violation("reallocate", err)),
        };
        if let Err(err) = self.free_block(&relocated) {
            return Err(self.violation("reallocate", err));
        }

        HeapMetrics::inc(&self.metrics.reallocations_moved);
        self.record(
            LogEvent::new(LogLevel::Trace, "reallocate", "realloc_moved", "ok")
                .offset(new_offset)
                .size(new_header.size)
                .class(size_class::class_of(new_header.size))
                .details(format!(
                    "from_offset={};copied={len};alignment={alignment}",
                    located.offset
                )),
        );
        self.handle_at(new_offset, new_size)
    }

    /// Log an allocation failure and map it to what the caller sees.
    fn fail_alloc(&mut self, symbol: &'static str, size: usize, err: HeapError) -> HeapError {
        if err.is_violation() {
            return self.violation(symbol, err);
        }
        HeapMetrics::inc(&self.metrics.out_of_memory);
        let event = match err {
            HeapError::FragmentationLimitExceeded { .. } => "fragmentation_limit_exceeded",
            _ => "out_of_memory",
        };
        self.record(
            LogEvent::new(LogLevel::Warn, symbol, event, "failed")
                .size(size)
                .details(err.to_string()),
        );
        match err {
            HeapError::OutOfMemory { .. } | HeapError::FragmentationLimitExceeded { .. } => {
                HeapError::OutOfMemory { requested: size }
            }
            other => other,
        }
    }

    /// Count, log and apply the violation policy to a detected violation.
    fn violation(&mut self, symbol: &'static str, err: HeapError) -> HeapError {
        let (event, level) = match err {
            HeapError::DoubleFree { .. } => {
                HeapMetrics::inc(&self.metrics.double_frees);
                ("double_free_detected", LogLevel::Warn)
            }
            HeapError::ForeignPointer { .. } => {
                HeapMetrics::inc(&self.metrics.foreign_pointers);
                ("foreign_pointer_rejected", LogLevel::Warn)
            }
            HeapError::CorruptedHeader { .. } => {
                HeapMetrics::inc(&self.metrics.corrupted_headers);
                ("corrupted_header_detected", LogLevel::Error)
            }
            _ => return err,
        };
        let fatal = self.config.violation_mode.is_fatal();
        let mut event = LogEvent::new(
            if fatal { LogLevel::Error } else { level },
            symbol,
            event,
            if fatal { "abort" } else { "rejected" },
        )
        .details(err.to_string());
        if let HeapError::CorruptedHeader { offset } = err {
            event = event.offset(offset);
        }
        self.record(event);

        if fatal {
            tracing::error!(target: "heapforge_core", error = %err, "heap violation, aborting");
            std::process::abort();
        }
        err
    }
}

impl Drop for Heap {
    fn drop(&mut self) {
        if self.allocated_blocks > 0 && !self.arena.is_released() {
            tracing::warn!(
                target: "heapforge_core",
                live_blocks = self.allocated_blocks,
                bytes_in_use = self.bytes_in_use,
                "heap dropped with live allocations"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use heapforge_membrane::ViolationMode;
    use tracing_test::traced_test;

    fn heap(bytes: usize) -> Heap {
        Heap::new(HeapConfig::fixed(bytes).with_violation_mode(ViolationMode::Report)).unwrap()
    }

    fn offset_of(heap: &Heap, handle: Handle) -> usize {
        handle.addr() - heap.base_address() - HEADER_SIZE
    }

    fn assert_accounting(heap: &Heap) {
        let stats = heap.stats();
        assert_eq!(
            stats.bytes_in_use + stats.bytes_free + stats.header_bytes,
            stats.total_capacity,
            "accounting identity broken: {stats:?}"
        );
        assert!(stats.high_watermark <= stats.total_capacity);
    }

    #[test]
    fn new_heap_is_one_free_block() {
        let heap = heap(1024);
        let stats = heap.stats();
        assert_eq!(stats.total_capacity, 1024);
        assert_eq!(stats.bytes_free, 992);
        assert_eq!(stats.free_blocks, 1);
        assert_eq!(stats.largest_free_block, 992);
        assert_eq!(stats.fragmentation_ratio, 0.0);
        assert_accounting(&heap);
    }

    #[test]
    fn allocate_splits_and_rounds() {
        let mut heap = heap(1024);
        let a = heap.allocate(100, 8).unwrap();
        assert_eq!(offset_of(&heap, a), 0);
        assert_eq!(heap.usable_size(a).unwrap(), 112);
        let b = heap.allocate(200, 8).unwrap();
        assert_eq!(offset_of(&heap, b), 144);
        assert_eq!(heap.usable_size(b).unwrap(), 208);
        let stats = heap.stats();
        assert_eq!(stats.allocated_blocks, 2);
        assert_eq!(stats.bytes_in_use, 320);
        assert_eq!(stats.free_blocks, 1);
        assert_eq!(stats.bytes_free, 1024 - 3 * HEADER_SIZE - 320);
        assert_accounting(&heap);
    }

    #[test]
    fn zero_size_requests_use_sentinel() {
        let mut heap = heap(1024);
        let z = heap.allocate(0, 8).unwrap();
        assert_eq!(z.addr(), MIN_ALIGN);
        assert_eq!(heap.usable_size(z).unwrap(), 0);
        assert!(heap.payload(z).unwrap().is_empty());
        heap.deallocate(z).unwrap();
        heap.deallocate(z).unwrap();
        assert_eq!(heap.stats().allocated_blocks, 0);
        assert_eq!(heap.metrics().snapshot().zero_size_requests, 1);
    }

    #[test]
    fn invalid_alignment_is_rejected() {
        let mut heap = heap(1024);
        assert_eq!(
            heap.allocate(16, 24),
            Err(HeapError::InvalidAlignment { alignment: 24 })
        );
        assert_eq!(
            heap.allocate(16, 0),
            Err(HeapError::InvalidAlignment { alignment: 0 })
        );
        assert_eq!(heap.stats().allocated_blocks, 0);
    }

    #[test]
    fn free_merges_both_neighbours() {
        let mut heap = heap(1024);
        let a = heap.allocate(64, 16).unwrap();
        let b = heap.allocate(64, 16).unwrap();
        let c = heap.allocate(64, 16).unwrap();
        heap.deallocate(a).unwrap();
        heap.deallocate(c).unwrap();
        assert_eq!(heap.stats().free_blocks, 2);
        heap.deallocate(b).unwrap();
        let stats = heap.stats();
        assert_eq!(stats.free_blocks, 1);
        assert_eq!(stats.largest_free_block, 992);
        assert_eq!(heap.last_block(), 0);
        assert_accounting(&heap);
    }

    #[test]
    fn double_free_is_reported_and_heap_stays_usable() {
        let mut heap = heap(1024);
        let a = heap.allocate(64, 16).unwrap();
        let _b = heap.allocate(64, 16).unwrap();
        heap.deallocate(a).unwrap();
        assert_eq!(
            heap.deallocate(a),
            Err(HeapError::DoubleFree { addr: a.addr() })
        );
        assert!(heap.allocate(32, 16).is_ok());
        assert_eq!(heap.metrics().snapshot().double_frees, 1);
    }

    #[test]
    fn stale_header_inside_merged_block_is_double_free() {
        let mut heap = heap(1024);
        let a = heap.allocate(64, 16).unwrap();
        let b = heap.allocate(64, 16).unwrap();
        let _c = heap.allocate(64, 16).unwrap();
        heap.deallocate(b).unwrap();
        heap.deallocate(a).unwrap();
        assert_eq!(
            heap.deallocate(b),
            Err(HeapError::DoubleFree { addr: b.addr() })
        );
    }

    #[test]
    fn foreign_pointers_are_rejected() {
        let mut heap = heap(1024);
        let a = heap.allocate(64, 16).unwrap();
        let inside = Handle::from_addr(a.addr() + 16).unwrap();
        assert_eq!(
            heap.deallocate(inside),
            Err(HeapError::ForeignPointer {
                addr: inside.addr()
            })
        );
        let misaligned = Handle::from_addr(a.addr() + 3).unwrap();
        assert!(matches!(
            heap.deallocate(misaligned),
            Err(HeapError::ForeignPointer { .. })
        ));
        let outside = Handle::from_addr(0x7).unwrap();
        assert!(matches!(
            heap.deallocate(outside),
            Err(HeapError::ForeignPointer { .. })
        ));
        assert_eq!(heap.stats().allocated_blocks, 1);
        heap.deallocate(a).unwrap();
    }

    #[test]
    fn corrupted_header_is_detected_without_mutation() {
        let mut heap = heap(1024);
        let a = heap.allocate(64, 16).unwrap();
        let before = heap.stats();
        let offset = offset_of(&heap, a);
        heap.arena.bytes_mut(offset + 8, 1)[0] ^= 0x20;
        assert_eq!(
            heap.deallocate(a),
            Err(HeapError::CorruptedHeader { offset })
        );
        assert_eq!(heap.stats(), before);
        assert_eq!(heap.metrics().snapshot().corrupted_headers, 1);
    }

    #[test]
    fn grows_when_arena_is_exhausted() {
        let mut heap = Heap::new(
            HeapConfig::default()
                .with_initial_size(1024)
                .with_max_size(8192)
                .with_growth_step(1024)
                .with_violation_mode(ViolationMode::Report),
        )
        .unwrap();
        let a = heap.allocate(900, 16).unwrap();
        let b = heap.allocate(900, 16).unwrap();
        let stats = heap.stats();
        assert!(stats.total_capacity > 1024);
        assert_eq!(heap.metrics().snapshot().grows, 1);
        assert_accounting(&heap);
        heap.deallocate(a).unwrap();
        heap.deallocate(b).unwrap();
        assert_eq!(heap.stats().free_blocks, 1);
    }

    #[test]
    fn growth_is_refused_before_commit_on_corrupted_tail() {
        let mut heap = Heap::new(
            HeapConfig::default()
                .with_initial_size(1024)
                .with_max_size(8192)
                .with_growth_step(1024)
                .with_violation_mode(ViolationMode::Report),
        )
        .unwrap();
        let a = heap.allocate(64, 16).unwrap();
        let tail = heap.last_block();
        assert_ne!(tail, offset_of(&heap, a));
        heap.arena.bytes_mut(tail + 8, 1)[0] ^= 0x20;

        assert_eq!(
            heap.allocate(2000, 16),
            Err(HeapError::CorruptedHeader { offset: tail })
        );
        assert_eq!(heap.stats().total_capacity, 1024);
        assert_eq!(heap.last_block(), tail);
        let snapshot = heap.metrics().snapshot();
        assert_eq!(snapshot.grows, 0);
        assert_eq!(snapshot.corrupted_headers, 1);
    }

    #[test]
    fn out_of_memory_leaves_heap_untouched() {
        let mut heap = heap(1024);
        let a = heap.allocate(512, 16).unwrap();
        let before = heap.stats();
        assert_eq!(
            heap.allocate(1024, 16),
            Err(HeapError::OutOfMemory { requested: 1024 })
        );
        assert_eq!(heap.stats(), before);
        heap.deallocate(a).unwrap();
    }

    #[test]
    fn fragmentation_limit_refuses_growth() {
        let mut heap = Heap::new(
            HeapConfig::default()
                .with_initial_size(1024)
                .with_max_size(64 * 1024)
                .with_fragmentation_limit(0.2)
                .with_violation_mode(ViolationMode::Report),
        )
        .unwrap();
        let mut keep = Vec::new();
        let mut spare = Vec::new();
        for i in 0..10 {
            let handle = heap.allocate(48, 16).unwrap();
            if i % 2 == 0 {
                spare.push(handle);
            } else {
                keep.push(handle);
            }
        }
        for handle in spare {
            heap.deallocate(handle).unwrap();
        }
        // Plenty of free bytes, but no single block holds 256.
        assert!(heap.stats().bytes_free >= 256);
        assert!(heap.stats().fragmentation_ratio > 0.2);
        assert_eq!(
            heap.allocate(256, 16),
            Err(HeapError::OutOfMemory { requested: 256 })
        );
        assert!(
            heap.lifecycle_logs()
                .any(|record| record.event == "fragmentation_limit_exceeded")
        );
        assert_eq!(heap.metrics().snapshot().grows, 0);
    }

    #[test]
    fn realloc_shrinks_and_grows_in_place() {
        let mut heap = heap(1024);
        let a = heap.allocate(256, 16).unwrap();
        let b = heap.reallocate(a, 64).unwrap();
        assert_eq!(a, b);
        assert_eq!(heap.usable_size(b).unwrap(), 64);
        assert_eq!(heap.stats().free_blocks, 1, "tail merges with free successor");
        let c = heap.reallocate(b, 400).unwrap();
        assert_eq!(a, c);
        assert_eq!(heap.usable_size(c).unwrap(), 400);
        let snapshot = heap.metrics().snapshot();
        assert_eq!(snapshot.reallocations_in_place, 2);
        assert_eq!(snapshot.reallocations_moved, 0);
        assert_accounting(&heap);
    }

    #[test]
    fn realloc_moves_and_preserves_contents() {
        let mut heap = heap(2048);
        let a = heap.allocate(32, 16).unwrap();
        let _fence = heap.allocate(32, 16).unwrap();
        heap.payload_mut(a).unwrap().copy_from_slice(&[7u8; 32]);
        let b = heap.reallocate(a, 512).unwrap();
        assert_ne!(a, b);
        assert_eq!(&heap.payload(b).unwrap()[..32], &[7u8; 32]);
        assert_eq!(heap.metrics().snapshot().reallocations_moved, 1);
        assert!(matches!(
            heap.deallocate(a),
            Err(HeapError::DoubleFree { .. })
        ));
        assert_accounting(&heap);
    }

    #[test]
    fn realloc_failure_keeps_original() {
        let mut heap = heap(1024);
        let a = heap.allocate(64, 16).unwrap();
        let _fence = heap.allocate(64, 16).unwrap();
        heap.payload_mut(a).unwrap().fill(0xAB);
        assert!(matches!(
            heap.reallocate(a, 4096),
            Err(HeapError::OutOfMemory { .. })
        ));
        assert!(heap.payload(a).unwrap().iter().all(|&b| b == 0xAB));
        heap.deallocate(a).unwrap();
    }

    #[test]
    fn realloc_edge_cases() {
        let mut heap = heap(1024);
        let z = heap.allocate(0, 16).unwrap();
        let a = heap.reallocate(z, 48).unwrap();
        assert_eq!(heap.usable_size(a).unwrap(), 48);
        let z = heap.reallocate(a, 0).unwrap();
        // Payload at base + 32 implies 32-byte alignment.
        assert_eq!(z.addr(), 32);
        assert_eq!(heap.stats().allocated_blocks, 0);
    }

    #[test]
    fn zero_size_handles_keep_requested_alignment() {
        let mut heap = heap(64 * 1024);
        for alignment in [32, 64, 256, 4096, 8192] {
            let z = heap.allocate(0, alignment).unwrap();
            assert_eq!(z.addr(), alignment);
            assert_eq!(heap.usable_size(z).unwrap(), 0);
            let grown = heap.reallocate(z, 100).unwrap();
            assert_eq!(grown.addr() % alignment, 0, "alignment {alignment}");
            heap.deallocate(grown).unwrap();
        }
        assert_eq!(heap.metrics().snapshot().zero_size_requests, 5);
        assert_accounting(&heap);
    }

    #[test]
    fn unissued_power_of_two_addresses_are_foreign() {
        let mut heap = heap(1024);
        let stray = Handle::from_addr(1 << 20).unwrap();
        assert_eq!(
            heap.deallocate(stray),
            Err(HeapError::ForeignPointer { addr: 1 << 20 })
        );
        assert_eq!(
            heap.reallocate(stray, 64),
            Err(HeapError::ForeignPointer { addr: 1 << 20 })
        );
        assert!(matches!(
            heap.usable_size(stray),
            Err(HeapError::ForeignPointer { .. })
        ));
        assert_eq!(heap.metrics().snapshot().foreign_pointers, 2);
        assert_eq!(heap.stats().allocated_blocks, 0);

        // Once issued, the same address is a sentinel.
        let z = heap.allocate(0, 1 << 20).unwrap();
        assert_eq!(z, stray);
        assert_eq!(heap.deallocate(stray), Ok(()));
        assert!(matches!(
            heap.deallocate(Handle::from_addr(1 << 21).unwrap()),
            Err(HeapError::ForeignPointer { .. })
        ));
    }

    #[test]
    fn moved_realloc_keeps_over_alignment() {
        for alignment in [64, 256, 4096] {
            let mut heap = heap(64 * 1024);
            let a = heap.allocate(40, alignment).unwrap();
            // Too big for the padding block in front of `a`, so it lands
            // right behind it and blocks growth in place.
            let fence = heap.allocate(5000, 16).unwrap();
            assert!(fence > a);
            heap.payload_mut(a).unwrap()[..40].fill(0x5A);
            let b = heap.reallocate(a, 2000).unwrap();
            assert_ne!(a, b, "alignment {alignment}: expected a move");
            assert_eq!(b.addr() % alignment, 0, "alignment {alignment}");
            assert!(heap.payload(b).unwrap()[..40].iter().all(|&byte| byte == 0x5A));
            assert_eq!(heap.metrics().snapshot().reallocations_moved, 1);
            assert_accounting(&heap);
        }
    }

    #[test]
    fn release_requires_empty_heap() {
        let mut heap = heap(1024);
        let a = heap.allocate(64, 16).unwrap();
        assert_eq!(
            heap.release(),
            Err(HeapError::ArenaNotEmpty { live_blocks: 1 })
        );
        heap.deallocate(a).unwrap();
        heap.release().unwrap();
        assert!(heap.is_released());
        assert_eq!(
            heap.allocate(16, 16),
            Err(HeapError::OutOfMemory { requested: 16 })
        );
    }

    #[test]
    fn high_watermark_tracks_peak() {
        let mut heap = heap(1024);
        let a = heap.allocate(200, 16).unwrap();
        let b = heap.allocate(200, 16).unwrap();
        heap.deallocate(a).unwrap();
        heap.deallocate(b).unwrap();
        assert_eq!(heap.stats().high_watermark, 2 * (208 + HEADER_SIZE));
    }

    #[test]
    fn allocate_zeroed_clears_reused_memory() {
        let mut heap = heap(1024);
        let a = heap.allocate(64, 16).unwrap();
        heap.payload_mut(a).unwrap().fill(0xFF);
        heap.deallocate(a).unwrap();
        let b = heap.allocate_zeroed(64, 16).unwrap();
        assert!(heap.payload(b).unwrap().iter().all(|&byte| byte == 0));
    }

    #[test]
    fn lifecycle_logs_include_trace_and_decision_ids() {
        let mut heap = heap(1024);
        let a = heap.allocate(64, 16).unwrap();
        heap.deallocate(a).unwrap();
        let _ = heap.deallocate(a);
        let logs = heap.drain_lifecycle_logs();
        assert!(logs.iter().all(|entry| entry.decision_id > 0));
        assert!(
            logs.iter()
                .all(|entry| entry.trace_id.starts_with("core::heap::"))
        );
        assert!(logs.iter().any(|entry| entry.event == "heap_created"));
        assert!(
            logs.iter()
                .any(|entry| entry.level == LogLevel::Trace && entry.symbol == "allocate")
        );
        assert!(logs.iter().any(|entry| {
            entry.level == LogLevel::Warn && entry.event == "double_free_detected"
        }));
        assert_eq!(heap.lifecycle_logs().len(), 0);
    }

    #[test]
    #[traced_test]
    fn violations_are_emitted_as_tracing_events() {
        let mut heap = heap(1024);
        let bogus = Handle::from_addr(heap.base_address() + 512 + HEADER_SIZE).unwrap();
        let _ = heap.deallocate(bogus);
        assert!(logs_contain("foreign_pointer_rejected"));
    }
}
