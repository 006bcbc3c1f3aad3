//! Heap walking and integrity checks.
//!
//! Everything here is reconstructed from the inline block headers alone,
//! then cross-checked against the free lists and running totals the engine
//! keeps.

use std::collections::BTreeSet;

use serde::Serialize;

use crate::arena::Arena;
use crate::block::HEADER_SIZE;
use crate::error::HeapError;
use crate::heap::Heap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BlockState {
    Free,
    Allocated,
}

/// One block as recovered from its header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BlockInfo {
    /// Arena offset of the header.
    pub offset: usize,
    /// Payload address.
    pub address: usize,
    /// Payload bytes.
    pub size: usize,
    pub state: BlockState,
    pub prev_physical: Option<usize>,
    /// `None` for the last block.
    pub next_physical: Option<usize>,
}

/// Iterator over every block in address order.
///
/// Yields an error and stops at the first header that fails to decode or
/// whose back link disagrees with the walk.
pub struct BlockWalker<'a> {
    arena: &'a Arena,
    offset: usize,
    prev: Option<usize>,
    done: bool,
}

impl<'a> BlockWalker<'a> {
    pub(crate) fn new(arena: &'a Arena) -> Self {
        Self {
            arena,
            offset: 0,
            prev: None,
            done: false,
        }
    }
}

impl Iterator for BlockWalker<'_> {
    type Item = Result<BlockInfo, HeapError>;

    fn next(&mut self) -> Option<Self::Item> {
        let total = self.arena.total_size();
        if self.done || self.offset >= total {
            return None;
        }
        let offset = self.offset;
        let header = match self.arena.read_header(offset) {
            Ok(header) if header.prev_physical == self.prev => header,
            _ => {
                self.done = true;
                return Some(Err(HeapError::CorruptedHeader { offset }));
            }
        };
        let next = header.next_physical(offset);
        self.prev = Some(offset);
        self.offset = next;
        Some(Ok(BlockInfo {
            offset,
            address: self.arena.base_address() + offset + HEADER_SIZE,
            size: header.size,
            state: if header.is_free {
                BlockState::Free
            } else {
                BlockState::Allocated
            },
            prev_physical: header.prev_physical,
            next_physical: (next < total).then_some(next),
        }))
    }
}

/// Totals recomputed by a full walk.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct IntegrityReport {
    pub blocks: usize,
    pub allocated_blocks: usize,
    pub free_blocks: usize,
    pub bytes_in_use: usize,
    pub bytes_free: usize,
    pub header_bytes: usize,
    pub largest_free_block: usize,
    pub total_size: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct LeakedBlock {
    pub address: usize,
    pub size: usize,
}

/// Live allocations at the time of the report.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LeakReport {
    pub live: Vec<LeakedBlock>,
    pub live_blocks: usize,
    pub live_bytes: usize,
    /// False if the walk stopped at a corrupted header.
    pub complete: bool,
}

impl Heap {
    /// Walk every block in address order.
    pub fn blocks(&self) -> BlockWalker<'_> {
        BlockWalker::new(self.arena())
    }

    /// Verify the whole heap.
    ///
    /// Checks headers and fingerprints, physical links, coverage of the
    /// committed span, that no two free blocks touch, free-list membership,
    /// and the engine's running totals.
    pub fn check_integrity(&self) -> Result<IntegrityReport, HeapError> {
        let free_lists = self.free_lists();
        let mut report = IntegrityReport::default();
        let mut free_offsets = BTreeSet::new();
        let mut prev_free = false;
        let mut last = None;

        for block in self.blocks() {
            let block = block?;
            let corrupted = HeapError::CorruptedHeader {
                offset: block.offset,
            };
            report.blocks += 1;
            report.header_bytes += HEADER_SIZE;
            report.total_size += HEADER_SIZE + block.size;
            match block.state {
                BlockState::Free => {
                    if prev_free || !free_lists.contains(block.offset, block.size) {
                        return Err(corrupted);
                    }
                    free_offsets.insert(block.offset);
                    report.free_blocks += 1;
                    report.bytes_free += block.size;
                    report.largest_free_block = report.largest_free_block.max(block.size);
                    prev_free = true;
                }
                BlockState::Allocated => {
                    report.allocated_blocks += 1;
                    report.bytes_in_use += block.size;
                    prev_free = false;
                }
            }
            last = Some(block.offset);
        }

        if let Some(listed) = free_lists
            .iter()
            .map(|(offset, _)| offset)
            .find(|offset| !free_offsets.contains(offset))
        {
            return Err(HeapError::CorruptedHeader { offset: listed });
        }

        let tail = HeapError::CorruptedHeader {
            offset: self.last_block(),
        };
        if report.total_size != self.arena().total_size() {
            return Err(tail);
        }
        if last.is_some_and(|offset| offset != self.last_block()) {
            return Err(tail);
        }
        if report.allocated_blocks != self.allocated_blocks()
            || report.bytes_in_use != self.bytes_in_use()
            || report.free_blocks != free_lists.len()
            || report.bytes_free != free_lists.free_bytes()
        {
            return Err(tail);
        }
        Ok(report)
    }

    /// Live allocations, lowest address first.
    pub fn leak_report(&self) -> LeakReport {
        let mut report = LeakReport {
            complete: true,
            ..LeakReport::default()
        };
        for block in self.blocks() {
            match block {
                Ok(block) if block.state == BlockState::Allocated => {
                    report.live.push(LeakedBlock {
                        address: block.address,
                        size: block.size,
                    });
                    report.live_blocks += 1;
                    report.live_bytes += block.size;
                }
                Ok(_) => {}
                Err(_) => report.complete = false,
            }
        }
        report
    }
}
