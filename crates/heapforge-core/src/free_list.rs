//! Segregated free lists.
//!
//! Each size class keeps its free blocks ordered by arena offset, so a scan
//! of one class visits candidates lowest address first. The manager only
//! tracks membership; headers in the arena remain the source of truth for
//! block geometry.

use std::collections::BTreeMap;

use serde::Serialize;

use crate::block::{HEADER_SIZE, MIN_ALIGN, MIN_ARENA_SIZE, front_padding};
use crate::size_class::{self, NUM_SIZE_CLASSES};

/// A free block able to serve a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fit {
    /// Offset of the free block's header.
    pub offset: usize,
    /// Payload size of the free block.
    pub block_size: usize,
    /// Bytes carved off the front as a padding sub-block (0 if none).
    pub padding: usize,
}

impl Fit {
    /// Offset of the header that will describe the allocation.
    pub fn block_offset(&self) -> usize {
        self.offset + self.padding
    }

    /// Payload bytes left for the allocation after padding.
    pub fn usable(&self) -> usize {
        self.block_size - self.padding
    }
}

/// Per-class occupancy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ClassOccupancy {
    pub class: usize,
    pub floor: usize,
    pub blocks: usize,
    pub bytes: usize,
}

/// Free-block index bucketed by size class.
#[derive(Debug, Clone)]
pub struct FreeLists {
    /// class -> (offset -> payload size)
    buckets: Vec<BTreeMap<usize, usize>>,
    len: usize,
    free_bytes: usize,
}

impl FreeLists {
    pub fn new() -> Self {
        Self {
            buckets: (0..NUM_SIZE_CLASSES).map(|_| BTreeMap::new()).collect(),
            len: 0,
            free_bytes: 0,
        }
    }

    /// Add a free block of `size` payload bytes at `offset`.
    pub fn insert(&mut self, offset: usize, size: usize) {
        let previous = self.buckets[size_class::class_of(size)].insert(offset, size);
        debug_assert!(previous.is_none(), "free block {offset:#x} inserted twice");
        if previous.is_none() {
            self.len += 1;
            self.free_bytes += size;
        }
    }

    /// Remove the block at `offset`. Returns false if it was not listed
    /// under the class for `size`.
    pub fn remove(&mut self, offset: usize, size: usize) -> bool {
        let bucket = &mut self.buckets[size_class::class_of(size)];
        match bucket.get(&offset) {
            Some(&listed) if listed == size => {
                bucket.remove(&offset);
                self.len -= 1;
                self.free_bytes -= size;
                true
            }
            _ => false,
        }
    }

    /// True if a block of `size` at `offset` is listed in its class.
    pub fn contains(&self, offset: usize, size: usize) -> bool {
        self.buckets[size_class::class_of(size)].get(&offset) == Some(&size)
    }

    /// First block that can hold `size` bytes at `alignment`.
    ///
    /// Classes are scanned upward from the one containing `size`; within a
    /// class the lowest offset that fits, padding included, wins. Only the
    /// floor class and classes too narrow to absorb the worst-case padding
    /// are walked block by block. Above that, every block fits, so the
    /// head of the first non-empty class is taken directly.
    pub fn find_fit(&self, size: usize, alignment: usize, base_address: usize) -> Option<Fit> {
        let floor_class = size_class::class_of(size);
        let worst_padding = if alignment <= MIN_ALIGN {
            0
        } else {
            alignment.saturating_add(MIN_ARENA_SIZE)
        };
        let always_fits = size.saturating_add(worst_padding);

        for (class, bucket) in self.buckets.iter().enumerate().skip(floor_class) {
            if class > floor_class && size_class::class_floor(class) > always_fits {
                if let Some(fit) = bucket
                    .iter()
                    .next()
                    .and_then(|(&offset, &block_size)| {
                        Self::fit_at(offset, block_size, size, alignment, base_address)
                    })
                {
                    return Some(fit);
                }
                continue;
            }
            let fit = bucket.iter().find_map(|(&offset, &block_size)| {
                Self::fit_at(offset, block_size, size, alignment, base_address)
            });
            if fit.is_some() {
                return fit;
            }
        }
        None
    }

    fn fit_at(
        offset: usize,
        block_size: usize,
        size: usize,
        alignment: usize,
        base_address: usize,
    ) -> Option<Fit> {
        let padding = front_padding(base_address, offset, alignment)?;
        let usable = block_size.checked_sub(padding)?;
        (usable >= size).then_some(Fit {
            offset,
            block_size,
            padding,
        })
    }

    /// Payload size of the largest free block, 0 if none.
    pub fn largest(&self) -> usize {
        self.buckets
            .iter()
            .rev()
            .find(|bucket| !bucket.is_empty())
            .and_then(|bucket| bucket.values().copied().max())
            .unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Sum of free payload bytes.
    pub fn free_bytes(&self) -> usize {
        self.free_bytes
    }

    /// Header bytes owned by free blocks.
    pub fn header_bytes(&self) -> usize {
        self.len * HEADER_SIZE
    }

    /// Every listed block as (offset, size), class by class.
    pub fn iter(&self) -> impl Iterator<Item = (usize, usize)> + '_ {
        self.buckets
            .iter()
            .flat_map(|bucket| bucket.iter().map(|(&offset, &size)| (offset, size)))
    }

    /// Counts and byte totals for each non-empty class.
    pub fn occupancy(&self) -> Vec<ClassOccupancy> {
        self.buckets
            .iter()
            .enumerate()
            .filter(|(_, bucket)| !bucket.is_empty())
            .map(|(class, bucket)| ClassOccupancy {
                class,
                floor: size_class::class_floor(class),
                blocks: bucket.len(),
                bytes: bucket.values().sum(),
            })
            .collect()
    }

    pub fn clear(&mut self) {
        self.buckets.iter_mut().for_each(BTreeMap::clear);
        self.len = 0;
        self.free_bytes = 0;
    }
}

impl Default for FreeLists {
    fn default() -> Self {
        Self::new()
    }
}
