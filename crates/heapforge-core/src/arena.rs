//! Backing memory region.
//!
//! The arena reserves one zero-initialized region of `max_size` bytes up
//! front and commits it to the heap in steps. Committed bytes never move,
//! so payload addresses stay stable for the life of an allocation. All raw
//! memory access in the crate goes through this module.

#![allow(unsafe_code)]

use std::alloc::{self, Layout};
use std::ptr::{self, NonNull};

use heapforge_membrane::FingerprintKey;

use crate::block::{BlockHeader, GRANULARITY, HEADER_SIZE, HeaderFault, MIN_ARENA_SIZE, round_up};
use crate::error::HeapError;

/// Alignment of the region base.
pub const ARENA_ALIGN: usize = 4096;

/// Owner of the heap's backing memory.
pub struct Arena {
    region: Option<NonNull<u8>>,
    layout: Layout,
    /// Committed bytes, all carved into blocks.
    total_size: usize,
    /// Peak bytes held by allocated blocks (payload plus headers).
    high_watermark: usize,
    key: FingerprintKey,
}

// SAFETY: the arena is the sole owner of its region and hands out no
// references that outlive a borrow of the arena itself.
unsafe impl Send for Arena {}

impl Arena {
    /// Reserve `max_size` bytes and commit the first `initial_size`.
    ///
    /// Both sizes are rounded down to `GRANULARITY`.
    pub fn reserve(initial_size: usize, max_size: usize) -> Result<Self, HeapError> {
        let initial = initial_size & !(GRANULARITY - 1);
        let max = max_size & !(GRANULARITY - 1);
        if initial < MIN_ARENA_SIZE {
            return Err(HeapError::InvalidConfig {
                reason: "initial_size cannot hold a single block",
            });
        }
        if max < initial {
            return Err(HeapError::InvalidConfig {
                reason: "max_size is smaller than initial_size",
            });
        }
        let layout = Layout::from_size_align(max, ARENA_ALIGN).map_err(|_| {
            HeapError::InvalidConfig {
                reason: "max_size exceeds the address space",
            }
        })?;

        // SAFETY: layout size is at least MIN_ARENA_SIZE, so non-zero.
        let raw = unsafe { alloc::alloc_zeroed(layout) };
        let region = NonNull::new(raw).ok_or(HeapError::OutOfMemory { requested: max })?;
        let key = FingerprintKey::derive(region.as_ptr() as usize as u64);

        Ok(Self {
            region: Some(region),
            layout,
            total_size: initial,
            high_watermark: 0,
            key,
        })
    }

    /// Commit `additional` more bytes (rounded up to `GRANULARITY`).
    ///
    /// Returns the offset where the new span starts.
    pub fn grow(&mut self, additional: usize) -> Result<usize, HeapError> {
        let oom = HeapError::OutOfMemory {
            requested: additional,
        };
        if self.region.is_none() {
            return Err(oom);
        }
        let additional = round_up(additional, GRANULARITY).ok_or(oom)?;
        let new_total = self
            .total_size
            .checked_add(additional)
            .filter(|&total| total <= self.layout.size())
            .ok_or(oom)?;
        let old_end = self.total_size;
        self.total_size = new_total;
        Ok(old_end)
    }

    /// Return the region to the platform. Further allocation is impossible.
    pub fn release(&mut self) {
        if let Some(region) = self.region.take() {
            // SAFETY: region was obtained from alloc_zeroed with self.layout
            // and is released exactly once (take() clears it).
            unsafe { alloc::dealloc(region.as_ptr(), self.layout) };
            self.total_size = 0;
        }
    }

    pub fn is_released(&self) -> bool {
        self.region.is_none()
    }

    /// Address of offset 0, or 0 once released.
    pub fn base_address(&self) -> usize {
        self.region.map_or(0, |region| region.as_ptr() as usize)
    }

    pub fn total_size(&self) -> usize {
        self.total_size
    }

    /// Reserved ceiling the arena may grow to.
    pub fn max_size(&self) -> usize {
        if self.region.is_some() {
            self.layout.size()
        } else {
            0
        }
    }

    /// Bytes still available for growth.
    pub fn remaining(&self) -> usize {
        self.max_size().saturating_sub(self.total_size)
    }

    pub fn high_watermark(&self) -> usize {
        self.high_watermark
    }

    /// Record the current number of bytes held by allocated blocks.
    pub fn note_in_use(&mut self, bytes: usize) {
        self.high_watermark = self.high_watermark.max(bytes.min(self.total_size));
    }

    pub fn key(&self) -> &FingerprintKey {
        &self.key
    }

    /// Arena offset of `addr`, if it lies inside the committed span.
    pub fn offset_of(&self, addr: usize) -> Option<usize> {
        let base = self.base_address();
        if self.region.is_none() || addr < base {
            return None;
        }
        let offset = addr - base;
        (offset < self.total_size).then_some(offset)
    }

    /// Pointer to `offset`, carrying the region's provenance.
    pub fn ptr_at(&self, offset: usize) -> Option<NonNull<u8>> {
        let region = self.region?;
        if offset > self.total_size {
            return None;
        }
        NonNull::new(region.as_ptr().wrapping_add(offset))
    }

    /// Read and verify the header at `offset`.
    pub fn read_header(&self, offset: usize) -> Result<BlockHeader, HeaderFault> {
        let end = offset
            .checked_add(HEADER_SIZE)
            .filter(|&end| end <= self.total_size)
            .ok_or(HeaderFault::OutOfBounds)?;
        let mut buf = [0u8; HEADER_SIZE];
        buf.copy_from_slice(self.bytes(offset, HEADER_SIZE));
        let header = BlockHeader::decode(offset, &buf, &self.key)?;
        if header.size > self.total_size - end {
            return Err(HeaderFault::BadGeometry);
        }
        Ok(header)
    }

    /// Encode and store `header` at `offset`.
    pub fn write_header(&mut self, offset: usize, header: &BlockHeader) {
        let buf = header.encode(offset, &self.key);
        self.bytes_mut(offset, HEADER_SIZE).copy_from_slice(&buf);
    }

    /// Borrow `len` committed bytes at `offset`.
    ///
    /// Panics if the span is not committed; callers only pass spans derived
    /// from verified headers.
    pub fn bytes(&self, offset: usize, len: usize) -> &[u8] {
        let ptr = self.span(offset, len);
        // SAFETY: span() checked that [offset, offset + len) is inside the
        // committed, zero-initialized region, and &self prevents concurrent
        // mutation through the arena.
        unsafe { std::slice::from_raw_parts(ptr.as_ptr(), len) }
    }

    /// Mutably borrow `len` committed bytes at `offset`.
    pub fn bytes_mut(&mut self, offset: usize, len: usize) -> &mut [u8] {
        let ptr = self.span(offset, len);
        // SAFETY: as in bytes(); &mut self makes the borrow unique.
        unsafe { std::slice::from_raw_parts_mut(ptr.as_ptr(), len) }
    }

    /// Copy `len` bytes between committed spans; the spans may overlap.
    pub fn copy(&mut self, src: usize, dst: usize, len: usize) {
        let from = self.span(src, len);
        let to = self.span(dst, len);
        // SAFETY: both spans are committed and initialized; ptr::copy
        // tolerates overlap.
        unsafe { ptr::copy(from.as_ptr(), to.as_ptr(), len) };
    }

    fn span(&self, offset: usize, len: usize) -> NonNull<u8> {
        let region = match self.region {
            Some(region) => region,
            None => panic!("arena access after release"),
        };
        let in_bounds = offset
            .checked_add(len)
            .is_some_and(|end| end <= self.total_size);
        assert!(
            in_bounds,
            "arena span {offset:#x}+{len:#x} outside committed {:#x}",
            self.total_size
        );
        // SAFETY: offset <= total_size <= layout.size(), so the result stays
        // inside (or one past) the allocation.
        unsafe { NonNull::new_unchecked(region.as_ptr().add(offset)) }
    }
}

impl Drop for Arena {
    fn drop(&mut self) {
        self.release();
    }
}
