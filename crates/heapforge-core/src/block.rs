//! Block headers and the physical block operations built on them.
//!
//! Every block, free or allocated, starts with a 32-byte inline header:
//!
//! ```text
//!   offset  field        notes
//!   0..4    magic        BLOCK_MAGIC, little endian
//!   4..8    flags        bit 0 = free
//!   8..16   size         payload bytes (multiple of GRANULARITY)
//!   16..24  prev         arena offset of the previous physical block, or u64::MAX
//!   24..32  fingerprint  keyed SipHash over (offset, size, prev, flags)
//! ```
//!
//! The next physical block is implied: it starts at
//! `offset + HEADER_SIZE + size`. Headers alone are enough to walk the
//! whole arena.

use heapforge_membrane::FingerprintKey;

use crate::arena::Arena;
use crate::error::HeapError;

/// Bytes of inline metadata in front of every payload.
pub const HEADER_SIZE: usize = 32;

/// All payload sizes are multiples of this.
pub const GRANULARITY: usize = 16;

/// Minimum payload alignment; smaller requests are raised to it.
pub const MIN_ALIGN: usize = 16;

/// Smallest payload a block may have. Splits never leave a smaller remainder.
pub const MIN_BLOCK_SIZE: usize = 16;

/// Smallest arena able to hold one block.
pub const MIN_ARENA_SIZE: usize = HEADER_SIZE + MIN_BLOCK_SIZE;

const BLOCK_MAGIC: u32 = 0x4846_424B; // "HFBK"
const FLAG_FREE: u32 = 1;
const NO_PREV: u64 = u64::MAX;

/// Why a header failed to decode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderFault {
    /// Header would lie outside the committed span.
    OutOfBounds,
    /// Magic word absent: no block starts here.
    MissingMagic,
    /// Unknown flag bits set.
    BadFlags,
    /// Fingerprint does not match the fields.
    Fingerprint,
    /// Size or link fields are impossible for this offset.
    BadGeometry,
}

impl HeaderFault {
    /// True when the bytes never looked like a header at all.
    pub const fn is_absent(self) -> bool {
        matches!(self, Self::OutOfBounds | Self::MissingMagic)
    }
}

/// Decoded per-block bookkeeping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockHeader {
    /// Usable payload size, excluding the header.
    pub size: usize,
    /// Whether the block is on a free list.
    pub is_free: bool,
    /// Offset of the previous block in memory order.
    pub prev_physical: Option<usize>,
}

impl BlockHeader {
    pub const fn free(size: usize, prev_physical: Option<usize>) -> Self {
        Self {
            size,
            is_free: true,
            prev_physical,
        }
    }

    /// Offset of the block that follows this one in memory.
    pub const fn next_physical(&self, offset: usize) -> usize {
        offset + HEADER_SIZE + self.size
    }

    /// Offset of this block's payload.
    pub const fn payload_offset(offset: usize) -> usize {
        offset + HEADER_SIZE
    }

    fn flags(&self) -> u32 {
        if self.is_free { FLAG_FREE } else { 0 }
    }

    fn prev_word(&self) -> usize {
        self.prev_physical.unwrap_or(usize::MAX)
    }

    /// Serialize the header as stored at `offset`.
    pub fn encode(&self, offset: usize, key: &FingerprintKey) -> [u8; HEADER_SIZE] {
        let flags = self.flags();
        let checksum = key.header_checksum(offset, self.size, self.prev_word(), flags);
        let prev = self.prev_physical.map_or(NO_PREV, |p| p as u64);

        let mut buf = [0u8; HEADER_SIZE];
        buf[0..4].copy_from_slice(&BLOCK_MAGIC.to_le_bytes());
        buf[4..8].copy_from_slice(&flags.to_le_bytes());
        buf[8..16].copy_from_slice(&(self.size as u64).to_le_bytes());
        buf[16..24].copy_from_slice(&prev.to_le_bytes());
        buf[24..32].copy_from_slice(&checksum.to_le_bytes());
        buf
    }

    /// Deserialize and verify a header read from `offset`.
    pub fn decode(
        offset: usize,
        buf: &[u8; HEADER_SIZE],
        key: &FingerprintKey,
    ) -> Result<Self, HeaderFault> {
        let word32 = |at: usize| u32::from_le_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]]);
        let word64 = |at: usize| {
            let mut raw = [0u8; 8];
            raw.copy_from_slice(&buf[at..at + 8]);
            u64::from_le_bytes(raw)
        };

        if word32(0) != BLOCK_MAGIC {
            return Err(HeaderFault::MissingMagic);
        }
        let flags = word32(4);
        if flags & !FLAG_FREE != 0 {
            return Err(HeaderFault::BadFlags);
        }
        let size = usize::try_from(word64(8)).map_err(|_| HeaderFault::BadGeometry)?;
        let prev_physical = match word64(16) {
            NO_PREV => None,
            raw => Some(usize::try_from(raw).map_err(|_| HeaderFault::BadGeometry)?),
        };
        let header = Self {
            size,
            is_free: flags & FLAG_FREE != 0,
            prev_physical,
        };
        if !key.verify(offset, size, header.prev_word(), flags, word64(24)) {
            return Err(HeaderFault::Fingerprint);
        }
        if size < MIN_BLOCK_SIZE || size % GRANULARITY != 0 {
            return Err(HeaderFault::BadGeometry);
        }
        match prev_physical {
            Some(prev) if prev >= offset || prev % GRANULARITY != 0 => {
                Err(HeaderFault::BadGeometry)
            }
            None if offset != 0 => Err(HeaderFault::BadGeometry),
            _ => Ok(header),
        }
    }
}

/// Round `value` up to a multiple of `granularity` (a power of two).
pub const fn round_up(value: usize, granularity: usize) -> Option<usize> {
    match value.checked_add(granularity - 1) {
        Some(v) => Some(v & !(granularity - 1)),
        None => None,
    }
}

/// Padding needed to bring `address` up to a multiple of `alignment`.
pub fn align_offset(address: usize, alignment: usize) -> Result<usize, HeapError> {
    if !alignment.is_power_of_two() {
        return Err(HeapError::InvalidAlignment { alignment });
    }
    Ok(address.wrapping_neg() & (alignment - 1))
}

/// Bytes to skip at the front of the block at `offset` so its payload lands
/// on `alignment`.
///
/// Non-zero padding always leaves room for a free padding sub-block
/// (header plus `MIN_BLOCK_SIZE`), widening by whole multiples of
/// `alignment` when needed. Returns `None` on address overflow.
pub fn front_padding(base_address: usize, offset: usize, alignment: usize) -> Option<usize> {
    debug_assert!(alignment.is_power_of_two() && alignment >= MIN_ALIGN);
    let payload = base_address
        .checked_add(offset)?
        .checked_add(HEADER_SIZE)?;
    let mut padding = payload.wrapping_neg() & (alignment - 1);
    if padding == 0 {
        return Some(0);
    }
    while padding < MIN_ARENA_SIZE {
        padding = padding.checked_add(alignment)?;
    }
    Some(padding)
}

/// Split the block at `offset` so it keeps `requested` payload bytes.
///
/// The remainder becomes a free block immediately after it. Returns the
/// remainder's offset and header, or `None` when the remainder would be
/// smaller than `MIN_BLOCK_SIZE` (the block is then left whole). The caller
/// owns free-list membership of both halves.
pub(crate) fn split(
    arena: &mut Arena,
    offset: usize,
    header: &mut BlockHeader,
    requested: usize,
) -> Result<Option<(usize, BlockHeader)>, HeapError> {
    let Some(needed) = requested.checked_add(MIN_ARENA_SIZE) else {
        return Ok(None);
    };
    if header.size < needed {
        return Ok(None);
    }
    let rest_offset = offset + HEADER_SIZE + requested;
    let rest = BlockHeader::free(header.size - requested - HEADER_SIZE, Some(offset));
    relink_next(arena, rest_offset, &rest)?;
    arena.write_header(rest_offset, &rest);
    header.size = requested;
    arena.write_header(offset, header);
    Ok(Some((rest_offset, rest)))
}

/// Merge two physically adjacent free blocks into the first.
///
/// The second header stays behind as stale bytes inside the merged payload,
/// still flagged free.
pub(crate) fn merge(
    arena: &mut Arena,
    first_offset: usize,
    first: &BlockHeader,
    second_offset: usize,
    second: &BlockHeader,
) -> Result<BlockHeader, HeapError> {
    debug_assert!(first.is_free && second.is_free);
    debug_assert_eq!(first.next_physical(first_offset), second_offset);
    let merged = BlockHeader::free(first.size + HEADER_SIZE + second.size, first.prev_physical);
    relink_next(arena, first_offset, &merged)?;
    arena.write_header(first_offset, &merged);
    Ok(merged)
}

/// Point the successor of (`offset`, `header`) back at `offset`.
pub(crate) fn relink_next(
    arena: &mut Arena,
    offset: usize,
    header: &BlockHeader,
) -> Result<(), HeapError> {
    let next = header.next_physical(offset);
    if next >= arena.total_size() {
        return Ok(());
    }
    let mut successor = arena
        .read_header(next)
        .map_err(|_| HeapError::CorruptedHeader { offset: next })?;
    successor.prev_physical = Some(offset);
    arena.write_header(next, &successor);
    Ok(())
}
