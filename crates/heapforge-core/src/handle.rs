//! Allocation handles.

use std::fmt;
use std::num::NonZeroUsize;
use std::ptr::NonNull;

use crate::block::MIN_ALIGN;

/// Upper end of the zero-size sentinel window.
///
/// A zero-byte request at alignment `A` gets the address `A` itself, the
/// way `NonNull::dangling` does. Up to this bound those addresses lie in
/// the unmapped first page and never inside an arena, which is page
/// aligned and never at zero. Larger sentinels are recognised only if the
/// heap issued them.
pub const ZERO_SIZE_ADDR: usize = 4096;

/// Opaque reference to an allocation's payload.
///
/// A handle is just the payload address. The heap keeps no table of live
/// handles; it proves validity from the block header at free time.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Handle {
    addr: NonZeroUsize,
}

impl Handle {
    /// Wrap a raw payload address. Returns `None` for zero.
    pub fn from_addr(addr: usize) -> Option<Self> {
        NonZeroUsize::new(addr).map(|addr| Self { addr })
    }

    /// Wrap a payload pointer.
    pub fn from_ptr(ptr: NonNull<u8>) -> Self {
        Self {
            addr: ptr.addr(),
        }
    }

    /// The handle returned for zero-byte requests at `alignment`.
    pub(crate) fn zero_sized(alignment: usize) -> Self {
        Self {
            addr: NonZeroUsize::new(alignment.max(MIN_ALIGN)).unwrap_or(NonZeroUsize::MIN),
        }
    }

    /// Payload address.
    pub fn addr(self) -> usize {
        self.addr.get()
    }

    /// True if this handle has the shape of a zero-size sentinel. The heap
    /// decides whether it actually issued it.
    pub(crate) fn looks_zero_sized(self) -> bool {
        self.addr() >= MIN_ALIGN && self.addr().is_power_of_two()
    }

    /// True for sentinels that are valid without any record of issue.
    pub(crate) fn in_sentinel_page(self) -> bool {
        self.looks_zero_sized() && self.addr() <= ZERO_SIZE_ADDR
    }

    /// Largest power of two dividing the address, capped at `cap`.
    pub(crate) fn implied_alignment(self, cap: usize) -> usize {
        let shift = self.addr().trailing_zeros().min(cap.trailing_zeros());
        (1usize << shift).max(MIN_ALIGN)
    }
}

impl fmt::Debug for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Handle({:#x})", self.addr())
    }
}

impl fmt::Pointer for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.addr())
    }
}
