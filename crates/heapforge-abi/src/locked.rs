//! Lock-wrapped heap with a `GlobalAlloc` surface.
//!
//! The core heap is single threaded. `LockedHeap` serializes every call
//! through one `parking_lot::Mutex` and translates between raw pointers and
//! heap handles. It holds no allocation policy of its own.
//!
//! The heap's own bookkeeping (free-list index, lifecycle log) lives on the
//! process allocator, so a `LockedHeap` cannot itself be installed as the
//! `#[global_allocator]`. It is meant for explicit use through the
//! `GlobalAlloc` trait or the typed adapter.

use std::alloc::{GlobalAlloc, Layout};
use std::ptr::{self, NonNull};

use heapforge_core::{Handle, Heap, HeapConfig, HeapError, HeapStats, MAX_MOVE_ALIGN};
use parking_lot::{Mutex, MutexGuard};

/// Largest alignment served through `GlobalAlloc`. Larger layouts get null.
pub const MAX_LAYOUT_ALIGN: usize = MAX_MOVE_ALIGN;

pub struct LockedHeap {
    inner: Mutex<Heap>,
}

impl LockedHeap {
    pub fn new(config: HeapConfig) -> Result<Self, HeapError> {
        Ok(Self::from_heap(Heap::new(config)?))
    }

    pub fn from_heap(heap: Heap) -> Self {
        Self {
            inner: Mutex::new(heap),
        }
    }

    /// Exclusive access to the underlying heap.
    pub fn lock(&self) -> MutexGuard<'_, Heap> {
        self.inner.lock()
    }

    pub fn into_inner(self) -> Heap {
        self.inner.into_inner()
    }

    pub fn stats(&self) -> HeapStats {
        self.inner.lock().stats()
    }

    /// Allocate memory for `layout`.
    pub fn allocate(&self, layout: Layout) -> Result<NonNull<u8>, HeapError> {
        if layout.align() > MAX_LAYOUT_ALIGN {
            return Err(HeapError::InvalidAlignment {
                alignment: layout.align(),
            });
        }
        let mut heap = self.inner.lock();
        let handle = heap.allocate(layout.size(), layout.align())?;
        heap.as_ptr(handle).ok_or(HeapError::OutOfMemory {
            requested: layout.size(),
        })
    }

    /// Allocate zero-filled memory for `layout`.
    pub fn allocate_zeroed(&self, layout: Layout) -> Result<NonNull<u8>, HeapError> {
        if layout.align() > MAX_LAYOUT_ALIGN {
            return Err(HeapError::InvalidAlignment {
                alignment: layout.align(),
            });
        }
        let mut heap = self.inner.lock();
        let handle = heap.allocate_zeroed(layout.size(), layout.align())?;
        heap.as_ptr(handle).ok_or(HeapError::OutOfMemory {
            requested: layout.size(),
        })
    }

    /// Free memory previously returned by this heap.
    pub fn deallocate(&self, ptr: NonNull<u8>) -> Result<(), HeapError> {
        self.inner.lock().deallocate(Handle::from_ptr(ptr))
    }

    /// Resize an allocation. On failure the original stays valid.
    pub fn reallocate(&self, ptr: NonNull<u8>, new_size: usize) -> Result<NonNull<u8>, HeapError> {
        let mut heap = self.inner.lock();
        let handle = heap.reallocate(Handle::from_ptr(ptr), new_size)?;
        heap.as_ptr(handle).ok_or(HeapError::OutOfMemory {
            requested: new_size,
        })
    }
}

unsafe impl GlobalAlloc for LockedHeap {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        self.allocate(layout).map_or(ptr::null_mut(), NonNull::as_ptr)
    }

    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        self.allocate_zeroed(layout)
            .map_or(ptr::null_mut(), NonNull::as_ptr)
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        let Some(ptr) = NonNull::new(ptr) else {
            return;
        };
        // Violations abort inside the heap unless it runs in report mode.
        if let Err(err) = self.deallocate(ptr) {
            tracing::warn!(target: "heapforge_abi", error = %err, "dealloc rejected");
        }
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        if layout.align() > MAX_LAYOUT_ALIGN {
            return ptr::null_mut();
        }
        let Some(ptr) = NonNull::new(ptr) else {
            return ptr::null_mut();
        };
        self.reallocate(ptr, new_size)
            .map_or(ptr::null_mut(), NonNull::as_ptr)
    }
}
