//! Typed allocator handle.
//!
//! `TypedAlloc<T>` hands out storage for `n` values of `T` from a shared
//! `LockedHeap`. It carries nothing but a reference to the heap, so it is
//! `Copy`, can be rebound to another element type, and compares equal to any
//! other `TypedAlloc` over the same heap whatever its `T`: storage obtained
//! through one can be released through the other.

use std::alloc::Layout;
use std::fmt;
use std::marker::PhantomData;
use std::ptr::{self, NonNull};

use heapforge_core::HeapError;

use crate::locked::LockedHeap;

pub struct TypedAlloc<'h, T> {
    heap: &'h LockedHeap,
    _marker: PhantomData<fn() -> T>,
}

impl<'h, T> TypedAlloc<'h, T> {
    pub fn new(heap: &'h LockedHeap) -> Self {
        Self {
            heap,
            _marker: PhantomData,
        }
    }

    /// Storage for `n` uninitialized values of `T`.
    ///
    /// Zero elements, or a zero-sized `T`, yield a dangling pointer that
    /// owns nothing.
    pub fn allocate(&self, n: usize) -> Result<NonNull<T>, HeapError> {
        let layout = Layout::array::<T>(n).map_err(|_| HeapError::OutOfMemory {
            requested: n.saturating_mul(size_of::<T>()),
        })?;
        if layout.size() == 0 {
            return Ok(NonNull::dangling());
        }
        self.heap.allocate(layout).map(NonNull::cast)
    }

    /// Release storage obtained from `allocate(n)` on any allocator equal to
    /// this one.
    pub fn deallocate(&self, ptr: NonNull<T>, n: usize) -> Result<(), HeapError> {
        if n == 0 || size_of::<T>() == 0 {
            return Ok(());
        }
        self.heap.deallocate(ptr.cast())
    }

    /// The same heap, viewed as an allocator of `U`.
    pub fn rebind<U>(&self) -> TypedAlloc<'h, U> {
        TypedAlloc::new(self.heap)
    }

    pub fn heap(&self) -> &'h LockedHeap {
        self.heap
    }

    /// Upper bound on `n` for which `allocate(n)` could succeed.
    pub fn max_size(&self) -> usize {
        let capacity = self.heap.stats().max_capacity;
        match size_of::<T>() {
            0 => usize::MAX,
            size => capacity / size,
        }
    }
}

impl<T> Clone for TypedAlloc<'_, T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for TypedAlloc<'_, T> {}

impl<'h, T, U> PartialEq<TypedAlloc<'h, U>> for TypedAlloc<'h, T> {
    fn eq(&self, other: &TypedAlloc<'h, U>) -> bool {
        ptr::eq(self.heap, other.heap)
    }
}

impl<T> Eq for TypedAlloc<'_, T> {}

impl<T> fmt::Debug for TypedAlloc<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TypedAlloc")
            .field("heap", &ptr::from_ref(self.heap))
            .field("element", &std::any::type_name::<T>())
            .finish()
    }
}
