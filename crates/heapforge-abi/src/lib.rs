//! # heapforge-abi
//!
//! Adapters that expose a heapforge heap to code expecting the standard
//! allocation interfaces. Each adapter forwards to `heapforge_core::Heap`
//! and adds only locking and pointer translation.

pub mod locked;
pub mod typed;

pub use locked::{LockedHeap, MAX_LAYOUT_ALIGN};
pub use typed::TypedAlloc;
