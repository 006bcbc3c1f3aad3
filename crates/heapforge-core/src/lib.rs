//! # heapforge-core
//!
//! A single-arena dynamic memory allocator.
//!
//! The heap manages one contiguous region. Free blocks live on segregated
//! size-class lists and are found first-fit; oversized blocks are split,
//! and physically adjacent free blocks are merged on every free. Each block
//! carries an inline header with a keyed fingerprint, so the heap validates
//! handles from the headers alone and keeps no table of live allocations.
//!
//! ```no_run
//! use heapforge_core::{Heap, HeapConfig};
//!
//! let mut heap = Heap::new(HeapConfig::default())?;
//! let handle = heap.allocate(100, 8)?;
//! heap.payload_mut(handle)?.fill(0x2a);
//! heap.deallocate(handle)?;
//! # Ok::<(), heapforge_core::HeapError>(())
//! ```
//!
//! Only the `arena` module uses `unsafe`; everything else works in arena
//! offsets.

#![deny(unsafe_code)]

pub mod arena;
pub mod block;
pub mod config;
pub mod diagnostics;
pub mod error;
pub mod free_list;
pub mod handle;
pub mod heap;
pub mod log;
pub mod size_class;

pub use config::HeapConfig;
pub use diagnostics::{BlockInfo, BlockState, IntegrityReport, LeakReport, LeakedBlock};
pub use error::HeapError;
pub use handle::{Handle, ZERO_SIZE_ADDR};
pub use heap::{Heap, HeapStats, MAX_MOVE_ALIGN};
pub use heapforge_membrane::{HeapMetrics, MetricsSnapshot, ViolationMode};
pub use log::{LifecycleRecord, LogLevel};
