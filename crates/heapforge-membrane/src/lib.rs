//! Integrity membrane for heapforge.
//!
//! Everything the allocator core needs to decide whether a block header can
//! be trusted, and what to do when it cannot:
//! - **Header fingerprints** (`fingerprint`): keyed SipHash over the header
//!   fields, acting as the per-block canary
//! - **Configuration** (`config`): abort-or-report policy for memory-safety
//!   violations
//! - **Metrics** (`metrics`): atomic counters for observability

#![deny(unsafe_code)]

pub mod config;
pub mod fingerprint;
pub mod metrics;

pub use config::{ViolationMode, violation_mode};
pub use fingerprint::FingerprintKey;
pub use metrics::{HeapMetrics, MetricsSnapshot};
