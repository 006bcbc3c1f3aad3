//! Heap construction parameters.
//!
//! `HeapConfig` can be built in code with the `with_*` methods, deserialized
//! with serde (missing fields take their defaults), or overlaid from the
//! environment:
//! - `HEAPFORGE_INITIAL_SIZE`, `HEAPFORGE_MAX_SIZE`, `HEAPFORGE_GROWTH_STEP`:
//!   byte counts, optionally suffixed with `k`, `m` or `g` (binary units)
//! - `HEAPFORGE_VIOLATIONS`: `abort` or `report`

use heapforge_membrane::{ViolationMode, violation_mode};
use serde::{Deserialize, Serialize};

use crate::block::MIN_ARENA_SIZE;
use crate::error::HeapError;

const KIB: usize = 1024;
const MIB: usize = 1024 * KIB;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HeapConfig {
    /// Bytes committed when the heap is created.
    pub initial_size: usize,
    /// Reservation ceiling; the arena never grows past it.
    pub max_size: usize,
    /// Minimum number of bytes committed per growth.
    pub growth_step: usize,
    /// Refuse growth while the fragmentation ratio is above this value
    /// and free memory alone would cover the request.
    pub fragmentation_limit: Option<f64>,
    pub violation_mode: ViolationMode,
    /// Lifecycle records kept in memory; 0 keeps none.
    pub log_capacity: usize,
}

impl Default for HeapConfig {
    fn default() -> Self {
        Self {
            initial_size: 64 * KIB,
            max_size: 64 * MIB,
            growth_step: 64 * KIB,
            fragmentation_limit: None,
            violation_mode: ViolationMode::default(),
            log_capacity: 1024,
        }
    }
}

impl HeapConfig {
    /// Defaults overlaid with the `HEAPFORGE_*` environment variables.
    pub fn from_env() -> Result<Self, HeapError> {
        let mut config = Self {
            violation_mode: violation_mode(),
            ..Self::default()
        };
        if let Some(size) = env_size("HEAPFORGE_INITIAL_SIZE")? {
            config.initial_size = size;
        }
        if let Some(size) = env_size("HEAPFORGE_MAX_SIZE")? {
            config.max_size = size;
        }
        if let Some(size) = env_size("HEAPFORGE_GROWTH_STEP")? {
            config.growth_step = size;
        }
        config.validate()?;
        Ok(config)
    }

    #[must_use]
    pub fn with_initial_size(mut self, bytes: usize) -> Self {
        self.initial_size = bytes;
        self
    }

    #[must_use]
    pub fn with_max_size(mut self, bytes: usize) -> Self {
        self.max_size = bytes;
        self
    }

    #[must_use]
    pub fn with_growth_step(mut self, bytes: usize) -> Self {
        self.growth_step = bytes;
        self
    }

    #[must_use]
    pub fn with_fragmentation_limit(mut self, limit: f64) -> Self {
        self.fragmentation_limit = Some(limit);
        self
    }

    #[must_use]
    pub fn with_violation_mode(mut self, mode: ViolationMode) -> Self {
        self.violation_mode = mode;
        self
    }

    #[must_use]
    pub fn with_log_capacity(mut self, records: usize) -> Self {
        self.log_capacity = records;
        self
    }

    /// A fixed-size heap of `bytes` that never grows.
    #[must_use]
    pub fn fixed(bytes: usize) -> Self {
        Self::default().with_initial_size(bytes).with_max_size(bytes)
    }

    pub fn validate(&self) -> Result<(), HeapError> {
        let invalid = |reason| Err(HeapError::InvalidConfig { reason });
        if self.initial_size < MIN_ARENA_SIZE {
            return invalid("initial_size cannot hold a single block");
        }
        if self.max_size < self.initial_size {
            return invalid("max_size is smaller than initial_size");
        }
        if self.max_size > isize::MAX as usize {
            return invalid("max_size exceeds the address space");
        }
        if self.growth_step == 0 {
            return invalid("growth_step must be non-zero");
        }
        if let Some(limit) = self.fragmentation_limit {
            if !(0.0..=1.0).contains(&limit) {
                return invalid("fragmentation_limit must lie in [0, 1]");
            }
        }
        Ok(())
    }
}

fn env_size(name: &str) -> Result<Option<usize>, HeapError> {
    match std::env::var(name) {
        Ok(raw) => parse_size(&raw).map(Some).ok_or(HeapError::InvalidConfig {
            reason: "size variable is not a byte count",
        }),
        Err(_) => Ok(None),
    }
}

/// Parse `4096`, `64k`, `64KiB`, `8m`, `1g` (case-insensitive, binary units).
pub fn parse_size(raw: &str) -> Option<usize> {
    let s = raw.trim().to_ascii_lowercase();
    let s = s.strip_suffix("ib").or_else(|| s.strip_suffix('b')).unwrap_or(&s);
    let (digits, unit) = match s.as_bytes().last()? {
        b'k' => (&s[..s.len() - 1], KIB),
        b'm' => (&s[..s.len() - 1], MIB),
        b'g' => (&s[..s.len() - 1], 1024 * MIB),
        _ => (s, 1),
    };
    digits.trim().parse::<usize>().ok()?.checked_mul(unit)
}
