//! Violation policy configuration.
//!
//! The default policy is read from the `HEAPFORGE_VIOLATIONS` environment
//! variable:
//! - `abort` (default): a corrupted header, double free or foreign pointer is
//!   logged and the process aborts. Continuing would risk silent heap
//!   corruption.
//! - `report`: the same conditions are returned to the caller as ordinary
//!   errors and the heap stays usable. Intended for tests and tooling.

use std::sync::OnceLock;

use serde::{Deserialize, Serialize};

/// What the allocator does when it detects a memory-safety violation.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ViolationMode {
    /// Log the violation and abort the process.
    #[default]
    Abort,
    /// Return the violation as a recoverable error.
    Report,
}

impl ViolationMode {
    /// Parse from string (case-insensitive). Unknown values fall back to `Abort`.
    #[must_use]
    pub fn from_str_loose(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "report" | "recover" | "recoverable" | "test" => Self::Report,
            _ => Self::Abort,
        }
    }

    /// Returns true if violations terminate the process.
    #[must_use]
    pub const fn is_fatal(self) -> bool {
        matches!(self, Self::Abort)
    }

    /// Stable lowercase name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Abort => "abort",
            Self::Report => "report",
        }
    }
}

static ENV_MODE: OnceLock<ViolationMode> = OnceLock::new();

/// Violation mode from the environment (read on first call, cached thereafter).
#[must_use]
pub fn violation_mode() -> ViolationMode {
    *ENV_MODE.get_or_init(|| {
        std::env::var("HEAPFORGE_VIOLATIONS")
            .map(|v| ViolationMode::from_str_loose(&v))
            .unwrap_or_default()
    })
}
