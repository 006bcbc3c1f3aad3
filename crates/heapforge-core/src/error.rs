//! Error taxonomy for heap operations.

use thiserror::Error;

/// Every failure a heap operation can return.
///
/// No operation mutates heap state before returning one of these.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum HeapError {
    /// The arena cannot provide or grow to the requested size.
    #[error("out of memory: cannot satisfy a request for {requested} bytes")]
    OutOfMemory { requested: usize },
    /// Alignment was zero or not a power of two.
    #[error("invalid alignment {alignment}: must be a power of two")]
    InvalidAlignment { alignment: usize },
    /// Growth was refused because free memory exists but is too scattered.
    #[error(
        "fragmentation limit exceeded: {requested} bytes requested at fragmentation {ratio_permille}/1000"
    )]
    FragmentationLimitExceeded {
        requested: usize,
        ratio_permille: u16,
    },
    /// A block header failed magic, fingerprint, or link validation.
    #[error("corrupted block header at arena offset {offset:#x}")]
    CorruptedHeader { offset: usize },
    /// The block behind this pointer is already free.
    #[error("double free of {addr:#x}")]
    DoubleFree { addr: usize },
    /// The pointer was never issued by this heap.
    #[error("pointer {addr:#x} was not issued by this heap")]
    ForeignPointer { addr: usize },
    /// Release was requested while allocations are still live.
    #[error("arena still holds {live_blocks} live allocation(s)")]
    ArenaNotEmpty { live_blocks: usize },
    /// Configuration values are inconsistent.
    #[error("invalid heap configuration: {reason}")]
    InvalidConfig { reason: &'static str },
}

impl HeapError {
    /// Returns true for the memory-safety violations subject to the
    /// configured violation mode.
    #[must_use]
    pub const fn is_violation(&self) -> bool {
        matches!(
            self,
            Self::CorruptedHeader { .. } | Self::DoubleFree { .. } | Self::ForeignPointer { .. }
        )
    }

    /// Stable snake_case label used in lifecycle records.
    #[must_use]
    pub const fn label(&self) -> &'static str {
        match self {
            Self::OutOfMemory { .. } => "out_of_memory",
            Self::InvalidAlignment { .. } => "invalid_alignment",
            Self::FragmentationLimitExceeded { .. } => "fragmentation_limit_exceeded",
            Self::CorruptedHeader { .. } => "corrupted_header",
            Self::DoubleFree { .. } => "double_free",
            Self::ForeignPointer { .. } => "foreign_pointer",
            Self::ArenaNotEmpty { .. } => "arena_not_empty",
            Self::InvalidConfig { .. } => "invalid_config",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn violations_are_classified() {
        assert!(HeapError::DoubleFree { addr: 0x10 }.is_violation());
        assert!(HeapError::ForeignPointer { addr: 0x10 }.is_violation());
        assert!(HeapError::CorruptedHeader { offset: 0 }.is_violation());
        assert!(!HeapError::OutOfMemory { requested: 1 }.is_violation());
        assert!(!HeapError::InvalidAlignment { alignment: 3 }.is_violation());
        assert!(!HeapError::ArenaNotEmpty { live_blocks: 1 }.is_violation());
    }

    #[test]
    fn messages_carry_context() {
        let err = HeapError::CorruptedHeader { offset: 0x40 };
        assert_eq!(err.to_string(), "corrupted block header at arena offset 0x40");
        let err = HeapError::InvalidAlignment { alignment: 24 };
        assert!(err.to_string().contains("24"));
    }
}
