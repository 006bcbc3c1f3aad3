//! Size classes for free-block segregation.
//!
//! Free blocks are bucketed by payload size. Class `i` holds blocks whose
//! size lies in `[SIZE_TABLE[i], SIZE_TABLE[i + 1])`; the last class is
//! open-ended. A lookup starts in the class that contains the request and
//! walks upward.

use crate::block::MIN_BLOCK_SIZE;

/// Number of size classes.
pub const NUM_SIZE_CLASSES: usize = 32;

/// Lower bound of each class, following a geometric progression.
///
/// Classes 0-7: 16-byte increments (16, 32, 48, 64, 80, 96, 112, 128)
/// Classes 8-15: 32-byte increments (160, 192, 224, 256, 288, 320, 352, 384)
/// Classes 16-23: wider steps up to 1536
/// Classes 24-31: up to 32KB; class 31 takes everything larger
const SIZE_TABLE: [usize; NUM_SIZE_CLASSES] = [
    16, 32, 48, 64, 80, 96, 112, 128, // 16-byte steps
    160, 192, 224, 256, 288, 320, 352, 384, // 32-byte steps
    448, 512, 640, 768, 896, 1024, 1280, 1536, // wider steps
    2048, 2560, 3072, 4096, 8192, 16384, 24576, 32768, // large classes
];

const _: () = assert!(SIZE_TABLE[0] == MIN_BLOCK_SIZE);

/// Class holding free blocks of `size` bytes.
///
/// Sizes below the smallest class map to class 0.
pub fn class_of(size: usize) -> usize {
    SIZE_TABLE
        .partition_point(|&floor| floor <= size)
        .saturating_sub(1)
}

/// Smallest payload size stored in `class`. Returns 0 for out-of-range classes.
pub fn class_floor(class: usize) -> usize {
    SIZE_TABLE.get(class).copied().unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_class_of_min() {
        assert_eq!(class_of(0), 0);
        assert_eq!(class_of(16), 0);
        assert_eq!(class_of(31), 0);
    }

    #[test]
    fn test_class_of_exact() {
        assert_eq!(class_of(32), 1);
        assert_eq!(class_of(64), 3);
        assert_eq!(class_of(128), 7);
        assert_eq!(class_of(256), 11);
    }

    #[test]
    fn test_class_of_rounds_down() {
        // 112 lives with 112..128, 608 with 576..640
        assert_eq!(class_of(112), 6);
        assert_eq!(class_of(127), 6);
        assert_eq!(class_of(608), 17);
    }

    #[test]
    fn test_class_of_large() {
        assert_eq!(class_of(32768), NUM_SIZE_CLASSES - 1);
        assert_eq!(class_of(usize::MAX), NUM_SIZE_CLASSES - 1);
    }

    #[test]
    fn test_class_floor_roundtrip() {
        for i in 0..NUM_SIZE_CLASSES {
            assert_eq!(class_of(class_floor(i)), i);
        }
        assert_eq!(class_floor(NUM_SIZE_CLASSES), 0);
    }

    #[test]
    fn test_size_table_monotonic() {
        for i in 1..NUM_SIZE_CLASSES {
            assert!(
                SIZE_TABLE[i] > SIZE_TABLE[i - 1],
                "size class {} ({}) must be > class {} ({})",
                i,
                SIZE_TABLE[i],
                i - 1,
                SIZE_TABLE[i - 1]
            );
        }
    }
}
