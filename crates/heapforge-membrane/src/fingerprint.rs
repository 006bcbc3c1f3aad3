//! SipHash-based block header fingerprints.
//!
//! Every block header carries a 64-bit checksum over its own fields and its
//! arena offset, keyed per heap. A header that was overwritten by a stray
//! write, copied from another heap, or fabricated by a caller fails
//! verification with probability 1 - 2^-64.

/// Per-heap SipHash key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FingerprintKey {
    k0: u64,
    k1: u64,
}

impl FingerprintKey {
    /// Fixed key used when no seed is available.
    pub const DEFAULT: Self = Self {
        k0: 0x0706_0504_0302_0100,
        k1: 0x0F0E_0D0C_0B0A_0908,
    };

    /// Derive a key from a seed (typically the arena base address).
    #[must_use]
    pub fn derive(seed: u64) -> Self {
        let k0 = sip_hash_2_4(Self::DEFAULT, &[seed]);
        let k1 = sip_hash_2_4(Self::DEFAULT, &[seed.rotate_left(32) ^ 0x9E37_79B9_7F4A_7C15]);
        Self { k0, k1 }
    }

    /// Fingerprint of a block header stored at `offset`.
    #[must_use]
    pub fn header_checksum(&self, offset: usize, size: usize, prev: usize, flags: u32) -> u64 {
        sip_hash_2_4(
            *self,
            &[offset as u64, size as u64, prev as u64, u64::from(flags)],
        )
    }

    /// Returns true when `checksum` matches the given header fields.
    #[must_use]
    pub fn verify(&self, offset: usize, size: usize, prev: usize, flags: u32, checksum: u64) -> bool {
        self.header_checksum(offset, size, prev, flags) == checksum
    }
}

impl Default for FingerprintKey {
    fn default() -> Self {
        Self::DEFAULT
    }
}

/// SipHash-2-4 over a sequence of 64-bit words.
fn sip_hash_2_4(key: FingerprintKey, words: &[u64]) -> u64 {
    let mut v0: u64 = key.k0 ^ 0x736f_6d65_7073_6575;
    let mut v1: u64 = key.k1 ^ 0x646f_7261_6e64_6f6d;
    let mut v2: u64 = key.k0 ^ 0x6c79_6765_6e65_7261;
    let mut v3: u64 = key.k1 ^ 0x7465_6462_7974_6573;

    for &m in words {
        v3 ^= m;
        sip_round(&mut v0, &mut v1, &mut v2, &mut v3);
        sip_round(&mut v0, &mut v1, &mut v2, &mut v3);
        v0 ^= m;
    }

    // Length block
    let tail = ((words.len() as u64) * 8) << 56;
    v3 ^= tail;
    sip_round(&mut v0, &mut v1, &mut v2, &mut v3);
    sip_round(&mut v0, &mut v1, &mut v2, &mut v3);
    v0 ^= tail;

    v2 ^= 0xFF;
    sip_round(&mut v0, &mut v1, &mut v2, &mut v3);
    sip_round(&mut v0, &mut v1, &mut v2, &mut v3);
    sip_round(&mut v0, &mut v1, &mut v2, &mut v3);
    sip_round(&mut v0, &mut v1, &mut v2, &mut v3);

    v0 ^ v1 ^ v2 ^ v3
}

#[inline(always)]
fn sip_round(v0: &mut u64, v1: &mut u64, v2: &mut u64, v3: &mut u64) {
    *v0 = v0.wrapping_add(*v1);
    *v1 = v1.rotate_left(13);
    *v1 ^= *v0;
    *v0 = v0.rotate_left(32);
    *v2 = v2.wrapping_add(*v3);
    *v3 = v3.rotate_left(16);
    *v3 ^= *v2;
    *v0 = v0.wrapping_add(*v3);
    *v3 = v3.rotate_left(21);
    *v3 ^= *v0;
    *v2 = v2.wrapping_add(*v1);
    *v1 = v1.rotate_left(17);
    *v1 ^= *v2;
    *v2 = v2.rotate_left(32);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checksum_verifies_for_same_fields() {
        let key = FingerprintKey::derive(0x7f00_0000_1000);
        let sum = key.header_checksum(64, 256, 0, 1);
        assert!(key.verify(64, 256, 0, 1, sum));
    }

    #[test]
    fn checksum_changes_with_every_field() {
        let key = FingerprintKey::DEFAULT;
        let base = key.header_checksum(64, 256, 0, 1);
        assert_ne!(base, key.header_checksum(80, 256, 0, 1));
        assert_ne!(base, key.header_checksum(64, 272, 0, 1));
        assert_ne!(base, key.header_checksum(64, 256, 16, 1));
        assert_ne!(base, key.header_checksum(64, 256, 0, 0));
    }

    #[test]
    fn keys_from_different_seeds_disagree() {
        let a = FingerprintKey::derive(0x1000);
        let b = FingerprintKey::derive(0x2000);
        assert_ne!(a, b);
        let sum = a.header_checksum(0, 992, usize::MAX, 1);
        assert!(!b.verify(0, 992, usize::MAX, 1, sum));
    }

    #[test]
    fn single_bit_flip_is_detected() {
        let key = FingerprintKey::derive(42);
        let sum = key.header_checksum(128, 48, 32, 0);
        for bit in 0..64 {
            assert!(!key.verify(128, 48, 32, 0, sum ^ (1 << bit)));
        }
    }
}
