//! KawPow/ProgPoW hash pipeline.
//!
//! This crate is the algorithm: the FNV-1a primitives, the KISS99
//! sequence generator, the Keccak-f[800] permutation, and the ProgPoW
//! mix loop, plus a CPU reference implementation of the nonce search.
//! GPU backends reproduce exactly what this crate computes; the CPU
//! path here is the oracle they are tested against.

pub mod dag;
pub mod fnv;
pub mod keccak;
pub mod kiss99;
pub mod progpow;

/// Parallel mix streams per nonce.
pub const PROGPOW_LANES: usize = 16;
/// Mix registers per lane.
pub const PROGPOW_REGS: usize = 32;
/// DAG accesses per loop iteration.
pub const PROGPOW_CNT_DAG: usize = 64;
/// Cache accesses per loop iteration.
pub const PROGPOW_CNT_CACHE: usize = 11;
/// Random math ops per loop iteration.
pub const PROGPOW_CNT_MATH: usize = 18;
/// Words fetched by one DAG load.
pub const PROGPOW_DAG_LOADS: usize = 4;
/// Outer loop iterations per nonce.
pub const PROGPOW_LOOP_COUNT: usize = 64;
/// Size of the hot cache taken from the head of the DAG.
pub const PROGPOW_CACHE_BYTES: usize = 16 * 1024;
/// Hot cache size in 32-bit words.
pub const PROGPOW_CACHE_WORDS: usize = PROGPOW_CACHE_BYTES / 4;

/// Size of one DAG item: 16 consecutive little-endian 32-bit words.
pub const DAG_ITEM_BYTES: usize = 64;
/// Block header preamble length.
pub const HEADER_BYTES: usize = 32;
/// Digest, mix digest, and target length.
pub const HASH_BYTES: usize = 32;

/// Compare a digest against a difficulty target.
///
/// Both are 32 bytes interpreted as 8 little-endian words, compared
/// most-significant word first (equivalently: bytes 31 down to 0).
/// A digest equal to the target still validates.
pub fn hash_meets_target(hash: &[u8; HASH_BYTES], target: &[u8; HASH_BYTES]) -> bool {
    for i in (0..HASH_BYTES).rev() {
        if hash[i] < target[i] {
            return true;
        }
        if hash[i] > target[i] {
            return false;
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_hash_meets_any_target() {
        let hash = [0u8; 32];
        let mut target = [0u8; 32];
        target[31] = 1;
        assert!(hash_meets_target(&hash, &target));
    }

    #[test]
    fn equal_hash_meets_target() {
        let hash = [0xA5u8; 32];
        assert!(hash_meets_target(&hash, &hash));
    }

    #[test]
    fn comparison_is_most_significant_byte_first() {
        let mut hash = [0u8; 32];
        let mut target = [0u8; 32];
        hash[31] = 2;
        target[31] = 1;
        hash[0] = 0;
        target[0] = 0xFF;
        assert!(!hash_meets_target(&hash, &target));

        hash[31] = 1;
        target[31] = 2;
        hash[0] = 0xFF;
        target[0] = 0;
        assert!(hash_meets_target(&hash, &target));
    }

    #[test]
    fn target_monotonicity() {
        // If a hash validates against T, it validates against any T' >= T.
        let hash = [0x42u8; 32];
        let target = hash;
        assert!(hash_meets_target(&hash, &target));

        let mut larger = target;
        larger[31] = larger[31].wrapping_add(1);
        assert!(hash_meets_target(&hash, &larger));

        let mut smaller = target;
        smaller[0] = smaller[0].wrapping_sub(1);
        assert!(!hash_meets_target(&hash, &smaller));
    }
}
