//! ProgPoW mix loop and the CPU reference search.
//!
//! Everything here is a pure function of `(header, nonce, dag)`. The
//! GPU kernel is a transliteration of this module; any change to the
//! sequence of KISS99 draws below is a consensus change.

use crate::dag::DagView;
use crate::fnv::{fnv1a, fnv1a_fold, FNV_OFFSET_BASIS};
use crate::keccak::{keccak_f800, KeccakState};
use crate::kiss99::{fill_mix, Kiss99};
use crate::{
    hash_meets_target, HASH_BYTES, HEADER_BYTES, PROGPOW_CNT_CACHE, PROGPOW_CNT_DAG,
    PROGPOW_CNT_MATH, PROGPOW_LANES, PROGPOW_LOOP_COUNT, PROGPOW_REGS,
};

/// Digest and mix digest for one nonce.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PowOutput {
    pub digest: [u8; HASH_BYTES],
    pub mix: [u8; HASH_BYTES],
}

/// First valid nonce found by a range search.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SearchHit {
    pub nonce: u64,
    pub digest: [u8; HASH_BYTES],
    pub mix: [u8; HASH_BYTES],
}

/// Random math op, selected by `r % 9`.
#[derive(Debug, Clone, Copy)]
enum MathOp {
    Add,
    Sub,
    Mul,
    MulHi,
    Xor,
    Rotl,
    Rotr,
    Popcount,
    Clz,
}

impl MathOp {
    #[inline]
    fn select(r: u32) -> Self {
        match r % 9 {
            0 => MathOp::Add,
            1 => MathOp::Sub,
            2 => MathOp::Mul,
            3 => MathOp::MulHi,
            4 => MathOp::Xor,
            5 => MathOp::Rotl,
            6 => MathOp::Rotr,
            7 => MathOp::Popcount,
            _ => MathOp::Clz,
        }
    }

    #[inline]
    fn apply(self, a: u32, b: u32) -> u32 {
        match self {
            MathOp::Add => a.wrapping_add(b),
            MathOp::Sub => a.wrapping_sub(b),
            MathOp::Mul => a.wrapping_mul(b),
            MathOp::MulHi => ((u64::from(a) * u64::from(b)) >> 32) as u32,
            MathOp::Xor => a ^ b,
            MathOp::Rotl => a.rotate_left(b & 31),
            MathOp::Rotr => a.rotate_right(b & 31),
            MathOp::Popcount => a.count_ones(),
            MathOp::Clz => a.leading_zeros(),
        }
    }
}

/// Random merge op, selected by `r % 5`.
#[derive(Debug, Clone, Copy)]
enum MergeOp {
    Add,
    Mul,
    And,
    Or,
    Xor,
}

impl MergeOp {
    #[inline]
    fn select(r: u32) -> Self {
        match r % 5 {
            0 => MergeOp::Add,
            1 => MergeOp::Mul,
            2 => MergeOp::And,
            3 => MergeOp::Or,
            _ => MergeOp::Xor,
        }
    }

    #[inline]
    fn apply(self, a: u32, b: u32) -> u32 {
        match self {
            MergeOp::Add => a.wrapping_add(b),
            MergeOp::Mul => a.wrapping_mul(b),
            MergeOp::And => a & b,
            MergeOp::Or => a | b,
            MergeOp::Xor => a ^ b,
        }
    }
}

#[inline]
fn random_math(a: u32, b: u32, r: u32) -> u32 {
    MathOp::select(r).apply(a, b)
}

#[inline]
fn random_merge(a: u32, b: u32, r: u32) -> u32 {
    MergeOp::select(r).apply(a, b)
}

/// Absorb header and nonce through the seed Keccak. Returns the
/// permuted state; the mix seed is `(state[0] << 32) | state[1]`.
fn seed_keccak(header: &[u8; HEADER_BYTES], nonce: u64) -> KeccakState {
    let mut state: KeccakState = [0u32; 25];
    for (word, chunk) in state.iter_mut().zip(header.chunks_exact(4)) {
        *word = u32::from_le_bytes(chunk.try_into().expect("4-byte chunk"));
    }
    state[8] = nonce as u32;
    state[9] = (nonce >> 32) as u32;
    keccak_f800(&mut state);
    state
}

/// One outer iteration over the per-lane scalar mix.
fn progpow_loop(seed: u64, loop_idx: u32, mix: &mut [u32; PROGPOW_LANES], dag: &DagView) {
    let mut kiss = Kiss99::new(seed, loop_idx);

    for _ in 0..PROGPOW_CNT_CACHE {
        let lane = (kiss.next() as usize) % PROGPOW_LANES;
        let cache_val = dag.cache_word(mix[lane]);
        mix[lane] = random_merge(mix[lane], cache_val, kiss.next());
    }

    for _ in 0..PROGPOW_CNT_MATH {
        let src1 = (kiss.next() as usize) % PROGPOW_LANES;
        let src2 = (kiss.next() as usize) % PROGPOW_LANES;
        let dst = (kiss.next() as usize) % PROGPOW_LANES;
        let value = random_math(mix[src1], mix[src2], kiss.next());
        mix[dst] = random_merge(mix[dst], value, kiss.next());
    }

    for i in 0..PROGPOW_CNT_DAG {
        let lane = i % PROGPOW_LANES;
        let item_index = u64::from(fnv1a(loop_idx, mix[lane])) % dag.num_items();
        let item = dag.item(item_index);
        for (k, &word) in item.iter().enumerate() {
            let idx = (lane + k) % PROGPOW_LANES;
            mix[idx] = random_merge(mix[idx], word, kiss.next());
        }
    }
}

/// Compute digest and mix digest for one nonce.
pub fn progpow_hash(header: &[u8; HEADER_BYTES], nonce: u64, dag: &DagView) -> PowOutput {
    let seed_state = seed_keccak(header, nonce);
    let seed = (u64::from(seed_state[0]) << 32) | u64::from(seed_state[1]);

    let mut lane_mixes = [[0u32; PROGPOW_REGS]; PROGPOW_LANES];
    for (lane, regs) in lane_mixes.iter_mut().enumerate() {
        *regs = fill_mix(seed, lane as u32);
    }

    for loop_idx in 0..PROGPOW_LOOP_COUNT {
        let mut mix = [0u32; PROGPOW_LANES];
        for (lane, scalar) in mix.iter_mut().enumerate() {
            *scalar = fnv1a_fold(&lane_mixes[lane]);
        }

        progpow_loop(seed, loop_idx as u32, &mut mix, dag);

        for (lane, regs) in lane_mixes.iter_mut().enumerate() {
            for reg in regs.iter_mut() {
                *reg = fnv1a(*reg, mix[lane]);
            }
        }
    }

    // Only register 0 of each lane feeds the final reduction.
    let mut final_mix = [FNV_OFFSET_BASIS; 8];
    for (lane, regs) in lane_mixes.iter().enumerate() {
        final_mix[lane % 8] = fnv1a(final_mix[lane % 8], regs[0]);
    }

    let mut final_state: KeccakState = [0u32; 25];
    final_state[..8].copy_from_slice(&final_mix);
    final_state[8..16].copy_from_slice(&seed_state[..8]);
    keccak_f800(&mut final_state);

    let mut digest = [0u8; HASH_BYTES];
    let mut mix_bytes = [0u8; HASH_BYTES];
    for i in 0..8 {
        digest[i * 4..i * 4 + 4].copy_from_slice(&final_state[i].to_le_bytes());
        mix_bytes[i * 4..i * 4 + 4].copy_from_slice(&final_mix[i].to_le_bytes());
    }

    PowOutput {
        digest,
        mix: mix_bytes,
    }
}

/// Scan `[start_nonce, start_nonce + nonce_count)` and return the first
/// nonce whose digest meets the target. The reference oracle for the
/// GPU dispatchers.
pub fn search_range(
    header: &[u8; HEADER_BYTES],
    target: &[u8; HASH_BYTES],
    start_nonce: u64,
    nonce_count: u64,
    dag: &DagView,
) -> Option<SearchHit> {
    for offset in 0..nonce_count {
        let nonce = start_nonce.wrapping_add(offset);
        let out = progpow_hash(header, nonce, dag);
        if hash_meets_target(&out.digest, target) {
            return Some(SearchHit {
                nonce,
                digest: out.digest,
                mix: out.mix,
            });
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dag::synthetic_dag;

    fn test_dag() -> Vec<u8> {
        synthetic_dag(1024 * 1024)
    }

    fn words(bytes: &[u8; 32]) -> [u32; 8] {
        let mut out = [0u32; 8];
        for i in 0..8 {
            out[i] = u32::from_le_bytes(bytes[i * 4..i * 4 + 4].try_into().unwrap());
        }
        out
    }

    #[test]
    fn math_ops_cover_the_table() {
        let a = 0x1234_5678u32;
        let b = 0x9ABC_DEF0u32;
        assert_eq!(MathOp::Add.apply(a, b), a.wrapping_add(b));
        assert_eq!(MathOp::Sub.apply(a, b), a.wrapping_sub(b));
        assert_eq!(MathOp::Mul.apply(a, b), a.wrapping_mul(b));
        assert_eq!(
            MathOp::MulHi.apply(a, b),
            ((a as u64 * b as u64) >> 32) as u32
        );
        assert_eq!(MathOp::Xor.apply(a, b), a ^ b);
        assert_eq!(MathOp::Rotl.apply(a, 33), a.rotate_left(1));
        assert_eq!(MathOp::Rotr.apply(a, 33), a.rotate_right(1));
        assert_eq!(MathOp::Popcount.apply(a, b), a.count_ones());
        assert_eq!(MathOp::Clz.apply(0, b), 32);
    }

    #[test]
    fn merge_ops_cover_the_table() {
        let a = 0xFF00_FF00u32;
        let b = 0x00FF_00FFu32;
        assert_eq!(MergeOp::And.apply(a, b), 0);
        assert_eq!(MergeOp::Or.apply(a, b), 0xFFFF_FFFF);
        assert_eq!(MergeOp::Xor.apply(a, b), 0xFFFF_FFFF);
        assert_eq!(MergeOp::Add.apply(a, b), a.wrapping_add(b));
        assert_eq!(MergeOp::Mul.apply(a, b), a.wrapping_mul(b));
    }

    #[test]
    fn hash_is_deterministic() {
        let dag_bytes = test_dag();
        let dag = DagView::new(&dag_bytes).unwrap();
        let header = [7u8; 32];
        let a = progpow_hash(&header, 12345, &dag);
        let b = progpow_hash(&header, 12345, &dag);
        assert_eq!(a, b);
        let c = progpow_hash(&header, 12346, &dag);
        assert_ne!(a.digest, c.digest);
    }

    #[test]
    fn zero_header_nonce_vectors() {
        // Known-answer vectors: zero header, 1 MiB synthetic DAG.
        let dag_bytes = test_dag();
        let dag = DagView::new(&dag_bytes).unwrap();
        let header = [0u8; 32];

        let out0 = progpow_hash(&header, 0, &dag);
        assert_eq!(
            words(&out0.digest),
            [
                0x4A8D96EC, 0xED1CE455, 0x5F15DCE3, 0x2E47A0AC, 0x68D9D1D5, 0x781CE3A2, 0xA27F9C42,
                0xCDB2082F
            ]
        );
        assert_eq!(
            words(&out0.mix),
            [
                0xFE89B3B1, 0x9F03BA4B, 0x77C92BFD, 0x96810D2F, 0x72A27A66, 0xC4C8986C, 0x225C2D3E,
                0xEF897C04
            ]
        );

        let out1 = progpow_hash(&header, 1, &dag);
        assert_eq!(
            words(&out1.digest),
            [
                0x4D25B025, 0xD822C20E, 0xDEA9E7F6, 0x62079A98, 0x3CC9B39C, 0x9F81A5AB, 0xE18D5787,
                0x5BD345C7
            ]
        );
        assert_eq!(
            words(&out1.mix),
            [
                0xA6B4ED6B, 0x8640246D, 0x4B138863, 0xD5E10F75, 0x2BF29A57, 0x92EC17E9, 0x54ECAFFA,
                0x5EF10ED8
            ]
        );
    }

    #[test]
    fn counting_header_vector() {
        let dag_bytes = test_dag();
        let dag = DagView::new(&dag_bytes).unwrap();
        let mut header = [0u8; 32];
        for (i, byte) in header.iter_mut().enumerate() {
            *byte = i as u8;
        }
        let out = progpow_hash(&header, 0x0000_BEEF_0000_1234, &dag);
        assert_eq!(
            words(&out.digest),
            [
                0x31924DFC, 0xE3A22CE9, 0xCC6E8FA9, 0x09974009, 0xFF167301, 0xD119C545, 0x10D266D2,
                0x69A8F52A
            ]
        );
        assert_eq!(
            words(&out.mix),
            [
                0xB18355E1, 0x6F6F90C7, 0xDD11977D, 0x29677EB3, 0xE47EF68D, 0xAA915D97, 0x6DC96555,
                0x669D903B
            ]
        );
    }

    #[test]
    fn easy_target_reports_first_nonce() {
        let dag_bytes = test_dag();
        let dag = DagView::new(&dag_bytes).unwrap();
        let header = [0u8; 32];
        let target = [0xFFu8; 32];
        let hit = search_range(&header, &target, 17, 8, &dag).expect("every nonce validates");
        assert_eq!(hit.nonce, 17);
        assert_eq!(hit.digest, progpow_hash(&header, 17, &dag).digest);
    }

    #[test]
    fn impossible_target_finds_nothing() {
        let dag_bytes = test_dag();
        let dag = DagView::new(&dag_bytes).unwrap();
        let header = [3u8; 32];
        let target = [0u8; 32];
        assert!(search_range(&header, &target, 0, 32, &dag).is_none());
    }

    #[test]
    fn digest_validates_against_itself_as_target() {
        let dag_bytes = test_dag();
        let dag = DagView::new(&dag_bytes).unwrap();
        let header = [9u8; 32];
        let out = progpow_hash(&header, 99, &dag);

        assert!(hash_meets_target(&out.digest, &out.digest));

        // Any byte-wise larger target still validates.
        let mut looser = out.digest;
        looser[31] = looser[31].wrapping_add(1);
        assert!(hash_meets_target(&out.digest, &looser));
    }

    #[test]
    fn split_ranges_cover_the_same_nonces() {
        let dag_bytes = test_dag();
        let dag = DagView::new(&dag_bytes).unwrap();
        let header = [1u8; 32];
        // Loose enough that a few of the 48 nonces validate.
        let mut target = [0xFFu8; 32];
        target[31] = 0x60;

        let collect = |start: u64, count: u64| -> Vec<u64> {
            (start..start + count)
                .filter(|&nonce| {
                    hash_meets_target(&progpow_hash(&header, nonce, &dag).digest, &target)
                })
                .collect()
        };

        let whole = collect(100, 48);
        let mut halves = collect(100, 24);
        halves.extend(collect(124, 24));
        assert_eq!(whole, halves);

        // The searcher reports the first of them.
        if let Some(first) = whole.first() {
            let hit = search_range(&header, &target, 100, 48, &dag).unwrap();
            assert_eq!(hit.nonce, *first);
        }
    }
}
