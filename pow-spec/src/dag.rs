//! DAG access layer.
//!
//! The DAG itself is produced elsewhere; this module validates the
//! invariants the hash pipeline relies on (64-byte item alignment, a
//! full 16 KiB hot-cache prefix) and provides word-level addressing
//! over a borrowed byte buffer. A deterministic synthetic filler is
//! included as the test and benchmark fixture.

use rayon::prelude::*;
use thiserror::Error;

use crate::fnv::FNV_PRIME;
use crate::{DAG_ITEM_BYTES, PROGPOW_CACHE_BYTES, PROGPOW_CACHE_WORDS};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DagError {
    #[error("DAG size {0} is not a multiple of {DAG_ITEM_BYTES} bytes")]
    Misaligned(usize),
    #[error("DAG size {0} is smaller than the {PROGPOW_CACHE_BYTES}-byte hot cache")]
    TooSmall(usize),
}

/// Validated read-only view over a DAG byte buffer.
#[derive(Debug, Clone, Copy)]
pub struct DagView<'a> {
    data: &'a [u8],
    num_items: u64,
}

impl<'a> DagView<'a> {
    pub fn new(data: &'a [u8]) -> Result<Self, DagError> {
        if data.len() % DAG_ITEM_BYTES != 0 {
            return Err(DagError::Misaligned(data.len()));
        }
        if data.len() < PROGPOW_CACHE_BYTES {
            return Err(DagError::TooSmall(data.len()));
        }
        Ok(Self {
            data,
            num_items: (data.len() / DAG_ITEM_BYTES) as u64,
        })
    }

    /// Number of 64-byte items.
    pub fn num_items(&self) -> u64 {
        self.num_items
    }

    pub fn size(&self) -> u64 {
        self.data.len() as u64
    }

    pub fn as_bytes(&self) -> &'a [u8] {
        self.data
    }

    /// Load one 64-byte item as 16 little-endian words.
    #[inline]
    pub fn item(&self, index: u64) -> [u32; 16] {
        let offset = (index % self.num_items) as usize * DAG_ITEM_BYTES;
        let bytes = &self.data[offset..offset + DAG_ITEM_BYTES];
        let mut words = [0u32; 16];
        for (word, chunk) in words.iter_mut().zip(bytes.chunks_exact(4)) {
            *word = u32::from_le_bytes(chunk.try_into().expect("4-byte chunk"));
        }
        words
    }

    /// Read one word of the 16 KiB hot-cache prefix.
    #[inline]
    pub fn cache_word(&self, index: u32) -> u32 {
        let offset = (index as usize % PROGPOW_CACHE_WORDS) * 4;
        u32::from_le_bytes(
            self.data[offset..offset + 4]
                .try_into()
                .expect("4-byte chunk"),
        )
    }
}

/// Fill a synthetic DAG: `byte[i] = low8(i * FNV_PRIME)` with the index
/// truncated to 32 bits. Deterministic, cheap, and uniform enough to
/// exercise every addressing path.
pub fn synthetic_dag(size: usize) -> Vec<u8> {
    let mut data = vec![0u8; size];
    data.par_chunks_mut(1 << 20)
        .enumerate()
        .for_each(|(chunk_idx, chunk)| {
            let base = chunk_idx << 20;
            for (i, byte) in chunk.iter_mut().enumerate() {
                *byte = ((base + i) as u32).wrapping_mul(FNV_PRIME) as u8;
            }
        });
    data
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_misaligned_size() {
        let data = vec![0u8; PROGPOW_CACHE_BYTES + 1];
        assert_eq!(
            DagView::new(&data).unwrap_err(),
            DagError::Misaligned(PROGPOW_CACHE_BYTES + 1)
        );
    }

    #[test]
    fn rejects_undersized_buffer() {
        let data = vec![0u8; 4096];
        assert_eq!(DagView::new(&data).unwrap_err(), DagError::TooSmall(4096));
    }

    #[test]
    fn item_addressing_is_little_endian() {
        let mut data = vec![0u8; PROGPOW_CACHE_BYTES];
        data[64..68].copy_from_slice(&0xDEADBEEFu32.to_le_bytes());
        let dag = DagView::new(&data).unwrap();
        assert_eq!(dag.num_items(), (PROGPOW_CACHE_BYTES / 64) as u64);
        assert_eq!(dag.item(1)[0], 0xDEADBEEF);
        // Item indices wrap at num_items.
        assert_eq!(dag.item(1 + dag.num_items())[0], 0xDEADBEEF);
    }

    #[test]
    fn cache_word_wraps_at_prefix() {
        let mut data = vec![0u8; 2 * PROGPOW_CACHE_BYTES];
        data[0..4].copy_from_slice(&7u32.to_le_bytes());
        let dag = DagView::new(&data).unwrap();
        assert_eq!(dag.cache_word(0), 7);
        assert_eq!(dag.cache_word(PROGPOW_CACHE_WORDS as u32), 7);
    }

    #[test]
    fn synthetic_fill_matches_pattern() {
        let dag = synthetic_dag(PROGPOW_CACHE_BYTES);
        assert_eq!(&dag[..8], &[0, 147, 38, 185, 76, 223, 114, 5]);
        for (i, &byte) in dag.iter().enumerate().take(4096) {
            assert_eq!(byte, (i as u32).wrapping_mul(FNV_PRIME) as u8);
        }
    }

    #[test]
    fn synthetic_fill_is_chunk_independent() {
        // Parallel chunking must not change the byte pattern.
        let small = synthetic_dag(1 << 12);
        let large = synthetic_dag(1 << 21);
        assert_eq!(&large[..small.len()], &small[..]);
        let i = (1 << 20) + 17;
        assert_eq!(large[i], (i as u32).wrapping_mul(FNV_PRIME) as u8);
    }
}
