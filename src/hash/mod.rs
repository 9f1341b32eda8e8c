//! Content hashing
//!
//! [`HashAccumulator`] computes the SHA-256 of a whole file from chunks
//! delivered in any order by concurrent workers, so the source is read once.
//! Out-of-order chunks wait in a buffer until every earlier chunk has been
//! folded into the rolling digest.

use std::collections::BTreeMap;

use parking_lot::Mutex;
use sha2::{Digest, Sha256};

use crate::error::{Result, TransferError};

/// SHA-256 of `data`, hex encoded
pub fn compute_hash(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

pub fn verify_hash(data: &[u8], expected_hash: &str) -> bool {
    compute_hash(data).eq_ignore_ascii_case(expected_hash)
}

// ============================================================================
// Accumulator
// ============================================================================

struct AccumulatorState {
    hasher: Sha256,
    /// Next chunk index the rolling digest expects
    next_index: u64,
    /// Chunks that arrived ahead of `next_index`
    pending: BTreeMap<u64, Vec<u8>>,
    /// Bytes accepted so far, in order or pending
    covered: u64,
}

pub struct HashAccumulator {
    total_size: u64,
    chunk_size: u64,
    state: Mutex<AccumulatorState>,
}

impl HashAccumulator {
    /// `chunk_size` is the size of every chunk except possibly the last
    pub fn new(total_size: u64, chunk_size: u64) -> Self {
        Self {
            total_size,
            chunk_size: chunk_size.max(1),
            state: Mutex::new(AccumulatorState {
                hasher: Sha256::new(),
                next_index: 0,
                pending: BTreeMap::new(),
                covered: 0,
            }),
        }
    }

    pub fn total_chunks(&self) -> u64 {
        self.total_size.div_ceil(self.chunk_size)
    }

    /// Length chunk `index` must have
    pub fn chunk_len(&self, index: u64) -> Option<u64> {
        let offset = index.checked_mul(self.chunk_size)?;
        if offset >= self.total_size {
            return None;
        }
        Some(self.chunk_size.min(self.total_size - offset))
    }

    /// Accept chunk `index`; returns the bytes accepted (0 for a repeat)
    pub fn write_chunk(&self, index: u64, bytes: &[u8]) -> Result<usize> {
        let expected = self.chunk_len(index).ok_or_else(|| {
            TransferError::Integrity(format!(
                "chunk {} outside a {}-byte source",
                index, self.total_size
            ))
        })?;
        if bytes.len() as u64 != expected {
            return Err(TransferError::Integrity(format!(
                "chunk {} has {} bytes, expected {}",
                index,
                bytes.len(),
                expected
            )));
        }

        let mut state = self.state.lock();
        if index < state.next_index || state.pending.contains_key(&index) {
            return Ok(0);
        }

        state.covered += expected;
        if index == state.next_index {
            state.hasher.update(bytes);
            state.next_index += 1;
            // Drain whatever became contiguous
            loop {
                let next = state.next_index;
                let Some(chunk) = state.pending.remove(&next) else {
                    break;
                };
                state.hasher.update(&chunk);
                state.next_index += 1;
            }
        } else {
            state.pending.insert(index, bytes.to_vec());
        }

        Ok(bytes.len())
    }

    /// Bytes accepted so far
    pub fn covered(&self) -> u64 {
        self.state.lock().covered
    }

    /// Chunks buffered while waiting for an earlier one
    pub fn pending_chunks(&self) -> usize {
        self.state.lock().pending.len()
    }

    /// Digest of the whole source; fails unless every byte was covered
    pub fn finalize(&self) -> Result<String> {
        let state = self.state.lock();
        if state.covered != self.total_size || !state.pending.is_empty() {
            return Err(TransferError::IncompleteCoverage {
                covered: state.covered,
                expected: self.total_size,
            });
        }
        Ok(hex::encode(state.hasher.clone().finalize()))
    }
}
