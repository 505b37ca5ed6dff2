//! The pluggable batch transformer (spec §1, §4.6): the worker runner
//! knows nothing about how an item becomes a vector, only that it gets
//! a fixed number of bytes per item out of whatever it's given.

use std::io::Write;

use serde_json::Value;
use thiserror::Error;

use crate::runner::RECORD_WIDTH;

#[derive(Debug, Error)]
pub enum TransformError {
    #[error("io error writing chunk: {0}")]
    Io(#[from] std::io::Error),
    #[error("item is not transformable: {0}")]
    BadItem(String),
}

/// One external computation stage: turn a batch of input records into
/// their binary representation and write it out. Implementations own
/// their own per-item byte width; the worker assumes it equals
/// [`RECORD_WIDTH`] everywhere resume arithmetic applies.
pub trait BatchTransformer: Send + Sync {
    fn process_chunk(&self, items: &[Value], out: &mut dyn Write) -> Result<(), TransformError>;
}

/// A deterministic stand-in for a real embedding backend: hashes each
/// item's compact JSON representation into a fixed-width byte record.
/// Exists so the worker is runnable and its resume-idempotence is
/// checkable without a real ML backend (same input always yields the
/// same bytes, so re-processing after a resume is detectable).
pub struct HashStubTransformer;

impl BatchTransformer for HashStubTransformer {
    fn process_chunk(&self, items: &[Value], out: &mut dyn Write) -> Result<(), TransformError> {
        for item in items {
            let mut record = [0u8; RECORD_WIDTH as usize];
            let canonical = serde_json::to_vec(item)
                .map_err(|e| TransformError::BadItem(e.to_string()))?;
            fill_with_hash(&canonical, &mut record);
            out.write_all(&record)?;
        }
        Ok(())
    }
}

/// Repeats a simple FNV-1a hash of `seed` across `record`, so the output
/// is a deterministic function of the input bytes without pulling in a
/// real vector model.
fn fill_with_hash(seed: &[u8], record: &mut [u8]) {
    const FNV_OFFSET: u64 = 0xcbf29ce484222325;
    const FNV_PRIME: u64 = 0x100000001b3;

    let mut state = FNV_OFFSET;
    for chunk_index in 0..(record.len() / 8) {
        for &byte in seed {
            state ^= u64::from(byte);
            state = state.wrapping_mul(FNV_PRIME);
        }
        state ^= chunk_index as u64;
        state = state.wrapping_mul(FNV_PRIME);
        record[chunk_index * 8..chunk_index * 8 + 8].copy_from_slice(&state.to_le_bytes());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn emits_exactly_record_width_bytes_per_item() {
        let transformer = HashStubTransformer;
        let mut out = Vec::new();
        let items = vec![json!({"text": "hello"}), json!({"text": "world"})];
        transformer.process_chunk(&items, &mut out).unwrap();
        assert_eq!(out.len(), 2 * RECORD_WIDTH as usize);
    }

    #[test]
    fn same_item_hashes_to_the_same_record() {
        let transformer = HashStubTransformer;
        let mut first = Vec::new();
        let mut second = Vec::new();
        let item = vec![json!({"text": "repeatable"})];
        transformer.process_chunk(&item, &mut first).unwrap();
        transformer.process_chunk(&item, &mut second).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn different_items_hash_differently() {
        let transformer = HashStubTransformer;
        let mut a = Vec::new();
        let mut b = Vec::new();
        transformer
            .process_chunk(&[json!({"text": "a"})], &mut a)
            .unwrap();
        transformer
            .process_chunk(&[json!({"text": "b"})], &mut b)
            .unwrap();
        assert_ne!(a, b);
    }
}
