//! Bloom filters for k-mer hash vectors.
//!
//! Both filters are addressed with the hash vectors produced by
//! [`crate::nthash::NtHash`] and are safe to fill from concurrent threads:
//! the bit filter uses atomic fetch-or, the counting filter a saturating
//! atomic increment. A batch worker owns one `FilterPair` per k value; the
//! counting side accumulates multiplicity evidence and the bit side holds
//! the solid k-mers that cleared the threshold.

use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;
use std::sync::atomic::{AtomicU8, Ordering};

use serde::{Deserialize, Serialize};

use crate::errors::TargetedBfsError;
use crate::nthash::NtHash;

/// On-disk snapshot, bincode-encoded by `BloomFilter::save`.
#[derive(Serialize, Deserialize)]
struct BloomFilterData {
    k: u32,
    hash_num: u32,
    bits: Vec<u8>,
}

/// Set-only Bloom filter over k-mer hashes. No false negatives.
pub struct BloomFilter {
    bits: Vec<AtomicU8>,
    hash_num: u32,
    k: u32,
}

/// Both filter constructors share these bounds: a zero-sized filter cannot
/// be addressed and a zero hash count makes every membership query
/// vacuously true.
fn check_filter_params(bytes: usize, hash_num: u32) -> Result<(), TargetedBfsError> {
    if bytes == 0 {
        return Err(TargetedBfsError::BadArgs(
            "filter size must be nonzero".to_string(),
        ));
    }
    if hash_num == 0 {
        return Err(TargetedBfsError::BadArgs(
            "hash count must be at least 1".to_string(),
        ));
    }
    Ok(())
}

impl BloomFilter {
    pub fn new(bytes: usize, hash_num: u32, k: u32) -> Result<Self, TargetedBfsError> {
        check_filter_params(bytes, hash_num)?;
        let mut bits = Vec::with_capacity(bytes);
        bits.resize_with(bytes, || AtomicU8::new(0));
        Ok(BloomFilter { bits, hash_num, k })
    }

    pub fn insert(&self, hashes: &[u64]) {
        let nbits = (self.bits.len() * 8) as u64;
        for &h in hashes {
            let bit = h % nbits;
            self.bits[(bit / 8) as usize].fetch_or(1 << (bit % 8), Ordering::Relaxed);
        }
    }

    pub fn contains(&self, hashes: &[u64]) -> bool {
        let nbits = (self.bits.len() * 8) as u64;
        hashes.iter().all(|&h| {
            let bit = h % nbits;
            self.bits[(bit / 8) as usize].load(Ordering::Relaxed) & (1 << (bit % 8)) != 0
        })
    }

    pub fn size_bytes(&self) -> usize {
        self.bits.len()
    }

    pub fn hash_num(&self) -> u32 {
        self.hash_num
    }

    pub fn k(&self) -> u32 {
        self.k
    }

    pub fn save(&self, path: &Path) -> Result<(), TargetedBfsError> {
        let data = BloomFilterData {
            k: self.k,
            hash_num: self.hash_num,
            bits: self.bits.iter().map(|b| b.load(Ordering::Relaxed)).collect(),
        };
        let writer = BufWriter::new(File::create(path)?);
        bincode::serialize_into(writer, &data)
            .map_err(|e| TargetedBfsError::FilterCodec(e.to_string()))
    }

    pub fn load(path: &Path) -> Result<Self, TargetedBfsError> {
        let reader = BufReader::new(File::open(path)?);
        let data: BloomFilterData = bincode::deserialize_from(reader)
            .map_err(|e| TargetedBfsError::FilterCodec(e.to_string()))?;
        if data.bits.is_empty() || data.hash_num == 0 {
            return Err(TargetedBfsError::FilterCodec(format!(
                "invalid filter header: {} bytes, {} hashes",
                data.bits.len(),
                data.hash_num
            )));
        }
        Ok(BloomFilter {
            bits: data.bits.into_iter().map(AtomicU8::new).collect(),
            hash_num: data.hash_num,
            k: data.k,
        })
    }
}

/// Counting Bloom filter with one saturating 8-bit counter per byte.
pub struct CountingBloomFilter8 {
    counters: Vec<AtomicU8>,
    hash_num: u32,
    k: u32,
}

impl CountingBloomFilter8 {
    pub fn new(bytes: usize, hash_num: u32, k: u32) -> Result<Self, TargetedBfsError> {
        check_filter_params(bytes, hash_num)?;
        let mut counters = Vec::with_capacity(bytes);
        counters.resize_with(bytes, || AtomicU8::new(0));
        Ok(CountingBloomFilter8 {
            counters,
            hash_num,
            k,
        })
    }

    /// Increment every addressed counter still below `threshold` and return
    /// the minimum post-increment value. Counters cap at `threshold`, so the
    /// return value is `>= threshold` exactly when the k-mer's multiplicity
    /// estimate has reached it.
    pub fn insert_thresh_contains(&self, hashes: &[u64], threshold: u8) -> u8 {
        let len = self.counters.len() as u64;
        let mut min_post = u8::MAX;
        for &h in hashes {
            let counter = &self.counters[(h % len) as usize];
            let post = match counter.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |c| {
                if c >= threshold { None } else { Some(c + 1) }
            }) {
                Ok(prev) => prev + 1,
                Err(saturated) => saturated,
            };
            min_post = min_post.min(post);
        }
        min_post
    }

    /// Current multiplicity estimate without modifying the filter.
    pub fn count(&self, hashes: &[u64]) -> u8 {
        let len = self.counters.len() as u64;
        hashes
            .iter()
            .map(|&h| self.counters[(h % len) as usize].load(Ordering::Relaxed))
            .min()
            .unwrap_or(0)
    }

    pub fn hash_num(&self) -> u32 {
        self.hash_num
    }

    pub fn k(&self) -> u32 {
        self.k
    }
}

/// The per-k pair a batch worker fills: multiplicity evidence plus the
/// solid-k-mer deliverable.
pub struct FilterPair {
    pub cbf: CountingBloomFilter8,
    pub bf: BloomFilter,
}

impl FilterPair {
    pub fn new(
        cbf_bytes: usize,
        bf_bytes: usize,
        hash_num: u32,
        k: u32,
    ) -> Result<Self, TargetedBfsError> {
        Ok(FilterPair {
            cbf: CountingBloomFilter8::new(cbf_bytes, hash_num, k)?,
            bf: BloomFilter::new(bf_bytes, hash_num, k)?,
        })
    }
}

/// Roll one mapped sequence through every configured k and admit k-mers into
/// the solid filters once their counted multiplicity reaches the per-k
/// threshold. The threshold ramps with the k index: the first (largest
/// k-mer count) k value uses `base_threshold - 2`, each following k one
/// more.
pub fn fill_filters(
    seq: &[u8],
    hash_num: u32,
    k_values: &[u32],
    base_threshold: u32,
    pairs: &[FilterPair],
) -> Result<(), TargetedBfsError> {
    if base_threshold < 4 {
        return Err(TargetedBfsError::KmerThresholdTooLow(base_threshold));
    }
    debug_assert_eq!(k_values.len(), pairs.len());

    for (i, (&k, pair)) in k_values.iter().zip(pairs).enumerate() {
        let threshold = (base_threshold - 2 + i as u32).min(u8::MAX as u32) as u8;
        let mut nthash = NtHash::new(seq, hash_num, k);
        while nthash.roll() {
            if pair.cbf.insert_thresh_contains(nthash.hashes(), threshold) >= threshold {
                pair.bf.insert(nthash.hashes());
            }
        }
    }
    Ok(())
}
