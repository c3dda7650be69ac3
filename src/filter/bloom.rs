//! Whole-table bloom filter.
//!
//! The writer adds the prefix of every point key; `seek_prefix_ge` consults the
//! filter before touching the index. Lookups may report false positives, never
//! false negatives.

use crate::error::{Error, Result};
use crate::filter::{FilterPolicy, FilterWriter};
use xxhash_rust::xxh64::xxh64;

/// Bits per key of [`BloomFilterPolicy::default`].
pub const DEFAULT_BITS_PER_KEY: usize = 10;

/// Name of the bloom filter policy.
pub const BLOOM_FILTER_POLICY_NAME: &str = "lsmtable.BloomFilter";

const HEADER_LEN: usize = 12;

const MAX_NUM_HASHES: u32 = 30;

/// A bloom filter probed with double hashing over xxh64.
///
/// # Example
/// ```
/// use lsmtable::filter::BloomFilter;
///
/// let mut filter = BloomFilter::with_bits_per_key(2, 10);
/// filter.add(b"key1");
/// filter.add(b"key2");
///
/// assert!(filter.may_contain(b"key1"));
/// assert!(filter.may_contain(b"key2"));
/// ```
#[derive(Debug, Clone)]
pub struct BloomFilter {
    bits: Vec<u8>,
    num_hashes: u32,
    num_bits: usize,
}

impl BloomFilter {
    /// Sizes a filter for `num_keys` keys, at least 64 bits.
    pub fn with_bits_per_key(num_keys: usize, bits_per_key: usize) -> Self {
        let num_bits = (num_keys * bits_per_key).max(64);
        // ln(2) * bits per key minimizes the false positive rate.
        let num_hashes = ((bits_per_key as f64) * 0.69).round() as u32;
        let num_hashes = num_hashes.clamp(1, MAX_NUM_HASHES);
        Self { bits: vec![0u8; num_bits.div_ceil(8)], num_hashes, num_bits }
    }

    /// Double hashing: probe `i` is `h1 + i * h2`.
    fn probes(&self, key: &[u8]) -> impl Iterator<Item = usize> + '_ {
        let h = xxh64(key, 0xbc9f_1d34);
        let h1 = h as u32;
        let h2 = ((h >> 32) as u32) | 1;
        (0..self.num_hashes).map(move |i| (h1.wrapping_add(i.wrapping_mul(h2)) as usize) % self.num_bits)
    }

    /// Adds a key.
    pub fn add(&mut self, key: &[u8]) {
        let probes: Vec<usize> = self.probes(key).collect();
        for pos in probes {
            self.bits[pos / 8] |= 1 << (pos % 8);
        }
    }

    /// Returns false if the key was definitely not added.
    pub fn may_contain(&self, key: &[u8]) -> bool {
        self.probes(key).all(|pos| self.bits[pos / 8] & (1 << (pos % 8)) != 0)
    }

    /// Length of the bit array in bytes.
    pub fn size(&self) -> usize {
        self.bits.len()
    }

    /// Probes per key.
    pub fn num_hashes(&self) -> u32 {
        self.num_hashes
    }

    /// Length of the bit array in bits.
    pub fn num_bits(&self) -> usize {
        self.num_bits
    }

    /// Serializes the filter as stored in the filter block:
    /// `num_hashes: u32 | num_bits: u64 | bits`, little-endian.
    pub fn encode(&self) -> Vec<u8> {
        let mut encoded = Vec::with_capacity(HEADER_LEN + self.bits.len());
        encoded.extend_from_slice(&self.num_hashes.to_le_bytes());
        encoded.extend_from_slice(&(self.num_bits as u64).to_le_bytes());
        encoded.extend_from_slice(&self.bits);
        encoded
    }

    /// Parses a filter block.
    pub fn decode(data: &[u8]) -> Result<Self> {
        let (num_hashes, num_bits, bits) = parse(data)?;
        Ok(Self { bits: bits.to_vec(), num_hashes, num_bits })
    }
}

fn parse(data: &[u8]) -> Result<(u32, usize, &[u8])> {
    if data.len() < HEADER_LEN {
        return Err(Error::corruption("bloom filter block too short"));
    }
    let mut h = [0u8; 4];
    h.copy_from_slice(&data[..4]);
    let num_hashes = u32::from_le_bytes(h);
    if num_hashes > MAX_NUM_HASHES {
        return Err(Error::corruption(format!("bloom filter probe count {} out of range", num_hashes)));
    }
    let mut b = [0u8; 8];
    b.copy_from_slice(&data[4..HEADER_LEN]);
    let num_bits = u64::from_le_bytes(b) as usize;
    let bits = &data[HEADER_LEN..];
    if num_bits == 0 || bits.len() != num_bits.div_ceil(8) {
        return Err(Error::corruption("bloom filter block size mismatch"));
    }
    Ok((num_hashes, num_bits, bits))
}

/// Bloom filter policy over a fixed number of bits per key.
#[derive(Debug, Clone, Copy)]
pub struct BloomFilterPolicy {
    bits_per_key: usize,
}

impl BloomFilterPolicy {
    /// Creates a policy.
    pub fn new(bits_per_key: usize) -> Self {
        Self { bits_per_key: bits_per_key.max(1) }
    }
}

impl Default for BloomFilterPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_BITS_PER_KEY)
    }
}

impl FilterPolicy for BloomFilterPolicy {
    fn name(&self) -> &str {
        BLOOM_FILTER_POLICY_NAME
    }

    fn may_contain(&self, filter: &[u8], key: &[u8]) -> bool {
        // A malformed filter must not hide keys.
        let Ok((num_hashes, num_bits, bits)) = parse(filter) else {
            return true;
        };
        let view = BloomFilter { bits: Vec::new(), num_hashes, num_bits };
        let hit = view.probes(key).all(|pos| bits[pos / 8] & (1 << (pos % 8)) != 0);
        hit
    }

    fn new_writer(&self) -> Box<dyn FilterWriter> {
        Box::new(BloomFilterWriter { bits_per_key: self.bits_per_key, keys: Vec::new() })
    }
}

struct BloomFilterWriter {
    bits_per_key: usize,
    keys: Vec<Vec<u8>>,
}

impl FilterWriter for BloomFilterWriter {
    fn add_key(&mut self, key: &[u8]) {
        if self.keys.last().map(|k| k.as_slice()) == Some(key) {
            return;
        }
        self.keys.push(key.to_vec());
    }

    fn finish(&mut self) -> Vec<u8> {
        let mut filter = BloomFilter::with_bits_per_key(self.keys.len(), self.bits_per_key);
        for key in self.keys.drain(..) {
            filter.add(&key);
        }
        filter.encode()
    }
}
