//! User-key comparers.
//!
//! A comparer defines the total order over user keys, how a key splits into a
//! prefix and a suffix, and how index separators are shortened.

use std::cmp::Ordering;
use std::fmt;
use std::sync::Arc;

/// Ordering and key-shape operations over user keys.
pub trait Comparer: Send + Sync + fmt::Debug {
    /// Total order over user keys.
    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering;

    /// Equality under the comparer's order.
    fn equal(&self, a: &[u8], b: &[u8]) -> bool {
        self.compare(a, b) == Ordering::Equal
    }

    /// Length of the prefix of `key`. Keys sharing a prefix are versions of one
    /// logical key; filters are built over prefixes.
    fn split(&self, key: &[u8]) -> usize {
        key.len()
    }

    /// Appends to `dst` a key `k` with `a <= k < b`, preferably shorter than `a`.
    fn separator(&self, dst: &mut Vec<u8>, a: &[u8], b: &[u8]) {
        dst.extend_from_slice(a);
        let _ = b;
    }

    /// Appends to `dst` a key `k >= a`, preferably short.
    fn successor(&self, dst: &mut Vec<u8>, a: &[u8]) {
        dst.extend_from_slice(a);
    }

    /// Name recorded in table properties.
    fn name(&self) -> &str;
}

/// Length of the common prefix of two byte strings.
pub fn shared_prefix_len(a: &[u8], b: &[u8]) -> usize {
    a.iter().zip(b.iter()).take_while(|(x, y)| x == y).count()
}

/// Lexicographic byte order.
#[derive(Debug, Clone, Copy, Default)]
pub struct BytewiseComparer;

/// Name of [`BytewiseComparer`].
pub const BYTEWISE_COMPARER_NAME: &str = "leveldb.BytewiseComparator";

impl Comparer for BytewiseComparer {
    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering {
        a.cmp(b)
    }

    fn separator(&self, dst: &mut Vec<u8>, a: &[u8], b: &[u8]) {
        let i = shared_prefix_len(a, b);
        let n = dst.len();
        dst.extend_from_slice(a);

        let min = a.len().min(b.len());
        if i >= min {
            // a is a prefix of b, or equal.
            return;
        }
        if a[i] >= b[i] {
            return;
        }
        if i < b.len() - 1 || a[i] + 1 < b[i] {
            let i = i + n;
            dst[i] += 1;
            dst.truncate(i + 1);
            return;
        }

        let mut i = i + n + 1;
        while i < dst.len() {
            if dst[i] != 0xff {
                dst[i] += 1;
                dst.truncate(i + 1);
                return;
            }
            i += 1;
        }
    }

    fn successor(&self, dst: &mut Vec<u8>, a: &[u8]) {
        for (i, &c) in a.iter().enumerate() {
            if c != 0xff {
                dst.extend_from_slice(&a[..=i]);
                if let Some(last) = dst.last_mut() {
                    *last += 1;
                }
                return;
            }
        }
        dst.extend_from_slice(a);
    }

    fn name(&self) -> &str {
        BYTEWISE_COMPARER_NAME
    }
}

/// Orders keys of the form `prefix` + `delimiter` + `suffix`, where the suffix is a
/// version: prefixes ascend bytewise, a bare prefix sorts before its versions, and
/// versions of one prefix sort by suffix descending (newest first).
#[derive(Debug, Clone, Copy)]
pub struct SuffixedKeyComparer {
    delimiter: u8,
}

/// Name of [`SuffixedKeyComparer`].
pub const SUFFIXED_COMPARER_NAME: &str = "lsmtable.SuffixedKeyComparer";

impl SuffixedKeyComparer {
    /// Creates a comparer splitting keys at the first `delimiter` byte.
    pub fn new(delimiter: u8) -> Self {
        Self { delimiter }
    }
}

impl Default for SuffixedKeyComparer {
    fn default() -> Self {
        Self::new(b'@')
    }
}

impl Comparer for SuffixedKeyComparer {
    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering {
        let (ap, asuf) = a.split_at(self.split(a));
        let (bp, bsuf) = b.split_at(self.split(b));
        match ap.cmp(bp) {
            Ordering::Equal => {}
            o => return o,
        }
        match (asuf.is_empty(), bsuf.is_empty()) {
            (true, true) => Ordering::Equal,
            (true, false) => Ordering::Less,
            (false, true) => Ordering::Greater,
            (false, false) => {
                // Longer numeric suffixes are larger versions.
                bsuf.len().cmp(&asuf.len()).then_with(|| bsuf.cmp(asuf))
            }
        }
    }

    fn split(&self, key: &[u8]) -> usize {
        key.iter().position(|&c| c == self.delimiter).unwrap_or(key.len())
    }

    fn name(&self) -> &str {
        SUFFIXED_COMPARER_NAME
    }
}

/// The default comparer.
pub fn default_comparer() -> Arc<dyn Comparer> {
    Arc::new(BytewiseComparer)
}
