//! The iterator contract shared by every table iterator.

use crate::error::{Error, Result};
use crate::sstable::internal_key::InternalKeyRef;
use crate::sstable::value_block::LazyValue;
use std::sync::atomic::{AtomicU64, Ordering};

/// Flags for [`InternalIterator::seek_ge`] and [`InternalIterator::seek_prefix_ge`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SeekGeFlags {
    try_seek_using_next: bool,
}

impl SeekGeFlags {
    /// No flags.
    pub const NONE: SeekGeFlags = SeekGeFlags { try_seek_using_next: false };

    /// The caller asserts the seek key is at or past the current position, so the
    /// iterator may step forward instead of seeking. The iterator must be
    /// positioned (or exhausted) by a previous seek for this to hold.
    pub fn with_try_seek_using_next(mut self, value: bool) -> Self {
        self.try_seek_using_next = value;
        self
    }

    /// True if the caller allows stepping with `next`.
    pub fn try_seek_using_next(self) -> bool {
        self.try_seek_using_next
    }

    pub(crate) fn disable_try_seek_using_next(self) -> Self {
        self.with_try_seek_using_next(false)
    }
}

/// Flags for [`InternalIterator::seek_lt`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SeekLtFlags {
    /// Set by callers seeking relative to their current position. Table iterators
    /// ignore it.
    pub relative_seek: bool,
}

/// Counters describing the work done by iterators.
///
/// Shared between iterators through an `Arc`; all counters are relaxed atomics.
#[derive(Debug, Default)]
pub struct IterStats {
    /// Bytes of blocks loaded, from cache or file.
    pub block_bytes: AtomicU64,
    /// Bytes of blocks that were found in the cache.
    pub block_bytes_in_cache: AtomicU64,
    /// Blocks read from the file.
    pub block_reads: AtomicU64,
    /// Point values stored out of line that were surfaced.
    pub separated_point_values: AtomicU64,
    /// Total length of those values.
    pub separated_value_bytes: AtomicU64,
    /// Bytes of out-of-line values actually fetched.
    pub value_bytes_fetched: AtomicU64,
}

impl IterStats {
    /// Creates zeroed counters.
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_block(&self, len: u64, in_cache: bool) {
        self.block_bytes.fetch_add(len, Ordering::Relaxed);
        if in_cache {
            self.block_bytes_in_cache.fetch_add(len, Ordering::Relaxed);
        } else {
            self.block_reads.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Reads a counter.
    pub fn get(counter: &AtomicU64) -> u64 {
        counter.load(Ordering::Relaxed)
    }
}

/// An iterator over the internal keys of a table.
///
/// Positioning methods return `true` when the iterator lands on a key; the key and
/// value are then read with [`key`](Self::key) and [`value`](Self::value). `false`
/// means the iterator is exhausted or failed; [`error`](Self::error) tells which.
///
/// An error is sticky: every relative positioning call keeps returning `false`
/// until an absolute positioning call (a seek, `first` or `last`) clears it.
pub trait InternalIterator: Send {
    /// Moves to the first key whose user key is >= `key`.
    fn seek_ge(&mut self, key: &[u8], flags: SeekGeFlags) -> bool;

    /// Like [`seek_ge`](Self::seek_ge), for callers only interested in keys with
    /// prefix `prefix`. The table filter may rule out the prefix without reading
    /// any data block; keys past the prefix may still be returned.
    fn seek_prefix_ge(&mut self, prefix: &[u8], key: &[u8], flags: SeekGeFlags) -> bool;

    /// Moves to the last key whose user key is < `key`.
    fn seek_lt(&mut self, key: &[u8], flags: SeekLtFlags) -> bool;

    /// Moves to the first key. Panics when a lower bound is set.
    fn first(&mut self) -> bool;

    /// Moves to the last key. Panics when an upper bound is set.
    fn last(&mut self) -> bool;

    /// Moves to the next key.
    fn next(&mut self) -> bool;

    /// Moves to the first key whose user key is >= `succ_key`, the immediate
    /// successor of the current key's prefix.
    fn next_prefix(&mut self, succ_key: &[u8]) -> bool;

    /// Moves to the previous key.
    fn prev(&mut self) -> bool;

    /// The current key, or `None` when unpositioned.
    fn key(&self) -> Option<InternalKeyRef<'_>>;

    /// The current value. Empty when unpositioned.
    fn value(&self) -> LazyValue<'_>;

    /// The sticky error, if any.
    fn error(&self) -> Option<&Error>;

    /// Replaces the iteration bounds: `lower` inclusive, `upper` exclusive.
    fn set_bounds(&mut self, lower: Option<&[u8]>, upper: Option<&[u8]>);

    /// True if block-property filtering may have skipped keys between the last
    /// two positions.
    fn maybe_filtered_keys(&self) -> bool;

    /// Releases the blocks held by the iterator and returns the sticky error.
    fn close(&mut self) -> Result<()>;
}

/// An iterator over no keys, returned for tables that block-property filters
/// exclude as a whole.
#[derive(Debug, Default)]
pub struct EmptyIter {
    filtered: bool,
}

impl EmptyIter {
    /// An empty iterator. `filtered` is reported by `maybe_filtered_keys`.
    pub fn new(filtered: bool) -> Self {
        Self { filtered }
    }
}

impl InternalIterator for EmptyIter {
    fn seek_ge(&mut self, _key: &[u8], _flags: SeekGeFlags) -> bool {
        false
    }

    fn seek_prefix_ge(&mut self, _prefix: &[u8], _key: &[u8], _flags: SeekGeFlags) -> bool {
        false
    }

    fn seek_lt(&mut self, _key: &[u8], _flags: SeekLtFlags) -> bool {
        false
    }

    fn first(&mut self) -> bool {
        false
    }

    fn last(&mut self) -> bool {
        false
    }

    fn next(&mut self) -> bool {
        false
    }

    fn next_prefix(&mut self, _succ_key: &[u8]) -> bool {
        false
    }

    fn prev(&mut self) -> bool {
        false
    }

    fn key(&self) -> Option<InternalKeyRef<'_>> {
        None
    }

    fn value(&self) -> LazyValue<'_> {
        LazyValue::in_place(&[])
    }

    fn error(&self) -> Option<&Error> {
        None
    }

    fn set_bounds(&mut self, _lower: Option<&[u8]>, _upper: Option<&[u8]>) {}

    fn maybe_filtered_keys(&self) -> bool {
        self.filtered
    }

    fn close(&mut self) -> Result<()> {
        Ok(())
    }
}
