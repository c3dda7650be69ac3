//! Iterator over a table with a single-level index.
//!
//! The iterator walks the index block and loads one data block at a time. Bounds
//! are enforced per block: when a loaded block lies entirely within a bound, the
//! per-key comparison against that bound is skipped.
//!
//! Exhaustion has two flavours. When the data ran out, the data block is
//! invalidated. When a bound was hit, `exhausted_bounds` records the direction and
//! the data block stays loaded, so a later seek with monotonically advancing
//! bounds can continue from it.

use crate::cache::{BufferHandle, BufferPool};
use crate::comparer::Comparer;
use crate::config::IterOptions;
use crate::error::{Error, Result};
use crate::filter::block_property::{BlockPropertiesFilterer, IntersectsResult};
use crate::sstable::block::BlockIter;
use crate::sstable::footer::BlockHandle;
use crate::sstable::internal_key::InternalKeyRef;
use crate::sstable::iter::{InternalIterator, IterStats, SeekGeFlags, SeekLtFlags};
use crate::sstable::reader::ReaderInner;
use crate::sstable::value_block::{LazyValue, ValueBlockReader};
use crate::sstable::BLOCK_TRAILER_LEN;
use log::{debug, trace};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Steps tried with `next`/`prev` before falling back to a real seek.
const NUM_STEPS_BEFORE_SEEK: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LoadBlockResult {
    Ok,
    Failed,
    /// The block was excluded by block-property filters and not loaded.
    Irrelevant,
}

enum StepOutcome {
    Done(bool),
    RanOut,
    Seek,
}

pub(crate) fn corrupt_index_entry() -> Error {
    Error::corruption("corrupt index entry")
}

/// Decides a block that only the bound-limited filter rejected, using the index
/// positioned on the block's entry. The index is left where it was.
pub(crate) fn resolve_maybe_excluded(
    filterer: Option<&BlockPropertiesFilterer>,
    index: &mut BlockIter,
    dir: i8,
) -> IntersectsResult {
    let Some(filter) = filterer.and_then(|f| f.bound_limited_filter()) else {
        return IntersectsResult::Intersects;
    };
    // The index key is an upper bound on the block's keys. Going forward the
    // block is excluded when that bound is within the filter's upper bound.
    if dir > 0 {
        return match index.key() {
            Some(k) if filter.key_is_within_upper_bound(k.user_key) => IntersectsResult::Excluded,
            _ => IntersectsResult::Intersects,
        };
    }
    // Going backward the previous index key lower-bounds the block's keys.
    let mut result = IntersectsResult::Intersects;
    if index.prev() {
        if let Some(k) = index.key() {
            if filter.key_is_within_lower_bound(k.user_key) {
                result = IntersectsResult::Excluded;
            }
        }
    }
    index.next();
    result
}

/// Iterator over a single-level table. The two-level iterator reuses it for the
/// second-level index block it has loaded.
pub struct SingleLevelIter {
    pub(crate) reader: Arc<ReaderInner>,
    pub(crate) cmp: Arc<dyn Comparer>,
    pub(crate) lower: Option<Vec<u8>>,
    pub(crate) upper: Option<Vec<u8>>,
    // Whether `lower`/`upper` must be checked against keys of the loaded block.
    block_lower: bool,
    block_upper: bool,
    pub(crate) filterer: Option<BlockPropertiesFilterer>,
    pub(crate) index: BlockIter,
    pub(crate) data: BlockIter,
    data_bh: BlockHandle,
    vbr: Option<ValueBlockReader>,
    pub(crate) err: Option<Error>,
    pub(crate) stats: Option<Arc<IterStats>>,
    pub(crate) pool: Option<Arc<BufferPool>>,
    // +1 when the new bounds lie entirely after the old ones, -1 when before.
    pub(crate) bounds_cmp: i8,
    positioned_using_latest_bounds: bool,
    pub(crate) exhausted_bounds: i8,
    maybe_filtered_keys: bool,
    pub(crate) use_filter: bool,
    pub(crate) last_bloom_filter_matched: bool,
    hide_obsolete_points: bool,
    closed: bool,
}

impl fmt::Debug for SingleLevelIter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SingleLevelIter")
            .field("file_num", &self.reader.file_num())
            .field("data_bh", &self.data_bh)
            .field("exhausted_bounds", &self.exhausted_bounds)
            .field("bounds_cmp", &self.bounds_cmp)
            .finish_non_exhaustive()
    }
}

impl SingleLevelIter {
    /// Builds an iterator with no index block loaded.
    pub(crate) fn unpositioned(reader: Arc<ReaderInner>, opts: IterOptions) -> Result<Self> {
        reader.check_open()?;
        opts.validate(reader.comparer().as_ref())?;
        let cmp = Arc::clone(reader.comparer());
        let stats = opts.stats;
        let mut data = BlockIter::default();
        let mut vbr = None;
        if reader.has_value_prefix() {
            vbr = reader.value_block_reader(stats.clone())?;
            data.set_has_value_prefix(true);
        }
        Ok(Self {
            reader,
            cmp,
            lower: opts.lower,
            upper: opts.upper,
            block_lower: false,
            block_upper: false,
            filterer: opts.filterer,
            index: BlockIter::default(),
            data,
            data_bh: BlockHandle::default(),
            vbr,
            err: None,
            stats,
            pool: opts.buffer_pool,
            bounds_cmp: 0,
            positioned_using_latest_bounds: false,
            exhausted_bounds: 0,
            maybe_filtered_keys: false,
            use_filter: opts.use_filter,
            last_bloom_filter_matched: false,
            hide_obsolete_points: opts.hide_obsolete_points,
            closed: false,
        })
    }

    pub(crate) fn new(reader: Arc<ReaderInner>, opts: IterOptions) -> Result<Self> {
        let mut iter = Self::unpositioned(reader, opts)?;
        let index = iter.reader.read_index(iter.stats.as_deref())?;
        iter.index.init(Arc::clone(&iter.cmp), index, iter.reader.global_seq_num(), false)?;
        Ok(iter)
    }

    /// Makes `index` iterate over the given second-level index block.
    pub(crate) fn init_index(&mut self, block: BufferHandle) -> Result<()> {
        self.index.init(Arc::clone(&self.cmp), block, self.reader.global_seq_num(), false)
    }

    pub(crate) fn key_at_or_past_upper(&self, key: &[u8]) -> bool {
        self.upper.as_deref().is_some_and(|u| self.cmp.compare(key, u).is_ge())
    }

    pub(crate) fn key_before_lower(&self, key: &[u8]) -> bool {
        self.lower.as_deref().is_some_and(|l| self.cmp.compare(key, l).is_lt())
    }

    /// True when the index key is at or past the upper bound.
    pub(crate) fn index_key_at_or_past_upper(&self) -> bool {
        self.index.key().is_some_and(|k| self.key_at_or_past_upper(k.user_key))
    }

    pub(crate) fn index_key_before_lower(&self) -> bool {
        self.index.key().is_some_and(|k| self.key_before_lower(k.user_key))
    }

    /// Applies the block upper bound to the data key; false when exhausted.
    fn check_block_upper(&mut self) -> bool {
        let past = self.block_upper && self.data.key().is_some_and(|k| self.key_at_or_past_upper(k.user_key));
        if past {
            self.exhausted_bounds = 1;
        }
        !past
    }

    fn check_block_lower(&mut self) -> bool {
        let before = self.block_lower && self.data.key().is_some_and(|k| self.key_before_lower(k.user_key));
        if before {
            self.exhausted_bounds = -1;
        }
        !before
    }

    fn init_bounds(&mut self) {
        self.block_lower = match (&self.lower, self.data.first_user_key()) {
            (Some(lower), Some(first)) => self.cmp.compare(lower, first).is_ge(),
            (lower, _) => lower.is_some(),
        };
        self.block_upper = match (&self.upper, self.index.key()) {
            (Some(upper), Some(k)) => self.cmp.compare(upper, k.user_key).is_le(),
            (upper, _) => upper.is_some(),
        };
    }

    pub(crate) fn set_bounds_impl(&mut self, lower: Option<&[u8]>, upper: Option<&[u8]>) {
        self.bounds_cmp = 0;
        if self.positioned_using_latest_bounds {
            if let (Some(old_upper), Some(new_lower)) = (&self.upper, lower) {
                if self.cmp.compare(old_upper, new_lower).is_le() {
                    self.bounds_cmp = 1;
                }
            }
            if self.bounds_cmp == 0 {
                if let (Some(old_lower), Some(new_upper)) = (&self.lower, upper) {
                    if self.cmp.compare(new_upper, old_lower).is_le() {
                        self.bounds_cmp = -1;
                    }
                }
            }
        }
        self.positioned_using_latest_bounds = false;
        self.lower = lower.map(<[u8]>::to_vec);
        self.upper = upper.map(<[u8]>::to_vec);
        self.block_lower = false;
        self.block_upper = false;
    }

    /// Keeps a decode error of the current data block before the block is
    /// replaced. Returns whether the iterator holds an error.
    pub(crate) fn latch_data_error(&mut self) -> bool {
        if self.err.is_none() {
            self.err = self.data.error().map(Error::duplicate);
        }
        self.err.is_some()
    }

    pub(crate) fn latch_index_error(&mut self) -> bool {
        if self.err.is_none() {
            self.err = self.index.error().map(Error::duplicate);
        }
        self.err.is_some()
    }

    pub(crate) fn load_block(&mut self, dir: i8) -> LoadBlockResult {
        if !self.index.is_valid() {
            self.latch_index_error();
            self.data.invalidate();
            return LoadBlockResult::Failed;
        }
        let value = self.index.value();
        let decoded = BlockHandle::decode_with_props(value).map(|(bh, props)| (bh, value.len() - props.len()));
        let (bh, props_off) = match decoded {
            Ok(d) => d,
            Err(_) => {
                self.data.invalidate();
                self.err = Some(corrupt_index_entry());
                return LoadBlockResult::Failed;
            }
        };
        if bh == self.data_bh && self.data.is_valid() {
            self.init_bounds();
            return LoadBlockResult::Ok;
        }
        self.data.invalidate();
        self.data_bh = bh;

        let intersects = self.filterer.as_ref().map(|f| f.intersects(&self.index.value()[props_off..]));
        match intersects {
            Some(Err(_)) => {
                self.err = Some(corrupt_index_entry());
                return LoadBlockResult::Failed;
            }
            Some(Ok(mut result)) => {
                if result == IntersectsResult::MaybeExcluded {
                    result = resolve_maybe_excluded(self.filterer.as_ref(), &mut self.index, dir);
                }
                if result == IntersectsResult::Excluded {
                    trace!("skipping data block {} of file {}", bh, self.reader.file_num());
                    self.maybe_filtered_keys = true;
                    return LoadBlockResult::Irrelevant;
                }
            }
            None => {}
        }

        let block = match self.reader.read_block(bh, self.stats.as_deref(), self.pool.as_ref()) {
            Ok(block) => block,
            Err(e) => {
                self.err = Some(e);
                return LoadBlockResult::Failed;
            }
        };
        let global_seq_num = self.reader.global_seq_num();
        if let Err(e) = self.data.init(Arc::clone(&self.cmp), block, global_seq_num, self.hide_obsolete_points) {
            self.data.invalidate();
            self.err = Some(e);
            return LoadBlockResult::Failed;
        }
        self.init_bounds();
        LoadBlockResult::Ok
    }

    fn try_seek_ge_using_next_within_block(&mut self, key: &[u8]) -> StepOutcome {
        for _ in 0..NUM_STEPS_BEFORE_SEEK {
            let Some(k) = self.data.key() else {
                return StepOutcome::RanOut;
            };
            if self.cmp.compare(k.user_key, key).is_ge() {
                return StepOutcome::Done(self.check_block_upper());
            }
            if !self.data.next() {
                return StepOutcome::RanOut;
            }
        }
        StepOutcome::Seek
    }

    fn try_seek_lt_using_prev_within_block(&mut self, key: &[u8]) -> StepOutcome {
        for _ in 0..NUM_STEPS_BEFORE_SEEK {
            let Some(k) = self.data.key() else {
                return StepOutcome::RanOut;
            };
            if self.cmp.compare(k.user_key, key).is_lt() {
                return StepOutcome::Done(self.check_block_lower());
            }
            if !self.data.prev() {
                return StepOutcome::RanOut;
            }
        }
        StepOutcome::Seek
    }

    fn data_key_lt(&self, key: &[u8]) -> Option<bool> {
        self.data.key().map(|k| self.cmp.compare(k.user_key, key).is_lt())
    }

    /// Offset in the file reached by the iterator, interpolated within the
    /// current data block.
    pub(crate) fn record_offset(&self) -> u64 {
        let mut offset = self.data_bh.offset;
        let block_len = self.data.block_len() as u64;
        if self.data.is_valid() && block_len > 0 {
            offset += self.data.next_entry_offset() as u64 * self.data_bh.length / block_len;
        } else {
            offset += self.data_bh.length + BLOCK_TRAILER_LEN as u64;
        }
        // Value blocks sit after the data blocks; spread their size over the
        // data section.
        let props = self.reader.properties();
        if self.vbr.is_some() && props.data_size > 0 {
            offset += (offset as f64 * props.value_blocks_size as f64 / props.data_size as f64) as u64;
        }
        offset
    }

    pub(crate) fn seek_ge_impl(&mut self, key: &[u8], mut flags: SeekGeFlags) -> bool {
        if flags.try_seek_using_next() {
            if (self.exhausted_bounds == 1 || self.data.is_data_invalidated()) && self.err.is_none() {
                return false;
            }
            if self.err.is_some() {
                flags = flags.disable_try_seek_using_next();
            }
        }
        self.exhausted_bounds = 0;
        self.err = None;
        let bounds_cmp = self.bounds_cmp;
        self.bounds_cmp = 0;
        self.positioned_using_latest_bounds = true;
        self.seek_ge_helper(key, bounds_cmp, flags)
    }

    fn seek_ge_helper(&mut self, key: &[u8], bounds_cmp: i8, flags: SeekGeFlags) -> bool {
        let mut dont_seek_within_block = false;
        let reuse_block = !self.data.is_data_invalidated()
            && !self.index.is_data_invalidated()
            && self.data.is_valid()
            && bounds_cmp > 0
            && self.index.key().is_some_and(|k| self.cmp.compare(key, k.user_key).is_le());
        if reuse_block {
            // The bounds moved forward and the key is still within this block.
            self.init_bounds();
            match self.try_seek_ge_using_next_within_block(key) {
                StepOutcome::Done(positioned) => return positioned,
                StepOutcome::RanOut => dont_seek_within_block = true,
                StepOutcome::Seek => {}
            }
        } else {
            if flags.try_seek_using_next() {
                if let Some(mut less) = self.data_key_lt(key) {
                    let mut steps = 0;
                    while less && steps < NUM_STEPS_BEFORE_SEEK {
                        if !self.next_impl() {
                            return false;
                        }
                        less = self.data_key_lt(key).unwrap_or(false);
                        steps += 1;
                    }
                    if !less {
                        return self.check_block_upper();
                    }
                }
            }

            self.maybe_filtered_keys = false;
            if !self.index.seek_ge(key) {
                self.latch_index_error();
                self.data.invalidate();
                return false;
            }
            match self.load_block(1) {
                LoadBlockResult::Failed => return false,
                LoadBlockResult::Irrelevant => {
                    // Later blocks only hold larger keys.
                    if self.index_key_at_or_past_upper() {
                        self.exhausted_bounds = 1;
                        return false;
                    }
                    dont_seek_within_block = true;
                }
                LoadBlockResult::Ok => {}
            }
        }
        if !dont_seek_within_block && self.data.seek_ge(key) {
            return self.check_block_upper();
        }
        self.skip_forward()
    }

    pub(crate) fn seek_prefix_ge_impl(
        &mut self,
        prefix: &[u8],
        key: &[u8],
        mut flags: SeekGeFlags,
        check_filter: bool,
    ) -> bool {
        let err = self.err.take();
        if check_filter && self.reader.has_table_filter() {
            if !self.last_bloom_filter_matched {
                flags = flags.disable_try_seek_using_next();
            }
            self.last_bloom_filter_matched = false;
            match self.reader.table_filter_may_contain(prefix, self.stats.as_deref()) {
                Err(e) => {
                    self.err = Some(e);
                    self.data.invalidate();
                    return false;
                }
                Ok(false) => {
                    self.data.invalidate();
                    return false;
                }
                Ok(true) => self.last_bloom_filter_matched = true,
            }
        }
        if flags.try_seek_using_next() {
            if (self.exhausted_bounds == 1 || self.data.is_data_invalidated()) && err.is_none() {
                return false;
            }
            if err.is_some() {
                flags = flags.disable_try_seek_using_next();
            }
        }
        self.exhausted_bounds = 0;
        let bounds_cmp = self.bounds_cmp;
        self.bounds_cmp = 0;
        self.positioned_using_latest_bounds = true;
        self.seek_ge_helper(key, bounds_cmp, flags)
    }

    pub(crate) fn seek_lt_impl(&mut self, key: &[u8]) -> bool {
        self.exhausted_bounds = 0;
        self.err = None;
        let bounds_cmp = self.bounds_cmp;
        self.bounds_cmp = 0;
        self.positioned_using_latest_bounds = true;

        let mut dont_seek_within_block = false;
        let reuse_block = !self.data.is_data_invalidated()
            && !self.index.is_data_invalidated()
            && self.data.is_valid()
            && self.index.is_valid()
            && bounds_cmp < 0
            && self.data.first_user_key().is_some_and(|first| self.cmp.compare(first, key).is_lt());
        if reuse_block {
            self.init_bounds();
            match self.try_seek_lt_using_prev_within_block(key) {
                StepOutcome::Done(positioned) => return positioned,
                StepOutcome::RanOut => dont_seek_within_block = true,
                StepOutcome::Seek => {}
            }
        } else {
            self.maybe_filtered_keys = false;
            // The first index key >= key covers the block that may hold the last
            // key < key; with none, that block is the last one.
            if !self.index.seek_ge(key) && !self.index.last() {
                self.latch_index_error();
                self.data.invalidate();
                return false;
            }
            match self.load_block(-1) {
                LoadBlockResult::Failed => return false,
                LoadBlockResult::Irrelevant => {
                    if self.index_key_before_lower() {
                        self.exhausted_bounds = -1;
                        return false;
                    }
                    dont_seek_within_block = true;
                }
                LoadBlockResult::Ok => {}
            }
        }
        if !dont_seek_within_block && self.data.seek_lt(key) {
            return self.check_block_lower();
        }
        self.skip_backward()
    }

    pub(crate) fn first_impl(&mut self) -> bool {
        assert!(self.lower.is_none(), "first() used despite lower bound");
        self.positioned_using_latest_bounds = true;
        self.maybe_filtered_keys = false;
        self.first_internal()
    }

    pub(crate) fn first_internal(&mut self) -> bool {
        self.exhausted_bounds = 0;
        self.err = None;
        self.bounds_cmp = 0;
        if !self.index.first() {
            self.latch_index_error();
            self.data.invalidate();
            return false;
        }
        match self.load_block(1) {
            LoadBlockResult::Failed => return false,
            LoadBlockResult::Ok => {
                if self.data.first() {
                    return self.check_block_upper();
                }
            }
            LoadBlockResult::Irrelevant => {
                if self.index_key_at_or_past_upper() {
                    self.exhausted_bounds = 1;
                    return false;
                }
            }
        }
        self.skip_forward()
    }

    pub(crate) fn last_impl(&mut self) -> bool {
        assert!(self.upper.is_none(), "last() used despite upper bound");
        self.positioned_using_latest_bounds = true;
        self.maybe_filtered_keys = false;
        self.last_internal()
    }

    pub(crate) fn last_internal(&mut self) -> bool {
        self.exhausted_bounds = 0;
        self.err = None;
        self.bounds_cmp = 0;
        if !self.index.last() {
            self.latch_index_error();
            self.data.invalidate();
            return false;
        }
        match self.load_block(-1) {
            LoadBlockResult::Failed => return false,
            LoadBlockResult::Ok => {
                if self.data.last() {
                    return self.check_block_lower();
                }
            }
            LoadBlockResult::Irrelevant => {
                if self.index_key_before_lower() {
                    self.exhausted_bounds = -1;
                    return false;
                }
            }
        }
        self.skip_backward()
    }

    pub(crate) fn next_impl(&mut self) -> bool {
        assert!(self.exhausted_bounds != 1, "next() called even though exhausted upper bound");
        self.exhausted_bounds = 0;
        self.maybe_filtered_keys = false;
        self.bounds_cmp = 0;
        if self.latch_data_error() || self.latch_index_error() {
            return false;
        }
        if self.data.next() {
            return self.check_block_upper();
        }
        self.skip_forward()
    }

    pub(crate) fn next_prefix_impl(&mut self, succ_key: &[u8]) -> bool {
        assert!(self.exhausted_bounds != 1, "next_prefix() called even though exhausted upper bound");
        self.exhausted_bounds = 0;
        self.maybe_filtered_keys = false;
        self.bounds_cmp = 0;
        if self.latch_data_error() || self.latch_index_error() {
            return false;
        }
        if self.data.next_prefix(succ_key) {
            return self.check_block_upper();
        }
        if self.latch_data_error() {
            return false;
        }
        if !self.index.next() {
            self.latch_index_error();
            self.data.invalidate();
            return false;
        }
        let beyond = self.index.key().is_some_and(|k| self.cmp.compare(succ_key, k.user_key).is_gt());
        if beyond && !self.index.seek_ge(succ_key) {
            self.latch_index_error();
            self.data.invalidate();
            return false;
        }
        match self.load_block(1) {
            LoadBlockResult::Failed => return false,
            LoadBlockResult::Irrelevant => {
                if self.index_key_at_or_past_upper() {
                    self.exhausted_bounds = 1;
                    return false;
                }
            }
            LoadBlockResult::Ok => {
                if self.data.seek_ge(succ_key) {
                    return self.check_block_upper();
                }
            }
        }
        self.skip_forward()
    }

    pub(crate) fn prev_impl(&mut self) -> bool {
        assert!(self.exhausted_bounds != -1, "prev() called even though exhausted lower bound");
        self.exhausted_bounds = 0;
        self.maybe_filtered_keys = false;
        self.bounds_cmp = 0;
        if self.latch_data_error() || self.latch_index_error() {
            return false;
        }
        if self.data.prev() {
            return self.check_block_lower();
        }
        self.skip_backward()
    }

    fn skip_forward(&mut self) -> bool {
        if self.latch_data_error() {
            return false;
        }
        loop {
            if !self.index.next() {
                self.latch_index_error();
                self.data.invalidate();
                return false;
            }
            match self.load_block(1) {
                LoadBlockResult::Ok => {
                    if self.data.first() {
                        return self.check_block_upper();
                    }
                    if self.latch_data_error() {
                        return false;
                    }
                    // Every key of the block was hidden.
                }
                _ if self.err.is_some() => return false,
                LoadBlockResult::Failed => {
                    // A valid index entry only fails to load with an error.
                    return false;
                }
                LoadBlockResult::Irrelevant => {
                    if self.index_key_at_or_past_upper() {
                        self.exhausted_bounds = 1;
                        return false;
                    }
                }
            }
        }
    }

    fn skip_backward(&mut self) -> bool {
        if self.latch_data_error() {
            return false;
        }
        loop {
            if !self.index.prev() {
                self.latch_index_error();
                self.data.invalidate();
                return false;
            }
            match self.load_block(-1) {
                LoadBlockResult::Ok => {
                    if self.data.last() {
                        return self.check_block_lower();
                    }
                    if self.latch_data_error() {
                        return false;
                    }
                    // Every key of the block was hidden.
                }
                _ if self.err.is_some() => return false,
                LoadBlockResult::Failed => return false,
                LoadBlockResult::Irrelevant => {
                    if self.index_key_before_lower() {
                        self.exhausted_bounds = -1;
                        return false;
                    }
                }
            }
        }
    }

    pub(crate) fn current_key(&self) -> Option<InternalKeyRef<'_>> {
        if self.exhausted_bounds != 0 || self.err.is_some() {
            return None;
        }
        self.data.key()
    }

    pub(crate) fn current_value(&self) -> LazyValue<'_> {
        if self.current_key().is_none() {
            return LazyValue::in_place(&[]);
        }
        self.data.lazy_value(self.vbr.as_ref())
    }

    pub(crate) fn error_impl(&self) -> Option<&Error> {
        self.err.as_ref().or_else(|| self.data.error()).or_else(|| self.index.error())
    }

    pub(crate) fn maybe_filtered_keys_impl(&self) -> bool {
        self.maybe_filtered_keys
    }

    pub(crate) fn close_impl(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.latch_data_error();
        self.latch_index_error();
        self.data.close()?;
        self.index.close()?;
        if let Some(vbr) = &self.vbr {
            vbr.close();
        }
        self.filterer = None;
        debug!("closed iterator over file {}", self.reader.file_num());
        match self.err.take() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

impl InternalIterator for SingleLevelIter {
    fn seek_ge(&mut self, key: &[u8], flags: SeekGeFlags) -> bool {
        self.seek_ge_impl(key, flags)
    }

    fn seek_prefix_ge(&mut self, prefix: &[u8], key: &[u8], flags: SeekGeFlags) -> bool {
        let check_filter = self.use_filter;
        self.seek_prefix_ge_impl(prefix, key, flags, check_filter)
    }

    fn seek_lt(&mut self, key: &[u8], _flags: SeekLtFlags) -> bool {
        self.seek_lt_impl(key)
    }

    fn first(&mut self) -> bool {
        self.first_impl()
    }

    fn last(&mut self) -> bool {
        self.last_impl()
    }

    fn next(&mut self) -> bool {
        self.next_impl()
    }

    fn next_prefix(&mut self, succ_key: &[u8]) -> bool {
        self.next_prefix_impl(succ_key)
    }

    fn prev(&mut self) -> bool {
        self.prev_impl()
    }

    fn key(&self) -> Option<InternalKeyRef<'_>> {
        self.current_key()
    }

    fn value(&self) -> LazyValue<'_> {
        self.current_value()
    }

    fn error(&self) -> Option<&Error> {
        self.error_impl()
    }

    fn set_bounds(&mut self, lower: Option<&[u8]>, upper: Option<&[u8]>) {
        self.set_bounds_impl(lower, upper);
    }

    fn maybe_filtered_keys(&self) -> bool {
        self.maybe_filtered_keys_impl()
    }

    fn close(&mut self) -> Result<()> {
        self.close_impl()
    }
}

/// Forward-only iterator used by compactions. It ignores bounds and filters
/// and adds the bytes it advances over to a shared counter.
#[derive(Debug)]
pub struct SingleLevelCompactionIter {
    iter: SingleLevelIter,
    bytes_iterated: Arc<AtomicU64>,
    prev_offset: u64,
}

impl SingleLevelCompactionIter {
    pub(crate) fn new(iter: SingleLevelIter, bytes_iterated: Arc<AtomicU64>) -> Self {
        Self { iter, bytes_iterated, prev_offset: 0 }
    }

    fn skip_forward(&mut self, mut positioned: bool) -> bool {
        if !positioned && !self.iter.latch_data_error() {
            loop {
                if !self.iter.index.next() {
                    self.iter.latch_index_error();
                    break;
                }
                match self.iter.load_block(1) {
                    LoadBlockResult::Ok => {}
                    _ if self.iter.err.is_some() => break,
                    LoadBlockResult::Failed => break,
                    LoadBlockResult::Irrelevant => {
                        unreachable!("compaction iterators never filter blocks")
                    }
                }
                if self.iter.data.first() {
                    positioned = true;
                    break;
                }
                if self.iter.latch_data_error() {
                    break;
                }
            }
        }
        let cur_offset = self.iter.record_offset();
        self.bytes_iterated.fetch_add(cur_offset.saturating_sub(self.prev_offset), Ordering::Relaxed);
        self.prev_offset = cur_offset;
        positioned
    }
}

impl InternalIterator for SingleLevelCompactionIter {
    fn seek_ge(&mut self, _key: &[u8], _flags: SeekGeFlags) -> bool {
        panic!("seek_ge is not supported by compaction iterators");
    }

    fn seek_prefix_ge(&mut self, _prefix: &[u8], _key: &[u8], _flags: SeekGeFlags) -> bool {
        panic!("seek_prefix_ge is not supported by compaction iterators");
    }

    fn seek_lt(&mut self, _key: &[u8], _flags: SeekLtFlags) -> bool {
        panic!("seek_lt is not supported by compaction iterators");
    }

    fn first(&mut self) -> bool {
        self.iter.err = None;
        let positioned = self.iter.first_impl();
        self.skip_forward(positioned)
    }

    fn last(&mut self) -> bool {
        panic!("last is not supported by compaction iterators");
    }

    fn next(&mut self) -> bool {
        if self.iter.latch_data_error() || self.iter.latch_index_error() {
            return false;
        }
        let positioned = self.iter.data.next();
        self.skip_forward(positioned)
    }

    fn next_prefix(&mut self, _succ_key: &[u8]) -> bool {
        panic!("next_prefix is not supported by compaction iterators");
    }

    fn prev(&mut self) -> bool {
        panic!("prev is not supported by compaction iterators");
    }

    fn key(&self) -> Option<InternalKeyRef<'_>> {
        self.iter.current_key()
    }

    fn value(&self) -> LazyValue<'_> {
        self.iter.current_value()
    }

    fn error(&self) -> Option<&Error> {
        self.iter.error_impl()
    }

    fn set_bounds(&mut self, _lower: Option<&[u8]>, _upper: Option<&[u8]>) {
        panic!("set_bounds is not supported by compaction iterators");
    }

    fn maybe_filtered_keys(&self) -> bool {
        false
    }

    fn close(&mut self) -> Result<()> {
        self.iter.close_impl()
    }
}
