//! Iterator over a table with a two-level (partitioned) index.
//!
//! The top-level index maps separators to second-level index blocks, each of
//! which indexes a run of data blocks. The iterator positions the top-level index,
//! loads the second-level block into a [`SingleLevelIter`], and lets that iterator
//! do the rest. When the single-level iterator runs off the end of its index
//! block, this iterator moves to the next one.

use crate::config::IterOptions;
use crate::error::{Error, Result};
use crate::filter::block_property::IntersectsResult;
use crate::sstable::block::BlockIter;
use crate::sstable::footer::BlockHandle;
use crate::sstable::internal_key::InternalKeyRef;
use crate::sstable::iter::{InternalIterator, SeekGeFlags, SeekLtFlags};
use crate::sstable::iter_single::{corrupt_index_entry, resolve_maybe_excluded, LoadBlockResult, SingleLevelIter};
use crate::sstable::reader::ReaderInner;
use crate::sstable::value_block::LazyValue;
use log::trace;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Iterator over a table with a partitioned index.
#[derive(Debug)]
pub struct TwoLevelIter {
    inner: SingleLevelIter,
    top_level_index: BlockIter,
    maybe_filtered_keys_two_level: bool,
}

impl TwoLevelIter {
    pub(crate) fn new(reader: Arc<ReaderInner>, opts: IterOptions) -> Result<Self> {
        let inner = SingleLevelIter::unpositioned(reader, opts)?;
        let top = inner.reader.read_index(inner.stats.as_deref())?;
        let top_level_index = BlockIter::new(Arc::clone(&inner.cmp), top, inner.reader.global_seq_num(), false)?;
        Ok(Self { inner, top_level_index, maybe_filtered_keys_two_level: false })
    }

    fn top_key_before_lower(&self) -> bool {
        self.top_level_index.key().is_some_and(|k| self.inner.key_before_lower(k.user_key))
    }

    fn top_key_at_or_past_upper(&self) -> bool {
        self.top_level_index.key().is_some_and(|k| self.inner.key_at_or_past_upper(k.user_key))
    }

    fn latch_top_level_error(&mut self) -> bool {
        if self.inner.err.is_none() {
            self.inner.err = self.top_level_index.error().map(Error::duplicate);
        }
        self.inner.err.is_some()
    }

    /// Keeps a decode error of any of the block iterators. Returns whether the
    /// iterator holds an error.
    fn latch_error(&mut self) -> bool {
        self.inner.latch_data_error() || self.inner.latch_index_error() || self.latch_top_level_error()
    }

    fn invalidate(&mut self) {
        self.inner.data.invalidate();
        self.inner.index.invalidate();
    }

    /// Loads the second-level index block the top-level index points at.
    fn load_index(&mut self, dir: i8) -> LoadBlockResult {
        self.invalidate();
        if !self.top_level_index.is_valid() {
            self.latch_top_level_error();
            return LoadBlockResult::Failed;
        }
        let value = self.top_level_index.value();
        let decoded = BlockHandle::decode_with_props(value).map(|(bh, props)| (bh, value.len() - props.len()));
        let Ok((bh, props_off)) = decoded else {
            self.inner.err = Some(Error::corruption("corrupt top level index entry"));
            return LoadBlockResult::Failed;
        };

        let intersects =
            self.inner.filterer.as_ref().map(|f| f.intersects(&self.top_level_index.value()[props_off..]));
        match intersects {
            Some(Err(_)) => {
                self.inner.err = Some(corrupt_index_entry());
                return LoadBlockResult::Failed;
            }
            Some(Ok(mut result)) => {
                if result == IntersectsResult::MaybeExcluded {
                    result = resolve_maybe_excluded(self.inner.filterer.as_ref(), &mut self.top_level_index, dir);
                }
                if result == IntersectsResult::Excluded {
                    trace!("skipping index block {} of file {}", bh, self.inner.reader.file_num());
                    self.maybe_filtered_keys_two_level = true;
                    return LoadBlockResult::Irrelevant;
                }
            }
            None => {}
        }

        let block = match self.inner.reader.read_block(bh, self.inner.stats.as_deref(), self.inner.pool.as_ref()) {
            Ok(block) => block,
            Err(e) => {
                self.inner.err = Some(e);
                return LoadBlockResult::Failed;
            }
        };
        match self.inner.init_index(block) {
            Ok(()) => LoadBlockResult::Ok,
            Err(e) => {
                self.inner.err = Some(e);
                LoadBlockResult::Failed
            }
        }
    }

    /// Positions the top-level index for a forward seek. Returns `None` when the
    /// seek already finished, else whether the single-level seek must be skipped.
    fn position_top_level_for_seek_ge(
        &mut self,
        key: &[u8],
        flags: &mut SeekGeFlags,
        had_err: bool,
    ) -> Option<bool> {
        let slow_path = self.top_level_index.is_data_invalidated()
            || !self.top_level_index.is_valid()
            || self.inner.index.is_data_invalidated()
            || had_err
            || (self.inner.bounds_cmp <= 0 && !flags.try_seek_using_next())
            || self.top_level_index.key().is_some_and(|k| self.inner.cmp.compare(key, k.user_key).is_gt());
        if !slow_path {
            // Either the bounds moved forward, or the caller promised a forward
            // seek. Both keep the current second-level block.
            if self.inner.bounds_cmp > 0 {
                *flags = flags.disable_try_seek_using_next();
            }
            if !flags.try_seek_using_next() {
                self.inner.exhausted_bounds = 0;
            }
            return Some(false);
        }

        self.inner.exhausted_bounds = 0;
        self.maybe_filtered_keys_two_level = false;
        *flags = flags.disable_try_seek_using_next();
        if !self.top_level_index.seek_ge(key) {
            self.latch_top_level_error();
            self.invalidate();
            return None;
        }
        match self.load_index(1) {
            LoadBlockResult::Failed => {
                self.inner.bounds_cmp = 0;
                None
            }
            LoadBlockResult::Irrelevant => {
                if self.top_key_at_or_past_upper() {
                    self.inner.exhausted_bounds = 1;
                }
                self.inner.bounds_cmp = 0;
                Some(true)
            }
            LoadBlockResult::Ok => Some(false),
        }
    }

    fn skip_forward(&mut self) -> bool {
        loop {
            if self.latch_error() || self.inner.exhausted_bounds > 0 {
                return false;
            }
            self.inner.exhausted_bounds = 0;
            if !self.top_level_index.next() {
                self.latch_top_level_error();
                self.invalidate();
                return false;
            }
            match self.load_index(1) {
                LoadBlockResult::Failed => return false,
                LoadBlockResult::Ok => {
                    if self.inner.first_internal() {
                        return true;
                    }
                }
                LoadBlockResult::Irrelevant => {
                    if self.top_key_at_or_past_upper() {
                        self.inner.exhausted_bounds = 1;
                    }
                }
            }
        }
    }

    fn skip_backward(&mut self) -> bool {
        loop {
            if self.latch_error() || self.inner.exhausted_bounds < 0 {
                return false;
            }
            self.inner.exhausted_bounds = 0;
            if !self.top_level_index.prev() {
                self.latch_top_level_error();
                self.invalidate();
                return false;
            }
            match self.load_index(-1) {
                LoadBlockResult::Failed => return false,
                LoadBlockResult::Ok => {
                    if self.inner.last_internal() {
                        return true;
                    }
                }
                LoadBlockResult::Irrelevant => {
                    if self.top_key_before_lower() {
                        self.inner.exhausted_bounds = -1;
                    }
                }
            }
        }
    }
}

impl InternalIterator for TwoLevelIter {
    fn seek_ge(&mut self, key: &[u8], mut flags: SeekGeFlags) -> bool {
        let err = self.inner.err.take();
        if flags.try_seek_using_next()
            && (self.inner.exhausted_bounds == 1
                || (self.inner.data.is_data_invalidated() && self.inner.index.is_data_invalidated()))
            && err.is_none()
        {
            return false;
        }
        let Some(dont_seek_within_single_level) = self.position_top_level_for_seek_ge(key, &mut flags, err.is_some())
        else {
            return false;
        };
        if !dont_seek_within_single_level && self.inner.seek_ge_impl(key, flags) {
            return true;
        }
        self.skip_forward()
    }

    fn seek_prefix_ge(&mut self, prefix: &[u8], key: &[u8], mut flags: SeekGeFlags) -> bool {
        let err = self.inner.err.take();
        let check_filter = self.inner.use_filter && self.inner.reader.has_table_filter();
        let filter_used_and_did_not_match = check_filter && !self.inner.last_bloom_filter_matched;
        if flags.try_seek_using_next()
            && !filter_used_and_did_not_match
            && (self.inner.exhausted_bounds == 1
                || (self.inner.data.is_data_invalidated() && self.inner.index.is_data_invalidated()))
            && err.is_none()
        {
            return false;
        }
        if check_filter {
            if !self.inner.last_bloom_filter_matched {
                flags = flags.disable_try_seek_using_next();
            }
            self.inner.last_bloom_filter_matched = false;
            match self.inner.reader.table_filter_may_contain(prefix, self.inner.stats.as_deref()) {
                Err(e) => {
                    self.inner.err = Some(e);
                    self.inner.data.invalidate();
                    return false;
                }
                Ok(false) => {
                    self.inner.data.invalidate();
                    return false;
                }
                Ok(true) => self.inner.last_bloom_filter_matched = true,
            }
        }
        let Some(dont_seek_within_single_level) = self.position_top_level_for_seek_ge(key, &mut flags, err.is_some())
        else {
            return false;
        };
        if !dont_seek_within_single_level && self.inner.seek_prefix_ge_impl(prefix, key, flags, false) {
            return true;
        }
        self.skip_forward()
    }

    fn seek_lt(&mut self, key: &[u8], _flags: SeekLtFlags) -> bool {
        self.inner.exhausted_bounds = 0;
        self.inner.err = None;
        self.inner.bounds_cmp = 0;
        self.maybe_filtered_keys_two_level = false;

        let result = if self.top_level_index.seek_ge(key) {
            let result = self.load_index(-1);
            if result == LoadBlockResult::Ok && self.inner.seek_lt_impl(key) {
                return true;
            }
            result
        } else {
            if !self.top_level_index.last() {
                self.latch_top_level_error();
                self.invalidate();
                return false;
            }
            let result = self.load_index(-1);
            if result == LoadBlockResult::Ok && self.inner.last_internal() {
                return true;
            }
            result
        };
        match result {
            LoadBlockResult::Failed => return false,
            LoadBlockResult::Irrelevant if self.top_key_before_lower() => self.inner.exhausted_bounds = -1,
            _ => {}
        }
        self.skip_backward()
    }

    fn first(&mut self) -> bool {
        assert!(self.inner.lower.is_none(), "first() used despite lower bound");
        self.inner.exhausted_bounds = 0;
        self.maybe_filtered_keys_two_level = false;
        self.inner.err = None;
        self.inner.bounds_cmp = 0;
        if !self.top_level_index.first() {
            self.latch_top_level_error();
            self.invalidate();
            return false;
        }
        match self.load_index(1) {
            LoadBlockResult::Failed => return false,
            LoadBlockResult::Ok => {
                if self.inner.first_impl() {
                    return true;
                }
            }
            LoadBlockResult::Irrelevant => {
                if self.top_key_at_or_past_upper() {
                    self.inner.exhausted_bounds = 1;
                }
            }
        }
        self.skip_forward()
    }

    fn last(&mut self) -> bool {
        assert!(self.inner.upper.is_none(), "last() used despite upper bound");
        self.inner.exhausted_bounds = 0;
        self.maybe_filtered_keys_two_level = false;
        self.inner.err = None;
        self.inner.bounds_cmp = 0;
        if !self.top_level_index.last() {
            self.latch_top_level_error();
            self.invalidate();
            return false;
        }
        match self.load_index(-1) {
            LoadBlockResult::Failed => return false,
            LoadBlockResult::Ok => {
                if self.inner.last_impl() {
                    return true;
                }
            }
            LoadBlockResult::Irrelevant => {
                if self.top_key_before_lower() {
                    self.inner.exhausted_bounds = -1;
                }
            }
        }
        self.skip_backward()
    }

    fn next(&mut self) -> bool {
        self.inner.bounds_cmp = 0;
        self.maybe_filtered_keys_two_level = false;
        if self.latch_error() {
            return false;
        }
        if self.inner.next_impl() {
            return true;
        }
        self.skip_forward()
    }

    fn next_prefix(&mut self, succ_key: &[u8]) -> bool {
        assert!(self.inner.exhausted_bounds != 1, "next_prefix() called even though exhausted upper bound");
        self.inner.bounds_cmp = 0;
        self.maybe_filtered_keys_two_level = false;
        if self.latch_error() {
            return false;
        }
        if self.inner.next_prefix_impl(succ_key) {
            return true;
        }
        if self.latch_error() {
            return false;
        }
        if !self.top_level_index.seek_ge(succ_key) {
            self.latch_top_level_error();
            self.invalidate();
            return false;
        }
        match self.load_index(1) {
            LoadBlockResult::Failed => return false,
            LoadBlockResult::Irrelevant => {
                if self.top_key_at_or_past_upper() {
                    self.inner.exhausted_bounds = 1;
                }
            }
            LoadBlockResult::Ok => {
                if self.inner.seek_ge_impl(succ_key, SeekGeFlags::NONE) {
                    return true;
                }
            }
        }
        self.skip_forward()
    }

    fn prev(&mut self) -> bool {
        self.inner.bounds_cmp = 0;
        self.maybe_filtered_keys_two_level = false;
        if self.latch_error() {
            return false;
        }
        if self.inner.prev_impl() {
            return true;
        }
        self.skip_backward()
    }

    fn key(&self) -> Option<InternalKeyRef<'_>> {
        self.inner.current_key()
    }

    fn value(&self) -> LazyValue<'_> {
        self.inner.current_value()
    }

    fn error(&self) -> Option<&Error> {
        self.inner.error_impl().or_else(|| self.top_level_index.error())
    }

    fn set_bounds(&mut self, lower: Option<&[u8]>, upper: Option<&[u8]>) {
        self.inner.set_bounds_impl(lower, upper);
    }

    fn maybe_filtered_keys(&self) -> bool {
        self.maybe_filtered_keys_two_level || self.inner.maybe_filtered_keys_impl()
    }

    fn close(&mut self) -> Result<()> {
        self.latch_top_level_error();
        let res = self.inner.close_impl();
        self.top_level_index.close()?;
        res
    }
}

/// Forward-only compaction iterator over a table with a partitioned index.
#[derive(Debug)]
pub struct TwoLevelCompactionIter {
    iter: TwoLevelIter,
    bytes_iterated: Arc<AtomicU64>,
    prev_offset: u64,
}

impl TwoLevelCompactionIter {
    pub(crate) fn new(iter: TwoLevelIter, bytes_iterated: Arc<AtomicU64>) -> Self {
        Self { iter, bytes_iterated, prev_offset: 0 }
    }

    fn skip_forward(&mut self, mut positioned: bool) -> bool {
        if !positioned && !self.iter.latch_error() {
            loop {
                if !self.iter.top_level_index.next() {
                    self.iter.latch_top_level_error();
                    break;
                }
                match self.iter.load_index(1) {
                    LoadBlockResult::Ok => {}
                    LoadBlockResult::Irrelevant => unreachable!("compaction iterators never filter blocks"),
                    LoadBlockResult::Failed => break,
                }
                if self.iter.inner.first_impl() {
                    positioned = true;
                    break;
                }
                if self.iter.latch_error() {
                    break;
                }
            }
        }
        let cur_offset = self.iter.inner.record_offset();
        self.bytes_iterated.fetch_add(cur_offset.saturating_sub(self.prev_offset), Ordering::Relaxed);
        self.prev_offset = cur_offset;
        positioned
    }
}

impl InternalIterator for TwoLevelCompactionIter {
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
        self.iter.inner.err = None;
        let positioned = self.iter.first();
        self.skip_forward(positioned)
    }

    fn last(&mut self) -> bool {
        panic!("last is not supported by compaction iterators");
    }

    fn next(&mut self) -> bool {
        if self.iter.latch_error() {
            return false;
        }
        let positioned = self.iter.inner.next_impl();
        self.skip_forward(positioned)
    }

    fn next_prefix(&mut self, _succ_key: &[u8]) -> bool {
        panic!("next_prefix is not supported by compaction iterators");
    }

    fn prev(&mut self) -> bool {
        panic!("prev is not supported by compaction iterators");
    }

    fn key(&self) -> Option<InternalKeyRef<'_>> {
        self.iter.key()
    }

    fn value(&self) -> LazyValue<'_> {
        self.iter.value()
    }

    fn error(&self) -> Option<&Error> {
        self.iter.error()
    }

    fn set_bounds(&mut self, _lower: Option<&[u8]>, _upper: Option<&[u8]>) {
        panic!("set_bounds is not supported by compaction iterators");
    }

    fn maybe_filtered_keys(&self) -> bool {
        false
    }

    fn close(&mut self) -> Result<()> {
        self.iter.close()
    }
}
