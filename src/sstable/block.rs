//! Block format: prefix-compressed entries with restart points.
//!
//! ```text
//! Block:
//!   [entry]* [restart: u32 LE]* [num_restarts: u32 LE]
//!
//! Entry:
//!   [shared: uvarint] [unshared: uvarint] [value_len: uvarint]
//!   [unshared key bytes] [value prefix: u8, optional] [value bytes]
//! ```
//!
//! Every `restart_interval`-th entry is a restart point and stores its key with
//! `shared == 0`. The top bit of a restart offset is set when every SET between the
//! previous restart and this one shares the key prefix of the key before it; readers
//! use it to skip whole restart intervals in [`BlockIter::next_prefix`].
//!
//! Keys are encoded internal keys, except in the metaindex and properties blocks,
//! whose raw keys are read with [`RawBlockIter`].

use crate::cache::BufferHandle;
use crate::comparer::{default_comparer, Comparer};
use crate::error::{Error, Result};
use crate::sstable::coding::{decode_uvarint32, put_uvarint, read_u32_le, read_u64_le, MAX_VARINT_LEN32};
use crate::sstable::internal_key::{
    split_encoded, trailer_kind, InternalKeyKind, InternalKeyRef, OBSOLETE_BIT, TRAILER_LEN,
    TRAILER_OBSOLETE_MASK,
};
use crate::sstable::value_block::{is_value_handle, set_has_same_prefix, LazyValue, ValueBlockReader};
use bytes::Bytes;
use std::cmp::Ordering;
use std::ops::Range;
use std::sync::Arc;

/// Blocks larger than this are rejected; the top restart bits are reserved.
pub const MAXIMUM_BLOCK_SIZE: usize = 1 << 28;

/// Size of a block with no entries: a single restart count.
pub const EMPTY_BLOCK_SIZE: usize = 4;

const SET_HAS_SAME_KEY_PREFIX_RESTART_MASK: u32 = 1 << 31;
const RESTART_OFFSET_MASK: u32 = !SET_HAS_SAME_KEY_PREFIX_RESTART_MASK;

/// Per-entry encoding choices for [`BlockWriter::add_entry`].
#[derive(Debug, Clone, Copy, Default)]
pub struct EntryOptions {
    /// Set the obsolete bit in the stored trailer.
    pub is_obsolete: bool,
    /// Upper bound on the prefix shared with the previous key.
    pub max_shared_key_len: Option<usize>,
    /// Value prefix byte written before the value.
    pub value_prefix: Option<u8>,
    /// The key is a SET sharing the key prefix of the previous key.
    pub set_has_same_key_prefix: bool,
}

/// Builds a single block.
#[derive(Debug)]
pub struct BlockWriter {
    restart_interval: usize,
    n_entries: usize,
    next_restart: usize,
    buf: Vec<u8>,
    restarts: Vec<u32>,
    // May carry the obsolete bit; read through `cur_key`.
    cur_key: Vec<u8>,
    prev_key: Vec<u8>,
    set_has_same_key_prefix_since_last_restart: bool,
}

impl BlockWriter {
    /// Creates a writer placing a restart point every `restart_interval` entries.
    pub fn new(restart_interval: usize) -> Self {
        Self {
            restart_interval: restart_interval.max(1),
            n_entries: 0,
            next_restart: 0,
            buf: Vec::new(),
            restarts: Vec::new(),
            cur_key: Vec::new(),
            prev_key: Vec::new(),
            set_has_same_key_prefix_since_last_restart: false,
        }
    }

    /// Adds an internal key. Sharing is limited to the user key.
    pub fn add(&mut self, key: InternalKeyRef<'_>, value: &[u8]) {
        self.add_entry(key, value, EntryOptions::default());
    }

    /// Adds an internal key with explicit encoding options.
    pub fn add_entry(&mut self, key: InternalKeyRef<'_>, value: &[u8], opts: EntryOptions) {
        std::mem::swap(&mut self.cur_key, &mut self.prev_key);
        self.cur_key.clear();
        self.cur_key.extend_from_slice(key.user_key);
        let mut trailer = key.trailer;
        if opts.is_obsolete {
            trailer |= u64::from(OBSOLETE_BIT);
        }
        self.cur_key.extend_from_slice(&trailer.to_le_bytes());
        let max_shared = opts.max_shared_key_len.unwrap_or(key.user_key.len());
        self.store(value, max_shared, opts.value_prefix, opts.set_has_same_key_prefix);
    }

    /// Adds a raw (non-internal) key, as used by the metaindex and properties blocks.
    pub fn add_raw(&mut self, key: &[u8], value: &[u8]) {
        std::mem::swap(&mut self.cur_key, &mut self.prev_key);
        self.cur_key.clear();
        self.cur_key.extend_from_slice(key);
        self.store(value, key.len(), None, false);
    }

    fn store(
        &mut self,
        value: &[u8],
        max_shared_key_len: usize,
        value_prefix: Option<u8>,
        set_has_same_key_prefix: bool,
    ) {
        let mut shared = 0;
        if !set_has_same_key_prefix {
            self.set_has_same_key_prefix_since_last_restart = false;
        }
        if self.n_entries == self.next_restart {
            self.next_restart = self.n_entries + self.restart_interval;
            let mut restart = self.buf.len() as u32;
            if self.set_has_same_key_prefix_since_last_restart {
                restart |= SET_HAS_SAME_KEY_PREFIX_RESTART_MASK;
            }
            self.set_has_same_key_prefix_since_last_restart = true;
            self.restarts.push(restart);
        } else {
            let n = max_shared_key_len.min(self.prev_key.len()).min(self.cur_key.len());
            shared = self.cur_key[..n].iter().zip(&self.prev_key[..n]).take_while(|(a, b)| a == b).count();
        }

        let value_len = value.len() + usize::from(value_prefix.is_some());
        let unshared = self.cur_key.len() - shared;
        self.buf.reserve(3 * MAX_VARINT_LEN32 + unshared + value_len);
        put_uvarint(&mut self.buf, shared as u64);
        put_uvarint(&mut self.buf, unshared as u64);
        put_uvarint(&mut self.buf, value_len as u64);
        self.buf.extend_from_slice(&self.cur_key[shared..]);
        if let Some(prefix) = value_prefix {
            self.buf.push(prefix);
        }
        self.buf.extend_from_slice(value);
        self.n_entries += 1;
    }

    /// Appends the restart array and returns the block, resetting the writer.
    pub fn finish(&mut self) -> Vec<u8> {
        if self.n_entries == 0 {
            // Every block has at least one restart point.
            self.restarts.clear();
            self.restarts.push(0);
        }
        for r in &self.restarts {
            self.buf.extend_from_slice(&r.to_le_bytes());
        }
        self.buf.extend_from_slice(&(self.restarts.len() as u32).to_le_bytes());
        let block = std::mem::take(&mut self.buf);
        self.n_entries = 0;
        self.next_restart = 0;
        self.restarts.clear();
        self.set_has_same_key_prefix_since_last_restart = false;
        block
    }

    /// Size of the block if finished now.
    pub fn estimated_size(&self) -> usize {
        self.buf.len() + 4 * self.restarts.len() + EMPTY_BLOCK_SIZE
    }

    /// Number of entries added since the last finish.
    pub fn entry_count(&self) -> usize {
        self.n_entries
    }

    /// True if no entries were added since the last finish.
    pub fn is_empty(&self) -> bool {
        self.n_entries == 0
    }

    /// The last added internal key, obsolete bit cleared.
    pub fn cur_key(&self) -> InternalKeyRef<'_> {
        let (user_key, trailer) = split_encoded(&self.cur_key);
        InternalKeyRef { user_key, trailer: trailer & TRAILER_OBSOLETE_MASK }
    }

    /// The user key of the last added internal key.
    pub fn cur_user_key(&self) -> &[u8] {
        self.cur_key().user_key
    }

    /// The last added raw key.
    pub fn cur_raw_key(&self) -> &[u8] {
        &self.cur_key
    }
}

struct EntryHeader {
    shared: usize,
    key: Range<usize>,
    value_end: usize,
}

/// Decodes the entry header at `offset`, checking every length against `data`.
fn decode_entry(data: &[u8], offset: usize) -> Option<EntryHeader> {
    let mut p = offset;
    let (shared, n) = decode_uvarint32(data.get(p..)?)?;
    p += n;
    let (unshared, n) = decode_uvarint32(data.get(p..)?)?;
    p += n;
    let (value_len, n) = decode_uvarint32(data.get(p..)?)?;
    p += n;
    let key_end = p.checked_add(unshared as usize)?;
    let value_end = key_end.checked_add(value_len as usize)?;
    if value_end > data.len() {
        return None;
    }
    Some(EntryHeader { shared: shared as usize, key: p..key_end, value_end })
}

/// Validates the trailer of a block and returns `(restarts_offset, num_restarts)`.
fn decode_restart_array(data: &[u8]) -> Result<(usize, usize)> {
    let num_restarts = data
        .len()
        .checked_sub(4)
        .and_then(|n| read_u32_le(data, n))
        .ok_or_else(|| Error::corruption(format!("block too small ({} bytes)", data.len())))?
        as usize;
    if num_restarts == 0 {
        return Err(Error::corruption("invalid table (block has no restart points)"));
    }
    let restarts = num_restarts
        .checked_add(1)
        .and_then(|n| n.checked_mul(4))
        .and_then(|n| data.len().checked_sub(n))
        .ok_or_else(|| Error::corruption(format!("invalid restart count {num_restarts}")))?;
    Ok((restarts, num_restarts))
}

#[derive(Debug, Clone, Copy)]
enum KeySource {
    /// Stored whole in the block (a restart or an unshared key).
    Block(usize, usize),
    /// Assembled in `full_key`.
    FullKey,
    /// Copied into `cached_buf` during reverse iteration.
    Cached(usize, usize),
}

#[derive(Debug, Clone)]
struct CachedEntry {
    offset: isize,
    key: Range<usize>,
    value: Range<usize>,
}

/// Iterator over the entries of one block.
///
/// Positioning methods return `true` when the iterator lands on an entry. The
/// iterator compares user keys only; the trailer is surfaced but never consulted
/// while seeking.
///
/// Reverse iteration cannot decode prefix-compressed keys backwards, so `prev`
/// re-scans from the previous restart point and caches the entries it passes.
#[derive(Debug)]
pub struct BlockIter {
    cmp: Arc<dyn Comparer>,
    handle: BufferHandle,
    // Offset of the restart array; entries live in [0, restarts).
    restarts: usize,
    num_restarts: usize,
    global_seq_num: u64,
    // Offset of the current entry, -1 before the first one.
    offset: isize,
    next_offset: usize,
    key_src: KeySource,
    full_key: Vec<u8>,
    user_key_len: usize,
    trailer: u64,
    val: Range<usize>,
    cached: Vec<CachedEntry>,
    cached_buf: Vec<u8>,
    first_user_key: Option<Range<usize>>,
    has_value_prefix: bool,
    hide_obsolete_points: bool,
    err: Option<Error>,
}

impl Default for BlockIter {
    fn default() -> Self {
        Self {
            cmp: default_comparer(),
            handle: BufferHandle::empty(),
            restarts: 0,
            num_restarts: 0,
            global_seq_num: 0,
            offset: 0,
            next_offset: 0,
            key_src: KeySource::FullKey,
            full_key: Vec::new(),
            user_key_len: 0,
            trailer: 0,
            val: 0..0,
            cached: Vec::new(),
            cached_buf: Vec::new(),
            first_user_key: None,
            has_value_prefix: false,
            hide_obsolete_points: false,
            err: None,
        }
    }
}

impl BlockIter {
    /// Creates an iterator over `block`.
    pub fn new(
        cmp: Arc<dyn Comparer>,
        block: impl Into<BufferHandle>,
        global_seq_num: u64,
        hide_obsolete_points: bool,
    ) -> Result<Self> {
        let mut iter = BlockIter::default();
        iter.init(cmp, block.into(), global_seq_num, hide_obsolete_points)?;
        Ok(iter)
    }

    /// Re-targets the iterator at a new block, keeping its buffers.
    pub fn init(
        &mut self,
        cmp: Arc<dyn Comparer>,
        handle: BufferHandle,
        global_seq_num: u64,
        hide_obsolete_points: bool,
    ) -> Result<()> {
        let (restarts, num_restarts) = decode_restart_array(&handle)?;
        self.cmp = cmp;
        self.handle = handle;
        self.restarts = restarts;
        self.num_restarts = num_restarts;
        self.global_seq_num = global_seq_num;
        self.hide_obsolete_points = hide_obsolete_points;
        self.offset = 0;
        self.next_offset = 0;
        self.key_src = KeySource::FullKey;
        self.full_key.clear();
        self.val = 0..0;
        self.err = None;
        self.clear_cache();
        self.first_user_key = None;
        if self.restarts > 0 {
            self.read_first_key()?;
        }
        Ok(())
    }

    /// Declares that SET values carry a value prefix byte.
    pub fn set_has_value_prefix(&mut self, has_value_prefix: bool) {
        self.has_value_prefix = has_value_prefix;
    }

    /// Drops the block, leaving the iterator unusable until the next `init`.
    pub fn invalidate(&mut self) {
        self.clear_cache();
        self.handle = BufferHandle::empty();
        self.offset = 0;
        self.next_offset = 0;
        self.restarts = 0;
        self.num_restarts = 0;
        self.first_user_key = None;
        self.err = None;
    }

    /// True after `invalidate` (or before the first `init`).
    pub fn is_data_invalidated(&self) -> bool {
        self.num_restarts == 0
    }

    /// Releases the block.
    pub fn close(&mut self) -> Result<()> {
        self.invalidate();
        Ok(())
    }

    /// The first error met while decoding this block.
    pub fn error(&self) -> Option<&Error> {
        self.err.as_ref()
    }

    /// Size of the block in bytes.
    pub fn block_len(&self) -> usize {
        self.handle.len()
    }

    /// User key of the first entry, `None` for an empty block.
    pub fn first_user_key(&self) -> Option<&[u8]> {
        self.first_user_key.clone().map(|r| &self.handle[r])
    }

    fn read_first_key(&mut self) -> Result<()> {
        let data = &self.handle[..self.restarts];
        let e = decode_entry(data, 0).ok_or_else(|| Error::corruption("invalid first entry in block"))?;
        if e.shared != 0 {
            return Err(Error::corruption("first key in block must have zero shared prefix"));
        }
        if e.key.len() < TRAILER_LEN {
            return Err(Error::corruption("invalid first key in block"));
        }
        self.first_user_key = Some(e.key.start..e.key.end - TRAILER_LEN);
        Ok(())
    }

    fn valid(&self) -> bool {
        self.err.is_none() && self.offset >= 0 && (self.offset as usize) < self.restarts
    }

    fn corrupt(&mut self, msg: String) -> bool {
        if self.err.is_none() {
            self.err = Some(Error::corruption(msg));
        }
        false
    }

    fn clear_cache(&mut self) {
        self.cached.clear();
        self.cached_buf.clear();
    }

    fn restart_raw(&self, index: usize) -> u32 {
        read_u32_le(&self.handle, self.restarts + 4 * index).unwrap_or_default()
    }

    fn restart_offset(&self, index: usize) -> usize {
        (self.restart_raw(index) & RESTART_OFFSET_MASK) as usize
    }

    fn restart_has_same_prefix(&self, index: usize) -> bool {
        self.restart_raw(index) & SET_HAS_SAME_KEY_PREFIX_RESTART_MASK != 0
    }

    /// User key stored at restart point `index`.
    fn restart_user_key(&self, index: usize) -> Result<&[u8]> {
        let offset = self.restart_offset(index);
        let data = &self.handle[..self.restarts];
        let e = decode_entry(data, offset)
            .ok_or_else(|| Error::corruption(format!("invalid restart point {index} at offset {offset}")))?;
        if e.shared != 0 {
            return Err(Error::corruption(format!(
                "restart point {index} at offset {offset} has a shared prefix"
            )));
        }
        let k = &data[e.key];
        Ok(if k.len() >= TRAILER_LEN { &k[..k.len() - TRAILER_LEN] } else { &[] })
    }

    /// Index of the first restart point whose key is >= `key`.
    fn search_restarts_by_key(&self, key: &[u8]) -> Result<usize> {
        let (mut index, mut upper) = (0, self.num_restarts);
        while index < upper {
            let h = index + (upper - index) / 2;
            if self.cmp.compare(key, self.restart_user_key(h)?) == Ordering::Greater {
                index = h + 1;
            } else {
                upper = h;
            }
        }
        Ok(index)
    }

    /// Index of the first restart point at or after `target`.
    fn search_restarts_by_offset(&self, target: usize) -> usize {
        let (mut index, mut upper) = (0, self.num_restarts);
        while index < upper {
            let h = index + (upper - index) / 2;
            if self.restart_offset(h) < target {
                index = h + 1;
            } else {
                upper = h;
            }
        }
        index
    }

    fn read_entry(&mut self) -> bool {
        let offset = self.offset as usize;
        let data = &self.handle[..self.restarts];
        let Some(e) = decode_entry(data, offset) else {
            return self.corrupt(format!("invalid block entry at offset {offset}"));
        };
        if e.shared > self.full_key.len() {
            return self.corrupt(format!("shared prefix of entry at offset {offset} exceeds previous key"));
        }
        self.full_key.truncate(e.shared);
        self.full_key.extend_from_slice(&data[e.key.clone()]);
        self.key_src = if e.shared == 0 { KeySource::Block(e.key.start, e.key.end) } else { KeySource::FullKey };
        self.val = e.key.end..e.value_end;
        self.next_offset = e.value_end;
        true
    }

    fn current_key_bytes(&self) -> &[u8] {
        match self.key_src {
            KeySource::Block(s, e) => &self.handle[s..e],
            KeySource::FullKey => &self.full_key,
            KeySource::Cached(s, e) => &self.cached_buf[s..e],
        }
    }

    /// Decodes the current key's trailer. Returns true if the key is hidden.
    fn decode_key(&mut self) -> bool {
        let (user_key_len, trailer, hidden) = {
            let key = self.current_key_bytes();
            match key.len().checked_sub(TRAILER_LEN) {
                Some(n) => {
                    let raw = read_u64_le(key, n).unwrap_or_default();
                    let hidden = self.hide_obsolete_points && raw & u64::from(OBSOLETE_BIT) != 0;
                    let mut trailer = raw & TRAILER_OBSOLETE_MASK;
                    if self.global_seq_num != 0 {
                        trailer = (self.global_seq_num << 8) | (trailer & 0xff);
                    }
                    (n, trailer, hidden)
                }
                None => (0, u64::from(InternalKeyKind::Invalid.as_u8()), false),
            }
        };
        self.user_key_len = user_key_len;
        self.trailer = trailer;
        hidden
    }

    fn cache_entry(&mut self) {
        let start = self.cached_buf.len();
        match self.key_src {
            KeySource::Block(s, e) => self.cached_buf.extend_from_slice(&self.handle[s..e]),
            KeySource::FullKey => self.cached_buf.extend_from_slice(&self.full_key),
            KeySource::Cached(s, e) => self.cached_buf.extend_from_within(s..e),
        }
        self.cached.push(CachedEntry {
            offset: self.offset,
            key: start..self.cached_buf.len(),
            value: self.val.clone(),
        });
    }

    /// Makes `full_key` hold the current key so forward decoding can resume.
    fn sync_full_key(&mut self) {
        match self.key_src {
            KeySource::Block(s, e) => {
                self.full_key.clear();
                self.full_key.extend_from_slice(&self.handle[s..e]);
            }
            KeySource::Cached(s, e) => {
                self.full_key.clear();
                self.full_key.extend_from_slice(&self.cached_buf[s..e]);
                self.key_src = KeySource::FullKey;
            }
            KeySource::FullKey => {}
        }
    }

    fn user_key_cmp(&self, key: &[u8]) -> Ordering {
        let cur = &self.current_key_bytes()[..self.user_key_len];
        self.cmp.compare(cur, key)
    }

    /// Moves to the first entry whose user key is >= `key`.
    pub fn seek_ge(&mut self, key: &[u8]) -> bool {
        if self.err.is_some() {
            return false;
        }
        self.clear_cache();
        self.offset = 0;
        if self.restarts == 0 {
            return false;
        }
        let index = match self.search_restarts_by_key(key) {
            Ok(i) => i,
            Err(e) => {
                self.err = Some(e);
                return false;
            }
        };
        if index > 0 {
            self.offset = self.restart_offset(index - 1) as isize;
        }
        if !self.valid() || !self.read_entry() {
            return false;
        }
        let hidden = self.decode_key();
        if !hidden && self.user_key_cmp(key) != Ordering::Less {
            return true;
        }
        while self.next() {
            if self.user_key_cmp(key) != Ordering::Less {
                return true;
            }
        }
        false
    }

    /// Moves to the last entry whose user key is < `key`.
    pub fn seek_lt(&mut self, key: &[u8]) -> bool {
        if self.err.is_some() {
            return false;
        }
        self.clear_cache();
        self.offset = 0;
        if self.restarts == 0 {
            self.offset = -1;
            return false;
        }
        let index = match self.search_restarts_by_key(key) {
            Ok(i) => i,
            Err(e) => {
                self.err = Some(e);
                return false;
            }
        };
        if index == 0 {
            // Every key in the block is >= key.
            self.offset = -1;
            self.next_offset = 0;
            return false;
        }
        self.offset = self.restart_offset(index - 1) as isize;
        let target = if index < self.num_restarts { self.restart_offset(index) } else { self.restarts };
        self.next_offset = self.offset as usize;
        loop {
            self.offset = self.next_offset as isize;
            if !self.read_entry() {
                return false;
            }
            let hidden = self.decode_key();
            if self.user_key_cmp(key) != Ordering::Less {
                return self.prev();
            }
            if self.next_offset >= target {
                if hidden {
                    return self.prev();
                }
                break;
            }
            self.cache_entry();
        }
        self.valid()
    }

    /// Moves to the first entry.
    pub fn first(&mut self) -> bool {
        if self.err.is_some() {
            return false;
        }
        self.offset = 0;
        if !self.valid() {
            return false;
        }
        self.clear_cache();
        if !self.read_entry() {
            return false;
        }
        if self.decode_key() {
            return self.next();
        }
        true
    }

    /// Moves to the last entry.
    pub fn last(&mut self) -> bool {
        if self.err.is_some() || self.num_restarts == 0 {
            return false;
        }
        self.offset = self.restart_offset(self.num_restarts - 1) as isize;
        if !self.valid() {
            return false;
        }
        self.clear_cache();
        if !self.read_entry() {
            return false;
        }
        while self.next_offset < self.restarts {
            self.cache_entry();
            self.offset = self.next_offset as isize;
            if !self.read_entry() {
                return false;
            }
        }
        if self.decode_key() {
            return self.prev();
        }
        true
    }

    /// Moves to the next entry.
    #[allow(clippy::should_implement_trait)]
    pub fn next(&mut self) -> bool {
        if self.err.is_some() {
            return false;
        }
        if !self.cached_buf.is_empty() {
            // Switching from reverse to forward iteration.
            self.sync_full_key();
            self.clear_cache();
        }
        loop {
            self.offset = self.next_offset as isize;
            if !self.valid() || !self.read_entry() {
                return false;
            }
            if !self.decode_key() {
                return true;
            }
        }
    }

    /// Moves to the first entry whose user key is >= `succ_key`, which must be
    /// greater than the current user key.
    pub fn next_prefix(&mut self, succ_key: &[u8]) -> bool {
        if self.has_value_prefix {
            return self.next_prefix_v3(succ_key);
        }
        const NEXTS_BEFORE_SEEK: usize = 3;
        let mut ok = self.next();
        let mut j = 1;
        while ok && self.user_key_cmp(succ_key) == Ordering::Less {
            if j >= NEXTS_BEFORE_SEEK {
                return self.seek_ge(succ_key);
            }
            ok = self.next();
            j += 1;
        }
        ok
    }

    /// `next_prefix` for blocks with value prefixes: SETs flagged as sharing the
    /// previous key's prefix are skipped without assembling their keys, and runs of
    /// such restart intervals are skipped through the restart flags.
    fn next_prefix_v3(&mut self, succ_key: &[u8]) -> bool {
        const NEXT_CMP_THRESHOLD_BEFORE_SEEK: usize = 3;
        const NEXT_FAST_THRESHOLD_BEFORE_RESTARTS: usize = 16;

        if self.err.is_some() {
            return false;
        }
        if !self.cached_buf.is_empty() {
            self.sync_full_key();
            self.clear_cache();
        }
        let mut next_cmp_count = 0;
        let mut next_fast_count = 0;
        let mut used_restarts = false;
        let mut prev_key_is_set = trailer_kind(self.trailer) == InternalKeyKind::Set;
        loop {
            self.offset = self.next_offset as isize;
            if !self.valid() {
                return false;
            }
            let offset = self.offset as usize;
            let data = &self.handle[..self.restarts];
            let Some(e) = decode_entry(data, offset) else {
                return self.corrupt(format!("invalid block entry at offset {offset}"));
            };
            if e.key.len() < TRAILER_LEN {
                return self.corrupt(format!("key at offset {offset} shorter than its trailer"));
            }
            let kind = InternalKeyKind::from_u8(data[e.key.end - TRAILER_LEN] & !OBSOLETE_BIT);
            let value_prefix = data.get(e.key.end..e.value_end).and_then(|v| v.first().copied());
            self.next_offset = e.value_end;

            let mut prefix_changed = false;
            if kind == InternalKeyKind::Set {
                let Some(value_prefix) = value_prefix else {
                    return self.corrupt(format!("SET at offset {offset} lacks a value prefix"));
                };
                if set_has_same_prefix(value_prefix) {
                    next_fast_count += 1;
                    if next_fast_count > NEXT_FAST_THRESHOLD_BEFORE_RESTARTS {
                        if used_restarts {
                            break;
                        }
                        let mut index = self.search_restarts_by_offset(offset);
                        used_restarts = true;
                        next_fast_count = 0;
                        if index == self.num_restarts {
                            continue;
                        }
                        let starting_index = index;
                        while index != self.num_restarts && self.restart_has_same_prefix(index) {
                            index += 1;
                        }
                        if index != starting_index {
                            // Everything up to and including the entry at restart
                            // index-1 shares the prefix; resume after it.
                            self.offset = self.restart_offset(index - 1) as isize;
                            if !self.read_entry() {
                                return false;
                            }
                        }
                    }
                    continue;
                } else if prev_key_is_set {
                    prefix_changed = true;
                }
            } else {
                prev_key_is_set = false;
            }

            // Slow path: assemble the key.
            if e.shared > self.full_key.len() {
                return self.corrupt(format!("shared prefix of entry at offset {offset} exceeds previous key"));
            }
            self.full_key.truncate(e.shared);
            self.full_key.extend_from_slice(&self.handle[e.key.clone()]);
            self.key_src = if e.shared == 0 { KeySource::Block(e.key.start, e.key.end) } else { KeySource::FullKey };
            self.val = e.key.end..e.value_end;
            let hidden = self.decode_key();
            next_cmp_count += 1;
            if prefix_changed || self.user_key_cmp(succ_key) != Ordering::Less {
                if hidden {
                    return self.next();
                }
                return true;
            }
            if next_cmp_count >= NEXT_CMP_THRESHOLD_BEFORE_SEEK {
                break;
            }
        }
        self.seek_ge(succ_key)
    }

    /// Moves to the previous entry.
    pub fn prev(&mut self) -> bool {
        if self.err.is_some() {
            return false;
        }
        loop {
            while let Some(e) = self.cached.pop() {
                self.next_offset = self.offset.max(0) as usize;
                self.offset = e.offset;
                self.val = e.value;
                self.key_src = KeySource::Cached(e.key.start, e.key.end);
                if !self.decode_key() {
                    return true;
                }
            }

            self.clear_cache();
            if self.offset <= 0 {
                self.offset = -1;
                self.next_offset = 0;
                return false;
            }

            let target = self.offset as usize;
            let index = self.search_restarts_by_offset(target);
            let start = if index > 0 { self.restart_offset(index - 1) } else { 0 };
            if start >= target {
                return self.corrupt(format!("restart point {} out of order at offset {}", index - 1, start));
            }
            self.offset = start as isize;
            if !self.read_entry() {
                return false;
            }
            while self.next_offset < target {
                self.cache_entry();
                self.offset = self.next_offset as isize;
                if !self.read_entry() {
                    return false;
                }
            }
            if !self.decode_key() {
                return true;
            }
        }
    }

    /// The current key, or `None` when unpositioned.
    pub fn key(&self) -> Option<InternalKeyRef<'_>> {
        if !self.valid() {
            return None;
        }
        Some(InternalKeyRef {
            user_key: &self.current_key_bytes()[..self.user_key_len],
            trailer: self.trailer,
        })
    }

    /// Stored value bytes of the current entry, value prefix included.
    pub fn value(&self) -> &[u8] {
        if !self.valid() {
            return &[];
        }
        &self.handle[self.val.clone()]
    }

    /// The current value, interpreting the value prefix.
    ///
    /// Values stored out of line resolve through `vbr`; without one the stored
    /// handle bytes are returned in place.
    pub fn lazy_value<'a>(&'a self, vbr: Option<&'a ValueBlockReader>) -> LazyValue<'a> {
        let val = self.value();
        if !self.has_value_prefix || trailer_kind(self.trailer) != InternalKeyKind::Set {
            return LazyValue::in_place(val);
        }
        match (vbr, val.first()) {
            (Some(vbr), Some(&prefix)) if is_value_handle(prefix) => vbr.lazy_value_for_handle(val),
            _ => LazyValue::in_place(val.get(1..).unwrap_or_default()),
        }
    }

    /// The current user key as `Bytes`, zero-copy when the key lies whole in a
    /// shared block. Blocks written with a restart interval of one always qualify.
    pub fn user_key_bytes(&self) -> Bytes {
        match self.key_src {
            KeySource::Block(s, _) if self.handle.bytes().is_some() => self.handle.slice(s..s + self.user_key_len),
            _ => Bytes::copy_from_slice(&self.current_key_bytes()[..self.user_key_len]),
        }
    }

    /// The current stored value as `Bytes`, zero-copy for shared blocks.
    pub fn value_bytes(&self) -> Bytes {
        if !self.valid() {
            return Bytes::new();
        }
        self.handle.slice(self.val.clone())
    }

    /// Offset of the current entry, for diagnostics.
    pub fn entry_offset(&self) -> isize {
        self.offset
    }

    /// Offset just past the current entry.
    pub fn next_entry_offset(&self) -> usize {
        self.next_offset
    }

    /// True when positioned on an entry.
    pub fn is_valid(&self) -> bool {
        self.valid()
    }
}

/// Forward iterator over a block with raw (non-internal) keys.
#[derive(Debug)]
pub struct RawBlockIter<'a> {
    data: &'a [u8],
    offset: usize,
    key: Vec<u8>,
    failed: bool,
}

impl<'a> RawBlockIter<'a> {
    /// Creates an iterator over `block`.
    pub fn new(block: &'a [u8]) -> Result<Self> {
        let (restarts, _) = decode_restart_array(block)?;
        Ok(Self { data: &block[..restarts], offset: 0, key: Vec::new(), failed: false })
    }
}

impl<'a> Iterator for RawBlockIter<'a> {
    type Item = Result<(Vec<u8>, &'a [u8])>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.offset >= self.data.len() {
            return None;
        }
        let entry = decode_entry(self.data, self.offset).filter(|e| e.shared <= self.key.len());
        let Some(e) = entry else {
            self.failed = true;
            return Some(Err(Error::corruption(format!("invalid block entry at offset {}", self.offset))));
        };
        self.key.truncate(e.shared);
        self.key.extend_from_slice(&self.data[e.key.clone()]);
        self.offset = e.value_end;
        Some(Ok((self.key.clone(), &self.data[e.key.end..e.value_end])))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comparer::{BytewiseComparer, SuffixedKeyComparer};
    use crate::sstable::internal_key::{make_trailer, InternalKey};
    use crate::sstable::value_block::{make_prefix_for_in_place_value, VALUE_KIND_MASK};
    use proptest::prelude::*;

    fn ikey(k: &[u8], seq: u64) -> InternalKey {
        InternalKey::new(k.to_vec(), seq, InternalKeyKind::Set)
    }

    fn build(entries: &[(&[u8], &[u8])], restart_interval: usize) -> Vec<u8> {
        let mut w = BlockWriter::new(restart_interval);
        for (k, v) in entries {
            w.add(ikey(k, 1).as_ref(), v);
        }
        w.finish()
    }

    fn iter(block: Vec<u8>) -> BlockIter {
        BlockIter::new(Arc::new(BytewiseComparer), Bytes::from(block), 0, false).unwrap()
    }

    fn current(it: &BlockIter) -> (Vec<u8>, Vec<u8>) {
        (it.key().unwrap().user_key.to_vec(), it.value().to_vec())
    }

    fn abcd() -> Vec<u8> {
        build(&[(b"a", b"1"), (b"b", b"2"), (b"c", b"3"), (b"d", b"4")], 2)
    }

    #[test]
    fn test_abcd_scenario() {
        let mut it = iter(abcd());

        assert!(it.seek_ge(b"bb"));
        assert_eq!(current(&it), (b"c".to_vec(), b"3".to_vec()));

        assert!(it.seek_lt(b"c"));
        assert_eq!(current(&it), (b"b".to_vec(), b"2".to_vec()));

        assert!(it.last());
        assert_eq!(current(&it), (b"d".to_vec(), b"4".to_vec()));

        assert!(it.first());
        assert_eq!(current(&it), (b"a".to_vec(), b"1".to_vec()));
        assert_eq!(it.first_user_key(), Some(&b"a"[..]));
    }

    #[test]
    fn test_forward_and_backward() {
        let mut it = iter(abcd());
        let mut forward = Vec::new();
        let mut ok = it.first();
        while ok {
            forward.push(current(&it).0);
            ok = it.next();
        }
        assert_eq!(forward, vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec(), b"d".to_vec()]);

        let mut backward = Vec::new();
        let mut ok = it.last();
        while ok {
            backward.push(current(&it).0);
            ok = it.prev();
        }
        assert_eq!(backward, vec![b"d".to_vec(), b"c".to_vec(), b"b".to_vec(), b"a".to_vec()]);

        // Change direction in the middle.
        assert!(it.seek_ge(b"c"));
        assert!(it.prev());
        assert_eq!(current(&it).0, b"b");
        assert!(it.next());
        assert_eq!(current(&it).0, b"c");
        assert!(it.next());
        assert_eq!(current(&it).0, b"d");
        assert!(!it.next());
        assert!(it.key().is_none());
    }

    #[test]
    fn test_seek_out_of_range() {
        let mut it = iter(abcd());
        assert!(!it.seek_ge(b"e"));
        assert!(!it.seek_lt(b"a"));
        assert!(it.next());
        assert_eq!(current(&it).0, b"a");
    }

    #[test]
    fn test_empty_block() {
        let mut w = BlockWriter::new(16);
        assert_eq!(w.estimated_size(), EMPTY_BLOCK_SIZE);
        let block = w.finish();
        assert_eq!(block, vec![0, 0, 0, 0, 1, 0, 0, 0]);
        let mut it = iter(block);
        assert!(!it.first());
        assert!(!it.last());
        assert!(!it.seek_ge(b"a"));
        assert!(!it.seek_lt(b"a"));
        assert_eq!(it.first_user_key(), None);
    }

    #[test]
    fn test_no_restarts_is_corruption() {
        let err = BlockIter::new(Arc::new(BytewiseComparer), Bytes::from(vec![0u8; 4]), 0, false).unwrap_err();
        assert!(err.is_corruption());
        assert!(BlockIter::new(Arc::new(BytewiseComparer), Bytes::from(vec![1u8]), 0, false).is_err());
    }

    #[test]
    fn test_truncated_entry_sets_error() {
        let mut block = abcd();
        // Entry "b" starts at offset 13; claim an unshared length running past the
        // entries.
        block[14] = 0x7f;
        let mut it = iter(block);
        assert!(it.first());
        assert!(!it.next());
        assert!(it.error().map_or(false, |e| e.is_corruption()));
        assert!(it.key().is_none());
        // The error is sticky.
        assert!(!it.first());
        assert!(!it.seek_ge(b"a"));

        let mut block = abcd();
        block[0] = 1; // the first key claims a shared prefix
        let err = BlockIter::new(Arc::new(BytewiseComparer), Bytes::from(block), 0, false).unwrap_err();
        assert!(err.is_corruption());
    }

    #[test]
    fn test_restart_interval_one_keys_are_zero_copy() {
        let block = Bytes::from(build(&[(b"aa", b"x"), (b"ab", b"y")], 1));
        let mut it = BlockIter::new(Arc::new(BytewiseComparer), block.clone(), 0, false).unwrap();
        assert!(it.last());
        let k = it.user_key_bytes();
        assert_eq!(&k[..], b"ab");
        let base = block.as_ptr() as usize;
        let p = k.as_ptr() as usize;
        assert!(p >= base && p < base + block.len());
    }

    #[test]
    fn test_global_seq_num_override() {
        let mut w = BlockWriter::new(4);
        w.add(InternalKey::new(b"a".to_vec(), 0, InternalKeyKind::Delete).as_ref(), b"");
        w.add(InternalKey::new(b"b".to_vec(), 0, InternalKeyKind::Set).as_ref(), b"v");
        let mut it = BlockIter::new(Arc::new(BytewiseComparer), Bytes::from(w.finish()), 42, false).unwrap();
        assert!(it.first());
        let k = it.key().unwrap();
        assert_eq!((k.seq_num(), k.kind()), (42, InternalKeyKind::Delete));
        assert!(it.next());
        let k = it.key().unwrap();
        assert_eq!((k.seq_num(), k.kind()), (42, InternalKeyKind::Set));
    }

    #[test]
    fn test_hide_obsolete_points() {
        let mut w = BlockWriter::new(2);
        let keys: [(&[u8], u64, bool); 5] =
            [(b"a", 5, false), (b"a", 3, true), (b"b", 4, true), (b"c", 2, false), (b"d", 1, true)];
        for (k, seq, obsolete) in keys {
            w.add_entry(ikey(k, seq).as_ref(), b"v", EntryOptions { is_obsolete: obsolete, ..Default::default() });
        }
        let block = Bytes::from(w.finish());

        let mut visible = BlockIter::new(Arc::new(BytewiseComparer), block.clone(), 0, true).unwrap();
        let mut seen = Vec::new();
        let mut ok = visible.first();
        while ok {
            let k = visible.key().unwrap();
            seen.push((k.user_key.to_vec(), k.seq_num()));
            ok = visible.next();
        }
        assert_eq!(seen, vec![(b"a".to_vec(), 5), (b"c".to_vec(), 2)]);
        assert!(visible.last());
        assert_eq!(visible.key().unwrap().user_key, b"c");
        assert!(visible.seek_ge(b"b"));
        assert_eq!(visible.key().unwrap().user_key, b"c");
        assert!(visible.seek_lt(b"d"));
        assert_eq!(visible.key().unwrap().user_key, b"c");
        assert!(visible.prev());
        assert_eq!(visible.key().unwrap().user_key, b"a");

        // Without hiding, all five come back and the bit is stripped.
        let mut all = BlockIter::new(Arc::new(BytewiseComparer), block, 0, false).unwrap();
        let mut n = 0;
        let mut ok = all.first();
        while ok {
            assert_eq!(all.key().unwrap().trailer & u64::from(OBSOLETE_BIT), 0);
            n += 1;
            ok = all.next();
        }
        assert_eq!(n, 5);
    }

    #[test]
    fn test_restart_offsets_have_zero_shared() {
        let keys: Vec<Vec<u8>> = (0..40u32).map(|i| format!("key{:04}", i).into_bytes()).collect();
        let mut w = BlockWriter::new(3);
        for k in &keys {
            w.add(ikey(k, 1).as_ref(), b"v");
        }
        let it = iter(w.finish());
        assert_eq!(it.num_restarts, 14);
        for i in 0..it.num_restarts {
            let k = it.restart_user_key(i).unwrap();
            assert_eq!(k, &keys[i * 3][..]);
        }
    }

    #[test]
    fn test_raw_block_iter() {
        let mut w = BlockWriter::new(16);
        w.add_raw(b"rocksdb.num.entries", b"\x05");
        w.add_raw(b"rocksdb.raw.key.size", b"\x0a");
        let block = w.finish();
        let entries: Vec<(Vec<u8>, Vec<u8>)> =
            RawBlockIter::new(&block).unwrap().map(|r| r.map(|(k, v)| (k, v.to_vec()))).collect::<Result<_>>().unwrap();
        assert_eq!(
            entries,
            vec![
                (b"rocksdb.num.entries".to_vec(), b"\x05".to_vec()),
                (b"rocksdb.raw.key.size".to_vec(), b"\x0a".to_vec()),
            ]
        );
    }

    #[test]
    fn test_lazy_value_strips_prefix() {
        let mut w = BlockWriter::new(16);
        let prefix = make_prefix_for_in_place_value(false);
        w.add_entry(ikey(b"a", 1).as_ref(), b"val", EntryOptions { value_prefix: Some(prefix), ..Default::default() });
        w.add(InternalKey::new(b"b".to_vec(), 1, InternalKeyKind::Delete).as_ref(), b"");
        let mut it = iter(w.finish());
        it.set_has_value_prefix(true);
        assert!(it.first());
        assert_eq!(it.value()[0] & VALUE_KIND_MASK, 0);
        assert_eq!(it.lazy_value(None).value().unwrap().as_ref(), b"val");
        assert!(it.next());
        assert_eq!(it.lazy_value(None).len(), 0);
    }

    /// Builds a block of versioned keys `prefix@suffix` with value prefixes, the
    /// way tables with value blocks lay them out.
    fn build_versioned(keys: &[(Vec<u8>, InternalKeyKind)], restart_interval: usize) -> Vec<u8> {
        let cmp = SuffixedKeyComparer::default();
        let mut w = BlockWriter::new(restart_interval);
        let mut prev_prefix: Option<Vec<u8>> = None;
        for (i, (k, kind)) in keys.iter().enumerate() {
            let prefix = &k[..cmp.split(k)];
            let same = prev_prefix.as_deref() == Some(prefix);
            let key = InternalKey::new(k.clone(), 1000 - i as u64, *kind);
            let max_shared = prev_prefix.as_ref().map(|p| p.len()).unwrap_or(0);
            if *kind == InternalKeyKind::Set {
                w.add_entry(
                    key.as_ref(),
                    format!("v{i}").as_bytes(),
                    EntryOptions {
                        max_shared_key_len: Some(max_shared),
                        value_prefix: Some(make_prefix_for_in_place_value(same)),
                        set_has_same_key_prefix: same,
                        ..Default::default()
                    },
                );
            } else {
                w.add_entry(
                    key.as_ref(),
                    b"",
                    EntryOptions { max_shared_key_len: Some(max_shared), ..Default::default() },
                );
            }
            prev_prefix = Some(prefix.to_vec());
        }
        w.finish()
    }

    fn versioned_keys(shape: &[(u8, usize, bool)]) -> Vec<(Vec<u8>, InternalKeyKind)> {
        let mut keys = Vec::new();
        for &(p, versions, with_delete) in shape {
            for v in 0..versions {
                let k = format!("{}@{:03}", p as char, 999 - v).into_bytes();
                let kind = if with_delete && v == 1 { InternalKeyKind::Delete } else { InternalKeyKind::Set };
                keys.push((k, kind));
            }
        }
        keys
    }

    fn check_next_prefix_equivalence(keys: &[(Vec<u8>, InternalKeyKind)], restart_interval: usize) {
        let cmp: Arc<dyn Comparer> = Arc::new(SuffixedKeyComparer::default());
        let block = Bytes::from(build_versioned(keys, restart_interval));
        for start in 0..keys.len() {
            let mut it = BlockIter::new(cmp.clone(), block.clone(), 0, false).unwrap();
            it.set_has_value_prefix(true);
            assert!(it.first());
            for _ in 0..start {
                assert!(it.next());
            }
            let cur = it.key().unwrap().user_key.to_vec();
            let mut succ = cur[..cmp.split(&cur)].to_vec();
            succ.push(0);

            let expected = keys[start..]
                .iter()
                .position(|(k, _)| cmp.compare(k, &succ) != Ordering::Less)
                .map(|p| keys[start + p].0.clone());

            let got = if it.next_prefix(&succ) { Some(it.key().unwrap().user_key.to_vec()) } else { None };
            assert_eq!(got, expected, "start {start}");
            if let Some(k) = got {
                let i = keys.iter().position(|(x, _)| *x == k).unwrap();
                assert_eq!(it.lazy_value(None).value().unwrap().as_ref(), format!("v{i}").as_bytes());
                // Forward iteration resumes correctly after the skip.
                if it.next() {
                    assert_eq!(it.key().unwrap().user_key, &keys[i + 1].0[..]);
                }
            }
        }
    }

    #[test]
    fn test_next_prefix_v3_many_versions() {
        let keys = versioned_keys(&[(b'a', 3, false), (b'b', 40, false), (b'c', 2, true), (b'd', 25, true), (b'e', 1, false)]);
        for interval in [1, 2, 4, 16] {
            check_next_prefix_equivalence(&keys, interval);
        }
    }

    #[test]
    fn test_next_prefix_after_prev() {
        let keys = versioned_keys(&[(b'a', 5, false), (b'b', 5, false)]);
        let cmp: Arc<dyn Comparer> = Arc::new(SuffixedKeyComparer::default());
        let mut it = BlockIter::new(cmp, Bytes::from(build_versioned(&keys, 3)), 0, false).unwrap();
        it.set_has_value_prefix(true);
        assert!(it.seek_lt(b"b"));
        assert_eq!(it.key().unwrap().user_key, b"a@995");
        assert!(it.prev());
        assert!(it.next_prefix(b"a\x00"));
        assert_eq!(it.key().unwrap().user_key, b"b@999");
    }

    #[test]
    fn test_restart_same_prefix_flags() {
        let keys = versioned_keys(&[(b'a', 10, false)]);
        let it = iter(build_versioned(&keys, 2));
        assert!(!it.restart_has_same_prefix(0));
        // Restart 1 covers entries 1..=2, all SETs sharing the prefix.
        for i in 1..it.num_restarts {
            assert!(it.restart_has_same_prefix(i));
        }
    }

    proptest! {
        #[test]
        fn prop_round_trip(
            entries in prop::collection::btree_map(
                prop::collection::vec(b'a'..=b'e', 1..8),
                prop::collection::vec(any::<u8>(), 0..16),
                1..80,
            ),
            interval in 1usize..6,
        ) {
            let mut w = BlockWriter::new(interval);
            for (k, v) in &entries {
                w.add(ikey(k, 7).as_ref(), v);
            }
            let mut it = iter(w.finish());
            let mut got = Vec::new();
            let mut ok = it.first();
            while ok {
                let k = it.key().unwrap();
                prop_assert_eq!(k.trailer, make_trailer(7, InternalKeyKind::Set));
                got.push((k.user_key.to_vec(), it.value().to_vec()));
                ok = it.next();
            }
            let want: Vec<_> = entries.into_iter().collect();
            prop_assert_eq!(got, want);
        }

        #[test]
        fn prop_seek_matches_model(
            keys in prop::collection::btree_set(prop::collection::vec(b'a'..=b'd', 0..5), 1..60),
            targets in prop::collection::vec(prop::collection::vec(b'a'..=b'e', 0..5), 1..20),
            interval in 1usize..5,
        ) {
            let keys: Vec<Vec<u8>> = keys.into_iter().collect();
            let mut w = BlockWriter::new(interval);
            for k in &keys {
                w.add(ikey(k, 1).as_ref(), k);
            }
            let mut it = iter(w.finish());
            for t in &targets {
                let ge = keys.iter().find(|k| k.as_slice() >= t.as_slice());
                let got = if it.seek_ge(t) { Some(it.key().unwrap().user_key.to_vec()) } else { None };
                prop_assert_eq!(got.as_ref(), ge);

                let lt = keys.iter().rev().find(|k| k.as_slice() < t.as_slice());
                let got = if it.seek_lt(t) { Some(it.key().unwrap().user_key.to_vec()) } else { None };
                prop_assert_eq!(got.as_ref(), lt);
                if got.is_some() {
                    prop_assert_eq!(it.value(), got.as_deref().unwrap());
                }
            }
        }

        #[test]
        fn prop_next_prefix_matches_next(
            shape in prop::collection::vec((1usize..24, any::<bool>()), 1..6),
            interval in 1usize..6,
        ) {
            let shape: Vec<(u8, usize, bool)> =
                shape.into_iter().enumerate().map(|(i, (n, d))| (b'a' + i as u8, n, d)).collect();
            check_next_prefix_equivalence(&versioned_keys(&shape), interval);
        }
    }
}
