//! Table reader.
//!
//! Opening a table reads the footer, the metaindex and the properties block.
//! Every other block is loaded on demand through [`ReaderInner::read_block`],
//! which verifies the block checksum and decompresses before anything looks at
//! the contents.

use crate::cache::{BlockCache, BufferHandle, BufferPool, CacheKey};
use crate::comparer::Comparer;
use crate::config::{IterOptions, ReaderOptions, TableFormat};
use crate::error::{Error, Result};
use crate::filter::block_property::{BlockPropertyFilter, ObsoleteKeyFilter};
use crate::filter::FilterPolicy;
use crate::sstable::block::{BlockIter, BlockWriter, RawBlockIter};
use crate::sstable::checksum::verify_block;
use crate::sstable::coding::little_endian_get;
use crate::sstable::compression::decompress_block;
use crate::sstable::footer::{BlockHandle, BlockHandleWithProperties, Footer};
use crate::sstable::fragment::{FragmentBlockIter, Fragmenter, Span, SpanBlockKind, SpanKey};
use crate::sstable::internal_key::{InternalKeyRef, SeqNum};
use crate::sstable::iter::{EmptyIter, InternalIterator, IterStats};
use crate::sstable::iter_single::{SingleLevelCompactionIter, SingleLevelIter};
use crate::sstable::iter_two_level::{TwoLevelCompactionIter, TwoLevelIter};
use crate::sstable::properties::{Properties, TWO_LEVEL_INDEX};
use crate::sstable::readable::{FileReadable, Readable};
use crate::sstable::value_block::{BlockProvider, ValueBlockReader, ValueBlocksIndexHandle};
use crate::sstable::{
    BLOCK_TRAILER_LEN, METAINDEX_FILTER_PREFIX, METAINDEX_PROPERTIES, METAINDEX_RANGE_DEL, METAINDEX_RANGE_DEL_V2,
    METAINDEX_RANGE_KEY, METAINDEX_VALUE_INDEX,
};
use bytes::Bytes;
use log::{debug, info, trace, warn};
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

/// Rewrites a decoded block before it is cached.
type BlockTransform = fn(&Arc<dyn Comparer>, &[u8]) -> Result<Vec<u8>>;

/// State shared by a [`Reader`] and every iterator it creates.
pub(crate) struct ReaderInner {
    readable: Arc<dyn Readable>,
    cache: Arc<BlockCache>,
    cache_id: u64,
    file_num: u64,
    footer: Footer,
    comparer: Arc<dyn Comparer>,
    properties: Properties,
    properties_bh: BlockHandle,
    filter: Option<(BlockHandle, Arc<dyn FilterPolicy>)>,
    range_del_bh: Option<BlockHandle>,
    range_del_transform: Option<BlockTransform>,
    range_key_bh: Option<BlockHandle>,
    value_bih: Option<ValueBlocksIndexHandle>,
    closed: AtomicBool,
}

impl fmt::Debug for ReaderInner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReaderInner")
            .field("file_num", &self.file_num)
            .field("cache_id", &self.cache_id)
            .field("format", &self.footer.format)
            .field("comparer", &self.comparer.name())
            .field("filter", &self.filter.as_ref().map(|(bh, p)| (*bh, p.name().to_string())))
            .field("range_del_bh", &self.range_del_bh)
            .field("range_key_bh", &self.range_key_bh)
            .field("value_bih", &self.value_bih)
            .finish_non_exhaustive()
    }
}

impl ReaderInner {
    pub(crate) fn file_num(&self) -> u64 {
        self.file_num
    }

    pub(crate) fn check_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::ReaderClosed);
        }
        Ok(())
    }

    pub(crate) fn comparer(&self) -> &Arc<dyn Comparer> {
        &self.comparer
    }

    pub(crate) fn properties(&self) -> &Properties {
        &self.properties
    }

    pub(crate) fn global_seq_num(&self) -> u64 {
        self.properties.global_seq_num
    }

    /// True if SET values in data blocks carry a value prefix byte.
    pub(crate) fn has_value_prefix(&self) -> bool {
        self.footer.format >= TableFormat::Pebblev3
    }

    /// A reader for the table's value blocks, if it has any.
    pub(crate) fn value_block_reader(
        self: &Arc<Self>,
        stats: Option<Arc<IterStats>>,
    ) -> Result<Option<ValueBlockReader>> {
        self.check_open()?;
        Ok(self.value_bih.map(|vbih| {
            let provider: Arc<dyn BlockProvider> = Arc::clone(self) as Arc<dyn BlockProvider>;
            ValueBlockReader::new(provider, vbih, stats)
        }))
    }

    pub(crate) fn has_table_filter(&self) -> bool {
        self.filter.is_some()
    }

    /// Consults the table filter. Without one every prefix may be present.
    pub(crate) fn table_filter_may_contain(&self, prefix: &[u8], stats: Option<&IterStats>) -> Result<bool> {
        let Some((bh, policy)) = &self.filter else {
            return Ok(true);
        };
        let block = self.read_block(*bh, stats, None)?;
        Ok(policy.may_contain(&block, prefix))
    }

    /// Loads the index block, or the top-level index of a two-level table.
    pub(crate) fn read_index(&self, stats: Option<&IterStats>) -> Result<BufferHandle> {
        self.read_block(self.footer.index_bh, stats, None)
    }

    /// Loads a block. With a pool the block is read into a pooled buffer and
    /// bypasses the cache; otherwise it is looked up in and published to the
    /// cache.
    pub(crate) fn read_block(
        &self,
        bh: BlockHandle,
        stats: Option<&IterStats>,
        pool: Option<&Arc<BufferPool>>,
    ) -> Result<BufferHandle> {
        self.read_block_with_transform(bh, None, stats, pool)
    }

    fn read_block_with_transform(
        &self,
        bh: BlockHandle,
        transform: Option<BlockTransform>,
        stats: Option<&IterStats>,
        pool: Option<&Arc<BufferPool>>,
    ) -> Result<BufferHandle> {
        self.check_open()?;
        let key = CacheKey::new(self.cache_id, self.file_num, bh.offset);
        if let Some(block) = self.cache.get(&key) {
            trace!("block {} of file {} found in cache", bh, self.file_num);
            if let Some(stats) = stats {
                stats.record_block(bh.length, true);
            }
            return Ok(BufferHandle::Shared(block));
        }

        let len = self.physical_len(bh)?;
        let handle = match pool {
            Some(pool) => {
                let mut buf = pool.alloc(len);
                self.readable.read_at(&mut buf, bh.offset)?;
                match self.decode_physical(bh, &buf, transform)? {
                    Some(decoded) => BufferHandle::from(decoded),
                    None => {
                        buf.truncate(len - BLOCK_TRAILER_LEN);
                        BufferHandle::Pooled(buf)
                    }
                }
            }
            None => {
                let mut buf = vec![0u8; len];
                self.readable.read_at(&mut buf, bh.offset)?;
                let block = match self.decode_physical(bh, &buf, transform)? {
                    Some(decoded) => Bytes::from(decoded),
                    None => {
                        buf.truncate(len - BLOCK_TRAILER_LEN);
                        Bytes::from(buf)
                    }
                };
                self.cache.insert(key, block.clone());
                BufferHandle::Shared(block)
            }
        };
        debug!("read block {} of file {} ({} bytes decoded)", bh, self.file_num, handle.len());
        if let Some(stats) = stats {
            stats.record_block(bh.length, false);
        }
        Ok(handle)
    }

    /// Length of the block with its trailer, checked against the file size.
    fn physical_len(&self, bh: BlockHandle) -> Result<usize> {
        let len = bh
            .length
            .checked_add(BLOCK_TRAILER_LEN as u64)
            .filter(|&n| bh.offset.checked_add(n).is_some_and(|end| end <= self.readable.size()))
            .ok_or_else(|| {
                Error::corruption(format!(
                    "block {} of file {} extends past the end of the file ({} bytes)",
                    bh,
                    self.file_num,
                    self.readable.size()
                ))
            })?;
        usize::try_from(len)
            .map_err(|_| Error::corruption(format!("block {} of file {} is too large", bh, self.file_num)))
    }

    /// Verifies the trailer of `physical` and decodes the block. `None` means the
    /// block is stored raw and untransformed, so `physical` minus its trailer is
    /// the block.
    fn decode_physical(
        &self,
        bh: BlockHandle,
        physical: &[u8],
        transform: Option<BlockTransform>,
    ) -> Result<Option<Vec<u8>>> {
        verify_block(self.footer.checksum, physical, self.file_num, bh.offset)?;
        let n = physical.len() - BLOCK_TRAILER_LEN;
        let decompressed = decompress_block(physical[n], &physical[..n])?;
        match transform {
            Some(transform) => {
                let data = decompressed.as_deref().unwrap_or(&physical[..n]);
                Ok(Some(transform(&self.comparer, data)?))
            }
            None => Ok(decompressed),
        }
    }

    /// Reads a block straight from the file, ignoring the cache.
    fn verify_block_at(&self, bh: BlockHandle) -> Result<()> {
        let mut buf = vec![0u8; self.physical_len(bh)?];
        self.readable.read_at(&mut buf, bh.offset)?;
        self.decode_physical(bh, &buf, None)?;
        Ok(())
    }

    fn read_metaindex(&mut self, opts: &ReaderOptions, pool: &Arc<BufferPool>) -> Result<()> {
        let bh = self.footer.metaindex_bh;
        let block = self.read_block(bh, None, Some(pool))?;
        if block.len() as u64 != bh.length {
            return Err(Error::corruption(format!(
                "invalid table (unexpected metaindex block size: {} vs {})",
                block.len(),
                bh.length
            )));
        }

        let mut meta = BTreeMap::new();
        for entry in RawBlockIter::new(&block)? {
            let (name, value) = entry?;
            if name == METAINDEX_VALUE_INDEX.as_bytes() {
                let vbih = ValueBlocksIndexHandle::decode(value)
                    .map_err(|_| Error::corruption("invalid table (bad value blocks index handle)"))?;
                self.value_bih = Some(vbih);
                continue;
            }
            match BlockHandle::decode(value) {
                Some((handle, n)) if n == value.len() => {
                    meta.insert(String::from_utf8_lossy(&name).into_owned(), handle);
                }
                _ => return Err(Error::corruption("invalid table (bad block handle)")),
            }
        }

        if let Some(&bh) = meta.get(METAINDEX_PROPERTIES) {
            let block = self.read_block(bh, None, Some(pool))?;
            self.properties = Properties::load(&block)?;
            self.properties_bh = bh;
        }

        if let Some(&bh) = meta.get(METAINDEX_RANGE_DEL_V2) {
            self.range_del_bh = Some(bh);
        } else if let Some(&bh) = meta.get(METAINDEX_RANGE_DEL) {
            self.range_del_bh = Some(bh);
            if !opts.raw_tombstones {
                warn!("file {} has a legacy range deletion block; fragmenting it on read", self.file_num);
                self.range_del_transform = Some(transform_range_del_v1);
            }
        }
        self.range_key_bh = meta.get(METAINDEX_RANGE_KEY).copied();

        for policy in &opts.filters {
            let name = format!("{}{}", METAINDEX_FILTER_PREFIX, policy.name());
            if let Some(&bh) = meta.get(&name) {
                self.filter = Some((bh, Arc::clone(policy)));
                break;
            }
        }
        Ok(())
    }

    fn resolve_comparer(&mut self, opts: &ReaderOptions) -> Result<()> {
        let name = &self.properties.comparer_name;
        if name.is_empty() || name == opts.comparer.name() {
            self.comparer = Arc::clone(&opts.comparer);
        } else if let Some(cmp) = opts.comparers.iter().find(|c| c.name() == name) {
            self.comparer = Arc::clone(cmp);
        } else {
            return Err(Error::UnknownComparer { file_num: self.file_num, name: name.clone() });
        }

        let merger = &self.properties.merger_name;
        let known = merger.is_empty()
            || merger == "nullptr"
            || *merger == opts.merger_name
            || opts.mergers.iter().any(|m| m == merger);
        if !known {
            return Err(Error::UnknownMerger { file_num: self.file_num, name: merger.clone() });
        }
        Ok(())
    }

    fn is_two_level(&self) -> bool {
        self.properties.index_type == TWO_LEVEL_INDEX || self.properties.index_partitions > 0
    }
}

impl BlockProvider for ReaderInner {
    fn read_block_for_vbr(&self, handle: BlockHandle, stats: Option<&IterStats>) -> Result<Bytes> {
        Ok(self.read_block(handle, stats, None)?.into_bytes())
    }
}

/// Fragments the tombstones of a legacy range deletion block, which may
/// overlap, and re-encodes them the way current tables store them.
fn transform_range_del_v1(cmp: &Arc<dyn Comparer>, block: &[u8]) -> Result<Vec<u8>> {
    let mut iter = BlockIter::new(Arc::clone(cmp), Bytes::copy_from_slice(block), 0, false)?;
    let mut spans = Vec::new();
    let mut valid = iter.first();
    while valid {
        if let Some(key) = iter.key() {
            spans.push(Span {
                start: Bytes::copy_from_slice(key.user_key),
                end: iter.value_bytes(),
                keys: vec![SpanKey::new(key.trailer)],
            });
        }
        valid = iter.next();
    }
    if let Some(e) = iter.error() {
        return Err(e.duplicate());
    }

    spans.sort_by(|a, b| cmp.compare(&a.start, &b.start));
    let mut fragmenter = Fragmenter::new(Arc::clone(cmp));
    for span in spans {
        if cmp.compare(&span.start, &span.end).is_lt() {
            fragmenter.add(span)?;
        }
    }
    let mut writer = BlockWriter::new(1);
    for span in fragmenter.finish() {
        for key in &span.keys {
            writer.add(InternalKeyRef { user_key: &span.start, trailer: key.trailer }, &span.end);
        }
    }
    Ok(writer.finish())
}

/// Parses the value index into the handles of the value blocks, in block order.
fn decode_value_block_handles(index: &[u8], vbih: &ValueBlocksIndexHandle) -> Result<Vec<BlockHandle>> {
    let entry_len = vbih.entry_len();
    if entry_len == 0 {
        return Err(Error::corruption("invalid table (value index entries have no width)"));
    }
    let wn = usize::from(vbih.block_num_byte_len);
    let wo = usize::from(vbih.block_offset_byte_len);
    let wl = usize::from(vbih.block_length_byte_len);
    let mut handles = Vec::with_capacity(index.len() / entry_len);
    for (i, entry) in index.chunks(entry_len).enumerate() {
        if entry.len() < entry_len {
            return Err(Error::corruption(format!(
                "invalid table (partial value index entry of {} bytes)",
                entry.len()
            )));
        }
        let block_num = little_endian_get(entry, wn);
        if block_num != i as u64 {
            return Err(Error::corruption(format!(
                "invalid table (expected value block num {i} but found {block_num})"
            )));
        }
        let offset = little_endian_get(&entry[wn..], wo);
        let length = little_endian_get(&entry[wn + wo..], wl);
        handles.push(BlockHandle::new(offset, length));
    }
    Ok(handles)
}

/// An open table.
///
/// Cloning a reader is not supported; share it behind an `Arc`. Iterators keep
/// the table's state alive on their own, so a reader may be dropped while its
/// iterators are still in use. Closing it makes every later read fail.
///
/// ```
/// use lsmtable::config::{IterOptions, ReaderOptions, WriterOptions};
/// use lsmtable::sstable::{InternalIterator, MemReadable, Reader, Writer};
/// use std::sync::Arc;
///
/// let mut buf = Vec::new();
/// let mut w = Writer::new(&mut buf, WriterOptions::default()).unwrap();
/// w.set(b"apple", b"red").unwrap();
/// w.set(b"banana", b"yellow").unwrap();
/// w.finish().unwrap();
///
/// let reader = Reader::open(Arc::new(MemReadable::new(buf)), ReaderOptions::default()).unwrap();
/// let mut it = reader.new_iter(IterOptions::default()).unwrap();
/// assert!(it.seek_ge(b"b", Default::default()));
/// assert_eq!(it.key().unwrap().user_key, b"banana");
/// ```
pub struct Reader {
    inner: Arc<ReaderInner>,
}

impl fmt::Debug for Reader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.inner, f)
    }
}

impl Reader {
    /// Opens the table stored in `readable`.
    pub fn open(readable: Arc<dyn Readable>, opts: ReaderOptions) -> Result<Self> {
        let footer = Footer::read(readable.as_ref())?;
        let cache = opts.cache.clone().unwrap_or_else(|| Arc::new(BlockCache::new(0)));
        let cache_id = if opts.cache_id == 0 { cache.new_id() } else { opts.cache_id };
        let mut inner = ReaderInner {
            readable,
            cache,
            cache_id,
            file_num: opts.file_num,
            footer,
            comparer: Arc::clone(&opts.comparer),
            properties: Properties::default(),
            properties_bh: BlockHandle::default(),
            filter: None,
            range_del_bh: None,
            range_del_transform: None,
            range_key_bh: None,
            value_bih: None,
            closed: AtomicBool::new(false),
        };
        // Structural blocks are needed once; keep them out of the shared cache.
        let pool = BufferPool::new(4);
        inner.read_metaindex(&opts, &pool)?;
        inner.resolve_comparer(&opts)?;
        info!(
            "opened table {} {}: {} entries in {} data blocks{}",
            inner.file_num,
            inner.footer.format,
            inner.properties.num_entries,
            inner.properties.num_data_blocks,
            if inner.is_two_level() { ", two-level index" } else { "" }
        );
        Ok(Self { inner: Arc::new(inner) })
    }

    /// Opens the table file at `path`.
    pub fn open_path(path: impl AsRef<Path>, opts: ReaderOptions) -> Result<Self> {
        let readable = FileReadable::open(path)?;
        Self::open(Arc::new(readable), opts)
    }

    /// The table's properties.
    pub fn properties(&self) -> &Properties {
        &self.inner.properties
    }

    /// The table's format.
    pub fn table_format(&self) -> TableFormat {
        self.inner.footer.format
    }

    /// The table's file number.
    pub fn file_num(&self) -> u64 {
        self.inner.file_num
    }

    /// The comparer the table is read with.
    pub fn comparer(&self) -> &Arc<dyn Comparer> {
        &self.inner.comparer
    }

    /// Closes the reader. Reads through it or its iterators fail afterwards;
    /// closing twice is an error.
    pub fn close(&self) -> Result<()> {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return Err(Error::ReaderClosed);
        }
        debug!("closed reader for file {}", self.inner.file_num);
        Ok(())
    }

    /// Decides whether iterators reading at `snapshot` may hide obsolete points
    /// of a table whose largest sequence number is `file_largest_seq_num`. When
    /// they may, the filter skipping fully obsolete blocks is appended to
    /// `filters`.
    pub fn try_add_block_property_filter_for_hide_obsolete_points(
        &self,
        snapshot: SeqNum,
        file_largest_seq_num: SeqNum,
        filters: &mut Vec<Arc<dyn BlockPropertyFilter>>,
    ) -> bool {
        let hide = self.inner.footer.format >= TableFormat::Pebblev4 && snapshot > file_largest_seq_num;
        if hide {
            filters.push(Arc::new(ObsoleteKeyFilter));
        }
        hide
    }

    /// Creates a point-key iterator.
    ///
    /// When `opts` carries block-property filters that exclude the whole table,
    /// the iterator is empty and reports `maybe_filtered_keys`.
    pub fn new_iter(&self, mut opts: IterOptions) -> Result<Box<dyn InternalIterator>> {
        self.inner.check_open()?;
        if let Some(filterer) = opts.filterer.take() {
            match filterer.intersects_user_props_and_finish_init(&self.inner.properties.user_properties)? {
                Some(bound) => opts.filterer = Some(bound),
                None => {
                    debug!("table {} excluded by block property filters", self.inner.file_num);
                    return Ok(Box::new(EmptyIter::new(true)));
                }
            }
        }
        if self.inner.is_two_level() {
            Ok(Box::new(TwoLevelIter::new(Arc::clone(&self.inner), opts)?))
        } else {
            Ok(Box::new(SingleLevelIter::new(Arc::clone(&self.inner), opts)?))
        }
    }

    /// Creates a forward-only iterator for compactions. It reads every key,
    /// including obsolete ones, and adds the bytes it advances over to
    /// `bytes_iterated`. With `pool`, data blocks bypass the cache.
    pub fn new_compaction_iter(
        &self,
        bytes_iterated: Arc<AtomicU64>,
        pool: Option<Arc<BufferPool>>,
    ) -> Result<Box<dyn InternalIterator>> {
        let opts = IterOptions { use_filter: false, buffer_pool: pool, ..IterOptions::default() };
        if self.inner.is_two_level() {
            let iter = TwoLevelIter::new(Arc::clone(&self.inner), opts)?;
            Ok(Box::new(TwoLevelCompactionIter::new(iter, bytes_iterated)))
        } else {
            let iter = SingleLevelIter::new(Arc::clone(&self.inner), opts)?;
            Ok(Box::new(SingleLevelCompactionIter::new(iter, bytes_iterated)))
        }
    }

    /// An iterator over the table's range deletions, or `None` if it has none.
    pub fn new_raw_range_del_iter(&self) -> Result<Option<FragmentBlockIter>> {
        match self.inner.range_del_bh {
            Some(bh) if bh.length > 0 => {
                let transform = self.inner.range_del_transform;
                self.new_fragment_iter(bh, transform, SpanBlockKind::RangeDel).map(Some)
            }
            _ => Ok(None),
        }
    }

    /// An iterator over the table's range keys, or `None` if it has none.
    pub fn new_raw_range_key_iter(&self) -> Result<Option<FragmentBlockIter>> {
        match self.inner.range_key_bh {
            Some(bh) if bh.length > 0 => self.new_fragment_iter(bh, None, SpanBlockKind::RangeKey).map(Some),
            _ => Ok(None),
        }
    }

    fn new_fragment_iter(
        &self,
        bh: BlockHandle,
        transform: Option<BlockTransform>,
        kind: SpanBlockKind,
    ) -> Result<FragmentBlockIter> {
        let block = self.inner.read_block_with_transform(bh, transform, None, None)?;
        let cmp = Arc::clone(&self.inner.comparer);
        let iter = BlockIter::new(Arc::clone(&cmp), block, self.inner.global_seq_num(), false)?;
        Ok(FragmentBlockIter::new(iter, cmp, kind))
    }

    /// An iterator over the data block at `bh`, as listed by [`layout`](Self::layout).
    pub(crate) fn data_block_iter(&self, bh: BlockHandle) -> Result<BlockIter> {
        self.inner.check_open()?;
        let block = self.inner.read_block(bh, None, None)?;
        let mut iter = BlockIter::new(Arc::clone(&self.inner.comparer), block, self.inner.global_seq_num(), false)?;
        iter.set_has_value_prefix(self.inner.has_value_prefix());
        Ok(iter)
    }

    /// Lists the location of every block in the table.
    pub fn layout(&self) -> Result<Layout> {
        let inner = &self.inner;
        inner.check_open()?;
        let mut layout = Layout {
            data: Vec::new(),
            index: Vec::new(),
            top_index: None,
            filter: inner.filter.as_ref().map(|(bh, _)| *bh),
            range_del: inner.range_del_bh,
            range_key: inner.range_key_bh,
            value_blocks: Vec::new(),
            value_index: inner.value_bih.map(|v| v.handle),
            properties: inner.properties_bh,
            metaindex: inner.footer.metaindex_bh,
            footer: inner.footer.footer_bh,
            format: inner.footer.format,
        };

        let cmp = Arc::clone(&inner.comparer);
        let mut index = BlockIter::new(Arc::clone(&cmp), inner.read_index(None)?, 0, false)?;
        if inner.is_two_level() {
            layout.top_index = Some(inner.footer.index_bh);
            let mut valid = index.first();
            while valid {
                let bh = BlockHandleWithProperties::decode(index.value())?.handle;
                layout.index.push(bh);
                let block = inner.read_block(bh, None, None)?;
                let mut sub = BlockIter::new(Arc::clone(&cmp), block, 0, false)?;
                collect_data_handles(&mut sub, &mut layout.data)?;
                valid = index.next();
            }
            if let Some(e) = index.error() {
                return Err(e.duplicate());
            }
        } else {
            layout.index.push(inner.footer.index_bh);
            collect_data_handles(&mut index, &mut layout.data)?;
        }

        if let Some(vbih) = &inner.value_bih {
            let block = inner.read_block(vbih.handle, None, None)?;
            layout.value_blocks = decode_value_block_handles(&block, vbih)?;
        }
        Ok(layout)
    }

    /// Reads every block of the table from the file, bypassing the cache, and
    /// verifies its checksum and compression.
    pub fn validate_block_checksums(&self) -> Result<()> {
        let layout = self.layout()?;
        let blocks = layout.blocks();
        for (name, bh) in &blocks {
            if *name == "footer" || bh.length == 0 {
                continue;
            }
            trace!("validating {} block {} of file {}", name, bh, self.inner.file_num);
            self.inner.verify_block_at(*bh)?;
        }
        debug!("validated {} blocks of file {}", blocks.len(), self.inner.file_num);
        Ok(())
    }

    /// Estimates the bytes of data blocks covering keys in `[start, end]`,
    /// including a proportional share of the value blocks.
    pub fn estimate_disk_usage(&self, start: &[u8], end: &[u8]) -> Result<u64> {
        let inner = &self.inner;
        inner.check_open()?;
        let cmp = Arc::clone(&inner.comparer);
        let index = inner.read_index(None)?;

        let (mut start_iter, mut end_iter) = if inner.is_two_level() {
            let mut top = BlockIter::new(Arc::clone(&cmp), index, 0, false)?;
            if !top.seek_ge(start) {
                // The range lies entirely after the table.
                return top.error().map_or(Ok(0), |e| Err(e.duplicate()));
            }
            let bh = BlockHandleWithProperties::decode(top.value())?.handle;
            let start_iter = BlockIter::new(Arc::clone(&cmp), inner.read_block(bh, None, None)?, 0, false)?;
            let end_iter = if top.seek_ge(end) {
                let bh = BlockHandleWithProperties::decode(top.value())?.handle;
                Some(BlockIter::new(Arc::clone(&cmp), inner.read_block(bh, None, None)?, 0, false)?)
            } else if let Some(e) = top.error() {
                return Err(e.duplicate());
            } else {
                None
            };
            (start_iter, end_iter)
        } else {
            (BlockIter::new(Arc::clone(&cmp), index, 0, false)?, None)
        };

        if !start_iter.seek_ge(start) {
            return start_iter.error().map_or(Ok(0), |e| Err(e.duplicate()));
        }
        let start_bh = BlockHandleWithProperties::decode(start_iter.value())?.handle;

        let data_size = inner.properties.data_size;
        let end_iter = match end_iter.as_mut() {
            Some(iter) => iter,
            None if inner.is_two_level() => {
                return Ok(self.include_value_blocks(data_size.saturating_sub(start_bh.offset)));
            }
            None => &mut start_iter,
        };
        if !end_iter.seek_ge(end) {
            if let Some(e) = end_iter.error() {
                return Err(e.duplicate());
            }
            // The range extends past the last data block.
            return Ok(self.include_value_blocks(data_size.saturating_sub(start_bh.offset)));
        }
        let end_bh = BlockHandleWithProperties::decode(end_iter.value())?.handle;
        Ok(self.include_value_blocks(end_bh.end_offset().saturating_sub(start_bh.offset)))
    }

    fn include_value_blocks(&self, data_bytes: u64) -> u64 {
        let props = &self.inner.properties;
        if props.value_blocks_size == 0 || props.data_size == 0 {
            return data_bytes;
        }
        data_bytes + (data_bytes as f64 / props.data_size as f64 * props.value_blocks_size as f64) as u64
    }
}

fn collect_data_handles(index: &mut BlockIter, out: &mut Vec<BlockHandleWithProperties>) -> Result<()> {
    let mut valid = index.first();
    while valid {
        out.push(BlockHandleWithProperties::decode(index.value())?);
        valid = index.next();
    }
    match index.error() {
        Some(e) => Err(e.duplicate()),
        None => Ok(()),
    }
}

/// The location of every block of a table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Layout {
    /// Data blocks with their block properties, in key order.
    pub data: Vec<BlockHandleWithProperties>,
    /// Index blocks. A single-level table has exactly one.
    pub index: Vec<BlockHandle>,
    /// Top-level index of a two-level table.
    pub top_index: Option<BlockHandle>,
    /// Table filter block.
    pub filter: Option<BlockHandle>,
    /// Range deletion block.
    pub range_del: Option<BlockHandle>,
    /// Range key block.
    pub range_key: Option<BlockHandle>,
    /// Value blocks, in block number order.
    pub value_blocks: Vec<BlockHandle>,
    /// Value index block.
    pub value_index: Option<BlockHandle>,
    /// Properties block.
    pub properties: BlockHandle,
    /// Metaindex block.
    pub metaindex: BlockHandle,
    /// The footer. Its length includes no trailer.
    pub footer: BlockHandle,
    /// Table format.
    pub format: TableFormat,
}

impl Layout {
    /// Every block with a short name, ordered by offset.
    pub fn blocks(&self) -> Vec<(&'static str, BlockHandle)> {
        let mut blocks: Vec<(&'static str, BlockHandle)> = self.data.iter().map(|d| ("data", d.handle)).collect();
        blocks.extend(self.index.iter().map(|&bh| ("index", bh)));
        let optional = [
            ("top-index", self.top_index),
            ("filter", self.filter),
            ("range-del", self.range_del),
            ("range-key", self.range_key),
            ("value-index", self.value_index),
        ];
        blocks.extend(optional.into_iter().filter_map(|(name, bh)| bh.map(|bh| (name, bh))));
        blocks.extend(self.value_blocks.iter().map(|&bh| ("value", bh)));
        blocks.push(("properties", self.properties));
        blocks.push(("metaindex", self.metaindex));
        blocks.push(("footer", self.footer));
        blocks.sort_by_key(|(_, bh)| bh.offset);
        blocks
    }
}

impl fmt::Display for Layout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "format {}", self.format)?;
        for (name, bh) in self.blocks() {
            writeln!(f, "{:>10}  {} ({})", bh.offset, name, bh.length)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comparer::{BytewiseComparer, SuffixedKeyComparer};
    use crate::config::{CompressionType, WriterOptions};
    use crate::filter::BloomFilterPolicy;
    use crate::sstable::internal_key::{make_trailer, InternalKeyKind};
    use crate::sstable::iter::SeekGeFlags;
    use crate::sstable::readable::MemReadable;
    use crate::sstable::writer::Writer;

    fn build(opts: WriterOptions, n: usize) -> Vec<u8> {
        let mut buf = Vec::new();
        let mut w = Writer::new(&mut buf, opts).unwrap();
        for i in 0..n {
            w.set(format!("k{i:05}").as_bytes(), format!("value-{i}").as_bytes()).unwrap();
        }
        w.finish().unwrap();
        buf
    }

    fn open(buf: Vec<u8>, opts: ReaderOptions) -> Result<Reader> {
        Reader::open(Arc::new(MemReadable::new(buf)), opts)
    }

    #[test]
    fn test_open_reads_properties() {
        let reader = open(build(WriterOptions::default().block_size(256), 200), ReaderOptions::default()).unwrap();
        let props = reader.properties();
        assert_eq!(props.num_entries, 200);
        assert!(props.num_data_blocks > 1);
        assert_eq!(props.comparer_name, "leveldb.BytewiseComparator");
        assert_eq!(reader.table_format(), TableFormat::Pebblev4);
    }

    #[test]
    fn test_open_rejects_garbage() {
        let err = open(vec![0u8; 100], ReaderOptions::default()).unwrap_err();
        assert!(err.is_corruption(), "{err}");
        let err = open(vec![0u8; 10], ReaderOptions::default()).unwrap_err();
        assert!(err.is_corruption(), "{err}");
    }

    #[test]
    fn test_unknown_comparer() {
        let opts = WriterOptions::default().comparer(Arc::new(SuffixedKeyComparer::default()));
        let buf = build(opts, 10);
        let err = open(buf.clone(), ReaderOptions::default().file_num(7)).unwrap_err();
        assert!(matches!(err, Error::UnknownComparer { file_num: 7, .. }), "{err}");

        let mut ropts = ReaderOptions::default();
        ropts.comparers.push(Arc::new(SuffixedKeyComparer::default()));
        let reader = open(buf, ropts).unwrap();
        assert_eq!(reader.comparer().name(), SuffixedKeyComparer::default().name());
    }

    #[test]
    fn test_unknown_merger() {
        let mut opts = WriterOptions::default();
        opts.merger_name = "concat".to_string();
        let buf = build(opts, 10);
        let err = open(buf.clone(), ReaderOptions::default()).unwrap_err();
        assert!(matches!(err, Error::UnknownMerger { .. }), "{err}");
        assert!(open(buf.clone(), ReaderOptions::default().merger_name("concat")).is_ok());
        let mut ropts = ReaderOptions::default();
        ropts.mergers.push("concat".to_string());
        assert!(open(buf, ropts).is_ok());
    }

    #[test]
    fn test_close_twice() {
        let reader = open(build(WriterOptions::default(), 10), ReaderOptions::default()).unwrap();
        let mut it = reader.new_iter(IterOptions::default()).unwrap();
        assert!(reader.close().is_ok());
        assert!(matches!(reader.close(), Err(Error::ReaderClosed)));
        assert!(matches!(reader.new_iter(IterOptions::default()), Err(Error::ReaderClosed)));
        // Loading a block through a closed reader fails.
        assert!(!it.first());
        assert!(matches!(it.error(), Some(Error::ReaderClosed)));
    }

    #[test]
    fn test_read_block_uses_cache() {
        let cache = Arc::new(BlockCache::new(1 << 20));
        let buf = build(WriterOptions::default().block_size(256), 100);
        let reader = open(buf, ReaderOptions::default().cache(Arc::clone(&cache))).unwrap();
        let scan = || {
            let stats = Arc::new(IterStats::new());
            let mut it = reader.new_iter(IterOptions::default().stats(Arc::clone(&stats))).unwrap();
            let mut n = 0;
            let mut valid = it.first();
            while valid {
                n += 1;
                valid = it.next();
            }
            assert_eq!(n, 100);
            it.close().unwrap();
            stats
        };

        let cold = scan();
        assert!(IterStats::get(&cold.block_reads) > 0);
        // The second pass is served entirely from the cache.
        let warm = scan();
        assert_eq!(IterStats::get(&warm.block_reads), 0);
        assert_eq!(IterStats::get(&warm.block_bytes_in_cache), IterStats::get(&warm.block_bytes));
        assert_eq!(IterStats::get(&warm.block_bytes), IterStats::get(&cold.block_bytes));
        assert!(cache.stats().hits > 0);
    }

    #[test]
    fn test_pooled_reads_bypass_cache() {
        let cache = Arc::new(BlockCache::new(1 << 20));
        let opts = WriterOptions::default().block_size(256).compression(CompressionType::None);
        let reader = open(build(opts, 100), ReaderOptions::default().cache(Arc::clone(&cache))).unwrap();
        let pool = BufferPool::new(4);
        let layout = reader.layout().unwrap();
        let before = cache.len();
        let bh = layout.data[0].handle;
        let block = reader.inner.read_block(bh, None, Some(&pool)).unwrap();
        assert!(matches!(block, BufferHandle::Pooled(_)));
        assert_eq!(block.len() as u64, bh.length);
        assert_eq!(cache.len(), before);
        drop(block);
        assert_eq!(pool.idle(), 1);
    }

    #[test]
    fn test_checksum_mismatch_detected() {
        let mut buf = build(WriterOptions::default().block_size(256), 50);
        let reader = open(buf.clone(), ReaderOptions::default()).unwrap();
        let bh = reader.layout().unwrap().data[1].handle;
        buf[bh.offset as usize + 3] ^= 0xff;
        let reader = open(buf, ReaderOptions::default()).unwrap();
        let err = reader.inner.read_block(bh, None, None).unwrap_err();
        assert!(matches!(err, Error::ChecksumMismatch { offset, .. } if offset == bh.offset), "{err}");
        assert!(reader.validate_block_checksums().is_err());
    }

    #[test]
    fn test_block_past_end_of_file() {
        let reader = open(build(WriterOptions::default(), 10), ReaderOptions::default()).unwrap();
        let err = reader.inner.read_block(BlockHandle::new(1 << 40, 10), None, None).unwrap_err();
        assert!(err.is_corruption(), "{err}");
    }

    #[test]
    fn test_layout_and_validate() {
        let opts = WriterOptions::default()
            .block_size(128)
            .index_block_size(128)
            .filter_policy(Arc::new(BloomFilterPolicy::new(10)));
        let reader = open(
            build(opts, 500),
            ReaderOptions::default().filter(Arc::new(BloomFilterPolicy::new(10))),
        )
        .unwrap();
        let layout = reader.layout().unwrap();
        assert!(layout.top_index.is_some());
        assert!(layout.index.len() > 1);
        assert_eq!(layout.data.len() as u64, reader.properties().num_data_blocks);
        assert!(layout.filter.is_some());
        let blocks = layout.blocks();
        assert!(blocks.windows(2).all(|w| w[0].1.offset < w[1].1.offset));
        assert_eq!(blocks.last().map(|b| b.0), Some("footer"));
        assert!(layout.to_string().contains("metaindex"));
        reader.validate_block_checksums().unwrap();
    }

    #[test]
    fn test_estimate_disk_usage() {
        for index_block_size in [4096, 64] {
            let opts = WriterOptions::default().block_size(256).index_block_size(index_block_size);
            let reader = open(build(opts, 1000), ReaderOptions::default()).unwrap();
            let data_size = reader.properties().data_size;
            let all = reader.estimate_disk_usage(b"a", b"z").unwrap();
            assert_eq!(all, data_size);
            let half = reader.estimate_disk_usage(b"k00000", b"k00499").unwrap();
            assert!(half > 0 && half < all, "{half} vs {all}");
            assert_eq!(reader.estimate_disk_usage(b"z", b"zz").unwrap(), 0);
        }
    }

    #[test]
    fn test_hide_obsolete_points_filter() {
        let reader = open(build(WriterOptions::default(), 10), ReaderOptions::default()).unwrap();
        let mut filters = Vec::new();
        assert!(!reader.try_add_block_property_filter_for_hide_obsolete_points(5, 10, &mut filters));
        assert!(filters.is_empty());
        assert!(reader.try_add_block_property_filter_for_hide_obsolete_points(11, 10, &mut filters));
        assert_eq!(filters.len(), 1);

        let old = open(
            build(WriterOptions::default().table_format(TableFormat::Pebblev3), 10),
            ReaderOptions::default(),
        )
        .unwrap();
        let mut filters = Vec::new();
        assert!(!old.try_add_block_property_filter_for_hide_obsolete_points(11, 10, &mut filters));
    }

    #[test]
    fn test_transform_range_del_v1() {
        let cmp: Arc<dyn Comparer> = Arc::new(BytewiseComparer);
        let mut w = BlockWriter::new(1);
        let del = |seq| make_trailer(seq, InternalKeyKind::RangeDelete);
        // Overlapping, unfragmented tombstones.
        w.add(InternalKeyRef { user_key: b"a", trailer: del(1) }, b"e");
        w.add(InternalKeyRef { user_key: b"c", trailer: del(2) }, b"g");
        let block = w.finish();

        let out = transform_range_del_v1(&cmp, &block).unwrap();
        let iter = BlockIter::new(Arc::clone(&cmp), out, 0, false).unwrap();
        let mut frags = FragmentBlockIter::new(iter, Arc::clone(&cmp), SpanBlockKind::RangeDel);
        let mut got = Vec::new();
        let mut span = frags.first().unwrap().cloned();
        while let Some(s) = span {
            got.push(s.to_string());
            span = frags.next().unwrap().cloned();
        }
        assert_eq!(
            got,
            vec!["a-c:{(#1,RANGEDEL)}", "c-e:{(#2,RANGEDEL) (#1,RANGEDEL)}", "e-g:{(#2,RANGEDEL)}"]
        );
    }

    #[test]
    fn test_decode_value_block_handles() {
        let vbih = ValueBlocksIndexHandle {
            handle: BlockHandle::new(0, 0),
            block_num_byte_len: 1,
            block_offset_byte_len: 2,
            block_length_byte_len: 1,
        };
        let index = [0u8, 0x10, 0x00, 0x20, 1, 0x35, 0x00, 0x08];
        let handles = decode_value_block_handles(&index, &vbih).unwrap();
        assert_eq!(handles, vec![BlockHandle::new(0x10, 0x20), BlockHandle::new(0x35, 0x08)]);

        assert!(decode_value_block_handles(&index[..6], &vbih).is_err());
        let misnumbered = [1u8, 0x10, 0x00, 0x20];
        assert!(decode_value_block_handles(&misnumbered, &vbih).is_err());
    }

    #[test]
    fn test_excluded_table_yields_empty_iter() {
        use crate::filter::block_property::{BlockPropertiesFilterer, IntervalCollector, IntervalFilter, Interval};

        let collector = || -> Box<dyn crate::filter::block_property::BlockPropertyCollector> {
            Box::new(IntervalCollector::new(
                "seq",
                Arc::new(|k: InternalKeyRef<'_>, _v: &[u8]| Ok(Some(Interval::new(k.seq_num(), k.seq_num() + 1)))),
            ))
        };
        let mut buf = Vec::new();
        let mut w = Writer::new(&mut buf, WriterOptions::default().block_property_collector(Arc::new(collector)))
            .unwrap();
        for i in 0..10u64 {
            let key = format!("k{i}");
            w.add(InternalKeyRef { user_key: key.as_bytes(), trailer: make_trailer(10 + i, InternalKeyKind::Set) }, b"v")
                .unwrap();
        }
        w.finish().unwrap();
        let reader = open(buf, ReaderOptions::default()).unwrap();

        let filterer = BlockPropertiesFilterer::new(vec![Arc::new(IntervalFilter::new("seq", 100, 200))], None);
        let mut it = reader.new_iter(IterOptions::default().filterer(filterer)).unwrap();
        assert!(!it.first());
        assert!(it.maybe_filtered_keys());

        let filterer = BlockPropertiesFilterer::new(vec![Arc::new(IntervalFilter::new("seq", 12, 13))], None);
        let mut it = reader.new_iter(IterOptions::default().filterer(filterer)).unwrap();
        assert!(it.seek_ge(b"k0", SeekGeFlags::NONE));
    }
}
