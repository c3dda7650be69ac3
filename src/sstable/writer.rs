//! Table writer.
//!
//! Keys are added in increasing internal-key order. Data blocks are written as
//! they fill up; everything else is buffered and written when the table is
//! finished:
//!
//! ```text
//! [data block 1] ... [data block N]
//! [filter]
//! [index partitions] [top-level index]    or a single [index]
//! [range-del] [range-key]
//! [value block 1] ... [value block M] [value index]
//! [properties] [metaindex] [footer]
//! ```

use crate::comparer::Comparer;
use crate::config::{ChecksumType, CompressionType, TableFormat, WriterOptions};
use crate::error::{Error, Result};
use crate::filter::block_property::{BlockPropertiesEncoder, BlockPropertyCollector, ObsoleteKeyCollector, ShortId};
use crate::filter::{FilterPolicy, FilterWriter};
use crate::sstable::block::{BlockWriter, EntryOptions};
use crate::sstable::coding::{decode_uvarint, uvarint_len};
use crate::sstable::compression::make_physical_block;
use crate::sstable::footer::{BlockHandle, BlockHandleWithProperties, Footer};
use crate::sstable::fragment::{encode_range_key_value, Fragmenter, Span, SpanKey};
use crate::sstable::internal_key::{
    make_trailer, trailer_kind, InternalKey, InternalKeyKind, InternalKeyRef, SeqNum, SEQ_NUM_MAX, TRAILER_LEN,
    TRAILER_OBSOLETE_MASK,
};
use crate::sstable::properties::{Properties, BINARY_SEARCH_INDEX, TWO_LEVEL_INDEX};
use crate::sstable::value_block::{make_prefix_for_in_place_value, make_prefix_for_value_handle, ValueBlockWriter};
use crate::sstable::{
    BLOCK_TRAILER_LEN, METAINDEX_FILTER_PREFIX, METAINDEX_PROPERTIES, METAINDEX_RANGE_DEL_V2, METAINDEX_RANGE_KEY,
    METAINDEX_VALUE_INDEX,
};
use bytes::Bytes;
use log::{debug, info};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::Arc;

/// Summary of a finished table.
#[derive(Debug, Clone, Default)]
pub struct WriterMetadata {
    /// Total file size in bytes.
    pub size: u64,
    /// Smallest point key.
    pub smallest_point: Option<InternalKey>,
    /// Largest point key.
    pub largest_point: Option<InternalKey>,
    /// Start of the first range deletion.
    pub smallest_range_del: Option<InternalKey>,
    /// Exclusive end of the last range deletion, as a sentinel key.
    pub largest_range_del: Option<InternalKey>,
    /// Start of the first range key.
    pub smallest_range_key: Option<InternalKey>,
    /// Exclusive end of the last range key, as a sentinel key.
    pub largest_range_key: Option<InternalKey>,
    /// Smallest sequence number of any key. Zero for an empty table.
    pub smallest_seq_num: SeqNum,
    /// Largest sequence number of any key.
    pub largest_seq_num: SeqNum,
    /// The properties written to the table.
    pub properties: Properties,
}

impl WriterMetadata {
    /// True if the table holds point keys.
    pub fn has_point_keys(&self) -> bool {
        self.smallest_point.is_some()
    }

    /// True if the table holds range deletions.
    pub fn has_range_del_keys(&self) -> bool {
        self.smallest_range_del.is_some()
    }

    /// True if the table holds range keys.
    pub fn has_range_keys(&self) -> bool {
        self.smallest_range_key.is_some()
    }

    fn update_seq_num(&mut self, seq: SeqNum) {
        self.smallest_seq_num = self.smallest_seq_num.min(seq);
        self.largest_seq_num = self.largest_seq_num.max(seq);
    }
}

struct LastPoint {
    key: InternalKey,
    prefix_len: usize,
    is_obsolete: bool,
}

struct IndexPartition {
    sep: InternalKey,
    block: Vec<u8>,
    props: Vec<u8>,
}

/// Writes a table to a sink.
///
/// Usage:
/// ```
/// use lsmtable::config::WriterOptions;
/// use lsmtable::sstable::Writer;
///
/// let mut buf = Vec::new();
/// let mut w = Writer::new(&mut buf, WriterOptions::default()).unwrap();
/// w.set(b"key1", b"value1").unwrap();
/// w.set(b"key2", b"value2").unwrap();
/// w.delete_range(b"key3", b"key5", 1).unwrap();
/// let meta = w.finish().unwrap();
/// assert_eq!(meta.properties.num_entries, 3);
/// assert_eq!(meta.size, buf.len() as u64);
/// ```
pub struct Writer<W: Write> {
    sink: W,
    offset: u64,
    opts: WriterOptions,
    cmp: Arc<dyn Comparer>,
    checksum: ChecksumType,

    data_block: BlockWriter,
    data_block_threshold: usize,
    index_block: BlockWriter,
    index_block_threshold: usize,
    index_partitions: Vec<IndexPartition>,
    last_point: Option<LastPoint>,
    force_flush: bool,

    collectors: Vec<Box<dyn BlockPropertyCollector>>,
    obsolete: Option<ObsoleteKeyCollector>,
    props_encoder: BlockPropertiesEncoder,
    filter: Option<Box<dyn FilterWriter>>,
    last_filter_prefix: Option<Vec<u8>>,
    value_blocks: Option<ValueBlockWriter>,
    range_dels: Fragmenter,
    range_keys: Fragmenter,

    props: Properties,
    meta: WriterMetadata,
    err: Option<Error>,
}

impl Writer<BufWriter<File>> {
    /// Creates the file at `path` and a writer for it.
    pub fn create<P: AsRef<Path>>(path: P, opts: WriterOptions) -> Result<Self> {
        let file = File::create(path)?;
        Self::new(BufWriter::new(file), opts)
    }
}

impl<W: Write> Writer<W> {
    /// Creates a writer appending the table to `sink`.
    pub fn new(sink: W, opts: WriterOptions) -> Result<Self> {
        opts.validate()?;
        let format = opts.table_format;
        let checksum = if format == TableFormat::LevelDB { ChecksumType::Crc32c } else { opts.checksum };
        let cmp = Arc::clone(&opts.comparer);

        let collectors: Vec<_> = opts.block_property_collectors.iter().map(|ctor| ctor()).collect();
        let obsolete = (format >= TableFormat::Pebblev4).then(ObsoleteKeyCollector::default);
        let value_blocks = (format >= TableFormat::Pebblev3 && !opts.disable_value_blocks).then(|| {
            ValueBlockWriter::new(
                opts.value_block_size,
                size_threshold(opts.value_block_size, opts.block_size_threshold),
                opts.compression,
                checksum,
            )
        });

        let mut props = Properties {
            comparer_name: cmp.name().to_string(),
            merger_name: opts.merger_name.clone(),
            compression_name: opts.compression.name().to_string(),
            is_strict_obsolete: opts.is_strict_obsolete,
            ..Default::default()
        };
        if let Some(policy) = &opts.filter_policy {
            props.filter_policy_name = policy.name().to_string();
        }
        let names: Vec<&str> = collectors
            .iter()
            .map(|c| c.name())
            .chain(obsolete.iter().map(|c| c.name()))
            .collect();
        if !names.is_empty() {
            props.property_collector_names = format!("[{}]", names.join(","));
        }

        debug!(
            "Creating table writer: format={}, block_size={}, index_block_size={}",
            format, opts.block_size, opts.index_block_size
        );
        Ok(Self {
            sink,
            offset: 0,
            cmp: Arc::clone(&cmp),
            checksum,
            data_block: BlockWriter::new(opts.block_restart_interval),
            data_block_threshold: size_threshold(opts.block_size, opts.block_size_threshold),
            index_block: BlockWriter::new(1),
            index_block_threshold: size_threshold(opts.index_block_size, opts.block_size_threshold),
            index_partitions: Vec::new(),
            last_point: None,
            force_flush: false,
            collectors,
            obsolete,
            props_encoder: BlockPropertiesEncoder::default(),
            filter: opts.filter_policy.as_ref().map(|p| p.new_writer()),
            last_filter_prefix: None,
            value_blocks,
            range_dels: Fragmenter::new(Arc::clone(&cmp)),
            range_keys: Fragmenter::new(cmp),
            props,
            meta: WriterMetadata { smallest_seq_num: SEQ_NUM_MAX, ..Default::default() },
            err: None,
            opts,
        })
    }

    /// Adds a SET of `key` at sequence number zero.
    pub fn set(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        self.add(InternalKeyRef { user_key: key, trailer: make_trailer(0, InternalKeyKind::Set) }, value)
    }

    /// Adds a DELETE of `key` at sequence number zero.
    pub fn delete(&mut self, key: &[u8]) -> Result<()> {
        self.add(InternalKeyRef { user_key: key, trailer: make_trailer(0, InternalKeyKind::Delete) }, &[])
    }

    /// Adds a MERGE operand for `key` at sequence number zero.
    pub fn merge(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        self.add(InternalKeyRef { user_key: key, trailer: make_trailer(0, InternalKeyKind::Merge) }, value)
    }

    /// Adds a point key, or a range deletion whose value is the end key.
    ///
    /// Point keys must be strictly increasing. Range keys have their own methods.
    pub fn add(&mut self, key: InternalKeyRef<'_>, value: &[u8]) -> Result<()> {
        self.add_with_force_obsolete(key, value, false)
    }

    /// Like [`add`](Self::add), marking the key obsolete regardless of the keys
    /// before it when `force_obsolete` is set. The obsolete bit is only written in
    /// Pebblev4 tables.
    pub fn add_with_force_obsolete(&mut self, key: InternalKeyRef<'_>, value: &[u8], force_obsolete: bool) -> Result<()> {
        self.check()?;
        let key = InternalKeyRef { user_key: key.user_key, trailer: key.trailer & TRAILER_OBSOLETE_MASK };
        let result = match key.kind() {
            InternalKeyKind::RangeDelete => self.add_tombstone(key.user_key, value, key.seq_num()),
            kind if kind.is_range_key() => Err(Error::invalid_argument(format!(
                "range key {key} must be added with range_key_set, range_key_unset or range_key_delete"
            ))),
            _ => self.add_point(key, value, force_obsolete),
        };
        self.record(result)
    }

    /// Deletes the user keys in `[start, end)` with sequence numbers below `seq`.
    ///
    /// Range deletions may overlap; they must be added in order of their start key.
    pub fn delete_range(&mut self, start: &[u8], end: &[u8], seq: SeqNum) -> Result<()> {
        self.check()?;
        let result = self.add_tombstone(start, end, seq);
        self.record(result)
    }

    /// Sets `suffix` to `value` over `[start, end)`.
    pub fn range_key_set(&mut self, start: &[u8], end: &[u8], suffix: &[u8], value: &[u8], seq: SeqNum) -> Result<()> {
        self.check()?;
        let key = SpanKey {
            trailer: make_trailer(seq, InternalKeyKind::RangeKeySet),
            suffix: Bytes::copy_from_slice(suffix),
            value: Bytes::copy_from_slice(value),
        };
        let result = self.add_range_key(start, end, key);
        self.record(result)
    }

    /// Removes `suffix` over `[start, end)`.
    pub fn range_key_unset(&mut self, start: &[u8], end: &[u8], suffix: &[u8], seq: SeqNum) -> Result<()> {
        self.check()?;
        let key = SpanKey {
            trailer: make_trailer(seq, InternalKeyKind::RangeKeyUnset),
            suffix: Bytes::copy_from_slice(suffix),
            value: Bytes::new(),
        };
        let result = self.add_range_key(start, end, key);
        self.record(result)
    }

    /// Deletes every range key over `[start, end)`.
    pub fn range_key_delete(&mut self, start: &[u8], end: &[u8], seq: SeqNum) -> Result<()> {
        self.check()?;
        let key = SpanKey::new(make_trailer(seq, InternalKeyKind::RangeKeyDelete));
        let result = self.add_range_key(start, end, key);
        self.record(result)
    }

    /// Ends the current data block before the next point key is added.
    pub(crate) fn flush_before_next_point(&mut self) {
        self.force_flush = true;
    }

    /// Approximate size of the table if finished now.
    pub fn estimated_size(&self) -> u64 {
        let partitions: usize = self.index_partitions.iter().map(|p| p.block.len()).sum();
        self.offset
            + self.data_block.estimated_size() as u64
            + self.index_block.estimated_size() as u64
            + partitions as u64
            + self.value_blocks.as_ref().map_or(0, |v| v.estimated_size())
    }

    /// Writes the remaining blocks and the footer and flushes the sink.
    pub fn finish(mut self) -> Result<WriterMetadata> {
        self.check()?;
        self.write_tail()?;
        self.sink.flush()?;

        let mut meta = std::mem::take(&mut self.meta);
        if meta.smallest_seq_num > meta.largest_seq_num {
            meta.smallest_seq_num = 0;
        }
        meta.size = self.offset;
        meta.properties = std::mem::take(&mut self.props);
        info!(
            "Finished table: {} bytes, {} entries, {} data blocks, {} index partitions",
            meta.size,
            meta.properties.num_entries,
            meta.properties.num_data_blocks,
            meta.properties.index_partitions
        );
        Ok(meta)
    }

    fn check(&self) -> Result<()> {
        self.err.as_ref().map_or(Ok(()), |e| Err(e.duplicate()))
    }

    fn record<T>(&mut self, result: Result<T>) -> Result<T> {
        if let Err(e) = &result {
            self.err = Some(e.duplicate());
        }
        result
    }

    fn add_point(&mut self, key: InternalKeyRef<'_>, value: &[u8], force_obsolete: bool) -> Result<()> {
        let kind = key.kind();
        let format = self.opts.table_format;
        match kind {
            InternalKeyKind::Set
            | InternalKeyKind::SetWithDelete
            | InternalKeyKind::Merge
            | InternalKeyKind::Delete
            | InternalKeyKind::SingleDelete => {}
            InternalKeyKind::DeleteSized if format >= TableFormat::Pebblev4 => {}
            _ => {
                return Err(Error::invalid_argument(format!(
                    "cannot add key {key} of kind {kind} to a {format} table"
                )))
            }
        }
        if kind == InternalKeyKind::Merge && self.opts.is_strict_obsolete {
            return Err(Error::invalid_argument("MERGE is not supported in a strict-obsolete table"));
        }
        if kind == InternalKeyKind::DeleteSized
            && !value.is_empty()
            && !matches!(decode_uvarint(value), Some((_, n)) if n == value.len())
        {
            return Err(Error::invalid_argument(format!("invalid DELSIZED value for key {key}")));
        }

        let prefix_len = self.cmp.split(key.user_key);
        let (cmp_user, cmp_prefix) = match &self.last_point {
            None => (Ordering::Less, Ordering::Less),
            Some(prev) => {
                let cmp_user = self.cmp.compare(&prev.key.user_key, key.user_key);
                if cmp_user == Ordering::Greater || (cmp_user == Ordering::Equal && prev.key.trailer <= key.trailer) {
                    return Err(Error::invalid_argument(format!(
                        "keys must be added in strictly increasing order: {}, {}",
                        prev.key, key
                    )));
                }
                let cmp_prefix = if cmp_user == Ordering::Equal {
                    Ordering::Equal
                } else {
                    self.cmp.compare(&prev.key.user_key[..prev.prefix_len], &key.user_key[..prefix_len])
                };
                (cmp_user, cmp_prefix)
            }
        };
        let prev = self.last_point.as_ref();

        // A key shadowed by a newer version of the same user key is obsolete,
        // unless the newer version is a live MERGE operand.
        let shadowed = cmp_user == Ordering::Equal
            && prev.is_some_and(|p| p.is_obsolete || p.key.kind() != InternalKeyKind::Merge);
        let is_obsolete = format >= TableFormat::Pebblev4 && (shadowed || force_obsolete);

        let set_has_same_prefix = format >= TableFormat::Pebblev3
            && kind == InternalKeyKind::Set
            && prev.is_some_and(|p| p.key.kind() == InternalKeyKind::Set)
            && cmp_prefix == Ordering::Equal;
        let max_shared_key_len = (format >= TableFormat::Pebblev3).then(|| prev.map_or(0, |p| p.prefix_len));

        let mut handle_buf = Vec::new();
        let value_blocks = self
            .value_blocks
            .as_mut()
            .filter(|_| set_has_same_prefix && value.len() >= self.opts.value_block_min_size.max(1));
        let (stored, value_prefix): (&[u8], Option<u8>) = if let Some(vbw) = value_blocks {
            let vh = vbw.add_value(value)?;
            vh.encode_into(&mut handle_buf);
            let attribute = match &self.opts.short_attribute_extractor {
                Some(extract) => extract(key.user_key, prefix_len, value)?,
                None => 0,
            };
            (&handle_buf[..], Some(make_prefix_for_value_handle(set_has_same_prefix, attribute)))
        } else if format >= TableFormat::Pebblev3 && kind == InternalKeyKind::Set {
            (value, Some(make_prefix_for_in_place_value(set_has_same_prefix)))
        } else {
            (value, None)
        };

        let stored_len = stored.len() + usize::from(value_prefix.is_some());
        if std::mem::take(&mut self.force_flush)
            || should_flush(
                key.user_key.len() + TRAILER_LEN,
                stored_len,
                self.opts.block_restart_interval,
                self.data_block.estimated_size(),
                self.data_block.entry_count(),
                self.opts.block_size,
                self.data_block_threshold,
            )
        {
            self.flush_data_block(Some(key))?;
        }

        // Collectors never see the values of SETs in formats with value blocks.
        let collected = if value_prefix.is_some() { &[][..] } else { value };
        for c in &mut self.collectors {
            c.add(key, collected)?;
        }
        if let Some(o) = &mut self.obsolete {
            o.add_point(is_obsolete);
        }
        if let Some(filter) = &mut self.filter {
            let prefix = &key.user_key[..prefix_len];
            if self.last_filter_prefix.as_deref() != Some(prefix) {
                filter.add_key(prefix);
                self.last_filter_prefix = Some(prefix.to_vec());
            }
        }

        self.data_block.add_entry(
            key,
            stored,
            EntryOptions { is_obsolete, max_shared_key_len, value_prefix, set_has_same_key_prefix: set_has_same_prefix },
        );

        self.meta.update_seq_num(key.seq_num());
        if self.meta.smallest_point.is_none() {
            self.meta.smallest_point = Some(key.to_owned());
        }
        self.props.num_entries += 1;
        match kind {
            InternalKeyKind::Delete | InternalKeyKind::SingleDelete => self.props.num_deletions += 1,
            InternalKeyKind::DeleteSized => {
                self.props.num_deletions += 1;
                self.props.num_sized_deletions += 1;
            }
            InternalKeyKind::Merge => self.props.num_merge_operands += 1,
            _ => {}
        }
        self.props.raw_key_size += (key.user_key.len() + TRAILER_LEN) as u64;
        self.props.raw_value_size += value.len() as u64;
        self.last_point = Some(LastPoint { key: key.to_owned(), prefix_len, is_obsolete });
        Ok(())
    }

    fn add_tombstone(&mut self, start: &[u8], end: &[u8], seq: SeqNum) -> Result<()> {
        self.range_dels.add(Span {
            start: Bytes::copy_from_slice(start),
            end: Bytes::copy_from_slice(end),
            keys: vec![SpanKey::new(make_trailer(seq, InternalKeyKind::RangeDelete))],
        })
    }

    fn add_range_key(&mut self, start: &[u8], end: &[u8], key: SpanKey) -> Result<()> {
        if self.opts.table_format < TableFormat::Pebblev2 {
            return Err(Error::not_supported(format!(
                "range keys require table format {} or later, got {}",
                TableFormat::Pebblev2,
                self.opts.table_format
            )));
        }
        self.range_keys.add(Span { start: Bytes::copy_from_slice(start), end: Bytes::copy_from_slice(end), keys: vec![key] })
    }

    fn write_block(&mut self, block: &[u8], compression: CompressionType) -> Result<BlockHandle> {
        let physical = make_physical_block(block, compression, self.checksum)?;
        let handle = BlockHandle::new(self.offset, physical.handle_len());
        self.sink.write_all(&physical.bytes)?;
        self.offset += physical.bytes.len() as u64;
        Ok(handle)
    }

    /// Encodes the properties the collectors produce through `finish`, skipping
    /// empty ones.
    fn collect_props(
        &mut self,
        mut finish: impl FnMut(&mut dyn BlockPropertyCollector) -> Result<Vec<u8>>,
    ) -> Result<Vec<u8>> {
        for (i, c) in self.collectors.iter_mut().enumerate() {
            let prop = finish(c.as_mut())?;
            if !prop.is_empty() {
                self.props_encoder.add_prop(i as ShortId, &prop);
            }
        }
        if let Some(o) = &mut self.obsolete {
            let prop = finish(o as &mut dyn BlockPropertyCollector)?;
            if !prop.is_empty() {
                self.props_encoder.add_prop(self.collectors.len() as ShortId, &prop);
            }
        }
        Ok(self.props_encoder.finish())
    }

    fn flush_data_block(&mut self, next: Option<InternalKeyRef<'_>>) -> Result<()> {
        if self.data_block.is_empty() {
            return Ok(());
        }
        let last = self.data_block.cur_key().to_owned();
        let sep = match next {
            Some(next) => separator(self.cmp.as_ref(), &last, next),
            None => successor(self.cmp.as_ref(), &last),
        };
        let block = self.data_block.finish();
        let handle = self.write_block(&block, self.opts.compression)?;
        self.props.num_data_blocks += 1;
        // Data blocks are contiguous from the start of the file.
        self.props.data_size = self.offset;

        let props = self.collect_props(|c| c.finish_data_block())?;
        debug!("Flushed data block {} (separator {})", handle, sep);
        self.add_index_entry(sep, BlockHandleWithProperties { handle, props })?;
        for c in &mut self.collectors {
            c.add_prev_data_block_to_index_block();
        }
        if let Some(o) = &mut self.obsolete {
            o.add_prev_data_block_to_index_block();
        }
        Ok(())
    }

    fn add_index_entry(&mut self, sep: InternalKey, bhp: BlockHandleWithProperties) -> Result<()> {
        let encoded = bhp.encode();
        if self.opts.table_format >= TableFormat::RocksDBv2
            && should_flush(
                sep.encoded_len(),
                encoded.len(),
                1,
                self.index_block.estimated_size(),
                self.index_block.entry_count(),
                self.opts.index_block_size,
                self.index_block_threshold,
            )
        {
            self.finish_index_block()?;
        }
        self.index_block.add(sep.as_ref(), &encoded);
        Ok(())
    }

    fn finish_index_block(&mut self) -> Result<()> {
        let sep = self.index_block.cur_key().to_owned();
        let props = self.collect_props(|c| c.finish_index_block())?;
        let block = self.index_block.finish();
        self.index_partitions.push(IndexPartition { sep, block, props });
        Ok(())
    }

    fn write_index(&mut self) -> Result<BlockHandle> {
        let trailer = BLOCK_TRAILER_LEN as u64;
        if self.index_partitions.is_empty() {
            let block = self.index_block.finish();
            let handle = self.write_block(&block, self.opts.compression)?;
            self.props.index_size = handle.length + trailer;
            self.props.index_type = BINARY_SEARCH_INDEX;
            return Ok(handle);
        }

        if !self.index_block.is_empty() {
            self.finish_index_block()?;
        }
        let partitions = std::mem::take(&mut self.index_partitions);
        let mut top = BlockWriter::new(1);
        for p in &partitions {
            let handle = self.write_block(&p.block, self.opts.compression)?;
            self.props.index_size += handle.length + trailer;
            top.add(p.sep.as_ref(), &BlockHandleWithProperties { handle, props: p.props.clone() }.encode());
        }
        let top_block = top.finish();
        let handle = self.write_block(&top_block, self.opts.compression)?;
        self.props.index_partitions = partitions.len() as u64;
        self.props.top_level_index_size = handle.length + trailer;
        self.props.index_size += self.props.top_level_index_size;
        self.props.index_type = TWO_LEVEL_INDEX;
        Ok(handle)
    }

    fn write_range_dels(&mut self, metaindex: &mut BTreeMap<String, Vec<u8>>) -> Result<()> {
        let fragmenter = std::mem::replace(&mut self.range_dels, Fragmenter::new(Arc::clone(&self.cmp)));
        let spans = fragmenter.finish();
        let (Some(first), Some(last)) = (spans.first(), spans.last()) else {
            return Ok(());
        };
        self.meta.smallest_range_del = first.keys.first().map(|k| InternalKey { user_key: first.start.to_vec(), trailer: k.trailer });
        self.meta.largest_range_del = Some(InternalKey::new(last.end.to_vec(), SEQ_NUM_MAX, InternalKeyKind::RangeDelete));

        let mut block = BlockWriter::new(1);
        for span in &spans {
            for k in &span.keys {
                block.add(InternalKeyRef { user_key: &span.start, trailer: k.trailer }, &span.end);
                self.meta.update_seq_num(k.seq_num());
                self.props.num_entries += 1;
                self.props.num_deletions += 1;
                self.props.num_range_deletions += 1;
                self.props.raw_key_size += (span.start.len() + TRAILER_LEN) as u64;
                self.props.raw_value_size += span.end.len() as u64;
            }
        }
        let handle = self.write_block(&block.finish(), CompressionType::None)?;
        metaindex.insert(METAINDEX_RANGE_DEL_V2.to_string(), handle.encode());
        Ok(())
    }

    fn write_range_keys(&mut self, metaindex: &mut BTreeMap<String, Vec<u8>>) -> Result<()> {
        let fragmenter = std::mem::replace(&mut self.range_keys, Fragmenter::new(Arc::clone(&self.cmp)));
        let spans = fragmenter.finish();
        let (Some(first), Some(last)) = (spans.first(), spans.last()) else {
            return Ok(());
        };
        self.meta.smallest_range_key = first.keys.first().map(|k| InternalKey { user_key: first.start.to_vec(), trailer: k.trailer });
        self.meta.largest_range_key = last
            .keys
            .last()
            .map(|k| InternalKey::new(last.end.to_vec(), SEQ_NUM_MAX, k.kind()));

        let mut block = BlockWriter::new(1);
        for span in &spans {
            // Keys sharing a trailer are coalesced into one entry.
            let mut i = 0;
            while i < span.keys.len() {
                let trailer = span.keys[i].trailer;
                let n = span.keys[i..].iter().take_while(|k| k.trailer == trailer).count();
                let mut group: Vec<&SpanKey> = span.keys[i..i + n].iter().collect();
                group.sort_by(|a, b| self.cmp.compare(&a.suffix, &b.suffix));
                let suffix_values: Vec<(&[u8], &[u8])> = group.iter().map(|k| (&k.suffix[..], &k.value[..])).collect();

                let kind = trailer_kind(trailer);
                let value = encode_range_key_value(kind, &span.end, &suffix_values);
                block.add(InternalKeyRef { user_key: &span.start, trailer }, &value);
                match kind {
                    InternalKeyKind::RangeKeySet => self.props.num_range_key_sets += n as u64,
                    InternalKeyKind::RangeKeyUnset => self.props.num_range_key_unsets += n as u64,
                    _ => self.props.num_range_key_dels += 1,
                }
                self.meta.update_seq_num(span.keys[i].seq_num());
                i += n;
            }
        }
        let handle = self.write_block(&block.finish(), CompressionType::None)?;
        metaindex.insert(METAINDEX_RANGE_KEY.to_string(), handle.encode());
        Ok(())
    }

    fn write_tail(&mut self) -> Result<()> {
        if let Some(p) = &self.last_point {
            self.meta.largest_point = Some(p.key.clone());
        }
        self.flush_data_block(None)?;

        let mut metaindex: BTreeMap<String, Vec<u8>> = BTreeMap::new();
        if let (Some(mut filter), Some(policy)) = (self.filter.take(), self.opts.filter_policy.clone()) {
            let block = filter.finish();
            let handle = self.write_block(&block, CompressionType::None)?;
            self.props.filter_size = handle.length;
            metaindex.insert(format!("{METAINDEX_FILTER_PREFIX}{}", policy.name()), handle.encode());
        }

        let index_bh = self.write_index()?;
        self.write_range_dels(&mut metaindex)?;
        self.write_range_keys(&mut metaindex)?;

        if let Some(mut vbw) = self.value_blocks.take() {
            let (vbih, stats) = vbw.finish(&mut self.sink, self.offset)?;
            self.offset += stats.value_blocks_and_index_size;
            if let Some(vbih) = vbih {
                metaindex.insert(METAINDEX_VALUE_INDEX.to_string(), vbih.encode());
            }
            self.props.num_value_blocks = stats.num_value_blocks;
            self.props.num_values_in_value_blocks = stats.num_values_in_value_blocks;
            self.props.value_blocks_size = stats.value_blocks_and_index_size;
        }

        // Table-level block properties are always recorded, so readers can tell
        // which collectors ran even when a property is empty.
        let obsolete_id = self.collectors.len() as ShortId;
        for (i, c) in self.collectors.iter_mut().enumerate() {
            let mut prop = vec![i as ShortId];
            prop.extend(c.finish_table()?);
            self.props.user_properties.insert(c.name().to_string(), prop);
        }
        if let Some(o) = &mut self.obsolete {
            let mut prop = vec![obsolete_id];
            prop.extend(o.finish_table()?);
            self.props.user_properties.insert(o.name().to_string(), prop);
        }

        let props_block = self.props.encode();
        let props_bh = self.write_block(&props_block, CompressionType::None)?;
        metaindex.insert(METAINDEX_PROPERTIES.to_string(), props_bh.encode());

        let mut mw = BlockWriter::new(1);
        for (name, value) in &metaindex {
            mw.add_raw(name.as_bytes(), value);
        }
        let metaindex_bh = self.write_block(&mw.finish(), CompressionType::None)?;

        let footer = Footer {
            format: self.opts.table_format,
            checksum: self.checksum,
            metaindex_bh,
            index_bh,
            footer_bh: BlockHandle::default(),
        }
        .encode()?;
        self.sink.write_all(&footer)?;
        self.offset += footer.len() as u64;
        Ok(())
    }
}

fn size_threshold(size: usize, percent: usize) -> usize {
    (size * percent + 99) / 100
}

/// Reports whether a block should be finished before adding an entry with the
/// given key and value lengths.
///
/// A block at or over `target` is always flushed. Between `threshold` and
/// `target` it is flushed when the entry would push it past `target`.
fn should_flush(
    key_len: usize,
    value_len: usize,
    restart_interval: usize,
    estimated: usize,
    entries: usize,
    target: usize,
    threshold: usize,
) -> bool {
    if entries == 0 {
        return false;
    }
    if estimated >= target {
        return true;
    }
    if estimated <= threshold {
        return false;
    }
    let mut new_size = estimated + key_len + value_len;
    if entries % restart_interval == 0 {
        new_size += 4;
    }
    new_size += 4;
    new_size += uvarint_len(key_len as u64);
    new_size += uvarint_len(value_len as u64);
    new_size > target
}

/// A key `k` with `prev <= k < next`, shortened when the comparer allows.
fn separator(cmp: &dyn Comparer, prev: &InternalKey, next: InternalKeyRef<'_>) -> InternalKey {
    let mut buf = Vec::new();
    cmp.separator(&mut buf, &prev.user_key, next.user_key);
    shortened(cmp, prev, buf)
}

/// A key `k >= last`, shortened when the comparer allows.
fn successor(cmp: &dyn Comparer, last: &InternalKey) -> InternalKey {
    let mut buf = Vec::new();
    cmp.successor(&mut buf, &last.user_key);
    shortened(cmp, last, buf)
}

fn shortened(cmp: &dyn Comparer, key: &InternalKey, user_key: Vec<u8>) -> InternalKey {
    if user_key.len() <= key.user_key.len() && cmp.compare(&key.user_key, &user_key) == Ordering::Less {
        return InternalKey::new(user_key, SEQ_NUM_MAX, InternalKeyKind::Separator);
    }
    key.clone()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comparer::BytewiseComparer;
    use crate::config::{IterOptions, ReaderOptions};
    use crate::filter::block_property::OBSOLETE_KEY_PROPERTY_NAME;
    use crate::filter::BloomFilterPolicy;
    use crate::sstable::iter::InternalIterator;
    use crate::sstable::readable::{FileReadable, MemReadable};
    use crate::sstable::reader::Reader;
    use tempfile::TempDir;

    fn ikey(k: &[u8], seq: SeqNum, kind: InternalKeyKind) -> InternalKey {
        InternalKey::new(k.to_vec(), seq, kind)
    }

    fn open(buf: Vec<u8>) -> Reader {
        Reader::open(Arc::new(MemReadable::new(buf)), ReaderOptions::default()).unwrap()
    }

    fn scan(reader: &Reader) -> Vec<(InternalKey, Vec<u8>)> {
        let mut it = reader.new_iter(IterOptions::default()).unwrap();
        let mut out = Vec::new();
        let mut valid = it.first();
        while valid {
            let key = it.key().unwrap().to_owned();
            out.push((key, it.value().to_vec().unwrap()));
            valid = it.next();
        }
        assert!(it.error().is_none());
        it.close().unwrap();
        out
    }

    #[test]
    fn test_out_of_order_keys_rejected() {
        let mut buf = Vec::new();
        let mut w = Writer::new(&mut buf, WriterOptions::default()).unwrap();
        w.set(b"b", b"1").unwrap();
        let err = w.set(b"a", b"2").unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)), "{err}");
        // The error is sticky.
        assert!(w.set(b"c", b"3").is_err());
        assert!(w.finish().is_err());
    }

    #[test]
    fn test_duplicate_trailer_rejected() {
        let mut buf = Vec::new();
        let mut w = Writer::new(&mut buf, WriterOptions::default()).unwrap();
        w.add(ikey(b"a", 5, InternalKeyKind::Set).as_ref(), b"1").unwrap();
        w.add(ikey(b"a", 4, InternalKeyKind::Set).as_ref(), b"2").unwrap();
        assert!(w.add(ikey(b"a", 4, InternalKeyKind::Delete).as_ref(), b"").is_err());
    }

    #[test]
    fn test_range_key_kinds_rejected_by_add() {
        let mut buf = Vec::new();
        let mut w = Writer::new(&mut buf, WriterOptions::default()).unwrap();
        let err = w.add(ikey(b"a", 1, InternalKeyKind::RangeKeySet).as_ref(), b"").unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
    }

    #[test]
    fn test_round_trip_properties_and_metadata() {
        let mut buf = Vec::new();
        let mut w = Writer::new(&mut buf, WriterOptions::default().block_size(64)).unwrap();
        w.add(ikey(b"a", 9, InternalKeyKind::Set).as_ref(), b"apple").unwrap();
        w.add(ikey(b"b", 8, InternalKeyKind::Delete).as_ref(), b"").unwrap();
        w.add(ikey(b"c", 7, InternalKeyKind::Merge).as_ref(), b"+1").unwrap();
        w.add(ikey(b"d", 3, InternalKeyKind::SingleDelete).as_ref(), b"").unwrap();
        let meta = w.finish().unwrap();

        assert_eq!(meta.size, buf.len() as u64);
        assert_eq!(meta.smallest_point, Some(ikey(b"a", 9, InternalKeyKind::Set)));
        assert_eq!(meta.largest_point, Some(ikey(b"d", 3, InternalKeyKind::SingleDelete)));
        assert_eq!((meta.smallest_seq_num, meta.largest_seq_num), (3, 9));
        assert!(meta.has_point_keys() && !meta.has_range_del_keys() && !meta.has_range_keys());

        let props = &meta.properties;
        assert_eq!(props.num_entries, 4);
        assert_eq!(props.num_deletions, 2);
        assert_eq!(props.num_merge_operands, 1);
        assert_eq!(props.raw_key_size, 4 * 9);
        assert_eq!(props.raw_value_size, 7);
        assert_eq!(props.comparer_name, BytewiseComparer.name());
        assert_eq!(props.property_collector_names, format!("[{OBSOLETE_KEY_PROPERTY_NAME}]"));

        let reader = open(buf);
        assert_eq!(reader.properties(), props);
        let got = scan(&reader);
        let keys: Vec<_> = got.iter().map(|(k, _)| k.clone()).collect();
        assert_eq!(
            keys,
            vec![
                ikey(b"a", 9, InternalKeyKind::Set),
                ikey(b"b", 8, InternalKeyKind::Delete),
                ikey(b"c", 7, InternalKeyKind::Merge),
                ikey(b"d", 3, InternalKeyKind::SingleDelete),
            ]
        );
        assert_eq!(got[0].1, b"apple");
        assert_eq!(got[2].1, b"+1");
    }

    #[test]
    fn test_older_versions_go_to_value_blocks() {
        let mut buf = Vec::new();
        let mut w = Writer::new(&mut buf, WriterOptions::default()).unwrap();
        for (k, seq) in [(b"a", 3), (b"a", 2), (b"a", 1), (b"b", 5)] {
            let value = format!("{}{seq}", k[0] as char);
            w.add(ikey(k, seq, InternalKeyKind::Set).as_ref(), value.as_bytes()).unwrap();
        }
        let meta = w.finish().unwrap();
        assert_eq!(meta.properties.num_values_in_value_blocks, 2);
        assert_eq!(meta.properties.num_value_blocks, 1);
        assert!(meta.properties.value_blocks_size > 0);

        let reader = open(buf);
        let mut it = reader.new_iter(IterOptions::default()).unwrap();
        assert!(it.first());
        assert!(it.value().is_in_place());
        assert_eq!(it.value().to_vec().unwrap(), b"a3");
        assert!(it.next());
        assert!(!it.value().is_in_place());
        assert_eq!(it.value().len(), 2);
        assert_eq!(it.value().to_vec().unwrap(), b"a2");
        assert!(it.next());
        assert_eq!(it.value().to_vec().unwrap(), b"a1");
        assert!(it.next());
        assert!(it.value().is_in_place());
        assert_eq!(it.value().to_vec().unwrap(), b"b5");
        assert!(!it.next());
        it.close().unwrap();
    }

    #[test]
    fn test_disable_value_blocks() {
        let mut buf = Vec::new();
        let mut w = Writer::new(&mut buf, WriterOptions::default().disable_value_blocks(true)).unwrap();
        w.add(ikey(b"a", 3, InternalKeyKind::Set).as_ref(), b"new").unwrap();
        w.add(ikey(b"a", 2, InternalKeyKind::Set).as_ref(), b"old").unwrap();
        let meta = w.finish().unwrap();
        assert_eq!(meta.properties.num_value_blocks, 0);
        assert_eq!(scan(&open(buf))[1].1, b"old");
    }

    #[test]
    fn test_short_attribute_extractor() {
        let mut buf = Vec::new();
        let opts = WriterOptions::default().short_attribute_extractor(Arc::new(|_k: &[u8], _p: usize, v: &[u8]| -> Result<u8> {
            Ok((v.len() % 8) as u8)
        }));
        let mut w = Writer::new(&mut buf, opts).unwrap();
        w.add(ikey(b"a", 3, InternalKeyKind::Set).as_ref(), b"new").unwrap();
        w.add(ikey(b"a", 2, InternalKeyKind::Set).as_ref(), b"older").unwrap();
        w.finish().unwrap();

        let reader = open(buf);
        let mut it = reader.new_iter(IterOptions::default()).unwrap();
        assert!(it.first());
        assert_eq!(it.value().short_attribute(), None);
        assert!(it.next());
        assert_eq!(it.value().short_attribute(), Some(5));
    }

    #[test]
    fn test_obsolete_points_hidden() {
        let mut buf = Vec::new();
        let mut w = Writer::new(&mut buf, WriterOptions::default()).unwrap();
        w.add(ikey(b"a", 5, InternalKeyKind::Set).as_ref(), b"new").unwrap();
        w.add(ikey(b"a", 4, InternalKeyKind::Set).as_ref(), b"old").unwrap();
        w.add_with_force_obsolete(ikey(b"b", 3, InternalKeyKind::Delete).as_ref(), b"", true).unwrap();
        w.add(ikey(b"c", 2, InternalKeyKind::Merge).as_ref(), b"m2").unwrap();
        w.add(ikey(b"c", 1, InternalKeyKind::Merge).as_ref(), b"m1").unwrap();
        w.finish().unwrap();

        let reader = open(buf);
        assert!(reader.properties().user_properties.contains_key(OBSOLETE_KEY_PROPERTY_NAME));
        let mut it = reader.new_iter(IterOptions::default().hide_obsolete_points(true)).unwrap();
        let mut keys = Vec::new();
        let mut valid = it.first();
        while valid {
            keys.push(it.key().unwrap().to_owned());
            valid = it.next();
        }
        assert_eq!(
            keys,
            vec![
                ikey(b"a", 5, InternalKeyKind::Set),
                ikey(b"c", 2, InternalKeyKind::Merge),
                ikey(b"c", 1, InternalKeyKind::Merge),
            ]
        );
    }

    #[test]
    fn test_strict_obsolete_rejects_merge() {
        let mut opts = WriterOptions::default();
        opts.is_strict_obsolete = true;
        let mut buf = Vec::new();
        let mut w = Writer::new(&mut buf, opts).unwrap();
        assert!(w.merge(b"a", b"1").is_err());
    }

    #[test]
    fn test_two_level_index() {
        let mut buf = Vec::new();
        let opts = WriterOptions::default().block_size(64).index_block_size(64);
        let mut w = Writer::new(&mut buf, opts).unwrap();
        for i in 0..300 {
            w.set(format!("key{i:04}").as_bytes(), format!("v{i}").as_bytes()).unwrap();
        }
        let meta = w.finish().unwrap();
        assert_eq!(meta.properties.index_type, TWO_LEVEL_INDEX);
        assert!(meta.properties.index_partitions > 1);
        assert!(meta.properties.index_size > meta.properties.top_level_index_size);

        let got = scan(&open(buf));
        assert_eq!(got.len(), 300);
        assert!(got.windows(2).all(|w| w[0].0.user_key < w[1].0.user_key));
        assert_eq!(got[299].1, b"v299");
    }

    #[test]
    fn test_leveldb_format_single_level() {
        let mut buf = Vec::new();
        let opts = WriterOptions::default()
            .table_format(TableFormat::LevelDB)
            .checksum(ChecksumType::XxHash64)
            .block_size(64)
            .index_block_size(64);
        let mut w = Writer::new(&mut buf, opts).unwrap();
        for i in 0..100 {
            w.set(format!("key{i:03}").as_bytes(), b"value").unwrap();
        }
        let meta = w.finish().unwrap();
        assert_eq!(meta.properties.index_partitions, 0);

        let reader = open(buf);
        assert_eq!(reader.table_format(), TableFormat::LevelDB);
        assert_eq!(scan(&reader).len(), 100);
    }

    #[test]
    fn test_range_deletions_fragmented() {
        let mut buf = Vec::new();
        let mut w = Writer::new(&mut buf, WriterOptions::default()).unwrap();
        w.set(b"a", b"1").unwrap();
        w.delete_range(b"a", b"c", 5).unwrap();
        w.add(ikey(b"b", 6, InternalKeyKind::RangeDelete).as_ref(), b"d").unwrap();
        assert!(w.delete_range(b"a", b"b", 7).is_err());
        let mut buf2 = Vec::new();
        let mut w2 = Writer::new(&mut buf2, WriterOptions::default()).unwrap();
        w2.delete_range(b"a", b"c", 5).unwrap();
        w2.delete_range(b"b", b"d", 6).unwrap();
        let meta = w2.finish().unwrap();
        assert_eq!(meta.properties.num_range_deletions, 4);
        assert_eq!(meta.smallest_range_del, Some(ikey(b"a", 5, InternalKeyKind::RangeDelete)));
        assert_eq!(meta.largest_range_del, Some(ikey(b"d", SEQ_NUM_MAX, InternalKeyKind::RangeDelete)));
        assert!(!meta.has_point_keys());

        let reader = open(buf2);
        let mut it = reader.new_raw_range_del_iter().unwrap().unwrap();
        let mut got = Vec::new();
        let mut span = it.first().unwrap().cloned();
        while let Some(s) = span {
            got.push(s.to_string());
            span = it.next().unwrap().cloned();
        }
        assert_eq!(got, vec!["a-b:{(#5,RANGEDEL)}", "b-c:{(#6,RANGEDEL) (#5,RANGEDEL)}", "c-d:{(#6,RANGEDEL)}"]);
        assert!(reader.new_raw_range_key_iter().unwrap().is_none());
    }

    #[test]
    fn test_range_keys() {
        let mut buf = Vec::new();
        let mut w = Writer::new(&mut buf, WriterOptions::default()).unwrap();
        w.range_key_set(b"a", b"c", b"@1", b"v1", 4).unwrap();
        w.range_key_unset(b"a", b"c", b"@2", 3).unwrap();
        w.range_key_delete(b"c", b"e", 2).unwrap();
        let meta = w.finish().unwrap();
        assert_eq!(meta.properties.num_range_key_sets, 1);
        assert_eq!(meta.properties.num_range_key_unsets, 1);
        assert_eq!(meta.properties.num_range_key_dels, 1);
        assert_eq!(meta.smallest_range_key, Some(ikey(b"a", 4, InternalKeyKind::RangeKeySet)));
        assert_eq!(meta.largest_range_key, Some(ikey(b"e", SEQ_NUM_MAX, InternalKeyKind::RangeKeyDelete)));

        let reader = open(buf);
        let mut it = reader.new_raw_range_key_iter().unwrap().unwrap();
        let span = it.first().unwrap().cloned().unwrap();
        assert_eq!((&span.start[..], &span.end[..]), (&b"a"[..], &b"c"[..]));
        assert_eq!(span.keys.len(), 2);
        assert_eq!(span.keys[0].kind(), InternalKeyKind::RangeKeySet);
        assert_eq!(&span.keys[0].suffix[..], b"@1");
        assert_eq!(&span.keys[0].value[..], b"v1");
        assert_eq!(span.keys[1].kind(), InternalKeyKind::RangeKeyUnset);
        assert_eq!(&span.keys[1].suffix[..], b"@2");
        let span = it.next().unwrap().cloned().unwrap();
        assert_eq!(span.to_string(), "c-e:{(#2,RANGEKEYDEL)}");
        assert!(it.next().unwrap().is_none());
    }

    #[test]
    fn test_range_keys_need_pebblev2() {
        let mut buf = Vec::new();
        let mut w = Writer::new(&mut buf, WriterOptions::default().table_format(TableFormat::Pebblev1)).unwrap();
        let err = w.range_key_set(b"a", b"b", b"", b"v", 1).unwrap_err();
        assert!(matches!(err, Error::NotSupported(_)));
    }

    #[test]
    fn test_filter_block_written() {
        let mut buf = Vec::new();
        let policy = Arc::new(BloomFilterPolicy::new(10));
        let mut w = Writer::new(&mut buf, WriterOptions::default().filter_policy(policy.clone())).unwrap();
        for i in 0..50 {
            w.set(format!("key{i:02}").as_bytes(), b"v").unwrap();
        }
        let meta = w.finish().unwrap();
        assert!(meta.properties.filter_size > 0);
        assert_eq!(meta.properties.filter_policy_name, policy.name());

        let reader = Reader::open(Arc::new(MemReadable::new(buf)), ReaderOptions::default().filter(policy)).unwrap();
        assert!(reader.layout().unwrap().filter.is_some());
    }

    #[test]
    fn test_empty_table() {
        let mut buf = Vec::new();
        let w = Writer::new(&mut buf, WriterOptions::default()).unwrap();
        let meta = w.finish().unwrap();
        assert_eq!(meta.smallest_seq_num, 0);
        assert_eq!(meta.properties.num_data_blocks, 0);
        assert!(scan(&open(buf)).is_empty());
    }

    #[test]
    fn test_write_to_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("000001.sst");
        let mut w = Writer::create(&path, WriterOptions::default().block_size(128)).unwrap();
        for i in 0..200 {
            w.set(format!("key{i:03}").as_bytes(), format!("value{i}").as_bytes()).unwrap();
        }
        let meta = w.finish().unwrap();
        assert_eq!(std::fs::metadata(&path).unwrap().len(), meta.size);

        let reader = Reader::open(Arc::new(FileReadable::open(&path).unwrap()), ReaderOptions::default()).unwrap();
        let got = scan(&reader);
        assert_eq!(got.len(), 200);
        assert_eq!(got[42].1, b"value42");
    }

    #[test]
    fn test_should_flush() {
        // Empty blocks never flush.
        assert!(!should_flush(10, 10, 16, 5000, 0, 4096, 3687));
        assert!(should_flush(10, 10, 16, 4096, 10, 4096, 3687));
        assert!(!should_flush(10, 10, 16, 3000, 10, 4096, 3687));
        assert!(should_flush(300, 300, 16, 3700, 10, 4096, 3687));
        assert!(!should_flush(10, 10, 16, 3700, 10, 4096, 3687));
    }

    #[test]
    fn test_separator_and_successor() {
        let cmp = BytewiseComparer;
        let prev = ikey(b"abcdef", 1, InternalKeyKind::Set);
        let sep = separator(&cmp, &prev, ikey(b"abzz", 9, InternalKeyKind::Set).as_ref());
        assert_eq!(sep, ikey(b"abd", SEQ_NUM_MAX, InternalKeyKind::Separator));

        // Same user key on both sides keeps the key as is.
        let sep = separator(&cmp, &prev, ikey(b"abcdef", 0, InternalKeyKind::Set).as_ref());
        assert_eq!(sep, prev);

        assert_eq!(successor(&cmp, &prev), ikey(b"b", SEQ_NUM_MAX, InternalKeyKind::Separator));
        let ff = ikey(&[0xff, 0xff], 1, InternalKeyKind::Set);
        assert_eq!(successor(&cmp, &ff), ff);
    }
}
