//! Value blocks: values stored out of line, referenced from data blocks by handle.
//!
//! In formats with a value prefix every SET value starts with one byte:
//!
//! ```text
//! +---------------+--------------------+-----------+--------------------+
//! | value-kind 2b | SET-same-prefix 1b | unused 2b | short-attribute 3b |
//! +---------------+--------------------+-----------+--------------------+
//! ```
//!
//! An in-place value follows the prefix directly. Otherwise a [`ValueHandle`]
//! `(value_len, block_num, offset_in_block)` follows, each field a uvarint.
//!
//! A value block is a bare concatenation of values, compressed and checksummed like
//! any other block. The value index block maps block numbers to file locations
//! with fixed-width little-endian tuples:
//!
//! ```text
//! [block_num: w1] [block_offset: w2] [block_length: w3] ...
//! ```
//!
//! The widths are the smallest that fit the largest value of each field and are
//! recorded with the index block's handle in the metaindex.

use crate::config::{ChecksumType, CompressionType};
use crate::error::{Error, Result};
use crate::sstable::coding::{
    decode_uvarint32, len_little_endian, little_endian_get, little_endian_put, put_uvarint, MAX_VARINT_LEN32,
};
use crate::sstable::compression::{make_physical_block, PhysicalBlock, NO_COMPRESSION_BLOCK_TYPE};
use crate::sstable::checksum::block_checksum;
use crate::sstable::footer::BlockHandle;
use crate::sstable::iter::IterStats;
use bytes::Bytes;
use std::cell::RefCell;
use std::fmt;
use std::io::Write;
use std::ops::Deref;
use std::sync::atomic::Ordering;
use std::sync::Arc;

/// Mask of the two value-kind bits.
pub const VALUE_KIND_MASK: u8 = 0xc0;
/// Value kind of a value handle.
pub const VALUE_KIND_IS_VALUE_HANDLE: u8 = 0x80;
/// Value kind of an in-place value.
pub const VALUE_KIND_IS_IN_PLACE_VALUE: u8 = 0x00;
/// The key is a SET sharing the prefix of the immediately preceding SET.
pub const SET_HAS_SAME_KEY_PREFIX_MASK: u8 = 0x20;
/// Mask of the user-defined short attribute.
pub const SHORT_ATTRIBUTE_MASK: u8 = 0x07;

/// Maximum encoded length of a value handle, prefix byte included.
pub const VALUE_HANDLE_MAX_LEN: usize = 3 * MAX_VARINT_LEN32 + 1;

/// Value prefix for a value stored in a value block.
pub fn make_prefix_for_value_handle(set_has_same_prefix: bool, attribute: u8) -> u8 {
    let mut prefix = VALUE_KIND_IS_VALUE_HANDLE | (attribute & SHORT_ATTRIBUTE_MASK);
    if set_has_same_prefix {
        prefix |= SET_HAS_SAME_KEY_PREFIX_MASK;
    }
    prefix
}

/// Value prefix for a value stored in place.
pub fn make_prefix_for_in_place_value(set_has_same_prefix: bool) -> u8 {
    let mut prefix = VALUE_KIND_IS_IN_PLACE_VALUE;
    if set_has_same_prefix {
        prefix |= SET_HAS_SAME_KEY_PREFIX_MASK;
    }
    prefix
}

/// True if the prefix introduces a value handle.
pub fn is_value_handle(prefix: u8) -> bool {
    prefix & VALUE_KIND_MASK == VALUE_KIND_IS_VALUE_HANDLE
}

/// Short attribute of a value-handle prefix.
pub fn short_attribute(prefix: u8) -> u8 {
    prefix & SHORT_ATTRIBUTE_MASK
}

/// True if the prefix records that the SET shares its key prefix with the
/// preceding SET.
pub fn set_has_same_prefix(prefix: u8) -> bool {
    prefix & SET_HAS_SAME_KEY_PREFIX_MASK == SET_HAS_SAME_KEY_PREFIX_MASK
}

/// Pointer to a value inside a value block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ValueHandle {
    /// Length of the value.
    pub value_len: u32,
    /// Zero-based number of the value block.
    pub block_num: u32,
    /// Offset of the value within the uncompressed block.
    pub offset_in_block: u32,
}

impl ValueHandle {
    /// Appends the encoding, without prefix byte.
    pub fn encode_into(&self, buf: &mut Vec<u8>) {
        put_uvarint(buf, u64::from(self.value_len));
        put_uvarint(buf, u64::from(self.block_num));
        put_uvarint(buf, u64::from(self.offset_in_block));
    }

    /// Decodes a handle, without prefix byte.
    pub fn decode(src: &[u8]) -> Option<Self> {
        let (value_len, a) = decode_uvarint32(src)?;
        let (block_num, b) = decode_uvarint32(&src[a..])?;
        let (offset_in_block, _) = decode_uvarint32(&src[a + b..])?;
        Some(Self { value_len, block_num, offset_in_block })
    }
}

/// Metaindex entry locating the value index block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ValueBlocksIndexHandle {
    /// Location of the value index block.
    pub handle: BlockHandle,
    /// Width of the block number field.
    pub block_num_byte_len: u8,
    /// Width of the block offset field.
    pub block_offset_byte_len: u8,
    /// Width of the block length field.
    pub block_length_byte_len: u8,
}

impl ValueBlocksIndexHandle {
    /// Encodes the handle followed by the three widths.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = self.handle.encode();
        buf.extend_from_slice(&[self.block_num_byte_len, self.block_offset_byte_len, self.block_length_byte_len]);
        buf
    }

    /// Decodes a metaindex value. Trailing bytes are an error.
    pub fn decode(src: &[u8]) -> Result<Self> {
        match BlockHandle::decode(src) {
            Some((handle, n)) if src.len() == n + 3 => Ok(Self {
                handle,
                block_num_byte_len: src[n],
                block_offset_byte_len: src[n + 1],
                block_length_byte_len: src[n + 2],
            }),
            _ => Err(Error::corruption(format!("invalid value blocks index handle {src:02x?}"))),
        }
    }

    pub(crate) fn entry_len(&self) -> usize {
        usize::from(self.block_num_byte_len)
            + usize::from(self.block_offset_byte_len)
            + usize::from(self.block_length_byte_len)
    }
}

/// Value block statistics gathered by [`ValueBlockWriter::finish`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ValueBlocksStats {
    /// Number of value blocks.
    pub num_value_blocks: u64,
    /// Number of values stored in value blocks.
    pub num_values_in_value_blocks: u64,
    /// Bytes of value blocks and the value index block, trailers included.
    pub value_blocks_and_index_size: u64,
}

struct FinishedBlock {
    block: PhysicalBlock,
    handle: BlockHandle,
}

/// Accumulates values into value blocks while a table is written.
///
/// Blocks are held in memory until [`finish`](Self::finish), since their file
/// offset is only known once the data and index blocks are written.
pub struct ValueBlockWriter {
    block_size: usize,
    block_size_threshold: usize,
    compression: CompressionType,
    checksum: ChecksumType,
    buf: Vec<u8>,
    blocks: Vec<FinishedBlock>,
    total_block_bytes: u64,
    num_values: u64,
}

impl fmt::Debug for ValueBlockWriter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ValueBlockWriter")
            .field("block_size", &self.block_size)
            .field("blocks", &self.blocks.len())
            .field("buffered", &self.buf.len())
            .field("num_values", &self.num_values)
            .finish()
    }
}

impl ValueBlockWriter {
    /// Creates a writer. A block is flushed once it reaches `block_size`, or once it
    /// exceeds `block_size_threshold` and the next value would overflow it.
    pub fn new(
        block_size: usize,
        block_size_threshold: usize,
        compression: CompressionType,
        checksum: ChecksumType,
    ) -> Self {
        Self {
            block_size,
            block_size_threshold,
            compression,
            checksum,
            buf: Vec::new(),
            blocks: Vec::new(),
            total_block_bytes: 0,
            num_values: 0,
        }
    }

    /// Appends a value and returns its handle.
    pub fn add_value(&mut self, v: &[u8]) -> Result<ValueHandle> {
        if v.is_empty() {
            return Err(Error::invalid_argument("cannot write empty value to value block"));
        }
        let value_len = u32::try_from(v.len())
            .map_err(|_| Error::invalid_argument(format!("value of {} bytes too large", v.len())))?;
        self.num_values += 1;
        let block_len = self.buf.len();
        if block_len >= self.block_size
            || (block_len > self.block_size_threshold && block_len + v.len() > self.block_size)
        {
            self.compress_and_flush()?;
        }
        let vh = ValueHandle {
            value_len,
            block_num: self.blocks.len() as u32,
            offset_in_block: self.buf.len() as u32,
        };
        self.buf.extend_from_slice(v);
        Ok(vh)
    }

    fn compress_and_flush(&mut self) -> Result<()> {
        let block = make_physical_block(&self.buf, self.compression, self.checksum)?;
        let handle = BlockHandle::new(self.total_block_bytes, block.handle_len());
        self.total_block_bytes += block.bytes.len() as u64;
        self.blocks.push(FinishedBlock { block, handle });
        self.buf.clear();
        Ok(())
    }

    /// Bytes of finished blocks plus the pending block.
    pub fn estimated_size(&self) -> u64 {
        self.total_block_bytes + self.buf.len() as u64
    }

    /// Writes the value blocks and the value index block at `file_offset`.
    ///
    /// Returns `None` for the handle when no value was added.
    pub fn finish<W: Write>(
        &mut self,
        sink: &mut W,
        file_offset: u64,
    ) -> Result<(Option<ValueBlocksIndexHandle>, ValueBlocksStats)> {
        if !self.buf.is_empty() {
            self.compress_and_flush()?;
        }
        let n = self.blocks.len();
        if n == 0 {
            return Ok((None, ValueBlocksStats::default()));
        }
        let mut largest_offset = 0;
        let mut largest_length = 0;
        for b in &mut self.blocks {
            sink.write_all(&b.block.bytes)?;
            b.handle.offset += file_offset;
            largest_offset = b.handle.offset;
            largest_length = largest_length.max(b.handle.length);
        }

        let mut vbih = ValueBlocksIndexHandle {
            handle: BlockHandle::new(file_offset + self.total_block_bytes, 0),
            block_num_byte_len: len_little_endian(n as u64 - 1) as u8,
            block_offset_byte_len: len_little_endian(largest_offset) as u8,
            block_length_byte_len: len_little_endian(largest_length) as u8,
        };
        let index = self.encode_index(&vbih);
        vbih.handle.length = index.len() as u64;
        sink.write_all(&index)?;
        sink.write_all(&[NO_COMPRESSION_BLOCK_TYPE])?;
        sink.write_all(&block_checksum(self.checksum, &index, NO_COMPRESSION_BLOCK_TYPE).to_le_bytes())?;

        let stats = ValueBlocksStats {
            num_value_blocks: n as u64,
            num_values_in_value_blocks: self.num_values,
            value_blocks_and_index_size: self.total_block_bytes
                + vbih.handle.length
                + super::BLOCK_TRAILER_LEN as u64,
        };
        Ok((Some(vbih), stats))
    }

    fn encode_index(&self, vbih: &ValueBlocksIndexHandle) -> Vec<u8> {
        let (wn, wo, wl) = (
            usize::from(vbih.block_num_byte_len),
            usize::from(vbih.block_offset_byte_len),
            usize::from(vbih.block_length_byte_len),
        );
        let mut index = vec![0u8; vbih.entry_len() * self.blocks.len()];
        for (i, (b, entry)) in self.blocks.iter().zip(index.chunks_exact_mut(vbih.entry_len())).enumerate() {
            little_endian_put(i as u64, &mut entry[..wn], wn);
            little_endian_put(b.handle.offset, &mut entry[wn..wn + wo], wo);
            little_endian_put(b.handle.length, &mut entry[wn + wo..], wl);
        }
        index
    }
}

/// Source of value blocks for a [`ValueBlockReader`].
pub trait BlockProvider: Send + Sync {
    /// Reads, verifies and decompresses the block at `handle`.
    fn read_block_for_vbr(&self, handle: BlockHandle, stats: Option<&IterStats>) -> Result<Bytes>;
}

#[derive(Default)]
struct ValueBlockReaderState {
    index_block: Option<Bytes>,
    // Most recently used value block.
    value_block: Option<(u32, Bytes)>,
    // Handle last counted in the separated value stats.
    last_counted: Option<ValueHandle>,
}

/// Resolves value handles to values.
///
/// The value index block is loaded on first use. The most recently used value
/// block is retained, so consecutive values from one block cost one read.
pub struct ValueBlockReader {
    provider: Arc<dyn BlockProvider>,
    vbih: ValueBlocksIndexHandle,
    stats: Option<Arc<IterStats>>,
    state: RefCell<ValueBlockReaderState>,
}

impl fmt::Debug for ValueBlockReader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.borrow();
        f.debug_struct("ValueBlockReader")
            .field("vbih", &self.vbih)
            .field("index_loaded", &state.index_block.is_some())
            .field("value_block", &state.value_block.as_ref().map(|(n, _)| *n))
            .finish()
    }
}

impl ValueBlockReader {
    /// Creates a reader for the value blocks indexed by `vbih`.
    pub fn new(
        provider: Arc<dyn BlockProvider>,
        vbih: ValueBlocksIndexHandle,
        stats: Option<Arc<IterStats>>,
    ) -> Self {
        Self { provider, vbih, stats, state: RefCell::new(ValueBlockReaderState::default()) }
    }

    /// Wraps a stored value (prefix byte included) whose prefix is a value handle.
    pub fn lazy_value_for_handle<'a>(&'a self, val: &'a [u8]) -> LazyValue<'a> {
        let decoded = val.split_first().and_then(|(&prefix, rest)| Some((prefix, ValueHandle::decode(rest)?)));
        let Some((prefix, vh)) = decoded else {
            return LazyValue { repr: Repr::Corrupt(val) };
        };
        if let Some(stats) = &self.stats {
            let mut state = self.state.borrow_mut();
            if state.last_counted != Some(vh) {
                state.last_counted = Some(vh);
                stats.separated_point_values.fetch_add(1, Ordering::Relaxed);
                stats.separated_value_bytes.fetch_add(u64::from(vh.value_len), Ordering::Relaxed);
            }
        }
        LazyValue { repr: Repr::Handle { prefix, vh, reader: self } }
    }

    /// Releases the retained blocks.
    pub fn close(&self) {
        *self.state.borrow_mut() = ValueBlockReaderState::default();
    }

    /// Fetches the value a handle points to, as a slice of the cached value block.
    pub fn fetch(&self, vh: &ValueHandle) -> Result<Bytes> {
        let mut state = self.state.borrow_mut();
        let index = match &state.index_block {
            Some(index) => index.clone(),
            None => {
                let index = self.provider.read_block_for_vbr(self.vbih.handle, self.stats.as_deref())?;
                state.index_block = Some(index.clone());
                index
            }
        };
        let block = match &state.value_block {
            Some((num, block)) if *num == vh.block_num => block.clone(),
            _ => {
                let bh = self.block_handle(&index, vh.block_num)?;
                let block = self.provider.read_block_for_vbr(bh, self.stats.as_deref())?;
                state.value_block = Some((vh.block_num, block.clone()));
                block
            }
        };
        if let Some(stats) = &self.stats {
            stats.value_bytes_fetched.fetch_add(u64::from(vh.value_len), Ordering::Relaxed);
        }
        let start = vh.offset_in_block as usize;
        let end = start + vh.value_len as usize;
        if end > block.len() {
            return Err(Error::corruption(format!(
                "value handle ({}, {}) out of range of value block {} of length {}",
                vh.offset_in_block,
                vh.value_len,
                vh.block_num,
                block.len()
            )));
        }
        Ok(block.slice(start..end))
    }

    fn block_handle(&self, index: &[u8], block_num: u32) -> Result<BlockHandle> {
        let entry_len = self.vbih.entry_len();
        let offset = entry_len * block_num as usize;
        let entry = index.get(offset..offset + entry_len).ok_or_else(|| {
            Error::corruption(format!(
                "cannot read at offset {} and length {} from block of length {}",
                offset,
                entry_len,
                index.len()
            ))
        })?;
        let (wn, wo, wl) = (
            usize::from(self.vbih.block_num_byte_len),
            usize::from(self.vbih.block_offset_byte_len),
            usize::from(self.vbih.block_length_byte_len),
        );
        let found = little_endian_get(entry, wn);
        if found != u64::from(block_num) {
            return Err(Error::corruption(format!("expected block num {block_num} but found {found}")));
        }
        let offset = little_endian_get(&entry[wn..], wo);
        let length = little_endian_get(&entry[wn + wo..], wl);
        Ok(BlockHandle::new(offset, length))
    }
}

enum Repr<'a> {
    InPlace(&'a [u8]),
    Handle { prefix: u8, vh: ValueHandle, reader: &'a ValueBlockReader },
    Corrupt(&'a [u8]),
}

/// A value that may live in a value block.
///
/// The length and short attribute are available without fetching; [`value`]
/// fetches on demand.
///
/// [`value`]: LazyValue::value
pub struct LazyValue<'a> {
    repr: Repr<'a>,
}

impl fmt::Debug for LazyValue<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.repr {
            Repr::InPlace(v) => f.debug_tuple("InPlace").field(v).finish(),
            Repr::Handle { vh, .. } => f.debug_tuple("Handle").field(vh).finish(),
            Repr::Corrupt(v) => f.debug_tuple("Corrupt").field(v).finish(),
        }
    }
}

impl<'a> LazyValue<'a> {
    /// A value stored in place.
    pub fn in_place(value: &'a [u8]) -> Self {
        Self { repr: Repr::InPlace(value) }
    }

    /// Length of the value.
    pub fn len(&self) -> usize {
        match &self.repr {
            Repr::InPlace(v) => v.len(),
            Repr::Handle { vh, .. } => vh.value_len as usize,
            Repr::Corrupt(_) => 0,
        }
    }

    /// True for an empty value.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// True unless the value lives in a value block.
    pub fn is_in_place(&self) -> bool {
        matches!(self.repr, Repr::InPlace(_))
    }

    /// Short attribute of a value stored in a value block.
    pub fn short_attribute(&self) -> Option<u8> {
        match &self.repr {
            Repr::Handle { prefix, .. } => Some(short_attribute(*prefix)),
            _ => None,
        }
    }

    /// The value handle, for values stored in a value block.
    pub fn handle(&self) -> Option<ValueHandle> {
        match &self.repr {
            Repr::Handle { vh, .. } => Some(*vh),
            _ => None,
        }
    }

    /// Fetches the value.
    pub fn value(&self) -> Result<ValueBytes<'a>> {
        match self.repr {
            Repr::InPlace(v) => Ok(ValueBytes::Borrowed(v)),
            Repr::Handle { vh, reader, .. } => reader.fetch(&vh).map(ValueBytes::Shared),
            Repr::Corrupt(v) => Err(Error::corruption(format!("invalid value handle {v:02x?}"))),
        }
    }

    /// Fetches and copies the value.
    pub fn to_vec(&self) -> Result<Vec<u8>> {
        self.value().map(|v| v.to_vec())
    }
}

/// Bytes of a fetched value.
#[derive(Debug, Clone)]
pub enum ValueBytes<'a> {
    /// Borrowed from the data block.
    Borrowed(&'a [u8]),
    /// A slice of a value block.
    Shared(Bytes),
}

impl Deref for ValueBytes<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        match self {
            ValueBytes::Borrowed(v) => v,
            ValueBytes::Shared(b) => b,
        }
    }
}

impl AsRef<[u8]> for ValueBytes<'_> {
    fn as_ref(&self) -> &[u8] {
        self
    }
}

impl PartialEq<[u8]> for ValueBytes<'_> {
    fn eq(&self, other: &[u8]) -> bool {
        self.as_ref() == other
    }
}

impl PartialEq<&[u8]> for ValueBytes<'_> {
    fn eq(&self, other: &&[u8]) -> bool {
        self.as_ref() == *other
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sstable::checksum::verify_block;
    use crate::sstable::compression::decompress_block;
    use parking_lot::Mutex;
    use proptest::prelude::*;

    // Serves blocks out of an in-memory file.
    struct MemProvider {
        file: Vec<u8>,
        reads: Mutex<usize>,
    }

    impl BlockProvider for MemProvider {
        fn read_block_for_vbr(&self, handle: BlockHandle, _stats: Option<&IterStats>) -> Result<Bytes> {
            *self.reads.lock() += 1;
            let start = handle.offset as usize;
            let end = handle.end_offset() as usize;
            let block = &self.file[start..end];
            verify_block(ChecksumType::Crc32c, block, 0, handle.offset)?;
            let n = block.len() - crate::sstable::BLOCK_TRAILER_LEN;
            match decompress_block(block[n], &block[..n])? {
                Some(v) => Ok(Bytes::from(v)),
                None => Ok(Bytes::copy_from_slice(&block[..n])),
            }
        }
    }

    fn write_values(values: &[Vec<u8>], block_size: usize, prefix_len: usize) -> (Vec<ValueHandle>, Arc<MemProvider>, ValueBlocksIndexHandle, ValueBlocksStats) {
        let mut w = ValueBlockWriter::new(block_size, block_size * 9 / 10, CompressionType::default(), ChecksumType::Crc32c);
        let handles: Vec<_> = values.iter().map(|v| w.add_value(v).unwrap()).collect();
        let mut file = vec![0xeeu8; prefix_len];
        let (vbih, stats) = w.finish(&mut file, prefix_len as u64).unwrap();
        let provider = Arc::new(MemProvider { file, reads: Mutex::new(0) });
        (handles, provider, vbih.unwrap(), stats)
    }

    fn stored(prefix: u8, vh: &ValueHandle) -> Vec<u8> {
        let mut buf = vec![prefix];
        vh.encode_into(&mut buf);
        buf
    }

    #[test]
    fn test_value_prefix_bits() {
        let p = make_prefix_for_value_handle(true, 5);
        assert!(is_value_handle(p));
        assert!(set_has_same_prefix(p));
        assert_eq!(short_attribute(p), 5);

        let p = make_prefix_for_in_place_value(false);
        assert!(!is_value_handle(p));
        assert!(!set_has_same_prefix(p));
        assert_eq!(p & VALUE_KIND_MASK, VALUE_KIND_IS_IN_PLACE_VALUE);
    }

    #[test]
    fn test_value_handle_encoding() {
        let vh = ValueHandle { value_len: 300, block_num: 2, offset_in_block: 70000 };
        let mut buf = Vec::new();
        vh.encode_into(&mut buf);
        assert!(buf.len() < VALUE_HANDLE_MAX_LEN);
        assert_eq!(ValueHandle::decode(&buf), Some(vh));
        assert_eq!(ValueHandle::decode(&buf[..buf.len() - 1]), None);
    }

    #[test]
    fn test_index_handle_encoding() {
        let vbih = ValueBlocksIndexHandle {
            handle: BlockHandle::new(1000, 24),
            block_num_byte_len: 1,
            block_offset_byte_len: 2,
            block_length_byte_len: 1,
        };
        let encoded = vbih.encode();
        assert_eq!(ValueBlocksIndexHandle::decode(&encoded).unwrap(), vbih);

        let mut long = encoded.clone();
        long.push(0);
        assert!(ValueBlocksIndexHandle::decode(&long).is_err());
        assert!(ValueBlocksIndexHandle::decode(&encoded[..encoded.len() - 1]).is_err());
    }

    #[test]
    fn test_widths_follow_largest_values() {
        let values: Vec<Vec<u8>> = (0..40u8).map(|i| vec![i; 100]).collect();
        let (_, _, vbih, stats) = write_values(&values, 256, 70_000);
        assert!(stats.num_value_blocks > 1);
        assert_eq!(stats.num_values_in_value_blocks, 40);
        assert_eq!(vbih.block_num_byte_len, 1);
        // Offsets beyond 65535 need three bytes.
        assert_eq!(vbih.block_offset_byte_len, 3);
        assert_eq!(
            vbih.handle.length,
            stats.num_value_blocks * u64::from(vbih.block_num_byte_len + vbih.block_offset_byte_len + vbih.block_length_byte_len)
        );
    }

    #[test]
    fn test_single_block_uses_zero_width_block_num() {
        let (_, provider, vbih, stats) = write_values(&[b"hello".to_vec()], 4096, 0);
        assert_eq!(stats.num_value_blocks, 1);
        assert_eq!(vbih.block_num_byte_len, 0);
        assert_eq!(stats.value_blocks_and_index_size, provider.file.len() as u64);
    }

    #[test]
    fn test_empty_writer() {
        let mut w = ValueBlockWriter::new(4096, 3686, CompressionType::None, ChecksumType::Crc32c);
        let mut sink = Vec::new();
        let (vbih, stats) = w.finish(&mut sink, 0).unwrap();
        assert!(vbih.is_none());
        assert_eq!(stats, ValueBlocksStats::default());
        assert!(sink.is_empty());
        assert!(w.add_value(b"").is_err());
    }

    #[test]
    fn test_lazy_value_len_without_fetch() {
        let values = vec![b"first value".to_vec(), vec![7u8; 500]];
        let (handles, provider, vbih, _) = write_values(&values, 4096, 16);
        let stats = Arc::new(IterStats::default());
        let reader = ValueBlockReader::new(provider.clone(), vbih, Some(stats.clone()));

        let raw = stored(make_prefix_for_value_handle(true, 3), &handles[1]);
        let lv = reader.lazy_value_for_handle(&raw);
        assert_eq!(lv.len(), 500);
        assert_eq!(lv.short_attribute(), Some(3));
        assert!(!lv.is_in_place());
        assert_eq!(*provider.reads.lock(), 0);

        assert_eq!(lv.value().unwrap().as_ref(), &values[1][..]);
        // Index block and one value block.
        assert_eq!(*provider.reads.lock(), 2);
        let raw0 = stored(make_prefix_for_value_handle(false, 0), &handles[0]);
        assert_eq!(reader.lazy_value_for_handle(&raw0).to_vec().unwrap(), values[0]);
        assert_eq!(*provider.reads.lock(), 2);

        assert_eq!(stats.separated_point_values.load(Ordering::Relaxed), 2);
        assert_eq!(stats.value_bytes_fetched.load(Ordering::Relaxed), 511);
    }

    #[test]
    fn test_separated_stats_count_each_handle_once() {
        let values = vec![b"first value".to_vec(), vec![7u8; 500]];
        let (handles, provider, vbih, _) = write_values(&values, 4096, 16);
        let stats = Arc::new(IterStats::default());
        let reader = ValueBlockReader::new(provider, vbih, Some(stats.clone()));

        let raw = stored(make_prefix_for_value_handle(true, 0), &handles[1]);
        for _ in 0..3 {
            assert_eq!(reader.lazy_value_for_handle(&raw).len(), 500);
        }
        assert_eq!(stats.separated_point_values.load(Ordering::Relaxed), 1);
        assert_eq!(stats.separated_value_bytes.load(Ordering::Relaxed), 500);

        let raw0 = stored(make_prefix_for_value_handle(false, 0), &handles[0]);
        let _ = reader.lazy_value_for_handle(&raw0);
        let _ = reader.lazy_value_for_handle(&raw0);
        assert_eq!(stats.separated_point_values.load(Ordering::Relaxed), 2);
        assert_eq!(stats.separated_value_bytes.load(Ordering::Relaxed), 511);
    }

    #[test]
    fn test_corrupt_handles() {
        let (_, provider, vbih, _) = write_values(&[b"abc".to_vec()], 4096, 0);
        let reader = ValueBlockReader::new(provider, vbih, None);

        let lv = reader.lazy_value_for_handle(&[0x80, 0x80]);
        assert!(lv.value().unwrap_err().is_corruption());

        let bad_block = ValueHandle { value_len: 3, block_num: 4, offset_in_block: 0 };
        let raw = stored(0x80, &bad_block);
        assert!(reader.lazy_value_for_handle(&raw).value().unwrap_err().is_corruption());

        let past_end = ValueHandle { value_len: 10, block_num: 0, offset_in_block: 0 };
        let raw = stored(0x80, &past_end);
        assert!(reader.lazy_value_for_handle(&raw).value().unwrap_err().is_corruption());
    }

    proptest! {
        #[test]
        fn prop_value_indirection_round_trip(
            values in prop::collection::vec(prop::collection::vec(any::<u8>(), 1..600), 1..80),
            block_size in 64usize..2048,
        ) {
            let (handles, provider, vbih, stats) = write_values(&values, block_size, 100);
            prop_assert_eq!(stats.num_values_in_value_blocks, values.len() as u64);
            let reader = ValueBlockReader::new(provider, vbih, None);
            for (v, vh) in values.iter().zip(&handles) {
                let raw = stored(make_prefix_for_value_handle(false, 0), vh);
                let lv = reader.lazy_value_for_handle(&raw);
                prop_assert_eq!(lv.len(), v.len());
                prop_assert_eq!(lv.to_vec().unwrap(), v.clone());
            }
            // Random access order also resolves.
            for (v, vh) in values.iter().zip(&handles).rev() {
                let raw = stored(make_prefix_for_value_handle(false, 0), vh);
                prop_assert_eq!(reader.lazy_value_for_handle(&raw).to_vec().unwrap(), v.clone());
            }
        }
    }
}
