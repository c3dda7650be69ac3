//! Block handles and the table footer.
//!
//! Two footer shapes exist. The LevelDB footer is 48 bytes:
//!
//! ```text
//! [metaindex handle] [index handle] [zero padding to 40] [magic: 8]
//! ```
//!
//! The RocksDB and Pebble footer is 53 bytes:
//!
//! ```text
//! [checksum type: 1] [metaindex handle] [index handle] [zero padding to 41]
//! [version: u32 LE] [magic: 8]
//! ```
//!
//! Handles are varint encoded, so their length varies and the padding absorbs the
//! difference.

use crate::config::{ChecksumType, TableFormat};
use crate::error::{Error, Result};
use crate::sstable::coding::{decode_uvarint, put_uvarint, read_u32_le, MAX_VARINT_LEN64};
use crate::sstable::readable::Readable;
use std::fmt;

/// Maximum encoded length of a [`BlockHandle`].
pub const BLOCK_HANDLE_MAX_LEN: usize = 2 * MAX_VARINT_LEN64;

/// Length of the LevelDB footer.
pub const LEVELDB_FOOTER_LEN: usize = 48;
/// Length of the RocksDB and Pebble footer.
pub const ROCKSDB_FOOTER_LEN: usize = 1 + 2 * BLOCK_HANDLE_MAX_LEN + 4 + 8;

const MIN_FOOTER_LEN: usize = LEVELDB_FOOTER_LEN;
const MAX_FOOTER_LEN: usize = ROCKSDB_FOOTER_LEN;
const MAGIC_LEN: usize = 8;
const LEVELDB_MAGIC_OFFSET: usize = LEVELDB_FOOTER_LEN - MAGIC_LEN;
const ROCKSDB_MAGIC_OFFSET: usize = ROCKSDB_FOOTER_LEN - MAGIC_LEN;
const ROCKSDB_VERSION_OFFSET: usize = ROCKSDB_MAGIC_OFFSET - 4;

/// Magic trailing a LevelDB table.
pub const LEVELDB_MAGIC: [u8; 8] = [0x57, 0xfb, 0x80, 0x8b, 0x24, 0x75, 0x47, 0xdb];
/// Magic trailing a RocksDB table.
pub const ROCKSDB_MAGIC: [u8; 8] = [0xf7, 0xcf, 0xf4, 0x85, 0xb7, 0x41, 0xe2, 0x88];
/// Magic trailing a Pebble table.
pub const PEBBLE_MAGIC: [u8; 8] = [0xf0, 0x9f, 0xaa, 0xb3, 0xf0, 0x9f, 0xaa, 0xb3];

/// Location of a block within the file. `length` excludes the block trailer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
pub struct BlockHandle {
    /// Offset of the block in the file
    pub offset: u64,
    /// Length of the block, trailer excluded
    pub length: u64,
}

impl BlockHandle {
    /// Create a new BlockHandle
    pub fn new(offset: u64, length: u64) -> Self {
        Self { offset, length }
    }

    /// Appends the varint encoding.
    pub fn encode_into(&self, buf: &mut Vec<u8>) {
        put_uvarint(buf, self.offset);
        put_uvarint(buf, self.length);
    }

    /// Encodes the handle.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(BLOCK_HANDLE_MAX_LEN);
        self.encode_into(&mut buf);
        buf
    }

    /// Decodes a handle from the front of `src`, returning it and the bytes consumed.
    pub fn decode(src: &[u8]) -> Option<(Self, usize)> {
        let (offset, n) = decode_uvarint(src)?;
        let (length, m) = decode_uvarint(&src[n..])?;
        Some((Self { offset, length }, n + m))
    }

    /// Decodes an index entry value: a handle followed by encoded block properties.
    pub fn decode_with_props(src: &[u8]) -> Result<(Self, &[u8])> {
        let (handle, n) =
            Self::decode(src).ok_or_else(|| Error::corruption("invalid block handle in index entry"))?;
        Ok((handle, &src[n..]))
    }

    /// Offset one past the block's trailer.
    pub fn end_offset(&self) -> u64 {
        self.offset + self.length + super::BLOCK_TRAILER_LEN as u64
    }
}

impl fmt::Display for BlockHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.offset, self.length)
    }
}

/// A block handle together with the encoded block properties of the block.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct BlockHandleWithProperties {
    /// Location of the block.
    pub handle: BlockHandle,
    /// Encoded block properties, possibly empty.
    pub props: Vec<u8>,
}

impl BlockHandleWithProperties {
    /// Encodes the handle followed by the properties.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(BLOCK_HANDLE_MAX_LEN + self.props.len());
        self.handle.encode_into(&mut buf);
        buf.extend_from_slice(&self.props);
        buf
    }

    /// Decodes an index entry value.
    pub fn decode(src: &[u8]) -> Result<Self> {
        let (handle, props) = BlockHandle::decode_with_props(src)?;
        Ok(Self { handle, props: props.to_vec() })
    }
}

/// The decoded table footer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Footer {
    /// Table format identified by magic and version.
    pub format: TableFormat,
    /// Checksum algorithm of every block.
    pub checksum: ChecksumType,
    /// Handle of the metaindex block.
    pub metaindex_bh: BlockHandle,
    /// Handle of the index block, or of the top-level index of a two-level index.
    pub index_bh: BlockHandle,
    /// Location of the footer itself.
    pub footer_bh: BlockHandle,
}

impl Footer {
    /// Encodes the footer for the given format.
    pub fn encode(&self) -> Result<Vec<u8>> {
        match self.format {
            TableFormat::LevelDB => {
                if self.checksum != ChecksumType::Crc32c {
                    return Err(Error::invalid_argument("LevelDB tables only support CRC32C checksums"));
                }
                let mut buf = Vec::with_capacity(LEVELDB_FOOTER_LEN);
                self.metaindex_bh.encode_into(&mut buf);
                self.index_bh.encode_into(&mut buf);
                buf.resize(LEVELDB_MAGIC_OFFSET, 0);
                buf.extend_from_slice(&LEVELDB_MAGIC);
                Ok(buf)
            }
            format => {
                let mut buf = Vec::with_capacity(ROCKSDB_FOOTER_LEN);
                buf.push(self.checksum as u8);
                self.metaindex_bh.encode_into(&mut buf);
                self.index_bh.encode_into(&mut buf);
                buf.resize(ROCKSDB_VERSION_OFFSET, 0);
                let (magic, version) = format_magic_and_version(format);
                buf.extend_from_slice(&version.to_le_bytes());
                buf.extend_from_slice(&magic);
                Ok(buf)
            }
        }
    }

    /// Reads and validates the footer at the end of `file`.
    pub fn read(file: &dyn Readable) -> Result<Self> {
        let size = file.size();
        if size < MIN_FOOTER_LEN as u64 {
            return Err(Error::corruption(format!("invalid table (file size is too small: {size})")));
        }
        let n = size.min(MAX_FOOTER_LEN as u64) as usize;
        let off = size - n as u64;
        let mut buf = vec![0u8; n];
        file.read_at(&mut buf, off)?;
        Self::decode(&buf, off, size)
    }

    /// Decodes a footer from the last bytes of a file. `off` is the file offset of
    /// `buf[0]`.
    pub fn decode(buf: &[u8], off: u64, file_size: u64) -> Result<Self> {
        if buf.len() < MIN_FOOTER_LEN {
            return Err(Error::corruption("invalid table (footer too short)"));
        }
        let magic = &buf[buf.len() - MAGIC_LEN..];
        let (format, checksum, handles, footer_off) = if magic == LEVELDB_MAGIC {
            let start = buf.len() - LEVELDB_FOOTER_LEN;
            (TableFormat::LevelDB, ChecksumType::Crc32c, &buf[start..], off + start as u64)
        } else if magic == ROCKSDB_MAGIC || magic == PEBBLE_MAGIC {
            if buf.len() < ROCKSDB_FOOTER_LEN {
                return Err(Error::corruption("invalid table (footer too short)"));
            }
            let start = buf.len() - ROCKSDB_FOOTER_LEN;
            let footer = &buf[start..];
            let version = read_u32_le(footer, ROCKSDB_VERSION_OFFSET).unwrap_or_default();
            let format = parse_table_format(magic, version)?;
            let checksum = ChecksumType::from_u8(footer[0]).ok_or_else(|| {
                Error::corruption(format!("invalid table (unsupported checksum type {})", footer[0]))
            })?;
            (format, checksum, &footer[1..], off + start as u64)
        } else {
            return Err(Error::corruption(format!(
                "invalid table (bad magic number: {})",
                hex(magic)
            )));
        };

        let (metaindex_bh, n) = BlockHandle::decode(handles)
            .filter(|(bh, _)| bh.offset.saturating_add(bh.length) <= file_size)
            .ok_or_else(|| Error::corruption("invalid table (bad metaindex block handle)"))?;
        let (index_bh, _) = BlockHandle::decode(&handles[n..])
            .filter(|(bh, _)| bh.offset.saturating_add(bh.length) <= file_size)
            .ok_or_else(|| Error::corruption("invalid table (bad index block handle)"))?;

        Ok(Self {
            format,
            checksum,
            metaindex_bh,
            index_bh,
            footer_bh: BlockHandle::new(footer_off, file_size - footer_off),
        })
    }
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// Maps a magic and version to a table format.
pub fn parse_table_format(magic: &[u8], version: u32) -> Result<TableFormat> {
    if magic == LEVELDB_MAGIC {
        return Ok(TableFormat::LevelDB);
    }
    let format = if magic == ROCKSDB_MAGIC {
        match version {
            2 => Some(TableFormat::RocksDBv2),
            _ => None,
        }
    } else if magic == PEBBLE_MAGIC {
        match version {
            1 => Some(TableFormat::Pebblev1),
            2 => Some(TableFormat::Pebblev2),
            3 => Some(TableFormat::Pebblev3),
            4 => Some(TableFormat::Pebblev4),
            _ => None,
        }
    } else {
        return Err(Error::corruption(format!("invalid table (bad magic number: {})", hex(magic))));
    };
    format.ok_or_else(|| {
        Error::corruption(format!("invalid table (unsupported format version {version})"))
    })
}

/// Magic and footer version written for a format.
pub fn format_magic_and_version(format: TableFormat) -> ([u8; 8], u32) {
    match format {
        TableFormat::LevelDB => (LEVELDB_MAGIC, 0),
        TableFormat::RocksDBv2 => (ROCKSDB_MAGIC, 2),
        TableFormat::Pebblev1 => (PEBBLE_MAGIC, 1),
        TableFormat::Pebblev2 => (PEBBLE_MAGIC, 2),
        TableFormat::Pebblev3 => (PEBBLE_MAGIC, 3),
        TableFormat::Pebblev4 => (PEBBLE_MAGIC, 4),
    }
}
