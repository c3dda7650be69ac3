//! Block compression and the physical block layout.
//!
//! ```text
//! [stored bytes] [type: u8] [checksum: u32 LE]
//! ```
//!
//! Snappy blocks are raw snappy streams. LZ4 blocks are a uvarint decoded length
//! followed by a raw LZ4 block.

use crate::config::{ChecksumType, CompressionType};
use crate::error::{Error, Result};
use crate::sstable::block::MAXIMUM_BLOCK_SIZE;
use crate::sstable::checksum::block_checksum;
#[cfg(feature = "lz4-compression")]
use crate::sstable::coding::{decode_uvarint, put_uvarint};
use std::borrow::Cow;

/// Trailer type byte of an uncompressed block.
pub const NO_COMPRESSION_BLOCK_TYPE: u8 = 0;
const SNAPPY_BLOCK_TYPE: u8 = 1;
const LZ4_BLOCK_TYPE: u8 = 4;

/// Compresses `data`. Returns the trailer type byte and the bytes to store; data
/// that does not shrink by at least an eighth is stored raw.
pub fn compress_block(compression: CompressionType, data: &[u8]) -> Result<(u8, Cow<'_, [u8]>)> {
    let compressed = match compression {
        CompressionType::None => None,
        #[cfg(feature = "snappy")]
        CompressionType::Snappy => {
            let out = snap::raw::Encoder::new()
                .compress_vec(data)
                .map_err(|e| Error::corruption(format!("snappy compression failed: {e}")))?;
            Some((SNAPPY_BLOCK_TYPE, out))
        }
        #[cfg(feature = "lz4-compression")]
        CompressionType::Lz4 => {
            let raw = lz4::block::compress(data, None, false)?;
            let mut out = Vec::with_capacity(raw.len() + 5);
            put_uvarint(&mut out, data.len() as u64);
            out.extend_from_slice(&raw);
            Some((LZ4_BLOCK_TYPE, out))
        }
    };
    match compressed {
        Some((ty, out)) if out.len() < data.len() - data.len() / 8 => Ok((ty, Cow::Owned(out))),
        _ => Ok((NO_COMPRESSION_BLOCK_TYPE, Cow::Borrowed(data))),
    }
}

/// Decompresses stored block bytes. Returns `None` for uncompressed blocks.
pub fn decompress_block(block_type: u8, data: &[u8]) -> Result<Option<Vec<u8>>> {
    match block_type {
        NO_COMPRESSION_BLOCK_TYPE => Ok(None),
        SNAPPY_BLOCK_TYPE => decompress_snappy(data).map(Some),
        LZ4_BLOCK_TYPE => decompress_lz4(data).map(Some),
        other => Err(Error::corruption(format!("unknown block compression type {other}"))),
    }
}

#[cfg(feature = "snappy")]
fn decompress_snappy(data: &[u8]) -> Result<Vec<u8>> {
    let n = snap::raw::decompress_len(data)
        .map_err(|e| Error::corruption(format!("snappy: {e}")))?;
    if n > MAXIMUM_BLOCK_SIZE {
        return Err(Error::corruption(format!("decompressed block length {n} too large")));
    }
    snap::raw::Decoder::new()
        .decompress_vec(data)
        .map_err(|e| Error::corruption(format!("snappy decompression failed: {e}")))
}

#[cfg(not(feature = "snappy"))]
fn decompress_snappy(_data: &[u8]) -> Result<Vec<u8>> {
    Err(Error::not_supported("snappy compression not enabled"))
}

#[cfg(feature = "lz4-compression")]
fn decompress_lz4(data: &[u8]) -> Result<Vec<u8>> {
    let (n, used) = decode_uvarint(data).ok_or_else(|| Error::corruption("lz4: bad decoded length"))?;
    if n as usize > MAXIMUM_BLOCK_SIZE {
        return Err(Error::corruption(format!("decompressed block length {n} too large")));
    }
    let out = lz4::block::decompress(&data[used..], Some(n as i32))
        .map_err(|e| Error::corruption(format!("lz4 decompression failed: {e}")))?;
    if out.len() != n as usize {
        return Err(Error::corruption(format!("lz4: decompressed {} bytes, expected {n}", out.len())));
    }
    Ok(out)
}

#[cfg(not(feature = "lz4-compression"))]
fn decompress_lz4(_data: &[u8]) -> Result<Vec<u8>> {
    Err(Error::not_supported("lz4 compression not enabled"))
}

/// A block ready to be written: stored bytes plus trailer.
#[derive(Debug)]
pub struct PhysicalBlock {
    /// Stored bytes followed by the trailer.
    pub bytes: Vec<u8>,
    /// Whether the stored bytes are compressed.
    pub compressed: bool,
}

impl PhysicalBlock {
    /// Length recorded in the block handle (trailer excluded).
    pub fn handle_len(&self) -> u64 {
        (self.bytes.len() - super::BLOCK_TRAILER_LEN) as u64
    }
}

/// Compresses and checksums an uncompressed block.
pub fn make_physical_block(
    data: &[u8],
    compression: CompressionType,
    checksum: ChecksumType,
) -> Result<PhysicalBlock> {
    let (block_type, stored) = compress_block(compression, data)?;
    let mut bytes = Vec::with_capacity(stored.len() + super::BLOCK_TRAILER_LEN);
    bytes.extend_from_slice(&stored);
    bytes.push(block_type);
    let crc = block_checksum(checksum, &stored, block_type);
    bytes.extend_from_slice(&crc.to_le_bytes());
    Ok(PhysicalBlock { bytes, compressed: block_type != NO_COMPRESSION_BLOCK_TYPE })
}
