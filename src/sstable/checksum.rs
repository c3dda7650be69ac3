//! Block trailer checksums.
//!
//! The checksum covers the stored (possibly compressed) block bytes followed by the
//! one-byte compression type.

use crate::config::ChecksumType;
use crate::error::{Error, Result};
use crate::sstable::coding::read_u32_le;
use xxhash_rust::xxh64::Xxh64;

const CRC_MASK_DELTA: u32 = 0xa282_ead8;

/// Masks a CRC so that a CRC over data that embeds CRCs stays well distributed.
pub fn mask_crc(crc: u32) -> u32 {
    ((crc >> 15) | (crc << 17)).wrapping_add(CRC_MASK_DELTA)
}

/// Inverse of [`mask_crc`].
pub fn unmask_crc(masked: u32) -> u32 {
    let rot = masked.wrapping_sub(CRC_MASK_DELTA);
    (rot >> 17) | (rot << 15)
}

/// Checksum of `data` followed by `block_type`.
pub fn block_checksum(checksum: ChecksumType, data: &[u8], block_type: u8) -> u32 {
    match checksum {
        ChecksumType::Crc32c => mask_crc(crc32c::crc32c_append(crc32c::crc32c(data), &[block_type])),
        ChecksumType::XxHash64 => {
            let mut h = Xxh64::new(0);
            h.update(data);
            h.update(&[block_type]);
            h.digest() as u32
        }
    }
}

/// Verifies the trailer of a physical block (`data || type || checksum`).
///
/// `offset` and `file_num` only feed the error.
pub fn verify_block(checksum: ChecksumType, block: &[u8], file_num: u64, offset: u64) -> Result<()> {
    let n = block
        .len()
        .checked_sub(super::BLOCK_TRAILER_LEN)
        .ok_or_else(|| Error::corruption(format!("block at {offset} shorter than its trailer")))?;
    let expected = read_u32_le(block, n + 1).unwrap_or_default();
    let actual = block_checksum(checksum, &block[..n], block[n]);
    if expected != actual {
        return Err(Error::ChecksumMismatch { file_num, offset, length: n as u64, expected, actual });
    }
    Ok(())
}
