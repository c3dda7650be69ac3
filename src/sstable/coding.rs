//! Varint and fixed-width integer coding shared by the block and handle formats.

use bytes::BufMut;

/// Maximum encoded length of a 64-bit varint.
pub const MAX_VARINT_LEN64: usize = 10;

/// Maximum encoded length of a 32-bit varint.
pub const MAX_VARINT_LEN32: usize = 5;

/// Appends `value` as an unsigned LEB128 varint.
pub fn put_uvarint<B: BufMut>(buf: &mut B, mut value: u64) {
    while value >= 0x80 {
        buf.put_u8((value as u8) | 0x80);
        value >>= 7;
    }
    buf.put_u8(value as u8);
}

/// Returns the number of bytes `value` occupies as a varint.
pub fn uvarint_len(mut value: u64) -> usize {
    let mut n = 1;
    while value >= 0x80 {
        value >>= 7;
        n += 1;
    }
    n
}

/// Decodes a varint from the front of `data`.
///
/// Returns the value and the number of bytes consumed, or `None` when the input is
/// truncated or the encoding overflows 64 bits.
pub fn decode_uvarint(data: &[u8]) -> Option<(u64, usize)> {
    let mut value = 0u64;
    let mut shift = 0u32;
    for (i, &byte) in data.iter().enumerate() {
        if i == MAX_VARINT_LEN64 {
            return None;
        }
        if i == MAX_VARINT_LEN64 - 1 && byte > 1 {
            return None;
        }
        value |= u64::from(byte & 0x7f) << shift;
        if byte & 0x80 == 0 {
            return Some((value, i + 1));
        }
        shift += 7;
    }
    None
}

/// Decodes a varint that must fit in 32 bits.
pub fn decode_uvarint32(data: &[u8]) -> Option<(u32, usize)> {
    let (v, n) = decode_uvarint(data)?;
    if n > MAX_VARINT_LEN32 || v > u64::from(u32::MAX) {
        return None;
    }
    Some((v as u32, n))
}

/// Reads a little-endian u32 at `offset`, if in range.
pub fn read_u32_le(data: &[u8], offset: usize) -> Option<u32> {
    let bytes = data.get(offset..offset.checked_add(4)?)?;
    Some(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

/// Reads a little-endian u64 at `offset`, if in range.
pub fn read_u64_le(data: &[u8], offset: usize) -> Option<u64> {
    let bytes = data.get(offset..offset.checked_add(8)?)?;
    let mut arr = [0u8; 8];
    arr.copy_from_slice(bytes);
    Some(u64::from_le_bytes(arr))
}

/// Writes the low `n` bytes of `v` in little-endian order.
pub fn little_endian_put(v: u64, buf: &mut [u8], n: usize) {
    let mut v = v;
    for b in buf.iter_mut().take(n) {
        *b = v as u8;
        v >>= 8;
    }
}

/// Reads an `n`-byte little-endian integer. `n` is at most 8.
pub fn little_endian_get(buf: &[u8], n: usize) -> u64 {
    buf.iter().take(n).enumerate().fold(0u64, |acc, (i, &b)| acc | (u64::from(b) << (8 * i)))
}

/// Minimum number of bytes needed to represent `v` little-endian. Zero needs zero bytes.
pub fn len_little_endian(v: u64) -> usize {
    ((64 - v.leading_zeros() as usize) + 7) / 8
}
