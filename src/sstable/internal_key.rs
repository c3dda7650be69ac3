//! # Internal Key Format
//!
//! ```text
//! InternalKey:
//!   [user_key: bytes] [trailer: u64 little-endian]
//!   trailer = (sequence << 8) | kind
//! ```
//!
//! Keys order by user key ascending, then trailer descending, so newer versions
//! of a user key come first.
//!
//! Inside a table the high bit of the kind byte marks a point key as obsolete
//! (shadowed by a newer key in the same table). The bit never leaves the block
//! reading layer.

use crate::comparer::Comparer;
use std::cmp::Ordering;
use std::fmt;

/// A sequence number. Only the low 56 bits are usable.
pub type SeqNum = u64;

/// Largest representable sequence number.
pub const SEQ_NUM_MAX: SeqNum = (1 << 56) - 1;

/// Kind bit flagging an obsolete point key inside a table.
pub const OBSOLETE_BIT: u8 = 0x80;

/// Clears the obsolete bit from a trailer.
pub const TRAILER_OBSOLETE_MASK: u64 = (SEQ_NUM_MAX << 8) | 0x7f;

/// Length of the encoded trailer.
pub const TRAILER_LEN: usize = 8;

/// The kind of an internal key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum InternalKeyKind {
    /// Point tombstone.
    Delete = 0,
    /// Point value.
    Set = 1,
    /// Merge operand.
    Merge = 2,
    /// Log-only record, never stored in tables.
    LogData = 3,
    /// Single-delete tombstone.
    SingleDelete = 7,
    /// Range tombstone.
    RangeDelete = 15,
    /// Synthetic separator written into index blocks.
    Separator = 17,
    /// Set that also deletes earlier versions.
    SetWithDelete = 18,
    /// Range-key delete.
    RangeKeyDelete = 19,
    /// Range-key unset.
    RangeKeyUnset = 20,
    /// Range-key set.
    RangeKeySet = 21,
    /// Ingested table marker.
    IngestSst = 22,
    /// Point tombstone carrying the size of the deleted value.
    DeleteSized = 23,
    /// Unknown or malformed kind.
    Invalid = 255,
}

impl InternalKeyKind {
    /// Converts a kind byte (obsolete bit already stripped) to a kind.
    pub fn from_u8(value: u8) -> Self {
        match value {
            0 => InternalKeyKind::Delete,
            1 => InternalKeyKind::Set,
            2 => InternalKeyKind::Merge,
            3 => InternalKeyKind::LogData,
            7 => InternalKeyKind::SingleDelete,
            15 => InternalKeyKind::RangeDelete,
            17 => InternalKeyKind::Separator,
            18 => InternalKeyKind::SetWithDelete,
            19 => InternalKeyKind::RangeKeyDelete,
            20 => InternalKeyKind::RangeKeyUnset,
            21 => InternalKeyKind::RangeKeySet,
            22 => InternalKeyKind::IngestSst,
            23 => InternalKeyKind::DeleteSized,
            _ => InternalKeyKind::Invalid,
        }
    }

    /// Returns the kind byte.
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// True for the three range-key kinds.
    pub fn is_range_key(self) -> bool {
        matches!(
            self,
            InternalKeyKind::RangeKeySet
                | InternalKeyKind::RangeKeyUnset
                | InternalKeyKind::RangeKeyDelete
        )
    }
}

impl fmt::Display for InternalKeyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            InternalKeyKind::Delete => "DEL",
            InternalKeyKind::Set => "SET",
            InternalKeyKind::Merge => "MERGE",
            InternalKeyKind::LogData => "LOGDATA",
            InternalKeyKind::SingleDelete => "SINGLEDEL",
            InternalKeyKind::RangeDelete => "RANGEDEL",
            InternalKeyKind::Separator => "SEPARATOR",
            InternalKeyKind::SetWithDelete => "SETWITHDEL",
            InternalKeyKind::RangeKeyDelete => "RANGEKEYDEL",
            InternalKeyKind::RangeKeyUnset => "RANGEKEYUNSET",
            InternalKeyKind::RangeKeySet => "RANGEKEYSET",
            InternalKeyKind::IngestSst => "INGESTSST",
            InternalKeyKind::DeleteSized => "DELSIZED",
            InternalKeyKind::Invalid => "INVALID",
        };
        f.write_str(s)
    }
}

/// Packs a sequence number and kind into a trailer.
pub fn make_trailer(seq: SeqNum, kind: InternalKeyKind) -> u64 {
    (seq << 8) | u64::from(kind.as_u8())
}

/// Sequence number of a trailer.
pub fn trailer_seq_num(trailer: u64) -> SeqNum {
    trailer >> 8
}

/// Kind of a trailer, ignoring the obsolete bit.
pub fn trailer_kind(trailer: u64) -> InternalKeyKind {
    InternalKeyKind::from_u8((trailer & 0x7f) as u8)
}

/// Splits an encoded internal key into its user key and trailer.
///
/// Keys shorter than a trailer decode with an invalid kind and the whole input as
/// user key.
pub fn split_encoded(encoded: &[u8]) -> (&[u8], u64) {
    if encoded.len() < TRAILER_LEN {
        return (encoded, u64::from(InternalKeyKind::Invalid.as_u8()));
    }
    let n = encoded.len() - TRAILER_LEN;
    let mut arr = [0u8; 8];
    arr.copy_from_slice(&encoded[n..]);
    (&encoded[..n], u64::from_le_bytes(arr))
}

/// An owned internal key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct InternalKey {
    /// User portion of the key.
    pub user_key: Vec<u8>,
    /// Packed sequence number and kind.
    pub trailer: u64,
}

impl InternalKey {
    /// Creates a new internal key.
    ///
    /// ```rust
    /// use lsmtable::{InternalKey, InternalKeyKind};
    ///
    /// let key = InternalKey::new(b"user_key".to_vec(), 42, InternalKeyKind::Set);
    /// assert_eq!(key.seq_num(), 42);
    /// ```
    pub fn new(user_key: impl Into<Vec<u8>>, seq: SeqNum, kind: InternalKeyKind) -> Self {
        Self { user_key: user_key.into(), trailer: make_trailer(seq, kind) }
    }

    /// Sequence number.
    pub fn seq_num(&self) -> SeqNum {
        trailer_seq_num(self.trailer)
    }

    /// Key kind.
    pub fn kind(&self) -> InternalKeyKind {
        trailer_kind(self.trailer)
    }

    /// Borrowed view of this key.
    pub fn as_ref(&self) -> InternalKeyRef<'_> {
        InternalKeyRef { user_key: &self.user_key, trailer: self.trailer }
    }

    /// Length of the encoded form.
    pub fn encoded_len(&self) -> usize {
        self.user_key.len() + TRAILER_LEN
    }

    /// Appends the encoded form to `buf`.
    pub fn encode_into(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.user_key);
        buf.extend_from_slice(&self.trailer.to_le_bytes());
    }

    /// Encodes the key.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.encoded_len());
        self.encode_into(&mut buf);
        buf
    }

    /// Decodes an encoded key.
    pub fn decode(encoded: &[u8]) -> Self {
        let (user_key, trailer) = split_encoded(encoded);
        Self { user_key: user_key.to_vec(), trailer }
    }
}

impl fmt::Display for InternalKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.as_ref().fmt(f)
    }
}

/// A borrowed internal key, as surfaced by iterators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InternalKeyRef<'a> {
    /// User portion of the key.
    pub user_key: &'a [u8],
    /// Packed sequence number and kind.
    pub trailer: u64,
}

impl<'a> InternalKeyRef<'a> {
    /// Sequence number.
    pub fn seq_num(&self) -> SeqNum {
        trailer_seq_num(self.trailer)
    }

    /// Key kind.
    pub fn kind(&self) -> InternalKeyKind {
        trailer_kind(self.trailer)
    }

    /// Copies the key.
    pub fn to_owned(&self) -> InternalKey {
        InternalKey { user_key: self.user_key.to_vec(), trailer: self.trailer }
    }
}

impl fmt::Display for InternalKeyRef<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{},{}", String::from_utf8_lossy(self.user_key), self.seq_num(), self.kind())
    }
}

/// Compares internal keys: user key ascending, then trailer descending.
pub fn compare_internal(cmp: &dyn Comparer, a: InternalKeyRef<'_>, b: InternalKeyRef<'_>) -> Ordering {
    match cmp.compare(a.user_key, b.user_key) {
        Ordering::Equal => b.trailer.cmp(&a.trailer),
        o => o,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comparer::BytewiseComparer;

    #[test]
    fn test_encode_decode() {
        let key = InternalKey::new(b"hello".to_vec(), 100, InternalKeyKind::Set);
        let encoded = key.encode();
        assert_eq!(encoded.len(), 13);
        let decoded = InternalKey::decode(&encoded);
        assert_eq!(decoded, key);
        assert_eq!(decoded.seq_num(), 100);
        assert_eq!(decoded.kind(), InternalKeyKind::Set);
    }

    #[test]
    fn test_decode_short_key_is_invalid() {
        let key = InternalKey::decode(b"abc");
        assert_eq!(key.user_key, b"abc");
        assert_eq!(key.kind(), InternalKeyKind::Invalid);
    }

    #[test]
    fn test_ordering() {
        let cmp = BytewiseComparer;
        let a1 = InternalKey::new(b"a".to_vec(), 2, InternalKeyKind::Set);
        let a2 = InternalKey::new(b"a".to_vec(), 1, InternalKeyKind::Set);
        let b = InternalKey::new(b"b".to_vec(), 9, InternalKeyKind::Delete);
        assert_eq!(compare_internal(&cmp, a1.as_ref(), a2.as_ref()), Ordering::Less);
        assert_eq!(compare_internal(&cmp, a2.as_ref(), b.as_ref()), Ordering::Less);
        assert_eq!(compare_internal(&cmp, b.as_ref(), b.as_ref()), Ordering::Equal);
    }

    #[test]
    fn test_obsolete_bit_masked() {
        let trailer = make_trailer(5, InternalKeyKind::Set) | u64::from(OBSOLETE_BIT);
        assert_eq!(trailer_kind(trailer), InternalKeyKind::Set);
        assert_eq!(trailer & TRAILER_OBSOLETE_MASK, make_trailer(5, InternalKeyKind::Set));
        assert_eq!(trailer_seq_num(trailer), 5);
    }

    #[test]
    fn test_display() {
        let key = InternalKey::new(b"k".to_vec(), 3, InternalKeyKind::RangeDelete);
        assert_eq!(key.to_string(), "k#3,RANGEDEL");
    }
}
