//! Sorted string tables.
//!
//! A table is an immutable file of internal keys in ascending order, compatible
//! with the LevelDB, RocksDB and Pebble table formats.
//!
//! ## File Format
//!
//! ```text
//! [data block 1]
//! ...
//! [data block N]
//! [filter block]            (optional)
//! [index partitions]        (two-level index only)
//! [index block]
//! [range-del block]         (optional)
//! [range-key block]         (optional, Pebble v2+)
//! [value blocks]            (optional, Pebble v3+)
//! [value-index block]       (optional, Pebble v3+)
//! [properties block]
//! [metaindex block]
//! [footer]                  48 bytes (LevelDB) or 53 bytes
//! ```
//!
//! Every block is followed by a 5 byte trailer: a compression type byte and a
//! checksum of the block contents plus that byte.
//!
//! ## Block Format
//!
//! A block is a run of prefix-compressed entries followed by the restart offsets
//! and their count:
//!
//! ```text
//! shared: uvarint | unshared: uvarint | value_len: uvarint | key_suffix | value
//! ...
//! restart[0]: u32 ... restart[n-1]: u32 | n: u32
//! ```
//!
//! Keys are internal keys: the user key followed by an 8 byte little-endian
//! trailer of `seq_num << 8 | kind`.

pub mod block;
pub mod checksum;
pub mod coding;
pub mod compression;
pub mod footer;
pub mod fragment;
pub mod internal_key;
pub mod iter;
pub mod iter_single;
pub mod iter_two_level;
pub mod properties;
pub mod readable;
pub mod reader;
pub mod suffix_rewriter;
pub mod value_block;
pub mod writer;

pub use block::{BlockIter, BlockWriter};
pub use footer::{BlockHandle, BlockHandleWithProperties, Footer};
pub use fragment::{FragmentBlockIter, Span, SpanKey};
pub use internal_key::{InternalKey, InternalKeyKind, InternalKeyRef, SeqNum, SEQ_NUM_MAX};
pub use iter::{EmptyIter, InternalIterator, IterStats, SeekGeFlags, SeekLtFlags};
pub use properties::Properties;
pub use readable::{FileReadable, MemReadable, Readable};
pub use reader::{Layout, Reader};
pub use suffix_rewriter::rewrite_key_suffixes;
pub use value_block::{LazyValue, ValueBytes};
pub use writer::{Writer, WriterMetadata};

/// Length of the trailer following every block.
pub const BLOCK_TRAILER_LEN: usize = 5;

/// Metaindex name of the properties block.
pub const METAINDEX_PROPERTIES: &str = "rocksdb.properties";
/// Metaindex name of the legacy range deletion block.
pub const METAINDEX_RANGE_DEL: &str = "rocksdb.range_del";
/// Metaindex name of the fragmented range deletion block.
pub const METAINDEX_RANGE_DEL_V2: &str = "rocksdb.range_del2";
/// Metaindex name of the range key block.
pub const METAINDEX_RANGE_KEY: &str = "pebble.range_key";
/// Metaindex name of the value blocks index.
pub const METAINDEX_VALUE_INDEX: &str = "pebble.value_index";
/// Prefix of the metaindex name of the filter block; the policy name follows.
pub const METAINDEX_FILTER_PREFIX: &str = "fullfilter.";
