//! Table properties: statistics and names recorded in the properties block.
//!
//! The block holds raw keys in sorted order. Integer properties are uvarints,
//! except the few RocksDB-defined fixed-width ones; string properties are stored
//! verbatim. Names the reader does not recognize are kept as user properties.

use crate::error::{Error, Result};
use crate::sstable::block::{BlockWriter, RawBlockIter};
use crate::sstable::coding::{decode_uvarint, put_uvarint, read_u32_le, read_u64_le};
use std::collections::BTreeMap;
use std::fmt;

/// Index type recorded for a single-level index.
pub const BINARY_SEARCH_INDEX: u32 = 0;
/// Index type recorded for a partitioned (two-level) index.
pub const TWO_LEVEL_INDEX: u32 = 2;

const COMPARER: &str = "rocksdb.comparator";
const MERGER: &str = "rocksdb.merge.operator";
const FILTER_POLICY: &str = "rocksdb.filter.policy";
const COMPRESSION: &str = "rocksdb.compression";
const PROPERTY_COLLECTORS: &str = "rocksdb.property.collectors";
const DATA_SIZE: &str = "rocksdb.data.size";
const FILTER_SIZE: &str = "rocksdb.filter.size";
const INDEX_SIZE: &str = "rocksdb.index.size";
const INDEX_PARTITIONS: &str = "rocksdb.index.partitions";
const INDEX_TYPE: &str = "rocksdb.block.based.table.index.type";
const TOP_LEVEL_INDEX_SIZE: &str = "rocksdb.top-level.index.size";
const NUM_DATA_BLOCKS: &str = "rocksdb.num.data.blocks";
const NUM_ENTRIES: &str = "rocksdb.num.entries";
const NUM_DELETIONS: &str = "rocksdb.deleted.keys";
const NUM_SIZED_DELETIONS: &str = "pebble.num.deletions.sized";
const NUM_MERGE_OPERANDS: &str = "rocksdb.merge.operands";
const NUM_RANGE_DELETIONS: &str = "rocksdb.num.range-deletions";
const NUM_RANGE_KEY_SETS: &str = "pebble.num.range-key-sets";
const NUM_RANGE_KEY_UNSETS: &str = "pebble.num.range-key-unsets";
const NUM_RANGE_KEY_DELS: &str = "pebble.num.range-key-dels";
const NUM_VALUE_BLOCKS: &str = "pebble.num.value-blocks";
const NUM_VALUES_IN_VALUE_BLOCKS: &str = "pebble.num.values.in.value-blocks";
const VALUE_BLOCKS_SIZE: &str = "pebble.value-blocks.size";
const RAW_KEY_SIZE: &str = "rocksdb.raw.key.size";
const RAW_VALUE_SIZE: &str = "rocksdb.raw.value.size";
const EXTERNAL_FORMAT_VERSION: &str = "rocksdb.external_sst_file.version";
const GLOBAL_SEQ_NUM: &str = "rocksdb.external_sst_file.global_seqno";
const IS_STRICT_OBSOLETE: &str = "pebble.obsolete.is_strict";

enum Field<'a> {
    Str(&'a str),
    Uvarint(u64),
    // Encoded only when non-zero.
    OptUvarint(u64),
    Fixed32(u32),
    Fixed64(u64),
    Bool(bool),
}

/// Statistics and configuration recorded when a table was written.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Properties {
    /// Name of the comparer the table was written with.
    pub comparer_name: String,
    /// Name of the merge operator, if any.
    pub merger_name: String,
    /// Name of the table filter policy, if any.
    pub filter_policy_name: String,
    /// Name of the block compression.
    pub compression_name: String,
    /// Names of the block-property collectors, as `[a,b]`.
    pub property_collector_names: String,
    /// Total size of the data blocks.
    pub data_size: u64,
    /// Size of the filter block.
    pub filter_size: u64,
    /// Total size of the index blocks.
    pub index_size: u64,
    /// Number of second-level index blocks; zero for a single-level index.
    pub index_partitions: u64,
    /// Index type; [`TWO_LEVEL_INDEX`] for a partitioned index.
    pub index_type: u32,
    /// Size of the top-level index of a two-level index.
    pub top_level_index_size: u64,
    /// Number of data blocks.
    pub num_data_blocks: u64,
    /// Number of point entries.
    pub num_entries: u64,
    /// Number of point and range deletions.
    pub num_deletions: u64,
    /// Number of sized deletions.
    pub num_sized_deletions: u64,
    /// Number of merge operands.
    pub num_merge_operands: u64,
    /// Number of range deletions.
    pub num_range_deletions: u64,
    /// Number of range-key sets.
    pub num_range_key_sets: u64,
    /// Number of range-key unsets.
    pub num_range_key_unsets: u64,
    /// Number of range-key deletes.
    pub num_range_key_dels: u64,
    /// Number of value blocks.
    pub num_value_blocks: u64,
    /// Number of values stored in value blocks.
    pub num_values_in_value_blocks: u64,
    /// Size of the value blocks and their index, trailers included.
    pub value_blocks_size: u64,
    /// Total size of the point keys.
    pub raw_key_size: u64,
    /// Total size of the point values.
    pub raw_value_size: u64,
    /// Version of an externally ingested table; zero otherwise.
    pub external_format_version: u32,
    /// Sequence number assigned to every key of an ingested table.
    pub global_seq_num: u64,
    /// The table obeys strict obsolete-bit semantics.
    pub is_strict_obsolete: bool,
    /// Properties with names not listed above, including block-property
    /// collector outputs.
    pub user_properties: BTreeMap<String, Vec<u8>>,
}

impl Properties {
    fn fields(&self) -> [(&'static str, Field<'_>); 28] {
        [
            (COMPARER, Field::Str(&self.comparer_name)),
            (MERGER, Field::Str(&self.merger_name)),
            (FILTER_POLICY, Field::Str(&self.filter_policy_name)),
            (COMPRESSION, Field::Str(&self.compression_name)),
            (PROPERTY_COLLECTORS, Field::Str(&self.property_collector_names)),
            (DATA_SIZE, Field::Uvarint(self.data_size)),
            (FILTER_SIZE, Field::Uvarint(self.filter_size)),
            (INDEX_SIZE, Field::Uvarint(self.index_size)),
            (INDEX_PARTITIONS, Field::OptUvarint(self.index_partitions)),
            (INDEX_TYPE, Field::Fixed32(self.index_type)),
            (TOP_LEVEL_INDEX_SIZE, Field::OptUvarint(self.top_level_index_size)),
            (NUM_DATA_BLOCKS, Field::Uvarint(self.num_data_blocks)),
            (NUM_ENTRIES, Field::Uvarint(self.num_entries)),
            (NUM_DELETIONS, Field::Uvarint(self.num_deletions)),
            (NUM_SIZED_DELETIONS, Field::OptUvarint(self.num_sized_deletions)),
            (NUM_MERGE_OPERANDS, Field::Uvarint(self.num_merge_operands)),
            (NUM_RANGE_DELETIONS, Field::Uvarint(self.num_range_deletions)),
            (NUM_RANGE_KEY_SETS, Field::OptUvarint(self.num_range_key_sets)),
            (NUM_RANGE_KEY_UNSETS, Field::OptUvarint(self.num_range_key_unsets)),
            (NUM_RANGE_KEY_DELS, Field::OptUvarint(self.num_range_key_dels)),
            (NUM_VALUE_BLOCKS, Field::OptUvarint(self.num_value_blocks)),
            (NUM_VALUES_IN_VALUE_BLOCKS, Field::OptUvarint(self.num_values_in_value_blocks)),
            (VALUE_BLOCKS_SIZE, Field::OptUvarint(self.value_blocks_size)),
            (RAW_KEY_SIZE, Field::Uvarint(self.raw_key_size)),
            (RAW_VALUE_SIZE, Field::Uvarint(self.raw_value_size)),
            (EXTERNAL_FORMAT_VERSION, Field::Fixed32(self.external_format_version)),
            (GLOBAL_SEQ_NUM, Field::Fixed64(self.global_seq_num)),
            (IS_STRICT_OBSOLETE, Field::Bool(self.is_strict_obsolete)),
        ]
    }

    /// Total number of range keys of any kind.
    pub fn num_range_keys(&self) -> u64 {
        self.num_range_key_sets + self.num_range_key_unsets + self.num_range_key_dels
    }

    /// Decodes a properties block.
    pub fn load(block: &[u8]) -> Result<Self> {
        let mut p = Properties::default();
        for entry in RawBlockIter::new(block)? {
            let (key, value) = entry?;
            let name = String::from_utf8(key)
                .map_err(|_| Error::corruption("invalid table (non-UTF-8 property name)"))?;
            p.set(name, value)?;
        }
        Ok(p)
    }

    fn set(&mut self, name: String, v: &[u8]) -> Result<()> {
        let uvarint = |v: &[u8]| {
            decode_uvarint(v)
                .map(|(x, _)| x)
                .ok_or_else(|| Error::corruption(format!("invalid table (bad property {name})")))
        };
        let string = |v: &[u8]| String::from_utf8_lossy(v).into_owned();
        let fixed32 = |v: &[u8]| read_u32_le(v, 0).unwrap_or_default();
        match name.as_str() {
            COMPARER => self.comparer_name = string(v),
            MERGER => self.merger_name = string(v),
            FILTER_POLICY => self.filter_policy_name = string(v),
            COMPRESSION => self.compression_name = string(v),
            PROPERTY_COLLECTORS => self.property_collector_names = string(v),
            DATA_SIZE => self.data_size = uvarint(v)?,
            FILTER_SIZE => self.filter_size = uvarint(v)?,
            INDEX_SIZE => self.index_size = uvarint(v)?,
            INDEX_PARTITIONS => self.index_partitions = uvarint(v)?,
            INDEX_TYPE => self.index_type = fixed32(v),
            TOP_LEVEL_INDEX_SIZE => self.top_level_index_size = uvarint(v)?,
            NUM_DATA_BLOCKS => self.num_data_blocks = uvarint(v)?,
            NUM_ENTRIES => self.num_entries = uvarint(v)?,
            NUM_DELETIONS => self.num_deletions = uvarint(v)?,
            NUM_SIZED_DELETIONS => self.num_sized_deletions = uvarint(v)?,
            NUM_MERGE_OPERANDS => self.num_merge_operands = uvarint(v)?,
            NUM_RANGE_DELETIONS => self.num_range_deletions = uvarint(v)?,
            NUM_RANGE_KEY_SETS => self.num_range_key_sets = uvarint(v)?,
            NUM_RANGE_KEY_UNSETS => self.num_range_key_unsets = uvarint(v)?,
            NUM_RANGE_KEY_DELS => self.num_range_key_dels = uvarint(v)?,
            NUM_VALUE_BLOCKS => self.num_value_blocks = uvarint(v)?,
            NUM_VALUES_IN_VALUE_BLOCKS => self.num_values_in_value_blocks = uvarint(v)?,
            VALUE_BLOCKS_SIZE => self.value_blocks_size = uvarint(v)?,
            RAW_KEY_SIZE => self.raw_key_size = uvarint(v)?,
            RAW_VALUE_SIZE => self.raw_value_size = uvarint(v)?,
            EXTERNAL_FORMAT_VERSION => self.external_format_version = fixed32(v),
            GLOBAL_SEQ_NUM => self.global_seq_num = read_u64_le(v, 0).unwrap_or_default(),
            IS_STRICT_OBSOLETE => self.is_strict_obsolete = v == b"1",
            _ => {
                self.user_properties.insert(name.clone(), v.to_vec());
            }
        }
        Ok(())
    }

    /// Encodes the properties as a block.
    pub fn encode(&self) -> Vec<u8> {
        let mut entries: BTreeMap<&str, Vec<u8>> = BTreeMap::new();
        for (name, field) in self.fields() {
            let mut buf = Vec::new();
            match field {
                Field::Str(s) if !s.is_empty() => buf.extend_from_slice(s.as_bytes()),
                Field::Uvarint(v) => put_uvarint(&mut buf, v),
                Field::OptUvarint(v) if v != 0 => put_uvarint(&mut buf, v),
                Field::Fixed32(v) if name == INDEX_TYPE || v != 0 => buf.extend_from_slice(&v.to_le_bytes()),
                Field::Fixed64(v) if self.external_format_version != 0 => {
                    buf.extend_from_slice(&v.to_le_bytes())
                }
                Field::Bool(true) => buf.push(b'1'),
                _ => continue,
            }
            entries.insert(name, buf);
        }
        for (name, value) in &self.user_properties {
            entries.entry(name.as_str()).or_insert_with(|| value.clone());
        }

        let mut w = BlockWriter::new(i32::MAX as usize);
        for (name, value) in &entries {
            w.add_raw(name.as_bytes(), value);
        }
        w.finish()
    }
}

impl fmt::Display for Properties {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (name, field) in self.fields() {
            match field {
                Field::Str(s) if !s.is_empty() => writeln!(f, "{name}: {s}")?,
                Field::Uvarint(v) => writeln!(f, "{name}: {v}")?,
                Field::OptUvarint(v) | Field::Fixed64(v) if v != 0 => writeln!(f, "{name}: {v}")?,
                Field::Fixed32(v) if v != 0 => writeln!(f, "{name}: {v}")?,
                Field::Bool(true) => writeln!(f, "{name}: true")?,
                _ => {}
            }
        }
        for (name, value) in &self.user_properties {
            writeln!(f, "{name}: {}", String::from_utf8_lossy(value))?;
        }
        Ok(())
    }
}
