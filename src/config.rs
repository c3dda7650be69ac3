//! Configuration options for reading and writing tables.

use crate::cache::{BlockCache, BufferPool};
use crate::comparer::{default_comparer, Comparer};
use crate::error::{Error, Result};
use crate::filter::block_property::{BlockPropertiesFilterer, BlockPropertyCollector};
use crate::filter::FilterPolicy;
use crate::sstable::iter::IterStats;
use std::fmt;
use std::sync::Arc;

/// Block compression algorithms. The discriminant is the block trailer's type byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CompressionType {
    /// No compression.
    None = 0,

    /// Snappy compression (fast, moderate compression ratio).
    #[cfg(feature = "snappy")]
    Snappy = 1,

    /// LZ4 compression (very fast, lower compression ratio).
    #[cfg(feature = "lz4-compression")]
    Lz4 = 4,
}

impl CompressionType {
    /// Convert from the trailer type byte.
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(CompressionType::None),
            #[cfg(feature = "snappy")]
            1 => Some(CompressionType::Snappy),
            #[cfg(feature = "lz4-compression")]
            4 => Some(CompressionType::Lz4),
            _ => None,
        }
    }

    /// Name recorded in table properties.
    pub fn name(self) -> &'static str {
        match self {
            CompressionType::None => "NoCompression",
            #[cfg(feature = "snappy")]
            CompressionType::Snappy => "Snappy",
            #[cfg(feature = "lz4-compression")]
            CompressionType::Lz4 => "LZ4",
        }
    }
}

impl Default for CompressionType {
    fn default() -> Self {
        #[cfg(feature = "snappy")]
        return CompressionType::Snappy;

        #[cfg(not(feature = "snappy"))]
        CompressionType::None
    }
}

/// Block checksum algorithms. The discriminant is stored in the footer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum ChecksumType {
    /// Masked CRC-32C (Castagnoli).
    #[default]
    Crc32c = 1,
    /// Low 32 bits of xxHash64.
    XxHash64 = 3,
}

impl ChecksumType {
    /// Convert from the footer byte.
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(ChecksumType::Crc32c),
            3 => Some(ChecksumType::XxHash64),
            _ => None,
        }
    }
}

/// On-disk table format versions, oldest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TableFormat {
    /// LevelDB footer, CRC-32C checksums.
    LevelDB,
    /// RocksDB footer version 2.
    RocksDBv2,
    /// Adds block properties in index entries.
    Pebblev1,
    /// Adds range keys.
    Pebblev2,
    /// Adds value blocks and the per-key value prefix.
    Pebblev3,
    /// Adds sized deletes and obsolete bits.
    Pebblev4,
}

impl Default for TableFormat {
    fn default() -> Self {
        TableFormat::Pebblev4
    }
}

impl fmt::Display for TableFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TableFormat::LevelDB => "(LevelDB)",
            TableFormat::RocksDBv2 => "(RocksDB,v2)",
            TableFormat::Pebblev1 => "(Pebble,v1)",
            TableFormat::Pebblev2 => "(Pebble,v2)",
            TableFormat::Pebblev3 => "(Pebble,v3)",
            TableFormat::Pebblev4 => "(Pebble,v4)",
        };
        f.write_str(s)
    }
}

/// Options for opening a table reader.
#[derive(Clone)]
pub struct ReaderOptions {
    /// Comparer expected to have written the table.
    /// Default: bytewise
    pub comparer: Arc<dyn Comparer>,

    /// Additional comparers, matched by name when the table's comparer differs.
    pub comparers: Vec<Arc<dyn Comparer>>,

    /// Merger name expected to have written the table.
    /// Tables recording no merger, or `nullptr`, are always accepted.
    pub merger_name: String,

    /// Additional acceptable merger names.
    pub mergers: Vec<String>,

    /// Shared block cache. When `None` the reader uses a private cache that
    /// retains nothing.
    pub cache: Option<Arc<BlockCache>>,

    /// Namespace of this reader's blocks within the cache. Zero allocates one.
    pub cache_id: u64,

    /// File number of the table, used in cache keys and error messages.
    pub file_num: u64,

    /// Filter policies the reader may use, matched by name.
    pub filters: Vec<Arc<dyn FilterPolicy>>,

    /// Surface legacy range tombstones without fragmenting them.
    /// Default: false
    pub raw_tombstones: bool,
}

impl Default for ReaderOptions {
    fn default() -> Self {
        Self {
            comparer: default_comparer(),
            comparers: Vec::new(),
            merger_name: String::new(),
            mergers: Vec::new(),
            cache: None,
            cache_id: 0,
            file_num: 0,
            filters: Vec::new(),
            raw_tombstones: false,
        }
    }
}

impl fmt::Debug for ReaderOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReaderOptions")
            .field("comparer", &self.comparer.name())
            .field("merger_name", &self.merger_name)
            .field("cache_id", &self.cache_id)
            .field("file_num", &self.file_num)
            .field("filters", &self.filters.iter().map(|p| p.name().to_string()).collect::<Vec<_>>())
            .field("raw_tombstones", &self.raw_tombstones)
            .finish()
    }
}

impl ReaderOptions {
    /// Creates a new ReaderOptions with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the comparer.
    pub fn comparer(mut self, comparer: Arc<dyn Comparer>) -> Self {
        self.comparer = comparer;
        self
    }

    /// Sets the block cache.
    pub fn cache(mut self, cache: Arc<BlockCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Sets the file number.
    pub fn file_num(mut self, file_num: u64) -> Self {
        self.file_num = file_num;
        self
    }

    /// Registers a filter policy.
    pub fn filter(mut self, policy: Arc<dyn FilterPolicy>) -> Self {
        self.filters.push(policy);
        self
    }

    /// Sets the merger name.
    pub fn merger_name(mut self, name: impl Into<String>) -> Self {
        self.merger_name = name.into();
        self
    }
}

/// Constructs a fresh block-property collector for each table written.
pub type CollectorConstructor = Arc<dyn Fn() -> Box<dyn BlockPropertyCollector> + Send + Sync>;

/// Extracts a 3-bit attribute from a value stored out of line, so readers can
/// consult it without fetching the value.
pub type ShortAttributeExtractor = Arc<dyn Fn(&[u8], usize, &[u8]) -> Result<u8> + Send + Sync>;

/// Options for writing a table.
#[derive(Clone)]
pub struct WriterOptions {
    /// Target uncompressed size of a data block (in bytes).
    /// Default: 4KB
    pub block_size: usize,

    /// Percentage of `block_size` after which a block is flushed early when the next
    /// entry would push it past `block_size`.
    /// Default: 90
    pub block_size_threshold: usize,

    /// Number of keys between restart points.
    /// Default: 16
    pub block_restart_interval: usize,

    /// Target size of an index block. Once exceeded the index is partitioned into a
    /// two-level index.
    /// Default: same as `block_size`
    pub index_block_size: usize,

    /// Compression algorithm for blocks.
    pub compression: CompressionType,

    /// Checksum algorithm for blocks. Ignored for the LevelDB format.
    pub checksum: ChecksumType,

    /// Table format to write.
    /// Default: Pebblev4
    pub table_format: TableFormat,

    /// User-key comparer.
    pub comparer: Arc<dyn Comparer>,

    /// Merger name recorded in the properties.
    pub merger_name: String,

    /// Optional table filter.
    pub filter_policy: Option<Arc<dyn FilterPolicy>>,

    /// Block-property collectors. Requires Pebblev1 or later.
    pub block_property_collectors: Vec<CollectorConstructor>,

    /// Disable value blocks even when the format supports them.
    /// Default: false
    pub disable_value_blocks: bool,

    /// Target size of a value block.
    /// Default: same as `block_size`
    pub value_block_size: usize,

    /// Smallest value moved to a value block.
    /// Default: 1
    pub value_block_min_size: usize,

    /// Optional extractor for the short attribute of out-of-line values.
    pub short_attribute_extractor: Option<ShortAttributeExtractor>,

    /// Record that the table obeys strict obsolete-bit semantics.
    /// Default: false
    pub is_strict_obsolete: bool,
}

impl Default for WriterOptions {
    fn default() -> Self {
        Self {
            block_size: 4 * 1024,
            block_size_threshold: 90,
            block_restart_interval: 16,
            index_block_size: 4 * 1024,
            compression: CompressionType::default(),
            checksum: ChecksumType::default(),
            table_format: TableFormat::default(),
            comparer: default_comparer(),
            merger_name: String::new(),
            filter_policy: None,
            block_property_collectors: Vec::new(),
            disable_value_blocks: false,
            value_block_size: 4 * 1024,
            value_block_min_size: 1,
            short_attribute_extractor: None,
            is_strict_obsolete: false,
        }
    }
}

impl fmt::Debug for WriterOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WriterOptions")
            .field("block_size", &self.block_size)
            .field("block_size_threshold", &self.block_size_threshold)
            .field("block_restart_interval", &self.block_restart_interval)
            .field("index_block_size", &self.index_block_size)
            .field("compression", &self.compression)
            .field("checksum", &self.checksum)
            .field("table_format", &self.table_format)
            .field("comparer", &self.comparer.name())
            .field("filter_policy", &self.filter_policy.as_ref().map(|p| p.name().to_string()))
            .field("block_property_collectors", &self.block_property_collectors.len())
            .field("disable_value_blocks", &self.disable_value_blocks)
            .finish()
    }
}

impl WriterOptions {
    /// Creates a new WriterOptions with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the data block size.
    pub fn block_size(mut self, size: usize) -> Self {
        self.block_size = size;
        self
    }

    /// Sets the restart interval.
    pub fn block_restart_interval(mut self, interval: usize) -> Self {
        self.block_restart_interval = interval;
        self
    }

    /// Sets the index block size.
    pub fn index_block_size(mut self, size: usize) -> Self {
        self.index_block_size = size;
        self
    }

    /// Sets the compression algorithm.
    pub fn compression(mut self, compression: CompressionType) -> Self {
        self.compression = compression;
        self
    }

    /// Sets the checksum algorithm.
    pub fn checksum(mut self, checksum: ChecksumType) -> Self {
        self.checksum = checksum;
        self
    }

    /// Sets the table format.
    pub fn table_format(mut self, format: TableFormat) -> Self {
        self.table_format = format;
        self
    }

    /// Sets the comparer.
    pub fn comparer(mut self, comparer: Arc<dyn Comparer>) -> Self {
        self.comparer = comparer;
        self
    }

    /// Sets the table filter policy.
    pub fn filter_policy(mut self, policy: Arc<dyn FilterPolicy>) -> Self {
        self.filter_policy = Some(policy);
        self
    }

    /// Adds a block-property collector.
    pub fn block_property_collector(mut self, ctor: CollectorConstructor) -> Self {
        self.block_property_collectors.push(ctor);
        self
    }

    /// Enables or disables value blocks.
    pub fn disable_value_blocks(mut self, value: bool) -> Self {
        self.disable_value_blocks = value;
        self
    }

    /// Sets the short attribute extractor.
    pub fn short_attribute_extractor(mut self, extractor: ShortAttributeExtractor) -> Self {
        self.short_attribute_extractor = Some(extractor);
        self
    }

    /// Validates the options and returns an error if any are invalid.
    pub fn validate(&self) -> Result<()> {
        if self.block_size == 0 {
            return Err(Error::invalid_argument("block_size must be > 0"));
        }
        if self.block_size > u32::MAX as usize {
            return Err(Error::invalid_argument("block_size must fit in 32 bits"));
        }
        if self.block_size_threshold == 0 || self.block_size_threshold > 100 {
            return Err(Error::invalid_argument("block_size_threshold must be in 1..=100"));
        }
        if self.block_restart_interval == 0 {
            return Err(Error::invalid_argument("block_restart_interval must be > 0"));
        }
        if self.index_block_size == 0 {
            return Err(Error::invalid_argument("index_block_size must be > 0"));
        }
        if self.value_block_size == 0 {
            return Err(Error::invalid_argument("value_block_size must be > 0"));
        }
        if !self.block_property_collectors.is_empty() && self.table_format < TableFormat::Pebblev1 {
            return Err(Error::invalid_argument(format!(
                "block properties require table format {} or later, got {}",
                TableFormat::Pebblev1,
                self.table_format
            )));
        }
        if self.block_property_collectors.len() > u8::MAX as usize {
            return Err(Error::invalid_argument("too many block property collectors"));
        }
        Ok(())
    }
}

/// Options for a point-key iterator.
#[derive(Clone)]
pub struct IterOptions {
    /// Inclusive lower bound on user keys.
    pub lower: Option<Vec<u8>>,

    /// Exclusive upper bound on user keys.
    pub upper: Option<Vec<u8>>,

    /// Block-property filters to skip data blocks with.
    pub filterer: Option<BlockPropertiesFilterer>,

    /// Consult the table filter in `seek_prefix_ge`.
    /// Default: true
    pub use_filter: bool,

    /// Skip keys carrying the obsolete bit.
    /// Default: false
    pub hide_obsolete_points: bool,

    /// Read data blocks into this pool instead of the block cache.
    pub buffer_pool: Option<Arc<BufferPool>>,

    /// Counters updated by the iterator.
    pub stats: Option<Arc<IterStats>>,
}

impl Default for IterOptions {
    fn default() -> Self {
        Self {
            lower: None,
            upper: None,
            filterer: None,
            use_filter: true,
            hide_obsolete_points: false,
            buffer_pool: None,
            stats: None,
        }
    }
}

impl fmt::Debug for IterOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IterOptions")
            .field("lower", &self.lower)
            .field("upper", &self.upper)
            .field("filterer", &self.filterer)
            .field("use_filter", &self.use_filter)
            .field("hide_obsolete_points", &self.hide_obsolete_points)
            .finish()
    }
}

impl IterOptions {
    /// Creates options with no bounds.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets both bounds.
    pub fn bounds(mut self, lower: Option<&[u8]>, upper: Option<&[u8]>) -> Self {
        self.lower = lower.map(<[u8]>::to_vec);
        self.upper = upper.map(<[u8]>::to_vec);
        self
    }

    /// Sets the block-property filterer.
    pub fn filterer(mut self, filterer: BlockPropertiesFilterer) -> Self {
        self.filterer = Some(filterer);
        self
    }

    /// Enables or disables the table filter.
    pub fn use_filter(mut self, value: bool) -> Self {
        self.use_filter = value;
        self
    }

    /// Enables or disables hiding obsolete points.
    pub fn hide_obsolete_points(mut self, value: bool) -> Self {
        self.hide_obsolete_points = value;
        self
    }

    /// Sets the buffer pool.
    pub fn buffer_pool(mut self, pool: Arc<BufferPool>) -> Self {
        self.buffer_pool = Some(pool);
        self
    }

    /// Sets the stats sink.
    pub fn stats(mut self, stats: Arc<IterStats>) -> Self {
        self.stats = Some(stats);
        self
    }

    /// Validates the options.
    pub fn validate(&self, cmp: &dyn Comparer) -> Result<()> {
        if let (Some(lower), Some(upper)) = (&self.lower, &self.upper) {
            if cmp.compare(lower, upper).is_gt() {
                return Err(Error::invalid_argument("iterator lower bound exceeds upper bound"));
            }
        }
        Ok(())
    }
}
