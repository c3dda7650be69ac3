//! Filters that let readers skip work for keys a table cannot contain.
//!
//! A [`FilterPolicy`] builds one table-wide filter over key prefixes; the reader
//! consults it in prefix seeks. Block-property filters in [`block_property`]
//! skip individual data blocks.

pub mod block_property;
pub mod bloom;

pub use bloom::{BloomFilter, BloomFilterPolicy};

/// A table filter format.
pub trait FilterPolicy: Send + Sync {
    /// Name recorded in the metaindex (`fullfilter.<name>`) and the properties.
    fn name(&self) -> &str;

    /// Returns false only if `key` was definitely not added to `filter`.
    fn may_contain(&self, filter: &[u8], key: &[u8]) -> bool;

    /// Creates a writer for a new filter.
    fn new_writer(&self) -> Box<dyn FilterWriter>;
}

/// Accumulates keys into a filter.
pub trait FilterWriter: Send {
    /// Adds a key.
    fn add_key(&mut self, key: &[u8]);

    /// Encodes the filter and resets the writer.
    fn finish(&mut self) -> Vec<u8>;
}
