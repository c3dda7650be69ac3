//! # lsmtable - Reading and writing LSM sstables
//!
//! lsmtable reads and iterates immutable sorted string tables in the LevelDB,
//! RocksDB and Pebble formats, and writes them for testing and tooling.
//!
//! ## Architecture
//!
//! - **Blocks**: prefix-compressed entries with restart points and checksummed trailers
//! - **Reader**: opens a table, loads its properties and metaindex, and serves blocks
//!   through a shared block cache
//! - **Iterators**: single-level and two-level point iterators with bounds, prefix
//!   filters and block-property filtering
//! - **Value blocks**: older versions of a key stored out of line and fetched lazily
//! - **Fragments**: range deletions and range keys as non-overlapping spans
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use lsmtable::config::{IterOptions, ReaderOptions, WriterOptions};
//! use lsmtable::sstable::{MemReadable, Reader, Writer};
//! use std::sync::Arc;
//!
//! # fn main() -> Result<(), lsmtable::Error> {
//! let mut buf = Vec::new();
//! let mut w = Writer::new(&mut buf, WriterOptions::default())?;
//! w.set(b"apple", b"red")?;
//! w.set(b"banana", b"yellow")?;
//! w.finish()?;
//!
//! let reader = Reader::open(Arc::new(MemReadable::new(buf)), ReaderOptions::default())?;
//! let mut iter = reader.new_iter(IterOptions::default())?;
//! let mut valid = iter.seek_ge(b"b", Default::default());
//! while valid {
//!     if let Some(key) = iter.key() {
//!         println!("{} = {:?}", key, iter.value().to_vec()?);
//!     }
//!     valid = iter.next();
//! }
//! iter.close()?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod cache;
pub mod comparer;
pub mod config;
pub mod error;
pub mod filter;
pub mod sstable;

pub use comparer::{default_comparer, BytewiseComparer, Comparer};
pub use config::{IterOptions, ReaderOptions, TableFormat, WriterOptions};
pub use error::{Error, Result};
pub use sstable::{InternalKey, InternalKeyKind, Reader, Writer};
