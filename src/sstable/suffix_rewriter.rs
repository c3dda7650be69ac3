//! Rewriting the suffix of every point key of a table.
//!
//! Used when a table is imported under a new version: every key carries the same
//! suffix, which is replaced while the rest of the table is copied block by
//! block.

use crate::config::WriterOptions;
use crate::error::{Error, Result};
use crate::sstable::internal_key::InternalKeyRef;
use crate::sstable::reader::Reader;
use crate::sstable::writer::{Writer, WriterMetadata};
use log::info;
use std::io::Write;
use std::sync::Arc;

/// Copies the table of `reader` to `sink`, replacing the suffix `from` of every
/// point key with `to`.
///
/// Data block boundaries of the source are kept; index, filter and properties are
/// rebuilt with `opts`, whose comparer must be the one the table was written
/// with. Tables with range deletions, range keys or value blocks are not
/// supported. A key whose suffix is not `from` fails with `InvalidArgument`.
pub fn rewrite_key_suffixes<W: Write>(
    reader: &Reader,
    sink: W,
    opts: WriterOptions,
    from: &[u8],
    to: &[u8],
) -> Result<WriterMetadata> {
    if opts.comparer.name() != reader.comparer().name() {
        return Err(Error::invalid_argument(format!(
            "comparer {} does not match table comparer {}",
            opts.comparer.name(),
            reader.comparer().name()
        )));
    }
    let layout = reader.layout()?;
    if layout.range_del.is_some() || layout.range_key.is_some() {
        return Err(Error::not_supported("cannot rewrite suffixes of a table with range deletions or range keys"));
    }
    if layout.value_index.is_some() {
        return Err(Error::not_supported("cannot rewrite suffixes of a table with value blocks"));
    }

    let cmp = Arc::clone(&opts.comparer);
    let mut w = Writer::new(sink, opts)?;
    let mut user_key = Vec::new();
    let mut num_keys = 0u64;
    for (i, bhp) in layout.data.iter().enumerate() {
        let mut it = reader.data_block_iter(bhp.handle)?;
        if i > 0 {
            w.flush_before_next_point();
        }
        let mut valid = it.first();
        while valid {
            let Some(key) = it.key() else {
                break;
            };
            let split = cmp.split(key.user_key);
            let suffix = &key.user_key[split..];
            if suffix != from {
                return Err(Error::invalid_argument(format!(
                    "key {} has suffix {:?}, expected {:?}",
                    key,
                    String::from_utf8_lossy(suffix),
                    String::from_utf8_lossy(from)
                )));
            }
            user_key.clear();
            user_key.extend_from_slice(&key.user_key[..split]);
            user_key.extend_from_slice(to);
            {
                let value = it.lazy_value(None).value()?;
                w.add(InternalKeyRef { user_key: &user_key, trailer: key.trailer }, &value)?;
            }
            num_keys += 1;
            valid = it.next();
        }
        if let Some(e) = it.error() {
            return Err(e.duplicate());
        }
    }

    let meta = w.finish()?;
    info!(
        "Rewrote suffix of {} keys in {} data blocks of file {}",
        num_keys,
        layout.data.len(),
        reader.file_num()
    );
    Ok(meta)
}
