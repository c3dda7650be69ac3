//! Integration tests for compaction iterators.

use lsmtable::cache::BufferPool;
use lsmtable::comparer::{Comparer, SuffixedKeyComparer};
use lsmtable::config::{ReaderOptions, WriterOptions};
use lsmtable::sstable::{InternalIterator, MemReadable, Reader, SeekGeFlags, Writer};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

fn build(opts: WriterOptions, n: usize) -> Reader {
    let mut buf = Vec::new();
    let mut w = Writer::new(&mut buf, opts).unwrap();
    for i in 0..n {
        w.set(format!("key{:05}", i).as_bytes(), format!("value{:05}", i).as_bytes()).unwrap();
    }
    w.finish().unwrap();
    Reader::open(Arc::new(MemReadable::new(buf)), ReaderOptions::default()).unwrap()
}

fn drain(it: &mut dyn InternalIterator, bytes: &AtomicU64) -> usize {
    let mut n = 0;
    let mut last_bytes = 0;
    let mut valid = it.first();
    while valid {
        let cur = bytes.load(Ordering::Relaxed);
        assert!(cur >= last_bytes, "bytes iterated went backwards");
        last_bytes = cur;
        n += 1;
        valid = it.next();
    }
    n
}

#[test]
fn test_bytes_iterated_single_level() {
    let _ = env_logger::builder().is_test(true).try_init();
    let reader = build(WriterOptions::default().block_size(256), 1000);
    let bytes = Arc::new(AtomicU64::new(0));
    let mut it = reader.new_compaction_iter(Arc::clone(&bytes), None).unwrap();
    assert_eq!(drain(it.as_mut(), &bytes), 1000);
    assert!(it.error().is_none());
    it.close().unwrap();

    let total = bytes.load(Ordering::Relaxed);
    let layout = reader.layout().unwrap();
    let last = layout.data.last().unwrap().handle;
    assert!(total >= last.offset, "{total} < {}", last.offset);
    assert!(total <= reader.properties().data_size);
}

#[test]
fn test_bytes_iterated_two_level_with_pool() {
    let reader = build(WriterOptions::default().block_size(128).index_block_size(64), 1000);
    assert!(reader.layout().unwrap().top_index.is_some());
    let bytes = Arc::new(AtomicU64::new(0));
    let pool = BufferPool::new(4);
    let mut it = reader.new_compaction_iter(Arc::clone(&bytes), Some(Arc::clone(&pool))).unwrap();
    assert_eq!(drain(it.as_mut(), &bytes), 1000);
    it.close().unwrap();
    assert!(bytes.load(Ordering::Relaxed) > 0);
    assert!(bytes.load(Ordering::Relaxed) <= reader.properties().data_size);
}

#[test]
fn test_compaction_iter_surfaces_obsolete_points() {
    let cmp: Arc<dyn Comparer> = Arc::new(SuffixedKeyComparer::default());
    let mut buf = Vec::new();
    let mut w = Writer::new(&mut buf, WriterOptions::default().comparer(Arc::clone(&cmp))).unwrap();
    w.set(b"a@2", b"new").unwrap();
    w.set(b"a@1", b"old").unwrap();
    w.finish().unwrap();
    let reader = Reader::open(Arc::new(MemReadable::new(buf)), ReaderOptions::default().comparer(cmp)).unwrap();

    let bytes = Arc::new(AtomicU64::new(0));
    let mut it = reader.new_compaction_iter(Arc::clone(&bytes), None).unwrap();
    assert!(it.first());
    assert_eq!(it.value().to_vec().unwrap(), b"new");
    assert!(it.next());
    assert_eq!(it.key().unwrap().user_key, b"a@1");
    assert_eq!(it.value().to_vec().unwrap(), b"old");
    assert!(!it.next());
}

#[test]
#[should_panic(expected = "seek_ge is not supported by compaction iterators")]
fn test_compaction_iter_rejects_seek_ge() {
    let reader = build(WriterOptions::default(), 10);
    let mut it = reader.new_compaction_iter(Arc::new(AtomicU64::new(0)), None).unwrap();
    it.seek_ge(b"key", SeekGeFlags::NONE);
}

#[test]
#[should_panic(expected = "prev is not supported by compaction iterators")]
fn test_compaction_iter_rejects_prev() {
    let reader = build(WriterOptions::default().block_size(64).index_block_size(64), 100);
    let mut it = reader.new_compaction_iter(Arc::new(AtomicU64::new(0)), None).unwrap();
    assert!(it.first());
    it.prev();
}

#[test]
#[should_panic(expected = "set_bounds is not supported by compaction iterators")]
fn test_compaction_iter_rejects_bounds() {
    let reader = build(WriterOptions::default(), 10);
    let mut it = reader.new_compaction_iter(Arc::new(AtomicU64::new(0)), None).unwrap();
    it.set_bounds(Some(b"a"), None);
}
