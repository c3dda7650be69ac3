// Table read performance benchmarks for lsmtable

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use lsmtable::cache::BlockCache;
use lsmtable::config::{IterOptions, ReaderOptions, WriterOptions};
use lsmtable::filter::BloomFilterPolicy;
use lsmtable::sstable::{MemReadable, Reader, SeekGeFlags, Writer};
use rand::Rng;
use std::hint::black_box;
use std::sync::Arc;

fn build_table(size: usize, opts: WriterOptions) -> Vec<u8> {
    let mut buf = Vec::new();
    let mut w = Writer::new(&mut buf, opts).unwrap();
    for i in 0..size {
        let key = format!("key{:08}", i);
        let value = format!("value{:08}", i);
        w.set(key.as_bytes(), value.as_bytes()).unwrap();
    }
    w.finish().unwrap();
    buf
}

fn open(buf: Vec<u8>, opts: ReaderOptions) -> Reader {
    Reader::open(Arc::new(MemReadable::new(buf)), opts).unwrap()
}

fn benchmark_sequential_scan(c: &mut Criterion) {
    let mut group = c.benchmark_group("sequential_scan");

    for size in [1000, 10000, 100000].iter() {
        let cache = Arc::new(BlockCache::new(64 << 20));
        let reader = open(build_table(*size, WriterOptions::default()), ReaderOptions::default().cache(cache));

        group.throughput(Throughput::Elements(*size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), size, |b, _| {
            b.iter(|| {
                let mut it = reader.new_iter(IterOptions::default()).unwrap();
                let mut valid = it.first();
                while valid {
                    black_box(it.key());
                    valid = it.next();
                }
            });
        });
    }

    group.finish();
}

fn benchmark_random_seek(c: &mut Criterion) {
    let mut group = c.benchmark_group("random_seek");

    for size in [1000, 10000, 100000].iter() {
        let cache = Arc::new(BlockCache::new(64 << 20));
        let reader = open(build_table(*size, WriterOptions::default()), ReaderOptions::default().cache(cache));
        let mut it = reader.new_iter(IterOptions::default()).unwrap();

        group.throughput(Throughput::Elements(1000));
        group.bench_with_input(BenchmarkId::from_parameter(size), size, |b, &size| {
            let mut rng = rand::rng();
            b.iter(|| {
                for _ in 0..1000 {
                    let key = format!("key{:08}", rng.random_range(0..size));
                    black_box(it.seek_ge(key.as_bytes(), SeekGeFlags::NONE));
                }
            });
        });
    }

    group.finish();
}

fn benchmark_two_level_seek(c: &mut Criterion) {
    let mut group = c.benchmark_group("two_level_seek");
    let size = 100000;
    let cache = Arc::new(BlockCache::new(64 << 20));
    let opts = WriterOptions::default().index_block_size(4096);
    let reader = open(build_table(size, opts), ReaderOptions::default().cache(cache));
    let mut it = reader.new_iter(IterOptions::default()).unwrap();

    group.throughput(Throughput::Elements(1000));
    group.bench_function("random", |b| {
        let mut rng = rand::rng();
        b.iter(|| {
            for _ in 0..1000 {
                let key = format!("key{:08}", rng.random_range(0..size));
                black_box(it.seek_ge(key.as_bytes(), SeekGeFlags::NONE));
            }
        });
    });

    group.finish();
}

fn benchmark_seek_prefix_missing(c: &mut Criterion) {
    let mut group = c.benchmark_group("seek_prefix_missing");
    let size = 10000;

    for use_filter in [false, true] {
        let policy = Arc::new(BloomFilterPolicy::default());
        let buf = build_table(size, WriterOptions::default().filter_policy(policy.clone()));
        let cache = Arc::new(BlockCache::new(64 << 20));
        let reader = open(buf, ReaderOptions::default().cache(cache).filter(policy));
        let mut it = reader.new_iter(IterOptions::default().use_filter(use_filter)).unwrap();

        group.throughput(Throughput::Elements(1000));
        group.bench_with_input(BenchmarkId::new("use_filter", use_filter), &use_filter, |b, _| {
            let mut rng = rand::rng();
            b.iter(|| {
                for _ in 0..1000 {
                    let key = format!("key{:08}x", rng.random_range(0..size));
                    black_box(it.seek_prefix_ge(key.as_bytes(), key.as_bytes(), SeekGeFlags::NONE));
                }
            });
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    benchmark_sequential_scan,
    benchmark_random_seek,
    benchmark_two_level_seek,
    benchmark_seek_prefix_missing
);
criterion_main!(benches);
