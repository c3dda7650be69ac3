// Block codec benchmarks for lsmtable

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use lsmtable::comparer::default_comparer;
use lsmtable::sstable::internal_key::{make_trailer, InternalKeyKind};
use lsmtable::sstable::{BlockIter, BlockWriter, InternalKeyRef};
use rand::Rng;
use std::hint::black_box;

fn build_block(entries: usize, restart_interval: usize) -> Vec<u8> {
    let mut w = BlockWriter::new(restart_interval);
    for i in 0..entries {
        let key = format!("key{:08}", i);
        let trailer = make_trailer(i as u64, InternalKeyKind::Set);
        w.add(InternalKeyRef { user_key: key.as_bytes(), trailer }, format!("value{:08}", i).as_bytes());
    }
    w.finish()
}

fn benchmark_block_build(c: &mut Criterion) {
    let mut group = c.benchmark_group("block_build");

    for restart_interval in [1, 16, 64].iter() {
        group.throughput(Throughput::Elements(256));
        group.bench_with_input(BenchmarkId::from_parameter(restart_interval), restart_interval, |b, &ri| {
            b.iter(|| black_box(build_block(256, ri)));
        });
    }

    group.finish();
}

fn benchmark_block_seek(c: &mut Criterion) {
    let mut group = c.benchmark_group("block_seek");

    for restart_interval in [1, 16, 64].iter() {
        let block = build_block(256, *restart_interval);
        let mut it = BlockIter::new(default_comparer(), block, 0, false).unwrap();

        group.throughput(Throughput::Elements(100));
        group.bench_with_input(BenchmarkId::from_parameter(restart_interval), restart_interval, |b, _| {
            let mut rng = rand::rng();
            b.iter(|| {
                for _ in 0..100 {
                    let key = format!("key{:08}", rng.random_range(0..256));
                    black_box(it.seek_ge(key.as_bytes()));
                }
            });
        });
    }

    group.finish();
}

fn benchmark_block_scan(c: &mut Criterion) {
    let mut group = c.benchmark_group("block_scan");

    for direction in ["forward", "backward"] {
        let block = build_block(256, 16);
        let mut it = BlockIter::new(default_comparer(), block, 0, false).unwrap();

        group.throughput(Throughput::Elements(256));
        group.bench_function(direction, |b| {
            b.iter(|| {
                let mut valid = if direction == "forward" { it.first() } else { it.last() };
                while valid {
                    black_box(it.key());
                    valid = if direction == "forward" { it.next() } else { it.prev() };
                }
            });
        });
    }

    group.finish();
}

criterion_group!(benches, benchmark_block_build, benchmark_block_seek, benchmark_block_scan);
criterion_main!(benches);
