//! Benchmarks for link memory
//!
//! Measures performance of:
//! - Single fragment allocate/free per size class
//! - Batch allocation until a class runs dry
//! - Descriptor resolution on the peer side
//! - Contended allocation from both peers

use std::sync::{Arc, Weak};

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use fabric::driver::local::LocalDriver;
use fabric::driver::Driver;
use fabric::{MemoryConfig, NodeLinkMemory};

/// Two peers mapping the same primary buffer, with no link attached.
fn peers() -> (Arc<NodeLinkMemory>, Arc<NodeLinkMemory>) {
    let driver = LocalDriver::new();
    let config = MemoryConfig::default();
    let primary = NodeLinkMemory::allocate_primary(&*driver, &config).unwrap();
    let driver: Arc<dyn Driver> = driver;
    let a = NodeLinkMemory::adopt(Weak::new(), driver.clone(), config.clone(), primary.clone())
        .unwrap();
    let b = NodeLinkMemory::adopt(Weak::new(), driver, config, primary).unwrap();
    (a, b)
}

fn bench_allocate_free(c: &mut Criterion) {
    let mut group = c.benchmark_group("allocate_free");
    let (memory, _) = peers();

    for &size in &[64usize, 256, 512, 1024, 2048] {
        group.throughput(Throughput::Elements(1));
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, &size| {
            b.iter(|| {
                let fragment = memory.allocate_fragment(black_box(size));
                memory.free_fragment(&fragment)
            })
        });
    }
    group.finish();
}

fn bench_drain_class(c: &mut Criterion) {
    let mut group = c.benchmark_group("drain_class");
    let (memory, _) = peers();

    for &size in &[64usize, 256, 1024] {
        let blocks = memory.block_capacity(size) / size;
        group.throughput(Throughput::Elements(blocks as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, &size| {
            let mut held = Vec::with_capacity(blocks);
            b.iter(|| {
                for _ in 0..blocks {
                    held.push(memory.allocate_fragment(size));
                }
                for fragment in held.drain(..) {
                    memory.free_fragment(&fragment);
                }
            })
        });
    }
    group.finish();
}

fn bench_peer_resolution(c: &mut Criterion) {
    let (ours, theirs) = peers();
    let fragment = ours.allocate_fragment(256);
    let descriptor = fragment.descriptor();

    c.bench_function("get_fragment_on_peer", |b| {
        b.iter(|| theirs.get_fragment(black_box(descriptor)))
    });
}

fn bench_contended(c: &mut Criterion) {
    let mut group = c.benchmark_group("contended");
    let (ours, theirs) = peers();

    for &threads in &[2usize, 4] {
        group.throughput(Throughput::Elements((threads * 1000) as u64));
        group.bench_with_input(BenchmarkId::new("threads", threads), &threads, |b, &threads| {
            b.iter(|| {
                std::thread::scope(|scope| {
                    for i in 0..threads {
                        let memory = if i % 2 == 0 { &ours } else { &theirs };
                        scope.spawn(move || {
                            for _ in 0..1000 {
                                let fragment = memory.allocate_fragment(64);
                                memory.free_fragment(&fragment);
                            }
                        });
                    }
                })
            })
        });
    }
    group.finish();
}

criterion_group!(
    benches,
    bench_allocate_free,
    bench_drain_class,
    bench_peer_resolution,
    bench_contended,
);

criterion_main!(benches);
