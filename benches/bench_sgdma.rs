// MDLX Scatter-Gather DMA Core
// Copyright 2025 Henk-Jan Lebbink
// SPDX-License-Identifier: MIT

//! Benchmarks of the host-side transfer path against the software engine.

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use mdlx_sgdma::soft::{SoftEngine, SoftPinner};
use mdlx_sgdma::{mapper, Channel, DescriptorChain, Direction, DmaBuffer, PagePinner, RuntimeConfig};
use std::sync::Arc;

const SIZES: [usize; 4] = [
    4 * 1024,    // 4 KB
    64 * 1024,   // 64 KB
    1024 * 1024, // 1 MB
    4 * 1024 * 1024,
];

/// Pin a buffer, build its descriptor chain, release it.
fn bench_map_and_build(c: &mut Criterion) {
    let pinner: Arc<dyn PagePinner> = Arc::new(SoftPinner::new());
    let mut group = c.benchmark_group("map_and_build");

    for size in SIZES {
        let buf = DmaBuffer::page_aligned(size).unwrap();
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::new("h2c", size), &buf, |b, buf| {
            b.iter(|| {
                let pinned = mapper::map(&pinner, buf.addr(), buf.len(), Direction::H2C).unwrap();
                let chain = DescriptorChain::build(
                    pinned.sg_table().segments(),
                    Direction::H2C,
                    0,
                    false,
                    mdlx_sgdma::regs::DESC_BLEN_MAX,
                    false,
                )
                .unwrap();
                pinned.unmap();
                chain
            });
        });
    }

    group.finish();
}

/// Blocking write then read through a software engine.
fn bench_round_trip(c: &mut Criterion) {
    let cfg = RuntimeConfig::default().set_pin_workers(false);
    let pinner = Arc::new(SoftPinner::new());
    // SAFETY: blocking transfers keep their buffers alive until completion.
    let h2c_card = Arc::new(unsafe { SoftEngine::new(Direction::H2C, false) }.with_memory(4 << 20));
    let c2h_card = Arc::new(unsafe { SoftEngine::new(Direction::C2H, false) }.with_memory(4 << 20));
    let h2c = Channel::open("h2c", h2c_card, pinner.clone(), Direction::H2C, &cfg).unwrap();
    let c2h = Channel::open("c2h", c2h_card, pinner, Direction::C2H, &cfg).unwrap();

    let mut group = c.benchmark_group("round_trip");
    for size in SIZES {
        let src: Vec<u8> = (0..size).map(|i| (i & 0xFF) as u8).collect();
        let mut dst = vec![0u8; size];
        group.throughput(Throughput::Bytes(size as u64));

        group.bench_with_input(BenchmarkId::new("write", size), &src, |b, src| {
            b.iter(|| h2c.write(src, 0).unwrap());
        });
        group.bench_function(BenchmarkId::new("read", size), |b| {
            b.iter(|| c2h.read(&mut dst, 0).unwrap());
        });
    }
    group.finish();
}

criterion_group!(benches, bench_map_and_build, bench_round_trip);
criterion_main!(benches);
