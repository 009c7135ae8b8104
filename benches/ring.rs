// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Ring accessor benchmarks over the in-process region.
//
// Run with:
//   cargo bench --bench ring
//
// Groups:
//   write_read — try_write followed by try_read + accept, per packet size
//   reserve_commit — reservation round trip without payload copy

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use shmchan::{InProcRegion, RingRx, RingTx};

const RING_SIZE: u32 = 128 * 1024;

const SIZES: &[(&str, usize)] = &[
    ("small_48", 48),
    ("medium_1k", 1024),
    ("large_16k", 16 * 1024),
];

fn make_ring() -> (RingTx, RingRx) {
    let region = InProcRegion::new(RING_SIZE).expect("region");
    let tx = RingTx::new(region.clone()).expect("tx");
    let rx = RingRx::new(region).expect("rx");
    (tx, rx)
}

fn bench_write_read(c: &mut Criterion) {
    let mut group = c.benchmark_group("write_read");

    for &(label, size) in SIZES {
        let (tx, rx) = make_ring();
        let payload = vec![0xABu8; size];
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(label), &size, |b, _| {
            b.iter(|| {
                tx.try_write(&payload).expect("write");
                let packet = rx.try_read().expect("scan").expect("packet");
                black_box(packet.payload().len());
                packet.accept();
            });
        });
    }

    group.finish();
}

fn bench_reserve_commit(c: &mut Criterion) {
    let mut group = c.benchmark_group("reserve_commit");

    for &(label, size) in SIZES {
        let (tx, rx) = make_ring();
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(label), &size, |b, &sz| {
            b.iter(|| {
                let packet = tx.reserve(sz as u32, 1000).expect("reserve");
                packet.commit();
                let packet = rx.try_read().expect("scan").expect("packet");
                packet.accept();
            });
        });
    }

    group.finish();
}

criterion_group!(benches, bench_write_read, bench_reserve_commit);
criterion_main!(benches);
