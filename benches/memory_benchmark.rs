//! # Memory Benchmarks
//!
//! Pointer access with and without bounds checks, and pool reuse against
//! raw backend allocation.

use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use offheap_core::{BackendSelection, DirectMemory, DirectMemoryConfig};

fn context(safe_mode: bool, backend: BackendSelection) -> Arc<DirectMemory> {
    DirectMemory::new(DirectMemoryConfig {
        safe_mode,
        backend,
        page_size_kb: 4,
        ..Default::default()
    })
    .unwrap()
}

fn bench_pointer_access(c: &mut Criterion) {
    let mut group = c.benchmark_group("pointer_access");
    const SIZE: usize = 64 * 1024;
    group.throughput(Throughput::Bytes(SIZE as u64));

    for (name, safe_mode) in [("safe", true), ("unchecked", false)] {
        for backend in [BackendSelection::Fast, BackendSelection::Portable] {
            let memory = context(safe_mode, backend);
            let mut pointer = memory.create_pointer(SIZE).unwrap();

            group.bench_with_input(
                BenchmarkId::new(name, format!("{:?}", memory.backend().kind())),
                &(),
                |b, _| {
                    b.iter(|| {
                        for offset in (0..SIZE).step_by(8) {
                            pointer.set_long(offset, offset as i64).unwrap();
                        }
                        let mut sum = 0i64;
                        for offset in (0..SIZE).step_by(8) {
                            sum = sum.wrapping_add(pointer.get_long(offset).unwrap());
                        }
                        black_box(sum)
                    });
                },
            );

            pointer.free().unwrap();
        }
    }

    group.finish();
}

fn bench_aligned_fallback(c: &mut Criterion) {
    let mut group = c.benchmark_group("byte_order_paths");

    for aligned_only in [false, true] {
        let memory = DirectMemory::new(DirectMemoryConfig {
            only_aligned_access: aligned_only,
            byte_order: offheap_core::ByteOrder::BigEndian,
            ..Default::default()
        })
        .unwrap();
        let mut pointer = memory.create_pointer(4096).unwrap();

        let name = if aligned_only { "byte_by_byte" } else { "native_word" };
        group.bench_function(name, |b| {
            b.iter(|| {
                for offset in (0..4096).step_by(4) {
                    pointer.set_int(offset, offset as i32).unwrap();
                    black_box(pointer.get_int(offset).unwrap());
                }
            });
        });

        pointer.free().unwrap();
    }

    group.finish();
}

fn bench_pool_vs_backend(c: &mut Criterion) {
    let mut group = c.benchmark_group("page_acquisition");
    let memory = context(true, BackendSelection::Auto);

    for count in [16usize, 256] {
        group.throughput(Throughput::Elements(count as u64));

        group.bench_with_input(BenchmarkId::new("pool", count), &count, |b, &count| {
            let pool = memory.pool();
            b.iter(|| {
                let buffers: Vec<_> = (0..count).map(|_| pool.acquire(false).unwrap()).collect();
                for buffer in buffers {
                    pool.release(buffer);
                }
            });
        });

        group.bench_with_input(BenchmarkId::new("backend", count), &count, |b, &count| {
            let allocator = memory.allocator();
            let size = memory.pool().buffer_size();
            b.iter(|| {
                let blocks: Vec<_> = (0..count).map(|_| allocator.allocate(size).unwrap()).collect();
                for block in blocks {
                    allocator.free(block).unwrap();
                }
            });
        });
    }

    group.finish();
}

fn bench_move_data(c: &mut Criterion) {
    let mut group = c.benchmark_group("move_data");
    let memory = context(true, BackendSelection::Auto);

    for size in [4 * 1024usize, 4 * 1024 * 1024] {
        let mut source = memory.create_pointer(size).unwrap();
        let mut dest = memory.create_pointer(size).unwrap();
        source.fill(0, size, 0x5A).unwrap();

        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, &size| {
            b.iter(|| source.move_data(0, &mut dest, 0, size).unwrap());
        });

        source.free().unwrap();
        dest.free().unwrap();
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_pointer_access,
    bench_aligned_fallback,
    bench_pool_vs_backend,
    bench_move_data,
);

criterion_main!(benches);
