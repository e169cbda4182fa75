//! Allocator benchmarks: mapalloc against the host libc allocator.

use std::hint::black_box;

use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};
use mapalloc::{Heap, HeapConfig, ReclaimPolicy};
use mapalloc_abi::{mapalloc_free, mapalloc_malloc};

const SIZES: &[usize] = &[16, 64, 256, 1024, 4096, 32768];

fn bench_alloc_free_cycle(c: &mut Criterion) {
    let mut group = c.benchmark_group("alloc_free_cycle");

    for &size in SIZES {
        group.bench_with_input(BenchmarkId::new("libc", size), &size, |b, &sz| {
            b.iter(|| {
                // SAFETY: paired malloc/free.
                unsafe {
                    let p = libc::malloc(black_box(sz));
                    libc::free(black_box(p));
                }
            });
        });
        group.bench_with_input(BenchmarkId::new("mapalloc", size), &size, |b, &sz| {
            b.iter(|| {
                // SAFETY: paired malloc/free.
                unsafe {
                    let p = mapalloc_malloc(black_box(sz));
                    mapalloc_free(black_box(p));
                }
            });
        });
    }
    group.finish();
}

fn bench_alloc_burst(c: &mut Criterion) {
    let mut group = c.benchmark_group("alloc_burst");

    for (label, policy) in [
        ("eager", ReclaimPolicy::Eager),
        ("retain", ReclaimPolicy::RetainActive),
    ] {
        let heap = Heap::with_config(
            HeapConfig::DEFAULT
                .with_reclaim(policy)
                .with_poison(false),
        );
        group.bench_function(BenchmarkId::new("1000x64B", label), |b| {
            b.iter(|| {
                let ptrs: Vec<_> = (0..1000)
                    .filter_map(|_| heap.allocate(black_box(64)).ok())
                    .collect();
                for ptr in ptrs {
                    // SAFETY: each pointer is live and released once.
                    unsafe { heap.release(ptr) };
                }
            });
        });
    }

    group.bench_function(BenchmarkId::new("1000x64B", "libc"), |b| {
        b.iter(|| {
            let ptrs: Vec<_> = (0..1000)
                // SAFETY: plain malloc.
                .map(|_| unsafe { libc::malloc(black_box(64)) })
                .collect();
            for p in ptrs {
                // SAFETY: each pointer came from malloc above.
                unsafe { libc::free(p) };
            }
        });
    });

    group.finish();
}

criterion_group!(benches, bench_alloc_free_cycle, bench_alloc_burst);
criterion_main!(benches);
