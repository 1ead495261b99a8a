use cinder::{Config, Heap};
use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use std::ptr::{null_mut, write_bytes, write_volatile};

fn bench_heap() -> Box<Heap> {
    Heap::new(Config {
        reserve_size: 256 * 1024 * 1024,
        scan_static: false,
        ..Config::default()
    })
}

#[inline(never)]
fn churn(heap: &Heap, count: usize, size: usize) {
    for _ in 0..count {
        let mut p = heap.alloc(size);
        assert!(!p.is_null());
        unsafe {
            write_bytes(p, 0, size);
            write_volatile(&mut p, null_mut());
        }
    }
}

pub fn bench_churn(c: &mut Criterion) {
    let mut group = c.benchmark_group("garbage churn");
    group.sample_size(20);

    for n in 10..=16 {
        group.bench_function(BenchmarkId::new("alloc+collect", 1 << n), |b| {
            b.iter_batched_ref(
                bench_heap,
                |heap| {
                    let heap: &Heap = heap;
                    heap.enter(|| {
                        churn(heap, 1 << n, 64);
                        heap.collect();
                        assert_eq!(heap.num_ptrs(), 0);
                    });
                },
                criterion::BatchSize::LargeInput,
            );
        });
    }

    group.bench_function("live graph survives collection", |b| {
        b.iter_batched_ref(
            bench_heap,
            |heap| {
                let heap: &Heap = heap;
                heap.enter(|| {
                    for _ in 0..1024 {
                        let p = heap.alloc_root(128);
                        unsafe { write_bytes(p, 0, 128) };
                    }
                    heap.collect();
                    assert_eq!(heap.num_ptrs(), 1024);
                });
            },
            criterion::BatchSize::LargeInput,
        );
    });

    group.finish();
}

criterion_group!(benches, bench_churn);
criterion_main!(benches);
