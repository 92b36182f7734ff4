use comet_regions::{header::HeapObjectHeader, Config, Destination, Heap};
use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};

fn bench_config() -> Config {
    Config {
        initial_heap_size: 64 * 1024 * 1024,
        max_heap_size: 512 * 1024 * 1024,
        region_size: Some(1024 * 1024),
        concurrent_uncommit: false,
        ..Default::default()
    }
}

pub fn bench_mutator(c: &mut Criterion) {
    let mut group = c.benchmark_group("mutator allocation");
    group.sample_size(50);
    for words in [2usize, 8, 64] {
        group.bench_function(BenchmarkId::new("mem_allocate", words), |b| {
            b.iter_batched_ref(
                || Heap::new(bench_config()),
                |heap| {
                    for _ in 0..10_000 {
                        let obj = heap.mem_allocate(words);
                        unsafe {
                            HeapObjectHeader::install(obj, words, 0);
                        }
                    }
                },
                criterion::BatchSize::LargeInput,
            );
        });
    }
    group.finish();
}

pub fn bench_plab(c: &mut Criterion) {
    let mut group = c.benchmark_group("plab allocation");
    group.sample_size(50);
    group.bench_function("young", |b| {
        b.iter_batched_ref(
            || Heap::new(bench_config()),
            |heap| {
                heap.init_gc_alloc_regions();
                {
                    let mut plab = heap.new_plab_allocator();
                    let mut refill_failed = false;
                    for i in 0..10_000 {
                        let words = 2 + (i % 30);
                        let obj = plab.allocate(Destination::Young, words, &mut refill_failed, 0);
                        unsafe {
                            HeapObjectHeader::install(obj, words, 0);
                        }
                    }
                }
                heap.release_gc_alloc_regions();
            },
            criterion::BatchSize::LargeInput,
        );
    });
    group.finish();
}

criterion_group!(benches, bench_mutator, bench_plab);
criterion_main!(benches);
