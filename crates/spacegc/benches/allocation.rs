//! Benchmark: allocation throughput and collection pauses per collector
//! family.

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use spacegc::{CollectorType, GcType, GcCause, Heap, HeapConfig, SlotModel, StandaloneRuntime};
use std::hint::black_box;
use std::sync::Arc;

const MB: usize = 1024 * 1024;

fn make_heap(collector_type: CollectorType) -> (Arc<Heap>, Arc<StandaloneRuntime>) {
    let runtime = Arc::new(StandaloneRuntime::new());
    let config = HeapConfig {
        collector_type,
        image_space_capacity: 0,
        enable_task_daemon: false,
        ..HeapConfig::with_capacity(64 * MB)
    };
    let heap = Heap::new(config, Arc::new(SlotModel), runtime.clone()).unwrap();
    (heap, runtime)
}

const FAMILIES: [CollectorType; 2] = [CollectorType::SemiSpace, CollectorType::MarkSweep];

fn bench_small_allocations(c: &mut Criterion) {
    let mut group = c.benchmark_group("allocate_1000_small");
    for family in FAMILIES {
        let (heap, _runtime) = make_heap(family);
        let class = SlotModel::class(1, 2);
        let size = SlotModel::object_size(1, 2);
        group.bench_with_input(BenchmarkId::from_parameter(format!("{family:?}")), &family, |b, _| {
            b.iter(|| {
                for _ in 0..1000 {
                    black_box(heap.allocate(class, size).unwrap());
                }
            });
        });
    }
    group.finish();
}

fn bench_full_pause(c: &mut Criterion) {
    let mut group = c.benchmark_group("full_collection_10000_live");
    for family in FAMILIES {
        let (heap, runtime) = make_heap(family);
        let head = runtime.root(heap.allocate(SlotModel::class(1, 1), SlotModel::object_size(1, 1)).unwrap());
        let tail = runtime.root(head.get().unwrap());
        for _ in 0..10_000 {
            let node = heap.allocate(SlotModel::class(1, 1), SlotModel::object_size(1, 1)).unwrap();
            heap.write_reference(tail.get().unwrap(), SlotModel::reference_offset(0), Some(node));
            tail.set(node);
        }
        group.bench_with_input(BenchmarkId::from_parameter(format!("{family:?}")), &family, |b, _| {
            b.iter(|| black_box(heap.collect(GcType::Full, GcCause::Explicit, false)));
        });
    }
    group.finish();
}

fn bench_sticky_pause(c: &mut Criterion) {
    let mut group = c.benchmark_group("sticky_collection_1000_new");
    for family in FAMILIES {
        let (heap, _runtime) = make_heap(family);
        heap.collect_garbage(false);
        group.bench_with_input(BenchmarkId::from_parameter(format!("{family:?}")), &family, |b, _| {
            b.iter(|| {
                for _ in 0..1000 {
                    black_box(heap.allocate(SlotModel::class(0, 4), SlotModel::object_size(0, 4)).unwrap());
                }
                heap.collect(GcType::Sticky, GcCause::Explicit, false)
            });
        });
    }
    group.finish();
}

criterion_group!(benches, bench_small_allocations, bench_full_pause, bench_sticky_pause);
criterion_main!(benches);
