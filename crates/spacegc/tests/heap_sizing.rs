//! Footprint control from outside the collector: process state and the
//! growth limit.

mod common;

use std::thread;
use std::time::{Duration, Instant};

use common::{alloc, config, heap, heap_with, payload, set_payload, KB, MB};
use spacegc::{CollectorType, GcCause, HeapConfig, ProcessState, SlotModel};

#[test]
fn test_foreground_restores_multiplied_footprint() {
    let (heap, runtime) = heap(CollectorType::MarkSweep, 8 * MB);
    let defaults = HeapConfig::default();
    let _roots: Vec<_> = (0..100).map(|_| runtime.root(alloc(&heap, 0, 15))).collect();
    assert_eq!(heap.process_state(), ProcessState::JankPerceptible);

    heap.update_process_state(ProcessState::JankImperceptible);
    assert_eq!(heap.process_state(), ProcessState::JankImperceptible);
    heap.collect_garbage(false);
    let live = heap.get_bytes_allocated();
    assert_eq!(live, 100 * SlotModel::object_size(0, 15));
    assert_eq!(heap.target_footprint(), live + defaults.min_free);

    heap.update_process_state(ProcessState::JankPerceptible);
    let foreground = (defaults.min_free as f64 * defaults.foreground_heap_growth_multiplier) as usize;
    assert_eq!(heap.target_footprint(), live + foreground);

    // A foreground collection picks the same footprint on its own.
    heap.collect_garbage(false);
    assert_eq!(heap.target_footprint(), live + foreground);
}

#[test]
fn test_background_schedules_compaction() {
    let (heap, runtime) = heap_with(HeapConfig {
        enable_task_daemon: true,
        background_compaction: true,
        ..config(CollectorType::MarkSweep, 4 * MB)
    });
    let roots: Vec<_> = (0..64)
        .map(|i| {
            let obj = alloc(&heap, 0, 1);
            set_payload(&heap, obj, 0, 0, i);
            let _garbage = alloc(&heap, 0, 1);
            runtime.root(obj)
        })
        .collect();

    heap.update_process_state(ProcessState::JankImperceptible);
    let deadline = Instant::now() + Duration::from_secs(10);
    while heap.metrics().homogeneous_compactions() == 0 {
        assert!(Instant::now() < deadline, "background compaction never ran");
        thread::sleep(Duration::from_millis(5));
    }
    heap.wait_for_gc_to_complete(GcCause::Explicit);

    for (i, root) in roots.iter().enumerate() {
        assert_eq!(payload(&heap, root.get().unwrap(), 0, 0), i);
    }
    assert!(heap.verify_heap().is_ok());
}

#[test]
fn test_cleared_growth_limit_admits_more_allocations() {
    let (heap, runtime) = heap_with(HeapConfig {
        initial_size: MB,
        growth_limit: MB,
        use_homogeneous_space_compaction_for_oom: false,
        ..config(CollectorType::MarkSweep, 4 * MB)
    });
    let class = SlotModel::class(0, 127);
    let size = SlotModel::object_size(0, 127);
    let mut roots = Vec::new();
    while let Ok(obj) = heap.allocate(class, size) {
        roots.push(runtime.root(obj));
        assert!(roots.len() <= MB / KB, "allocated past the growth limit");
    }
    assert!(heap.get_bytes_allocated() <= MB);

    heap.clear_growth_limit();
    assert_eq!(heap.growth_limit(), 4 * MB);
    assert_eq!(heap.capacity(), 4 * MB);
    for _ in 0..MB / KB {
        roots.push(runtime.root(heap.allocate(class, size).unwrap()));
    }
    assert!(heap.get_bytes_allocated() > MB);
    assert!(heap.verify_heap().is_ok());
}

#[test]
fn test_clamped_capacity_stays_clamped() {
    let (heap, _runtime) = heap_with(HeapConfig {
        initial_size: MB,
        growth_limit: 2 * MB,
        ..config(CollectorType::MarkSweep, 4 * MB)
    });
    heap.clamp_growth_limit();
    assert_eq!(heap.capacity(), 2 * MB);
    assert_eq!(heap.growth_limit(), 2 * MB);

    heap.clear_growth_limit();
    assert_eq!(heap.growth_limit(), 2 * MB);
    assert_eq!(heap.get_max_memory(), 2 * MB);
}
