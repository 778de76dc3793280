//! End-to-end tests for the mark-sweep family.

mod common;

use std::thread;
use std::time::{Duration, Instant};

use common::{alloc, config, get_ref, heap, heap_with, payload, set_payload, set_ref, KB, MB};
use spacegc::{CollectorType, GcCause, GcType, SlotModel, SpaceKind};

#[test]
fn test_objects_stay_in_place() {
    let (heap, runtime) = heap(CollectorType::MarkSweep, MB);
    let a = alloc(&heap, 1, 1);
    let b = alloc(&heap, 1, 1);
    let c = alloc(&heap, 1, 1);
    set_payload(&heap, a, 1, 0, 0xA);
    set_ref(&heap, a, 0, Some(b));
    set_ref(&heap, b, 0, Some(c));
    let root = runtime.root(a);
    assert_eq!(heap.find_space_kind(a.addr()), Some(SpaceKind::Malloc));

    set_ref(&heap, a, 0, None);
    assert_eq!(heap.collect_garbage(false), GcType::Full);

    assert_eq!(root.get(), Some(a));
    assert_eq!(payload(&heap, a, 1, 0), 0xA);
    let gc = heap.last_gc_metrics().unwrap();
    assert_eq!(gc.collector_type, CollectorType::MarkSweep);
    assert_eq!(gc.freed_objects, 2);
    assert_eq!(gc.freed_bytes, 2 * SlotModel::object_size(1, 1));
    assert_eq!(heap.get_bytes_allocated(), SlotModel::object_size(1, 1));
    assert_eq!(heap.verify_heap(), Ok(1));
}

#[test]
fn test_sticky_frees_only_new_garbage() {
    let (heap, runtime) = heap(CollectorType::MarkSweep, MB);
    let old = alloc(&heap, 0, 1);
    let _old_root = runtime.root(old);
    heap.collect_garbage(false);

    let kept = alloc(&heap, 0, 1);
    let _dropped = alloc(&heap, 0, 1);
    let root = runtime.root(kept);
    assert_eq!(heap.collect(GcType::Sticky, GcCause::Explicit, false), GcType::Sticky);

    assert_eq!(root.get(), Some(kept));
    let gc = heap.last_gc_metrics().unwrap();
    assert_eq!(gc.gc_type, GcType::Sticky);
    assert_eq!(gc.freed_objects, 1);
    assert_eq!(heap.verify_heap(), Ok(2));
    assert_eq!(heap.metrics().sticky_collections(), 1);
    assert_eq!(heap.metrics().full_collections(), 1);
}

#[test]
fn test_sticky_scans_cards_of_old_objects() {
    let (heap, runtime) = heap(CollectorType::MarkSweep, MB);
    let old = alloc(&heap, 1, 0);
    let _root = runtime.root(old);
    heap.collect_garbage(false);

    let young = alloc(&heap, 0, 1);
    set_payload(&heap, young, 0, 0, 99);
    set_ref(&heap, old, 0, Some(young));
    assert!(heap.is_card_dirty(old));

    heap.collect(GcType::Sticky, GcCause::Explicit, false);
    assert_eq!(heap.last_gc_metrics().unwrap().freed_objects, 0);
    assert_eq!(get_ref(&heap, old, 0), Some(young));
    assert_eq!(payload(&heap, young, 0, 0), 99);

    // The referent is old now; a full collection keeps it as well.
    heap.collect_garbage(false);
    assert_eq!(heap.last_gc_metrics().unwrap().freed_objects, 0);
    assert_eq!(heap.verify_heap(), Ok(2));
}

#[test]
fn test_freed_memory_is_reused() {
    let (heap, runtime) = heap(CollectorType::MarkSweep, MB);
    let keep = runtime.root(alloc(&heap, 0, 1));
    for _ in 0..4 {
        for _ in 0..512 {
            alloc(&heap, 0, 127);
        }
        heap.collect_garbage(false);
        assert_eq!(heap.get_bytes_allocated(), SlotModel::object_size(0, 1));
    }
    assert!(keep.get().is_some());
    assert_eq!(heap.metrics().total_objects_freed(), 4 * 512);
}

#[test]
fn test_allocation_collects_instead_of_failing() {
    let (heap, runtime) = heap(CollectorType::MarkSweep, MB);
    let root = runtime.root(alloc(&heap, 0, 1));
    for _ in 0..3 * MB / KB {
        alloc(&heap, 0, 127);
    }
    assert!(heap.gc_count() > 0);
    assert!(heap.metrics().gc_for_alloc_count() > 0);
    assert!(heap.get_bytes_allocated() <= heap.growth_limit());
    assert!(root.get().is_some());
}

#[test]
fn test_concurrent_collection_runs_on_daemon() {
    let (heap, runtime) = heap_with(spacegc::HeapConfig {
        enable_task_daemon: true,
        ..config(CollectorType::ConcurrentMarkSweep, 4 * MB)
    });
    assert!(heap.is_gc_concurrent());
    let start_bytes = heap.concurrent_start_bytes();
    assert!(start_bytes < heap.target_footprint());

    {
        let _scope = runtime.mutator_scope();
        let deadline = Instant::now() + Duration::from_secs(10);
        while heap.metrics().concurrent_requests() == 0 {
            assert!(Instant::now() < deadline, "no concurrent collection requested");
            alloc(&heap, 0, 127);
        }
    }

    let deadline = Instant::now() + Duration::from_secs(10);
    while heap.gc_count() == 0 {
        assert!(Instant::now() < deadline, "background collection never ran");
        thread::sleep(Duration::from_millis(5));
    }
    heap.wait_for_gc_to_complete(GcCause::Explicit);
    assert_eq!(heap.last_gc_cause(), Some(GcCause::Background));
    assert!(heap.get_bytes_allocated() < start_bytes);
}

#[test]
fn test_concurrent_request_without_daemon_runs_inline() {
    let (heap, _runtime) = heap(CollectorType::ConcurrentMarkSweep, MB);
    let _garbage = alloc(&heap, 0, 1);
    assert!(heap.request_concurrent_gc(true));
    assert_eq!(heap.gc_count(), 1);
    assert_eq!(heap.last_gc_type(), GcType::Full);
    assert_eq!(heap.last_gc_metrics().unwrap().freed_objects, 1);
}

#[test]
fn test_stop_the_world_heap_ignores_concurrent_requests() {
    let (heap, _runtime) = heap(CollectorType::MarkSweep, MB);
    assert!(!heap.request_concurrent_gc(false));
    assert_eq!(heap.gc_count(), 0);
}

#[test]
fn test_trim_releases_pages() {
    let (heap, _runtime) = heap(CollectorType::MarkSweep, 4 * MB);
    for _ in 0..1024 {
        alloc(&heap, 0, 127);
    }
    heap.collect_garbage(false);
    let collections = heap.gc_count();
    assert!(heap.trim() > 0);
    assert_eq!(heap.gc_count(), collections, "trimming is not a collection");
}

#[test]
fn test_soft_reference_request_is_reported() {
    let (heap, _runtime) = heap(CollectorType::MarkSweep, MB);
    heap.collect(GcType::Full, GcCause::Explicit, true);
    assert!(heap.last_gc_metrics().unwrap().cleared_soft_references);
    heap.collect_garbage(false);
    assert!(!heap.last_gc_metrics().unwrap().cleared_soft_references);
}
