//! End-to-end tests for the semi-space family: copying, forwarding, the
//! allocation escalation and remembered sets.

mod common;

use common::{alloc, alloc_non_movable, get_ref, heap, linked_list, list_payloads, payload, set_payload, set_ref, KB, MB};
use spacegc::{CollectorType, GcCause, GcType, SlotModel, SpaceKind};

#[test]
fn test_unreachable_subgraph_is_reclaimed() {
    let (heap, runtime) = heap(CollectorType::SemiSpace, MB);
    let a = alloc(&heap, 1, 1);
    let b = alloc(&heap, 1, 1);
    let c = alloc(&heap, 1, 1);
    set_payload(&heap, a, 1, 0, 0xA);
    set_payload(&heap, b, 1, 0, 0xB);
    set_payload(&heap, c, 1, 0, 0xC);
    set_ref(&heap, a, 0, Some(b));
    set_ref(&heap, b, 0, Some(c));
    let root = runtime.root(a);

    set_ref(&heap, a, 0, None);
    assert_eq!(heap.collect_garbage(false), GcType::Full);

    let a_after = root.get().unwrap();
    assert_ne!(a_after, a, "the copying collector moves survivors");
    assert_eq!(get_ref(&heap, a_after, 0), None);
    assert_eq!(payload(&heap, a_after, 1, 0), 0xA);
    let gc = heap.last_gc_metrics().unwrap();
    assert_eq!(gc.freed_objects, 2);
    assert_eq!(gc.freed_bytes, 2 * SlotModel::object_size(1, 1));
    assert_eq!(gc.objects_surviving, 1);
    assert_eq!(heap.get_bytes_allocated(), SlotModel::object_size(1, 1));
    assert_eq!(heap.verify_heap(), Ok(1));
}

#[test]
fn test_references_are_forwarded() {
    let (heap, runtime) = heap(CollectorType::SemiSpace, MB);
    let head = linked_list(&heap, &runtime, 100);
    let root = runtime.root(head);
    for _ in 0..3 {
        heap.collect_garbage(false);
        let head = root.get().unwrap();
        assert_eq!(list_payloads(&heap, head), (0..100).collect::<Vec<_>>());
        assert_eq!(heap.find_space_kind(head.addr()), Some(SpaceKind::BumpPointer));
    }
    assert_eq!(heap.verify_heap(), Ok(100));
    assert_eq!(heap.gc_count(), 3);
}

#[test]
fn test_shared_object_is_copied_once() {
    let (heap, runtime) = heap(CollectorType::SemiSpace, MB);
    let holder = alloc(&heap, 2, 0);
    let shared = alloc(&heap, 0, 1);
    set_payload(&heap, shared, 0, 0, 7);
    set_ref(&heap, holder, 0, Some(shared));
    set_ref(&heap, holder, 1, Some(shared));
    let root = runtime.root(holder);

    heap.collect_garbage(false);
    let holder = root.get().unwrap();
    let first = get_ref(&heap, holder, 0).unwrap();
    assert_eq!(get_ref(&heap, holder, 1), Some(first));
    assert_eq!(payload(&heap, first, 0, 0), 7);
    assert_eq!(heap.last_gc_metrics().unwrap().objects_surviving, 2);
}

#[test]
fn test_weak_roots_follow_or_clear() {
    let (heap, runtime) = heap(CollectorType::SemiSpace, MB);
    let live = alloc(&heap, 0, 1);
    let dead = alloc(&heap, 0, 1);
    let strong = runtime.root(live);
    let weak_live = runtime.weak(live);
    let weak_dead = runtime.weak(dead);

    heap.collect_garbage(false);
    assert_eq!(weak_live.get(), strong.get());
    assert_eq!(weak_dead.get(), None);
}

#[test]
fn test_overflowing_allocation_collects_and_succeeds() {
    let (heap, runtime) = heap(CollectorType::SemiSpace, MB);
    let object_size = SlotModel::object_size(0, 127);
    assert_eq!(object_size, KB);
    let count = MB / object_size;

    let mut roots = Vec::new();
    for i in 0..count {
        let obj = alloc(&heap, 0, 127);
        set_payload(&heap, obj, 0, 0, i);
        if i % 2 == 0 {
            roots.push((i, runtime.root(obj)));
        }
    }
    assert_eq!(heap.get_bytes_allocated(), MB);
    assert_eq!(heap.gc_count(), 0);

    let extra = alloc(&heap, 0, 127);
    assert_eq!(heap.gc_count(), 1);
    let gc = heap.last_gc_metrics().unwrap();
    assert_eq!(gc.cause, GcCause::ForAlloc);
    assert_eq!(gc.gc_type, GcType::Full);
    assert_eq!(gc.freed_objects, count / 2);
    assert_eq!(heap.find_space_kind(extra.addr()), Some(SpaceKind::BumpPointer));
    assert_eq!(heap.get_bytes_allocated(), MB / 2 + object_size);

    for (i, root) in &roots {
        assert_eq!(payload(&heap, root.get().unwrap(), 0, 0), *i);
    }
    assert_eq!(heap.verify_heap(), Ok(count / 2 + 1));
}

#[test]
fn test_overflowing_allocation_reports_out_of_memory() {
    let (heap, runtime) = heap(CollectorType::SemiSpace, MB);
    let count = MB / SlotModel::object_size(0, 127);
    let roots: Vec<_> = (0..count)
        .map(|i| {
            let obj = alloc(&heap, 0, 127);
            set_payload(&heap, obj, 0, 0, i);
            runtime.root(obj)
        })
        .collect();

    let err = heap
        .allocate(SlotModel::class(0, 127), SlotModel::object_size(0, 127))
        .unwrap_err();
    assert_eq!(err.requested, KB);
    assert_eq!(err.allocator, CollectorType::SemiSpace);
    assert!(heap.gc_count() >= 2, "the whole plan ran before giving up");

    for (i, root) in roots.iter().enumerate() {
        assert_eq!(payload(&heap, root.get().unwrap(), 0, 0), i);
    }
    assert_eq!(heap.verify_heap(), Ok(count));
}

#[test]
fn test_unrepresentable_allocation_reports_out_of_memory() {
    let (heap, runtime) = heap(CollectorType::SemiSpace, MB);
    let large = alloc(&heap, 0, 2047);
    assert_eq!(heap.find_space_kind(large.addr()), Some(SpaceKind::LargeObject));
    set_payload(&heap, large, 0, 0, 7);
    let root = runtime.root(large);

    // Page rounding fits in a word, but the footprint check would wrap.
    let err = heap.allocate(SlotModel::class(0, 0), usize::MAX - 8 * KB).unwrap_err();
    assert!(err.requested > usize::MAX - 8 * KB);
    // Object alignment alone overflows.
    let err = heap.allocate(SlotModel::class(0, 0), usize::MAX).unwrap_err();
    assert_eq!(err.requested, usize::MAX);
    assert!(heap.allocate_image_object(SlotModel::class(0, 0), usize::MAX).is_none());

    assert_eq!(payload(&heap, root.get().unwrap(), 0, 0), 7);
    assert_eq!(heap.verify_heap(), Ok(1));
    let small = alloc(&heap, 0, 1);
    assert_eq!(heap.find_space_kind(small.addr()), Some(SpaceKind::BumpPointer));
}

#[test]
fn test_non_movable_holder_is_updated() {
    let (heap, runtime) = heap(CollectorType::SemiSpace, MB);
    let holder = alloc_non_movable(&heap, 1, 0);
    let target = alloc(&heap, 0, 1);
    set_payload(&heap, target, 0, 0, 42);
    set_ref(&heap, holder, 0, Some(target));
    let root = runtime.root(holder);
    assert!(!heap.is_movable_object(holder));
    assert!(heap.is_movable_object(target));

    heap.collect_garbage(false);
    assert_eq!(root.get(), Some(holder));
    let moved = get_ref(&heap, holder, 0).unwrap();
    assert_ne!(moved, target);
    assert_eq!(payload(&heap, moved, 0, 0), 42);

    // A sticky collection only finds the new object through the holder's
    // remembered card.
    let young = alloc(&heap, 0, 1);
    set_payload(&heap, young, 0, 0, 43);
    set_ref(&heap, holder, 0, Some(young));
    assert!(heap.is_card_dirty(holder));
    assert_eq!(heap.collect(GcType::Sticky, GcCause::Explicit, false), GcType::Sticky);
    let young = get_ref(&heap, holder, 0).unwrap();
    assert_eq!(payload(&heap, young, 0, 0), 43);
    assert_eq!(heap.verify_heap(), Ok(2));
}

#[test]
fn test_large_objects_are_swept_in_place() {
    let (heap, runtime) = heap(CollectorType::SemiSpace, MB);
    let payload_words = 16 * KB / 8;
    let kept = alloc(&heap, 0, payload_words);
    let _dropped = alloc(&heap, 0, payload_words);
    assert_eq!(heap.find_space_kind(kept.addr()), Some(SpaceKind::LargeObject));
    let root = runtime.root(kept);

    heap.collect_garbage(false);
    assert_eq!(root.get(), Some(kept));
    let gc = heap.last_gc_metrics().unwrap();
    assert_eq!(gc.freed_large_objects, 1);
    assert!(gc.freed_large_object_bytes >= 16 * KB);
}

#[test]
fn test_partial_requires_zygote() {
    let (heap, _runtime) = heap(CollectorType::SemiSpace, MB);
    assert_eq!(heap.collect(GcType::Partial, GcCause::Explicit, false), GcType::None);
    assert_eq!(heap.gc_count(), 0);
}

#[test]
fn test_moving_collection_rejected_while_disabled() {
    let (heap, runtime) = heap(CollectorType::SemiSpace, MB);
    let obj = alloc(&heap, 0, 1);
    let root = runtime.root(obj);
    {
        let _pinned = heap.disable_moving_gc();
        assert_eq!(heap.collect_garbage(false), GcType::None);
        assert_eq!(root.get(), Some(obj));
    }
    assert_eq!(heap.collect_garbage(false), GcType::Full);
    assert_ne!(root.get(), Some(obj));
}

#[test]
fn test_no_collection_after_shutdown() {
    let (heap, _runtime) = heap(CollectorType::SemiSpace, MB);
    heap.shutdown();
    assert!(heap.is_shutting_down());
    assert_eq!(heap.collect_garbage(false), GcType::None);
}

#[test]
fn test_growth_stays_within_limit() {
    let (heap, runtime) = heap(CollectorType::SemiSpace, 2 * MB);
    let _list = runtime.root(linked_list(&heap, &runtime, 1000));
    for _ in 0..5 {
        heap.collect_garbage(false);
        assert!(heap.target_footprint() <= heap.get_max_memory());
        assert!(heap.target_footprint() >= heap.get_bytes_allocated());
    }
    assert_eq!(heap.next_gc_type(), GcType::Sticky);
}
