//! The zygote split and collections around it.

mod common;

use common::{alloc, alloc_non_movable, get_ref, heap, linked_list, list_payloads, payload, set_payload, set_ref, MB};
use spacegc::{CollectorType, GcCause, GcType, SpaceKind};

#[test]
fn test_pre_zygote_fork_packs_survivors() {
    let (heap, runtime) = heap(CollectorType::SemiSpace, 4 * MB);
    let mut pinned = Vec::new();
    for i in 0..10 {
        let obj = alloc_non_movable(&heap, 1, 1);
        set_payload(&heap, obj, 1, 0, i);
        if i % 2 == 0 {
            pinned.push((i, runtime.root(obj)));
        }
    }
    let list = runtime.root(linked_list(&heap, &runtime, 50));

    assert!(!heap.has_zygote_space());
    assert!(heap.pre_zygote_fork());
    assert!(heap.has_zygote_space());

    for (i, root) in &pinned {
        let obj = root.get().unwrap();
        assert_eq!(heap.find_space_kind(obj.addr()), Some(SpaceKind::Zygote));
        assert_eq!(payload(&heap, obj, 1, 0), *i);
    }
    let head = list.get().unwrap();
    assert_eq!(heap.find_space_kind(head.addr()), Some(SpaceKind::Zygote));
    assert_eq!(list_payloads(&heap, head), (0..50).collect::<Vec<_>>());
    let gc = heap.last_gc_metrics().unwrap();
    assert_eq!(gc.collector_type, CollectorType::ZygoteCompact);
    assert_eq!(heap.verify_heap(), Ok(55));

    assert!(!heap.pre_zygote_fork(), "the split happens once");
}

#[test]
fn test_partial_collection_leaves_zygote_alone() {
    let (heap, runtime) = heap(CollectorType::SemiSpace, 4 * MB);
    let holder = runtime.root(alloc_non_movable(&heap, 1, 0));
    assert!(heap.pre_zygote_fork());
    let holder_addr = holder.get().unwrap();
    assert_eq!(heap.non_sticky_gc_type(), GcType::Partial);

    let young = alloc(&heap, 0, 1);
    set_payload(&heap, young, 0, 0, 77);
    set_ref(&heap, holder_addr, 0, Some(young));
    let _garbage = alloc(&heap, 0, 1);

    assert_eq!(heap.collect(GcType::Partial, GcCause::Explicit, false), GcType::Partial);
    assert_eq!(holder.get(), Some(holder_addr));
    let moved = get_ref(&heap, holder_addr, 0).unwrap();
    assert_ne!(moved, young);
    assert_eq!(payload(&heap, moved, 0, 0), 77);
    assert_eq!(heap.last_gc_metrics().unwrap().freed_objects, 1);

    // A sticky run finds the zygote holder through its mod-union table.
    assert_eq!(heap.collect(GcType::Sticky, GcCause::Explicit, false), GcType::Sticky);
    let moved = get_ref(&heap, holder_addr, 0).unwrap();
    assert_eq!(payload(&heap, moved, 0, 0), 77);

    assert_eq!(heap.collect(GcType::Full, GcCause::Explicit, false), GcType::Full);
    let moved = get_ref(&heap, holder_addr, 0).unwrap();
    assert_eq!(payload(&heap, moved, 0, 0), 77);
    assert_eq!(heap.verify_heap(), Ok(2));
}

#[test]
fn test_full_collection_frees_dead_zygote_objects() {
    let (heap, runtime) = heap(CollectorType::SemiSpace, 4 * MB);
    let keep = runtime.root(alloc_non_movable(&heap, 0, 1));
    let drop_later = runtime.root(alloc_non_movable(&heap, 0, 1));
    assert!(heap.pre_zygote_fork());

    drop(drop_later);
    heap.collect(GcType::Partial, GcCause::Explicit, false);
    assert_eq!(heap.last_gc_metrics().unwrap().freed_objects, 0);

    heap.collect(GcType::Full, GcCause::Explicit, false);
    assert_eq!(heap.last_gc_metrics().unwrap().freed_objects, 1);
    assert!(keep.get().is_some());
    assert_eq!(heap.verify_heap(), Ok(1));
}

#[test]
fn test_allocation_after_fork_uses_fresh_non_moving_space() {
    let (heap, runtime) = heap(CollectorType::SemiSpace, 4 * MB);
    let _old = runtime.root(alloc_non_movable(&heap, 0, 1));
    assert!(heap.pre_zygote_fork());
    let fresh = alloc_non_movable(&heap, 0, 1);
    assert_eq!(heap.find_space_kind(fresh.addr()), Some(SpaceKind::Malloc));
    let main = alloc(&heap, 0, 1);
    assert_eq!(heap.find_space_kind(main.addr()), Some(SpaceKind::BumpPointer));
}
