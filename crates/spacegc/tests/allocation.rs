//! Fallbacks on the allocation path: collections forced by a full
//! allocation stack and compaction of a fragmented free-list space.

mod common;

use common::{alloc, alloc_non_movable, config, heap_with, payload, set_payload, KB, MB};
use spacegc::{CollectorType, GcCause, HeapConfig, SlotModel, SpaceKind};

#[test]
fn test_full_allocation_stack_forces_sticky_collection() {
    for collector_type in [CollectorType::SemiSpace, CollectorType::MarkSweep] {
        let (heap, runtime) = heap_with(HeapConfig {
            allocation_stack_capacity: 128,
            ..config(collector_type, 4 * MB)
        });
        let roots: Vec<_> = (0..500)
            .map(|i| {
                let obj = alloc_non_movable(&heap, 0, 1);
                set_payload(&heap, obj, 0, 0, i);
                (i, runtime.root(obj))
            })
            .filter(|(i, _)| i % 2 == 0)
            .collect();

        assert!(heap.gc_count() > 0, "{collector_type:?}");
        assert_eq!(heap.last_gc_cause(), Some(GcCause::ForAllocationStack));
        for (i, root) in &roots {
            let obj = root.get().unwrap();
            assert_eq!(heap.find_space_kind(obj.addr()), Some(SpaceKind::Malloc));
            assert_eq!(payload(&heap, obj, 0, 0), *i);
        }
        assert!(heap.verify_heap().is_ok());
    }
}

/// Fills a 256 KB main space with 128-byte objects and keeps every second
/// one, leaving only 128-byte holes. Returns the roots with their payloads.
fn fragment(heap: &spacegc::Heap, runtime: &spacegc::StandaloneRuntime) -> Vec<(usize, spacegc::RootHandle)> {
    let count = 256 * KB / SlotModel::object_size(0, 15);
    let mut roots = Vec::new();
    for i in 0..count {
        let obj = alloc(heap, 0, 15);
        set_payload(heap, obj, 0, 0, i);
        // Keeping the odd ones keeps the last object, so the holes never
        // merge into the tail.
        if i % 2 == 1 {
            roots.push((i, runtime.root(obj)));
        }
    }
    heap.collect_garbage(false);
    roots
}

fn fragmented_config(compact_for_oom: bool) -> HeapConfig {
    HeapConfig {
        main_space_capacity: 256 * KB,
        use_homogeneous_space_compaction_for_oom: compact_for_oom,
        ..config(CollectorType::MarkSweep, 4 * MB)
    }
}

#[test]
fn test_fragmented_allocation_is_rescued_by_compaction() {
    let (heap, runtime) = heap_with(fragmented_config(true));
    let roots = fragment(&heap, &runtime);
    assert_eq!(heap.metrics().homogeneous_compactions(), 0);

    let obj = heap
        .allocate(SlotModel::class(0, 127), SlotModel::object_size(0, 127))
        .unwrap();
    assert_eq!(heap.find_space_kind(obj.addr()), Some(SpaceKind::Malloc));
    assert_eq!(heap.metrics().homogeneous_compactions(), 1);
    assert_eq!(heap.metrics().delayed_ooms(), 1);
    assert_eq!(heap.last_gc_cause(), Some(GcCause::HomogeneousSpaceCompact));

    for (i, root) in &roots {
        assert_eq!(payload(&heap, root.get().unwrap(), 0, 0), *i);
    }
    assert_eq!(heap.verify_heap(), Ok(roots.len() + 1));
}

#[test]
fn test_fragmented_allocation_fails_without_compaction() {
    let (heap, runtime) = heap_with(fragmented_config(false));
    let roots = fragment(&heap, &runtime);

    let err = heap
        .allocate(SlotModel::class(0, 127), SlotModel::object_size(0, 127))
        .unwrap_err();
    assert_eq!(err.requested, KB);
    assert!(err.free_bytes > KB, "the footprint had room, the space did not");
    assert_eq!(heap.metrics().homogeneous_compactions(), 0);
    assert_eq!(heap.metrics().delayed_ooms(), 0);
    assert_eq!(heap.verify_heap(), Ok(roots.len()));
}
