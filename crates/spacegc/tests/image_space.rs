//! Boot image objects: never collected, outside the footprint, and scanned
//! through the image mod-union table.

mod common;

use common::{alloc, config, get_ref, heap_with, payload, set_payload, set_ref, KB, MB};
use spacegc::{CollectorType, GcCause, GcType, HeapConfig, SlotModel, SpaceKind};

fn image_config(collector_type: CollectorType) -> HeapConfig {
    HeapConfig {
        image_space_capacity: 64 * KB,
        ..config(collector_type, MB)
    }
}

#[test]
fn test_sealed_image_rejects_allocations() {
    let (heap, _runtime) = heap_with(image_config(CollectorType::SemiSpace));
    let boot = heap
        .allocate_image_object(SlotModel::class(1, 1), SlotModel::object_size(1, 1))
        .unwrap();
    assert_eq!(heap.find_space_kind(boot.addr()), Some(SpaceKind::Image));
    assert!(!heap.is_movable_object(boot));
    assert_eq!(heap.get_bytes_allocated(), 0);

    heap.seal_image_space();
    assert!(heap
        .allocate_image_object(SlotModel::class(0, 1), SlotModel::object_size(0, 1))
        .is_none());
    assert_eq!(heap.verify_heap(), Ok(1));
}

#[test]
fn test_image_field_follows_moved_object() {
    let (heap, _runtime) = heap_with(image_config(CollectorType::SemiSpace));
    let boot = heap
        .allocate_image_object(SlotModel::class(1, 1), SlotModel::object_size(1, 1))
        .unwrap();
    heap.seal_image_space();

    let young = alloc(&heap, 0, 1);
    set_payload(&heap, young, 0, 0, 99);
    set_ref(&heap, boot, 0, Some(young));

    let mut previous = young;
    for gc_type in [GcType::Full, GcType::Sticky, GcType::Full, GcType::Sticky] {
        assert_eq!(heap.collect(gc_type, GcCause::Explicit, false), gc_type);
        let current = get_ref(&heap, boot, 0).expect("image field was cleared");
        assert_ne!(current, previous, "{gc_type:?} did not copy the referent");
        assert_eq!(heap.find_space_kind(current.addr()), Some(SpaceKind::BumpPointer));
        assert_eq!(payload(&heap, current, 0, 0), 99);
        previous = current;
    }
    assert_eq!(heap.find_space_kind(boot.addr()), Some(SpaceKind::Image));
    assert_eq!(heap.verify_heap(), Ok(2));
}

#[test]
fn test_image_keeps_free_list_object_alive() {
    let (heap, _runtime) = heap_with(image_config(CollectorType::MarkSweep));
    let boot = heap
        .allocate_image_object(SlotModel::class(1, 0), SlotModel::object_size(1, 0))
        .unwrap();
    heap.seal_image_space();

    let kept = alloc(&heap, 0, 1);
    set_payload(&heap, kept, 0, 0, 5);
    set_ref(&heap, boot, 0, Some(kept));
    let _garbage = alloc(&heap, 0, 1);

    for gc_type in [GcType::Full, GcType::Sticky, GcType::Full] {
        heap.collect(gc_type, GcCause::Explicit, false);
        assert_eq!(get_ref(&heap, boot, 0), Some(kept));
        assert_eq!(payload(&heap, kept, 0, 0), 5);
    }
    assert_eq!(heap.last_gc_metrics().unwrap().objects_surviving, 1);
    assert_eq!(heap.verify_heap(), Ok(2));
}
