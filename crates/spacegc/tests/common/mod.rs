//! Helpers shared by the integration tests.

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use spacegc::{
    CollectorType, Heap, HeapConfig, MutatorScope, ObjectRef, Runtime, RuntimeStats, SlotModel, StandaloneRuntime,
};

pub const KB: usize = 1024;
pub const MB: usize = 1024 * KB;

/// A small heap without an image space or a task daemon.
pub fn config(collector_type: CollectorType, capacity: usize) -> HeapConfig {
    HeapConfig {
        collector_type,
        image_space_capacity: 0,
        enable_task_daemon: false,
        ..HeapConfig::with_capacity(capacity)
    }
}

pub fn heap_with(config: HeapConfig) -> (Arc<Heap>, Arc<StandaloneRuntime>) {
    let runtime = Arc::new(StandaloneRuntime::new());
    let heap = Heap::new(config, Arc::new(SlotModel), runtime.clone()).unwrap();
    (heap, runtime)
}

pub fn heap(collector_type: CollectorType, capacity: usize) -> (Arc<Heap>, Arc<StandaloneRuntime>) {
    heap_with(config(collector_type, capacity))
}

/// Allocates an object with `refs` reference slots and `payload` words.
pub fn alloc(heap: &Heap, refs: usize, payload: usize) -> ObjectRef {
    heap.allocate(SlotModel::class(refs, payload), SlotModel::object_size(refs, payload))
        .unwrap()
}

pub fn alloc_non_movable(heap: &Heap, refs: usize, payload: usize) -> ObjectRef {
    heap.allocate_non_movable(SlotModel::class(refs, payload), SlotModel::object_size(refs, payload))
        .unwrap()
}

pub fn set_ref(heap: &Heap, obj: ObjectRef, index: usize, value: Option<ObjectRef>) {
    heap.write_reference(obj, SlotModel::reference_offset(index), value);
}

pub fn get_ref(heap: &Heap, obj: ObjectRef, index: usize) -> Option<ObjectRef> {
    heap.read_reference(obj, SlotModel::reference_offset(index))
}

pub fn set_payload(heap: &Heap, obj: ObjectRef, refs: usize, index: usize, value: usize) {
    heap.write_word(obj, SlotModel::payload_offset(refs, index), value);
}

pub fn payload(heap: &Heap, obj: ObjectRef, refs: usize, index: usize) -> usize {
    heap.read_word(obj, SlotModel::payload_offset(refs, index))
}

/// Builds a singly linked list of `len` nodes, each with one reference and
/// one payload word holding its index. Returns the head.
pub fn linked_list(heap: &Heap, runtime: &StandaloneRuntime, len: usize) -> ObjectRef {
    let head = alloc(heap, 1, 1);
    let root = runtime.root(head);
    let tail = runtime.root(head);
    for i in 1..len {
        let node = alloc(heap, 1, 1);
        set_payload(heap, node, 1, 0, i);
        set_ref(heap, tail.get().unwrap(), 0, Some(node));
        tail.set(node);
    }
    root.get().unwrap()
}

/// Walks a list built by [`linked_list`] and returns its payloads.
pub fn list_payloads(heap: &Heap, head: ObjectRef) -> Vec<usize> {
    let mut out = Vec::new();
    let mut node = Some(head);
    while let Some(n) = node {
        out.push(payload(heap, n, 1, 0));
        node = get_ref(heap, n, 0);
    }
    out
}

/// A runtime that counts how many threads hold the world stopped at once.
#[derive(Debug, Default)]
pub struct CountingRuntime {
    pub inner: StandaloneRuntime,
    pub stopped: AtomicUsize,
    pub max_stopped: AtomicUsize,
    pub suspensions: AtomicUsize,
}

impl CountingRuntime {
    pub fn mutator_scope(&self) -> MutatorScope<'_> {
        self.inner.mutator_scope()
    }
}

impl Runtime for CountingRuntime {
    fn suspend_all_mutators(&self) {
        self.inner.suspend_all_mutators();
        let now = self.stopped.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_stopped.fetch_max(now, Ordering::SeqCst);
        self.suspensions.fetch_add(1, Ordering::SeqCst);
    }

    fn resume_all_mutators(&self) {
        self.stopped.fetch_sub(1, Ordering::SeqCst);
        self.inner.resume_all_mutators();
    }

    fn visit_roots(&self, visitor: &mut dyn FnMut(&mut ObjectRef)) {
        self.inner.visit_roots(visitor);
    }

    fn sweep_system_weaks(&self, is_marked: &mut dyn FnMut(ObjectRef) -> Option<ObjectRef>) {
        self.inner.sweep_system_weaks(is_marked);
    }

    fn enter_blocking(&self) {
        self.inner.enter_blocking();
    }

    fn exit_blocking(&self) {
        self.inner.exit_blocking();
    }

    fn safepoint(&self) {
        self.inner.safepoint();
    }

    fn is_shutting_down(&self) -> bool {
        self.inner.is_shutting_down()
    }

    fn stats(&self) -> Option<&RuntimeStats> {
        self.inner.stats()
    }
}
